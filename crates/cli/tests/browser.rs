// The CDP host against a fake debugging endpoint, alone and under a relay.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{FakeBrowser, FakePage, eventually, session_for};
use pw_bridge::testing::{LoopbackDialer, LoopbackPeer};
use pw_bridge::{
	AuxiliaryHandler, MemorySnapshotStore, PlatformEvent, Relay, RelayOptions, RelayParts, Settings, StaticSettings,
	TargetId, TargetPlatform,
};
use pw_bridge_cli::cdp::CdpPlatform;
use pw_bridge_cli::cookies::CookieJar;
use serde_json::{Value, json};
use tokio::sync::mpsc::UnboundedReceiver;

async fn two_pages() -> FakeBrowser {
	FakeBrowser::start(vec![
		FakePage::page("PAGE-A", "https://a.test/", "A"),
		FakePage {
			kind: "service_worker".into(),
			..FakePage::page("SW", "https://a.test/sw.js", "")
		},
		FakePage::page("PAGE-B", "https://b.test/", "B"),
	])
	.await
}

async fn next_event(events: &mut UnboundedReceiver<PlatformEvent>) -> PlatformEvent {
	tokio::time::timeout(Duration::from_secs(5), events.recv())
		.await
		.expect("no platform event")
		.expect("platform closed")
}

#[tokio::test]
async fn pages_are_discovered_and_attached_flattened() {
	let browser = two_pages().await;
	let (platform, _events) = CdpPlatform::connect(browser.port()).await.unwrap();

	let targets = platform.list_targets().await.unwrap();
	assert_eq!(targets.len(), 2);
	assert_eq!(targets[0].url, "https://a.test/");
	assert_eq!(targets[1].title, "B");

	platform.attach(targets[0].id).await.unwrap();
	let attach = browser
		.log()
		.into_iter()
		.find(|r| r.method == "Target.attachToTarget")
		.unwrap();
	assert_eq!(attach.params, json!({"targetId": "PAGE-A", "flatten": true}));

	let info = platform
		.send_command(targets[0].id, None, "Target.getTargetInfo", None)
		.await
		.unwrap();
	assert_eq!(info["targetInfo"]["targetId"], "PAGE-A");
	let last = browser.log().pop().unwrap();
	assert_eq!(last.session.as_deref(), Some(session_for("PAGE-A").as_str()));

	platform
		.send_command(targets[0].id, Some("CHILD-1"), "DOM.enable", None)
		.await
		.unwrap();
	assert_eq!(browser.log().pop().unwrap().session.as_deref(), Some("CHILD-1"));
}

#[tokio::test]
async fn commands_to_unattached_pages_open_a_session() {
	let browser = two_pages().await;
	let (platform, _events) = CdpPlatform::connect(browser.port()).await.unwrap();

	let reply = platform
		.send_command(TargetId(2), None, "Runtime.evaluate", Some(json!({"expression": "1"})))
		.await
		.unwrap();
	assert_eq!(reply["result"]["value"], 1);
	assert_eq!(
		browser.methods()[2..],
		["Target.attachToTarget", "Runtime.evaluate"]
	);
}

#[tokio::test]
async fn browser_events_become_platform_events() {
	let browser = two_pages().await;
	let (platform, mut events) = CdpPlatform::connect(browser.port()).await.unwrap();
	platform.attach(TargetId(1)).await.unwrap();

	browser.emit(
		None,
		"Target.targetInfoChanged",
		json!({"targetInfo": {"targetId": "PAGE-A", "type": "page", "url": "https://a.test/next", "title": "Next"}}),
	);
	assert_eq!(
		next_event(&mut events).await,
		PlatformEvent::Updated {
			target: TargetId(1),
			url: Some("https://a.test/next".into()),
			title: Some("Next".into()),
			loading: true,
		}
	);

	browser.emit(Some(&session_for("PAGE-A")), "Page.loadEventFired", json!({"timestamp": 2}));
	assert!(matches!(
		next_event(&mut events).await,
		PlatformEvent::Protocol { target: TargetId(1), child_session: None, ref method, .. } if method == "Page.loadEventFired"
	));

	browser.destroy("PAGE-A");
	assert!(matches!(
		next_event(&mut events).await,
		PlatformEvent::Detached { target: TargetId(1), .. }
	));
	assert_eq!(next_event(&mut events).await, PlatformEvent::Removed(TargetId(1)));
	assert!(platform.get_target(TargetId(1)).await.unwrap().is_none());
}

#[tokio::test]
async fn unknown_targets_report_target_gone() {
	let browser = two_pages().await;
	let (platform, _events) = CdpPlatform::connect(browser.port()).await.unwrap();
	let err = platform.attach(TargetId(99)).await.unwrap_err();
	assert!(err.is_target_gone());
}

struct Bridge {
	relay: Relay,
	peer: LoopbackPeer,
	browser: FakeBrowser,
}

async fn bridge(browser: FakeBrowser) -> Bridge {
	let (platform, events) = CdpPlatform::connect(browser.port()).await.unwrap();
	let (dialer, mut peers) = LoopbackDialer::new();
	let auxiliary: Vec<Arc<dyn AuxiliaryHandler>> = vec![Arc::new(CookieJar::new(platform.clone()))];
	let relay = Relay::new(RelayParts {
		platform,
		settings: Arc::new(StaticSettings::new(Settings {
			shared_secret: "secret".into(),
			..Settings::default()
		})),
		store: Arc::new(MemorySnapshotStore::new()),
		dialer,
		auxiliary,
		options: RelayOptions {
			keepalive_period: None,
			..RelayOptions::default()
		},
	});
	relay.start(events);
	let peer = tokio::time::timeout(Duration::from_secs(5), peers.recv())
		.await
		.expect("bridge never dialed")
		.unwrap();
	Bridge { relay, peer, browser }
}

async fn attached(peer: &mut LoopbackPeer) -> Value {
	tokio::time::timeout(Duration::from_secs(5), peer.event("Target.attachedToTarget"))
		.await
		.expect("no attach announced")
		.unwrap()["params"]
		.clone()
}

#[tokio::test]
async fn relay_attaches_browser_pages_and_routes_commands() {
	let Bridge {
		relay,
		mut peer,
		browser,
	} = bridge(two_pages().await).await;

	let first = attached(&mut peer).await;
	assert_eq!(first["sessionId"], "pw-tab-1");
	assert_eq!(first["targetInfo"]["targetId"], "PAGE-A");
	let second = attached(&mut peer).await;
	assert_eq!(second["sessionId"], "pw-tab-2");
	assert_eq!(second["targetInfo"]["targetId"], "PAGE-B");

	peer.command(1, "Runtime.evaluate", json!({"expression": "1"}), Some("pw-tab-2"));
	let reply = peer.reply_to(1).await.unwrap();
	assert_eq!(reply["result"]["result"]["value"], 1);
	let last = browser.log().pop().unwrap();
	assert_eq!(last.session.as_deref(), Some(session_for("PAGE-B").as_str()));

	browser.destroy("PAGE-A");
	let detached = peer.event("Target.detachedFromTarget").await.unwrap();
	assert_eq!(detached["params"]["sessionId"], "pw-tab-1");
	eventually("session dropped", || relay.sessions().len() == 1).await;
	relay.shutdown();
}

#[tokio::test]
async fn created_targets_are_attached_and_returned() {
	let Bridge {
		relay,
		mut peer,
		browser,
	} = bridge(FakeBrowser::start(Vec::new()).await).await;

	peer.command(2, "Target.createTarget", json!({"url": "https://new.test/"}), None);
	let reply = peer.reply_to(2).await.unwrap();
	assert_eq!(reply["result"], json!({"targetId": "NEW-1"}));
	assert!(browser.methods().contains(&"Target.createTarget".to_string()));
	eventually("new page attached", || relay.sessions().len() == 1).await;
	relay.shutdown();
}

#[tokio::test]
async fn cookie_commands_reach_the_browser_store() {
	let browser = FakeBrowser::start(Vec::new()).await;
	browser.set_cookies(vec![
		json!({"name": "sid", "value": "1", "domain": ".a.test", "path": "/", "expires": -1, "httpOnly": true, "secure": true, "session": true}),
		json!({"name": "pref", "value": "2", "domain": "b.test", "path": "/", "expires": 1900000000.0, "httpOnly": false, "secure": false, "session": false, "sameSite": "Lax"}),
	]);
	let Bridge { relay, mut peer, .. } = bridge(browser).await;

	peer.command(3, "Cookie.getAll", json!({"domain": "b.test"}), None);
	let reply = peer.reply_to(3).await.unwrap();
	let cookies = reply["result"].as_array().unwrap();
	assert_eq!(cookies.len(), 1);
	assert_eq!(cookies[0]["name"], "pref");
	assert_eq!(cookies[0]["sameSite"], "lax");
	assert_eq!(cookies[0]["expirationDate"], 1900000000.0);

	peer.command(4, "Download.list", json!({}), None);
	let reply = peer.reply_to(4).await.unwrap();
	assert_eq!(reply["error"], "invalid command: Download commands are not available");
	relay.shutdown();
}
