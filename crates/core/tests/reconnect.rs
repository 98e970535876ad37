// Link loss, backoff reconnect and re-announcement of live sessions.

mod common;

use std::time::Duration;

use common::{Harness, attached_session, eventually};
use pw_bridge::{Indicator, RelayOptions, SessionId, Summary};

#[tokio::test(start_paused = true)]
async fn reconnect_reannounces_sessions_under_their_ids() {
	let mut h = Harness::new();
	let a = h.platform.add_target("https://a.test/", "A");
	let b = h.platform.add_target("https://b.test/", "B");
	let mut peer = h.start_connected().await;
	attached_session(&mut peer).await;
	attached_session(&mut peer).await;

	peer.close("relay restarted");
	eventually("targets shown as connecting", || {
		let status = h.relay.current_status();
		status.indicator(a) == Indicator::Connecting && status.indicator(b) == Indicator::Connecting
	})
	.await;
	eventually("summary offline", || h.relay.current_status().summary() == Summary::Offline).await;

	let mut peer = h.next_peer().await;
	assert_eq!(attached_session(&mut peer).await, "pw-tab-1");
	assert_eq!(attached_session(&mut peer).await, "pw-tab-2");

	assert_eq!(h.relay.session_for(a), Some(SessionId::from("pw-tab-1")));
	assert_eq!(h.relay.session_for(b), Some(SessionId::from("pw-tab-2")));
	assert_eq!(h.dialer.dialed_urls().len(), 2);
	eventually("indicators back on", || {
		h.relay.current_status().indicator(a) == Indicator::On
	})
	.await;
	h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unresponsive_sessions_are_dropped_on_reconnect() {
	let mut h = Harness::new();
	let a = h.platform.add_target("https://a.test/", "A");
	let b = h.platform.add_target("https://b.test/", "B");
	let mut peer = h.start_connected().await;
	attached_session(&mut peer).await;
	attached_session(&mut peer).await;

	h.platform.set_responsive(b, false);
	peer.close("relay restarted");

	let mut peer = h.next_peer().await;
	assert_eq!(attached_session(&mut peer).await, "pw-tab-1");
	eventually("unresponsive session dropped", || h.relay.session_for(b).is_none()).await;
	assert!(h.relay.session_for(a).is_some());
	eventually("snapshot updated", || {
		h.store
			.current()
			.is_some_and(|s| s.persisted_tabs.len() == 1)
	})
	.await;
	h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_intervals_follow_backoff() {
	let mut h = Harness::new();
	let peer = h.start_connected().await;
	h.dialer.fail_next(2);
	peer.close("relay restarted");

	let _peer = h.next_peer().await;
	let attempts = h.dialer.attempts();
	assert_eq!(attempts.len(), 4);
	for (i, floor) in [2u64, 4].into_iter().enumerate() {
		let gap = attempts[i + 2] - attempts[i + 1];
		assert!(gap >= Duration::from_secs(floor), "gap {gap:?}");
		assert!(gap <= Duration::from_secs(floor + 1), "gap {gap:?}");
	}
	assert_eq!(h.relay.connection().reconnect_attempt(), 0);
	h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unreachable_relay_at_startup_still_attaches_locally() {
	let mut h = Harness::new();
	let t = h.platform.add_target("https://a.test/", "A");
	h.dialer.set_reachable(false);
	h.start();

	eventually("attached without link", || h.relay.session_for(t).is_some()).await;
	assert!(!h.relay.connection().is_connected());

	h.dialer.set_reachable(true);
	let mut peer = h.next_peer().await;
	assert_eq!(attached_session(&mut peer).await, "pw-tab-1");
	h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_revives_a_halted_link() {
	let mut h = Harness::builder()
		.options(RelayOptions {
			keepalive_period: Some(Duration::from_secs(24)),
			..RelayOptions::default()
		})
		.settings(|s| s.shared_secret.clear())
		.build();
	h.start();
	tokio::time::sleep(Duration::from_secs(5)).await;
	assert!(h.dialer.attempts().is_empty());
	assert!(!h.relay.connection().reconnect_pending());

	h.settings.update(|s| s.shared_secret = "secret".into());
	let _peer = h.next_peer().await;
	eventually("link up", || h.relay.connection().is_connected()).await;
	h.stop().await;
}

#[tokio::test(start_paused = true)]
async fn keepalive_attaches_stray_targets() {
	let mut h = Harness::builder()
		.options(RelayOptions {
			keepalive_period: Some(Duration::from_secs(24)),
			..RelayOptions::default()
		})
		.build();
	let mut peer = h.start_connected().await;
	tokio::time::sleep(Duration::from_secs(1)).await;
	let t = h.platform.add_target("https://quiet.test/", "Quiet");

	assert_eq!(attached_session(&mut peer).await, "pw-tab-1");
	assert_eq!(h.relay.session_for(t), Some(SessionId::from("pw-tab-1")));
	h.stop().await;
}
