// Shared harness: a relay wired to the in-memory platform, dialer and store.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pw_bridge::testing::{LoopbackDialer, LoopbackPeer, MockPlatform};
use pw_bridge::{
	MemorySnapshotStore, PlatformEvent, Relay, RelayOptions, RelayParts, Settings, StaticSettings, TargetId,
};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

pub use pw_bridge::AuxiliaryHandler;

pub struct Harness {
	pub relay: Relay,
	pub platform: Arc<MockPlatform>,
	pub dialer: Arc<LoopbackDialer>,
	pub peers: UnboundedReceiver<LoopbackPeer>,
	pub store: Arc<MemorySnapshotStore>,
	pub settings: Arc<StaticSettings>,
	events: Option<UnboundedReceiver<PlatformEvent>>,
	handle: Option<JoinHandle<()>>,
}

pub struct HarnessBuilder {
	store: MemorySnapshotStore,
	options: RelayOptions,
	auxiliary: Vec<Arc<dyn AuxiliaryHandler>>,
	settings: Settings,
}

impl HarnessBuilder {
	pub fn store(mut self, store: MemorySnapshotStore) -> Self {
		self.store = store;
		self
	}

	pub fn options(mut self, options: RelayOptions) -> Self {
		self.options = options;
		self
	}

	pub fn auxiliary(mut self, handler: Arc<dyn AuxiliaryHandler>) -> Self {
		self.auxiliary.push(handler);
		self
	}

	pub fn settings(mut self, update: impl FnOnce(&mut Settings)) -> Self {
		update(&mut self.settings);
		self
	}

	pub fn build(self) -> Harness {
		let (platform, events) = MockPlatform::new();
		let (dialer, peers) = LoopbackDialer::new();
		let store = Arc::new(self.store);
		let settings = Arc::new(StaticSettings::new(self.settings));
		let relay = Relay::new(RelayParts {
			platform: platform.clone(),
			settings: settings.clone(),
			store: store.clone(),
			dialer: dialer.clone(),
			auxiliary: self.auxiliary,
			options: self.options,
		});
		Harness {
			relay,
			platform,
			dialer,
			peers,
			store,
			settings,
			events: Some(events),
			handle: None,
		}
	}
}

impl Harness {
	pub fn builder() -> HarnessBuilder {
		HarnessBuilder {
			store: MemorySnapshotStore::new(),
			options: RelayOptions {
				keepalive_period: None,
				..RelayOptions::default()
			},
			auxiliary: Vec::new(),
			settings: Settings {
				shared_secret: "secret".into(),
				..Settings::default()
			},
		}
	}

	pub fn new() -> Self {
		Self::builder().build()
	}

	/// Starts the relay loop.
	pub fn start(&mut self) {
		if let Some(events) = self.events.take() {
			self.handle = Some(self.relay.start(events));
		}
	}

	/// Starts the relay and waits for its first link.
	pub async fn start_connected(&mut self) -> LoopbackPeer {
		self.start();
		self.next_peer().await
	}

	pub async fn next_peer(&mut self) -> LoopbackPeer {
		tokio::time::timeout(Duration::from_secs(60), self.peers.recv())
			.await
			.expect("no link within 60s")
			.expect("dialer dropped")
	}

	pub async fn stop(mut self) {
		self.relay.shutdown();
		if let Some(handle) = self.handle.take() {
			let _ = handle.await;
		}
	}
}

/// Polls `check` every 10ms for up to 10s.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
	for _ in 0..1000 {
		if check() {
			return;
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	panic!("condition not reached: {what}");
}

/// Next forwarded `Target.attachedToTarget`; returns its session id.
pub async fn attached_session(peer: &mut LoopbackPeer) -> String {
	let event = tokio::time::timeout(
		Duration::from_secs(30),
		peer.event("Target.attachedToTarget"),
	)
	.await
	.expect("no attach announcement")
	.expect("link closed");
	event["params"]["sessionId"].as_str().unwrap().to_string()
}

/// Next forwarded `Target.detachedFromTarget`; returns its params.
pub async fn detached(peer: &mut LoopbackPeer) -> Value {
	let event = tokio::time::timeout(
		Duration::from_secs(30),
		peer.event("Target.detachedFromTarget"),
	)
	.await
	.expect("no detach announcement")
	.expect("link closed");
	event["params"].clone()
}

pub fn protocol_id(target: TargetId) -> String {
	MockPlatform::protocol_id(target)
}

/// Reply to `id` and the next forwarded `method` event, in whichever order
/// they arrive. Returns the reply frame and the event's params.
pub async fn reply_and_event(peer: &mut LoopbackPeer, id: u64, method: &str) -> (Value, Value) {
	let mut reply = None;
	let mut event = None;
	while reply.is_none() || event.is_none() {
		let frame = tokio::time::timeout(Duration::from_secs(30), peer.recv())
			.await
			.expect("no frame within 30s")
			.expect("link closed");
		if frame["id"] == id && (frame.get("result").is_some() || frame.get("error").is_some()) {
			reply = Some(frame);
		} else if event.is_none()
			&& frame["method"] == "forwardCDPEvent"
			&& frame["params"]["method"] == method
		{
			event = Some(frame["params"]["params"].clone());
		}
	}
	(reply.unwrap(), event.unwrap())
}
