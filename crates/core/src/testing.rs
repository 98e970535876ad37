//! In-memory doubles for the host platform and the relay peer.
//!
//! [`MockPlatform`] keeps a scripted set of targets; [`LoopbackDialer`] hands
//! out [`LoopbackPeer`]s that play the relay server side of a link.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use pw_bridge_protocol::frame::methods;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connection::{Dialer, Incoming, Link, Outgoing};
use crate::error::ConnectError;
use crate::platform::{DetachReason, PlatformError, PlatformEvent, TargetId, TargetInfo, TargetPlatform};

/// Command observed by [`MockPlatform::send_command`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCommand {
	pub target: TargetId,
	pub child_session: Option<String>,
	pub method: String,
	pub params: Option<Value>,
}

#[derive(Default)]
struct MockState {
	targets: BTreeMap<TargetId, TargetInfo>,
	attached: HashSet<TargetId>,
	attach_failures: HashMap<TargetId, u32>,
	attach_calls: HashMap<TargetId, u32>,
	unresponsive: HashSet<TargetId>,
	commands: Vec<RecordedCommand>,
	activated: Vec<TargetId>,
}

/// Scriptable [`TargetPlatform`].
pub struct MockPlatform {
	state: Mutex<MockState>,
	next_id: AtomicU64,
	events: mpsc::UnboundedSender<PlatformEvent>,
}

impl MockPlatform {
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<PlatformEvent>) {
		let (events, rx) = mpsc::unbounded_channel();
		let platform = Arc::new(Self {
			state: Mutex::new(MockState::default()),
			next_id: AtomicU64::new(100),
			events,
		});
		(platform, rx)
	}

	/// Protocol `targetId` the mock reports for `target`.
	pub fn protocol_id(target: TargetId) -> String {
		format!("TARGET-{}", target.0)
	}

	/// Adds a target without emitting an event.
	pub fn add_target(&self, url: &str, title: &str) -> TargetId {
		let id = TargetId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.state.lock().targets.insert(
			id,
			TargetInfo {
				id,
				url: url.to_string(),
				title: title.to_string(),
			},
		);
		id
	}

	/// Adds a target and emits [`PlatformEvent::Created`].
	pub fn open_target(&self, url: &str, title: &str) -> TargetId {
		let id = self.add_target(url, title);
		let info = self.state.lock().targets.get(&id).cloned();
		if let Some(info) = info {
			self.emit(PlatformEvent::Created(info));
		}
		id
	}

	/// Removes a target and emits [`PlatformEvent::Removed`].
	pub fn remove_target(&self, target: TargetId) {
		{
			let mut state = self.state.lock();
			state.targets.remove(&target);
			state.attached.remove(&target);
		}
		self.emit(PlatformEvent::Removed(target));
	}

	/// Removes a target without telling anyone.
	pub fn vanish(&self, target: TargetId) {
		let mut state = self.state.lock();
		state.targets.remove(&target);
		state.attached.remove(&target);
	}

	pub fn set_url(&self, target: TargetId, url: &str) {
		if let Some(info) = self.state.lock().targets.get_mut(&target) {
			info.url = url.to_string();
		}
	}

	/// Makes the next `times` attach calls for `target` fail.
	pub fn fail_attach(&self, target: TargetId, times: u32) {
		self.state.lock().attach_failures.insert(target, times);
	}

	/// Unresponsive targets fail `Runtime.evaluate`.
	pub fn set_responsive(&self, target: TargetId, responsive: bool) {
		let mut state = self.state.lock();
		if responsive {
			state.unresponsive.remove(&target);
		} else {
			state.unresponsive.insert(target);
		}
	}

	/// Marks `target` attached without going through [`TargetPlatform::attach`].
	pub fn force_attached(&self, target: TargetId) {
		self.state.lock().attached.insert(target);
	}

	/// Drops the debugger from `target` and emits [`PlatformEvent::Detached`].
	pub fn detach_from(&self, target: TargetId, reason: &str) {
		self.state.lock().attached.remove(&target);
		self.emit(PlatformEvent::Detached {
			target,
			reason: DetachReason::parse(reason),
		});
	}

	pub fn emit(&self, event: PlatformEvent) {
		let _ = self.events.send(event);
	}

	pub fn is_attached(&self, target: TargetId) -> bool {
		self.state.lock().attached.contains(&target)
	}

	pub fn attach_calls(&self, target: TargetId) -> u32 {
		self.state.lock().attach_calls.get(&target).copied().unwrap_or(0)
	}

	pub fn command_log(&self) -> Vec<RecordedCommand> {
		self.state.lock().commands.clone()
	}

	/// Methods sent to `target`, in order.
	pub fn methods_for(&self, target: TargetId) -> Vec<String> {
		self.state
			.lock()
			.commands
			.iter()
			.filter(|c| c.target == target)
			.map(|c| c.method.clone())
			.collect()
	}

	pub fn activated(&self) -> Vec<TargetId> {
		self.state.lock().activated.clone()
	}

	pub fn target_exists(&self, target: TargetId) -> bool {
		self.state.lock().targets.contains_key(&target)
	}
}

#[async_trait]
impl TargetPlatform for MockPlatform {
	async fn list_targets(&self) -> Result<Vec<TargetInfo>, PlatformError> {
		Ok(self.state.lock().targets.values().cloned().collect())
	}

	async fn get_target(&self, target: TargetId) -> Result<Option<TargetInfo>, PlatformError> {
		Ok(self.state.lock().targets.get(&target).cloned())
	}

	async fn attach(&self, target: TargetId) -> Result<(), PlatformError> {
		let mut state = self.state.lock();
		if !state.targets.contains_key(&target) {
			return Err(PlatformError::NoSuchTarget(target.0));
		}
		*state.attach_calls.entry(target).or_default() += 1;
		if let Some(remaining) = state.attach_failures.get_mut(&target) {
			if *remaining > 0 {
				*remaining -= 1;
				return Err(PlatformError::Protocol("Cannot attach to this target".into()));
			}
		}
		state.attached.insert(target);
		Ok(())
	}

	async fn detach(&self, target: TargetId) -> Result<(), PlatformError> {
		if self.state.lock().attached.remove(&target) {
			Ok(())
		} else {
			Err(PlatformError::NotAttached(target.0))
		}
	}

	async fn send_command(
		&self,
		target: TargetId,
		child_session: Option<&str>,
		method: &str,
		params: Option<Value>,
	) -> Result<Value, PlatformError> {
		let mut state = self.state.lock();
		let Some(info) = state.targets.get(&target).cloned() else {
			return Err(PlatformError::NoSuchTarget(target.0));
		};
		if !state.attached.contains(&target) {
			return Err(PlatformError::NotAttached(target.0));
		}
		state.commands.push(RecordedCommand {
			target,
			child_session: child_session.map(str::to_owned),
			method: method.to_string(),
			params: params.clone(),
		});

		match method {
			methods::TARGET_GET_INFO => Ok(json!({
				"targetInfo": {
					"targetId": Self::protocol_id(target),
					"type": "page",
					"url": info.url,
					"title": info.title,
					"attached": true,
				}
			})),
			methods::RUNTIME_EVALUATE if state.unresponsive.contains(&target) => {
				Err(PlatformError::Protocol("Target is not responding".into()))
			}
			methods::RUNTIME_EVALUATE => Ok(json!({ "result": { "type": "number", "value": 1 } })),
			_ => Ok(json!({})),
		}
	}

	async fn create_target(&self, url: &str) -> Result<TargetId, PlatformError> {
		Ok(self.open_target(url, ""))
	}

	async fn close_target(&self, target: TargetId) -> Result<(), PlatformError> {
		if !self.target_exists(target) {
			return Err(PlatformError::NoSuchTarget(target.0));
		}
		self.remove_target(target);
		Ok(())
	}

	async fn activate_target(&self, target: TargetId) -> Result<(), PlatformError> {
		let mut state = self.state.lock();
		if !state.targets.contains_key(&target) {
			return Err(PlatformError::NoSuchTarget(target.0));
		}
		state.activated.push(target);
		Ok(())
	}
}

#[derive(Default)]
struct DialerState {
	unreachable: bool,
	failures: u32,
	attempts: Vec<Instant>,
	urls: Vec<String>,
}

/// [`Dialer`] whose links end in a [`LoopbackPeer`].
pub struct LoopbackDialer {
	state: Mutex<DialerState>,
	peers: mpsc::UnboundedSender<LoopbackPeer>,
}

impl LoopbackDialer {
	pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LoopbackPeer>) {
		let (peers, rx) = mpsc::unbounded_channel();
		let dialer = Arc::new(Self {
			state: Mutex::new(DialerState::default()),
			peers,
		});
		(dialer, rx)
	}

	pub fn set_reachable(&self, reachable: bool) {
		self.state.lock().unreachable = !reachable;
	}

	/// Makes the next `times` probes fail.
	pub fn fail_next(&self, times: u32) {
		self.state.lock().failures = times;
	}

	/// Instants of every connect attempt (probe).
	pub fn attempts(&self) -> Vec<Instant> {
		self.state.lock().attempts.clone()
	}

	pub fn dialed_urls(&self) -> Vec<String> {
		self.state.lock().urls.clone()
	}
}

#[async_trait]
impl Dialer for LoopbackDialer {
	async fn probe(&self, base: &str) -> Result<(), ConnectError> {
		let mut state = self.state.lock();
		state.attempts.push(Instant::now());
		let failing = if state.failures > 0 {
			state.failures -= 1;
			true
		} else {
			state.unreachable
		};
		if failing {
			return Err(ConnectError::Unreachable {
				base: base.to_string(),
				reason: "connection refused".into(),
			});
		}
		Ok(())
	}

	async fn dial(&self, url: &str) -> Result<Link, ConnectError> {
		self.state.lock().urls.push(url.to_string());
		let (out_tx, out_rx) = mpsc::unbounded_channel();
		let (in_tx, in_rx) = mpsc::unbounded_channel();
		let peer = LoopbackPeer {
			url: url.to_string(),
			to_bridge: in_tx,
			from_bridge: out_rx,
		};
		self.peers.send(peer).map_err(|_| ConnectError::Closed)?;
		Ok(Link {
			outgoing: out_tx,
			incoming: in_rx,
		})
	}
}

/// Relay-server end of a loopback link.
pub struct LoopbackPeer {
	url: String,
	to_bridge: mpsc::UnboundedSender<Incoming>,
	from_bridge: mpsc::UnboundedReceiver<Outgoing>,
}

impl LoopbackPeer {
	pub fn url(&self) -> &str {
		&self.url
	}

	/// Sends a JSON frame to the bridge.
	pub fn send(&self, frame: Value) {
		let _ = self.to_bridge.send(Incoming::Text(frame.to_string()));
	}

	/// Sends a `forwardCDPCommand` request.
	pub fn command(&self, id: u64, method: &str, params: Value, session_id: Option<&str>) {
		let mut inner = json!({ "method": method, "params": params });
		if let Some(session_id) = session_id {
			inner["sessionId"] = json!(session_id);
		}
		self.send(json!({ "id": id, "method": methods::FORWARD_CDP_COMMAND, "params": inner }));
	}

	/// Drops the link from the server side.
	pub fn close(&self, reason: &str) {
		let _ = self.to_bridge.send(Incoming::Closed {
			code: Some(1006),
			reason: reason.to_string(),
		});
	}

	/// Next raw frame from the bridge; `None` once the bridge hung up.
	pub async fn recv_raw(&mut self) -> Option<Outgoing> {
		self.from_bridge.recv().await
	}

	/// Next JSON frame from the bridge; `None` on close.
	pub async fn recv(&mut self) -> Option<Value> {
		match self.from_bridge.recv().await? {
			Outgoing::Text(text) => serde_json::from_str(&text).ok(),
			Outgoing::Close { .. } => None,
		}
	}

	/// Skips frames until a reply to `id` arrives.
	pub async fn reply_to(&mut self, id: u64) -> Option<Value> {
		loop {
			let frame = self.recv().await?;
			if frame.get("id").and_then(Value::as_u64) == Some(id)
				&& (frame.get("result").is_some() || frame.get("error").is_some())
			{
				return Some(frame);
			}
		}
	}

	/// Skips frames until a forwarded event named `method` arrives; returns
	/// its `params` (the forwarded event, not the envelope).
	pub async fn event(&mut self, method: &str) -> Option<Value> {
		loop {
			let frame = self.recv().await?;
			if frame.get("method").and_then(Value::as_str) != Some(methods::FORWARD_CDP_EVENT) {
				continue;
			}
			let params = frame.get("params").cloned().unwrap_or(Value::Null);
			if params.get("method").and_then(Value::as_str) == Some(method) {
				return Some(params);
			}
		}
	}
}
