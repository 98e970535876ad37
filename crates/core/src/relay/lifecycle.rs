//! Attach, detach and reattach of targets, plus the auto-attach sweeps and
//! re-announcement after a reconnect.

use pw_bridge_protocol::ForwardEvent;
use pw_bridge_protocol::frame::{methods, reasons};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::{Indicator, Relay};
use crate::error::{Error, Result};
use crate::platform::{DetachReason, TargetId, TargetInfo};
use crate::session::{Removed, Session, SessionId, SessionState};

/// How an attach behaves beyond the common sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachOptions {
	/// Send `Target.attachedToTarget` to the peer once attached.
	pub announce: bool,
	/// Refuse targets whose URL the exclusion policy rejects.
	pub enforce_exclusion: bool,
}

impl Default for AttachOptions {
	fn default() -> Self {
		Self {
			announce: true,
			enforce_exclusion: true,
		}
	}
}

/// Outcome of a successful attach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attached {
	pub session_id: SessionId,
	/// Target-protocol `targetId`.
	pub protocol_target_id: String,
	/// False when an existing connected session was returned.
	pub newly_attached: bool,
}

impl Relay {
	pub async fn attach(&self, target: TargetId) -> Result<Attached> {
		self.attach_with(target, AttachOptions::default()).await
	}

	/// Attaches `target`, waiting for any lifecycle operation already running
	/// on it.
	pub async fn attach_with(&self, target: TargetId, options: AttachOptions) -> Result<Attached> {
		let lock = self.op_lock(target);
		let _guard = lock.lock().await;
		self.attach_locked(target, options).await
	}

	/// Attach sequence. The caller holds the target's operation lock.
	async fn attach_locked(&self, target: TargetId, options: AttachOptions) -> Result<Attached> {
		if let Some(existing) = self.connected_session(target) {
			return Ok(Attached {
				session_id: existing.session_id,
				protocol_target_id: existing.protocol_target_id,
				newly_attached: false,
			});
		}

		let platform = &self.inner.platform;
		let host = platform
			.get_target(target)
			.await?
			.ok_or_else(|| Error::TargetGone(target.to_string()))?;
		if options.enforce_exclusion && self.inner.options.exclusion.is_excluded(&host.url) {
			return Err(Error::Excluded(target.to_string()));
		}

		platform.attach(target).await?;

		if let Err(err) = platform
			.send_command(target, None, methods::PAGE_ENABLE, None)
			.await
		{
			debug!(target = "pw.bridge", target_id = %target, error = %err, "Page.enable failed");
		}

		let target_info = match self.protocol_target_info(target).await {
			Ok(info) => info,
			Err(err) => {
				if let Err(detach_err) = platform.detach(target).await {
					debug!(target = "pw.bridge", target_id = %target, error = %detach_err, "detach after failed attach");
				}
				return Err(err);
			}
		};
		let protocol_target_id = target_info
			.get("targetId")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();

		let session_id = {
			let mut state = self.inner.state.lock();
			let (session_id, attach_order) = state.table.allocate();
			state.table.put(Session {
				session_id: session_id.clone(),
				target,
				protocol_target_id: protocol_target_id.clone(),
				attach_order,
				attached_at_ms: crate::now_ms(),
				url: String::new(),
				title: String::new(),
				state: SessionState::Connecting,
			});
			session_id
		};

		let TargetInfo { url, title, .. } = host;
		let url = Some(url)
			.filter(|u| !u.is_empty())
			.or_else(|| target_info.get("url").and_then(Value::as_str).map(str::to_owned));
		let title = Some(title)
			.filter(|t| !t.is_empty())
			.or_else(|| target_info.get("title").and_then(Value::as_str).map(str::to_owned));
		{
			let mut state = self.inner.state.lock();
			state
				.table
				.update_metadata(target, url.as_deref(), title.as_deref());
			state.table.mark_connected(target);
		}

		if options.announce {
			self.forward(ForwardEvent::attached(session_id.as_str(), target_info));
		}
		self.inner.status.set(target, Indicator::On);
		info!(target = "pw.bridge", target_id = %target, session = %session_id, "target attached");
		self.persist().await;

		Ok(Attached {
			session_id,
			protocol_target_id,
			newly_attached: true,
		})
	}

	/// `targetInfo` of `target`; a reply without `targetId` is an error.
	async fn protocol_target_info(&self, target: TargetId) -> Result<Value> {
		let reply = self
			.inner
			.platform
			.send_command(target, None, methods::TARGET_GET_INFO, None)
			.await?;
		let info = reply.get("targetInfo").cloned().unwrap_or(Value::Null);
		let has_id = info
			.get("targetId")
			.and_then(Value::as_str)
			.is_some_and(|id| !id.is_empty());
		if !has_id {
			return Err(Error::MissingTargetId);
		}
		Ok(info)
	}

	fn connected_session(&self, target: TargetId) -> Option<Session> {
		self.inner
			.state
			.lock()
			.table
			.get(target)
			.filter(|s| s.is_connected())
			.cloned()
	}

	/// Detaches `target` and tells the peer. Returns whether a session existed.
	pub async fn detach(&self, target: TargetId, reason: &str) -> bool {
		let lock = self.op_lock(target);
		let _guard = lock.lock().await;
		self.detach_locked(target, reason).await
	}

	async fn detach_locked(&self, target: TargetId, reason: &str) -> bool {
		let removed = {
			let mut state = self.inner.state.lock();
			state.reattach_pending.remove(&target);
			state.table.remove(target)
		};
		let Some(removed) = removed else {
			self.inner.status.set(target, Indicator::Off);
			return false;
		};
		self.announce_detached(&removed, reason);

		if let Err(err) = self.inner.platform.detach(target).await {
			debug!(target = "pw.bridge", target_id = %target, error = %err, "platform detach failed");
		}
		self.inner.status.set(target, Indicator::Off);
		info!(target = "pw.bridge", target_id = %target, session = %removed.session.session_id, reason, "target detached");
		self.persist().await;
		true
	}

	/// Children first, each with `parent_detached`, then the session itself.
	fn announce_detached(&self, removed: &Removed, reason: &str) {
		for child in &removed.children {
			self.forward(ForwardEvent::detached(child, None, reasons::PARENT_DETACHED));
		}
		self.forward(ForwardEvent::detached(
			removed.session.session_id.as_str(),
			Some(&removed.session.protocol_target_id),
			reason,
		));
	}

	/// The debugger left `target` without being asked to.
	///
	/// Permanent reasons, closed targets and excluded URLs end the session.
	/// Anything else is treated as a navigation: the session is dropped and
	/// the target is reattached under a fresh session id.
	pub async fn on_target_detached(&self, target: TargetId, reason: DetachReason) {
		if reason.is_permanent() {
			self.detach(target, reason.as_str()).await;
			return;
		}

		let host = match self.inner.platform.get_target(target).await {
			Ok(Some(host)) => host,
			Ok(None) => {
				self.detach(target, reasons::TAB_CLOSED).await;
				return;
			}
			Err(err) => {
				debug!(target = "pw.bridge", target_id = %target, error = %err, "target lookup failed");
				self.detach(target, reason.as_str()).await;
				return;
			}
		};
		if self.inner.options.exclusion.is_excluded(&host.url) {
			self.detach(target, reason.as_str()).await;
			return;
		}

		let removed = {
			let mut state = self.inner.state.lock();
			if !state.table.contains(target) || state.reattach_pending.contains(&target) {
				return;
			}
			state.reattach_pending.insert(target);
			state.table.remove(target)
		};
		if let Some(removed) = &removed {
			self.announce_detached(removed, reasons::NAVIGATION_REATTACH);
		}
		self.inner.status.set(target, Indicator::Connecting);
		debug!(target = "pw.bridge", target_id = %target, reason = reason.as_str(), "reattach scheduled");

		self.reattach(target).await;
	}

	async fn reattach(&self, target: TargetId) {
		let delays = self.inner.options.reattach_delays.clone();
		let attempts = delays.len();
		for (attempt, delay) in delays.into_iter().enumerate() {
			tokio::time::sleep(delay).await;

			if !self.is_reattach_pending(target) {
				debug!(target = "pw.bridge", target_id = %target, "reattach cancelled");
				if !self.is_tracked(target) {
					self.inner.status.set(target, Indicator::Off);
				}
				return;
			}
			match self.inner.platform.get_target(target).await {
				Ok(Some(_)) => {}
				Ok(None) => {
					debug!(target = "pw.bridge", target_id = %target, "target gone, reattach abandoned");
					self.finish_reattach(target).await;
					return;
				}
				Err(err) => {
					debug!(target = "pw.bridge", target_id = %target, attempt, error = %err, "target lookup failed");
					continue;
				}
			}

			let options = AttachOptions {
				announce: self.inner.connection.is_connected(),
				enforce_exclusion: false,
			};
			match self.attach_with(target, options).await {
				Ok(attached) => {
					self.inner.state.lock().reattach_pending.remove(&target);
					info!(target = "pw.bridge", target_id = %target, session = %attached.session_id, attempt = attempt + 1, "target reattached");
					return;
				}
				Err(err) => {
					debug!(target = "pw.bridge", target_id = %target, attempt = attempt + 1, error = %err, "reattach attempt failed");
				}
			}
		}
		warn!(target = "pw.bridge", target_id = %target, attempts, "reattach gave up");
		self.finish_reattach(target).await;
	}

	async fn finish_reattach(&self, target: TargetId) {
		self.inner.state.lock().reattach_pending.remove(&target);
		if !self.is_tracked(target) {
			self.inner.status.set(target, Indicator::Off);
		}
		self.persist().await;
	}

	/// Attaches every eligible target. `force` ignores the auto-attach
	/// setting. Targets busy with another lifecycle operation are skipped.
	/// Returns the number of newly attached targets.
	pub async fn auto_attach_all(&self, force: bool) -> usize {
		if !force && !self.inner.settings.load().await.auto_attach_enabled {
			return 0;
		}
		let targets = match self.inner.platform.list_targets().await {
			Ok(targets) => targets,
			Err(err) => {
				debug!(target = "pw.bridge", error = %err, "target listing failed");
				return 0;
			}
		};

		let mut attached = 0;
		for info in targets {
			if self.inner.options.exclusion.is_excluded(&info.url)
				|| self.is_tracked(info.id)
				|| self.is_reattach_pending(info.id)
			{
				continue;
			}
			let lock = self.op_lock(info.id);
			let Ok(_guard) = lock.try_lock() else {
				continue;
			};
			let options = AttachOptions {
				announce: self.inner.connection.is_connected(),
				enforce_exclusion: true,
			};
			match self.attach_locked(info.id, options).await {
				Ok(outcome) if outcome.newly_attached => attached += 1,
				Ok(_) => {}
				Err(err) => debug!(target = "pw.bridge", target_id = %info.id, error = %err, "auto-attach failed"),
			}
		}
		self.refresh_summary();
		if attached > 0 {
			info!(target = "pw.bridge", attached, "auto-attach sweep");
		}
		attached
	}

	/// Event-driven attach of a single target. Needs the control link.
	pub(crate) async fn auto_attach_target(&self, target: TargetId, url: Option<String>) {
		if !self.inner.settings.load().await.auto_attach_enabled {
			return;
		}
		if url.as_deref().is_some_and(|u| self.inner.options.exclusion.is_excluded(u)) {
			return;
		}
		if self.is_tracked(target) || self.is_reattach_pending(target) {
			return;
		}
		if let Err(err) = self.inner.connection.ensure_connected().await {
			debug!(target = "pw.bridge", target_id = %target, error = %err, "auto-attach skipped, relay unreachable");
			return;
		}

		let lock = self.op_lock(target);
		let Ok(_guard) = lock.try_lock() else {
			return;
		};
		if self.is_reattach_pending(target) {
			return;
		}
		if let Err(err) = self.attach_locked(target, AttachOptions::default()).await {
			debug!(target = "pw.bridge", target_id = %target, error = %err, "auto-attach failed");
		}
	}

	/// Probes every connected session after a reconnect. Responsive ones are
	/// announced again under their existing session id; the rest are dropped
	/// without telling the peer.
	pub(crate) async fn reannounce(&self) {
		let sessions: Vec<Session> = self
			.inner
			.state
			.lock()
			.table
			.list_connected()
			.into_iter()
			.cloned()
			.collect();

		let mut kept = 0usize;
		let mut pruned = 0usize;
		for session in sessions {
			let lock = self.op_lock(session.target);
			let _guard = lock.lock().await;

			let probe = self
				.inner
				.platform
				.send_command(session.target, None, methods::RUNTIME_EVALUATE, Some(liveness_probe()))
				.await;
			if let Err(err) = probe {
				debug!(target = "pw.bridge", target_id = %session.target, error = %err, "session unresponsive");
				let dropped = {
					let mut state = self.inner.state.lock();
					let current = state
						.table
						.get(session.target)
						.is_some_and(|s| s.session_id == session.session_id);
					current && state.table.remove(session.target).is_some()
				};
				if dropped {
					pruned += 1;
					self.inner.status.set(session.target, Indicator::Off);
				}
				continue;
			}

			let target_info = match self.protocol_target_info(session.target).await {
				Ok(info) => info,
				Err(err) => {
					debug!(target = "pw.bridge", target_id = %session.target, error = %err, "target info unavailable");
					json!({
						"targetId": session.protocol_target_id,
						"type": "page",
						"url": session.url,
						"title": session.title,
					})
				}
			};
			self.forward(ForwardEvent::attached(session.session_id.as_str(), target_info));
			self.inner.status.set(session.target, Indicator::On);
			kept += 1;
		}

		info!(target = "pw.bridge", kept, pruned, "sessions re-announced");
		self.persist().await;
	}
}

/// `Runtime.evaluate` parameters used to check a target still responds.
pub(crate) fn liveness_probe() -> Value {
	json!({ "expression": "1", "returnByValue": true })
}
