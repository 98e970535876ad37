//! Routing of peer commands to relay-native handlers, auxiliary families or
//! the owning target.

use pw_bridge_protocol::frame::{methods, reasons};
use pw_bridge_protocol::{ForwardCommand, StatusReport, TabSummary};
use serde_json::{Value, json};
use tracing::debug;

use super::lifecycle::AttachOptions;
use super::Relay;
use crate::auxiliary::AuxiliaryHandler;
use crate::error::{Error, Result};
use crate::platform::TargetId;
use crate::session::Resolved;

/// Method families served by auxiliary handlers rather than targets.
const AUXILIARY_FAMILIES: [&str; 2] = ["Cookie.", "Download."];

impl Relay {
	/// Executes one `forwardCDPCommand` and returns its result.
	pub async fn route(&self, command: ForwardCommand) -> Result<Value> {
		let method = command.method.trim().to_string();
		match method.as_str() {
			methods::TAB_LIST => return Ok(json!(self.tab_list())),
			methods::TAB_ATTACH_ALL => {
				self.auto_attach_all(true).await;
				return Ok(json!(self.tab_list()));
			}
			methods::TAB_GET_STATUS => return Ok(serde_json::to_value(self.status_report())?),
			methods::TARGET_CREATE => return self.create_target(&command).await,
			_ => {}
		}

		if let Some(handler) = self.auxiliary_for(&method) {
			return Ok(handler.handle(&method, command.params).await?);
		}
		if let Some(family) = AUXILIARY_FAMILIES.iter().find(|f| method.starts_with(**f)) {
			return Err(Error::InvalidCommand(format!(
				"{} commands are not available",
				family.trim_end_matches('.')
			)));
		}

		let Some(resolved) = self.resolve(&command) else {
			return Err(Error::NoAttachedTarget(method));
		};

		match method.as_str() {
			methods::TARGET_CLOSE => Ok(self.close_target(&command, resolved.target).await),
			methods::TARGET_ACTIVATE => Ok(self.activate_target(&command, resolved.target).await),
			methods::RUNTIME_ENABLE => self.runtime_enable(resolved, command.params).await,
			_ => self.pass_through(resolved, &method, command.params).await,
		}
	}

	fn auxiliary_for(&self, method: &str) -> Option<&dyn AuxiliaryHandler> {
		self.inner
			.auxiliary
			.iter()
			.find(|h| method.starts_with(h.prefix()))
			.map(|h| h.as_ref())
	}

	/// Owning target of a command: its session id (main or child), then the
	/// `targetId` parameter, then the oldest connected session.
	///
	/// The last fallback sends session-less commands to whichever target was
	/// attached first, which may not be the one the peer meant.
	pub(crate) fn resolve(&self, command: &ForwardCommand) -> Option<Resolved> {
		let state = self.inner.state.lock();
		let table = &state.table;
		if let Some(resolved) = command
			.session_id
			.as_deref()
			.and_then(|id| table.resolve_session(id))
		{
			return Some(resolved);
		}
		if let Some(target) = command
			.inner_target_id()
			.and_then(|id| table.find_by_protocol_id(id))
		{
			return Some(Resolved {
				target,
				child_session: None,
			});
		}
		table.first_connected().map(|s| Resolved {
			target: s.target,
			child_session: None,
		})
	}

	/// Connected sessions in attach order.
	pub fn tab_list(&self) -> Vec<TabSummary> {
		let state = self.inner.state.lock();
		state
			.table
			.list_connected()
			.into_iter()
			.filter(|s| !s.protocol_target_id.is_empty())
			.map(|s| TabSummary {
				tab_id: s.target.0,
				session_id: s.session_id.to_string(),
				target_id: s.protocol_target_id.clone(),
				url: s.url.clone(),
				title: s.title.clone(),
				status: "connected".to_string(),
				attached_at: s.attached_at_ms,
			})
			.collect()
	}

	pub fn status_report(&self) -> StatusReport {
		let tabs = self.tab_list();
		StatusReport {
			ws_state: self.inner.connection.phase(),
			attached_count: tabs.len(),
			tabs,
			uptime: self.inner.started.elapsed().as_millis() as u64,
		}
	}

	/// Opens a target in the background, attaches it and answers with its
	/// protocol `targetId`.
	async fn create_target(&self, command: &ForwardCommand) -> Result<Value> {
		let url = command.str_param("url").unwrap_or("about:blank");
		let target = self.inner.platform.create_target(url).await?;
		tokio::time::sleep(self.inner.options.create_settle).await;

		let attached = self
			.attach_with(
				target,
				AttachOptions {
					announce: true,
					enforce_exclusion: false,
				},
			)
			.await?;
		Ok(json!({ "targetId": attached.protocol_target_id }))
	}

	async fn close_target(&self, command: &ForwardCommand, resolved: TargetId) -> Value {
		let Some(target) = self.named_or(command, resolved) else {
			return json!({ "success": false });
		};
		match self.inner.platform.close_target(target).await {
			Ok(()) => json!({ "success": true }),
			Err(err) => {
				debug!(target = "pw.bridge", target_id = %target, error = %err, "close failed");
				json!({ "success": false })
			}
		}
	}

	async fn activate_target(&self, command: &ForwardCommand, resolved: TargetId) -> Value {
		if let Some(target) = self.named_or(command, resolved) {
			if let Err(err) = self.inner.platform.activate_target(target).await {
				debug!(target = "pw.bridge", target_id = %target, error = %err, "activate failed");
			}
		}
		json!({})
	}

	/// The target named by `params.targetId` if present, else `fallback`.
	/// `None` when the named target is not tracked.
	fn named_or(&self, command: &ForwardCommand, fallback: TargetId) -> Option<TargetId> {
		match command.inner_target_id() {
			Some(id) => self.inner.state.lock().table.find_by_protocol_id(id),
			None => Some(fallback),
		}
	}

	async fn runtime_enable(&self, resolved: Resolved, params: Option<Value>) -> Result<Value> {
		let child = resolved.child_session.as_deref();
		match self
			.inner
			.platform
			.send_command(resolved.target, child, methods::RUNTIME_DISABLE, None)
			.await
		{
			Ok(_) => tokio::time::sleep(self.inner.options.enable_settle).await,
			Err(err) => debug!(target = "pw.bridge", target_id = %resolved.target, error = %err, "Runtime.disable failed"),
		}
		self.pass_through(resolved, methods::RUNTIME_ENABLE, params).await
	}

	async fn pass_through(&self, resolved: Resolved, method: &str, params: Option<Value>) -> Result<Value> {
		let outcome = self
			.inner
			.platform
			.send_command(resolved.target, resolved.child_session.as_deref(), method, params)
			.await;
		match outcome {
			Ok(result) => Ok(result),
			Err(err) if err.is_target_gone() => {
				let relay = self.clone();
				let target = resolved.target;
				tokio::spawn(async move { relay.detach(target, reasons::TAB_CLOSED).await });
				Err(Error::TargetGone(target.to_string()))
			}
			Err(err) => Err(err.into()),
		}
	}
}

