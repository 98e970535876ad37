//! [`TargetPlatform`] over a Chromium remote-debugging port.
//!
//! One browser-level websocket carries everything: target discovery, and a
//! flattened session per attached page. Only `page` targets are exposed;
//! workers and iframes reach the relay as child sessions of their page.

mod connection;
mod index;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pw_bridge::{PlatformError, PlatformEvent, TargetId, TargetInfo, TargetPlatform};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use connection::{CdpConnection, CdpError, CdpEvent, discover};
pub use index::{CdpTargetInfo, TargetIndex};

/// Browser-level commands, outside any target session.
#[async_trait]
pub trait BrowserCommands: Send + Sync {
	async fn browser_call(&self, method: &str, params: Value) -> Result<Value, CdpError>;
}

/// Reply timeout for browser commands.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Chromium browser reached over its debugging port.
pub struct CdpPlatform {
	connection: Arc<CdpConnection>,
	index: Arc<Mutex<TargetIndex>>,
	closed: watch::Receiver<bool>,
}

impl CdpPlatform {
	/// Discovers and opens the browser websocket on `port`, enables target
	/// discovery and starts translating browser events.
	pub async fn connect(port: u16) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<PlatformEvent>), CdpError> {
		let ws_url = discover(port).await?;
		let (connection, mut cdp_events) = CdpConnection::open(&ws_url, COMMAND_TIMEOUT).await?;

		connection
			.call(None, "Target.setDiscoverTargets", Some(json!({ "discover": true })))
			.await?;
		let listed = connection.call(None, "Target.getTargets", None).await?;
		let infos: Vec<CdpTargetInfo> = listed
			.get("targetInfos")
			.cloned()
			.and_then(|v| serde_json::from_value(v).ok())
			.unwrap_or_default();

		let index = Arc::new(Mutex::new(TargetIndex::default()));
		{
			let mut index = index.lock();
			for info in infos.iter().filter(|info| info.is_page()) {
				index.register(info);
			}
			info!(target = "pw.bridge.cdp", port, pages = index.len(), "connected to browser");
		}

		let (events_tx, events_rx) = mpsc::unbounded_channel();
		let (closed_tx, closed) = watch::channel(false);
		let pump_index = Arc::clone(&index);
		tokio::spawn(async move {
			while let Some(event) = cdp_events.recv().await {
				let translated = pump_index.lock().on_event(event);
				for event in translated {
					if events_tx.send(event).is_err() {
						return;
					}
				}
			}
			warn!(target = "pw.bridge.cdp", "browser connection closed");
			closed_tx.send_replace(true);
		});

		Ok((
			Arc::new(Self {
				connection,
				index,
				closed,
			}),
			events_rx,
		))
	}

	/// Resolves once the browser websocket is gone.
	pub async fn closed(&self) {
		let mut closed = self.closed.clone();
		let _ = closed.wait_for(|closed| *closed).await;
	}

	fn cdp_id(&self, target: TargetId) -> Result<String, PlatformError> {
		self.index
			.lock()
			.cdp_id(target)
			.map(str::to_string)
			.ok_or(PlatformError::NoSuchTarget(target.0))
	}

	/// Main session of `target`, attaching first when there is none.
	///
	/// Sessions do not survive a restart of this process, so commands for
	/// rehydrated targets open a fresh one here.
	async fn session(&self, target: TargetId) -> Result<String, PlatformError> {
		let existing = self.index.lock().session(target).map(str::to_string);
		match existing {
			Some(session) => Ok(session),
			None => self.open_session(target).await,
		}
	}

	async fn open_session(&self, target: TargetId) -> Result<String, PlatformError> {
		let cdp_id = self.cdp_id(target)?;
		let reply = self
			.connection
			.call(
				None,
				"Target.attachToTarget",
				Some(json!({ "targetId": cdp_id, "flatten": true })),
			)
			.await
			.map_err(|e| platform_error(e, target))?;
		let session = reply
			.get("sessionId")
			.and_then(Value::as_str)
			.ok_or_else(|| PlatformError::Protocol("Target.attachToTarget returned no sessionId".into()))?
			.to_string();
		self.index.lock().bind_session(target, &session);
		debug!(target = "pw.bridge.cdp", target_id = %target, session = %session, "debugger attached");
		Ok(session)
	}
}

fn platform_error(err: CdpError, target: TargetId) -> PlatformError {
	if err.is_missing_target() {
		return PlatformError::NoSuchTarget(target.0);
	}
	match err {
		CdpError::Protocol { message, .. } => PlatformError::Protocol(message),
		other => PlatformError::Unavailable(other.to_string()),
	}
}

#[async_trait]
impl BrowserCommands for CdpPlatform {
	async fn browser_call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
		self.connection.call(None, method, Some(params)).await
	}
}

#[async_trait]
impl TargetPlatform for CdpPlatform {
	async fn list_targets(&self) -> Result<Vec<TargetInfo>, PlatformError> {
		if self.connection.is_closed() {
			return Err(PlatformError::Unavailable("browser connection closed".into()));
		}
		Ok(self.index.lock().list())
	}

	async fn get_target(&self, target: TargetId) -> Result<Option<TargetInfo>, PlatformError> {
		if self.connection.is_closed() {
			return Err(PlatformError::Unavailable("browser connection closed".into()));
		}
		Ok(self.index.lock().get(target))
	}

	async fn attach(&self, target: TargetId) -> Result<(), PlatformError> {
		let attached = self.index.lock().session(target).is_some();
		if attached {
			return Ok(());
		}
		self.open_session(target).await.map(|_| ())
	}

	async fn detach(&self, target: TargetId) -> Result<(), PlatformError> {
		let session = self
			.index
			.lock()
			.unbind_session(target)
			.ok_or(PlatformError::NotAttached(target.0))?;
		self.connection
			.call(None, "Target.detachFromTarget", Some(json!({ "sessionId": session })))
			.await
			.map(|_| ())
			.map_err(|e| platform_error(e, target))
	}

	async fn send_command(
		&self,
		target: TargetId,
		child_session: Option<&str>,
		method: &str,
		params: Option<Value>,
	) -> Result<Value, PlatformError> {
		let session = match child_session {
			Some(child) => child.to_string(),
			None => self.session(target).await?,
		};
		self.connection
			.call(Some(&session), method, params)
			.await
			.map_err(|e| platform_error(e, target))
	}

	async fn create_target(&self, url: &str) -> Result<TargetId, PlatformError> {
		let reply = self
			.connection
			.call(None, "Target.createTarget", Some(json!({ "url": url })))
			.await
			.map_err(|e| match e {
				CdpError::Protocol { message, .. } => PlatformError::Protocol(message),
				other => PlatformError::Unavailable(other.to_string()),
			})?;
		let cdp_id = reply
			.get("targetId")
			.and_then(Value::as_str)
			.ok_or_else(|| PlatformError::Protocol("Target.createTarget returned no targetId".into()))?;
		let info = CdpTargetInfo::page(cdp_id, url);
		Ok(self.index.lock().register(&info).0)
	}

	async fn close_target(&self, target: TargetId) -> Result<(), PlatformError> {
		let cdp_id = self.cdp_id(target)?;
		self.connection
			.call(None, "Target.closeTarget", Some(json!({ "targetId": cdp_id })))
			.await
			.map(|_| ())
			.map_err(|e| platform_error(e, target))
	}

	async fn activate_target(&self, target: TargetId) -> Result<(), PlatformError> {
		let cdp_id = self.cdp_id(target)?;
		self.connection
			.call(None, "Target.activateTarget", Some(json!({ "targetId": cdp_id })))
			.await
			.map(|_| ())
			.map_err(|e| platform_error(e, target))
	}
}
