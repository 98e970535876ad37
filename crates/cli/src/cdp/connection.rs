//! Browser-level websocket of a Chromium remote-debugging port.
//!
//! Commands are matched to replies by id through a pending map; everything
//! without an id is an event and goes to the channel returned by
//! [`CdpConnection::open`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CdpError {
	#[error("debugging endpoint unavailable at port {port}: {reason}")]
	Discovery { port: u16, reason: String },

	#[error("browser connection failed: {0}")]
	Connect(String),

	#[error("browser connection closed")]
	Closed,

	#[error("{method} timed out")]
	Timeout { method: String },

	/// Error object of a command reply.
	#[error("{message}")]
	Protocol { code: i64, message: String },
}

impl CdpError {
	/// Whether the reply says the addressed target or session is gone.
	pub fn is_missing_target(&self) -> bool {
		match self {
			CdpError::Protocol { message, .. } => {
				let message = message.to_ascii_lowercase();
				message.contains("no target with given id")
					|| message.contains("no session with given id")
					|| message.contains("target closed")
			}
			_ => false,
		}
	}
}

#[derive(Debug, Deserialize)]
struct CdpVersionInfo {
	#[serde(rename = "webSocketDebuggerUrl")]
	web_socket_debugger_url: String,
	#[serde(rename = "Browser")]
	browser: Option<String>,
}

/// Browser websocket URL advertised at `http://127.0.0.1:{port}/json/version`.
pub async fn discover(port: u16) -> Result<String, CdpError> {
	let url = format!("http://127.0.0.1:{port}/json/version");
	let discovery = |reason: String| CdpError::Discovery { port, reason };

	let response = reqwest::Client::new()
		.get(&url)
		.timeout(Duration::from_secs(2))
		.send()
		.await
		.map_err(|e| discovery(e.to_string()))?;
	if !response.status().is_success() {
		return Err(discovery(format!("HTTP {}", response.status())));
	}
	let info: CdpVersionInfo = response.json().await.map_err(|e| discovery(e.to_string()))?;
	debug!(
		target = "pw.bridge.cdp",
		browser = info.browser.as_deref().unwrap_or("unknown"),
		"discovered debugging endpoint"
	);
	Ok(info.web_socket_debugger_url)
}

/// Unsolicited message from the browser.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdpEvent {
	/// Flattened session the event was emitted in; `None` for the browser.
	#[serde(default)]
	pub session_id: Option<String>,
	pub method: String,
	#[serde(default)]
	pub params: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Request<'a> {
	id: u64,
	method: &'a str,
	params: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	session_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ErrorObject {
	#[serde(default)]
	code: i64,
	#[serde(default)]
	message: String,
}

#[derive(Debug, Deserialize)]
struct Reply {
	id: u64,
	#[serde(default)]
	result: Option<Value>,
	#[serde(default)]
	error: Option<ErrorObject>,
}

type Pending = Mutex<HashMap<u64, oneshot::Sender<Result<Value, CdpError>>>>;

/// An open browser websocket.
pub struct CdpConnection {
	outgoing: mpsc::UnboundedSender<String>,
	pending: Arc<Pending>,
	last_id: AtomicU64,
	timeout: Duration,
}

impl CdpConnection {
	pub async fn open(
		ws_url: &str,
		timeout: Duration,
	) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<CdpEvent>), CdpError> {
		let (stream, _response) = tokio_tungstenite::connect_async(ws_url)
			.await
			.map_err(|e| CdpError::Connect(e.to_string()))?;
		let (mut ws_tx, mut ws_rx) = stream.split();
		let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
		let (event_tx, event_rx) = mpsc::unbounded_channel();
		let pending: Arc<Pending> = Arc::new(Mutex::new(HashMap::new()));

		tokio::spawn(async move {
			while let Some(text) = out_rx.recv().await {
				if let Err(err) = ws_tx.send(Message::Text(text)).await {
					debug!(target = "pw.bridge.cdp", error = %err, "browser write failed");
					break;
				}
			}
			let _ = ws_tx.close().await;
		});

		let reader_pending = Arc::clone(&pending);
		tokio::spawn(async move {
			while let Some(message) = ws_rx.next().await {
				let text = match message {
					Ok(Message::Text(text)) => text,
					Ok(Message::Close(_)) => break,
					Ok(_) => continue,
					Err(err) => {
						warn!(target = "pw.bridge.cdp", error = %err, "browser connection failed");
						break;
					}
				};
				dispatch(&text, &reader_pending, &event_tx);
			}
			for (_, waiter) in reader_pending.lock().drain() {
				let _ = waiter.send(Err(CdpError::Closed));
			}
		});

		let connection = Arc::new(Self {
			outgoing: out_tx,
			pending,
			last_id: AtomicU64::new(0),
			timeout,
		});
		Ok((connection, event_rx))
	}

	/// Sends `method` to the browser, or into `session` when given.
	pub async fn call(&self, session: Option<&str>, method: &str, params: Option<Value>) -> Result<Value, CdpError> {
		let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
		let request = Request {
			id,
			method,
			params: params.unwrap_or_else(|| json!({})),
			session_id: session,
		};
		let text = serde_json::to_string(&request).map_err(|e| CdpError::Connect(e.to_string()))?;

		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);
		if self.outgoing.send(text).is_err() {
			self.pending.lock().remove(&id);
			return Err(CdpError::Closed);
		}

		match tokio::time::timeout(self.timeout, rx).await {
			Ok(Ok(reply)) => reply,
			Ok(Err(_)) => Err(CdpError::Closed),
			Err(_) => {
				self.pending.lock().remove(&id);
				Err(CdpError::Timeout {
					method: method.to_string(),
				})
			}
		}
	}

	pub fn is_closed(&self) -> bool {
		self.outgoing.is_closed()
	}
}

fn dispatch(text: &str, pending: &Pending, events: &mpsc::UnboundedSender<CdpEvent>) {
	let value: Value = match serde_json::from_str(text) {
		Ok(value) => value,
		Err(err) => {
			debug!(target = "pw.bridge.cdp", error = %err, "dropping unparsable browser message");
			return;
		}
	};

	if value.get("id").is_some() {
		let Ok(reply) = serde_json::from_value::<Reply>(value) else {
			return;
		};
		let Some(waiter) = pending.lock().remove(&reply.id) else {
			return;
		};
		let outcome = match reply.error {
			Some(error) => Err(CdpError::Protocol {
				code: error.code,
				message: error.message,
			}),
			None => Ok(reply.result.unwrap_or_else(|| json!({}))),
		};
		let _ = waiter.send(outcome);
	} else if let Ok(event) = serde_json::from_value::<CdpEvent>(value) {
		let _ = events.send(event);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn replies_resolve_pending_commands() {
		let pending: Pending = Mutex::new(HashMap::new());
		let (events, _rx) = mpsc::unbounded_channel();
		let (ok_tx, mut ok_rx) = oneshot::channel();
		let (err_tx, mut err_rx) = oneshot::channel();
		pending.lock().insert(1, ok_tx);
		pending.lock().insert(2, err_tx);

		dispatch(r#"{"id":1,"result":{"sessionId":"S1"}}"#, &pending, &events);
		dispatch(
			r#"{"id":2,"error":{"code":-32602,"message":"No target with given id found"}}"#,
			&pending,
			&events,
		);

		assert_eq!(ok_rx.try_recv().unwrap().unwrap()["sessionId"], "S1");
		let err = err_rx.try_recv().unwrap().unwrap_err();
		assert!(err.is_missing_target());
		assert!(pending.lock().is_empty());
	}

	#[test]
	fn messages_without_id_are_events() {
		let pending: Pending = Mutex::new(HashMap::new());
		let (events, mut rx) = mpsc::unbounded_channel();

		dispatch(
			r#"{"method":"Page.loadEventFired","params":{"timestamp":1},"sessionId":"S1"}"#,
			&pending,
			&events,
		);
		dispatch(r#"{"method":"Target.targetDestroyed","params":{"targetId":"T"}}"#, &pending, &events);
		dispatch("not json", &pending, &events);

		let first = rx.try_recv().unwrap();
		assert_eq!(first.session_id.as_deref(), Some("S1"));
		assert_eq!(first.method, "Page.loadEventFired");
		let second = rx.try_recv().unwrap();
		assert_eq!(second.session_id, None);
		assert_eq!(second.params["targetId"], "T");
		assert!(rx.try_recv().is_err());
	}

	#[test]
	fn other_errors_are_not_missing_target() {
		let err = CdpError::Protocol {
			code: -32000,
			message: "Cannot navigate to invalid URL".into(),
		};
		assert!(!err.is_missing_target());
		assert!(!CdpError::Closed.is_missing_target());
	}
}
