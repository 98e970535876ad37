//! Transport under the connection manager.
//!
//! A [`Link`] is a pair of channels bridged to a websocket by two tasks, so
//! the manager never touches the socket directly and tests can swap in an
//! in-memory peer.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;

use crate::error::ConnectError;

/// Frame queued for the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
	Text(String),
	/// Closes the link; nothing is sent after it.
	Close { code: u16, reason: String },
}

/// What the reader side observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Incoming {
	Text(String),
	Closed { code: Option<u16>, reason: String },
	Error(String),
}

/// An open connection to the relay peer.
#[derive(Debug)]
pub struct Link {
	pub outgoing: mpsc::UnboundedSender<Outgoing>,
	pub incoming: mpsc::UnboundedReceiver<Incoming>,
}

/// Opens links to the relay peer.
#[async_trait]
pub trait Dialer: Send + Sync {
	/// Cheap reachability check of the peer's HTTP endpoint.
	async fn probe(&self, base: &str) -> Result<(), ConnectError>;

	/// Opens the websocket at `url`.
	async fn dial(&self, url: &str) -> Result<Link, ConnectError>;
}

/// [`Dialer`] over real sockets: `reqwest` for the probe, `tokio-tungstenite`
/// for the control link.
#[derive(Debug, Clone)]
pub struct WsDialer {
	http: reqwest::Client,
}

impl WsDialer {
	pub fn new() -> Self {
		Self {
			http: reqwest::Client::new(),
		}
	}
}

impl Default for WsDialer {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Dialer for WsDialer {
	async fn probe(&self, base: &str) -> Result<(), ConnectError> {
		self.http
			.head(base)
			.timeout(Duration::from_secs(2))
			.send()
			.await
			.map(|_| ())
			.map_err(|err| ConnectError::Unreachable {
				base: base.to_string(),
				reason: err.to_string(),
			})
	}

	async fn dial(&self, url: &str) -> Result<Link, ConnectError> {
		use tokio_tungstenite::tungstenite::Error as WsError;

		let (stream, _response) = tokio_tungstenite::connect_async(url).await.map_err(|err| match err {
			WsError::Http(response) => ConnectError::Rejected(format!("HTTP {}", response.status())),
			other => ConnectError::Unreachable {
				base: redact_token(url),
				reason: other.to_string(),
			},
		})?;

		let (mut ws_tx, mut ws_rx) = stream.split();
		let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outgoing>();
		let (in_tx, in_rx) = mpsc::unbounded_channel::<Incoming>();

		tokio::spawn(async move {
			while let Some(frame) = out_rx.recv().await {
				let (message, last) = match frame {
					Outgoing::Text(text) => (Message::Text(text), false),
					Outgoing::Close { code, reason } => (
						Message::Close(Some(CloseFrame {
							code: CloseCode::from(code),
							reason: reason.into(),
						})),
						true,
					),
				};
				if let Err(err) = ws_tx.send(message).await {
					debug!(target = "pw.bridge", error = %err, "websocket write failed");
					break;
				}
				if last {
					break;
				}
			}
			let _ = ws_tx.close().await;
		});

		tokio::spawn(async move {
			let terminal = loop {
				match ws_rx.next().await {
					Some(Ok(Message::Text(text))) => {
						if in_tx.send(Incoming::Text(text)).is_err() {
							return;
						}
					}
					Some(Ok(Message::Close(frame))) => {
						break Incoming::Closed {
							code: frame.as_ref().map(|f| u16::from(f.code)),
							reason: frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
						};
					}
					Some(Ok(_)) => {}
					Some(Err(err)) => break Incoming::Error(err.to_string()),
					None => {
						break Incoming::Closed {
							code: None,
							reason: "stream ended".to_string(),
						};
					}
				}
			};
			let _ = in_tx.send(terminal);
		});

		Ok(Link {
			outgoing: out_tx,
			incoming: in_rx,
		})
	}
}

/// Strips the query string so tokens never reach the logs.
pub(crate) fn redact_token(url: &str) -> String {
	match url.split_once('?') {
		Some((base, _)) => format!("{base}?token=<redacted>"),
		None => url.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn redacts_query() {
		assert_eq!(
			redact_token("ws://127.0.0.1:1/extension?token=abc"),
			"ws://127.0.0.1:1/extension?token=<redacted>"
		);
		assert_eq!(redact_token("ws://h/x"), "ws://h/x");
	}
}
