//! Connection manager: the single control link to the relay peer.
//!
//! # Message Flow
//!
//! 1. [`ConnectionManager::ensure_connected`] probes the peer, derives the
//!    token and dials; concurrent callers share one attempt
//! 2. A reader task classifies inbound frames: pings are answered, replies
//!    resolve pending requests, commands are pushed to the relay as
//!    [`ConnectionEvent::Command`]
//! 3. When the link drops, pending requests fail, [`ConnectionEvent::Closed`]
//!    is emitted and a reconnect is scheduled with exponential backoff
//! 4. A successful reconnect emits [`ConnectionEvent::Reconnected`]
//!
//! Every link carries a generation number; close notifications from an older
//! link are ignored.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use pw_bridge_protocol::frame::{self, Inbound, methods};
use pw_bridge_protocol::gateway::{GatewayFrame, POLICY_VIOLATION};
use pw_bridge_protocol::{ForwardCommand, LinkState};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::config::SettingsSource;
use crate::error::{ConnectError, Error, Result};
use crate::token::derive_token;

mod link;

pub use link::{Dialer, Incoming, Link, Outgoing, WsDialer};

/// Phase of the control link.
pub type ConnectionPhase = LinkState;

type SharedConnect = Shared<BoxFuture<'static, std::result::Result<(), ConnectError>>>;

/// Notifications for the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
	/// Peer command to execute; answer with [`ConnectionManager::reply`].
	Command { id: u64, command: ForwardCommand },
	/// The link dropped.
	Closed { reason: String },
	/// A link came up after an earlier one dropped or a connect attempt
	/// failed.
	Reconnected,
}

/// Timeouts and backoff of the control link.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionOptions {
	pub probe_timeout: Duration,
	pub connect_timeout: Duration,
	pub request_timeout: Duration,
	pub backoff: BackoffPolicy,
}

impl Default for ConnectionOptions {
	fn default() -> Self {
		Self {
			probe_timeout: Duration::from_secs(2),
			connect_timeout: Duration::from_secs(5),
			request_timeout: Duration::from_secs(30),
			backoff: BackoffPolicy::default(),
		}
	}
}

struct LinkSlot {
	generation: u64,
	/// Number of links opened so far.
	opened: u64,
	outgoing: Option<mpsc::UnboundedSender<Outgoing>>,
	/// Id of the outstanding gateway `connect` request.
	handshake_id: Option<String>,
	token: Option<String>,
	reconnect_attempt: u32,
	reconnect_timer: Option<JoinHandle<()>>,
	/// Consecutive gateway handshakes answered with `ok:false`.
	rejections: u32,
	/// A connect attempt failed since the last link opened.
	recovering: bool,
	shut_down: bool,
}

pub struct ConnectionManager {
	settings: Arc<dyn SettingsSource>,
	dialer: Arc<dyn Dialer>,
	options: ConnectionOptions,
	events: mpsc::UnboundedSender<ConnectionEvent>,
	phase: watch::Sender<ConnectionPhase>,
	slot: Mutex<LinkSlot>,
	in_flight: Mutex<Option<SharedConnect>>,
	last_id: AtomicU64,
	pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
}

impl ConnectionManager {
	pub fn new(
		settings: Arc<dyn SettingsSource>,
		dialer: Arc<dyn Dialer>,
		options: ConnectionOptions,
	) -> (Arc<Self>, mpsc::UnboundedReceiver<ConnectionEvent>) {
		let (events, events_rx) = mpsc::unbounded_channel();
		let (phase, _) = watch::channel(ConnectionPhase::Disconnected);
		let manager = Arc::new(Self {
			settings,
			dialer,
			options,
			events,
			phase,
			slot: Mutex::new(LinkSlot {
				generation: 0,
				opened: 0,
				outgoing: None,
				handshake_id: None,
				token: None,
				reconnect_attempt: 0,
				reconnect_timer: None,
				rejections: 0,
				recovering: false,
				shut_down: false,
			}),
			in_flight: Mutex::new(None),
			last_id: AtomicU64::new(0),
			pending: Mutex::new(HashMap::new()),
		});
		(manager, events_rx)
	}

	pub fn phase(&self) -> ConnectionPhase {
		*self.phase.borrow()
	}

	pub fn is_connected(&self) -> bool {
		self.phase() == ConnectionPhase::Connected
	}

	/// Watches phase changes.
	pub fn subscribe_phase(&self) -> watch::Receiver<ConnectionPhase> {
		self.phase.subscribe()
	}

	/// A connect attempt is running right now.
	pub fn is_connecting(&self) -> bool {
		self.in_flight.lock().is_some()
	}

	/// A reconnect is scheduled.
	pub fn reconnect_pending(&self) -> bool {
		self.slot
			.lock()
			.reconnect_timer
			.as_ref()
			.is_some_and(|timer| !timer.is_finished())
	}

	/// Number of consecutive failed reconnect attempts.
	pub fn reconnect_attempt(&self) -> u32 {
		self.slot.lock().reconnect_attempt
	}

	/// Opens the link unless it is already up. Concurrent callers share one
	/// attempt.
	pub async fn ensure_connected(self: &Arc<Self>) -> std::result::Result<(), ConnectError> {
		if self.is_connected() {
			return Ok(());
		}
		let attempt = {
			let mut in_flight = self.in_flight.lock();
			match in_flight.as_ref() {
				Some(attempt) => attempt.clone(),
				None => {
					let this = Arc::clone(self);
					let handle = tokio::spawn(async move {
						let result = this.connect_once().await;
						*this.in_flight.lock() = None;
						result
					});
					let attempt = async move { handle.await.unwrap_or(Err(ConnectError::Closed)) }
						.boxed()
						.shared();
					*in_flight = Some(attempt.clone());
					attempt
				}
			}
		};
		attempt.await
	}

	async fn connect_once(self: &Arc<Self>) -> std::result::Result<(), ConnectError> {
		if self.slot.lock().shut_down {
			return Err(ConnectError::Closed);
		}
		self.phase.send_replace(ConnectionPhase::Connecting);

		let result = self.open_link().await;
		if let Err(err) = &result {
			debug!(target = "pw.bridge", error = %err, "relay connect failed");
			self.slot.lock().recovering = true;
			self.phase.send_replace(ConnectionPhase::Disconnected);
		}
		result
	}

	async fn open_link(self: &Arc<Self>) -> std::result::Result<(), ConnectError> {
		let settings = self.settings.load().await;
		let secret = settings.secret().ok_or(ConnectError::MissingCredential)?;
		let port = settings.port();
		let token = derive_token(secret, port);

		let base = settings.relay_base();
		tokio::time::timeout(self.options.probe_timeout, self.dialer.probe(&base))
			.await
			.map_err(|_| ConnectError::Timeout { stage: "relay probe" })??;

		let url = format!("ws://127.0.0.1:{port}/extension?token={token}");
		let link = tokio::time::timeout(self.options.connect_timeout, self.dialer.dial(&url))
			.await
			.map_err(|_| ConnectError::Timeout {
				stage: "relay websocket connect",
			})??;

		let (generation, reconnected) = {
			let mut slot = self.slot.lock();
			if slot.shut_down {
				let _ = link.outgoing.send(Outgoing::Close {
					code: 1000,
					reason: "shutdown".to_string(),
				});
				return Err(ConnectError::Closed);
			}
			slot.generation += 1;
			slot.opened += 1;
			slot.outgoing = Some(link.outgoing);
			slot.handshake_id = None;
			slot.token = Some(token);
			slot.reconnect_attempt = 0;
			let reconnected = slot.opened > 1 || slot.recovering;
			slot.recovering = false;
			(slot.generation, reconnected)
		};
		self.phase.send_replace(ConnectionPhase::Connected);
		info!(target = "pw.bridge", port, generation, "relay connected");

		let this = Arc::clone(self);
		tokio::spawn(async move { this.read_loop(generation, link.incoming).await });

		if reconnected {
			let _ = self.events.send(ConnectionEvent::Reconnected);
		}
		Ok(())
	}

	async fn read_loop(self: Arc<Self>, generation: u64, mut incoming: mpsc::UnboundedReceiver<Incoming>) {
		let reason = loop {
			match incoming.recv().await {
				Some(Incoming::Text(text)) => self.on_text(&text),
				Some(Incoming::Closed { code, reason }) => {
					break match code {
						Some(code) => format!("closed ({code}) {reason}").trim_end().to_string(),
						None => format!("closed {reason}").trim_end().to_string(),
					};
				}
				Some(Incoming::Error(err)) => break format!("error: {err}"),
				None => break "link dropped".to_string(),
			}
		};
		self.on_closed(generation, reason);
	}

	fn on_text(self: &Arc<Self>, text: &str) {
		let value: Value = match serde_json::from_str(text) {
			Ok(value) => value,
			Err(err) => {
				debug!(target = "pw.bridge", error = %err, "ignoring non-JSON relay frame");
				return;
			}
		};

		match Inbound::classify(value) {
			Inbound::Ping => {
				if let Err(err) = self.notify(methods::PONG, None) {
					debug!(target = "pw.bridge", error = %err, "pong not sent");
				}
			}
			Inbound::Response { id, outcome } => match self.pending.lock().remove(&id) {
				Some(tx) => {
					let _ = tx.send(outcome.map_err(Error::Remote));
				}
				None => debug!(target = "pw.bridge", id, "reply for unknown request"),
			},
			Inbound::Command { id, command } => {
				let _ = self.events.send(ConnectionEvent::Command { id, command });
			}
			Inbound::Malformed { id, reason } => {
				warn!(target = "pw.bridge", id, reason = %reason, "malformed relay command");
				self.reply(id, Err(reason));
			}
			Inbound::Gateway(frame) => self.on_gateway(frame),
			Inbound::Other(value) => {
				debug!(target = "pw.bridge", frame = %value, "ignoring unexpected relay frame");
			}
		}
	}

	fn on_gateway(self: &Arc<Self>, frame: GatewayFrame) {
		if let Some(nonce) = frame.challenge_nonce() {
			let id = format!(
				"ext-connect-{}-{:08x}",
				crate::now_ms(),
				rand::rng().random::<u32>()
			);
			let token = {
				let mut slot = self.slot.lock();
				slot.handshake_id = Some(id.clone());
				slot.token.clone()
			};
			let request = GatewayFrame::connect_request(id, nonce.as_deref(), token.as_deref());
			match serde_json::to_value(&request) {
				Ok(value) => {
					if let Err(err) = self.send_frame(&value) {
						warn!(target = "pw.bridge", error = %err, "gateway connect request not sent");
					}
				}
				Err(err) => warn!(target = "pw.bridge", error = %err, "gateway connect request not encoded"),
			}
			return;
		}

		if let GatewayFrame::Res { id, ok, .. } = &frame {
			let mut slot = self.slot.lock();
			if slot.handshake_id.as_deref() != Some(id.as_str()) {
				return;
			}
			slot.handshake_id = None;
			if *ok {
				slot.rejections = 0;
				info!(target = "pw.bridge", "gateway handshake accepted");
				return;
			}
			// Opening the socket reset the backoff; a rejected handshake
			// counts as a failed attempt.
			slot.rejections = slot.rejections.saturating_add(1);
			slot.reconnect_attempt = slot.rejections;
			let detail = frame.rejection_detail().unwrap_or_default();
			warn!(target = "pw.bridge", detail = %detail, rejections = slot.rejections, "gateway handshake rejected");
			if let Some(outgoing) = &slot.outgoing {
				let _ = outgoing.send(Outgoing::Close {
					code: POLICY_VIOLATION,
					reason: "gateway connect failed".to_string(),
				});
			}
		}
	}

	fn on_closed(self: &Arc<Self>, generation: u64, reason: String) {
		{
			let mut slot = self.slot.lock();
			if slot.generation != generation || slot.outgoing.is_none() {
				debug!(target = "pw.bridge", generation, "ignoring close of stale link");
				return;
			}
			slot.outgoing = None;
			slot.handshake_id = None;
		}
		self.phase.send_replace(ConnectionPhase::Disconnected);
		warn!(target = "pw.bridge", reason = %reason, "relay disconnected");

		let pending: Vec<_> = self.pending.lock().drain().collect();
		for (_, tx) in pending {
			let _ = tx.send(Err(Error::Disconnected(reason.clone())));
		}

		let _ = self.events.send(ConnectionEvent::Closed { reason });
		self.schedule_reconnect();
	}

	/// Schedules one reconnect attempt after the backoff delay, unless one is
	/// already scheduled. Failed retryable attempts schedule the next one.
	pub fn schedule_reconnect(self: &Arc<Self>) {
		let mut slot = self.slot.lock();
		if slot.shut_down || slot.reconnect_timer.as_ref().is_some_and(|t| !t.is_finished()) {
			return;
		}
		let attempt = slot.reconnect_attempt;
		let delay = self.options.backoff.delay(attempt);
		debug!(target = "pw.bridge", attempt, delay_ms = delay.as_millis() as u64, "relay reconnect scheduled");

		let this = Arc::clone(self);
		slot.reconnect_timer = Some(tokio::spawn(async move {
			tokio::time::sleep(delay).await;
			// The link opened below may drop before `ensure_connected`
			// returns; its close must be able to schedule the next attempt.
			this.slot.lock().reconnect_timer = None;
			match this.ensure_connected().await {
				Ok(()) => {}
				Err(err) if err.is_retryable() => {
					{
						let mut slot = this.slot.lock();
						slot.reconnect_attempt = slot.reconnect_attempt.saturating_add(1);
					}
					debug!(target = "pw.bridge", error = %err, "relay reconnect failed");
					this.schedule_reconnect();
				}
				Err(err) => warn!(target = "pw.bridge", error = %err, "relay reconnect halted"),
			}
		}));
	}

	/// Writes a raw frame to the link.
	pub fn send_frame(&self, value: &Value) -> Result<()> {
		let slot = self.slot.lock();
		let outgoing = slot.outgoing.as_ref().ok_or(Error::NotConnected)?;
		outgoing
			.send(Outgoing::Text(value.to_string()))
			.map_err(|_| Error::NotConnected)
	}

	/// Sends `{method, params}`.
	pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
		self.send_frame(&frame::notification(method, params))
	}

	/// Answers a peer command with `{id, result}` or `{id, error}`.
	pub fn reply(&self, id: u64, outcome: std::result::Result<Value, String>) {
		let frame = match outcome {
			Ok(result) => frame::response_ok(id, result),
			Err(message) => frame::response_err(id, &message),
		};
		if let Err(err) = self.send_frame(&frame) {
			debug!(target = "pw.bridge", id, error = %err, "reply dropped");
		}
	}

	/// Sends `{id, method, params}` and awaits the peer's reply.
	pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
		let id = self.last_id.fetch_add(1, Ordering::Relaxed) + 1;
		let (tx, rx) = oneshot::channel();
		self.pending.lock().insert(id, tx);

		if let Err(err) = self.send_frame(&frame::request(id, method, params)) {
			self.pending.lock().remove(&id);
			return Err(err);
		}

		match tokio::time::timeout(self.options.request_timeout, rx).await {
			Ok(Ok(result)) => result,
			Ok(Err(_)) => Err(Error::Disconnected("request abandoned".to_string())),
			Err(_) => {
				self.pending.lock().remove(&id);
				Err(Error::RequestTimeout {
					method: method.to_string(),
					ms: self.options.request_timeout.as_millis() as u64,
				})
			}
		}
	}

	/// Closes the link for good and cancels any scheduled reconnect.
	pub fn shutdown(&self) {
		let outgoing = {
			let mut slot = self.slot.lock();
			slot.shut_down = true;
			slot.generation += 1;
			if let Some(timer) = slot.reconnect_timer.take() {
				timer.abort();
			}
			slot.outgoing.take()
		};
		if let Some(outgoing) = outgoing {
			let _ = outgoing.send(Outgoing::Close {
				code: 1000,
				reason: "shutdown".to_string(),
			});
		}
		let pending: Vec<_> = self.pending.lock().drain().collect();
		for (_, tx) in pending {
			let _ = tx.send(Err(Error::Disconnected("shutdown".to_string())));
		}
		self.phase.send_replace(ConnectionPhase::Disconnected);
	}
}
