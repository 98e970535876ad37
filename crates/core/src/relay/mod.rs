//! The relay: one value owning all session state.
//!
//! Connection events and platform events are funneled into [`Relay::run`]
//! and handled in arrival order. Index mutations happen inside short
//! synchronous sections under one lock; anything that awaits (command
//! execution, reattach loops, sweeps) runs as a spawned task.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pw_bridge_protocol::ForwardEvent;
use pw_bridge_protocol::frame::methods;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, info, warn};

use crate::auxiliary::AuxiliaryHandler;
use crate::config::SettingsSource;
use crate::connection::{ConnectionEvent, ConnectionManager, ConnectionOptions, Dialer};
use crate::platform::{PlatformEvent, TargetId, TargetPlatform};
use crate::policy::ExclusionPolicy;
use crate::session::{SessionId, SessionTable};
use crate::store::SnapshotStore;

mod lifecycle;
mod rehydrate;
mod router;
mod status;

pub use lifecycle::{AttachOptions, Attached};
pub use status::{Indicator, StatusSnapshot, Summary};

use status::StatusBoard;

/// Tunables of the relay.
#[derive(Debug, Clone)]
pub struct RelayOptions {
	/// Waits before each reattach attempt after an involuntary detach.
	pub reattach_delays: Vec<Duration>,
	/// Period of the keepalive sweep; `None` disables it.
	pub keepalive_period: Option<Duration>,
	/// Pause between `Runtime.disable` and `Runtime.enable`.
	pub enable_settle: Duration,
	/// Pause between creating a target and attaching to it.
	pub create_settle: Duration,
	pub exclusion: ExclusionPolicy,
	pub connection: ConnectionOptions,
}

impl Default for RelayOptions {
	fn default() -> Self {
		Self {
			reattach_delays: [300, 700, 1500].map(Duration::from_millis).to_vec(),
			keepalive_period: Some(Duration::from_secs(24)),
			enable_settle: Duration::from_millis(50),
			create_settle: Duration::from_millis(100),
			exclusion: ExclusionPolicy::default(),
			connection: ConnectionOptions::default(),
		}
	}
}

/// Collaborators a relay is built from.
pub struct RelayParts {
	pub platform: Arc<dyn TargetPlatform>,
	pub settings: Arc<dyn SettingsSource>,
	pub store: Arc<dyn SnapshotStore>,
	pub dialer: Arc<dyn Dialer>,
	pub auxiliary: Vec<Arc<dyn AuxiliaryHandler>>,
	pub options: RelayOptions,
}

#[derive(Default)]
pub(crate) struct RelayState {
	pub(crate) table: SessionTable,
	pub(crate) reattach_pending: HashSet<TargetId>,
	locks: HashMap<TargetId, Arc<tokio::sync::Mutex<()>>>,
}

pub(crate) struct Inner {
	pub(crate) platform: Arc<dyn TargetPlatform>,
	pub(crate) settings: Arc<dyn SettingsSource>,
	pub(crate) store: Arc<dyn SnapshotStore>,
	pub(crate) auxiliary: Vec<Arc<dyn AuxiliaryHandler>>,
	pub(crate) options: RelayOptions,
	pub(crate) connection: Arc<ConnectionManager>,
	pub(crate) state: Mutex<RelayState>,
	pub(crate) status: StatusBoard,
	pub(crate) persist_lock: tokio::sync::Mutex<()>,
	pub(crate) started: Instant,
	connection_events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
	shutdown: watch::Sender<bool>,
}

/// Session relay. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Relay {
	pub(crate) inner: Arc<Inner>,
}

impl Relay {
	pub fn new(parts: RelayParts) -> Self {
		let RelayParts {
			platform,
			settings,
			store,
			dialer,
			auxiliary,
			options,
		} = parts;
		let (connection, connection_events) = ConnectionManager::new(settings.clone(), dialer, options.connection);
		let (shutdown, _) = watch::channel(false);
		Self {
			inner: Arc::new(Inner {
				platform,
				settings,
				store,
				auxiliary,
				options,
				connection,
				state: Mutex::new(RelayState::default()),
				status: StatusBoard::new(),
				persist_lock: tokio::sync::Mutex::new(()),
				started: Instant::now(),
				connection_events: Mutex::new(Some(connection_events)),
				shutdown,
			}),
		}
	}

	pub fn connection(&self) -> &Arc<ConnectionManager> {
		&self.inner.connection
	}

	/// Watches the status board.
	pub fn status(&self) -> watch::Receiver<StatusSnapshot> {
		self.inner.status.subscribe()
	}

	pub fn current_status(&self) -> StatusSnapshot {
		self.inner.status.current()
	}

	/// Spawns [`run`](Self::run) on the current runtime.
	pub fn start(&self, platform_events: mpsc::UnboundedReceiver<PlatformEvent>) -> JoinHandle<()> {
		let relay = self.clone();
		tokio::spawn(async move { relay.run(platform_events).await })
	}

	/// Start-up sequence followed by the dispatch loop. Returns on
	/// [`shutdown`](Self::shutdown).
	pub async fn run(&self, mut platform_events: mpsc::UnboundedReceiver<PlatformEvent>) {
		let Some(mut connection_events) = self.inner.connection_events.lock().take() else {
			warn!(target = "pw.bridge", "relay is already running");
			return;
		};
		let mut shutdown = self.inner.shutdown.subscribe();
		if *shutdown.borrow() {
			return;
		}
		let mut phase = self.inner.connection.subscribe_phase();
		let mut keepalive = self.inner.options.keepalive_period.map(|period| {
			let mut interval = tokio::time::interval_at(Instant::now() + period, period);
			interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
			interval
		});

		self.startup().await;

		loop {
			tokio::select! {
				_ = shutdown.changed() => break,
				Some(event) = connection_events.recv() => self.on_connection_event(event),
				Some(event) = platform_events.recv() => self.dispatch_platform_event(event),
				Ok(()) = phase.changed() => {
					let current = *phase.borrow_and_update();
					self.inner.status.set_phase(current);
				}
				_ = tick(&mut keepalive) => self.spawn_keepalive(),
			}
		}
		info!(target = "pw.bridge", "relay stopped");
	}

	/// Stops the dispatch loop and closes the control link.
	pub fn shutdown(&self) {
		self.inner.shutdown.send_replace(true);
		self.inner.connection.shutdown();
	}

	async fn startup(&self) {
		let restored = self.rehydrate().await;
		self.inner.status.set_phase(self.inner.connection.phase());

		match self.inner.connection.ensure_connected().await {
			Ok(()) => {
				if restored > 0 {
					self.reannounce().await;
				}
			}
			Err(err) => {
				warn!(target = "pw.bridge", error = %err, "relay not reachable at start-up");
				if err.is_retryable() {
					self.inner.connection.schedule_reconnect();
				}
			}
		}
		self.inner.status.set_phase(self.inner.connection.phase());
		self.auto_attach_all(false).await;
	}

	fn on_connection_event(&self, event: ConnectionEvent) {
		match event {
			ConnectionEvent::Command { id, command } => {
				let relay = self.clone();
				tokio::spawn(async move {
					let method = command.method.clone();
					let outcome = relay.route(command).await.map_err(|err| {
						debug!(target = "pw.bridge", id, method = %method, error = %err, "command failed");
						err.to_string()
					});
					relay.inner.connection.reply(id, outcome);
				});
			}
			ConnectionEvent::Closed { reason } => {
				let (connected, cancelled): (Vec<TargetId>, Vec<TargetId>) = {
					let mut state = self.inner.state.lock();
					let cancelled = state.reattach_pending.drain().collect();
					(state.table.list_connected().iter().map(|s| s.target).collect(), cancelled)
				};
				debug!(
					target = "pw.bridge",
					reason = %reason,
					sessions = connected.len(),
					reattach_cancelled = cancelled.len(),
					"link lost"
				);
				self.inner.status.set_all(cancelled, Indicator::Off);
				self.inner.status.set_all(connected, Indicator::Connecting);
			}
			ConnectionEvent::Reconnected => {
				let relay = self.clone();
				tokio::spawn(async move { relay.reannounce().await });
			}
		}
	}

	/// Applies one platform event. Index updates happen here; async follow-up
	/// work is spawned.
	pub(crate) fn dispatch_platform_event(&self, event: PlatformEvent) {
		match event {
			PlatformEvent::Created(info) => {
				let relay = self.clone();
				tokio::spawn(async move { relay.auto_attach_target(info.id, Some(info.url)).await });
			}
			PlatformEvent::Updated {
				target,
				url,
				title,
				loading,
			} => {
				let tracked = {
					let mut state = self.inner.state.lock();
					state.table.update_metadata(target, url.as_deref(), title.as_deref())
				};
				if loading && !tracked {
					let relay = self.clone();
					tokio::spawn(async move { relay.auto_attach_target(target, url).await });
				}
			}
			PlatformEvent::Removed(target) => self.on_target_removed(target),
			PlatformEvent::Replaced { added, removed } => {
				let moved = self.inner.state.lock().table.rekey(removed, added);
				if moved {
					debug!(target = "pw.bridge", %added, %removed, "target replaced");
					self.inner.status.set(removed, Indicator::Off);
					self.inner.status.set(added, Indicator::On);
					self.spawn_persist();
				}
			}
			PlatformEvent::Protocol {
				target,
				child_session,
				method,
				params,
			} => self.forward_protocol_event(target, child_session, method, params),
			PlatformEvent::Detached { target, reason } => {
				let relay = self.clone();
				tokio::spawn(async move { relay.on_target_detached(target, reason).await });
			}
		}
	}

	fn on_target_removed(&self, target: TargetId) {
		let removed = {
			let mut state = self.inner.state.lock();
			state.reattach_pending.remove(&target);
			let removed = state.table.remove(target);
			if state
				.locks
				.get(&target)
				.is_some_and(|lock| Arc::strong_count(lock) == 1)
			{
				state.locks.remove(&target);
			}
			removed
		};
		self.inner.status.set(target, Indicator::Off);
		let Some(removed) = removed else {
			return;
		};
		let event = ForwardEvent::detached(
			removed.session.session_id.as_str(),
			Some(&removed.session.protocol_target_id),
			pw_bridge_protocol::frame::reasons::TAB_CLOSED,
		);
		self.forward(event);
		self.spawn_persist();
	}

	fn forward_protocol_event(&self, target: TargetId, child_session: Option<String>, method: String, params: Value) {
		let session_id = {
			let mut state = self.inner.state.lock();
			let Some(session) = state.table.get(target) else {
				return;
			};
			let session_id = session.session_id.clone();
			if let Some(child) = params.get("sessionId").and_then(Value::as_str) {
				match method.as_str() {
					methods::TARGET_ATTACHED => {
						state.table.add_child(target, child);
					}
					methods::TARGET_DETACHED => {
						state.table.remove_child(child);
					}
					_ => {}
				}
			}
			session_id
		};
		let event = ForwardEvent {
			session_id: Some(child_session.unwrap_or_else(|| session_id.to_string())),
			method,
			params,
		};
		self.forward(event);
	}

	/// Best-effort forward of an event to the peer.
	pub(crate) fn forward(&self, event: ForwardEvent) {
		let method = event.method.clone();
		if let Err(err) = self.inner.connection.send_frame(&event.into_frame()) {
			debug!(target = "pw.bridge", method = %method, error = %err, "event not forwarded");
		}
	}

	fn spawn_keepalive(&self) {
		let relay = self.clone();
		tokio::spawn(async move { relay.keepalive().await });
	}

	/// Periodic health pass: attach stray targets and revive the link.
	pub(crate) async fn keepalive(&self) {
		self.refresh_summary();
		if self.inner.settings.load().await.auto_attach_enabled {
			match self.inner.platform.list_targets().await {
				Ok(targets) => {
					for info in targets {
						if self.is_tracked(info.id) || self.inner.options.exclusion.is_excluded(&info.url) {
							continue;
						}
						let relay = self.clone();
						tokio::spawn(async move { relay.auto_attach_target(info.id, Some(info.url)).await });
					}
				}
				Err(err) => debug!(target = "pw.bridge", error = %err, "keepalive target listing failed"),
			}
		}

		let connection = &self.inner.connection;
		if !connection.is_connected() && !connection.is_connecting() && !connection.reconnect_pending() {
			info!(target = "pw.bridge", "keepalive: link down, reconnecting");
			if let Err(err) = connection.ensure_connected().await {
				debug!(target = "pw.bridge", error = %err, "keepalive reconnect failed");
				if !connection.reconnect_pending() {
					connection.schedule_reconnect();
				}
			}
		}
	}

	pub(crate) fn op_lock(&self, target: TargetId) -> Arc<tokio::sync::Mutex<()>> {
		self.inner
			.state
			.lock()
			.locks
			.entry(target)
			.or_default()
			.clone()
	}

	pub(crate) fn is_tracked(&self, target: TargetId) -> bool {
		self.inner.state.lock().table.contains(target)
	}

	pub(crate) fn refresh_summary(&self) {
		let attached = self.inner.state.lock().table.list_connected().len();
		self.inner.status.set_attached(attached);
		self.inner.status.set_phase(self.inner.connection.phase());
	}

	/// Writes the current snapshot. Failures are logged and otherwise ignored.
	pub(crate) async fn persist(&self) {
		let _guard = self.inner.persist_lock.lock().await;
		let snapshot = self.inner.state.lock().table.snapshot();
		self.refresh_summary();
		if let Err(err) = self.inner.store.save(&snapshot).await {
			debug!(target = "pw.bridge", error = %err, "snapshot not saved");
		}
	}

	fn spawn_persist(&self) {
		let relay = self.clone();
		tokio::spawn(async move { relay.persist().await });
	}

	/// Session currently bound to `target`.
	pub fn session_for(&self, target: TargetId) -> Option<SessionId> {
		self.inner
			.state
			.lock()
			.table
			.get(target)
			.map(|s| s.session_id.clone())
	}

	/// Connected sessions in attach order.
	pub fn sessions(&self) -> Vec<(SessionId, TargetId)> {
		self.inner
			.state
			.lock()
			.table
			.list_connected()
			.iter()
			.map(|s| (s.session_id.clone(), s.target))
			.collect()
	}

	pub fn is_reattach_pending(&self, target: TargetId) -> bool {
		self.inner.state.lock().reattach_pending.contains(&target)
	}

	/// Both session indices agree.
	pub fn table_consistent(&self) -> bool {
		self.inner.state.lock().table.is_consistent()
	}

	/// Child sessions recorded for `target`.
	pub fn children_of(&self, target: TargetId) -> Vec<String> {
		self.inner.state.lock().table.children_of(target)
	}
}

async fn tick(interval: &mut Option<Interval>) {
	match interval {
		Some(interval) => {
			interval.tick().await;
		}
		None => std::future::pending().await,
	}
}
