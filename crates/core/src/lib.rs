//! Session relay core.
//!
//! Relays a CDP-style debugging protocol between one control websocket and
//! any number of debug targets living in a host (browser tabs, typically).
//!
//! # Main Types
//!
//! - [`Relay`] - owns the session table and drives attachment, routing and
//!   rehydration
//! - [`ConnectionManager`] - the control link with single-flight connect and
//!   backoff reconnect
//! - [`SessionTable`] - bidirectional session id / target mapping
//! - [`TargetPlatform`] - the host's targets, consumed as a trait
//!
//! Collaborators are traits ([`SettingsSource`], [`SnapshotStore`],
//! [`AuxiliaryHandler`], [`Dialer`]) so hosts plug in their own storage,
//! resource handlers and transports.

pub mod auxiliary;
pub mod backoff;
pub mod config;
pub mod connection;
pub mod error;
pub mod platform;
pub mod policy;
pub mod relay;
pub mod session;
pub mod store;
pub mod token;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use auxiliary::{AuxiliaryError, AuxiliaryHandler};
pub use backoff::BackoffPolicy;
pub use config::{Settings, SettingsSource, StaticSettings};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionOptions, ConnectionPhase, Dialer, WsDialer};
pub use error::{ConnectError, Error, ErrorKind, Result};
pub use platform::{DetachReason, PlatformError, PlatformEvent, TargetId, TargetInfo, TargetPlatform};
pub use policy::ExclusionPolicy;
pub use relay::{AttachOptions, Attached, Indicator, Relay, RelayOptions, RelayParts, StatusSnapshot, Summary};
pub use session::{Session, SessionId, SessionState, SessionTable};
pub use store::{FileSnapshotStore, MemorySnapshotStore, SnapshotStore, StoreError};
pub use token::derive_token;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
	std::time::SystemTime::now()
		.duration_since(std::time::UNIX_EPOCH)
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}
