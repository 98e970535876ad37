//! Wire types for the pw-bridge control connection.
//!
//! The bridge speaks a small JSON envelope protocol with the relay peer:
//!
//! - request `{id, method, params}`
//! - response `{id, result}` or `{id, error}`
//! - notification `{method, params}` (keepalive ping/pong and forwarded
//!   target events)
//!
//! Target-protocol traffic travels inside `forwardCDPCommand` requests and
//! `forwardCDPEvent` notifications. The gateway handshake uses its own
//! `type`-tagged frames, see [`gateway`].
//!
//! # Main Types
//!
//! - [`Inbound`] - classification of a frame received from the peer
//! - [`ForwardCommand`] - target-protocol command addressed by session or target
//! - [`ForwardEvent`] - target-protocol event forwarded to the peer
//! - [`PersistedState`] - durable session table snapshot
//! - [`StatusReport`] - payload of the `Tab.getStatus` command

pub mod cookie;
pub mod frame;
pub mod gateway;
pub mod snapshot;
pub mod status;

pub use cookie::{CdpCookie, CdpCookieParam, CookieDetails, ExtensionCookie};
pub use frame::{ForwardCommand, ForwardEvent, Inbound, methods};
pub use gateway::GatewayFrame;
pub use snapshot::{PersistedState, SnapshotRecord};
pub use status::{LinkState, StatusReport, TabSummary};
