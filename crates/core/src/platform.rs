//! The host's collection of debuggable targets.
//!
//! The relay never talks to a browser directly. It drives a [`TargetPlatform`]
//! and consumes [`PlatformEvent`]s from a channel the platform feeds.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Host-local identifier of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetId(pub u64);

impl std::fmt::Display for TargetId {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl From<u64> for TargetId {
	fn from(id: u64) -> Self {
		Self(id)
	}
}

/// What the host knows about a target right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetInfo {
	pub id: TargetId,
	pub url: String,
	pub title: String,
}

/// Why the debugger left a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetachReason {
	/// The user dismissed the debugging session.
	CanceledByUser,
	/// A developer tools window took over the target.
	ReplacedWithDevtools,
	/// The target was closed.
	TargetClosed,
	/// Any other, presumably transient, reason (typically navigation).
	Other(String),
}

impl DetachReason {
	pub fn parse(reason: &str) -> Self {
		match reason {
			"canceled_by_user" => DetachReason::CanceledByUser,
			"replaced_with_devtools" => DetachReason::ReplacedWithDevtools,
			"target_closed" => DetachReason::TargetClosed,
			other => DetachReason::Other(other.to_string()),
		}
	}

	pub fn as_str(&self) -> &str {
		match self {
			DetachReason::CanceledByUser => "canceled_by_user",
			DetachReason::ReplacedWithDevtools => "replaced_with_devtools",
			DetachReason::TargetClosed => "target_closed",
			DetachReason::Other(reason) => reason,
		}
	}

	/// Permanent reasons are honored; anything else triggers reattachment.
	pub fn is_permanent(&self) -> bool {
		matches!(
			self,
			DetachReason::CanceledByUser | DetachReason::ReplacedWithDevtools
		)
	}
}

/// Lifecycle and protocol notifications from the host.
#[derive(Debug, Clone, PartialEq)]
pub enum PlatformEvent {
	Created(TargetInfo),
	Updated {
		target: TargetId,
		url: Option<String>,
		title: Option<String>,
		/// The target started loading a new document.
		loading: bool,
	},
	Removed(TargetId),
	/// The host swapped one target for another (prerender, discard).
	Replaced { added: TargetId, removed: TargetId },
	/// Target-protocol event emitted by an attached target.
	Protocol {
		target: TargetId,
		/// Child session the event belongs to, if not the main session.
		child_session: Option<String>,
		method: String,
		params: Value,
	},
	/// The debugger detached from a target.
	Detached { target: TargetId, reason: DetachReason },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
	#[error("no target with id {0}")]
	NoSuchTarget(u64),

	#[error("debugger is not attached to target {0}")]
	NotAttached(u64),

	/// Error reply of a target-protocol command.
	#[error("{0}")]
	Protocol(String),

	#[error("platform unavailable: {0}")]
	Unavailable(String),
}

impl PlatformError {
	pub fn is_target_gone(&self) -> bool {
		matches!(self, PlatformError::NoSuchTarget(_))
	}
}

/// Enumerable set of attachable targets.
#[async_trait]
pub trait TargetPlatform: Send + Sync {
	async fn list_targets(&self) -> Result<Vec<TargetInfo>, PlatformError>;

	/// `Ok(None)` when the target no longer exists.
	async fn get_target(&self, target: TargetId) -> Result<Option<TargetInfo>, PlatformError>;

	async fn attach(&self, target: TargetId) -> Result<(), PlatformError>;

	async fn detach(&self, target: TargetId) -> Result<(), PlatformError>;

	/// Sends a target-protocol command, optionally into a child session.
	async fn send_command(
		&self,
		target: TargetId,
		child_session: Option<&str>,
		method: &str,
		params: Option<Value>,
	) -> Result<Value, PlatformError>;

	async fn create_target(&self, url: &str) -> Result<TargetId, PlatformError>;

	async fn close_target(&self, target: TargetId) -> Result<(), PlatformError>;

	/// Brings the target to the foreground.
	async fn activate_target(&self, target: TargetId) -> Result<(), PlatformError>;
}
