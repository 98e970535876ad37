//! Error types for the relay core.

use thiserror::Error;

use crate::auxiliary::AuxiliaryError;
use crate::platform::PlatformError;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a connection attempt to the relay peer failed.
///
/// Cloneable because a single in-flight attempt is shared by every caller
/// awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectError {
	/// No shared secret configured; reconnect halts until one is provided.
	#[error("relay shared secret is not configured")]
	MissingCredential,

	#[error("relay server not reachable at {base}: {reason}")]
	Unreachable { base: String, reason: String },

	#[error("{stage} timed out")]
	Timeout { stage: &'static str },

	/// Handshake refused by the peer or its gateway.
	#[error("relay rejected the connection: {0}")]
	Rejected(String),

	#[error("relay connection closed during connect")]
	Closed,
}

impl ConnectError {
	/// Whether scheduling another attempt can help.
	pub fn is_retryable(&self) -> bool {
		!matches!(self, ConnectError::MissingCredential)
	}
}

/// Errors produced by the relay core.
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Connect(#[from] ConnectError),

	/// A send was attempted while the control link is down.
	#[error("relay not connected")]
	NotConnected,

	/// The control link dropped while a request was pending.
	#[error("relay disconnected: {0}")]
	Disconnected(String),

	#[error("relay request timed out after {ms}ms: {method}")]
	RequestTimeout { method: String, ms: u64 },

	/// Error reply from the peer.
	#[error("{0}")]
	Remote(String),

	#[error("No attached tab for method {0}")]
	NoAttachedTarget(String),

	#[error("target {0} no longer exists")]
	TargetGone(String),

	#[error("target {0} is excluded from attachment")]
	Excluded(String),

	#[error(transparent)]
	Platform(#[from] PlatformError),

	#[error(transparent)]
	Auxiliary(#[from] AuxiliaryError),

	#[error("invalid command: {0}")]
	InvalidCommand(String),

	#[error("Target.getTargetInfo returned no targetId")]
	MissingTargetId,

	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),
}

/// Coarse classification driving recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
	/// Retried through reconnect.
	Connectivity,
	/// Halts reconnect until configuration changes.
	Credential,
	/// The session is pruned.
	TargetGone,
	/// Reported to the peer as an error reply.
	Command,
	Internal,
}

impl Error {
	pub fn kind(&self) -> ErrorKind {
		match self {
			Error::Connect(ConnectError::MissingCredential) => ErrorKind::Credential,
			Error::Connect(_)
			| Error::NotConnected
			| Error::Disconnected(_)
			| Error::RequestTimeout { .. } => ErrorKind::Connectivity,
			Error::TargetGone(_) => ErrorKind::TargetGone,
			Error::Platform(err) if err.is_target_gone() => ErrorKind::TargetGone,
			Error::Remote(_)
			| Error::NoAttachedTarget(_)
			| Error::Excluded(_)
			| Error::Platform(_)
			| Error::Auxiliary(_)
			| Error::InvalidCommand(_)
			| Error::MissingTargetId => ErrorKind::Command,
			Error::Io(_) | Error::Json(_) => ErrorKind::Internal,
		}
	}

	/// Returns true if the target behind the failed operation is gone.
	pub fn is_target_gone(&self) -> bool {
		self.kind() == ErrorKind::TargetGone
	}
}
