//! Payloads of the relay-native `Tab.*` commands.

use serde::{Deserialize, Serialize};

/// State of the control connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
	#[default]
	Disconnected,
	Connecting,
	Connected,
}

impl std::fmt::Display for LinkState {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.write_str(match self {
			LinkState::Disconnected => "disconnected",
			LinkState::Connecting => "connecting",
			LinkState::Connected => "connected",
		})
	}
}

/// One attached target, as listed by `Tab.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabSummary {
	pub tab_id: u64,
	pub session_id: String,
	pub target_id: String,
	pub url: String,
	pub title: String,
	pub status: String,
	/// Milliseconds since the Unix epoch, `0` when unknown (rehydrated).
	pub attached_at: u64,
}

/// Result of `Tab.getStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
	pub ws_state: LinkState,
	pub attached_count: usize,
	pub tabs: Vec<TabSummary>,
	/// Milliseconds since the bridge started.
	pub uptime: u64,
}
