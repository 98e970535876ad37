//! Durable snapshot of the session table.

use serde::{Deserialize, Serialize};

/// One connected session as persisted between process restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
	/// Local target identifier.
	pub tab_id: u64,
	/// Relay-visible session id.
	pub session_id: String,
	/// Target-protocol identifier of the target.
	pub target_id: String,
	/// Allocation sequence number of the session id.
	#[serde(default)]
	pub attach_order: u64,
}

/// Everything the bridge persists: connected sessions plus the id counter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
	#[serde(default)]
	pub persisted_tabs: Vec<SnapshotRecord>,
	/// Next session sequence number to hand out.
	#[serde(default)]
	pub next_session: u64,
}

impl PersistedState {
	pub fn is_empty(&self) -> bool {
		self.persisted_tabs.is_empty()
	}
}
