//! Durable snapshot storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use pw_bridge_protocol::PersistedState;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("snapshot I/O failed for {path}: {source}")]
	Io {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("snapshot is not valid JSON: {0}")]
	Json(#[from] serde_json::Error),
}

/// Storage that survives a restart of the host process.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
	/// `Ok(None)` when nothing was saved yet.
	async fn load(&self) -> Result<Option<PersistedState>, StoreError>;

	async fn save(&self, state: &PersistedState) -> Result<(), StoreError>;
}

/// Process-local store, for tests and ephemeral hosts.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
	state: Mutex<Option<PersistedState>>,
}

impl MemorySnapshotStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_state(state: PersistedState) -> Self {
		Self {
			state: Mutex::new(Some(state)),
		}
	}

	/// Last saved state.
	pub fn current(&self) -> Option<PersistedState> {
		self.state.lock().clone()
	}
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
	async fn load(&self) -> Result<Option<PersistedState>, StoreError> {
		Ok(self.state.lock().clone())
	}

	async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
		*self.state.lock() = Some(state.clone());
		Ok(())
	}
}

/// JSON file store.
///
/// Writes go to a sibling temp file first and are renamed into place.
#[derive(Debug, Clone)]
pub struct FileSnapshotStore {
	path: PathBuf,
}

impl FileSnapshotStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	/// `$XDG_RUNTIME_DIR/pw-bridge/sessions.json`, falling back to the temp dir.
	///
	/// The runtime dir is cleared on logout or reboot, so stale sessions from
	/// an earlier boot are never rehydrated.
	pub fn default_path() -> PathBuf {
		std::env::var_os("XDG_RUNTIME_DIR")
			.map(PathBuf::from)
			.unwrap_or_else(std::env::temp_dir)
			.join("pw-bridge")
			.join("sessions.json")
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	fn io_err(&self, source: std::io::Error) -> StoreError {
		StoreError::Io {
			path: self.path.clone(),
			source,
		}
	}
}

#[async_trait]
impl SnapshotStore for FileSnapshotStore {
	async fn load(&self) -> Result<Option<PersistedState>, StoreError> {
		let content = match tokio::fs::read_to_string(&self.path).await {
			Ok(content) => content,
			Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(err) => return Err(self.io_err(err)),
		};
		Ok(Some(serde_json::from_str(&content)?))
	}

	async fn save(&self, state: &PersistedState) -> Result<(), StoreError> {
		if let Some(parent) = self.path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|e| self.io_err(e))?;
		}
		let tmp = self.path.with_extension("json.tmp");
		tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?)
			.await
			.map_err(|e| self.io_err(e))?;
		tokio::fs::rename(&tmp, &self.path)
			.await
			.map_err(|e| self.io_err(e))
	}
}

#[cfg(test)]
mod tests {
	use pw_bridge_protocol::SnapshotRecord;
	use tempfile::TempDir;

	use super::*;

	fn sample() -> PersistedState {
		PersistedState {
			persisted_tabs: vec![SnapshotRecord {
				tab_id: 11,
				session_id: "pw-tab-3".into(),
				target_id: "T11".into(),
				attach_order: 3,
			}],
			next_session: 4,
		}
	}

	#[tokio::test]
	async fn file_store_missing_file_is_empty() {
		let tmp = TempDir::new().unwrap();
		let store = FileSnapshotStore::new(tmp.path().join("nope.json"));
		assert!(store.load().await.unwrap().is_none());
	}

	#[tokio::test]
	async fn file_store_save_then_load() {
		let tmp = TempDir::new().unwrap();
		let store = FileSnapshotStore::new(tmp.path().join("nested/sessions.json"));
		store.save(&sample()).await.unwrap();
		assert_eq!(store.load().await.unwrap(), Some(sample()));
		assert!(!tmp.path().join("nested/sessions.json.tmp").exists());
	}

	#[tokio::test]
	async fn file_store_rejects_garbage() {
		let tmp = TempDir::new().unwrap();
		let path = tmp.path().join("sessions.json");
		std::fs::write(&path, "{not json").unwrap();
		let store = FileSnapshotStore::new(&path);
		assert!(matches!(store.load().await, Err(StoreError::Json(_))));
	}

	#[tokio::test]
	async fn memory_store_keeps_last_save() {
		let store = MemorySnapshotStore::new();
		assert!(store.load().await.unwrap().is_none());
		store.save(&sample()).await.unwrap();
		assert_eq!(store.current(), Some(sample()));
	}
}
