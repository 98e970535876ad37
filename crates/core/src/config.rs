//! Relay settings and the source they are read from.

use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default port of the relay peer on loopback.
pub const DEFAULT_RELAY_PORT: u16 = 18792;

/// User-editable settings. The core only ever reads them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
	pub relay_port: u16,
	/// Empty means "not configured".
	pub shared_secret: String,
	pub auto_attach_enabled: bool,
	/// Target directory of `Download.start`; empty selects the user's download dir.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub download_directory: Option<PathBuf>,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			relay_port: DEFAULT_RELAY_PORT,
			shared_secret: String::new(),
			auto_attach_enabled: true,
			download_directory: None,
		}
	}
}

impl Settings {
	/// The trimmed secret, if one is configured.
	pub fn secret(&self) -> Option<&str> {
		Some(self.shared_secret.trim()).filter(|s| !s.is_empty())
	}

	/// Port to dial, falling back to the default for an unset (zero) port.
	pub fn port(&self) -> u16 {
		if self.relay_port == 0 {
			DEFAULT_RELAY_PORT
		} else {
			self.relay_port
		}
	}

	/// Loopback base URL of the relay peer.
	pub fn relay_base(&self) -> String {
		format!("http://127.0.0.1:{}/", self.port())
	}
}

/// Where settings come from.
///
/// Read on every connect attempt and auto-attach sweep so edits apply without
/// a restart.
#[async_trait]
pub trait SettingsSource: Send + Sync {
	async fn load(&self) -> Settings;
}

/// Fixed in-memory settings, replaceable at runtime.
#[derive(Debug, Default)]
pub struct StaticSettings {
	inner: Mutex<Settings>,
}

impl StaticSettings {
	pub fn new(settings: Settings) -> Self {
		Self {
			inner: Mutex::new(settings),
		}
	}

	pub fn set(&self, settings: Settings) {
		*self.inner.lock() = settings;
	}

	pub fn update(&self, f: impl FnOnce(&mut Settings)) {
		f(&mut self.inner.lock());
	}
}

#[async_trait]
impl SettingsSource for StaticSettings {
	async fn load(&self) -> Settings {
		self.inner.lock().clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_apply_to_missing_fields() {
		let settings: Settings = serde_json::from_str(r#"{"sharedSecret": " s3cret "}"#).unwrap();
		assert_eq!(settings.relay_port, DEFAULT_RELAY_PORT);
		assert!(settings.auto_attach_enabled);
		assert_eq!(settings.secret(), Some("s3cret"));
	}

	#[test]
	fn blank_secret_is_unset() {
		let settings = Settings {
			shared_secret: "   ".into(),
			..Settings::default()
		};
		assert_eq!(settings.secret(), None);
	}

	#[test]
	fn zero_port_uses_default() {
		let settings = Settings {
			relay_port: 0,
			..Settings::default()
		};
		assert_eq!(settings.relay_base(), "http://127.0.0.1:18792/");
	}
}
