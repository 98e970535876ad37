//! Settings file with command-line overrides.
//!
//! The file is re-read on every [`SettingsSource::load`], so edits take
//! effect on the next connect attempt or sweep without restarting.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use pw_bridge::{Settings, SettingsSource};
use tracing::debug;

/// Values given on the command line; they win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
	pub relay_port: Option<u16>,
	pub shared_secret: Option<String>,
	pub auto_attach_enabled: Option<bool>,
}

impl Overrides {
	fn apply(&self, settings: &mut Settings) {
		if let Some(port) = self.relay_port {
			settings.relay_port = port;
		}
		if let Some(secret) = &self.shared_secret {
			settings.shared_secret = secret.clone();
		}
		if let Some(enabled) = self.auto_attach_enabled {
			settings.auto_attach_enabled = enabled;
		}
	}
}

/// [`SettingsSource`] backed by a JSON file.
#[derive(Debug, Clone)]
pub struct FileSettings {
	path: PathBuf,
	overrides: Overrides,
}

impl FileSettings {
	pub fn new(path: impl Into<PathBuf>, overrides: Overrides) -> Self {
		Self {
			path: path.into(),
			overrides,
		}
	}

	/// `$XDG_CONFIG_HOME/pw/bridge/settings.json`, or `~/.config/...`.
	pub fn default_path() -> PathBuf {
		std::env::var_os("XDG_CONFIG_HOME")
			.map(PathBuf::from)
			.or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
			.unwrap_or_else(|| PathBuf::from("."))
			.join("pw/bridge/settings.json")
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// Settings as currently on disk, overrides applied.
	pub fn read(&self) -> Settings {
		let mut settings = load_json::<Settings>(&self.path).unwrap_or_default();
		self.overrides.apply(&mut settings);
		settings
	}

	/// Writes `settings` to the file, creating parent directories.
	pub fn save(&self, settings: &Settings) -> std::io::Result<()> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent)?;
		}
		let content = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
		fs::write(&self.path, content)
	}
}

#[async_trait]
impl SettingsSource for FileSettings {
	async fn load(&self) -> Settings {
		self.read()
	}
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Option<T> {
	let content = fs::read_to_string(path).ok()?;
	match serde_json::from_str(&content) {
		Ok(value) => Some(value),
		Err(err) => {
			debug!(target = "pw.bridge", path = %path.display(), error = %err, "ignoring malformed settings file");
			None
		}
	}
}
