//! `Download.*` commands: fetches files into the download directory.
//!
//! Downloads run as spawned tasks writing straight to their final path.
//! Progress lives in a ledger shared with the handler, so `getStatus` and
//! `list` observe it while the transfer runs.


use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use parking_lot::Mutex;
use pw_bridge::auxiliary::{opt_str, require_str, require_u64};
use pw_bridge::{AuxiliaryError, AuxiliaryHandler, SettingsSource};
use reqwest::Url;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Lifecycle of a download, named as the peer expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadState {
	InProgress,
	Complete,
	Interrupted,
}

/// Reason codes of interrupted downloads.
pub mod reason {
	pub const NETWORK_FAILED: &str = "NETWORK_FAILED";
	pub const SERVER_FAILED: &str = "SERVER_FAILED";
	pub const FILE_FAILED: &str = "FILE_FAILED";
	pub const USER_CANCELED: &str = "USER_CANCELED";
}

/// A download as reported by `Download.list` and `Download.getStatus`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadItem {
	pub id: u64,
	pub url: String,
	pub filename: String,
	pub state: DownloadState,
	pub bytes_received: u64,
	/// `-1` while the size is unknown.
	pub total_bytes: i64,
	pub start_time: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub end_time: Option<DateTime<Utc>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error: Option<String>,
}

struct Entry {
	item: DownloadItem,
	path: PathBuf,
	task: Option<AbortHandle>,
}

#[derive(Default)]
struct Ledger {
	last_id: u64,
	entries: Vec<Entry>,
}

impl Ledger {
	fn get_mut(&mut self, id: u64) -> Option<&mut Entry> {
		self.entries.iter_mut().find(|e| e.item.id == id)
	}

	fn finish(&mut self, id: u64, state: DownloadState, error: Option<&str>) {
		if let Some(entry) = self.get_mut(id) {
			if entry.item.state != DownloadState::InProgress {
				return;
			}
			entry.item.state = state;
			entry.item.error = error.map(str::to_string);
			entry.item.end_time = Some(Utc::now());
			entry.task = None;
		}
	}
}

type Opener = dyn Fn(&Path) -> std::io::Result<()> + Send + Sync;

/// Serves `Download.start`, `list`, `getStatus`, `cancel` and `open`.
pub struct DownloadManager {
	settings: Arc<dyn SettingsSource>,
	http: reqwest::Client,
	ledger: Arc<Mutex<Ledger>>,
	opener: Box<Opener>,
}

impl DownloadManager {
	pub fn new(settings: Arc<dyn SettingsSource>) -> Self {
		Self {
			settings,
			http: reqwest::Client::new(),
			ledger: Arc::new(Mutex::new(Ledger::default())),
			opener: Box::new(open_with_system),
		}
	}

	/// Replaces the system file opener used by `Download.open`.
	pub fn with_opener(mut self, opener: impl Fn(&Path) -> std::io::Result<()> + Send + Sync + 'static) -> Self {
		self.opener = Box::new(opener);
		self
	}

	async fn directory(&self) -> PathBuf {
		self.settings
			.load()
			.await
			.download_directory
			.filter(|dir| !dir.as_os_str().is_empty())
			.or_else(dirs::download_dir)
			.unwrap_or_else(|| std::env::temp_dir().join("pw-bridge-downloads"))
	}

	async fn start(&self, url: &str, filename: Option<&str>) -> Result<u64, AuxiliaryError> {
		let parsed = Url::parse(url).map_err(|_| AuxiliaryError::Failed(format!("Invalid URL: {url}")))?;
		let name = match filename {
			Some(name) => sanitize(name).ok_or_else(|| AuxiliaryError::Failed(format!("Invalid filename: {name}")))?,
			None => PathBuf::from(suggested_name(&parsed)),
		};
		let dir = self.directory().await;
		let path = unique_path(&dir.join(name));
		if let Some(parent) = path.parent() {
			tokio::fs::create_dir_all(parent)
				.await
				.map_err(|e| AuxiliaryError::Failed(format!("cannot create {}: {e}", parent.display())))?;
		}

		let id = {
			let mut ledger = self.ledger.lock();
			ledger.last_id += 1;
			let id = ledger.last_id;
			ledger.entries.push(Entry {
				item: DownloadItem {
					id,
					url: url.to_string(),
					filename: path.display().to_string(),
					state: DownloadState::InProgress,
					bytes_received: 0,
					total_bytes: -1,
					start_time: Utc::now(),
					end_time: None,
					error: None,
				},
				path: path.clone(),
				task: None,
			});
			id
		};
		info!(target = "pw.bridge.downloads", id, url, path = %path.display(), "download started");

		let task = tokio::spawn(transfer(self.http.clone(), Arc::clone(&self.ledger), id, parsed, path));
		let mut ledger = self.ledger.lock();
		if let Some(entry) = ledger.get_mut(id) {
			if entry.item.state == DownloadState::InProgress {
				entry.task = Some(task.abort_handle());
			}
		}
		Ok(id)
	}

	fn list(&self, limit: Option<u64>) -> Vec<DownloadItem> {
		let ledger = self.ledger.lock();
		let newest_first = ledger.entries.iter().rev().map(|entry| DownloadItem {
			error: None,
			..entry.item.clone()
		});
		match limit.filter(|&n| n > 0) {
			Some(n) => newest_first.take(n as usize).collect(),
			None => newest_first.collect(),
		}
	}

	fn status(&self, id: u64) -> Result<DownloadItem, AuxiliaryError> {
		let mut ledger = self.ledger.lock();
		ledger
			.get_mut(id)
			.map(|entry| entry.item.clone())
			.ok_or_else(not_found)
	}

	async fn cancel(&self, id: u64) -> Result<(), AuxiliaryError> {
		let path = {
			let mut ledger = self.ledger.lock();
			let entry = ledger.get_mut(id).ok_or_else(not_found)?;
			if entry.item.state != DownloadState::InProgress {
				return Ok(());
			}
			if let Some(task) = entry.task.take() {
				task.abort();
			}
			let path = entry.path.clone();
			ledger.finish(id, DownloadState::Interrupted, Some(reason::USER_CANCELED));
			path
		};
		if let Err(err) = tokio::fs::remove_file(&path).await {
			debug!(target = "pw.bridge.downloads", id, error = %err, "partial file not removed");
		}
		info!(target = "pw.bridge.downloads", id, "download canceled");
		Ok(())
	}

	fn open(&self, id: u64) -> Result<(), AuxiliaryError> {
		let path = {
			let mut ledger = self.ledger.lock();
			let entry = ledger.get_mut(id).ok_or_else(not_found)?;
			if entry.item.state != DownloadState::Complete {
				return Err(AuxiliaryError::Failed("Download must be complete".to_string()));
			}
			entry.path.clone()
		};
		(self.opener)(&path).map_err(|e| AuxiliaryError::Failed(format!("cannot open {}: {e}", path.display())))
	}
}

#[async_trait]
impl AuxiliaryHandler for DownloadManager {
	fn prefix(&self) -> &'static str {
		"Download."
	}

	async fn handle(&self, method: &str, params: Option<Value>) -> Result<Value, AuxiliaryError> {
		let params = params.as_ref();
		match method {
			"Download.start" => {
				let url = require_str(method, params, "url")?;
				if params.and_then(|p| p.get("saveAs")).and_then(Value::as_bool) == Some(true) {
					debug!(target = "pw.bridge.downloads", "saveAs has no dialog here; saving to the download directory");
				}
				let id = self.start(url, opt_str(params, "filename")).await?;
				Ok(json!({ "downloadId": id }))
			}
			"Download.list" => {
				let limit = params.and_then(|p| p.get("limit")).and_then(Value::as_u64);
				Ok(json!(self.list(limit)))
			}
			"Download.getStatus" => Ok(json!(self.status(require_u64(method, params, "downloadId")?)?)),
			"Download.cancel" => {
				self.cancel(require_u64(method, params, "downloadId")?).await?;
				Ok(json!({ "success": true }))
			}
			"Download.open" => {
				self.open(require_u64(method, params, "downloadId")?)?;
				Ok(json!({ "success": true }))
			}
			other => Err(AuxiliaryError::UnknownCommand {
				family: "download",
				method: other.to_string(),
			}),
		}
	}
}

async fn transfer(http: reqwest::Client, ledger: Arc<Mutex<Ledger>>, id: u64, url: Url, path: PathBuf) {
	let outcome = fetch_into(&http, &ledger, id, url, &path).await;
	let mut ledger = ledger.lock();
	match outcome {
		Ok(()) => {
			ledger.finish(id, DownloadState::Complete, None);
			info!(target = "pw.bridge.downloads", id, "download complete");
		}
		Err(code) => {
			ledger.finish(id, DownloadState::Interrupted, Some(code));
			warn!(target = "pw.bridge.downloads", id, reason = code, "download interrupted");
		}
	}
}

async fn fetch_into(
	http: &reqwest::Client,
	ledger: &Mutex<Ledger>,
	id: u64,
	url: Url,
	path: &Path,
) -> Result<(), &'static str> {
	let response = http.get(url).send().await.map_err(|_| reason::NETWORK_FAILED)?;
	if !response.status().is_success() {
		return Err(reason::SERVER_FAILED);
	}
	if let Some(total) = response.content_length() {
		if let Some(entry) = ledger.lock().get_mut(id) {
			entry.item.total_bytes = total as i64;
		}
	}

	let mut file = tokio::fs::File::create(path).await.map_err(|_| reason::FILE_FAILED)?;
	let mut body = response.bytes_stream();
	while let Some(chunk) = body.next().await {
		let chunk = chunk.map_err(|_| reason::NETWORK_FAILED)?;
		file.write_all(&chunk).await.map_err(|_| reason::FILE_FAILED)?;
		if let Some(entry) = ledger.lock().get_mut(id) {
			entry.item.bytes_received += chunk.len() as u64;
		}
	}
	file.flush().await.map_err(|_| reason::FILE_FAILED)
}

fn not_found() -> AuxiliaryError {
	AuxiliaryError::NotFound("Download not found".to_string())
}

/// Relative path below the download directory, or `None` if `name` would
/// escape it.
fn sanitize(name: &str) -> Option<PathBuf> {
	let path = Path::new(name);
	let clean = path.components().all(|c| matches!(c, Component::Normal(_)));
	(clean && !name.is_empty()).then(|| path.to_path_buf())
}

/// Last path segment of `url`, or `download`.
fn suggested_name(url: &Url) -> String {
	url.path_segments()
		.and_then(|mut segments| segments.next_back())
		.filter(|s| !s.is_empty())
		.map(str::to_string)
		.unwrap_or_else(|| "download".to_string())
}

/// `path`, or `name (n).ext` for the first `n` not already taken.
fn unique_path(path: &Path) -> PathBuf {
	if !path.exists() {
		return path.to_path_buf();
	}
	let stem = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
	let ext = path.extension().map(|e| format!(".{}", e.to_string_lossy())).unwrap_or_default();
	(1..)
		.map(|n| path.with_file_name(format!("{stem} ({n}){ext}")))
		.find(|candidate| !candidate.exists())
		.unwrap_or_else(|| path.to_path_buf())
}

fn open_with_system(path: &Path) -> std::io::Result<()> {
	#[cfg(target_os = "macos")]
	let mut command = std::process::Command::new("open");
	#[cfg(windows)]
	let mut command = {
		let mut command = std::process::Command::new("cmd");
		command.args(["/C", "start", ""]);
		command
	};
	#[cfg(not(any(target_os = "macos", windows)))]
	let mut command = std::process::Command::new("xdg-open");

	command.arg(path).spawn().map(|_| ())
}
