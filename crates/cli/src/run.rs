//! `pw-bridge run`: wires the browser, the stores and the relay together.

use std::sync::Arc;

use anyhow::{Context, Result};
use pw_bridge::{
	AuxiliaryHandler, ExclusionPolicy, FileSnapshotStore, Relay, RelayOptions, RelayParts, Settings, SettingsSource,
	Summary, WsDialer,
};
use tracing::{info, warn};

use crate::cdp::CdpPlatform;
use crate::cli::RunArgs;
use crate::cookies::CookieJar;
use crate::downloads::DownloadManager;
use crate::settings::{FileSettings, Overrides};

/// Builds the settings source for `args`.
pub fn settings_for(args: &RunArgs) -> FileSettings {
	let path = args.settings.clone().unwrap_or_else(FileSettings::default_path);
	FileSettings::new(
		path,
		Overrides {
			relay_port: args.relay_port,
			shared_secret: args.secret.clone(),
			auto_attach_enabled: args.no_auto_attach.then_some(false),
		},
	)
}

/// Keeps the relay's own HTTP surface out of every attach path.
pub fn exclusion_for(settings: &Settings) -> ExclusionPolicy {
	ExclusionPolicy::new().with_admin_url(settings.relay_base())
}

pub async fn run(args: RunArgs) -> Result<()> {
	let settings = Arc::new(settings_for(&args));
	let initial = settings.load().await;
	if initial.secret().is_none() {
		warn!(
			target = "pw.bridge",
			path = %settings.path().display(),
			"no shared secret configured; the relay link stays down until one is set"
		);
	}

	let (platform, platform_events) = CdpPlatform::connect(args.cdp_port)
		.await
		.with_context(|| format!("failed to reach the browser on debugging port {}", args.cdp_port))?;

	let store_path = args.state_file.clone().unwrap_or_else(FileSnapshotStore::default_path);
	let auxiliary: Vec<Arc<dyn AuxiliaryHandler>> = vec![
		Arc::new(CookieJar::new(platform.clone())),
		Arc::new(DownloadManager::new(settings.clone())),
	];
	let relay = Relay::new(RelayParts {
		platform: platform.clone(),
		settings,
		store: Arc::new(FileSnapshotStore::new(&store_path)),
		dialer: Arc::new(WsDialer::new()),
		auxiliary,
		options: RelayOptions {
			exclusion: exclusion_for(&initial),
			..RelayOptions::default()
		},
	});

	info!(
		target = "pw.bridge",
		relay = %initial.relay_base(),
		cdp_port = args.cdp_port,
		state = %store_path.display(),
		"bridge starting"
	);
	let handle = relay.start(platform_events);
	let mut status = relay.status();
	let mut last_summary = None;

	loop {
		tokio::select! {
			signal = tokio::signal::ctrl_c() => {
				signal.context("failed to listen for ctrl-c")?;
				info!(target = "pw.bridge", "interrupted, shutting down");
				break;
			}
			_ = platform.closed() => {
				warn!(target = "pw.bridge", "browser went away, shutting down");
				break;
			}
			Ok(()) = status.changed() => {
				let (summary, attached) = {
					let snapshot = status.borrow_and_update();
					(snapshot.summary(), snapshot.attached)
				};
				if last_summary != Some(summary) {
					last_summary = Some(summary);
					info!(target = "pw.bridge", summary = summary_label(summary), attached, "status");
				}
			}
		}
	}

	relay.shutdown();
	handle.await.context("relay task failed")?;
	Ok(())
}

fn summary_label(summary: Summary) -> &'static str {
	match summary {
		Summary::Offline => "offline",
		Summary::Idle => "idle",
		Summary::Active => "active",
	}
}
