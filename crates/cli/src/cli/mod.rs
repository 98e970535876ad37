#[cfg(test)]
mod tests;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Relays a browser's debugging protocol to a control websocket.
#[derive(Parser, Debug)]
#[command(name = "pw-bridge")]
#[command(about = "Session relay between a Chromium debugging port and a relay server")]
#[command(version)]
pub struct Cli {
	/// Increase verbosity (-v debug for the relay, -vv everything)
	#[arg(short, long, global = true, action = clap::ArgAction::Count)]
	pub verbose: u8,

	#[command(subcommand)]
	pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
	/// Attach to the browser and relay until interrupted.
	Run(RunArgs),
	/// Print the token derived from a secret for a relay port.
	Token(TokenArgs),
}

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
	/// Relay server port on loopback (overrides the settings file).
	#[arg(long, value_name = "PORT")]
	pub relay_port: Option<u16>,

	/// Shared secret the relay token is derived from.
	#[arg(long, env = "PW_BRIDGE_SECRET", hide_env_values = true)]
	pub secret: Option<String>,

	/// Chromium remote-debugging port.
	#[arg(long, value_name = "PORT", default_value_t = 9222)]
	pub cdp_port: u16,

	/// Settings file (default: $XDG_CONFIG_HOME/pw/bridge/settings.json).
	#[arg(long, value_name = "FILE")]
	pub settings: Option<PathBuf>,

	/// Only attach on explicit `Tab.attachAll` / `Target.createTarget`.
	#[arg(long)]
	pub no_auto_attach: bool,

	/// Session snapshot file (default: $XDG_RUNTIME_DIR/pw-bridge/sessions.json).
	#[arg(long, value_name = "FILE")]
	pub state_file: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct TokenArgs {
	#[arg(long, env = "PW_BRIDGE_SECRET", hide_env_values = true)]
	pub secret: String,

	/// Relay server port the token is bound to.
	#[arg(long, value_name = "PORT")]
	pub port: Option<u16>,
}
