use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::MakeWriterExt;

pub fn init_logging(verbosity: u8) {
	// 0 = lifecycle only (attach/detach, link state)
	// 1 (-v) = relay debug, quiet transport
	// 2+ (-vv) = everything, including the websocket stack
	let filter = match verbosity {
		0 => "warn,pw_bridge=info,pw_bridge_cli=info",
		1 => "info,pw_bridge=debug,pw_bridge_cli=debug",
		_ => "debug",
	};

	let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

	let stderr = std::io::stderr.with_max_level(tracing::Level::TRACE);

	tracing_subscriber::fmt()
		.with_env_filter(env_filter)
		.with_writer(stderr)
		.with_target(true)
		.with_level(true)
		.compact()
		.init();
}
