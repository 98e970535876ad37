use anyhow::Result;
use clap::Parser;
use pw_bridge::{Settings, derive_token};
use pw_bridge_cli::cli::{Cli, Commands};
use pw_bridge_cli::{logging, run};

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	match cli.command {
		Commands::Run(args) => run::run(args).await,
		Commands::Token(args) => {
			let port = args.port.unwrap_or_else(|| Settings::default().port());
			println!("{}", derive_token(&args.secret, port));
			Ok(())
		}
	}
}
