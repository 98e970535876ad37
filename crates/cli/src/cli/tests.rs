use std::path::PathBuf;

use clap::Parser;

use super::*;

#[test]
fn parse_run_defaults() {
	let cli = Cli::try_parse_from(["pw-bridge", "run"]).unwrap();
	assert_eq!(cli.verbose, 0);

	match cli.command {
		Commands::Run(args) => {
			assert_eq!(args.cdp_port, 9222);
			assert_eq!(args.relay_port, None);
			assert!(!args.no_auto_attach);
			assert_eq!(args.settings, None);
		}
		_ => panic!("Expected Run command"),
	}
}

#[test]
fn parse_run_overrides() {
	let args = vec![
		"pw-bridge",
		"run",
		"--relay-port",
		"19000",
		"--secret",
		"s3cret",
		"--cdp-port",
		"9333",
		"--settings",
		"/tmp/bridge.json",
		"--no-auto-attach",
		"-vv",
	];
	let cli = Cli::try_parse_from(args).unwrap();
	assert_eq!(cli.verbose, 2);

	match cli.command {
		Commands::Run(args) => {
			assert_eq!(args.relay_port, Some(19000));
			assert_eq!(args.secret.as_deref(), Some("s3cret"));
			assert_eq!(args.cdp_port, 9333);
			assert_eq!(args.settings, Some(PathBuf::from("/tmp/bridge.json")));
			assert!(args.no_auto_attach);
		}
		_ => panic!("Expected Run command"),
	}
}

#[test]
fn parse_token() {
	let cli = Cli::try_parse_from(["pw-bridge", "token", "--secret", "abc", "--port", "18792"]).unwrap();

	match cli.command {
		Commands::Token(args) => {
			assert_eq!(args.secret, "abc");
			assert_eq!(args.port, Some(18792));
		}
		_ => panic!("Expected Token command"),
	}
}

#[test]
fn verbose_is_global() {
	let cli = Cli::try_parse_from(["pw-bridge", "-v", "run"]).unwrap();
	assert_eq!(cli.verbose, 1);
}
