//! Host for the pw-bridge relay core.
//!
//! Drives a Chromium remote-debugging port as the [`TargetPlatform`] and
//! serves the relay-native `Cookie.*` and `Download.*` command families.
//!
//! [`TargetPlatform`]: pw_bridge::TargetPlatform

pub mod cdp;
pub mod cli;
pub mod cookies;
pub mod downloads;
pub mod logging;
pub mod run;
pub mod settings;

