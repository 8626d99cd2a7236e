//! CLI argument parsing for bridges.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for the bridge.
#[derive(Parser, Debug, Clone)]
#[command(about = "ESPHome vehicle bridge", version)]
pub struct BridgeArgs {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, env = "CONFIG_FILE")]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub check: bool,
}

impl BridgeArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If neither `--config` nor `CONFIG_FILE` is provided, uses the default.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        match <Self as clap::FromArgMatches>::from_arg_matches(&matches) {
            Ok(args) => args,
            Err(e) => e.exit(),
        }
    }

    /// Parse CLI arguments (requires --config to be specified).
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
