use clap::Parser;

use std::path::PathBuf;

use chainsync_lib::{config, logging};

/// chainsync daemon - keeps packet filter tables in line with a declared ruleset
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Configuration file with engine options and the desired ruleset
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH
    )]
    pub config_path: PathBuf,

    /// Log to this file instead of stdout, reopened on SIGHUP
    #[arg(long, env = logging::ENV_VAR_LOG_FILE)]
    pub log_file: Option<PathBuf>,

    /// Synchronize once and exit
    #[arg(long)]
    pub once: bool,
}

pub fn parse() -> Cli {
    Cli::parse()
}
