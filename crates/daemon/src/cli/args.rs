use std::path::PathBuf;

use clap::Parser;

/// Command line of the `cumulus` binary
#[derive(Parser, Debug)]
#[command(name = "cumulus", version)]
#[command(about = "Keep local folders in two-way sync with encrypted cloud folders")]
pub struct Args {
    /// State directory holding config.toml, key.pem and the caches (defaults to ~/.cumulus)
    #[arg(long, global = true, value_name = "DIR")]
    pub config_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: crate::Command,
}
