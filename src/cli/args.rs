use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "resticvault", disable_version_flag = true)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Profile to run
    #[arg(short = 'n', long, default_value = "default")]
    pub name: String,

    /// Log the commands without running them
    #[arg(long)]
    pub dry_run: bool,

    /// Ignore the lock defined in the profile
    #[arg(long)]
    pub no_lock: bool,

    /// Wait up to this duration for the profile lock (e.g. "10m")
    #[arg(long)]
    pub lock_wait: Option<String>,

    #[arg(short, long)]
    pub verbose: bool,

    #[arg(long)]
    pub version: bool,

    /// Engine command to run (defaults to backup)
    pub command: Option<String>,
}
