// Command line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gitmirror", version, about = "Scheduled Git repository backups to object storage")]
pub struct Cli {
    /// Configuration file layered over config/default.toml and config/local.toml
    #[arg(short = 'f', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run the scheduler and webhook listener until SIGINT/SIGTERM (default)
    Run,
    /// Download a repository's stored copy into a local directory
    Restore {
        repository: String,
        storage: String,
        local_path: PathBuf,
    },
    /// Print a fresh base64 encryption key
    Keygen,
    /// Encrypt a secret with the configured key, for use in the config file
    Encrypt { value: String },
}

impl Cli {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }
}
