mod run_cmd;

use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use ptysup_supervisor::SupervisorConfig;
use std::path::Path;
use std::path::PathBuf;

pub use run_cmd::RunCommand;

/// Run interactive programs under a pseudo-terminal supervisor.
#[derive(Debug, Parser)]
#[command(name = "ptysup", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Spawn a command, stream its output and report idle/active changes.
    Run(RunCommand),
}

/// Runs the parsed command line and returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run(command) => run_cmd::run(command).await,
    }
}

/// `$XDG_CONFIG_HOME/ptysup/config.toml` or the platform equivalent.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("ptysup").join("config.toml"))
}

/// An explicit path must exist. The default path is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<SupervisorConfig> {
    if let Some(path) = explicit {
        return Ok(SupervisorConfig::load(path)?);
    }
    match default_config_path() {
        Some(path) if path.exists() => Ok(SupervisorConfig::load(&path)?),
        _ => Ok(SupervisorConfig::default()),
    }
}
