//! Cutover service daemon and management CLI
//!
//! Subcommands:
//! - `install` - prepare the state directory and install the service unit
//! - `uninstall` - remove the service unit and listening socket
//! - `repair` - validate configuration, re-run migrations, clear stale state
//! - `run-foreground` - run the coordination service in the foreground
//!
//! Exit codes: 0 success, 1 generic failure, 2 prerequisites unmet.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cutover_core::config::ServiceConfig;

mod adapters;
mod daemon;
mod setup;

/// Exit code for unmet prerequisites
const EXIT_PREREQUISITES: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "cutoverd", version, about = "Workstation migration coordination service")]
struct Cli {
    /// Use an alternate config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Prepare the state directory and install the service unit
    Install,
    /// Remove the service unit and listening socket
    Uninstall,
    /// Validate configuration and repair on-disk state
    Repair,
    /// Run the service in the foreground
    RunForeground,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .unwrap_or_else(ServiceConfig::default_path);
    let config = ServiceConfig::load_or_default(&config_path);

    let issues = config.validate();
    if !issues.is_empty() {
        for issue in &issues {
            tracing::error!(%issue, "Invalid configuration");
        }
        return ExitCode::from(EXIT_PREREQUISITES);
    }

    let result = match cli.command {
        Commands::Install => setup::install(&config).await,
        Commands::Uninstall => setup::uninstall(&config).await,
        Commands::Repair => setup::repair(&config).await,
        Commands::RunForeground => daemon::run(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(setup::CommandError::Prerequisites(message)) => {
            tracing::error!(%message, "Prerequisites unmet");
            ExitCode::from(EXIT_PREREQUISITES)
        }
        Err(setup::CommandError::Failed(error)) => {
            tracing::error!(error = %error, "Command failed");
            ExitCode::FAILURE
        }
    }
}
