//! Streamhook - change-event notification relay
//!
#![doc = "Streamhook - change-event notification relay"]
#![doc = "Main entry point for the streamhook binary."]

use anyhow::Result;

use streamhook::cli::{Cli, Commands};
use streamhook::commands;
use streamhook::config::Config;
use streamhook::logging::{init_cli_logging, init_logging, with_bootstrap_logging};
use streamhook::metrics::init_metrics_exporter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    let cli_level = if cli.verbose { "debug" } else { "warn" };

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config/streamhook.yaml");
    let config = with_bootstrap_logging(cli_level, || Config::load(config_path, &cli))?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Run { dry_run, .. } => {
            init_logging(&config.logging)?;
            init_metrics_exporter();
            tracing::info!(config = %config_path, "Starting streamhook");
            commands::run::run_relay(config, dry_run).await?;
            Ok(())
        }
        Commands::Checkpoint { command } => {
            init_cli_logging(cli_level)?;
            commands::checkpoint::handle_checkpoint(&config, command)?;
            Ok(())
        }
        Commands::Dlq { command } => {
            init_cli_logging(cli_level)?;
            commands::dlq::handle_dlq(&config, command).await?;
            Ok(())
        }
    }
}
