//! Command-line interface definition for Streamhook
//!
//! This module defines the CLI structure using clap's derive API,
//! providing the relay loop plus checkpoint and dead-letter tooling.

use crate::config::StartFrom;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Streamhook - change-event notification relay
///
/// Follows a change stream, filters events, delivers them to a
/// notification target and keeps a durable resume checkpoint.
#[derive(Parser, Debug, Clone)]
#[command(name = "streamhook")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/streamhook.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for Streamhook
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Consume the change stream and deliver notifications
    Run {
        /// Log notifications instead of delivering them; nothing is persisted
        #[arg(long)]
        dry_run: bool,

        /// Start policy when no checkpoint exists (latest, earliest)
        #[arg(long, value_parser = clap::value_parser!(StartFrom))]
        start_from: Option<StartFrom>,

        /// Force JSON-formatted logs
        #[arg(long)]
        json_logs: bool,

        /// Also write logs to this file
        #[arg(long)]
        log_file: Option<PathBuf>,
    },

    /// Inspect or change the stored resume position
    Checkpoint {
        /// Checkpoint subcommand
        #[command(subcommand)]
        command: CheckpointCommand,
    },

    /// Inspect and manage dead-lettered notifications
    Dlq {
        /// Dead-letter subcommand
        #[command(subcommand)]
        command: DlqCommand,
    },
}

/// Checkpoint subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum CheckpointCommand {
    /// Print the stored position
    Show,

    /// Overwrite the stored position
    Set {
        /// New resume position
        position: u64,
    },

    /// Remove the stored position so the next run uses the start policy
    Clear,
}

/// Dead-letter subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum DlqCommand {
    /// List dead-lettered notifications
    List {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,

        /// Show at most this many records
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show one record in full
    Show {
        /// Record id or unique prefix
        id: String,
    },

    /// Delete records
    Purge {
        /// Record id or unique prefix
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        id: Option<String>,

        /// Delete every record
        #[arg(long)]
        all: bool,
    },

    /// Send a record once more and delete it if delivery succeeds
    Replay {
        /// Record id or unique prefix
        id: String,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/streamhook.yaml".to_string()),
            verbose: false,
            command: Commands::Run {
                dry_run: false,
                start_from: None,
                json_logs: false,
                log_file: None,
            },
        }
    }
}
