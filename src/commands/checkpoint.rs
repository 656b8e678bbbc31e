//! Checkpoint operator commands

use crate::checkpoint::{open_store, CheckpointStore};
use crate::cli::CheckpointCommand;
use crate::config::Config;
use crate::error::Result;
use crate::event::ResumePosition;

/// Handle checkpoint commands against the configured store
pub fn handle_checkpoint(config: &Config, command: CheckpointCommand) -> Result<()> {
    let store = open_store(config)?;
    let message = execute(store.as_ref(), &config.subscription, command)?;
    println!("{}", message);
    Ok(())
}

fn execute(
    store: &dyn CheckpointStore,
    subscription: &str,
    command: CheckpointCommand,
) -> Result<String> {
    match command {
        CheckpointCommand::Show => Ok(match store.load()? {
            Some(position) => format!("{}: {}", subscription, position),
            None => format!("{}: no checkpoint stored", subscription),
        }),
        CheckpointCommand::Set { position } => {
            let previous = store.load()?;
            store.save(ResumePosition(position))?;
            tracing::info!(
                subscription = %subscription,
                previous = ?previous.map(|p| p.value()),
                position = position,
                "Checkpoint overwritten"
            );
            Ok(format!("{}: checkpoint set to {}", subscription, position))
        }
        CheckpointCommand::Clear => {
            store.clear()?;
            tracing::info!(subscription = %subscription, "Checkpoint cleared");
            Ok(format!("{}: checkpoint cleared", subscription))
        }
    }
}
