//! Relay loop command
//!
//! Wires the configured source, filter, target and stores into a
//! [`StreamConsumer`] and runs it until Ctrl-C or a fatal error.

use crate::checkpoint::{open_store, CheckpointStore, MemoryCheckpointStore};
use crate::config::Config;
use crate::deadletter::{open_sink, DeadLetterSink, MemoryDeadLetterSink};
use crate::delivery::{build_target, Dispatcher, LogTarget, NotificationTarget};
use crate::error::Result;
use crate::filter::EventFilter;
use crate::pipeline::{ConsumerSettings, StreamConsumer};
use crate::source::build_source;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Build a consumer from configuration
///
/// In dry-run mode notifications go to the log target and checkpoint and
/// dead-letter writes stay in memory. The stored checkpoint is still read so
/// a dry run starts where a real run would.
///
/// # Errors
///
/// Returns error if any component cannot be built or a store cannot be opened
pub fn build_consumer(config: &Config, dry_run: bool) -> Result<StreamConsumer> {
    let source = build_source(&config.source)?;
    let filter = EventFilter::new(config.filter.stages.clone())?;

    let target: Arc<dyn NotificationTarget>;
    let checkpoints: Arc<dyn CheckpointStore>;
    let dead_letters: Arc<dyn DeadLetterSink>;
    if dry_run {
        let stored = open_store(config)?.load()?;
        target = Arc::new(LogTarget);
        checkpoints = Arc::new(match stored {
            Some(position) => MemoryCheckpointStore::with_position(position),
            None => MemoryCheckpointStore::new(),
        });
        dead_letters = Arc::new(MemoryDeadLetterSink::new());
    } else {
        target = build_target(&config.target)?;
        checkpoints = open_store(config)?;
        dead_letters = open_sink(config)?;
    }

    let dispatcher = Dispatcher::from_config(target, dead_letters, &config.delivery);

    tracing::info!(
        subscription = %config.subscription,
        source = %source.describe(),
        target = %dispatcher.target_description(),
        filter = %filter.summary(),
        dry_run = dry_run,
        "Streamhook consumer configured"
    );

    Ok(StreamConsumer::new(
        source,
        filter,
        dispatcher,
        checkpoints,
        ConsumerSettings::from_config(config),
    ))
}

/// Run the relay until interrupted
///
/// # Errors
///
/// Returns the consumer's fatal error, if any
pub async fn run_relay(config: Config, dry_run: bool) -> Result<()> {
    if dry_run {
        tracing::warn!("Dry run: notifications are logged, nothing is persisted");
    }

    let consumer = build_consumer(&config, dry_run)?;
    let cancel = CancellationToken::new();

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("Shutdown requested");
        signal_token.cancel();
    });

    let summary = consumer.run(cancel).await?;

    tracing::info!(
        subscription = %config.subscription,
        events_received = summary.events_received,
        events_matched = summary.events_matched,
        delivered = summary.delivered,
        dead_lettered = summary.dead_lettered,
        reconnects = summary.reconnects,
        committed = ?summary.committed.map(|p| p.value()),
        "Streamhook stopped"
    );

    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to listen for SIGTERM");
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
