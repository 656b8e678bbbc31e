use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use streamhook::checkpoint::{CheckpointStore, FileCheckpointStore};
use streamhook::config::StartFrom;
use streamhook::deadletter::sqlite::SqliteDeadLetterSink;
use streamhook::delivery::{BackoffPolicy, Dispatcher, NotificationTarget};
use streamhook::filter::EventFilter;
use streamhook::pipeline::{ConsumerSettings, RunSummary, StreamConsumer};
use streamhook::source::ChangeSource;
use streamhook::{ChangeEvent, OperationType};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Durable stores rooted in one temp directory
#[allow(dead_code)]
pub struct Stores {
    pub dir: TempDir,
    pub checkpoints: Arc<FileCheckpointStore>,
    pub dead_letters: Arc<SqliteDeadLetterSink>,
}

#[allow(dead_code)]
pub fn create_temp_stores(subscription: &str) -> Stores {
    let dir = TempDir::new().expect("failed to create tempdir");
    let checkpoints = FileCheckpointStore::new(dir.path().join("checkpoint.json"), subscription)
        .expect("failed to create checkpoint store");
    let dead_letters = SqliteDeadLetterSink::new_with_path(dir.path().join("dead_letters.db"))
        .expect("failed to create sqlite dead-letter sink");
    Stores {
        dir,
        checkpoints: Arc::new(checkpoints),
        dead_letters: Arc::new(dead_letters),
    }
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("streamhook.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

#[allow(dead_code)]
pub fn inserts(positions: impl IntoIterator<Item = u64>) -> Vec<ChangeEvent> {
    positions
        .into_iter()
        .map(|p| ChangeEvent::new(p, OperationType::Insert, json!({"memberId": format!("M{:03}", p)})))
        .collect()
}

/// Backoff short enough that retry tests finish quickly
#[allow(dead_code)]
pub fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(4), 0.0)
}

#[allow(dead_code)]
pub fn settings(subscription: &str) -> ConsumerSettings {
    ConsumerSettings {
        subscription: subscription.to_string(),
        start_from: StartFrom::Earliest,
        reconnect: fast_backoff(),
        shutdown_timeout: Duration::from_secs(5),
        ..ConsumerSettings::default()
    }
}

#[allow(dead_code)]
pub fn consumer(
    source: Arc<dyn ChangeSource>,
    target: Arc<dyn NotificationTarget>,
    stores: &Stores,
    subscription: &str,
) -> StreamConsumer {
    let dispatcher = Dispatcher::new(target, stores.dead_letters.clone(), fast_backoff(), 5);
    let checkpoints: Arc<dyn CheckpointStore> = stores.checkpoints.clone();
    StreamConsumer::new(
        source,
        EventFilter::default(),
        dispatcher,
        checkpoints,
        settings(subscription),
    )
}

/// Run a consumer over a finite source to completion
#[allow(dead_code)]
pub async fn run_to_end(consumer: StreamConsumer) -> RunSummary {
    tokio::time::timeout(Duration::from_secs(10), consumer.run(CancellationToken::new()))
        .await
        .expect("consumer did not stop")
        .expect("consumer failed")
}
