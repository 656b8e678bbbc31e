//! Dead-letter sink
//!
//! Tasks that exhausted their retries or were permanently rejected are
//! recorded here. Records are never consumed automatically; operators list,
//! inspect, replay and purge them through the `dlq` commands.

pub mod sqlite;

pub use sqlite::SqliteDeadLetterSink;

use crate::config::Config;
use crate::delivery::NotificationTask;
use crate::error::{Result, StreamhookError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use ulid::Ulid;

/// Undeliverable notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Record identifier (ULID, sortable by creation time)
    pub id: String,

    /// The task as it was on its final attempt
    pub task: NotificationTask,

    /// Why delivery stopped
    pub reason: String,

    /// Attempts made before giving up
    pub attempts: u32,

    /// Time of the final attempt
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Create a record for `task`
    pub fn new(task: NotificationTask, reason: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            attempts: task.attempts,
            task,
            reason: reason.into(),
            failed_at: Utc::now(),
        }
    }
}

/// Durable append-only store of undeliverable tasks
pub trait DeadLetterSink: Send + Sync {
    /// Append a record; must be durable before returning
    fn record(&self, record: &DeadLetterRecord) -> Result<()>;

    /// Records in insertion order, at most `limit` if given
    fn list(&self, limit: Option<usize>) -> Result<Vec<DeadLetterRecord>>;

    /// Record by id or unique id prefix
    fn get(&self, id: &str) -> Result<Option<DeadLetterRecord>>;

    /// Delete one record; returns false if it did not exist
    fn purge(&self, id: &str) -> Result<bool>;

    /// Delete every record; returns how many were removed
    fn purge_all(&self) -> Result<usize>;

    /// Number of stored records
    fn count(&self) -> Result<usize> {
        Ok(self.list(None)?.len())
    }
}

/// Open the dead-letter sink at the configured location
pub fn open_sink(config: &Config) -> Result<Arc<dyn DeadLetterSink>> {
    let path = config.dead_letter_path()?;
    tracing::debug!(path = %path.display(), "Opening dead-letter sink");
    Ok(Arc::new(SqliteDeadLetterSink::new_with_path(path)?))
}

/// In-memory dead-letter sink
#[derive(Debug, Default)]
pub struct MemoryDeadLetterSink {
    records: Mutex<Vec<DeadLetterRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryDeadLetterSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn records(&self) -> std::sync::MutexGuard<'_, Vec<DeadLetterRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl DeadLetterSink for MemoryDeadLetterSink {
    fn record(&self, record: &DeadLetterRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StreamhookError::DeadLetter("injected write failure".to_string()).into());
        }
        self.records().push(record.clone());
        Ok(())
    }

    fn list(&self, limit: Option<usize>) -> Result<Vec<DeadLetterRecord>> {
        let records = self.records();
        Ok(records
            .iter()
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    fn get(&self, id: &str) -> Result<Option<DeadLetterRecord>> {
        let records = self.records();
        let mut matches = records.iter().filter(|r| r.id.starts_with(id));
        match (matches.next(), matches.next()) {
            (Some(record), None) => Ok(Some(record.clone())),
            (None, _) => Ok(None),
            (Some(_), Some(_)) => Err(StreamhookError::DeadLetter(format!(
                "Id prefix '{}' matches more than one record",
                id
            ))
            .into()),
        }
    }

    fn purge(&self, id: &str) -> Result<bool> {
        let mut records = self.records();
        let before = records.len();
        records.retain(|r| r.id != id);
        Ok(records.len() != before)
    }

    fn purge_all(&self) -> Result<usize> {
        let mut records = self.records();
        let count = records.len();
        records.clear();
        Ok(count)
    }
}
