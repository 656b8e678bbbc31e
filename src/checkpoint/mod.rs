//! Checkpoint persistence
//!
//! A checkpoint store holds exactly one value per subscription: the last
//! [`ResumePosition`] whose events (and everything before them) reached a
//! terminal state. The consumer loop is the only writer.
//!
//! # Backends
//!
//! - [`FileCheckpointStore`]: JSON file replaced with write-then-rename
//! - [`SledCheckpointStore`]: embedded `sled` database, one key per subscription
//! - [`MemoryCheckpointStore`]: in-process store for tests and dry runs

pub mod file;
pub mod sled_store;

pub use file::FileCheckpointStore;
pub use sled_store::SledCheckpointStore;

use crate::config::{CheckpointBackend, Config};
use crate::error::{Result, StreamhookError};
use crate::event::ResumePosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Durable single-value store for the resume position
pub trait CheckpointStore: Send + Sync {
    /// Read the stored position, `None` if nothing has been committed yet
    fn load(&self) -> Result<Option<ResumePosition>>;

    /// Persist `position`; must be durable before returning
    fn save(&self, position: ResumePosition) -> Result<()>;

    /// Remove the stored position (operator tooling)
    fn clear(&self) -> Result<()>;
}

/// Serialized form shared by the file and sled backends
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCheckpoint {
    /// Subscription the position belongs to
    pub subscription: String,
    /// Committed position
    pub position: ResumePosition,
    /// When the position was written
    pub saved_at: DateTime<Utc>,
}

impl StoredCheckpoint {
    pub(crate) fn new(subscription: &str, position: ResumePosition) -> Self {
        Self {
            subscription: subscription.to_string(),
            position,
            saved_at: Utc::now(),
        }
    }

    pub(crate) fn decode(bytes: &[u8], subscription: &str) -> Result<ResumePosition> {
        let stored: StoredCheckpoint = serde_json::from_slice(bytes).map_err(|e| {
            StreamhookError::Checkpoint(format!("Stored checkpoint is unreadable: {}", e))
        })?;
        if stored.subscription != subscription {
            return Err(StreamhookError::Checkpoint(format!(
                "Checkpoint belongs to subscription '{}', expected '{}'",
                stored.subscription, subscription
            ))
            .into());
        }
        Ok(stored.position)
    }
}

/// Open the checkpoint store selected by configuration
pub fn open_store(config: &Config) -> Result<Arc<dyn CheckpointStore>> {
    let path = config.checkpoint_path()?;
    tracing::debug!(
        backend = ?config.checkpoint.backend,
        path = %path.display(),
        "Opening checkpoint store"
    );
    Ok(match config.checkpoint.backend {
        CheckpointBackend::File => Arc::new(FileCheckpointStore::new(path, &config.subscription)?),
        CheckpointBackend::Sled => Arc::new(SledCheckpointStore::open(path, &config.subscription)?),
    })
}

/// In-memory checkpoint store
///
/// Keeps every saved position so tests can assert on the full sequence of
/// commits, and can be told to fail saves to exercise the fatal path.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    current: Mutex<Option<ResumePosition>>,
    history: Mutex<Vec<ResumePosition>>,
    fail_saves: AtomicBool,
}

impl MemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that already holds `position`
    pub fn with_position(position: ResumePosition) -> Self {
        let store = Self::default();
        *store.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(position);
        store
    }

    /// Every position saved so far, in order
    pub fn history(&self) -> Vec<ResumePosition> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Make subsequent saves fail (or succeed again)
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn load(&self) -> Result<Option<ResumePosition>> {
        Ok(*self.current.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn save(&self, position: ResumePosition) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StreamhookError::Checkpoint("injected save failure".to_string()).into());
        }
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(position);
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(position);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }
}
