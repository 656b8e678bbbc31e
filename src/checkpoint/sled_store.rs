//! Embedded key-value checkpoint store
//!
//! Several subscriptions can share one sled database; each owns the key
//! `checkpoint/<subscription>`. Every save is flushed before returning.

use super::{CheckpointStore, StoredCheckpoint};
use crate::error::{Result, StreamhookError};
use crate::event::ResumePosition;
use sled::Db;
use std::path::Path;

/// Checkpoint store backed by `sled`
pub struct SledCheckpointStore {
    db: Db,
    key: String,
    subscription: String,
}

impl SledCheckpointStore {
    /// Open or create the database at `path`
    ///
    /// # Errors
    ///
    /// Returns `StreamhookError::Checkpoint` if the database cannot be opened
    pub fn open(path: impl AsRef<Path>, subscription: &str) -> Result<Self> {
        let db = sled::open(path)
            .map_err(|e| StreamhookError::Checkpoint(format!("Failed to open database: {}", e)))?;
        Ok(Self {
            db,
            key: format!("checkpoint/{}", subscription),
            subscription: subscription.to_string(),
        })
    }
}

impl CheckpointStore for SledCheckpointStore {
    fn load(&self) -> Result<Option<ResumePosition>> {
        match self
            .db
            .get(self.key.as_bytes())
            .map_err(|e| StreamhookError::Checkpoint(format!("Get failed: {}", e)))?
        {
            Some(bytes) => StoredCheckpoint::decode(&bytes, &self.subscription).map(Some),
            None => Ok(None),
        }
    }

    fn save(&self, position: ResumePosition) -> Result<()> {
        let value = serde_json::to_vec(&StoredCheckpoint::new(&self.subscription, position))?;

        self.db
            .insert(self.key.as_bytes(), value)
            .map_err(|e| StreamhookError::Checkpoint(format!("Insert failed: {}", e)))?;

        self.db
            .flush()
            .map_err(|e| StreamhookError::Checkpoint(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.db
            .remove(self.key.as_bytes())
            .map_err(|e| StreamhookError::Checkpoint(format!("Remove failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StreamhookError::Checkpoint(format!("Flush failed: {}", e)))?;
        Ok(())
    }
}
