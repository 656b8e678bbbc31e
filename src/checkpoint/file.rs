//! File-backed checkpoint store
//!
//! The checkpoint lives in a single JSON file. Saves write a sibling
//! temporary file, fsync it, rename it over the target and fsync the parent
//! directory, so a crash at any point leaves either the old or the new value
//! on disk, never a torn one.

use super::{CheckpointStore, StoredCheckpoint};
use crate::error::{Result, StreamhookError};
use crate::event::ResumePosition;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Checkpoint store keeping one JSON file per subscription
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    subscription: String,
}

impl FileCheckpointStore {
    /// Create a store writing to `path`
    ///
    /// Creates the parent directory if needed.
    ///
    /// # Examples
    ///
    /// ```
    /// use streamhook::checkpoint::{CheckpointStore, FileCheckpointStore};
    /// use streamhook::event::ResumePosition;
    ///
    /// let dir = tempfile::TempDir::new().unwrap();
    /// let store = FileCheckpointStore::new(dir.path().join("cp.json"), "gaps").unwrap();
    /// store.save(ResumePosition(3)).unwrap();
    /// assert_eq!(store.load().unwrap(), Some(ResumePosition(3)));
    /// ```
    pub fn new(path: impl Into<PathBuf>, subscription: &str) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StreamhookError::Checkpoint(format!(
                    "Failed to create checkpoint directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        Ok(Self {
            path,
            subscription: subscription.to_string(),
        })
    }

    /// Location of the checkpoint file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_atomically(&self, bytes: &[u8]) -> std::io::Result<()> {
        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path)
    }
}

#[cfg(unix)]
fn sync_parent(path: &Path) -> std::io::Result<()> {
    match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => File::open(parent)?.sync_all(),
        None => File::open(".")?.sync_all(),
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

impl CheckpointStore for FileCheckpointStore {
    fn load(&self) -> Result<Option<ResumePosition>> {
        match fs::read(&self.path) {
            Ok(bytes) => StoredCheckpoint::decode(&bytes, &self.subscription).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StreamhookError::Checkpoint(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))
            .into()),
        }
    }

    fn save(&self, position: ResumePosition) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(&StoredCheckpoint::new(&self.subscription, position))?;
        self.write_atomically(&bytes).map_err(|e| {
            StreamhookError::Checkpoint(format!(
                "Failed to persist position {} to {}: {}",
                position,
                self.path.display(),
                e
            ))
        })?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StreamhookError::Checkpoint(format!(
                "Failed to remove {}: {}",
                self.path.display(),
                e
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp.json"), "gaps").unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_save_overwrites_and_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp.json"), "gaps").unwrap();

        store.save(ResumePosition(1)).unwrap();
        store.save(ResumePosition(2)).unwrap();

        assert_eq!(store.load().unwrap(), Some(ResumePosition(2)));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("deeper").join("cp.json");
        let store = FileCheckpointStore::new(&path, "gaps").unwrap();
        store.save(ResumePosition(5)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_stale_temp_file_does_not_affect_load() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp.json"), "gaps").unwrap();
        store.save(ResumePosition(7)).unwrap();

        // Simulates a crash between writing the temp file and renaming it
        fs::write(store.temp_path(), b"{\"subscription\":\"gaps\",\"posi").unwrap();

        assert_eq!(store.load().unwrap(), Some(ResumePosition(7)));
        store.save(ResumePosition(8)).unwrap();
        assert_eq!(store.load().unwrap(), Some(ResumePosition(8)));
    }

    #[test]
    fn test_corrupt_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cp.json");
        fs::write(&path, b"not json").unwrap();
        let store = FileCheckpointStore::new(&path, "gaps").unwrap();
        assert!(store.load().is_err());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("cp.json"), "gaps").unwrap();
        store.save(ResumePosition(1)).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
