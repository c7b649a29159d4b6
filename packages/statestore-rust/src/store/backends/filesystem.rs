//! Filesystem implementation of the store contract.
//!
//! Each document is one JSON file; the storage key *is* the path, relative
//! keys anchored under the user's home directory. Writes land atomically via
//! [`crate::json_io`]; multi-writer updates serialize through the sibling
//! `.lock` file from [`crate::path_lock`]. All operations are synchronous
//! disk I/O, so [`flush`](crate::store::StateStore::flush) is a no-op.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::json_io;
use crate::keys;
use crate::path_lock::PathLock;
use crate::store::contract::{JsonUpdater, StateStore, UpdateDecision};

/// Store backend over per-user state files.
pub struct FilesystemStore {
    home: PathBuf,
}

impl FilesystemStore {
    /// Creates a backend resolving relative storage keys under `home`.
    #[must_use]
    pub fn new(home: PathBuf) -> Self {
        Self { home }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        keys::materialize(key, &self.home)
    }
}

#[async_trait]
impl StateStore for FilesystemStore {
    // --- Reads ---

    fn read_json(&self, key: &str) -> Result<Option<Value>, StoreError> {
        json_io::load_json(&self.path_for(key))
    }

    fn read_json5(&self, key: &str) -> Result<Option<Value>, StoreError> {
        json_io::load_json_lenient(&self.path_for(key))
    }

    fn read_text(&self, key: &str) -> Result<Option<String>, StoreError> {
        json_io::load_text(&self.path_for(key))
    }

    // --- Writes ---

    async fn write_json(&self, key: &str, doc: &Value) -> Result<(), StoreError> {
        json_io::save_json(&self.path_for(key), doc)
    }

    async fn write_json_with_backup(&self, key: &str, doc: &Value) -> Result<(), StoreError> {
        json_io::save_json_with_backup(&self.path_for(key), doc)
    }

    async fn write_text(&self, key: &str, content: &str) -> Result<(), StoreError> {
        json_io::save_text(&self.path_for(key), content)
    }

    // --- Update protocol ---

    async fn update_json_with_lock(
        &self,
        key: &str,
        updater: JsonUpdater,
    ) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        let _lock = PathLock::acquire(&path).await?;

        // Strict parse under the lock: a corrupt document aborts the update
        // rather than letting the updater observe "empty" and clobber it.
        let current = json_io::load_json(&path)?;

        let decision = updater(current.clone()).map_err(|source| StoreError::UpdateAborted {
            key: key.to_string(),
            source,
        })?;

        match decision {
            UpdateDecision::Write(next) => {
                json_io::save_json(&path, &next)?;
                Ok(Some(next))
            }
            UpdateDecision::Keep => Ok(current),
        }
    }

    // --- Deletion ---

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(path, err)),
        }
    }

    // --- Durability and lifecycle ---

    async fn flush(&self) -> Result<(), StoreError> {
        // Writes are synchronous; there is nothing pending.
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

impl std::fmt::Debug for FilesystemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilesystemStore")
            .field("home", &self.home)
            .finish()
    }
}
