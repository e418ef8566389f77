//! In-process stores with JSON snapshot files.
//!
//! Each store owns one snapshot file. Loading is forgiving: a missing or
//! corrupt file is logged and the store starts empty, so damage to one
//! snapshot never blocks startup.

use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;

use crate::error::PersistenceError;

pub mod aggregation;
pub mod dedup;
pub mod features;
pub mod jobs;

pub const JOBS_FILE: &str = "tasks.json";
pub const DEDUP_FILE: &str = "hash_db.json";
pub const FEATURES_FILE: &str = "embedding_cache.json";
pub const AGGREGATION_FILE: &str = "cluster_results.json";

/// A durable JSON file backing one store.
///
/// Writes go through a temporary sibling and a rename, and are serialized
/// so that a slower, older snapshot can never overwrite a newer one.
#[derive(Debug)]
pub struct SnapshotFile {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            write_lock: Mutex::new(()),
        }
    }

    /// A snapshot that is never written. Used by tests and ephemeral runs.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load the snapshot, or `T::default()` on any failure.
    pub fn load_or_default<T: DeserializeOwned + Default>(&self) -> T {
        let Some(path) = &self.path else {
            return T::default();
        };
        match read_json(path) {
            Ok(Some(value)) => {
                tracing::info!(path = %path.display(), "Loaded snapshot");
                value
            }
            Ok(None) => T::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to load snapshot, starting empty");
                T::default()
            }
        }
    }

    /// Write the bytes produced by `serialize`. The closure runs after the
    /// write lock is taken so the newest state always lands last.
    pub async fn save_with<F>(&self, serialize: F) -> Result<(), PersistenceError>
    where
        F: FnOnce() -> serde_json::Result<Vec<u8>>,
    {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        let bytes = serialize()?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Remove the file from disk (full reset).
    pub async fn remove(&self) -> Result<(), PersistenceError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, PersistenceError> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

// Store locks are never held across an await and a panicking writer leaves
// no partial state behind, so a poisoned lock is still safe to use.
pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Log a failed snapshot write. Persistence failures never abort callers.
pub(crate) fn log_persist_failure(store: &str, result: Result<(), PersistenceError>) {
    if let Err(e) = result {
        tracing::error!(store, error = %e, "Failed to persist snapshot");
    }
}
