//! Last-sync timestamp persistence (`last-sync.json`).

use std::path::PathBuf;

use mesh_core::SyncClock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::create_private_dir;

/// File name of the sync state inside the data directory.
pub const SYNC_STATE_FILE: &str = "last-sync.json";

/// Sync state errors.
#[derive(Debug, Error)]
pub enum SyncStateError {
    /// Reading or writing the state file failed.
    #[error("sync state I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Encoding the state failed.
    #[error("sync state serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct SyncState {
    timestamp: u64,
}

/// Reads and writes the last sync timestamp of a node.
#[derive(Debug, Clone)]
pub struct SyncStateStore {
    dir: PathBuf,
}

impl SyncStateStore {
    /// Store rooted at the given data directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the state file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(SYNC_STATE_FILE)
    }

    /// Last recorded sync time in epoch millis, 0 if never synced.
    ///
    /// A missing or unreadable file counts as never synced.
    pub async fn load(&self) -> Result<u64, SyncStateError> {
        let path = self.path();
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(SyncStateError::Io { path, source }),
        };
        match serde_json::from_str::<SyncState>(&contents) {
            Ok(state) => Ok(state.timestamp),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring corrupt sync state");
                Ok(0)
            }
        }
    }

    /// Record a sync at `timestamp`.
    ///
    /// Returns the stored value, which is `timestamp` unless the file
    /// already held a later one.
    pub async fn record(&self, timestamp: u64) -> Result<u64, SyncStateError> {
        let mut clock = SyncClock::with_timestamp(self.load().await?);
        if !clock.advance(timestamp) {
            tracing::debug!(
                stored = clock.last(),
                timestamp,
                "sync timestamp older than stored value, keeping stored"
            );
            return Ok(clock.last());
        }

        create_private_dir(&self.dir)
            .await
            .map_err(|source| SyncStateError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path();
        let contents = serde_json::to_string(&SyncState {
            timestamp: clock.last(),
        })?;
        tokio::fs::write(&path, contents)
            .await
            .map_err(|source| SyncStateError::Io { path, source })?;
        Ok(clock.last())
    }
}
