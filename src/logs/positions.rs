//! Read cursor persistence
//!
//! [`PositionStore`] owns the checkpoint file: a JSON object mapping each
//! watched path to the byte offset already consumed. [`SharedPositions`] is
//! the in-memory map written by the poll thread and snapshotted by the
//! checkpoint thread; every access goes through one mutex so iteration for a
//! snapshot can never observe a concurrent insert.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// Path -> consumed byte offset
pub type PositionMap = HashMap<String, u64>;

/// Durable checkpoint file
#[derive(Debug, Clone)]
pub struct PositionStore {
    path: PathBuf,
}

impl PositionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the checkpoint. Absence or corruption yields an empty map.
    pub fn load(&self) -> PositionMap {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No position checkpoint yet");
                return PositionMap::new();
            }
            Err(e) => {
                warn!(path = %self.path.display(), "Failed to read position checkpoint: {}", e);
                return PositionMap::new();
            }
        };

        match serde_json::from_str::<PositionMap>(&content) {
            Ok(positions) => {
                debug!(
                    path = %self.path.display(),
                    count = positions.len(),
                    "Loaded position checkpoint"
                );
                positions
            }
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    "Ignoring unreadable position checkpoint: {}", e
                );
                PositionMap::new()
            }
        }
    }

    /// Replace the checkpoint with `positions`.
    ///
    /// The snapshot is written to a sibling temp file and renamed over the
    /// checkpoint, so readers see either the previous or the new snapshot.
    pub fn save(&self, positions: &PositionMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create checkpoint directory {}", parent.display())
                })?;
            }
        }

        let content =
            serde_json::to_string_pretty(positions).context("Failed to encode positions")?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write checkpoint {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace checkpoint {}", self.path.display()))?;

        debug!(path = %self.path.display(), count = positions.len(), "Saved position checkpoint");
        Ok(())
    }
}

/// Offset map shared between the poll and checkpoint threads
#[derive(Debug, Default)]
pub struct SharedPositions {
    inner: Mutex<PositionMap>,
}

impl SharedPositions {
    pub fn new(initial: PositionMap) -> Self {
        Self {
            inner: Mutex::new(initial),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PositionMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, path: &Path) -> Option<u64> {
        self.lock().get(path.to_string_lossy().as_ref()).copied()
    }

    pub fn set(&self, path: &Path, offset: u64) {
        self.lock()
            .insert(path.to_string_lossy().into_owned(), offset);
    }

    /// Consistent copy of every cursor
    pub fn snapshot(&self) -> PositionMap {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Snapshot and persist through `store`
    pub fn checkpoint(&self, store: &PositionStore) -> Result<()> {
        store.save(&self.snapshot())
    }
}
