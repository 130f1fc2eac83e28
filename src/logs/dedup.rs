//! Content-hash deduplication
//!
//! Suppresses lines re-read because of overlapping offset math or restart
//! replay. The window remembers a bounded number of recent hashes; when it
//! reaches its ceiling the oldest half is forgotten. This is best-effort
//! suppression, not a delivery guarantee.

use super::LogRecord;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

/// Default number of hashes remembered
pub const DEFAULT_WINDOW: usize = 10_000;

/// Stable hash over `(file path, offset, line content)`, hex encoded
pub fn content_hash(path: &Path, offset: u64, content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update([0u8]);
    hasher.update(offset.to_be_bytes());
    hasher.update([0u8]);
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Bounded set of recently seen hashes with insertion-order eviction
#[derive(Debug)]
pub struct DedupWindow {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DedupWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
        }
    }

    /// Record `hash`; returns false when it was already in the window
    pub fn insert(&mut self, hash: &str) -> bool {
        if self.seen.contains(hash) {
            return false;
        }

        if self.order.len() >= self.capacity {
            self.prune();
        }

        self.order.push_back(hash.to_string());
        self.seen.insert(hash.to_string());
        true
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.seen.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Keep only the most recently inserted half
    fn prune(&mut self) {
        let keep = self.capacity / 2;
        while self.order.len() > keep {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }
}

/// Thread-safe deduplication stage in front of the batch buffer
#[derive(Debug)]
pub struct Deduplicator {
    window: Mutex<DedupWindow>,
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: Mutex::new(DedupWindow::new(capacity)),
        }
    }

    /// Attach the content hash to `record`, or drop it as a duplicate
    pub fn admit(&self, path: &Path, offset: u64, mut record: LogRecord) -> Option<LogRecord> {
        let hash = content_hash(path, offset, &record.raw_message);

        let fresh = self
            .window
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(&hash);

        if !fresh {
            debug!(path = %path.display(), offset, "Dropping duplicate log line");
            return None;
        }

        record.content_hash = hash;
        Some(record)
    }
}
