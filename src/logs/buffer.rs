//! Batch buffer
//!
//! Ordered accumulation of records awaiting shipment, guarded by a single
//! mutex. `drain` swaps the contents out atomically; `re_admit` puts a
//! failed batch back at the front so it goes out first on the next flush.

use super::LogRecord;
use crate::config::OverflowPolicy;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Result of [`BatchBuffer::append`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Buffer reached the batch size; the caller should flush now
    pub should_flush: bool,
    /// Records dropped by the overflow policy during this call
    pub dropped: usize,
}

/// Mutex-guarded record queue shared by the poll and flush threads
#[derive(Debug)]
pub struct BatchBuffer {
    records: Mutex<VecDeque<LogRecord>>,
    batch_size: usize,
    /// 0 = unbounded
    max_records: usize,
    policy: OverflowPolicy,
    dropped_total: AtomicU64,
}

impl BatchBuffer {
    /// Unbounded buffer flushing every `batch_size` records
    pub fn new(batch_size: usize) -> Self {
        Self::with_limit(batch_size, 0, OverflowPolicy::default())
    }

    /// Buffer capped at `max_records` (0 = unbounded)
    pub fn with_limit(batch_size: usize, max_records: usize, policy: OverflowPolicy) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            batch_size: batch_size.max(1),
            max_records,
            policy,
            dropped_total: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Push `record` to the tail
    pub fn append(&self, record: LogRecord) -> AppendOutcome {
        let mut records = self.lock();
        let mut dropped = 0;

        if self.max_records > 0 && records.len() >= self.max_records {
            match self.policy {
                OverflowPolicy::DropOldest => {
                    records.pop_front();
                    records.push_back(record);
                }
                OverflowPolicy::DropNewest => {}
            }
            dropped = 1;
        } else {
            records.push_back(record);
        }

        let should_flush = records.len() >= self.batch_size;
        drop(records);

        if dropped > 0 {
            self.note_dropped(dropped);
        }

        AppendOutcome {
            should_flush,
            dropped,
        }
    }

    /// Take every buffered record, leaving the buffer empty
    pub fn drain(&self) -> Vec<LogRecord> {
        let mut records = self.lock();
        std::mem::take(&mut *records).into()
    }

    /// Put records from a failed send back ahead of anything queued since.
    /// Returns the number of records the overflow policy discarded.
    pub fn re_admit(&self, batch: Vec<LogRecord>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut records = self.lock();
        let mut merged: VecDeque<LogRecord> = batch.into();
        merged.append(&mut records);

        let mut dropped = 0;
        if self.max_records > 0 {
            while merged.len() > self.max_records {
                match self.policy {
                    OverflowPolicy::DropOldest => merged.pop_front(),
                    OverflowPolicy::DropNewest => merged.pop_back(),
                };
                dropped += 1;
            }
        }

        *records = merged;
        drop(records);

        if dropped > 0 {
            self.note_dropped(dropped);
        }
        dropped
    }

    fn note_dropped(&self, count: usize) {
        let total = self.dropped_total.fetch_add(count as u64, Ordering::Relaxed) + count as u64;
        warn!(
            dropped = count,
            total,
            limit = self.max_records,
            "Batch buffer full, dropping records ({:?})",
            self.policy
        );
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Records discarded by the overflow policy since creation
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::{LineParser, SourceIdentity};
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::Arc;
    use std::thread;

    fn record(message: &str) -> LogRecord {
        let mut record = LogRecord::from_parsed(
            LineParser::new().parse(message),
            Path::new("/var/log/app.log"),
            0,
            SourceIdentity::Explicit {
                log_source_id: "1".to_string(),
            },
        );
        record.content_hash = message.to_string();
        record
    }

    fn messages(records: &[LogRecord]) -> Vec<String> {
        records.iter().map(|r| r.message.clone()).collect()
    }

    #[test]
    fn test_append_signals_flush_at_batch_size() {
        let buffer = BatchBuffer::new(2);
        assert!(!buffer.append(record("a")).should_flush);
        assert!(buffer.append(record("b")).should_flush);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_drain_empties_in_order() {
        let buffer = BatchBuffer::new(10);
        buffer.append(record("a"));
        buffer.append(record("b"));
        buffer.append(record("c"));

        let drained = buffer.drain();
        assert_eq!(messages(&drained), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
        assert!(buffer.drain().is_empty());
    }

    #[test]
    fn test_re_admit_goes_ahead_of_newer_records() {
        let buffer = BatchBuffer::new(10);
        buffer.append(record("a"));
        buffer.append(record("b"));
        let failed = buffer.drain();

        buffer.append(record("c"));
        assert_eq!(buffer.re_admit(failed), 0);

        assert_eq!(messages(&buffer.drain()), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_drop_oldest_policy() {
        let buffer = BatchBuffer::with_limit(100, 2, OverflowPolicy::DropOldest);
        buffer.append(record("a"));
        buffer.append(record("b"));
        let outcome = buffer.append(record("c"));

        assert_eq!(outcome.dropped, 1);
        assert_eq!(buffer.dropped_total(), 1);
        assert_eq!(messages(&buffer.drain()), vec!["b", "c"]);
    }

    #[test]
    fn test_drop_newest_policy() {
        let buffer = BatchBuffer::with_limit(100, 2, OverflowPolicy::DropNewest);
        buffer.append(record("a"));
        buffer.append(record("b"));
        let outcome = buffer.append(record("c"));

        assert_eq!(outcome.dropped, 1);
        assert_eq!(messages(&buffer.drain()), vec!["a", "b"]);
    }

    #[test]
    fn test_re_admit_respects_limit() {
        let buffer = BatchBuffer::with_limit(100, 3, OverflowPolicy::DropOldest);
        buffer.append(record("a"));
        buffer.append(record("b"));
        let failed = buffer.drain();
        buffer.append(record("c"));
        buffer.append(record("d"));

        assert_eq!(buffer.re_admit(failed), 1);
        assert_eq!(messages(&buffer.drain()), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_concurrent_append_and_drain_lose_nothing() {
        let buffer = Arc::new(BatchBuffer::new(1_000_000));
        let producers = 4;
        let per_producer = 2_500;

        let mut handles = Vec::new();
        for p in 0..producers {
            let buffer = Arc::clone(&buffer);
            handles.push(thread::spawn(move || {
                for i in 0..per_producer {
                    buffer.append(record(&format!("p{}-{}", p, i)));
                }
            }));
        }

        let drainer = {
            let buffer = Arc::clone(&buffer);
            thread::spawn(move || {
                let mut drained = Vec::new();
                for _ in 0..200 {
                    drained.extend(buffer.drain());
                    thread::yield_now();
                }
                drained
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let mut all = drainer.join().unwrap();
        all.extend(buffer.drain());

        let unique: HashSet<String> = all.iter().map(|r| r.message.clone()).collect();
        assert_eq!(all.len(), producers * per_producer);
        assert_eq!(unique.len(), producers * per_producer);
    }
}
