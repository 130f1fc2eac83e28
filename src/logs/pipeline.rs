//! Deduplicator -> batch buffer -> shipper wiring
//!
//! [`LogPipeline`] is the [`RecordSink`] the tailer feeds. A record that
//! fills the buffer to the batch size triggers a flush on the calling
//! thread.

use super::{
    BatchBuffer, Deduplicator, FlushOutcome, LogRecord, RecordSink, Shipper,
};
use crate::api::{ApiClient, Transport};
use crate::config::AgentConfig;
use crate::metrics::AgentMetrics;
use std::path::Path;
use std::sync::Arc;

pub struct LogPipeline<T: Transport> {
    dedup: Deduplicator,
    buffer: Arc<BatchBuffer>,
    shipper: Shipper<T>,
    metrics: Arc<AgentMetrics>,
}

impl<T: Transport> LogPipeline<T> {
    pub fn new(
        dedup: Deduplicator,
        buffer: Arc<BatchBuffer>,
        client: Arc<ApiClient<T>>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let shipper = Shipper::new(client, Arc::clone(&buffer), Arc::clone(&metrics));
        Self {
            dedup,
            buffer,
            shipper,
            metrics,
        }
    }

    /// Build the pipeline with the buffer limits and dedup window from `config`
    pub fn from_config(
        config: &AgentConfig,
        client: Arc<ApiClient<T>>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let buffer = Arc::new(BatchBuffer::with_limit(
            config.batch_size,
            config.max_buffer_records,
            config.overflow_policy,
        ));
        Self::new(Deduplicator::new(config.dedup_window), buffer, client, metrics)
    }

    pub fn buffer(&self) -> &Arc<BatchBuffer> {
        &self.buffer
    }

    /// Ship whatever is buffered
    pub fn flush(&self) -> FlushOutcome {
        self.shipper.flush()
    }
}

impl<T: Transport> RecordSink for LogPipeline<T> {
    fn accept(&self, path: &Path, offset: u64, record: LogRecord) {
        self.metrics.lines_read.inc();

        let Some(record) = self.dedup.admit(path, offset, record) else {
            self.metrics.duplicates_dropped.inc();
            return;
        };

        let outcome = self.buffer.append(record);
        if outcome.dropped > 0 {
            self.metrics.overflow_dropped.inc_by(outcome.dropped as u64);
        }
        self.metrics.buffer_depth.set(self.buffer.len() as i64);

        if outcome.should_flush {
            self.shipper.flush();
        }
    }
}
