//! Log shipper
//!
//! Drains the batch buffer and submits the records to `/logs/ingest/`.
//! A failed submission of any kind puts the whole batch back into the buffer
//! for the next flush, so data is delayed rather than lost. The same batch
//! may therefore be sent more than once; each record carries its content
//! hash so the server can discard repeats.

use super::{BatchBuffer, LogRecord};
use crate::api::{ApiClient, Endpoint, Transport};
use crate::metrics::AgentMetrics;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error};

/// Result of one flush cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was buffered
    Empty,
    /// This many records were acknowledged
    Delivered(usize),
    /// The batch failed and was handed back to the buffer
    Requeued { count: usize, reason: String },
}

pub struct Shipper<T: Transport> {
    client: Arc<ApiClient<T>>,
    buffer: Arc<BatchBuffer>,
    metrics: Arc<AgentMetrics>,
    /// Serializes whole flush cycles between the poll and flush threads
    flush_lock: Mutex<()>,
}

impl<T: Transport> Shipper<T> {
    pub fn new(client: Arc<ApiClient<T>>, buffer: Arc<BatchBuffer>, metrics: Arc<AgentMetrics>) -> Self {
        Self {
            client,
            buffer,
            metrics,
            flush_lock: Mutex::new(()),
        }
    }

    /// Ship everything currently buffered
    pub fn flush(&self) -> FlushOutcome {
        let _cycle = self
            .flush_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let batch = self.buffer.drain();
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }
        let count = batch.len();

        // Timestamps go out as RFC 3339 strings via chrono's serde support
        let outcome = match self.client.post_json(&Endpoint::logs(), &batch) {
            Ok(_) => {
                debug!(count, "Successfully sent log entries");
                self.metrics.records_shipped.inc_by(count as u64);
                FlushOutcome::Delivered(count)
            }
            Err(e) => {
                let reason = e.to_string();
                self.requeue(batch);
                error!(count, depth = self.buffer.len(), "Failed to send logs, re-queued batch: {}", reason);
                FlushOutcome::Requeued { count, reason }
            }
        };

        self.metrics.buffer_depth.set(self.buffer.len() as i64);
        outcome
    }

    fn requeue(&self, batch: Vec<LogRecord>) {
        self.metrics.flush_failures.inc();
        let dropped = self.buffer.re_admit(batch);
        if dropped > 0 {
            self.metrics.overflow_dropped.inc_by(dropped as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::ScriptedTransport;
    use crate::api::{TransportError, API_KEY_PARAM};
    use crate::logs::{LineParser, SourceIdentity};
    use std::path::Path;

    fn record(message: &str) -> LogRecord {
        let mut record = LogRecord::from_parsed(
            LineParser::new().parse(message),
            Path::new("/var/log/app.log"),
            0,
            SourceIdentity::Explicit {
                log_source_id: "5".to_string(),
            },
        );
        record.content_hash = format!("hash-{}", message);
        record
    }

    fn shipper(transport: &ScriptedTransport) -> (Shipper<ScriptedTransport>, Arc<BatchBuffer>) {
        let buffer = Arc::new(BatchBuffer::new(100));
        let client = Arc::new(ApiClient::new("http://api.test/api", "tok", transport.clone()));
        let metrics = Arc::new(AgentMetrics::new().unwrap());
        (Shipper::new(client, Arc::clone(&buffer), metrics), buffer)
    }

    #[test]
    fn test_empty_flush_sends_nothing() {
        let transport = ScriptedTransport::answering(201);
        let (shipper, _) = shipper(&transport);

        assert_eq!(shipper.flush(), FlushOutcome::Empty);
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_successful_flush_posts_json_array() {
        let transport = ScriptedTransport::answering(201);
        let (shipper, buffer) = shipper(&transport);
        buffer.append(record("one"));
        buffer.append(record("two"));

        assert_eq!(shipper.flush(), FlushOutcome::Delivered(2));
        assert!(buffer.is_empty());

        let bodies = transport.bodies_for("/logs/ingest/");
        assert_eq!(bodies.len(), 1);
        let batch = bodies[0].as_array().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0]["message"], "one");
        assert_eq!(batch[0]["log_source_id"], "5");
        assert_eq!(batch[0]["content_hash"], "hash-one");
        assert!(batch[0]["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_failure_requeues_and_next_flush_delivers() {
        let transport = ScriptedTransport::default();
        transport.push(Err(TransportError::Timeout));
        transport.set_default(201);
        let (shipper, buffer) = shipper(&transport);

        buffer.append(record("a"));
        buffer.append(record("b"));

        match shipper.flush() {
            FlushOutcome::Requeued { count, reason } => {
                assert_eq!(count, 2);
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(buffer.len(), 2);
        assert_eq!(shipper.metrics.flush_failures.get(), 1);

        buffer.append(record("c"));
        assert_eq!(shipper.flush(), FlushOutcome::Delivered(3));

        let bodies = transport.bodies_for("/logs/ingest/");
        let delivered: Vec<&str> = bodies[1]
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["message"].as_str().unwrap())
            .collect();
        assert_eq!(delivered, vec!["a", "b", "c"]);
        assert_eq!(shipper.metrics.records_shipped.get(), 3);
    }

    #[test]
    fn test_401_falls_back_once_then_requeues() {
        let transport = ScriptedTransport::answering(401);
        let (shipper, buffer) = shipper(&transport);
        buffer.append(record("secret"));

        assert!(matches!(shipper.flush(), FlushOutcome::Requeued { count: 1, .. }));

        let requests = transport.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].bearer.as_deref(), Some("tok"));
        assert!(requests[1].bearer.is_none());
        assert!(requests[1].url.contains(&format!("{}=tok", API_KEY_PARAM)));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_wrong_success_code_is_failure() {
        let transport = ScriptedTransport::answering(200);
        let (shipper, buffer) = shipper(&transport);
        buffer.append(record("x"));

        assert!(matches!(shipper.flush(), FlushOutcome::Requeued { .. }));
        assert_eq!(buffer.len(), 1);
    }
}
