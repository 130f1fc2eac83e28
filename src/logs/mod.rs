//! Log tailing and shipping pipeline
//!
//! Tailer -> Line Parser -> Deduplicator -> Batch Buffer -> Shipper.
//! Positions are restored once at startup and checkpointed periodically.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;

pub mod buffer;
pub mod dedup;
pub mod file_log_source;
pub mod log_parser;
pub mod pipeline;
pub mod positions;
pub mod shipper;

pub use buffer::{AppendOutcome, BatchBuffer};
pub use dedup::{content_hash, DedupWindow, Deduplicator};
pub use file_log_source::{FileTailer, PollOutcome, PollSummary, WatchedFile};
pub use log_parser::{LineParser, ParsedLine};
pub use pipeline::LogPipeline;
pub use positions::{PositionStore, SharedPositions};
pub use shipper::{FlushOutcome, Shipper};

/// Metadata key holding the origin file path
pub const META_FILE_PATH: &str = "file_path";
/// Metadata key holding the byte offset the line started at
pub const META_OFFSET: &str = "offset";

/// Caller-assigned identity attached to every shipped record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SourceIdentity {
    /// Pre-registered log source
    Explicit { log_source_id: String },
    /// Auto-discovered machine
    Machine {
        machine_id: String,
        hostname: String,
    },
}

/// A parsed log line ready for shipment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Parsed timestamp, or wall-clock time at parse
    pub timestamp: DateTime<Utc>,
    /// Normalized level (INFO when none recognized)
    pub level: String,
    pub message: String,
    pub raw_message: String,
    /// Always includes the origin file path
    pub metadata: HashMap<String, Value>,
    #[serde(flatten)]
    pub source: SourceIdentity,
    /// Dedup token; empty until the record passes the deduplicator
    #[serde(default)]
    pub content_hash: String,
}

impl LogRecord {
    /// Build a record from a parsed line read at `offset` of `path`
    pub fn from_parsed(
        parsed: ParsedLine,
        path: &Path,
        offset: u64,
        source: SourceIdentity,
    ) -> Self {
        let mut metadata = HashMap::new();
        metadata.insert(
            META_FILE_PATH.to_string(),
            Value::String(path.to_string_lossy().into_owned()),
        );
        metadata.insert(META_OFFSET.to_string(), Value::Number(offset.into()));

        Self {
            timestamp: parsed.timestamp,
            level: parsed.level,
            message: parsed.message,
            raw_message: parsed.raw_message,
            metadata,
            source,
            content_hash: String::new(),
        }
    }
}

/// Destination for records produced by the tailer.
///
/// `offset` is the byte position the line started at in `path`.
pub trait RecordSink {
    fn accept(&self, path: &Path, offset: u64, record: LogRecord);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_serializes_flat_identity() {
        let parsed = LineParser::new().parse("2024-01-01 10:00:00 ERROR boom");
        let record = LogRecord::from_parsed(
            parsed,
            Path::new("/var/log/app.log"),
            42,
            SourceIdentity::Machine {
                machine_id: "m-1".to_string(),
                hostname: "web-1".to_string(),
            },
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["machine_id"], "m-1");
        assert_eq!(json["hostname"], "web-1");
        assert_eq!(json["level"], "ERROR");
        assert_eq!(json["metadata"]["file_path"], "/var/log/app.log");
        assert_eq!(json["metadata"]["offset"], 42);
        assert!(json["timestamp"].is_string());
        assert!(json.get("log_source_id").is_none());
    }

    #[test]
    fn test_explicit_identity_fields() {
        let identity = SourceIdentity::Explicit {
            log_source_id: "7".to_string(),
        };
        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json, serde_json::json!({ "log_source_id": "7" }));
    }
}
