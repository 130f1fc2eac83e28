//! Tailship - restart-safe log tailing and shipping agent
//!
//! This crate tails log files with rotation detection, deduplicates and
//! batches the parsed lines, and ships them to an ingestion API with
//! at-least-once delivery. Optional samplers post host, container and HTTP
//! endpoint telemetry to the same API.

pub mod agent;
pub mod api;
pub mod config;
pub mod facts;
pub mod logs;
pub mod metrics;
pub mod monitors;
pub mod scheduler;
pub mod status;
