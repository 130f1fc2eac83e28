//! Prometheus metrics for the tailing pipeline
//!
//! Each agent owns its own registry so several agents (or tests) can live in
//! one process. Counters use the `*_total` suffix.

use anyhow::{Context, Result};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

pub struct AgentMetrics {
    registry: Registry,
    pub lines_read: IntCounter,
    pub records_shipped: IntCounter,
    pub duplicates_dropped: IntCounter,
    pub flush_failures: IntCounter,
    pub overflow_dropped: IntCounter,
    pub rotations: IntCounter,
    /// Failed heartbeat and sampler submissions, by `kind`
    pub telemetry_failures: IntCounterVec,
    /// Records waiting in the batch buffer
    pub buffer_depth: IntGauge,
    pub watched_files: IntGauge,
}

impl AgentMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let lines_read = counter(
            &registry,
            "tailship_lines_read_total",
            "Non-blank lines read from watched files",
        )?;
        let records_shipped = counter(
            &registry,
            "tailship_records_shipped_total",
            "Records acknowledged by the ingestion API",
        )?;
        let duplicates_dropped = counter(
            &registry,
            "tailship_duplicates_dropped_total",
            "Lines suppressed by the dedup window",
        )?;
        let flush_failures = counter(
            &registry,
            "tailship_flush_failures_total",
            "Log batch submissions that failed and were re-queued",
        )?;
        let overflow_dropped = counter(
            &registry,
            "tailship_records_overflow_dropped_total",
            "Records discarded because the batch buffer was full",
        )?;
        let rotations = counter(
            &registry,
            "tailship_rotations_detected_total",
            "Truncations or replacements of watched files",
        )?;

        let telemetry_failures = IntCounterVec::new(
            Opts::new(
                "tailship_telemetry_failures_total",
                "Heartbeat and sampler submissions that were not delivered",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(telemetry_failures.clone()))?;

        let buffer_depth = IntGauge::new("tailship_buffer_depth", "Records awaiting shipment")?;
        registry.register(Box::new(buffer_depth.clone()))?;
        let watched_files = IntGauge::new("tailship_watched_files", "Configured log files")?;
        registry.register(Box::new(watched_files.clone()))?;

        Ok(Self {
            registry,
            lines_read,
            records_shipped,
            duplicates_dropped,
            flush_failures,
            overflow_dropped,
            rotations,
            telemetry_failures,
            buffer_depth,
            watched_files,
        })
    }

    /// Prometheus text exposition of every metric
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        String::from_utf8(buffer).context("Metrics output was not UTF-8")
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> Result<IntCounter> {
    let counter = IntCounter::new(name, help)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exposed() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.lines_read.inc_by(3);
        metrics.buffer_depth.set(7);

        let text = metrics.encode().unwrap();
        assert!(text.contains("tailship_lines_read_total 3"));
        assert!(text.contains("tailship_buffer_depth 7"));
        assert!(text.contains("tailship_rotations_detected_total 0"));
    }

    #[test]
    fn test_telemetry_failures_are_labelled() {
        let metrics = AgentMetrics::new().unwrap();
        metrics.telemetry_failures.with_label_values(&["docker"]).inc();

        let text = metrics.encode().unwrap();
        assert!(text.contains("tailship_telemetry_failures_total{kind=\"docker\"} 1"));
    }

    #[test]
    fn test_independent_registries() {
        let a = AgentMetrics::new().unwrap();
        let b = AgentMetrics::new().unwrap();
        a.records_shipped.inc();
        assert_eq!(a.records_shipped.get(), 1);
        assert_eq!(b.records_shipped.get(), 0);
    }
}
