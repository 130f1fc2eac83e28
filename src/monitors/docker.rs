//! Container metrics via the docker CLI
//!
//! Every container (running or not) is listed with `docker ps -a`, then
//! `docker inspect` supplies health, timestamps, exit code and restart
//! information. Running containers additionally get a `docker stats
//! --no-stream` sample. A container whose inspect or stats call fails is
//! still reported, with those fields left at their defaults.

use super::command::{CommandRunner, SystemRunner};
use crate::api::{ApiClient, Endpoint, ShipError, Transport};
use crate::logs::SourceIdentity;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(15);
const STATS_TIMEOUT: Duration = Duration::from_secs(15);

/// Docker's placeholder for "never happened"
const ZERO_TIMESTAMP: &str = "0001-01-01T00:00:00Z";

const PS_FORMAT: &str = "{{.ID}}\t{{.Names}}\t{{.Image}}\t{{.Status}}\t{{.State}}";
const STATS_FORMAT: &str =
    "{{.CPUPerc}}\t{{.MemUsage}}\t{{.MemPerc}}\t{{.NetIO}}\t{{.BlockIO}}\t{{.PIDs}}";

/// One container's sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerMetrics {
    pub container_id: String,
    pub container_name: String,
    pub image: String,
    /// running, exited, paused, ...
    pub status: String,
    pub health_status: String,
    pub exit_code: Option<i64>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub uptime_seconds: Option<i64>,
    pub restart_count: u64,
    pub last_restart_reason: String,
    pub cpu_usage_percent: Option<f64>,
    pub memory_usage_bytes: Option<u64>,
    pub memory_limit_bytes: Option<u64>,
    pub memory_usage_percent: Option<f64>,
    pub network_rx_bytes: Option<u64>,
    pub network_tx_bytes: Option<u64>,
    pub block_read_bytes: Option<u64>,
    pub block_write_bytes: Option<u64>,
    pub pids: Option<u64>,
}

impl ContainerMetrics {
    fn new(container_id: &str, name: &str, image: &str, state: &str) -> Self {
        Self {
            container_id: container_id.to_string(),
            container_name: name.to_string(),
            image: image.to_string(),
            status: state.to_string(),
            health_status: "none".to_string(),
            exit_code: None,
            started_at: None,
            finished_at: None,
            uptime_seconds: None,
            restart_count: 0,
            last_restart_reason: String::new(),
            cpu_usage_percent: None,
            memory_usage_bytes: None,
            memory_limit_bytes: None,
            memory_usage_percent: None,
            network_rx_bytes: None,
            network_tx_bytes: None,
            block_read_bytes: None,
            block_write_bytes: None,
            pids: None,
        }
    }

    /// Fill state fields from one `docker inspect` element
    fn apply_inspect(&mut self, data: &Value, now: DateTime<Utc>) {
        let state = &data["State"];

        self.health_status = state["Health"]["Status"]
            .as_str()
            .unwrap_or("none")
            .to_string();

        if let Some(started) = real_timestamp(&state["StartedAt"]) {
            if let Ok(start) = DateTime::parse_from_rfc3339(started) {
                let uptime = (now - start.with_timezone(&Utc)).num_seconds();
                if uptime > 0 {
                    self.uptime_seconds = Some(uptime);
                }
            }
            self.started_at = Some(started.to_string());
        }
        if let Some(finished) = real_timestamp(&state["FinishedAt"]) {
            self.finished_at = Some(finished.to_string());
        }

        self.exit_code = state["ExitCode"].as_i64();
        self.restart_count = data["RestartCount"].as_u64().unwrap_or(0);

        let mut reasons = Vec::new();
        if state["OOMKilled"].as_bool().unwrap_or(false) {
            reasons.push("OOMKilled".to_string());
        }
        if let Some(error) = state["Error"].as_str().filter(|e| !e.is_empty()) {
            reasons.push(error.to_string());
        }
        self.last_restart_reason = reasons.join("; ");
    }

    /// Fill resource fields from one `docker stats` line
    fn apply_stats(&mut self, line: &str) -> Result<()> {
        let parts: Vec<&str> = line.trim().split('\t').collect();
        if parts.len() < 6 {
            return Err(anyhow!("unexpected stats line: {:?}", line));
        }

        self.cpu_usage_percent = parse_percentage(parts[0]);
        if let Some((usage, limit)) = parts[1].split_once('/') {
            self.memory_usage_bytes = parse_size(usage);
            self.memory_limit_bytes = parse_size(limit);
        }
        self.memory_usage_percent = parse_percentage(parts[2]);
        (self.network_rx_bytes, self.network_tx_bytes) = parse_io_pair(parts[3]);
        (self.block_read_bytes, self.block_write_bytes) = parse_io_pair(parts[4]);
        self.pids = parts[5].trim().parse().ok();
        Ok(())
    }
}

fn real_timestamp(value: &Value) -> Option<&str> {
    value
        .as_str()
        .filter(|ts| !ts.is_empty() && *ts != ZERO_TIMESTAMP)
}

/// Container sampler, available only when a docker daemon answered at startup
pub struct DockerMonitor<R: CommandRunner = SystemRunner> {
    runner: R,
    available: bool,
}

impl DockerMonitor<SystemRunner> {
    /// Detect the host docker once
    pub fn detect() -> Self {
        Self::with_runner(SystemRunner)
    }
}

impl<R: CommandRunner> DockerMonitor<R> {
    /// Ask the daemon for its version; any failure marks docker unavailable
    pub fn with_runner(runner: R) -> Self {
        let available = match runner.run(
            "docker",
            &["version", "--format", "{{.Server.Version}}"],
            DETECT_TIMEOUT,
        ) {
            Ok(output) if output.success() => {
                info!("Docker detected: {}", output.stdout.trim());
                true
            }
            Ok(output) => {
                debug!("Docker not accessible: {}", output.stderr.trim());
                false
            }
            Err(e) => {
                debug!("Docker not available: {:#}", e);
                false
            }
        };
        Self { runner, available }
    }

    pub fn available(&self) -> bool {
        self.available
    }

    /// Sample every container on the host
    pub fn collect(&self) -> Result<Vec<ContainerMetrics>> {
        if !self.available {
            return Ok(Vec::new());
        }

        let output = self
            .runner
            .run("docker", &["ps", "-a", "--format", PS_FORMAT], LIST_TIMEOUT)
            .context("docker ps failed")?;
        if !output.success() {
            return Err(anyhow!("docker ps failed: {}", output.stderr.trim()));
        }

        let now = Utc::now();
        let mut containers = Vec::new();
        for line in output.stdout.lines().filter(|l| !l.trim().is_empty()) {
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 5 {
                continue;
            }
            let mut metrics = ContainerMetrics::new(parts[0], parts[1], parts[2], parts[4]);
            self.inspect(&mut metrics, now);
            if metrics.status == "running" {
                self.stats(&mut metrics);
            }
            containers.push(metrics);
        }

        Ok(containers)
    }

    fn inspect(&self, metrics: &mut ContainerMetrics, now: DateTime<Utc>) {
        let result = self
            .runner
            .run("docker", &["inspect", &metrics.container_id], INSPECT_TIMEOUT)
            .and_then(|output| {
                if !output.success() {
                    return Err(anyhow!("exit code {:?}", output.exit_code));
                }
                let data: Value = serde_json::from_str(&output.stdout)?;
                data.get(0)
                    .cloned()
                    .ok_or_else(|| anyhow!("empty inspect output"))
            });

        match result {
            Ok(data) => metrics.apply_inspect(&data, now),
            Err(e) => debug!(container = %metrics.container_name, "Error inspecting container: {:#}", e),
        }
    }

    fn stats(&self, metrics: &mut ContainerMetrics) {
        let id = metrics.container_id.clone();
        let result = self
            .runner
            .run(
                "docker",
                &["stats", "--no-stream", "--format", STATS_FORMAT, &id],
                STATS_TIMEOUT,
            )
            .and_then(|output| {
                if !output.success() {
                    return Err(anyhow!("exit code {:?}", output.exit_code));
                }
                metrics.apply_stats(&output.stdout)
            });

        if let Err(e) = result {
            debug!(container = %metrics.container_name, "Error getting container stats: {:#}", e);
        }
    }
}

#[derive(Serialize)]
struct ContainerReport<'a> {
    #[serde(flatten)]
    source: &'a SourceIdentity,
    collected_at: DateTime<Utc>,
    containers: &'a [ContainerMetrics],
}

/// POST a container sample to `/core/agent/docker-metrics/`
pub fn send_container_metrics<T: Transport>(
    client: &ApiClient<T>,
    source: &SourceIdentity,
    containers: &[ContainerMetrics],
) -> Result<(), ShipError> {
    let report = ContainerReport {
        source,
        collected_at: Utc::now(),
        containers,
    };
    match client.post_json(&Endpoint::docker_metrics(), &report) {
        Ok(_) => {
            debug!(count = containers.len(), "Docker metrics sent");
            Ok(())
        }
        Err(e) => {
            warn!("Failed to send Docker metrics: {}", e);
            Err(e)
        }
    }
}

/// Parse `15.34%`
pub fn parse_percentage(text: &str) -> Option<f64> {
    text.trim().trim_end_matches('%').trim().parse().ok()
}

/// Parse docker size strings such as `1.5GiB`, `500MiB`, `2.3kB`, `0B`
pub fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim();
    let split = text.find(|c: char| c.is_ascii_alphabetic())?;
    let (number, unit) = text.split_at(split);
    let value: f64 = number.trim().parse().ok()?;

    let multiplier: f64 = match unit.to_ascii_lowercase().as_str() {
        "b" => 1.0,
        "kb" => 1e3,
        "kib" => 1024.0,
        "mb" => 1e6,
        "mib" => 1024f64.powi(2),
        "gb" => 1e9,
        "gib" => 1024f64.powi(3),
        "tb" => 1e12,
        "tib" => 1024f64.powi(4),
        _ => 1.0,
    };
    Some((value * multiplier).round() as u64)
}

/// Parse `1.2MB / 3.4MB` into (in, out)
pub fn parse_io_pair(text: &str) -> (Option<u64>, Option<u64>) {
    match text.split_once('/') {
        Some((inbound, outbound)) => (parse_size(inbound), parse_size(outbound)),
        None => (None, None),
    }
}
