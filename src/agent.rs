//! Agent mode implementation
//!
//! The [`Agent`] owns every piece of pipeline state (positions, dedup
//! window, batch buffer, API client) and drives it from a set of periodic
//! loops, one OS thread each. Lifecycle:
//!
//! `Idle -> Starting -> Running -> Stopping -> Terminated`
//!
//! `start()` validates the configuration before any loop is spawned and
//! fails closed. `stop()` joins the loops, then performs one final flush and
//! one checkpoint save so a clean shutdown loses nothing that was read.

use crate::api::{ApiClient, Endpoint, HttpTransport, ShipError, Transport};
use crate::config::{AgentConfig, AgentMode};
use crate::facts::{send_host_sample, HostSampler};
use crate::logs::{
    FileTailer, FlushOutcome, LogPipeline, PollSummary, PositionStore, SharedPositions,
    SourceIdentity,
};
use crate::metrics::AgentMetrics;
use crate::monitors::{send_check_results, send_container_metrics, DockerMonitor, HttpMonitor};
use crate::scheduler::{spawn_loop, LoopSpec, RunFlag};
use crate::status::StatusHandle;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use std::fs::File;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl AgentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Stopping => "stopping",
            AgentState::Terminated => "terminated",
        }
    }
}

/// Identity stamped on records and telemetry for `config`'s mode
pub fn source_identity(config: &AgentConfig) -> SourceIdentity {
    match config.mode() {
        AgentMode::ExplicitSource(log_source_id) => SourceIdentity::Explicit { log_source_id },
        AgentMode::MachineId => {
            let identity = config.identity();
            SourceIdentity::Machine {
                machine_id: identity.machine_id.clone(),
                hostname: identity.hostname.clone(),
            }
        }
    }
}

fn mode_name(mode: &AgentMode) -> &'static str {
    match mode {
        AgentMode::ExplicitSource(_) => "explicit_source",
        AgentMode::MachineId => "machine_id",
    }
}

pub struct Agent<T: Transport + 'static> {
    config: Arc<AgentConfig>,
    client: Arc<ApiClient<T>>,
    metrics: Arc<AgentMetrics>,
    source: SourceIdentity,
    positions: Arc<SharedPositions>,
    store: Arc<PositionStore>,
    tailer: Arc<Mutex<FileTailer>>,
    pipeline: Arc<LogPipeline<T>>,
    state: Arc<Mutex<AgentState>>,
    flag: RunFlag,
    loops: Vec<(&'static str, JoinHandle<()>)>,
    started_at: DateTime<Utc>,
}

impl Agent<HttpTransport> {
    /// Agent talking to the configured endpoint over HTTP. Must be called
    /// outside of any async runtime.
    pub fn from_config(config: AgentConfig) -> Result<Self> {
        let transport = HttpTransport::new().context("Failed to create HTTP client")?;
        Self::new(config, transport)
    }
}

impl<T: Transport + 'static> Agent<T> {
    /// Restore positions and assemble the pipeline. Nothing runs until
    /// [`Agent::start`].
    pub fn new(config: AgentConfig, transport: T) -> Result<Self> {
        let metrics = Arc::new(AgentMetrics::new()?);
        let client = Arc::new(ApiClient::new(
            &config.api_endpoint,
            &config.api_token,
            transport,
        ));
        let source = source_identity(&config);

        let store = Arc::new(PositionStore::new(config.positions_path()));
        let positions = Arc::new(SharedPositions::new(store.load()));
        let tailer = FileTailer::new(&config.log_files, Arc::clone(&positions), source.clone());
        metrics.watched_files.set(tailer.files().len() as i64);

        let pipeline = Arc::new(LogPipeline::from_config(
            &config,
            Arc::clone(&client),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config: Arc::new(config),
            client,
            metrics,
            source,
            positions,
            store,
            tailer: Arc::new(Mutex::new(tailer)),
            pipeline,
            state: Arc::new(Mutex::new(AgentState::Idle)),
            flag: RunFlag::default(),
            loops: Vec::new(),
            started_at: Utc::now(),
        })
    }

    fn state_guard(&self) -> MutexGuard<'_, AgentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: AgentState) {
        *self.state_guard() = state;
        debug!(state = state.as_str(), "Agent state changed");
    }

    pub fn status(&self) -> AgentState {
        *self.state_guard()
    }

    pub fn is_running(&self) -> bool {
        self.status() == AgentState::Running
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    pub fn source(&self) -> &SourceIdentity {
        &self.source
    }

    /// Names of the loops currently running
    pub fn loop_names(&self) -> Vec<&'static str> {
        self.loops.iter().map(|(name, _)| *name).collect()
    }

    pub fn status_handle(&self) -> StatusHandle {
        StatusHandle {
            state: Arc::clone(&self.state),
            buffer: Arc::clone(self.pipeline.buffer()),
            metrics: Arc::clone(&self.metrics),
            mode: mode_name(&self.config.mode()).to_string(),
            started_at: self.started_at,
        }
    }

    /// Read new lines from every watched file into the pipeline
    pub fn poll_files(&self) -> PollSummary {
        poll_once(&self.tailer, &self.pipeline, &self.metrics)
    }

    /// Ship whatever is buffered
    pub fn flush(&self) -> FlushOutcome {
        self.pipeline.flush()
    }

    /// Persist the current read positions
    pub fn checkpoint(&self) -> Result<()> {
        self.positions.checkpoint(&self.store)
    }

    /// Validate the configuration and spawn every loop
    pub fn start(&mut self) -> Result<()> {
        match self.status() {
            AgentState::Idle => {}
            state => return Err(anyhow!("Agent cannot start from state {}", state.as_str())),
        }
        self.set_state(AgentState::Starting);

        if let Err(e) = self.config.validate() {
            error!("Invalid configuration: {:#}", e);
            self.set_state(AgentState::Terminated);
            return Err(e);
        }

        info!(
            mode = mode_name(&self.config.mode()),
            files = self.config.log_files.len(),
            "Starting tailship agent"
        );

        self.flag.start();
        if let Err(e) = self.spawn_loops() {
            error!("Failed to start agent loops: {:#}", e);
            self.flag.stop();
            self.join_loops();
            self.set_state(AgentState::Terminated);
            return Err(e);
        }

        self.set_state(AgentState::Running);
        info!(loops = ?self.loop_names(), "Agent started");
        Ok(())
    }

    fn spawn_loops(&mut self) -> Result<()> {
        let config = Arc::clone(&self.config);

        {
            let tailer = Arc::clone(&self.tailer);
            let pipeline = Arc::clone(&self.pipeline);
            let metrics = Arc::clone(&self.metrics);
            self.spawn(
                LoopSpec::new("poll", Duration::from_secs(config.poll_interval)),
                move || {
                    poll_once(&tailer, &pipeline, &metrics);
                    Ok(())
                },
            )?;
        }

        {
            let pipeline = Arc::clone(&self.pipeline);
            self.spawn(
                LoopSpec::new("flush", Duration::from_secs(config.flush_interval)).delayed(),
                move || {
                    pipeline.flush();
                    Ok(())
                },
            )?;
        }

        {
            let positions = Arc::clone(&self.positions);
            let store = Arc::clone(&self.store);
            self.spawn(
                LoopSpec::new("checkpoint", Duration::from_secs(config.checkpoint_interval))
                    .delayed(),
                move || {
                    positions
                        .checkpoint(&store)
                        .context("Failed to save checkpoint")
                },
            )?;
        }

        if let AgentMode::ExplicitSource(log_source_id) = config.mode() {
            let client = Arc::clone(&self.client);
            let metrics = Arc::clone(&self.metrics);
            let endpoint = Endpoint::heartbeat(&log_source_id);
            self.spawn(
                LoopSpec::new("heartbeat", Duration::from_secs(config.heartbeat_interval)),
                move || {
                    let sent = client.call(&endpoint).map(|_| debug!("Heartbeat sent successfully"));
                    if let Err(e) = &sent {
                        warn!("Heartbeat failed: {}", e);
                    }
                    record_delivery(&metrics, "heartbeat", sent);
                    Ok(())
                },
            )?;
        } else {
            debug!("Machine-id mode, heartbeat loop disabled");
        }

        let sampler = HostSampler::from_config(&config);
        if sampler.available() {
            let client = Arc::clone(&self.client);
            let metrics = Arc::clone(&self.metrics);
            self.spawn(
                LoopSpec::new("host-metrics", Duration::from_secs(config.metrics_interval)),
                move || {
                    let sent = send_host_sample(&client, &sampler.collect());
                    record_delivery(&metrics, "host_metrics", sent);
                    Ok(())
                },
            )?;
        }

        if config.docker_enabled {
            let docker = DockerMonitor::detect();
            if docker.available() {
                let client = Arc::clone(&self.client);
                let metrics = Arc::clone(&self.metrics);
                let source = self.source.clone();
                self.spawn(
                    LoopSpec::new("docker", Duration::from_secs(config.docker_interval)),
                    move || {
                        let containers = docker.collect()?;
                        let sent = send_container_metrics(&client, &source, &containers);
                        record_delivery(&metrics, "docker", sent);
                        Ok(())
                    },
                )?;
            }
        }

        let http = HttpMonitor::new(&config.http_services)?;
        if http.available() {
            info!(services = http.service_count(), "HTTP checks enabled");
            let client = Arc::clone(&self.client);
            let metrics = Arc::clone(&self.metrics);
            let source = self.source.clone();
            self.spawn(
                LoopSpec::new("http-checks", Duration::from_secs(config.http_check_interval)),
                move || {
                    let sent = send_check_results(&client, &source, &http.collect());
                    record_delivery(&metrics, "http_checks", sent);
                    Ok(())
                },
            )?;
        }

        Ok(())
    }

    fn spawn<F>(&mut self, spec: LoopSpec, body: F) -> Result<()>
    where
        F: FnMut() -> Result<()> + Send + 'static,
    {
        let name = spec.name;
        let handle = spawn_loop(spec, self.flag.clone(), body)
            .with_context(|| format!("Failed to spawn {} loop", name))?;
        self.loops.push((name, handle));
        Ok(())
    }

    fn join_loops(&mut self) {
        for (name, handle) in self.loops.drain(..) {
            if handle.join().is_err() {
                error!("{} loop panicked", name);
            }
        }
    }

    /// Stop every loop, then flush and checkpoint one last time
    pub fn stop(&mut self) -> Result<()> {
        if self.status() == AgentState::Terminated {
            return Ok(());
        }

        info!("Stopping tailship agent");
        self.set_state(AgentState::Stopping);
        self.flag.stop();
        self.join_loops();

        match self.pipeline.flush() {
            FlushOutcome::Requeued { count, .. } => {
                warn!(count, "Final flush failed, records remain unshipped")
            }
            FlushOutcome::Delivered(count) => info!(count, "Final flush delivered"),
            FlushOutcome::Empty => {}
        }

        let saved = self.checkpoint().context("Failed to save final checkpoint");
        self.set_state(AgentState::Terminated);
        info!("Agent stopped");
        saved
    }
}

impl<T: Transport + 'static> Drop for Agent<T> {
    fn drop(&mut self) {
        self.flag.stop();
        self.join_loops();
    }
}

fn poll_once<T: Transport>(
    tailer: &Mutex<FileTailer>,
    pipeline: &LogPipeline<T>,
    metrics: &AgentMetrics,
) -> PollSummary {
    let summary = tailer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .poll(pipeline);

    if summary.rotations > 0 {
        metrics.rotations.inc_by(summary.rotations as u64);
    }
    if summary.lines > 0 {
        debug!(lines = summary.lines, bytes = summary.bytes, "Read new log lines");
    }
    summary
}

/// Count an undelivered heartbeat or sample; the loop retries on its next tick
fn record_delivery(metrics: &AgentMetrics, kind: &str, sent: Result<(), ShipError>) {
    if let Err(e) = sent {
        metrics.telemetry_failures.with_label_values(&[kind]).inc();
        debug!(kind, "Not delivered, retrying next interval: {}", e);
    }
}

/// Outcome of `--test-config`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigCheck {
    /// Human-readable checklist, one line per check
    pub lines: Vec<String>,
    pub passed: bool,
}

impl ConfigCheck {
    fn ok(&mut self, line: impl Into<String>) {
        self.lines.push(format!("✓ {}", line.into()));
    }

    fn warn(&mut self, line: impl Into<String>) {
        self.lines.push(format!("⚠ {}", line.into()));
    }

    fn fail(mut self, line: impl Into<String>) -> Self {
        self.lines.push(format!("✗ {}", line.into()));
        self.passed = false;
        self
    }
}

/// Check required fields, API connectivity and log file readability
pub fn test_configuration<T: Transport>(config: &AgentConfig, client: &ApiClient<T>) -> ConfigCheck {
    let mut check = ConfigCheck::default();
    check.ok("Configuration file loaded successfully");

    if let Err(e) = config.validate() {
        return check.fail(format!("{:#}", e));
    }
    check.ok("All required fields present");

    check.lines.push("Testing API connectivity...".to_string());
    match config.mode() {
        AgentMode::ExplicitSource(log_source_id) => {
            match client.call(&Endpoint::log_source(&log_source_id)) {
                Ok(_) => check.ok("API connection successful"),
                Err(ShipError::UnexpectedStatus { status, .. }) => {
                    return check.fail(format!("API connection failed: {}", status))
                }
                Err(ShipError::Unauthorized) => {
                    return check.fail("API connection failed: 401")
                }
                Err(e) => return check.fail(format!("API connection failed: {}", e)),
            }
        }
        AgentMode::MachineId => match client.ping() {
            Ok(status) if status == 401 || status == 403 => {
                return check.fail(format!("API rejected the token: {}", status))
            }
            Ok(status) if status >= 500 => {
                return check.fail(format!("API server error: {}", status))
            }
            Ok(status) => check.ok(format!("API reachable (status {})", status)),
            Err(e) => return check.fail(format!("API connection failed: {}", e)),
        },
    }

    let total = config.log_files.len();
    let mut accessible = 0;
    for path in &config.log_files {
        if File::open(path).is_ok() {
            check.ok(format!("Log file accessible: {}", path.display()));
            accessible += 1;
        } else {
            check.warn(format!("Log file not accessible: {}", path.display()));
        }
    }

    if total > 0 && accessible == 0 {
        return check.fail("No log files are accessible");
    }

    check.passed = true;
    check.ok(format!(
        "Configuration test passed ({}/{} log files accessible)",
        accessible, total
    ));
    check
}
