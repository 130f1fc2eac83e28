//! Configuration management for tailship
//!
//! This module provides the agent configuration structure, loading from
//! JSON, YAML, or TOML files, environment overrides, startup validation,
//! and the machine identity derived once per configuration.
//!
//! # Examples
//!
//! **JSON Format:**
//! ```json
//! {
//!   "api_endpoint": "https://observability.example.com/api",
//!   "api_token": "s3cr3t",
//!   "log_files": ["/var/log/app.log", "/var/log/nginx/error.log"],
//!   "batch_size": 100,
//!   "flush_interval": 10,
//!   "http_services": [
//!     { "name": "My API", "url": "https://api.example.com/health" }
//!   ]
//! }
//! ```
//!
//! **YAML Format:**
//! ```yaml
//! api_endpoint: https://observability.example.com/api
//! api_token: s3cr3t
//! log_source_id: "42"
//! log_files:
//!   - /var/log/app.log
//! overflow_policy: drop_oldest
//! max_buffer_records: 50000
//! ```

use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding `api_token`
pub const TOKEN_ENV: &str = "TAILSHIP_API_TOKEN";
/// Environment variable overriding `api_endpoint`
pub const ENDPOINT_ENV: &str = "TAILSHIP_API_ENDPOINT";

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Base URL of the ingestion API
    pub api_endpoint: String,
    /// Bearer token for the ingestion API
    pub api_token: String,
    /// Explicit log source id (legacy mode). When absent the agent runs in
    /// machine-id mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_source_id: Option<String>,
    /// Override for the derived machine id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    /// Log files to tail, visited in this order
    pub log_files: Vec<PathBuf>,
    /// File poll interval (seconds)
    pub poll_interval: u64,
    /// Buffer flush interval (seconds)
    pub flush_interval: u64,
    /// Position checkpoint interval (seconds)
    pub checkpoint_interval: u64,
    /// Heartbeat interval, legacy mode only (seconds)
    pub heartbeat_interval: u64,
    /// Host metrics interval (seconds)
    pub metrics_interval: u64,
    /// Container metrics interval (seconds)
    pub docker_interval: u64,
    /// HTTP check interval (seconds)
    pub http_check_interval: u64,
    /// Records per batch; a full buffer flushes immediately
    pub batch_size: usize,
    /// Upper bound on buffered records (0 = unbounded)
    pub max_buffer_records: usize,
    /// What to drop once `max_buffer_records` is reached
    pub overflow_policy: OverflowPolicy,
    /// Number of recent content hashes remembered for deduplication
    pub dedup_window: usize,
    /// Directory for checkpoint and identity state
    pub state_dir: PathBuf,
    /// Checkpoint file (default: `<state_dir>/positions.json`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub positions_file: Option<PathBuf>,
    /// Log level name (DEBUG, INFO, WARNING, ERROR, CRITICAL)
    pub log_level: String,
    /// Whether host metrics are sampled and posted
    pub host_metrics_enabled: bool,
    /// Whether container metrics are sampled (still requires docker)
    pub docker_enabled: bool,
    /// Port for the local status server (disabled when absent)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_port: Option<u16>,
    /// HTTP endpoints to check
    pub http_services: Vec<HttpServiceConfig>,

    #[serde(skip)]
    pub(crate) identity: OnceCell<MachineIdentity>,
}

/// Buffer overflow handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest buffered record to make room
    #[default]
    DropOldest,
    /// Reject the incoming record
    DropNewest,
}

/// A single HTTP endpoint to check
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpServiceConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub method: String,
    /// Request timeout (seconds)
    pub timeout: u64,
    pub expected_status: u16,
    pub headers: HashMap<String, String>,
}

impl Default for HttpServiceConfig {
    fn default() -> Self {
        Self {
            name: "Unnamed".to_string(),
            url: None,
            method: "GET".to_string(),
            timeout: 10,
            expected_status: 200,
            headers: HashMap::new(),
        }
    }
}

/// Machine identity used in machine-id mode and in telemetry payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineIdentity {
    pub machine_id: String,
    pub hostname: String,
}

/// How the agent identifies itself to the ingestion API
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentMode {
    /// A pre-registered log source id; heartbeats are sent
    ExplicitSource(String),
    /// Auto-discovered machine id + hostname; no heartbeats
    MachineId,
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tailship")
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            api_endpoint: "http://localhost:8000/api".to_string(),
            api_token: String::new(),
            log_source_id: None,
            machine_id: None,
            log_files: Vec::new(),
            poll_interval: 2,
            flush_interval: 10,
            checkpoint_interval: 30,
            heartbeat_interval: 60,
            metrics_interval: 300,
            docker_interval: 60,
            http_check_interval: 60,
            batch_size: 100,
            max_buffer_records: 0,
            overflow_policy: OverflowPolicy::default(),
            dedup_window: 10_000,
            state_dir: default_state_dir(),
            positions_file: None,
            log_level: "INFO".to_string(),
            host_metrics_enabled: true,
            docker_enabled: true,
            status_port: None,
            http_services: Vec::new(),
            identity: OnceCell::new(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from `path`, writing a default template there if
    /// the file does not exist yet. Environment overrides are applied last.
    pub fn load_or_init(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            Self::load(path)?
        } else {
            let config = Self::default();
            config
                .write_template(path)
                .with_context(|| format!("Failed to write default config to {}", path.display()))?;
            config
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a file, choosing the format by extension
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = match path.extension().and_then(|s| s.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?,
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Invalid TOML in {}", path.display()))?,
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Invalid YAML in {}", path.display()))?,
            _ => {
                return Err(anyhow!(
                    "Unsupported config file format: {}",
                    path.display()
                ))
            }
        };

        Ok(config)
    }

    fn write_template(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let content = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => toml::to_string_pretty(self)?,
            Some("yaml") | Some("yml") => serde_yaml::to_string(self)?,
            _ => serde_json::to_string_pretty(self)?,
        };
        fs::write(path, content)?;
        Ok(())
    }

    /// Replace file values with `TAILSHIP_API_TOKEN` / `TAILSHIP_API_ENDPOINT`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                self.api_token = token;
            }
        }
        if let Ok(endpoint) = std::env::var(ENDPOINT_ENV) {
            if !endpoint.is_empty() {
                self.api_endpoint = endpoint;
            }
        }
    }

    /// Validate the configuration, reporting every problem at once
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.api_endpoint.trim().is_empty() {
            problems.push("missing required field: api_endpoint".to_string());
        } else if !(self.api_endpoint.starts_with("http://")
            || self.api_endpoint.starts_with("https://"))
        {
            problems.push(format!(
                "api_endpoint must be an http(s) URL: {}",
                self.api_endpoint
            ));
        }
        if self.api_token.trim().is_empty() {
            problems.push("missing required field: api_token".to_string());
        }
        if self.batch_size == 0 {
            problems.push("batch_size must be greater than 0".to_string());
        }

        let intervals = [
            ("poll_interval", self.poll_interval),
            ("flush_interval", self.flush_interval),
            ("checkpoint_interval", self.checkpoint_interval),
            ("heartbeat_interval", self.heartbeat_interval),
            ("metrics_interval", self.metrics_interval),
            ("docker_interval", self.docker_interval),
            ("http_check_interval", self.http_check_interval),
        ];
        for (name, value) in intervals {
            if value == 0 {
                problems.push(format!("{} must be greater than 0", name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("Invalid configuration: {}", problems.join("; ")))
        }
    }

    /// Which identification mode the agent runs in
    pub fn mode(&self) -> AgentMode {
        match self.log_source_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => AgentMode::ExplicitSource(id.to_string()),
            _ => AgentMode::MachineId,
        }
    }

    /// Path of the position checkpoint file
    pub fn positions_path(&self) -> PathBuf {
        self.positions_file
            .clone()
            .unwrap_or_else(|| self.state_dir.join("positions.json"))
    }

    /// Machine identity, resolved on first use and cached
    pub fn identity(&self) -> &MachineIdentity {
        self.identity.get_or_init(|| MachineIdentity {
            machine_id: self.resolve_machine_id(),
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn resolve_machine_id(&self) -> String {
        if let Some(id) = self.machine_id.as_deref().map(str::trim) {
            if !id.is_empty() {
                return id.to_string();
            }
        }

        for candidate in MACHINE_ID_PATHS {
            if let Ok(content) = fs::read_to_string(candidate) {
                let id = content.trim();
                if !id.is_empty() {
                    return id.to_string();
                }
            }
        }

        let persisted = self.state_dir.join("machine_id");
        if let Ok(content) = fs::read_to_string(&persisted) {
            let id = content.trim();
            if !id.is_empty() {
                return id.to_string();
            }
        }

        let generated = uuid::Uuid::new_v4().to_string();
        let saved = fs::create_dir_all(&self.state_dir)
            .and_then(|_| fs::write(&persisted, &generated));
        if let Err(e) = saved {
            tracing::warn!(
                "Could not persist generated machine id to {}: {}",
                persisted.display(),
                e
            );
        }
        generated
    }

    /// Map the configured level name onto a tracing filter directive
    pub fn tracing_level(&self) -> &'static str {
        match self.log_level.trim().to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => "debug",
            "WARNING" | "WARN" => "warn",
            "ERROR" | "CRITICAL" | "FATAL" => "error",
            _ => "info",
        }
    }
}

/// Determine the config file path when none was given on the command line
pub fn default_config_path() -> PathBuf {
    let local = PathBuf::from("agent_config.json");
    if local.exists() {
        return local;
    }

    let system = PathBuf::from("/etc/tailship/agent_config.json");
    if system.exists() {
        return system;
    }

    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tailship")
        .join("agent_config.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn valid_config() -> AgentConfig {
        AgentConfig {
            api_endpoint: "https://api.example.com/api".to_string(),
            api_token: "token".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.poll_interval, 2);
        assert_eq!(config.flush_interval, 10);
        assert_eq!(config.checkpoint_interval, 30);
        assert_eq!(config.heartbeat_interval, 60);
        assert_eq!(config.metrics_interval, 300);
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.dedup_window, 10_000);
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.mode(), AgentMode::MachineId);
    }

    #[test]
    fn test_validation_requires_endpoint_and_token() {
        let config = AgentConfig {
            api_endpoint: String::new(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("api_endpoint"));
        assert!(err.contains("api_token"));

        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let config = AgentConfig {
            batch_size: 0,
            flush_interval: 0,
            ..valid_config()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("batch_size"));
        assert!(err.contains("flush_interval"));
    }

    #[test]
    fn test_validation_rejects_non_http_endpoint() {
        let config = AgentConfig {
            api_endpoint: "ftp://example.com".to_string(),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mode_selection() {
        let mut config = valid_config();
        config.log_source_id = Some("  ".to_string());
        assert_eq!(config.mode(), AgentMode::MachineId);

        config.log_source_id = Some("17".to_string());
        assert_eq!(config.mode(), AgentMode::ExplicitSource("17".to_string()));
    }

    #[test]
    fn test_load_json_yaml_toml() {
        let temp_dir = TempDir::new().unwrap();

        let json_path = temp_dir.path().join("agent.json");
        fs::write(
            &json_path,
            r#"{"api_endpoint": "http://a/api", "api_token": "t", "batch_size": 5}"#,
        )
        .unwrap();
        let json = AgentConfig::load(&json_path).unwrap();
        assert_eq!(json.batch_size, 5);
        assert_eq!(json.poll_interval, 2);

        let yaml_path = temp_dir.path().join("agent.yml");
        fs::write(
            &yaml_path,
            "api_endpoint: http://a/api\napi_token: t\noverflow_policy: drop_newest\n",
        )
        .unwrap();
        let yaml = AgentConfig::load(&yaml_path).unwrap();
        assert_eq!(yaml.overflow_policy, OverflowPolicy::DropNewest);

        let toml_path = temp_dir.path().join("agent.toml");
        fs::write(
            &toml_path,
            "api_endpoint = \"http://a/api\"\napi_token = \"t\"\nlog_files = [\"/var/log/x.log\"]\n",
        )
        .unwrap();
        let toml = AgentConfig::load(&toml_path).unwrap();
        assert_eq!(toml.log_files, vec![PathBuf::from("/var/log/x.log")]);
    }

    #[test]
    fn test_unsupported_extension() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("agent.ini");
        fs::write(&path, "x=1").unwrap();
        assert!(AgentConfig::load(&path).is_err());
    }

    #[test]
    fn test_missing_file_writes_template() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("agent_config.json");

        let config = AgentConfig::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.batch_size, 100);

        let reloaded = AgentConfig::load(&path).unwrap();
        assert_eq!(reloaded.api_endpoint, config.api_endpoint);
    }

    #[test]
    fn test_http_service_defaults() {
        let config: AgentConfig = serde_json::from_str(
            r#"{"http_services": [{"url": "https://example.com"}]}"#,
        )
        .unwrap();
        let service = &config.http_services[0];
        assert_eq!(service.name, "Unnamed");
        assert_eq!(service.method, "GET");
        assert_eq!(service.timeout, 10);
        assert_eq!(service.expected_status, 200);
    }

    #[test]
    fn test_identity_override_is_cached() {
        let temp_dir = TempDir::new().unwrap();
        let config = AgentConfig {
            machine_id: Some("machine-123".to_string()),
            state_dir: temp_dir.path().to_path_buf(),
            ..valid_config()
        };
        let first = config.identity().clone();
        assert_eq!(first.machine_id, "machine-123");
        assert_eq!(config.identity(), &first);
        assert!(!first.hostname.is_empty());
    }

    #[test]
    fn test_tracing_level_mapping() {
        let mut config = AgentConfig::default();
        config.log_level = "WARNING".to_string();
        assert_eq!(config.tracing_level(), "warn");
        config.log_level = "critical".to_string();
        assert_eq!(config.tracing_level(), "error");
        config.log_level = "bogus".to_string();
        assert_eq!(config.tracing_level(), "info");
    }

    #[test]
    fn test_positions_path_default() {
        let config = AgentConfig {
            state_dir: PathBuf::from("/var/lib/tailship"),
            ..Default::default()
        };
        assert_eq!(
            config.positions_path(),
            PathBuf::from("/var/lib/tailship/positions.json")
        );
    }
}
