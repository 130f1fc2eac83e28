//! HTTP endpoint availability checks
//!
//! Each configured service is requested with its own method, headers and
//! timeout. A service is available when the final status (after redirects)
//! equals its expected status.

use crate::api::{classify, ApiClient, Endpoint, ShipError, Transport, TransportError};
use crate::config::HttpServiceConfig;
use crate::logs::SourceIdentity;
use crate::monitors::tls::{TlsInfo, TlsInspector};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_ERROR_LEN: usize = 200;

/// Outcome of checking one service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HttpCheckResult {
    pub service_name: String,
    pub url: String,
    pub method: String,
    pub is_available: bool,
    pub status_code: Option<u16>,
    /// `2xx`..`5xx`, or `error` when no response arrived
    pub status_category: String,
    pub response_time_ms: Option<f64>,
    pub error_message: Option<String>,
    /// Only set for https URLs
    pub tls_valid: Option<bool>,
    /// Days until the leaf certificate expires, negative once expired
    pub tls_expiry_days: Option<i64>,
    pub checked_at: DateTime<Utc>,
}

/// A service with a usable URL
#[derive(Debug, Clone)]
struct Target {
    name: String,
    url: String,
    method: Method,
    timeout: Duration,
    expected_status: u16,
    headers: Vec<(String, String)>,
}

pub struct HttpMonitor {
    client: reqwest::blocking::Client,
    targets: Vec<Target>,
    /// Only built when some target uses https
    tls: Option<TlsInspector>,
}

impl HttpMonitor {
    /// Must not be called from inside an async runtime
    pub fn new(services: &[HttpServiceConfig]) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .context("Failed to build HTTP check client")?;

        let mut targets = Vec::new();
        for service in services {
            let Some(url) = service.url.as_deref().filter(|u| !u.trim().is_empty()) else {
                warn!(service = %service.name, "HTTP service has no url, skipping");
                continue;
            };
            let method = match Method::from_bytes(service.method.to_ascii_uppercase().as_bytes()) {
                Ok(method) => method,
                Err(_) => {
                    warn!(service = %service.name, "Invalid HTTP method {:?}, skipping", service.method);
                    continue;
                }
            };
            targets.push(Target {
                name: service.name.clone(),
                url: url.to_string(),
                method,
                timeout: Duration::from_secs(service.timeout.max(1)),
                expected_status: service.expected_status,
                headers: service
                    .headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            });
        }

        let tls = if targets.iter().any(|t| t.url.starts_with("https://")) {
            Some(TlsInspector::native()?)
        } else {
            None
        };

        Ok(Self {
            client,
            targets,
            tls,
        })
    }

    /// True when at least one service can be checked
    pub fn available(&self) -> bool {
        !self.targets.is_empty()
    }

    pub fn service_count(&self) -> usize {
        self.targets.len()
    }

    /// Check every service in configuration order
    pub fn collect(&self) -> Vec<HttpCheckResult> {
        self.targets.iter().map(|t| self.check(t)).collect()
    }

    fn check(&self, target: &Target) -> HttpCheckResult {
        let is_https = target.url.starts_with("https://");
        let mut result = HttpCheckResult {
            service_name: target.name.clone(),
            url: target.url.clone(),
            method: target.method.to_string(),
            is_available: false,
            status_code: None,
            status_category: "error".to_string(),
            response_time_ms: None,
            error_message: None,
            tls_valid: None,
            tls_expiry_days: None,
            checked_at: Utc::now(),
        };

        let mut request = self
            .client
            .request(target.method.clone(), &target.url)
            .timeout(target.timeout);
        for (name, value) in &target.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let started = Instant::now();
        match request.send() {
            Ok(response) => {
                let status = response.status().as_u16();
                result.response_time_ms = Some(round2(started.elapsed().as_secs_f64() * 1000.0));
                result.status_code = Some(status);
                result.status_category = status_category(status).to_string();
                result.is_available = status == target.expected_status;
                if is_https {
                    result.tls_valid = Some(true);
                }
            }
            Err(e) => {
                let error = classify(&e);
                if is_https && matches!(error, TransportError::Tls(_)) {
                    result.tls_valid = Some(false);
                }
                result.error_message = Some(describe_failure(&error, target.timeout));
                debug!(service = %target.name, "HTTP check failed: {}", error);
            }
        }

        if is_https {
            if let Some(info) = self.inspect_tls(&target.url) {
                result.tls_valid = Some(info.valid);
                result.tls_expiry_days = info.expiry_days;
            }
        }

        result
    }

    fn inspect_tls(&self, url: &str) -> Option<TlsInfo> {
        let inspector = self.tls.as_ref()?;
        let url = reqwest::Url::parse(url).ok()?;
        let host = url.host_str()?;
        inspector.inspect(host, url.port_or_known_default().unwrap_or(443))
    }
}

#[derive(Serialize)]
struct CheckReport<'a> {
    #[serde(flatten)]
    source: &'a SourceIdentity,
    collected_at: DateTime<Utc>,
    checks: &'a [HttpCheckResult],
}

/// POST check results to `/core/agent/http-checks/`
pub fn send_check_results<T: Transport>(
    client: &ApiClient<T>,
    source: &SourceIdentity,
    checks: &[HttpCheckResult],
) -> Result<(), ShipError> {
    let report = CheckReport {
        source,
        collected_at: Utc::now(),
        checks,
    };
    match client.post_json(&Endpoint::http_checks(), &report) {
        Ok(_) => {
            debug!(count = checks.len(), "HTTP check results sent");
            Ok(())
        }
        Err(e) => {
            warn!("Failed to send HTTP check results: {}", e);
            Err(e)
        }
    }
}

pub fn status_category(status: u16) -> &'static str {
    match status {
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "error",
    }
}

fn describe_failure(error: &TransportError, timeout: Duration) -> String {
    let message = match error {
        TransportError::Timeout => format!("Timeout after {}s", timeout.as_secs()),
        TransportError::Tls(detail) => format!("SSL Error: {}", detail),
        TransportError::Connect(detail) => format!("Connection Error: {}", detail),
        TransportError::Other(detail) => format!("Request Error: {}", detail),
    };
    truncate(message, MAX_ERROR_LEN)
}

fn truncate(mut message: String, max: usize) -> String {
    if message.len() > max {
        let mut cut = max;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    message
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
