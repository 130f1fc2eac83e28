//! Ingestion API client
//!
//! Every call to the remote API goes through [`ApiClient`], which applies
//! bearer authentication and, when the server answers with one of the
//! endpoint's fallback statuses (401 for submissions), repeats the request
//! once with the token in an `api_key` query parameter instead.
//!
//! The wire is abstracted behind [`Transport`] so the pipeline can be driven
//! without a network; [`HttpTransport`] is the production implementation on
//! top of `reqwest::blocking`.

use reqwest::{Method, Url};
use serde::Serialize;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Query parameter carrying the token on the fallback attempt
pub const API_KEY_PARAM: &str = "api_key";

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(10);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

const USER_AGENT: &str = concat!("tailship/", env!("CARGO_PKG_VERSION"));

/// Failure below the HTTP status level
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("TLS failure: {0}")]
    Tls(String),
    #[error("{0}")]
    Other(String),
}

/// Why a request to the ingestion API did not succeed
#[derive(Debug, Error)]
pub enum ShipError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("authentication rejected after query-parameter fallback")]
    Unauthorized,
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus { status: u16, body: String },
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A fully resolved HTTP request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    /// Token for the `Authorization: Bearer` header, if any
    pub bearer: Option<String>,
    pub headers: Vec<(String, String)>,
    /// JSON body
    pub body: Option<Vec<u8>>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

/// Blocking request executor
pub trait Transport: Send + Sync {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError>;
}

/// One remote operation: where it lives and what counts as success
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: &'static str,
    pub method: Method,
    pub path: String,
    pub success: &'static [u16],
    /// Statuses that trigger the query-parameter retry
    pub fallback_on: &'static [u16],
    pub timeout: Duration,
}

impl Endpoint {
    /// POST `/logs/ingest/`
    pub fn logs() -> Self {
        Self::submit("logs", "/logs/ingest/", &[201])
    }

    /// POST `/agent/log-sources/{id}/heartbeat/`
    pub fn heartbeat(log_source_id: &str) -> Self {
        Self {
            timeout: HEARTBEAT_TIMEOUT,
            ..Self::submit(
                "heartbeat",
                &format!("/agent/log-sources/{}/heartbeat/", log_source_id),
                &[200],
            )
        }
    }

    /// POST `/core/agent/metrics/`
    pub fn host_metrics() -> Self {
        Self::submit("host-metrics", "/core/agent/metrics/", &[201])
    }

    /// POST `/core/agent/docker-metrics/`
    pub fn docker_metrics() -> Self {
        Self::submit("docker-metrics", "/core/agent/docker-metrics/", &[200, 201])
    }

    /// POST `/core/agent/http-checks/`
    pub fn http_checks() -> Self {
        Self::submit("http-checks", "/core/agent/http-checks/", &[200, 201])
    }

    /// GET `/agent/log-sources/{id}/`, used by `--test-config`
    pub fn log_source(log_source_id: &str) -> Self {
        Self {
            name: "log-source",
            method: Method::GET,
            path: format!("/agent/log-sources/{}/", log_source_id),
            success: &[200],
            fallback_on: &[401, 404],
            timeout: LOOKUP_TIMEOUT,
        }
    }

    fn submit(name: &'static str, path: &str, success: &'static [u16]) -> Self {
        Self {
            name,
            method: Method::POST,
            path: path.to_string(),
            success,
            fallback_on: &[401],
            timeout: SUBMIT_TIMEOUT,
        }
    }

    pub fn is_success(&self, status: u16) -> bool {
        self.success.contains(&status)
    }
}

/// Authenticated client for the ingestion API
pub struct ApiClient<T: Transport> {
    base_url: String,
    token: String,
    transport: T,
}

impl<T: Transport> ApiClient<T> {
    pub fn new(base_url: &str, token: &str, transport: T) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
            transport,
        }
    }

    /// Absolute URL of `endpoint`
    pub fn url_for(&self, endpoint: &Endpoint) -> String {
        format!("{}{}", self.base_url, endpoint.path)
    }

    /// Serialize `payload` and send it to `endpoint`
    pub fn post_json<S: Serialize + ?Sized>(
        &self,
        endpoint: &Endpoint,
        payload: &S,
    ) -> Result<ApiResponse, ShipError> {
        let body = serde_json::to_vec(payload)?;
        self.execute(endpoint, Some(body))
    }

    /// Send `endpoint` without a body
    pub fn call(&self, endpoint: &Endpoint) -> Result<ApiResponse, ShipError> {
        self.execute(endpoint, None)
    }

    fn execute(&self, endpoint: &Endpoint, body: Option<Vec<u8>>) -> Result<ApiResponse, ShipError> {
        let url = self.url_for(endpoint);
        let request = ApiRequest {
            method: endpoint.method.clone(),
            url: url.clone(),
            bearer: Some(self.token.clone()),
            headers: Vec::new(),
            body,
            timeout: endpoint.timeout,
        };

        let response = self.transport.send(&request)?;
        if endpoint.is_success(response.status) {
            return Ok(response);
        }

        if !endpoint.fallback_on.contains(&response.status) {
            return Err(ShipError::UnexpectedStatus {
                status: response.status,
                body: response.body,
            });
        }

        debug!(
            endpoint = endpoint.name,
            status = response.status,
            "Header auth rejected, retrying with query parameter"
        );

        let fallback = ApiRequest {
            url: with_query_token(&url, &self.token),
            bearer: None,
            ..request
        };
        let response = self.transport.send(&fallback)?;

        if endpoint.is_success(response.status) {
            Ok(response)
        } else if response.status == 401 {
            warn!(endpoint = endpoint.name, "API rejected token in header and query parameter");
            Err(ShipError::Unauthorized)
        } else {
            Err(ShipError::UnexpectedStatus {
                status: response.status,
                body: response.body,
            })
        }
    }

    /// GET on the API base with header auth; returns the raw status
    pub fn ping(&self) -> Result<u16, ShipError> {
        let request = ApiRequest {
            method: Method::GET,
            url: self.base_url.clone(),
            bearer: Some(self.token.clone()),
            headers: Vec::new(),
            body: None,
            timeout: LOOKUP_TIMEOUT,
        };
        Ok(self.transport.send(&request)?.status)
    }
}

/// Append `api_key=<token>` to `url`, URL-encoded
pub fn with_query_token(url: &str, token: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) => {
            parsed.query_pairs_mut().append_pair(API_KEY_PARAM, token);
            parsed.to_string()
        }
        Err(_) => {
            let separator = if url.contains('?') { '&' } else { '?' };
            format!("{}{}{}={}", url, separator, API_KEY_PARAM, token)
        }
    }
}

/// `reqwest::blocking` transport
pub struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Must not be called from inside an async runtime
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| classify(&e))?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn send(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout);

        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body.clone());
        }

        let response = builder.send().map_err(|e| classify(&e))?;
        let status = response.status().as_u16();
        let body = response.text().map_err(|e| classify(&e))?;
        Ok(ApiResponse { status, body })
    }
}

/// Map a reqwest failure onto the transport taxonomy
pub(crate) fn classify(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout;
    }

    let detail = error_chain(error);
    let lowered = detail.to_ascii_lowercase();
    if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
        TransportError::Tls(detail)
    } else if error.is_connect() {
        TransportError::Connect(detail)
    } else {
        TransportError::Other(detail)
    }
}

fn error_chain(error: &(dyn StdError + 'static)) -> String {
    let mut parts = vec![error.to_string()];
    let mut source = error.source();
    while let Some(cause) = source {
        parts.push(cause.to_string());
        source = cause.source();
    }
    parts.join(": ")
}
