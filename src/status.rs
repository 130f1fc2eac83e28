//! Local status server
//!
//! Serves `/health`, `/status` and `/metrics` while the agent runs. The
//! handlers only read shared agent state; they never touch the pipeline.

use crate::agent::AgentState;
use crate::logs::BatchBuffer;
use crate::metrics::AgentMetrics;
use anyhow::{Context, Result};
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Read-only view of the running agent
#[derive(Clone)]
pub struct StatusHandle {
    pub(crate) state: Arc<Mutex<AgentState>>,
    pub(crate) buffer: Arc<BatchBuffer>,
    pub(crate) metrics: Arc<AgentMetrics>,
    pub(crate) mode: String,
    pub(crate) started_at: DateTime<Utc>,
}

impl StatusHandle {
    pub fn state(&self) -> AgentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub fn router(handle: StatusHandle) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .layer(CorsLayer::permissive())
        .with_state(handle)
}

/// Bind the status port on all interfaces
pub async fn bind(port: u16) -> Result<TcpListener> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status server on {}", addr))
}

/// Bind `port` and serve in the background until `shutdown` resolves.
///
/// A port that cannot be bound is logged and the agent keeps running
/// without the status server.
pub async fn spawn<F>(port: u16, handle: StatusHandle, shutdown: F) -> Option<JoinHandle<Result<()>>>
where
    F: Future<Output = ()> + Send + 'static,
{
    match bind(port).await {
        Ok(listener) => Some(tokio::spawn(serve(listener, handle, shutdown))),
        Err(e) => {
            error!("{:#}, continuing without status server", e);
            None
        }
    }
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, handle: StatusHandle, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Status server listening on http://{}", addr);
    }
    axum::serve(listener, router(handle))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Status server failed")
}

async fn health_check(State(handle): State<StatusHandle>) -> (StatusCode, Json<serde_json::Value>) {
    let state = handle.state();
    if state == AgentState::Running {
        (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "healthy",
                "timestamp": Utc::now().to_rfc3339()
            })),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "unhealthy",
                "state": state.as_str(),
                "timestamp": Utc::now().to_rfc3339(),
                "message": "Agent is not running"
            })),
        )
    }
}

async fn status_endpoint(State(handle): State<StatusHandle>) -> Json<serde_json::Value> {
    let metrics = &handle.metrics;
    Json(serde_json::json!({
        "state": handle.state().as_str(),
        "mode": handle.mode,
        "started_at": handle.started_at.to_rfc3339(),
        "timestamp": Utc::now().to_rfc3339(),
        "buffer_depth": handle.buffer.len(),
        "watched_files": metrics.watched_files.get(),
        "pipeline": {
            "lines_read": metrics.lines_read.get(),
            "records_shipped": metrics.records_shipped.get(),
            "duplicates_dropped": metrics.duplicates_dropped.get(),
            "flush_failures": metrics.flush_failures.get(),
            "overflow_dropped": metrics.overflow_dropped.get(),
            "rotations": metrics.rotations.get()
        }
    }))
}

async fn metrics_endpoint(State(handle): State<StatusHandle>) -> (StatusCode, String) {
    match handle.metrics.encode() {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    fn handle(state: AgentState) -> StatusHandle {
        StatusHandle {
            state: Arc::new(Mutex::new(state)),
            buffer: Arc::new(BatchBuffer::new(10)),
            metrics: Arc::new(AgentMetrics::new().unwrap()),
            mode: "machine_id".to_string(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_health_reflects_state() {
        let (status, _) = health_check(State(handle(AgentState::Running))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, Json(body)) = health_check(State(handle(AgentState::Stopping))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["state"], "stopping");
    }

    #[tokio::test]
    async fn test_status_reports_pipeline_counters() {
        let handle = handle(AgentState::Running);
        handle.metrics.lines_read.inc_by(4);
        handle.metrics.watched_files.set(2);

        let Json(body) = status_endpoint(State(handle)).await;
        assert_eq!(body["state"], "running");
        assert_eq!(body["mode"], "machine_id");
        assert_eq!(body["buffer_depth"], 0);
        assert_eq!(body["watched_files"], 2);
        assert_eq!(body["pipeline"]["lines_read"], 4);
    }

    #[tokio::test]
    async fn test_serve_metrics_and_shutdown() {
        let handle = handle(AgentState::Running);
        handle.metrics.records_shipped.inc_by(3);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, handle, async {
            let _ = rx.await;
        }));

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("tailship_records_shipped_total 3"));

        let health = reqwest::get(format!("http://{}/health", addr)).await.unwrap();
        assert_eq!(health.status().as_u16(), 200);

        tx.send(()).unwrap();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_occupied_port_is_skipped() {
        let occupied = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let server = spawn(port, handle(AgentState::Running), async {}).await;
        assert!(server.is_none());
    }
}
