//! HTTP server for health and metrics endpoints
//!
//! - GET /health  - JSON status with per-chain checkpoints
//! - GET /healthz - Liveness probe
//! - GET /metrics - Prometheus metrics from the relayer's own registry

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::eyre;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use tokio::sync::watch;
use tracing::info;

use crate::metrics::Metrics;
use crate::types::DomainId;

#[derive(Clone)]
pub struct AppState {
    pub metrics: Arc<Metrics>,
    pub domains: Arc<Vec<DomainId>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(metrics: Arc<Metrics>, domains: Vec<DomainId>) -> Self {
        Self {
            metrics,
            domains: Arc::new(domains),
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChainHealth {
    pub domain_id: DomainId,
    pub last_checkpoint: i64,
    pub latest_block: i64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub chains: Vec<ChainHealth>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let chains = state
        .domains
        .iter()
        .map(|domain_id| {
            let label = domain_id.to_string();
            ChainHealth {
                domain_id: *domain_id,
                last_checkpoint: state
                    .metrics
                    .last_checkpoint
                    .with_label_values(&[&label])
                    .get(),
                latest_block: state.metrics.latest_block.with_label_values(&[&label]).get(),
            }
        })
        .collect();

    Json(HealthResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        chains,
    })
}

/// Liveness probe (always returns OK if server is running)
async fn liveness() -> &'static str {
    "OK"
}

/// Text exposition of every metric in `metrics`' registry
pub fn render_metrics(metrics: &Metrics) -> eyre::Result<(Vec<u8>, String)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&metrics.registry.gather(), &mut buffer)
        .map_err(|e| eyre!("Failed to encode metrics: {}", e))?;
    Ok((buffer, encoder.format_type().to_string()))
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let (buffer, content_type) = match render_metrics(&state.metrics) {
        Ok(rendered) => rendered,
        Err(_) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    };

    match Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/healthz", get(liveness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve health and metrics until `stop` flips to true
pub async fn start_server(
    port: u16,
    state: AppState,
    mut stop: watch::Receiver<bool>,
) -> eyre::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| eyre!("Failed to bind API server to {}: {}", addr, e))?;
    info!(%addr, "API server listening");

    state.metrics.up.set(1);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*stop.borrow() {
                if stop.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}
