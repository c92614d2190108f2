//! HTTP API for health checks, Prometheus metrics and agent status

use agent_lib::{
    collector::StatsCollector,
    health::HealthRegistry,
    observability::AgentMetrics,
    sync::{ChannelStatus, TransportChannel},
};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub channel: TransportChannel,
    /// Absent when the agent runs without container stats
    pub collector: Option<Arc<StatsCollector>>,
    started: Instant,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        channel: TransportChannel,
        collector: Option<Arc<StatsCollector>>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            channel,
            collector,
            started: Instant::now(),
        }
    }
}

/// Body of `GET /status`
#[derive(Debug, Serialize)]
pub struct AgentStatus {
    pub server_id: String,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub connection: ChannelStatus,
    pub docker_enabled: bool,
    pub entities_tracked: usize,
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = if health.status.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once registered with the relay
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    // Queue depth moves with every send; refresh it at scrape time
    state
        .metrics
        .set_pending_queue_depth(state.channel.pending_len().await as i64);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn status(State(state): State<Arc<AppState>>) -> Json<AgentStatus> {
    let entities_tracked = match &state.collector {
        Some(collector) => collector.entity_count().await,
        None => 0,
    };

    Json(AgentStatus {
        server_id: state.channel.server_id().to_string(),
        version: crate::AGENT_VERSION,
        uptime_secs: state.started.elapsed().as_secs(),
        connection: state.channel.status().await,
        docker_enabled: state.collector.is_some(),
        entities_tracked,
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Serve the API until `shutdown` fires
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
