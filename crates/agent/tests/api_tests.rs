//! Integration tests for the agent API endpoints

use agent_lib::{
    collector::{StatsCollector, StatsCollectorConfig},
    health::{components, HealthRegistry},
    observability::AgentMetrics,
    sync::{ConnectTarget, PayloadKind, TransportChannel},
};
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use fleet_agent::api::{create_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

fn offline_channel() -> TransportChannel {
    TransportChannel::builder()
        .server_id("validator-test")
        .target(ConnectTarget::Custom("ws://127.0.0.1:1/ws/monitoring/".to_string()))
        .build()
        .unwrap()
}

async fn setup_test_app() -> (Router, Arc<AppState>) {
    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let state = Arc::new(AppState::new(
        health_registry,
        AgentMetrics::new(),
        offline_channel(),
        None,
    ));
    let router = create_router(state.clone());

    (router, state)
}

async fn get(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(app, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _state) = setup_test_app().await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert!(health["components"][components::STATS_COLLECTOR].is_object());
    assert!(health["components"][components::TRANSPORT].is_object());
    assert!(health["components"][components::MONITOR_LOOP].is_object());
}

#[tokio::test]
async fn test_healthz_returns_ok_when_transport_degraded() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_degraded(components::TRANSPORT, "relay unreachable, queueing")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded is still operational
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
    assert_eq!(
        health["components"][components::TRANSPORT]["message"],
        "relay unreachable, queueing"
    );
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, state) = setup_test_app().await;

    state
        .health_registry
        .set_unhealthy(components::STATS_COLLECTOR, "docker not available")
        .await;

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
}

#[tokio::test]
async fn test_readyz_returns_503_before_registration() {
    let (app, _state) = setup_test_app().await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);
    assert!(readiness["reason"].is_string());
}

#[tokio::test]
async fn test_readyz_returns_ok_when_ready() {
    let (app, state) = setup_test_app().await;
    state.health_registry.set_ready(true).await;

    let (status, readiness) = get_json(app, "/readyz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_agent_metrics() {
    let (app, state) = setup_test_app().await;

    state.metrics.observe_tick_latency(0.02);
    state.metrics.set_entities_monitored(4);
    state.metrics.inc_summaries_sent();

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap();
    assert!(content_type.to_str().unwrap().contains("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("fleet_agent_tick_latency_seconds_bucket"));
    assert!(text.contains("fleet_agent_entities_monitored"));
    assert!(text.contains("fleet_agent_summaries_sent_total"));
    assert!(text.contains("fleet_agent_pending_queue_depth"));
}

#[tokio::test]
async fn test_status_reports_offline_channel() {
    let (app, _state) = setup_test_app().await;

    let (status, body) = get_json(app, "/status").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["server_id"], "validator-test");
    assert_eq!(body["connection"]["state"], "disconnected");
    assert_eq!(body["connection"]["last_sequence"], 0);
    assert_eq!(body["connection"]["pending_messages"], 0);
    assert_eq!(body["docker_enabled"], false);
    assert_eq!(body["entities_tracked"], 0);
}

#[tokio::test]
async fn test_status_counts_queued_messages() {
    let (app, state) = setup_test_app().await;

    assert!(!state.channel.send(json!({"n": 1}), PayloadKind::Stats).await);
    assert!(!state.channel.send(json!({"n": 2}), PayloadKind::Stats).await);

    let (_, body) = get_json(app, "/status").await;

    assert_eq!(body["connection"]["last_sequence"], 2);
    assert_eq!(body["connection"]["pending_messages"], 2);

    state.channel.shutdown().await;
}

#[tokio::test]
async fn test_status_reports_collector_when_enabled() {
    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;
    let collector = Arc::new(StatsCollector::docker(StatsCollectorConfig::default()));
    let state = Arc::new(AppState::new(
        health_registry,
        AgentMetrics::new(),
        offline_channel(),
        Some(collector),
    ));

    let (_, body) = get_json(create_router(state), "/status").await;

    assert_eq!(body["docker_enabled"], true);
    assert_eq!(body["entities_tracked"], 0);
    assert!(body["version"].is_string());
}
