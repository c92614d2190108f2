//! Component health for the fleet agent
//!
//! Tracks the stats collector, the relay transport and the monitoring loop,
//! and derives liveness/readiness answers for the HTTP health endpoints.
//! The agent becomes ready after its first successful relay registration
//! and stays ready while no component is unhealthy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered by severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still doing useful work, e.g. queueing while the relay is away
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

/// Latest report for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
    /// When the component entered its current status
    pub since: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            status,
            message,
            last_check_timestamp: now,
            since: now,
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Overall status is the worst component status; no components is healthy
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|health| health.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy)
    }
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const STATS_COLLECTOR: &str = "stats_collector";
    pub const TRANSPORT: &str = "transport";
    pub const MONITOR_LOOP: &str = "monitor_loop";

    pub const ALL: &[&str] = &[STATS_COLLECTOR, TRANSPORT, MONITOR_LOOP];
}

#[derive(Debug, Default)]
struct RegistryState {
    components: HashMap<String, ComponentHealth>,
    registered: bool,
}

/// Shared component health; clones observe the same state
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    /// Register every agent component as healthy
    pub async fn register_all(&self) {
        let mut state = self.state.write().await;
        for name in components::ALL {
            state
                .components
                .insert(name.to_string(), ComponentHealth::healthy());
        }
    }

    /// Record a new report. A report with an unchanged status keeps its `since`.
    pub async fn update(&self, name: &str, mut health: ComponentHealth) {
        let mut state = self.state.write().await;
        if let Some(previous) = state.components.get(name) {
            if previous.status == health.status {
                health.since = previous.since;
            }
        }
        state.components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    /// Current health of one component
    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.state.read().await.components.get(name).cloned()
    }

    /// Mark whether the agent has completed relay registration
    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.registered = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        if !state.registered {
            return ReadinessResponse {
                ready: false,
                reason: Some("Not yet registered with relay".to_string()),
            };
        }

        let mut failing: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, health)| !health.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();
        if failing.is_empty() {
            return ReadinessResponse {
                ready: true,
                reason: None,
            };
        }

        failing.sort_unstable();
        ReadinessResponse {
            ready: false,
            reason: Some(format!("Unhealthy components: {}", failing.join(", "))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_register_all_tracks_agent_components() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        let health = registry.health().await;
        assert_eq!(health.components.len(), components::ALL.len());
        assert_eq!(
            health.components[components::TRANSPORT].status,
            ComponentStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_overall_status_is_worst_component() {
        let registry = HealthRegistry::new();
        registry.register_all().await;

        registry
            .set_degraded(components::TRANSPORT, "Relay unreachable, queueing")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry
            .set_unhealthy(components::STATS_COLLECTOR, "Stats process exited")
            .await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_component_lookup() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        registry
            .set_degraded(components::STATS_COLLECTOR, "No entities observed")
            .await;

        let collector = registry.component(components::STATS_COLLECTOR).await.unwrap();
        assert_eq!(collector.status, ComponentStatus::Degraded);
        assert_eq!(collector.message.as_deref(), Some("No entities observed"));
        assert!(registry.component("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_repeated_status_keeps_since() {
        let registry = HealthRegistry::new();
        let mut first = ComponentHealth::degraded("Relay not registered");
        first.since = 100;
        registry.update(components::TRANSPORT, first).await;

        registry
            .set_degraded(components::TRANSPORT, "Relay not registered")
            .await;
        assert_eq!(registry.component(components::TRANSPORT).await.unwrap().since, 100);

        registry.set_healthy(components::TRANSPORT).await;
        assert!(registry.component(components::TRANSPORT).await.unwrap().since > 100);
    }

    #[tokio::test]
    async fn test_not_ready_before_registration() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_ready_while_degraded() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        registry.set_ready(true).await;
        registry
            .set_degraded(components::TRANSPORT, "Relay not registered")
            .await;

        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register_all().await;
        registry.set_ready(true).await;
        registry
            .set_unhealthy(components::MONITOR_LOOP, "Loop stopped")
            .await;
        registry
            .set_unhealthy(components::STATS_COLLECTOR, "docker not available")
            .await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy components: monitor_loop, stats_collector")
        );
    }
}
