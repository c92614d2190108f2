//! Monitoring loop
//!
//! This module provides:
//! - [`MonitoringLoop`], the fixed-cadence driver that samples the host and
//!   the entities, submits a stats payload per tick and a rollup summary per
//!   window
//! - [`SummaryAccumulator`], the rolling window behind the summaries
//! - Seams between the loop and its collaborators, so the loop can run
//!   against in-memory doubles

mod r#loop;
mod summary;


pub use r#loop::{MonitorConfig, MonitorReport, MonitoringLoop, TickOutcome};
pub use summary::{most_common, SummaryAccumulator, DEFAULT_SUMMARY_WINDOW};

use crate::collector::StatsCollector;
use crate::host::HostSampler;
use crate::models::{EntitySnapshot, HostMetrics};
use crate::sync::{PayloadKind, TransportChannel};
use async_trait::async_trait;
use serde_json::Value;

/// Source of the `system` section
#[async_trait]
pub trait HostSource: Send + Sync {
    async fn sample(&mut self) -> HostMetrics;
}

#[async_trait]
impl HostSource for HostSampler {
    async fn sample(&mut self) -> HostMetrics {
        HostSampler::sample(self).await
    }
}

/// Source of the `containers` section
#[async_trait]
pub trait EntitySource: Send + Sync {
    /// Entities matching `patterns`, plus infrastructure entities
    async fn entities(&self, patterns: &[String]) -> Vec<EntitySnapshot>;
}

#[async_trait]
impl EntitySource for StatsCollector {
    async fn entities(&self, patterns: &[String]) -> Vec<EntitySnapshot> {
        let mut entities: Vec<EntitySnapshot> =
            self.snapshot_for(patterns).await.into_values().collect();
        for extra in self.server_entities().await {
            if !entities.iter().any(|entity| entity.name == extra.name) {
                entities.push(extra);
            }
        }
        entities
    }
}

/// Destination of stats and summary payloads
#[async_trait]
pub trait PayloadSink: Send + Sync {
    /// True when the payload was written to a registered relay link
    async fn send(&self, payload: Value, kind: PayloadKind) -> bool;

    async fn is_registered(&self) -> bool;
}

#[async_trait]
impl PayloadSink for TransportChannel {
    async fn send(&self, payload: Value, kind: PayloadKind) -> bool {
        TransportChannel::send(self, payload, kind).await
    }

    async fn is_registered(&self) -> bool {
        TransportChannel::is_registered(self).await
    }
}
