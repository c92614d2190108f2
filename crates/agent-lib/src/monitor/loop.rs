//! Fixed-cadence monitoring driver
//!
//! Each tick samples the host and the entities, submits one `stats`
//! payload and, once a window of delivered ticks is full, one `summary`.
//! The next tick is scheduled from the start of the previous one so work
//! time does not accumulate as drift.

use super::summary::{SummaryAccumulator, DEFAULT_SUMMARY_WINDOW};
use super::{EntitySource, HostSource, PayloadSink};
use crate::health::{components, HealthRegistry};
use crate::models::StatsPayload;
use crate::observability::{AgentMetrics, StructuredLogger};
use crate::supervisor::sleep_or_cancel;
use crate::sync::PayloadKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for the monitoring loop
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Agent identity, used in lifecycle logs
    pub server_id: String,
    /// Tick cadence (default: 5 seconds)
    pub interval: Duration,
    /// Delivered ticks per summary (default: 60)
    pub summary_window: usize,
    /// Entity name patterns, also reported as `configured_nodes`
    pub node_patterns: Vec<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            server_id: String::new(),
            interval: Duration::from_secs(5),
            summary_window: DEFAULT_SUMMARY_WINDOW,
            node_patterns: vec!["node".to_string(), "3node".to_string()],
        }
    }
}

/// What one tick achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickOutcome {
    pub entities: usize,
    /// Stats payload written to a registered relay link
    pub delivered: bool,
    /// A summary was built and submitted on this tick
    pub summary_submitted: bool,
}

/// Totals returned when the loop stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorReport {
    pub ticks: u64,
    pub summaries: u64,
}

pub struct MonitoringLoop {
    config: MonitorConfig,
    host: Box<dyn HostSource>,
    entities: Option<Arc<dyn EntitySource>>,
    sink: Arc<dyn PayloadSink>,
    health: HealthRegistry,
    summary: SummaryAccumulator,
    metrics: AgentMetrics,
    logger: StructuredLogger,
    report: MonitorReport,
}

impl MonitoringLoop {
    /// `entities` is `None` when the agent runs without a stats collector;
    /// payloads then carry host metrics only.
    pub fn new(
        config: MonitorConfig,
        host: Box<dyn HostSource>,
        entities: Option<Arc<dyn EntitySource>>,
        sink: Arc<dyn PayloadSink>,
        health: HealthRegistry,
    ) -> Self {
        let summary = SummaryAccumulator::new(config.summary_window, config.interval);
        let logger = StructuredLogger::new(config.server_id.clone());
        Self {
            config,
            host,
            entities,
            sink,
            health,
            summary,
            metrics: AgentMetrics::new(),
            logger,
            report: MonitorReport::default(),
        }
    }

    /// Tick until `shutdown` is cancelled. The caller logs the final summary
    /// once the transport has been stopped.
    pub async fn run(mut self, shutdown: CancellationToken) -> MonitorReport {
        info!(
            interval_secs = self.config.interval.as_secs_f64(),
            summary_window = self.summary.window(),
            nodes = ?self.config.node_patterns,
            "Starting monitoring loop"
        );

        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let next_tick = started + self.config.interval;

            let outcome = self.tick().await;
            let elapsed = started.elapsed();
            self.metrics.observe_tick_latency(elapsed.as_secs_f64());
            debug!(
                tick = self.report.ticks,
                entities = outcome.entities,
                delivered = outcome.delivered,
                elapsed_ms = elapsed.as_millis() as u64,
                "Tick complete"
            );

            let wait = next_tick.saturating_duration_since(Instant::now());
            if !sleep_or_cancel(&shutdown, wait).await {
                break;
            }
        }

        self.report
    }

    /// Run one tick
    pub async fn tick(&mut self) -> TickOutcome {
        let system = self.host.sample().await;
        let containers = match &self.entities {
            Some(source) => source.entities(&self.config.node_patterns).await,
            None => Vec::new(),
        };
        let entity_count = containers.len();
        self.metrics.set_entities_monitored(entity_count as i64);
        self.report.ticks += 1;

        if self.entities.is_some() {
            if entity_count == 0 {
                self.health
                    .set_degraded(components::STATS_COLLECTOR, "No entities observed")
                    .await;
            } else {
                self.health.set_healthy(components::STATS_COLLECTOR).await;
            }
        }

        let payload = StatsPayload {
            system,
            containers,
            configured_nodes: self.config.node_patterns.clone(),
        };
        let delivered = match serde_json::to_value(&payload) {
            Ok(value) => self.sink.send(value, PayloadKind::Stats).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode stats payload");
                false
            }
        };

        self.update_transport_health().await;
        self.health.set_healthy(components::MONITOR_LOOP).await;

        let mut summary_submitted = false;
        if delivered && self.summary.push(payload.system, payload.containers) {
            self.submit_summary().await;
            summary_submitted = true;
        }

        TickOutcome {
            entities: entity_count,
            delivered,
            summary_submitted,
        }
    }

    async fn submit_summary(&mut self) {
        let Some(summary) = self.summary.build(&self.config.node_patterns) else {
            return;
        };
        self.summary.reset();

        let (data_points, period) = (summary.data_points, summary.period_seconds);
        let delivered = match serde_json::to_value(&summary) {
            Ok(value) => self.sink.send(value, PayloadKind::Summary).await,
            Err(e) => {
                warn!(error = %e, "Failed to encode summary payload");
                return;
            }
        };

        self.report.summaries += 1;
        self.metrics.inc_summaries_sent();
        self.logger.log_summary_sent(data_points, period, delivered);
    }

    async fn update_transport_health(&self) {
        if self.sink.is_registered().await {
            self.health.set_healthy(components::TRANSPORT).await;
            self.health.set_ready(true).await;
        } else {
            self.health
                .set_degraded(components::TRANSPORT, "Relay not registered")
                .await;
        }
    }
}
