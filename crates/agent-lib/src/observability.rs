//! Observability infrastructure for the fleet agent
//!
//! Provides:
//! - Prometheus metrics (tick latency, entity count, queue depth, connection state)
//! - Structured JSON logging of lifecycle events with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Histogram, IntCounter, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for tick latency (in seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    tick_latency_seconds: Histogram,
    entities_monitored: IntGauge,
    pending_queue_depth: IntGauge,
    connection_state: IntGauge,
    reconnect_attempts: IntGauge,
    messages_sent: IntCounter,
    send_failures: IntCounter,
    summaries_sent: IntCounter,
    records_discarded: IntCounter,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            tick_latency_seconds: register_histogram!(
                "fleet_agent_tick_latency_seconds",
                "Time spent gathering and submitting one monitoring tick",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register tick_latency_seconds"),

            entities_monitored: register_int_gauge!(
                "fleet_agent_entities_monitored",
                "Number of entities in the latest stats payload"
            )
            .expect("Failed to register entities_monitored"),

            pending_queue_depth: register_int_gauge!(
                "fleet_agent_pending_queue_depth",
                "Messages waiting for the relay connection"
            )
            .expect("Failed to register pending_queue_depth"),

            connection_state: register_int_gauge!(
                "fleet_agent_connection_state",
                "Relay connection state (0 disconnected, 1 connecting, 2 registered, 3 reconnecting)"
            )
            .expect("Failed to register connection_state"),

            reconnect_attempts: register_int_gauge!(
                "fleet_agent_reconnect_attempts",
                "Consecutive failed reconnect attempts"
            )
            .expect("Failed to register reconnect_attempts"),

            messages_sent: register_int_counter!(
                "fleet_agent_messages_sent_total",
                "Messages written to the relay"
            )
            .expect("Failed to register messages_sent"),

            send_failures: register_int_counter!(
                "fleet_agent_send_failures_total",
                "Messages queued or requeued instead of written"
            )
            .expect("Failed to register send_failures"),

            summaries_sent: register_int_counter!(
                "fleet_agent_summaries_sent_total",
                "Rollup summaries submitted"
            )
            .expect("Failed to register summaries_sent"),

            records_discarded: register_int_counter!(
                "fleet_agent_records_discarded_total",
                "Malformed fragments dropped from the stats stream"
            )
            .expect("Failed to register records_discarded"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share it.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_tick_latency(&self, duration_secs: f64) {
        self.inner().tick_latency_seconds.observe(duration_secs);
    }

    pub fn set_entities_monitored(&self, count: i64) {
        self.inner().entities_monitored.set(count);
    }

    pub fn set_pending_queue_depth(&self, depth: i64) {
        self.inner().pending_queue_depth.set(depth);
    }

    pub fn set_connection_state(&self, code: i64) {
        self.inner().connection_state.set(code);
    }

    pub fn set_reconnect_attempts(&self, attempts: i64) {
        self.inner().reconnect_attempts.set(attempts);
    }

    pub fn inc_messages_sent(&self) {
        self.inner().messages_sent.inc();
    }

    pub fn inc_send_failures(&self) {
        self.inner().send_failures.inc();
    }

    pub fn inc_summaries_sent(&self) {
        self.inner().summaries_sent.inc();
    }

    pub fn add_records_discarded(&self, count: i64) {
        if count > 0 {
            self.inner().records_discarded.inc_by(count as u64);
        }
    }
}

/// Totals reported in the final shutdown line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmissionTotals {
    pub total: u64,
    pub success: u64,
    pub errors: u64,
    pub bytes: u64,
}

/// Structured logger for agent lifecycle events
#[derive(Clone)]
pub struct StructuredLogger {
    server_id: String,
}

impl StructuredLogger {
    pub fn new(server_id: impl Into<String>) -> Self {
        Self {
            server_id: server_id.into(),
        }
    }

    pub fn log_startup(&self, version: &str, relay_target: &str, node_patterns: &[String]) {
        info!(
            event = "agent_started",
            server_id = %self.server_id,
            agent_version = %version,
            relay_target = %relay_target,
            node_patterns = ?node_patterns,
            "Fleet agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            server_id = %self.server_id,
            reason = %reason,
            "Fleet agent shutting down"
        );
    }

    /// Final transmission summary on deliberate shutdown
    pub fn log_final_summary(&self, totals: &TransmissionTotals, ticks: u64) {
        info!(
            event = "final_summary",
            server_id = %self.server_id,
            ticks = ticks,
            messages_total = totals.total,
            messages_success = totals.success,
            messages_failed = totals.errors,
            bytes_sent = totals.bytes,
            "Monitoring stopped"
        );
    }

    pub fn log_reconnect_attempt(&self, attempt: u32, delay_secs: f64) {
        warn!(
            event = "reconnect_attempt",
            server_id = %self.server_id,
            attempt = attempt,
            delay_secs = delay_secs,
            "Reconnecting to relay"
        );
    }

    pub fn log_connection(&self, connected: bool, url: &str, queued: usize) {
        if connected {
            info!(
                event = "relay_connection",
                server_id = %self.server_id,
                connected = true,
                url = %url,
                queued = queued,
                "Registered with relay"
            );
        } else {
            warn!(
                event = "relay_connection",
                server_id = %self.server_id,
                connected = false,
                url = %url,
                queued = queued,
                "Lost relay connection, queueing locally"
            );
        }
    }

    pub fn log_summary_sent(&self, data_points: usize, period_secs: u64, delivered: bool) {
        info!(
            event = "summary_submitted",
            server_id = %self.server_id,
            data_points = data_points,
            period_secs = period_secs,
            delivered = delivered,
            "Submitted rollup summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_metrics_handles_share_registry() {
        let metrics = AgentMetrics::new();
        let other = metrics.clone();

        metrics.observe_tick_latency(0.01);
        metrics.set_entities_monitored(3);
        other.set_pending_queue_depth(7);
        other.set_connection_state(2);
        metrics.inc_messages_sent();
        metrics.add_records_discarded(2);
        metrics.add_records_discarded(-1);

        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "fleet_agent_pending_queue_depth"));
    }

    #[test]
    fn test_structured_logger_creation() {
        let logger = StructuredLogger::new("server-1");
        assert_eq!(logger.server_id, "server-1");
        logger.log_final_summary(&TransmissionTotals::default(), 0);
    }
}
