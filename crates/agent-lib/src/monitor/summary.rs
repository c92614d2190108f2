//! Rolling summary over a window of ticks

use crate::models::{round2, EntitySnapshot, HostMetrics, SummaryPayload};
use crate::sync::now_millis;
use std::time::Duration;

/// Ticks per summary
pub const DEFAULT_SUMMARY_WINDOW: usize = 60;

/// Accumulates delivered ticks until a summary is due
#[derive(Debug, Clone)]
pub struct SummaryAccumulator {
    window: usize,
    interval: Duration,
    systems: Vec<HostMetrics>,
    containers: Vec<Vec<EntitySnapshot>>,
}

impl SummaryAccumulator {
    pub fn new(window: usize, interval: Duration) -> Self {
        let window = window.max(1);
        Self {
            window,
            interval,
            systems: Vec::with_capacity(window),
            containers: Vec::with_capacity(window),
        }
    }

    /// Record one delivered tick. Returns true when the window is full.
    pub fn push(&mut self, system: HostMetrics, containers: Vec<EntitySnapshot>) -> bool {
        self.systems.push(system);
        self.containers.push(containers);
        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.systems.len() >= self.window
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn reset(&mut self) {
        self.systems.clear();
        self.containers.clear();
    }

    /// Aggregate the window. `None` when nothing was recorded.
    ///
    /// The first tick's snapshots are the template; numeric fields are
    /// replaced by window means and labels by their most common value.
    pub fn build(&self, configured_nodes: &[String]) -> Option<SummaryPayload> {
        let first = self.systems.first()?;
        let count = self.systems.len();

        let mean = |field: fn(&HostMetrics) -> f64| {
            self.systems.iter().map(field).sum::<f64>() / count as f64
        };
        let cpu_usage = mean(|s| s.cpu_usage);

        let mut system = first.clone();
        system.cpu_usage = round2(cpu_usage);
        system.cpu_user = round2(mean(|s| s.cpu_user));
        system.cpu_system = round2(mean(|s| s.cpu_system));
        system.cpu_idle = round2(100.0 - cpu_usage);
        system.docker_memory_percent = round2(mean(|s| s.docker_memory_percent));
        system.docker_memory_used = mean(|s| s.docker_memory_used as f64) as u64;
        system.disk_percent = round2(mean(|s| s.disk_percent));

        let timestamp = now_millis();
        let containers = self
            .containers
            .first()
            .map(|template| {
                template
                    .iter()
                    .map(|entity| self.aggregate_entity(entity, timestamp))
                    .collect()
            })
            .unwrap_or_default();

        Some(SummaryPayload {
            system,
            containers,
            configured_nodes: configured_nodes.to_vec(),
            period_seconds: self.interval.as_secs() * count as u64,
            data_points: count,
        })
    }

    fn aggregate_entity(&self, template: &EntitySnapshot, timestamp: i64) -> EntitySnapshot {
        let series: Vec<&EntitySnapshot> = self
            .containers
            .iter()
            .filter_map(|tick| tick.iter().find(|entity| entity.name == template.name))
            .collect();
        let n = series.len().max(1) as f64;

        let mut entity = template.clone();
        entity.cpu.percent = round2(series.iter().map(|e| e.cpu.percent).sum::<f64>() / n);
        entity.memory.usage =
            (series.iter().map(|e| e.memory.usage as f64).sum::<f64>() / n) as u64;
        entity.memory.percent =
            round2(series.iter().map(|e| e.memory.percent).sum::<f64>() / n);

        if let Some(status) = most_common(series.iter().map(|e| e.status.clone())) {
            entity.status = status;
        }
        if entity.sync_state.is_some() {
            entity.sync_state = most_common(series.iter().filter_map(|e| e.sync_state));
        }
        entity.timestamp = timestamp;
        entity
    }
}

/// Most frequent value; ties go to the value seen first
pub fn most_common<T: PartialEq>(values: impl IntoIterator<Item = T>) -> Option<T> {
    let mut counts: Vec<(T, usize)> = Vec::new();
    for value in values {
        match counts.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => counts.push((value, 1)),
        }
    }

    let mut best: Option<(T, usize)> = None;
    for (value, count) in counts {
        if best.as_ref().map_or(true, |(_, top)| count > *top) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}
