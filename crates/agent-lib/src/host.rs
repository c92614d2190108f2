//! Host metrics sampling
//!
//! Collects the `system` section of every stats payload with sysinfo,
//! splitting CPU time into user/system from `/proc/stat` deltas where the
//! file exists. Samples are cached for half a second so a burst of callers
//! costs one refresh.

use crate::collector::CommandRunner;
use crate::models::{round2, HostMetrics};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};
use tokio::time::Instant;
use tracing::debug;

/// How long a sample is reused
pub const HOST_CACHE_TTL: Duration = Duration::from_millis(500);

const GIB: u64 = 1024 * 1024 * 1024;

/// Host facts supplied by configuration, used when the agent runs inside a
/// container and cannot see the real machine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostOverrides {
    pub system_name: Option<String>,
    pub model: Option<String>,
    pub processor: Option<String>,
    pub cpu_cores: Option<usize>,
    pub cpu_perf_cores: Option<usize>,
    pub cpu_eff_cores: Option<usize>,
    pub memory_gb: Option<u64>,
    pub disk_total_gb: Option<u64>,
}

impl HostOverrides {
    fn has_cpu_identity(&self) -> bool {
        self.model.is_some() || self.processor.is_some()
    }
}

/// Cumulative jiffies from the aggregate `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

/// Percent split of CPU time between two readings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuSplit {
    pub user: f64,
    pub system: f64,
    pub idle: f64,
}

impl CpuTimes {
    /// Parse the first `cpu ` line of `/proc/stat` content
    pub fn parse(stat: &str) -> Option<Self> {
        let line = stat.lines().find(|line| line.starts_with("cpu "))?;
        let values: Vec<u64> = line
            .split_whitespace()
            .skip(1)
            .map(|field| field.parse().unwrap_or(0))
            .collect();
        if values.len() < 4 {
            return None;
        }
        let at = |i: usize| values.get(i).copied().unwrap_or(0);
        Some(Self {
            user: at(0),
            nice: at(1),
            system: at(2),
            idle: at(3),
            iowait: at(4),
            irq: at(5),
            softirq: at(6),
            steal: at(7),
        })
    }

    fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Split of the time elapsed since `previous`; `None` when no time passed
    pub fn split_since(&self, previous: &CpuTimes) -> Option<CpuSplit> {
        let total = self.total().checked_sub(previous.total())?;
        if total == 0 {
            return None;
        }
        let delta = |now: u64, before: u64| now.saturating_sub(before) as f64;
        let user = delta(self.user, previous.user) + delta(self.nice, previous.nice);
        let system = delta(self.system, previous.system)
            + delta(self.irq, previous.irq)
            + delta(self.softirq, previous.softirq);
        let idle = delta(self.idle, previous.idle) + delta(self.iowait, previous.iowait);
        let total = total as f64;
        Some(CpuSplit {
            user: user / total * 100.0,
            system: system / total * 100.0,
            idle: idle / total * 100.0,
        })
    }
}

/// Samples [`HostMetrics`] with a short cache
pub struct HostSampler {
    system: System,
    overrides: HostOverrides,
    docker: Option<Arc<dyn CommandRunner>>,
    proc_stat: PathBuf,
    last_cpu_times: Option<CpuTimes>,
    cached: Option<(Instant, HostMetrics)>,
}

impl HostSampler {
    /// `docker` is used to read the daemon's memory total; pass `None` when
    /// running without Docker.
    pub fn new(overrides: HostOverrides, docker: Option<Arc<dyn CommandRunner>>) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_disks_list();
        Self {
            system,
            overrides,
            docker,
            proc_stat: PathBuf::from("/proc/stat"),
            last_cpu_times: None,
            cached: None,
        }
    }

    pub async fn sample(&mut self) -> HostMetrics {
        if let Some((at, metrics)) = &self.cached {
            if at.elapsed() < HOST_CACHE_TTL {
                return metrics.clone();
            }
        }

        let metrics = self.collect().await;
        self.cached = Some((Instant::now(), metrics.clone()));
        metrics
    }

    async fn collect(&mut self) -> HostMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        self.system.refresh_disks();

        let overrides = self.overrides.clone();
        let cpu = self.system.global_cpu_info();
        let brand = cpu.brand().trim().to_string();
        let cpu_usage = f64::from(cpu.cpu_usage());

        let cpu_model = if overrides.has_cpu_identity() {
            let model = overrides
                .model
                .clone()
                .unwrap_or_else(|| std::env::consts::ARCH.to_string());
            let processor = overrides.processor.clone().unwrap_or_else(|| brand.clone());
            format!("{} ({})", model, processor)
        } else {
            brand
        };

        let host_name = overrides
            .system_name
            .clone()
            .or_else(|| self.system.host_name())
            .unwrap_or_default();

        let cpu_cores = overrides.cpu_cores.unwrap_or(self.system.cpus().len()).max(1);
        let cpu_perf_cores = overrides.cpu_perf_cores.unwrap_or(cpu_cores);
        let cpu_eff_cores = overrides.cpu_eff_cores.unwrap_or(0);

        let (cpu_user, cpu_system, cpu_idle) = match self.cpu_split() {
            Some(split) => (split.user, split.system, split.idle),
            None => (cpu_usage, 0.0, 100.0 - cpu_usage),
        };

        let memory_total = self.system.total_memory();
        let memory_used = self.system.used_memory();
        let host_memory_total = overrides
            .memory_gb
            .filter(|gb| *gb > 0)
            .map(|gb| gb * GIB)
            .unwrap_or(memory_total);
        let docker_memory_percent = if memory_total > 0 {
            memory_used as f64 / memory_total as f64 * 100.0
        } else {
            0.0
        };

        let docker_memory_total = self.docker_memory_total().await;
        let (disk_total, disk_used, disk_available) = self.disk_usage();
        let disk_percent = if disk_total > 0 {
            disk_used as f64 / disk_total as f64 * 100.0
        } else {
            0.0
        };

        HostMetrics {
            host_name,
            cpu_model,
            cpu_usage: round2(cpu_usage),
            cpu_cores,
            cpu_perf_cores,
            cpu_eff_cores,
            cpu_user: round2(cpu_user),
            cpu_system: round2(cpu_system),
            cpu_idle: round2(cpu_idle),
            host_memory_total,
            docker_available: docker_memory_total.is_some(),
            docker_memory_total: docker_memory_total.unwrap_or(0),
            docker_memory_used: memory_used,
            docker_memory_percent: round2(docker_memory_percent),
            swap_total: self.system.total_swap(),
            swap_used: self.system.used_swap(),
            uptime: self.system.uptime(),
            disk_total,
            disk_used,
            disk_available,
            disk_percent: round2(disk_percent),
        }
    }

    fn cpu_split(&mut self) -> Option<CpuSplit> {
        let content = std::fs::read_to_string(&self.proc_stat).ok()?;
        let now = CpuTimes::parse(&content)?;
        let previous = self.last_cpu_times.replace(now)?;
        now.split_since(&previous)
    }

    /// `docker info` memory total; `None` when Docker is unavailable
    async fn docker_memory_total(&self) -> Option<u64> {
        let runner = self.docker.as_ref()?;
        match runner
            .run(&["info", "--format", "{{.MemTotal}}"])
            .await
        {
            Ok(output) if output.success => output.stdout.trim().parse().ok(),
            Ok(output) => {
                debug!(code = ?output.code, "docker info failed");
                None
            }
            Err(e) => {
                debug!(error = %e, "docker info could not run");
                None
            }
        }
    }

    /// Root filesystem usage, or the configured total when no root mount is visible
    fn disk_usage(&self) -> (u64, u64, u64) {
        let root = self
            .system
            .disks()
            .iter()
            .find(|disk| disk.mount_point() == std::path::Path::new("/"));

        match (root, self.overrides.disk_total_gb.filter(|gb| *gb > 0)) {
            (Some(disk), _) => {
                let total = disk.total_space();
                let available = disk.available_space();
                (total, total.saturating_sub(available), available)
            }
            (None, Some(gb)) => (gb * GIB, 0, gb * GIB),
            (None, None) => (0, 0, 0),
        }
    }
}
