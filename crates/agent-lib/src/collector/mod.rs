//! Container metrics collection
//!
//! This module turns the live output of the container runtime's stats
//! command into per-entity snapshots:
//! - [`StreamingRecordParser`] extracts records from the raw byte stream
//! - [`EntityStatsCache`] keeps the latest snapshot per entity
//! - [`HealthPollSupervisor`] polls chain nodes for sync status
//! - [`StatsCollector`] owns the process and ties the pieces together
//!
//! External commands go through the [`CommandRunner`] and [`StreamSource`]
//! seams so everything above them can be exercised without a runtime.

mod cache;
mod health_poll;
mod inspect;
mod parser;
mod record;
mod stats;
mod units;

#[cfg(test)]
pub(crate) mod testing;


pub use cache::{
    classify, matches_patterns, resolve_image, EntityMetadata, EntityStatsCache, TtlCache,
    CLEANUP_INTERVAL, ENV_TTL, INFO_TTL,
};
pub use health_poll::{
    determine_sync_state, HealthPollConfig, HealthPollSupervisor, NodeProbe, NodeReport,
    ProbeOutcome, RpcProbe,
};
pub use inspect::{parse_block_number, rpc_port, DockerInspector, EntityInfo, DATA_MOUNT};
pub use parser::{FeedResult, StreamingRecordParser, DEFAULT_MAX_EXTRACTIONS};
pub use record::{RecordMetrics, StatsRecord};
pub use stats::{StatsCollector, StatsCollectorConfig, INFRASTRUCTURE_FRAGMENTS};
pub use units::{parse_percentage, parse_size_with_unit, split_pair};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::{Child, Command};

/// Captured result of one finished command
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs one container runtime CLI invocation to completion
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<CommandOutput>;
}

/// [`CommandRunner`] backed by the `docker` binary
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::with_binary("docker")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

#[async_trait]
impl CommandRunner for DockerCli {
    async fn run(&self, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to run {} {}", self.binary, args.join(" ")))?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Long-running stats producer handed to the collector
pub struct SpawnedStream {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Process to terminate on stop, if the source is a process
    pub child: Option<Child>,
}

/// Spawns the stats stream
pub trait StreamSource: Send + Sync {
    fn spawn(&self) -> Result<SpawnedStream>;
}

/// `docker stats` emitting one JSON object per entity per refresh
#[derive(Debug, Clone)]
pub struct DockerStatsSource {
    binary: String,
}

impl Default for DockerStatsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerStatsSource {
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }
}

impl StreamSource for DockerStatsSource {
    fn spawn(&self) -> Result<SpawnedStream> {
        let mut child = Command::new(&self.binary)
            .args(["stats", "--format", "{{ json . }}"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {} stats", self.binary))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stats process has no stdout"))?;

        Ok(SpawnedStream {
            reader: Box::new(stdout),
            child: Some(child),
        })
    }
}
