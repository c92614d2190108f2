//! Core data models for the fleet agent

use serde::{Deserialize, Serialize};

/// Category of a monitored entity, inferred from its name and image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Creditcoin2,
    Creditcoin3,
    /// The agent's own container; never cached
    Mclient,
    Postgres,
    #[default]
    Unknown,
}

impl EntityKind {
    /// Returns true for entities that run a chain node and expose an RPC endpoint
    pub fn is_chain_node(&self) -> bool {
        matches!(self, EntityKind::Creditcoin2 | EntityKind::Creditcoin3)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Creditcoin2 => "creditcoin2",
            EntityKind::Creditcoin3 => "creditcoin3",
            EntityKind::Mclient => "mclient",
            EntityKind::Postgres => "postgres",
            EntityKind::Unknown => "unknown",
        }
    }
}

/// Sync/availability label of a chain node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Syncing,
    NoPeers,
    Initializing,
    CatchingUp,
    Synced,
    Offline,
    /// Last probe failed before producing a result
    Unknown,
    /// No probe has completed yet
    Checking,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Syncing => "syncing",
            SyncState::NoPeers => "no_peers",
            SyncState::Initializing => "initializing",
            SyncState::CatchingUp => "catching_up",
            SyncState::Synced => "synced",
            SyncState::Offline => "offline",
            SyncState::Unknown => "unknown",
            SyncState::Checking => "checking",
        }
    }
}

/// Block progress reported by a chain node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProgress {
    pub current_block: u64,
    pub finalized_block: u64,
    pub target_block: u64,
    pub starting_block: u64,
    pub peers: u64,
}

/// Result of the most recent health probe for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub sync_state: SyncState,
    pub progress: ChainProgress,
    pub is_syncing: bool,
    pub should_have_peers: bool,
    /// Unix timestamp (milliseconds) of the probe
    pub updated_at: i64,
}

impl HealthStatus {
    pub fn new(sync_state: SyncState, progress: ChainProgress) -> Self {
        Self {
            sync_state,
            progress,
            is_syncing: sync_state == SyncState::Syncing,
            should_have_peers: true,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Entity exists but is not running
    pub fn offline() -> Self {
        Self::new(SyncState::Offline, ChainProgress::default())
    }

    /// Probe failed without a usable answer
    pub fn unknown() -> Self {
        Self::new(SyncState::Unknown, ChainProgress::default())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub percent: f64,
    pub cores: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub usage: u64,
    pub limit: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkIo {
    pub rx: u64,
    pub tx: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockIo {
    pub read: u64,
    pub write: u64,
}

/// Latest enriched metrics for one monitored entity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub id: String,
    pub name: String,
    pub status: String,
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub network: NetworkIo,
    pub disk: BlockIo,
    /// Free-form display label (telemetry name of the node)
    pub nickname: String,
    pub node_name: String,
    pub node_type: EntityKind,
    pub image_name: String,
    pub data_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_state: Option<SyncState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockchain: Option<ChainProgress>,
    /// Unix timestamp (milliseconds) of the last update
    pub timestamp: i64,
}

impl EntitySnapshot {
    /// Merge health data into a chain node snapshot.
    ///
    /// A chain node without any recorded probe shows `checking` with zeroed progress.
    pub fn merge_health(&mut self, health: Option<&HealthStatus>) {
        if !self.node_type.is_chain_node() {
            return;
        }
        match health {
            Some(status) => {
                self.sync_state = Some(status.sync_state);
                self.blockchain = Some(status.progress);
            }
            None => {
                self.sync_state = Some(SyncState::Checking);
                self.blockchain = Some(ChainProgress::default());
            }
        }
    }
}

/// Host-level resource snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostMetrics {
    pub host_name: String,
    pub cpu_model: String,
    pub cpu_usage: f64,
    pub cpu_cores: usize,
    pub cpu_perf_cores: usize,
    pub cpu_eff_cores: usize,
    pub cpu_user: f64,
    pub cpu_system: f64,
    pub cpu_idle: f64,
    pub host_memory_total: u64,
    pub docker_available: bool,
    pub docker_memory_total: u64,
    pub docker_memory_used: u64,
    pub docker_memory_percent: f64,
    pub swap_total: u64,
    pub swap_used: u64,
    pub uptime: u64,
    pub disk_total: u64,
    pub disk_used: u64,
    pub disk_available: u64,
    pub disk_percent: f64,
}

/// Payload of a `stats` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsPayload {
    pub system: HostMetrics,
    pub containers: Vec<EntitySnapshot>,
    pub configured_nodes: Vec<String>,
}

/// Payload of a `summary` message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub system: HostMetrics,
    pub containers: Vec<EntitySnapshot>,
    pub configured_nodes: Vec<String>,
    pub period_seconds: u64,
    pub data_points: usize,
}

/// Round to two decimal places
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
