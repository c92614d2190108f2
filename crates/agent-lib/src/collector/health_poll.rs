//! Per-entity chain health polling
//!
//! One supervised task per chain node queries the node's RPC endpoint and
//! records a [`HealthStatus`] in a shared map. Tasks are independent: one
//! node's failures and backoff never delay another's poll.
//!
//! A failed probe records `unknown`. A node with no recorded probe at all
//! is shown as `checking` when snapshots are merged.

use super::inspect::{parse_block_number, DockerInspector};
use crate::models::{ChainProgress, HealthStatus, SyncState};
use crate::supervisor::{spawn_periodic, BackoffPolicy, Pace, PeriodicConfig, PeriodicWork};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Configuration for health polling
#[derive(Debug, Clone)]
pub struct HealthPollConfig {
    /// Delay between successful polls
    pub interval: Duration,
    /// Offline entities are re-checked after `interval * offline_multiplier`
    pub offline_multiplier: u32,
    /// Cap for the failure backoff
    pub max_backoff: Duration,
    /// Bound for one complete probe
    pub query_timeout: Duration,
    /// Block gap between head and finalized above which a node is catching up
    pub catch_up_threshold: u64,
}

impl Default for HealthPollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            offline_multiplier: 5,
            max_backoff: Duration::from_secs(60),
            query_timeout: Duration::from_secs(10),
            catch_up_threshold: 100,
        }
    }
}

impl HealthPollConfig {
    /// After `n` consecutive failures the poller sleeps `min(max_backoff, interval * 2^n)`
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.interval.saturating_mul(2), self.max_backoff)
    }

    pub fn offline_interval(&self) -> Duration {
        self.interval.saturating_mul(self.offline_multiplier)
    }
}

/// Raw answers from one chain node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeReport {
    pub is_syncing: bool,
    pub should_have_peers: bool,
    pub progress: ChainProgress,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The entity is not running
    Offline,
    Report(NodeReport),
}

/// Queries one chain node for its health
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn probe(&self, name: &str, port: u16) -> Result<ProbeOutcome>;
}

/// Derive the sync label from a node report.
pub fn determine_sync_state(report: &NodeReport, catch_up_threshold: u64) -> SyncState {
    let progress = &report.progress;
    if report.is_syncing {
        SyncState::Syncing
    } else if progress.peers == 0 {
        SyncState::NoPeers
    } else if progress.current_block == 0 {
        SyncState::Initializing
    } else if progress.current_block.saturating_sub(progress.finalized_block) > catch_up_threshold
    {
        SyncState::CatchingUp
    } else {
        SyncState::Synced
    }
}

/// [`NodeProbe`] issuing JSON-RPC calls through `docker exec`
#[derive(Clone)]
pub struct RpcProbe {
    inspector: DockerInspector,
}

impl RpcProbe {
    pub fn new(inspector: DockerInspector) -> Self {
        Self { inspector }
    }

    /// Sub-query helper: any failure or missing result is `None`
    async fn query(&self, name: &str, port: u16, method: &str, params: Value) -> Option<Value> {
        match self.inspector.rpc_call(name, port, method, params).await {
            Ok(result) => result,
            Err(e) => {
                debug!(entity = %name, method = %method, error = %e, "RPC sub-query failed");
                None
            }
        }
    }

    async fn current_block(&self, name: &str, port: u16) -> Option<u64> {
        let header = self.query(name, port, "chain_getHeader", json!([])).await?;
        parse_block_number(&header["number"])
    }

    async fn finalized_block(&self, name: &str, port: u16) -> Option<u64> {
        let hash = self
            .query(name, port, "chain_getFinalizedHead", json!([]))
            .await?;
        let header = self
            .query(name, port, "chain_getHeader", json!([hash]))
            .await?;
        parse_block_number(&header["number"])
    }
}

#[async_trait]
impl NodeProbe for RpcProbe {
    async fn probe(&self, name: &str, port: u16) -> Result<ProbeOutcome> {
        if !self.inspector.is_running(name).await? {
            return Ok(ProbeOutcome::Offline);
        }

        let health = self
            .inspector
            .rpc_call(name, port, "system_health", json!([]))
            .await?
            .ok_or_else(|| anyhow!("system_health returned no result"))?;

        let sync = self
            .query(name, port, "system_syncState", json!([]))
            .await
            .unwrap_or(Value::Null);
        let synced_current = parse_block_number(&sync["currentBlock"]);

        let current_block = match self.current_block(name, port).await {
            Some(block) => block,
            None => synced_current.unwrap_or(0),
        };

        let progress = ChainProgress {
            current_block,
            finalized_block: self.finalized_block(name, port).await.unwrap_or(0),
            target_block: parse_block_number(&sync["highestBlock"]).unwrap_or(0),
            starting_block: parse_block_number(&sync["startingBlock"]).unwrap_or(0),
            peers: health["peers"].as_u64().unwrap_or(0),
        };

        Ok(ProbeOutcome::Report(NodeReport {
            is_syncing: health["isSyncing"].as_bool().unwrap_or(false),
            should_have_peers: health["shouldHavePeers"].as_bool().unwrap_or(true),
            progress,
        }))
    }
}

/// Polling work for one entity
struct PollWork {
    name: String,
    port: u16,
    probe: Arc<dyn NodeProbe>,
    statuses: Arc<DashMap<String, HealthStatus>>,
    config: HealthPollConfig,
}

#[async_trait]
impl PeriodicWork for PollWork {
    async fn run_once(&mut self) -> Result<Pace> {
        let outcome =
            match tokio::time::timeout(self.config.query_timeout, self.probe.probe(&self.name, self.port))
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!(
                    "health probe timed out after {:?}",
                    self.config.query_timeout
                )),
            };

        match outcome {
            Ok(ProbeOutcome::Offline) => {
                self.statuses
                    .insert(self.name.clone(), HealthStatus::offline());
                Ok(Pace::After(self.config.offline_interval()))
            }
            Ok(ProbeOutcome::Report(report)) => {
                let sync_state = determine_sync_state(&report, self.config.catch_up_threshold);
                let mut status = HealthStatus::new(sync_state, report.progress);
                status.is_syncing = report.is_syncing;
                status.should_have_peers = report.should_have_peers;
                self.statuses.insert(self.name.clone(), status);
                Ok(Pace::Normal)
            }
            Err(e) => {
                self.statuses
                    .insert(self.name.clone(), HealthStatus::unknown());
                Err(e.context(format!("health check for {} failed", self.name)))
            }
        }
    }
}

struct PollTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one polling task per chain node
pub struct HealthPollSupervisor {
    probe: Arc<dyn NodeProbe>,
    config: HealthPollConfig,
    statuses: Arc<DashMap<String, HealthStatus>>,
    tasks: DashMap<String, PollTask>,
    token: CancellationToken,
}

impl HealthPollSupervisor {
    pub fn new(probe: Arc<dyn NodeProbe>, config: HealthPollConfig) -> Self {
        Self {
            probe,
            config,
            statuses: Arc::new(DashMap::new()),
            tasks: DashMap::new(),
            token: CancellationToken::new(),
        }
    }

    /// Start polling `name` unless a task already exists for it.
    ///
    /// Returns true when a new task was started.
    pub fn ensure_started(&self, name: &str, port: u16) -> bool {
        if self.token.is_cancelled() {
            return false;
        }

        match self.tasks.entry(name.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                let work = PollWork {
                    name: name.to_string(),
                    port,
                    probe: self.probe.clone(),
                    statuses: self.statuses.clone(),
                    config: self.config.clone(),
                };
                let config = PeriodicConfig::new(format!("health:{}", name), self.config.interval)
                    .with_backoff(self.config.backoff());
                let token = self.token.child_token();
                let handle = spawn_periodic(work, config, token.clone());
                slot.insert(PollTask { token, handle });
                info!(entity = %name, rpc_port = port, "Started health polling");
                true
            }
        }
    }

    /// Stop polling `name` and forget its status.
    ///
    /// Used when the entity leaves the stats stream; it is polled again
    /// from scratch if it comes back.
    pub async fn stop_polling(&self, name: &str) -> bool {
        let Some((_, task)) = self.tasks.remove(name) else {
            return false;
        };
        task.token.cancel();
        let _ = task.handle.await;
        self.statuses.remove(name);
        info!(entity = %name, "Stopped health polling");
        true
    }

    /// Latest recorded status for `name`
    pub fn status(&self, name: &str) -> Option<HealthStatus> {
        self.statuses.get(name).map(|entry| entry.value().clone())
    }

    pub fn is_polling(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn catch_up_threshold(&self) -> u64 {
        self.config.catch_up_threshold
    }

    /// Cancel every task and wait for all of them to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();

        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, task)) = self.tasks.remove(&name) {
                let _ = task.handle.await;
            }
        }
    }
}
