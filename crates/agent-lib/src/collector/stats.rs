//! Stats collection orchestration
//!
//! [`StatsCollector`] owns the stats process. A single consumer task reads
//! its output, feeds the parser, enriches every record (environment, image,
//! data volume size) and stores it in the cache. Chain nodes get a health
//! poller the first time they show up with a resolvable RPC port. Health
//! results are merged into snapshots on read.

use super::cache::{classify, resolve_image, EntityMetadata, EntityStatsCache};
use super::health_poll::{HealthPollConfig, HealthPollSupervisor, NodeProbe, RpcProbe};
use super::inspect::{rpc_port, DockerInspector};
use super::parser::StreamingRecordParser;
use super::record::StatsRecord;
use super::{DockerCli, DockerStatsSource, StreamSource};
use crate::models::EntitySnapshot;
use crate::observability::AgentMetrics;
use crate::supervisor::sleep_or_cancel;
use anyhow::{bail, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name fragments of infrastructure entities reported alongside the nodes
pub const INFRASTRUCTURE_FRAGMENTS: &[&str] = &["mserver", "postgres"];

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Configuration for the stats collector
#[derive(Debug, Clone)]
pub struct StatsCollectorConfig {
    /// Number of checks for a first entity during `start`
    pub start_attempts: u32,
    /// Delay between those checks
    pub start_poll_interval: Duration,
    /// Bound on how long `snapshot_for` waits for initialization
    pub init_timeout: Duration,
    /// Grace period between SIGTERM and a forced kill
    pub stop_grace: Duration,
    pub health: HealthPollConfig,
}

impl Default for StatsCollectorConfig {
    fn default() -> Self {
        Self {
            start_attempts: 10,
            start_poll_interval: Duration::from_millis(500),
            init_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_millis(500),
            health: HealthPollConfig::default(),
        }
    }
}

struct RunningStream {
    token: CancellationToken,
    reader: JoinHandle<()>,
    child: Option<Child>,
}

/// Owns the stats process, the entity cache and the health pollers
pub struct StatsCollector {
    source: Arc<dyn StreamSource>,
    inspector: DockerInspector,
    cache: Arc<RwLock<EntityStatsCache>>,
    health: Arc<HealthPollSupervisor>,
    config: StatsCollectorConfig,
    initialized: Arc<watch::Sender<bool>>,
    running: Mutex<Option<RunningStream>>,
    stopped: AtomicBool,
    metrics: AgentMetrics,
}

impl StatsCollector {
    pub fn new(
        source: Arc<dyn StreamSource>,
        inspector: DockerInspector,
        probe: Arc<dyn NodeProbe>,
        config: StatsCollectorConfig,
    ) -> Self {
        let (initialized, _) = watch::channel(false);
        Self {
            source,
            inspector,
            cache: Arc::new(RwLock::new(EntityStatsCache::new())),
            health: Arc::new(HealthPollSupervisor::new(probe, config.health.clone())),
            config,
            initialized: Arc::new(initialized),
            running: Mutex::new(None),
            stopped: AtomicBool::new(false),
            metrics: AgentMetrics::new(),
        }
    }

    /// Collector backed by the `docker` CLI
    pub fn docker(config: StatsCollectorConfig) -> Self {
        let inspector = DockerInspector::new(Arc::new(DockerCli::new()));
        let probe = Arc::new(RpcProbe::new(inspector.clone()));
        Self::new(Arc::new(DockerStatsSource::new()), inspector, probe, config)
    }

    /// Spawn the stats process and start consuming it.
    ///
    /// Returns true once an entity has been observed, false if the bounded
    /// wait ran out (collection keeps warming up in the background).
    pub async fn start(&self, patterns: &[String]) -> Result<bool> {
        if self.stopped.load(Ordering::SeqCst) {
            bail!("stats collector has been stopped");
        }

        {
            let mut running = self.running.lock().await;
            if running.is_none() {
                let spawned = self.source.spawn()?;
                let token = CancellationToken::new();
                let consumer = StreamConsumer {
                    cache: self.cache.clone(),
                    inspector: self.inspector.clone(),
                    health: self.health.clone(),
                    initialized: self.initialized.clone(),
                    metrics: self.metrics.clone(),
                };
                let reader = tokio::spawn(consumer.run(spawned.reader, token.clone()));
                *running = Some(RunningStream {
                    token,
                    reader,
                    child: spawned.child,
                });
                info!(patterns = ?patterns, "Started stats stream");
            }
        }

        for _ in 0..self.config.start_attempts {
            if !self.cache.read().await.is_empty() {
                return Ok(true);
            }
            tokio::time::sleep(self.config.start_poll_interval).await;
        }

        if self.cache.read().await.is_empty() {
            warn!("No entities observed yet, stats collection is still warming up");
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Stop the consumer, terminate the process and join every health poller.
    ///
    /// Idempotent; safe to call without a prior `start`.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        let running = self.running.lock().await.take();
        if let Some(mut running) = running {
            running.token.cancel();
            if let Some(child) = running.child.as_mut() {
                terminate_child(child, self.config.stop_grace).await;
            }
            if let Err(e) = running.reader.await {
                warn!(error = %e, "Stats consumer task ended abnormally");
            }
            info!("Stopped stats stream");
        }

        self.health.shutdown().await;
    }

    /// Wait (bounded) until the first records have been stored.
    ///
    /// After the timeout the collector counts as initialized regardless.
    pub async fn ensure_initialized(&self) {
        let mut rx = self.initialized.subscribe();
        if *rx.borrow() {
            return;
        }
        let timed_out = tokio::time::timeout(self.config.init_timeout, rx.wait_for(|ready| *ready))
            .await
            .is_err();
        if timed_out {
            debug!("Stats initialization wait timed out");
        }
        self.initialized.send_replace(true);
    }

    /// Snapshots for entities matching `patterns`, with health merged in.
    pub async fn snapshot_for(&self, patterns: &[String]) -> BTreeMap<String, EntitySnapshot> {
        self.ensure_initialized().await;

        let mut snapshot = self.cache.read().await.snapshot(patterns);
        for entity in snapshot.values_mut() {
            entity.merge_health(self.health.status(&entity.name).as_ref());
        }
        snapshot
    }

    /// Relay and database entities, regardless of the node patterns
    pub async fn server_entities(&self) -> Vec<EntitySnapshot> {
        let mut entities = self.cache.read().await.find_containing(INFRASTRUCTURE_FRAGMENTS);
        for entity in entities.iter_mut() {
            entity.merge_health(self.health.status(&entity.name).as_ref());
        }
        entities
    }

    pub async fn entity_count(&self) -> usize {
        self.cache.read().await.len()
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.borrow()
    }

    pub fn health(&self) -> &HealthPollSupervisor {
        &self.health
    }

    /// Entity metadata and caches, for inspection in tests
    pub fn cache(&self) -> Arc<RwLock<EntityStatsCache>> {
        self.cache.clone()
    }
}

/// SIGTERM, then kill after `grace` if the process is still alive.
async fn terminate_child(child: &mut Child, grace: Duration) {
    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            debug!(pid = pid, error = %e, "SIGTERM to stats process failed");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(status = %status, "Stats process exited"),
        Ok(Err(e)) => warn!(error = %e, "Failed to wait for stats process"),
        Err(_) => {
            warn!("Stats process ignored SIGTERM, killing it");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to kill stats process");
            }
        }
    }
}

/// The single task that mutates the entity cache
struct StreamConsumer {
    cache: Arc<RwLock<EntityStatsCache>>,
    inspector: DockerInspector,
    health: Arc<HealthPollSupervisor>,
    initialized: Arc<watch::Sender<bool>>,
    metrics: AgentMetrics,
}

impl StreamConsumer {
    async fn run(self, mut reader: Box<dyn AsyncRead + Send + Unpin>, token: CancellationToken) {
        let mut parser = StreamingRecordParser::new();
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = reader.read(&mut buffer) => read,
            };

            match read {
                Ok(0) => {
                    warn!("Stats stream closed");
                    break;
                }
                Ok(n) => {
                    let result = parser.push(&buffer[..n]);
                    if result.discarded > 0 {
                        debug!(discarded = result.discarded, "Dropped malformed stats fragments");
                        self.metrics.add_records_discarded(result.discarded as i64);
                    }
                    for record in result.records {
                        self.process(record).await;
                    }

                    let evicted = self.cache.write().await.cleanup_if_due();
                    for name in evicted {
                        info!(event = "entity_evicted", entity = %name, "Entity left the stats stream");
                        self.health.stop_polling(&name).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read stats stream");
                    if !sleep_or_cancel(&token, Duration::from_millis(100)).await {
                        break;
                    }
                }
            }
        }
    }

    async fn process(&self, value: Value) {
        let Some(record) = StatsRecord::from_value(value) else {
            return;
        };
        let Some((_, name)) = record.identity() else {
            debug!("Skipping stats record without identity");
            return;
        };
        let name = name.to_string();

        let env = self.env(&name).await;
        let meta = self.metadata(&name, &env).await;
        let kind = self.cache.write().await.upsert(&record, &meta);

        if let Some(kind) = kind {
            if kind.is_chain_node() {
                if let Some(port) = rpc_port(&env, &name) {
                    self.health.ensure_started(&name, port);
                }
            }
            self.initialized.send_if_modified(|ready| {
                let changed = !*ready;
                *ready = true;
                changed
            });
        }
    }

    async fn env(&self, name: &str) -> HashMap<String, String> {
        if let Some(env) = self.cache.read().await.env(name) {
            return env.clone();
        }

        let env = match self.inspector.env(name).await {
            Ok(env) => env,
            Err(e) => {
                debug!(entity = %name, error = %e, "Environment lookup failed");
                HashMap::new()
            }
        };
        self.cache.write().await.store_env(name, env.clone());
        env
    }

    async fn inspected_image(&self, name: &str) -> Option<String> {
        if let Some(info) = self.cache.read().await.info(name) {
            return Some(info.image.clone());
        }

        match self.inspector.info(name).await {
            Ok(info) => {
                let image = info.image.clone();
                self.cache.write().await.store_info(name, info);
                Some(image)
            }
            Err(e) => {
                debug!(entity = %name, error = %e, "Info lookup failed");
                None
            }
        }
    }

    async fn data_size(&self, name: &str) -> u64 {
        if let Some(size) = self.cache.read().await.volume_size(name) {
            return size;
        }

        let size = match self.inspector.volume_size(name).await {
            Ok(size) => size,
            Err(e) => {
                debug!(entity = %name, error = %e, "Volume size lookup failed");
                0
            }
        };
        self.cache.write().await.store_volume_size(name, size);
        size
    }

    async fn metadata(&self, name: &str, env: &HashMap<String, String>) -> EntityMetadata {
        let mut image_name = resolve_image(name, env, None);
        if image_name.is_empty() {
            let inspected = self.inspected_image(name).await;
            image_name = resolve_image(name, env, inspected.as_deref());
        }

        let data_size = if classify(name, &image_name).is_chain_node() {
            self.data_size(name).await
        } else {
            0
        };

        EntityMetadata {
            image_name,
            nickname: env.get("TELEMETRY_NAME").cloned().unwrap_or_default(),
            data_size,
        }
    }
}
