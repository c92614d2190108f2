//! Keyed store of the latest metrics per entity
//!
//! Holds one [`EntitySnapshot`] per entity name plus short-lived auxiliary
//! caches for the expensive per-entity lookups (environment, descriptive
//! info, data volume size). Entities that stop appearing in the stream are
//! evicted together with their auxiliary entries.

use super::inspect::EntityInfo;
use super::record::StatsRecord;
use crate::models::{
    round2, BlockIo, CpuUsage, EntityKind, EntitySnapshot, MemoryUsage, NetworkIo,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Environment lookups are refreshed after this long
pub const ENV_TTL: Duration = Duration::from_secs(1);

/// Descriptive info and volume sizes are refreshed after this long
pub const INFO_TTL: Duration = Duration::from_secs(5);

/// Minimum time between eviction passes
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Small map whose entries expire after a fixed TTL
#[derive(Debug)]
pub struct TtlCache<V> {
    ttl: Duration,
    entries: HashMap<String, (Instant, V)>,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    /// Fresh value for `key`, if any
    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|(stored_at, _)| stored_at.elapsed() < self.ttl)
            .map(|(_, value)| value)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: V) {
        self.entries.insert(key.into(), (Instant::now(), value));
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn retain_keys(&mut self, keep: &HashSet<String>) {
        self.entries.retain(|key, _| keep.contains(key));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Enrichment data gathered for an entity before it is stored
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityMetadata {
    pub image_name: String,
    pub nickname: String,
    pub data_size: u64,
}

/// Classify an entity from its name and image.
pub fn classify(name: &str, image: &str) -> EntityKind {
    if image.contains("creditcoin3") {
        EntityKind::Creditcoin3
    } else if image.contains("creditcoin2") {
        EntityKind::Creditcoin2
    } else if name.contains("mclient") {
        EntityKind::Mclient
    } else if name.contains("postgres") || name.contains("db") {
        EntityKind::Postgres
    } else {
        EntityKind::Unknown
    }
}

/// Resolve the image an entity runs.
///
/// `IMAGE` wins; otherwise a `GIT_TAG` together with the node naming
/// convention implies the chain image; otherwise the inspected image.
pub fn resolve_image(
    name: &str,
    env: &HashMap<String, String>,
    inspected: Option<&str>,
) -> String {
    if let Some(image) = env.get("IMAGE").filter(|v| !v.is_empty()) {
        return image.clone();
    }
    if let Some(tag) = env.get("GIT_TAG").filter(|v| !v.is_empty()) {
        if name.contains("3node") {
            return format!("creditcoin3:{}", tag);
        }
        if name.contains("node") {
            return format!("creditcoin2:{}", tag);
        }
    }
    inspected.unwrap_or_default().to_string()
}

/// True when `name` equals or contains one of `patterns`
pub fn matches_patterns(name: &str, patterns: &[String]) -> bool {
    patterns
        .iter()
        .any(|p| !p.is_empty() && (name == p || name.contains(p.as_str())))
}

/// Latest snapshot per entity with auxiliary lookup caches
#[derive(Debug)]
pub struct EntityStatsCache {
    entries: HashMap<String, EntitySnapshot>,
    env: TtlCache<HashMap<String, String>>,
    info: TtlCache<EntityInfo>,
    volumes: TtlCache<u64>,
    seen: HashSet<String>,
    last_cleanup: Instant,
    cleanup_interval: Duration,
    cores: usize,
}

impl Default for EntityStatsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStatsCache {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_settings(ENV_TTL, INFO_TTL, CLEANUP_INTERVAL, cores)
    }

    pub fn with_settings(
        env_ttl: Duration,
        info_ttl: Duration,
        cleanup_interval: Duration,
        cores: usize,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            env: TtlCache::new(env_ttl),
            info: TtlCache::new(info_ttl),
            volumes: TtlCache::new(info_ttl),
            seen: HashSet::new(),
            last_cleanup: Instant::now(),
            cleanup_interval,
            cores,
        }
    }

    /// Store a freshly parsed record.
    ///
    /// Returns the entity kind, or None when the record has no identity or
    /// describes the agent's own container.
    pub fn upsert(&mut self, record: &StatsRecord, meta: &EntityMetadata) -> Option<EntityKind> {
        let (id, name) = record.identity()?;
        self.seen.insert(name.to_string());

        let kind = classify(name, &meta.image_name);
        if kind == EntityKind::Mclient {
            return None;
        }

        let metrics = record.metrics();
        let snapshot = EntitySnapshot {
            id: id.to_string(),
            name: name.to_string(),
            status: "running".to_string(),
            cpu: CpuUsage {
                percent: round2(metrics.cpu_percent),
                cores: self.cores,
            },
            memory: MemoryUsage {
                usage: metrics.memory_usage,
                limit: metrics.memory_limit,
                percent: round2(metrics.memory_percent),
            },
            network: NetworkIo {
                rx: metrics.network_rx,
                tx: metrics.network_tx,
            },
            disk: BlockIo {
                read: metrics.block_read,
                write: metrics.block_write,
            },
            nickname: meta.nickname.clone(),
            node_name: name.to_string(),
            node_type: kind,
            image_name: meta.image_name.clone(),
            data_size: meta.data_size,
            sync_state: None,
            blockchain: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        };
        self.entries.insert(name.to_string(), snapshot);
        Some(kind)
    }

    /// Snapshot of entities matching `patterns`.
    ///
    /// An empty pattern list, or a filter that matches nothing, yields the
    /// full set.
    pub fn snapshot(&self, patterns: &[String]) -> BTreeMap<String, EntitySnapshot> {
        let all = || {
            self.entries
                .iter()
                .map(|(name, snapshot)| (name.clone(), snapshot.clone()))
                .collect::<BTreeMap<_, _>>()
        };

        if patterns.iter().all(|p| p.is_empty()) {
            return all();
        }

        let filtered: BTreeMap<_, _> = self
            .entries
            .iter()
            .filter(|(name, _)| matches_patterns(name, patterns))
            .map(|(name, snapshot)| (name.clone(), snapshot.clone()))
            .collect();

        if filtered.is_empty() {
            all()
        } else {
            filtered
        }
    }

    pub fn get(&self, name: &str) -> Option<&EntitySnapshot> {
        self.entries.get(name)
    }

    /// Entities whose names contain any of `fragments`
    pub fn find_containing(&self, fragments: &[&str]) -> Vec<EntitySnapshot> {
        let mut found: Vec<EntitySnapshot> = self
            .entries
            .values()
            .filter(|s| fragments.iter().any(|f| s.name.contains(f)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        found
    }

    /// Evict when a full cleanup interval has elapsed since the last pass.
    ///
    /// Names not seen during the window are removed. A window that saw no
    /// records at all stays open and evicts nothing.
    pub fn cleanup_if_due(&mut self) -> Vec<String> {
        if self.last_cleanup.elapsed() < self.cleanup_interval || self.seen.is_empty() {
            return Vec::new();
        }
        let seen = std::mem::take(&mut self.seen);
        self.last_cleanup = Instant::now();
        self.evict_absent(&seen)
    }

    /// Remove every entity absent from `seen`, along with its auxiliary entries.
    pub fn evict_absent(&mut self, seen: &HashSet<String>) -> Vec<String> {
        let mut evicted: Vec<String> = self
            .entries
            .keys()
            .filter(|name| !seen.contains(*name))
            .cloned()
            .collect();
        evicted.sort();

        for name in &evicted {
            self.entries.remove(name);
        }
        self.env.retain_keys(seen);
        self.info.retain_keys(seen);
        self.volumes.retain_keys(seen);
        evicted
    }

    pub fn env(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.env.get(name)
    }

    pub fn store_env(&mut self, name: &str, env: HashMap<String, String>) {
        self.env.insert(name, env);
    }

    pub fn info(&self, name: &str) -> Option<&EntityInfo> {
        self.info.get(name)
    }

    pub fn store_info(&mut self, name: &str, info: EntityInfo) {
        self.info.insert(name, info);
    }

    pub fn volume_size(&self, name: &str) -> Option<u64> {
        self.volumes.get(name).copied()
    }

    pub fn store_volume_size(&mut self, name: &str, size: u64) {
        self.volumes.insert(name, size);
    }

    /// True if any auxiliary cache still holds an entry for `name`
    pub fn has_auxiliary(&self, name: &str) -> bool {
        self.env.contains(name) || self.info.contains(name) || self.volumes.contains(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(name: &str) -> StatsRecord {
        StatsRecord::from_value(json!({
            "ID": format!("id-{}", name),
            "Name": name,
            "CPUPerc": "1.234%",
            "MemPerc": "2.50%",
            "MemUsage": "1MiB / 1GiB",
            "NetIO": "1kB / 2kB",
            "BlockIO": "0B / 0B",
        }))
        .unwrap()
    }

    fn meta(image: &str) -> EntityMetadata {
        EntityMetadata {
            image_name: image.to_string(),
            ..Default::default()
        }
    }

    fn names(cache: &EntityStatsCache, patterns: &[&str]) -> Vec<String> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        cache.snapshot(&patterns).into_keys().collect()
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("3node1", "creditcoin3:v1"), EntityKind::Creditcoin3);
        assert_eq!(classify("node0", "creditcoin2:v1"), EntityKind::Creditcoin2);
        assert_eq!(classify("mclient", ""), EntityKind::Mclient);
        assert_eq!(classify("postgres", "postgres:15"), EntityKind::Postgres);
        assert_eq!(classify("metrics-db", ""), EntityKind::Postgres);
        assert_eq!(classify("mserver", "python:3"), EntityKind::Unknown);
    }

    #[test]
    fn test_resolve_image() {
        let mut env = HashMap::new();
        assert_eq!(resolve_image("node1", &env, Some("busybox")), "busybox");

        env.insert("GIT_TAG".to_string(), "2.230.2".to_string());
        assert_eq!(resolve_image("3node2", &env, None), "creditcoin3:2.230.2");
        assert_eq!(resolve_image("node2", &env, None), "creditcoin2:2.230.2");
        assert_eq!(resolve_image("postgres", &env, Some("postgres:15")), "postgres:15");

        env.insert("IMAGE".to_string(), "custom:tag".to_string());
        assert_eq!(resolve_image("3node2", &env, None), "custom:tag");
    }

    #[test]
    fn test_upsert_stores_rounded_metrics() {
        let mut cache = EntityStatsCache::with_settings(ENV_TTL, INFO_TTL, CLEANUP_INTERVAL, 4);
        let kind = cache.upsert(&record("node1"), &meta("creditcoin2:1"));

        assert_eq!(kind, Some(EntityKind::Creditcoin2));
        let snapshot = cache.get("node1").unwrap();
        assert_eq!(snapshot.cpu.percent, 1.23);
        assert_eq!(snapshot.cpu.cores, 4);
        assert_eq!(snapshot.memory.usage, 1024 * 1024);
        assert_eq!(snapshot.memory.percent, 2.5);
        assert_eq!(snapshot.node_name, "node1");
        assert_eq!(snapshot.status, "running");
    }

    #[test]
    fn test_upsert_keeps_single_entry_per_name() {
        let mut cache = EntityStatsCache::new();
        cache.upsert(&record("node1"), &meta(""));
        cache.upsert(&record("node1"), &meta(""));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_own_entity_is_excluded() {
        let mut cache = EntityStatsCache::new();
        assert!(cache.upsert(&record("mclient"), &meta("")).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_snapshot_filtering() {
        let mut cache = EntityStatsCache::new();
        for name in ["node1", "3node1", "postgres"] {
            cache.upsert(&record(name), &meta(""));
        }

        assert_eq!(names(&cache, &["3node"]), vec!["3node1"]);
        assert_eq!(names(&cache, &["node1"]), vec!["3node1", "node1"]);
        assert_eq!(names(&cache, &["postgres", "3node1"]), vec!["3node1", "postgres"]);
        assert_eq!(names(&cache, &[]), vec!["3node1", "node1", "postgres"]);
    }

    #[test]
    fn test_filter_without_match_falls_back_to_full_set() {
        let mut cache = EntityStatsCache::new();
        cache.upsert(&record("node1"), &meta(""));
        cache.upsert(&record("node2"), &meta(""));

        assert_eq!(names(&cache, &["zzz-nomatch"]), vec!["node1", "node2"]);
    }

    #[test]
    fn test_evict_absent_clears_auxiliary_caches() {
        let mut cache = EntityStatsCache::new();
        cache.upsert(&record("a"), &meta(""));
        cache.upsert(&record("b"), &meta(""));
        cache.store_env("b", HashMap::new());
        cache.store_volume_size("b", 42);

        let cycle2: HashSet<String> = ["a".to_string()].into_iter().collect();
        let evicted = cache.evict_absent(&cycle2);

        assert_eq!(evicted, vec!["b"]);
        assert_eq!(names(&cache, &[]), vec!["a"]);
        assert!(!cache.has_auxiliary("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_waits_for_full_interval() {
        let mut cache = EntityStatsCache::new();
        cache.upsert(&record("a"), &meta(""));
        cache.upsert(&record("b"), &meta(""));

        // Window 1: both seen
        tokio::time::advance(CLEANUP_INTERVAL).await;
        assert!(cache.cleanup_if_due().is_empty());

        // Window 2: only a seen, but the interval has not elapsed yet
        cache.upsert(&record("a"), &meta(""));
        assert!(cache.cleanup_if_due().is_empty());
        assert_eq!(cache.len(), 2);

        tokio::time::advance(CLEANUP_INTERVAL).await;
        assert_eq!(cache.cleanup_if_due(), vec!["b"]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_window_keeps_entities() {
        let mut cache = EntityStatsCache::new();
        cache.upsert(&record("node1"), &meta(""));
        cache.store_env("node1", HashMap::new());

        tokio::time::advance(CLEANUP_INTERVAL).await;
        assert!(cache.cleanup_if_due().is_empty());

        // nothing parsed during the next window
        tokio::time::advance(CLEANUP_INTERVAL).await;
        assert!(cache.cleanup_if_due().is_empty());
        assert_eq!(cache.len(), 1);
        assert!(cache.has_auxiliary("node1"));

        // the open window closes on the next record
        cache.upsert(&record("node2"), &meta(""));
        assert_eq!(cache.cleanup_if_due(), vec!["node1"]);
        assert_eq!(names(&cache, &[]), vec!["node2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_cache_expiry() {
        let mut ttl = TtlCache::new(Duration::from_secs(1));
        ttl.insert("node1", 7u64);
        assert_eq!(ttl.get("node1"), Some(&7));

        tokio::time::advance(Duration::from_millis(1001)).await;
        assert_eq!(ttl.get("node1"), None);
        assert!(ttl.contains("node1"));
    }

    #[test]
    fn test_find_containing() {
        let mut cache = EntityStatsCache::new();
        for name in ["node1", "mserver", "postgres"] {
            cache.upsert(&record(name), &meta(""));
        }
        let found: Vec<String> = cache
            .find_containing(&["mserver", "postgres"])
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(found, vec!["mserver", "postgres"]);
    }
}
