//! Agent configuration
//!
//! Settings come from `AGENT_*` environment variables, optionally layered
//! over a file named by `AGENT_CONFIG_FILE`. Every field has a default
//! except `server_id`.

use agent_lib::collector::{HealthPollConfig, StatsCollectorConfig};
use agent_lib::host::HostOverrides;
use agent_lib::monitor::MonitorConfig;
use agent_lib::sync::{ChannelConfig, ConnectTarget};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "AGENT_CONFIG_FILE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("server_id is required (set AGENT_SERVER_ID)")]
    MissingServerId,

    #[error("unknown ws_mode '{0}' (expected auto, ws, wss or wss_internal)")]
    InvalidMode(String),

    #[error("node_names contains no patterns")]
    EmptyNodeList,

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

/// Agent configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Identity announced to the relay
    #[serde(default)]
    pub server_id: String,

    /// Comma-separated entity name patterns
    #[serde(default = "default_node_names")]
    pub node_names: String,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Delivered ticks per rollup summary
    #[serde(default = "default_summary_window")]
    pub summary_window: usize,

    #[serde(default = "default_ws_mode")]
    pub ws_mode: String,

    /// Explicit relay URL, overrides `ws_mode`
    #[serde(default)]
    pub server_url: Option<String>,

    #[serde(default = "default_ws_server_host")]
    pub ws_server_host: String,

    #[serde(default = "default_ws_port")]
    pub ws_port_ws: u16,

    #[serde(default = "default_wss_port")]
    pub ws_port_wss: u16,

    /// Overrides the port of the selected mode
    #[serde(default)]
    pub ws_server_port: Option<u16>,

    #[serde(default = "default_true")]
    pub ssl_verify: bool,

    /// Initial connect attempts before giving up (0 = unlimited)
    #[serde(default)]
    pub max_retries: u32,

    /// Host metrics only, no container stats
    #[serde(default)]
    pub no_docker: bool,

    /// Port for health, metrics and status endpoints
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    #[serde(default = "default_catch_up_threshold")]
    pub catch_up_threshold_blocks: u64,

    #[serde(default)]
    pub host_system_name: String,
    #[serde(default)]
    pub host_model: String,
    #[serde(default)]
    pub host_processor: String,
    #[serde(default)]
    pub host_cpu_cores: usize,
    #[serde(default)]
    pub host_cpu_perf_cores: usize,
    #[serde(default)]
    pub host_cpu_eff_cores: usize,
    #[serde(default)]
    pub host_memory_gb: u64,
    #[serde(default)]
    pub host_disk_total_gb: u64,
}

fn default_node_names() -> String {
    "node,3node".to_string()
}

fn default_monitor_interval() -> u64 {
    5
}

fn default_summary_window() -> usize {
    60
}

fn default_ws_mode() -> String {
    "auto".to_string()
}

fn default_ws_server_host() -> String {
    "localhost".to_string()
}

fn default_ws_port() -> u16 {
    8080
}

fn default_wss_port() -> u16 {
    4443
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    9101
}

fn default_queue_capacity() -> usize {
    100
}

fn default_health_check_interval() -> u64 {
    10
}

fn default_catch_up_threshold() -> u64 {
    100
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn non_zero<T: Default + PartialEq>(value: T) -> Option<T> {
    (value != T::default()).then_some(value)
}

impl AgentConfig {
    /// Load configuration from the environment and the optional config file
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var(CONFIG_FILE_ENV).ok();
        Self::from_sources(file.as_deref(), None)
    }

    /// Load from an optional file and an explicit variable map.
    ///
    /// With `env == None` the process environment is read.
    pub fn from_sources(
        file: Option<&str>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file.filter(|p| !p.is_empty()) {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let config = builder
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?;

        let config: AgentConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id.trim().is_empty() {
            return Err(ConfigError::MissingServerId);
        }
        if self.node_patterns().is_empty() {
            return Err(ConfigError::EmptyNodeList);
        }
        if self.monitor_interval_secs == 0 {
            return Err(ConfigError::Zero {
                field: "monitor_interval_secs",
            });
        }
        if self.summary_window == 0 {
            return Err(ConfigError::Zero {
                field: "summary_window",
            });
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero {
                field: "queue_capacity",
            });
        }
        self.connect_target()?;
        Ok(())
    }

    /// Node patterns, trimmed, with empties dropped
    pub fn node_patterns(&self) -> Vec<String> {
        self.node_names
            .split(',')
            .filter_map(non_empty)
            .collect()
    }

    pub fn connect_target(&self) -> Result<ConnectTarget, ConfigError> {
        if let Some(url) = self.server_url.as_deref().and_then(non_empty) {
            return Ok(ConnectTarget::Custom(url));
        }
        ConnectTarget::from_mode(&self.ws_mode)
            .ok_or_else(|| ConfigError::InvalidMode(self.ws_mode.clone()))
    }

    pub fn channel_config(&self) -> Result<ChannelConfig, ConfigError> {
        let target = self.connect_target()?;

        let mut ws_port = self.ws_port_ws;
        let mut wss_port = self.ws_port_wss;
        if let Some(port) = self.ws_server_port {
            if target == ConnectTarget::Ws {
                ws_port = port;
            } else {
                wss_port = port;
            }
        }

        Ok(ChannelConfig {
            server_id: self.server_id.trim().to_string(),
            target,
            host: self.ws_server_host.clone(),
            ws_port,
            wss_port,
            ssl_verify: self.ssl_verify,
            queue_capacity: self.queue_capacity,
            ..ChannelConfig::default()
        })
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            server_id: self.server_id.trim().to_string(),
            interval: Duration::from_secs(self.monitor_interval_secs),
            summary_window: self.summary_window,
            node_patterns: self.node_patterns(),
        }
    }

    pub fn stats_config(&self) -> StatsCollectorConfig {
        StatsCollectorConfig {
            health: HealthPollConfig {
                interval: Duration::from_secs(self.health_check_interval_secs.max(1)),
                catch_up_threshold: self.catch_up_threshold_blocks,
                ..HealthPollConfig::default()
            },
            ..StatsCollectorConfig::default()
        }
    }

    pub fn host_overrides(&self) -> HostOverrides {
        HostOverrides {
            system_name: non_empty(&self.host_system_name),
            model: non_empty(&self.host_model),
            processor: non_empty(&self.host_processor),
            cpu_cores: non_zero(self.host_cpu_cores),
            cpu_perf_cores: non_zero(self.host_cpu_perf_cores),
            cpu_eff_cores: non_zero(self.host_cpu_eff_cores),
            memory_gb: non_zero(self.host_memory_gb),
            disk_total_gb: non_zero(self.host_disk_total_gb),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn load(pairs: &[(&str, &str)]) -> Result<AgentConfig, ConfigError> {
        AgentConfig::from_sources(None, Some(env(pairs)))
    }

    #[test]
    fn test_defaults_apply_with_only_server_id() {
        let config = load(&[("AGENT_SERVER_ID", "validator-01")]).unwrap();

        assert_eq!(config.server_id, "validator-01");
        assert_eq!(config.node_patterns(), vec!["node", "3node"]);
        assert_eq!(config.monitor_interval_secs, 5);
        assert_eq!(config.summary_window, 60);
        assert_eq!(config.api_port, 9101);
        assert_eq!(config.catch_up_threshold_blocks, 100);
        assert!(config.ssl_verify);
        assert!(!config.no_docker);
        assert_eq!(config.host_overrides(), HostOverrides::default());
    }

    #[test]
    fn test_missing_server_id_is_fatal() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingServerId)));
        assert!(matches!(
            load(&[("AGENT_SERVER_ID", "   ")]),
            Err(ConfigError::MissingServerId)
        ));
    }

    #[test]
    fn test_unknown_mode_is_fatal() {
        let result = load(&[("AGENT_SERVER_ID", "s1"), ("AGENT_WS_MODE", "quic")]);
        assert!(matches!(result, Err(ConfigError::InvalidMode(mode)) if mode == "quic"));
    }

    #[test]
    fn test_node_names_are_trimmed() {
        let config = load(&[
            ("AGENT_SERVER_ID", "s1"),
            ("AGENT_NODE_NAMES", " node1 , ,3node2,"),
        ])
        .unwrap();
        assert_eq!(config.node_patterns(), vec!["node1", "3node2"]);

        let result = load(&[("AGENT_SERVER_ID", "s1"), ("AGENT_NODE_NAMES", " , ")]);
        assert!(matches!(result, Err(ConfigError::EmptyNodeList)));
    }

    #[test]
    fn test_port_override_follows_mode() {
        let config = load(&[
            ("AGENT_SERVER_ID", "s1"),
            ("AGENT_WS_MODE", "ws"),
            ("AGENT_WS_SERVER_PORT", "9000"),
        ])
        .unwrap();
        let channel = config.channel_config().unwrap();
        assert_eq!(channel.candidate_urls(), vec!["ws://localhost:9000/ws/monitoring/"]);

        let config = load(&[
            ("AGENT_SERVER_ID", "s1"),
            ("AGENT_WS_SERVER_HOST", "relay.internal"),
            ("AGENT_WS_SERVER_PORT", "9443"),
        ])
        .unwrap();
        let channel = config.channel_config().unwrap();
        assert_eq!(
            channel.candidate_urls(),
            vec![
                "wss://relay.internal:9443/ws/monitoring/",
                "ws://relay.internal:8080/ws/monitoring/"
            ]
        );
    }

    #[test]
    fn test_server_url_overrides_mode() {
        let config = load(&[
            ("AGENT_SERVER_ID", "s1"),
            ("AGENT_WS_MODE", "wss"),
            ("AGENT_SERVER_URL", "wss://127.0.0.1:7000/ws/monitoring/"),
            ("AGENT_SSL_VERIFY", "false"),
        ])
        .unwrap();
        let channel = config.channel_config().unwrap();

        assert_eq!(
            channel.target,
            ConnectTarget::Custom("wss://127.0.0.1:7000/ws/monitoring/".to_string())
        );
        assert!(!channel.ssl_verify);
    }

    #[test]
    fn test_host_overrides_ignore_empty_values() {
        let config = load(&[
            ("AGENT_SERVER_ID", "s1"),
            ("AGENT_HOST_MODEL", "Mac Studio"),
            ("AGENT_HOST_PROCESSOR", "M2 Ultra"),
            ("AGENT_HOST_CPU_CORES", "24"),
            ("AGENT_HOST_MEMORY_GB", "192"),
            ("AGENT_HOST_SYSTEM_NAME", ""),
        ])
        .unwrap();
        let overrides = config.host_overrides();

        assert_eq!(overrides.model.as_deref(), Some("Mac Studio"));
        assert_eq!(overrides.cpu_cores, Some(24));
        assert_eq!(overrides.memory_gb, Some(192));
        assert_eq!(overrides.system_name, None);
        assert_eq!(overrides.cpu_eff_cores, None);
    }

    #[test]
    fn test_file_source_is_layered_under_environment() {
        use std::io::Write;

        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "server_id = \"from-file\"").unwrap();
        writeln!(file, "summary_window = 12").unwrap();
        writeln!(file, "ws_mode = \"wss\"").unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let config = AgentConfig::from_sources(
            Some(&path),
            Some(env(&[("AGENT_SERVER_ID", "from-env")])),
        )
        .unwrap();

        assert_eq!(config.server_id, "from-env");
        assert_eq!(config.summary_window, 12);
        assert_eq!(config.connect_target().unwrap(), ConnectTarget::Wss);
    }

    #[test]
    fn test_missing_config_file_is_not_required() {
        let config = AgentConfig::from_sources(
            Some("/nonexistent/agent.toml"),
            Some(env(&[("AGENT_SERVER_ID", "s1")])),
        )
        .unwrap();
        assert_eq!(config.server_id, "s1");
    }

    #[test]
    fn test_derived_component_configs() {
        let config = load(&[
            ("AGENT_SERVER_ID", "s1"),
            ("AGENT_MONITOR_INTERVAL_SECS", "2"),
            ("AGENT_SUMMARY_WINDOW", "10"),
            ("AGENT_CATCH_UP_THRESHOLD_BLOCKS", "25"),
            ("AGENT_QUEUE_CAPACITY", "7"),
        ])
        .unwrap();

        let monitor = config.monitor_config();
        assert_eq!(monitor.interval, Duration::from_secs(2));
        assert_eq!(monitor.summary_window, 10);
        assert_eq!(config.stats_config().health.catch_up_threshold, 25);
        assert_eq!(config.channel_config().unwrap().queue_capacity, 7);

        let result = load(&[("AGENT_SERVER_ID", "s1"), ("AGENT_SUMMARY_WINDOW", "0")]);
        assert!(matches!(result, Err(ConfigError::Zero { field: "summary_window" })));
    }
}
