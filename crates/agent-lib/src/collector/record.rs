//! Typed view of one `docker stats` JSON record

use super::units::{parse_percentage, parse_size_pair, IO_SEPARATORS, USAGE_SEPARATORS};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// Raw stats record as emitted by `docker stats --format '{{ json . }}'`
///
/// Every field is optional and lenient: non-string values are stringified
/// and missing values become empty strings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsRecord {
    #[serde(rename = "ID", default, deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(rename = "Container", default, deserialize_with = "lenient_string")]
    pub container: String,
    #[serde(rename = "Name", default, deserialize_with = "lenient_string")]
    pub name: String,
    #[serde(rename = "CPUPerc", default, deserialize_with = "lenient_string")]
    pub cpu_perc: String,
    #[serde(rename = "MemPerc", default, deserialize_with = "lenient_string")]
    pub mem_perc: String,
    #[serde(rename = "MemUsage", default, deserialize_with = "lenient_string")]
    pub mem_usage: String,
    #[serde(rename = "NetIO", default, deserialize_with = "lenient_string")]
    pub net_io: String,
    #[serde(rename = "BlockIO", default, deserialize_with = "lenient_string")]
    pub block_io: String,
}

/// Numeric metrics extracted from a record
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RecordMetrics {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

impl StatsRecord {
    /// Decode a parsed record; returns None for non-object values.
    pub fn from_value(value: Value) -> Option<Self> {
        if !value.is_object() {
            return None;
        }
        serde_json::from_value(value).ok()
    }

    /// Entity identity as `(id, name)`; records lacking either are unusable.
    pub fn identity(&self) -> Option<(&str, &str)> {
        let id = if self.id.trim().is_empty() {
            self.container.trim()
        } else {
            self.id.trim()
        };
        let name = self.name.trim();
        if id.is_empty() || name.is_empty() {
            None
        } else {
            Some((id, name))
        }
    }

    pub fn metrics(&self) -> RecordMetrics {
        let (memory_usage, memory_limit) = parse_size_pair(&self.mem_usage, USAGE_SEPARATORS);
        let (network_rx, network_tx) = parse_size_pair(&self.net_io, IO_SEPARATORS);
        let (block_read, block_write) = parse_size_pair(&self.block_io, IO_SEPARATORS);

        RecordMetrics {
            cpu_percent: parse_percentage(&self.cpu_perc),
            memory_usage,
            memory_limit,
            memory_percent: parse_percentage(&self.mem_perc),
            network_rx,
            network_tx,
            block_read,
            block_write,
        }
    }
}
