//! Per-entity lookups through the container runtime CLI

use super::CommandRunner;
use anyhow::{anyhow, bail, Context, Result};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Mount point of the chain data volume inside node containers
pub const DATA_MOUNT: &str = "/root/data";

/// Base RPC ports for the `node<N>` and `3node<N>` naming conventions
const NODE_RPC_BASE: u16 = 33880;
const NODE3_RPC_BASE: u16 = 33980;

/// Descriptive info about an entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityInfo {
    pub container_id: String,
    pub image: String,
    pub status: String,
    pub started_at: String,
    pub restart_count: u64,
    pub network_mode: String,
}

/// Runs `docker inspect` / `docker exec` lookups for one entity at a time
#[derive(Clone)]
pub struct DockerInspector {
    runner: Arc<dyn CommandRunner>,
}

impl DockerInspector {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn inspect_document(&self, name: &str) -> Result<Value> {
        let output = self.runner.run(&["inspect", name]).await?;
        if !output.success {
            bail!("docker inspect {} failed: {}", name, output.stderr.trim());
        }
        let parsed: Value = serde_json::from_str(&output.stdout)
            .with_context(|| format!("invalid inspect output for {}", name))?;
        parsed
            .get(0)
            .cloned()
            .ok_or_else(|| anyhow!("empty inspect output for {}", name))
    }

    /// Environment variables configured for the entity
    pub async fn env(&self, name: &str) -> Result<HashMap<String, String>> {
        let document = self.inspect_document(name).await?;
        let env = document["Config"]["Env"]
            .as_array()
            .map(|vars| {
                vars.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|var| var.split_once('='))
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(env)
    }

    pub async fn info(&self, name: &str) -> Result<EntityInfo> {
        let document = self.inspect_document(name).await?;
        let text = |v: &Value| v.as_str().unwrap_or_default().to_string();

        Ok(EntityInfo {
            container_id: text(&document["Id"]).chars().take(12).collect(),
            image: text(&document["Config"]["Image"]),
            status: text(&document["State"]["Status"]),
            started_at: text(&document["State"]["StartedAt"]),
            restart_count: document["RestartCount"].as_u64().unwrap_or(0),
            network_mode: text(&document["HostConfig"]["NetworkMode"]),
        })
    }

    /// Whether the runtime reports the entity as running.
    ///
    /// A failed inspect (entity removed) counts as not running.
    pub async fn is_running(&self, name: &str) -> Result<bool> {
        let output = self
            .runner
            .run(&["inspect", "-f", "{{.State.Running}}", name])
            .await?;
        Ok(output.success && output.stdout.trim() == "true")
    }

    /// Size in bytes of the chain data volume, 0 when not mounted
    pub async fn volume_size(&self, name: &str) -> Result<u64> {
        let format = format!(
            "{{{{range .Mounts}}}}{{{{if eq .Destination \"{}\"}}}}{{{{.Source}}}}{{{{end}}}}{{{{end}}}}",
            DATA_MOUNT
        );
        let mounts = self.runner.run(&["inspect", name, "--format", &format]).await?;
        if !mounts.success || mounts.stdout.trim().is_empty() {
            return Ok(0);
        }

        let usage = self
            .runner
            .run(&["exec", name, "du", "-sb", DATA_MOUNT])
            .await?;
        if !usage.success {
            bail!("du in {} failed: {}", name, usage.stderr.trim());
        }
        usage
            .stdout
            .split_whitespace()
            .next()
            .and_then(|size| size.parse::<u64>().ok())
            .ok_or_else(|| anyhow!("unexpected du output from {}", name))
    }

    /// Issue a JSON-RPC call against the node's local endpoint.
    ///
    /// Returns the `result` member; a response without one is `None`.
    pub async fn rpc_call(
        &self,
        name: &str,
        port: u16,
        method: &str,
        params: Value,
    ) -> Result<Option<Value>> {
        let body = json!({"id": 1, "jsonrpc": "2.0", "method": method, "params": params}).to_string();
        let url = format!("http://localhost:{}/", port);
        let output = self
            .runner
            .run(&[
                "exec",
                name,
                "curl",
                "-s",
                "-H",
                "Content-Type: application/json",
                "-d",
                &body,
                &url,
            ])
            .await?;
        if !output.success {
            bail!("{} on {} failed with exit code {:?}", method, name, output.code);
        }

        let response: Value = serde_json::from_str(output.stdout.trim())
            .with_context(|| format!("invalid {} response from {}", method, name))?;
        Ok(response.get("result").filter(|r| !r.is_null()).cloned())
    }
}

/// RPC port of a chain node.
///
/// An all-digit `RPC_PORT` wins; otherwise the port follows from the
/// `3node<N>` / `node<N>` naming convention.
pub fn rpc_port(env: &HashMap<String, String>, name: &str) -> Option<u16> {
    if let Some(port) = env.get("RPC_PORT") {
        let port = port.trim();
        if !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(port) = port.parse() {
                return Some(port);
            }
        }
    }

    let (base, suffix) = if let Some(pos) = name.find("3node") {
        (NODE3_RPC_BASE, &name[pos + "3node".len()..])
    } else if let Some(pos) = name.find("node") {
        (NODE_RPC_BASE, &name[pos + "node".len()..])
    } else {
        return None;
    };

    let digits: String = suffix.chars().take_while(|c| c.is_ascii_digit()).collect();
    let index: u16 = digits.parse().ok()?;
    base.checked_add(index)
}

/// Block number from a header `number` field (hex string or integer)
pub fn parse_block_number(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => {
            let s = s.trim();
            match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                Some(hex) => u64::from_str_radix(hex, 16).ok(),
                None => s.parse().ok(),
            }
        }
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::ScriptedRunner;
    use crate::collector::CommandOutput;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_rpc_port_from_env() {
        assert_eq!(rpc_port(&env(&[("RPC_PORT", "9944")]), "node0"), Some(9944));
    }

    #[test]
    fn test_rpc_port_ignores_non_numeric_env() {
        assert_eq!(rpc_port(&env(&[("RPC_PORT", "99a")]), "node2"), Some(33882));
    }

    #[test]
    fn test_rpc_port_from_name() {
        let empty = HashMap::new();
        assert_eq!(rpc_port(&empty, "node0"), Some(33880));
        assert_eq!(rpc_port(&empty, "node12"), Some(33892));
        assert_eq!(rpc_port(&empty, "3node1"), Some(33981));
        assert_eq!(rpc_port(&empty, "postgres"), None);
        assert_eq!(rpc_port(&empty, "node"), None);
    }

    #[test]
    fn test_parse_block_number() {
        assert_eq!(parse_block_number(&json!("0x1a")), Some(26));
        assert_eq!(parse_block_number(&json!(42)), Some(42));
        assert_eq!(parse_block_number(&json!("12")), Some(12));
        assert_eq!(parse_block_number(&json!("0xzz")), None);
        assert_eq!(parse_block_number(&json!(null)), None);
    }

    #[tokio::test]
    async fn test_env_lookup() {
        let runner = ScriptedRunner::new(|args| {
            assert_eq!(args, ["inspect", "node1"]);
            CommandOutput::ok(r#"[{"Config":{"Env":["GIT_TAG=2.1","TELEMETRY_NAME=alpha=1","BROKEN"]}}]"#)
        });
        let inspector = DockerInspector::new(Arc::new(runner));

        let env = inspector.env("node1").await.unwrap();
        assert_eq!(env.get("GIT_TAG").map(String::as_str), Some("2.1"));
        assert_eq!(env.get("TELEMETRY_NAME").map(String::as_str), Some("alpha=1"));
        assert_eq!(env.len(), 2);
    }

    #[tokio::test]
    async fn test_info_lookup() {
        let runner = ScriptedRunner::new(|_| {
            CommandOutput::ok(
                r#"[{"Id":"0123456789abcdef","RestartCount":2,
                     "Config":{"Image":"creditcoin3:latest"},
                     "State":{"Status":"running","StartedAt":"2024-01-01T00:00:00Z"},
                     "HostConfig":{"NetworkMode":"bridge"}}]"#,
            )
        });
        let inspector = DockerInspector::new(Arc::new(runner));

        let info = inspector.info("3node0").await.unwrap();
        assert_eq!(info.container_id, "0123456789ab");
        assert_eq!(info.image, "creditcoin3:latest");
        assert_eq!(info.restart_count, 2);
        assert_eq!(info.network_mode, "bridge");
    }

    #[tokio::test]
    async fn test_is_running() {
        let runner = ScriptedRunner::new(|args| match args[3].as_str() {
            "up" => CommandOutput::ok("true\n"),
            "down" => CommandOutput::ok("false\n"),
            _ => CommandOutput::failed(1, "No such object"),
        });
        let inspector = DockerInspector::new(Arc::new(runner));

        assert!(inspector.is_running("up").await.unwrap());
        assert!(!inspector.is_running("down").await.unwrap());
        assert!(!inspector.is_running("gone").await.unwrap());
    }

    #[tokio::test]
    async fn test_volume_size() {
        let runner = ScriptedRunner::new(|args| match args[0].as_str() {
            "inspect" => CommandOutput::ok("/var/lib/docker/volumes/node1/_data\n"),
            _ => CommandOutput::ok("123456\t/root/data\n"),
        });
        let inspector = DockerInspector::new(Arc::new(runner));
        assert_eq!(inspector.volume_size("node1").await.unwrap(), 123_456);
    }

    #[tokio::test]
    async fn test_volume_size_without_mount() {
        let runner = ScriptedRunner::new(|_| CommandOutput::ok("\n"));
        let inspector = DockerInspector::new(Arc::new(runner));
        assert_eq!(inspector.volume_size("node1").await.unwrap(), 0);
        assert_eq!(inspector.volume_size("node1").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rpc_call_result_handling() {
        let runner = ScriptedRunner::new(|args| {
            let body = &args[7];
            if body.contains("system_health") {
                CommandOutput::ok(r#"{"jsonrpc":"2.0","id":1,"result":{"peers":3}}"#)
            } else {
                CommandOutput::ok(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601}}"#)
            }
        });
        let inspector = DockerInspector::new(Arc::new(runner));

        let health = inspector
            .rpc_call("node1", 33881, "system_health", json!([]))
            .await
            .unwrap();
        assert_eq!(health, Some(json!({"peers": 3})));

        let missing = inspector
            .rpc_call("node1", 33881, "unknown_method", json!([]))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_rpc_call_transport_error() {
        let runner = ScriptedRunner::new(|_| CommandOutput::failed(7, "connection refused"));
        let inspector = DockerInspector::new(Arc::new(runner));
        assert!(inspector
            .rpc_call("node1", 33881, "system_health", json!([]))
            .await
            .is_err());
    }
}
