//! Remote command handling
//!
//! The relay can ask an agent to act on its containers. The transport only
//! routes [`CommandRequest`]s here and sends back whatever
//! [`CommandResponse`] comes out; the semantics live in this module.

use crate::collector::CommandRunner;
use crate::sync::{CommandRequest, CommandResponse, CommandStatus};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Default number of log lines returned by `logs`
pub const DEFAULT_LOG_LINES: u64 = 50;

/// Executes relay commands
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, request: CommandRequest) -> CommandResponse;
}

/// Handler that refuses every command
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectingHandler;

#[async_trait]
impl CommandHandler for RejectingHandler {
    async fn handle(&self, request: CommandRequest) -> CommandResponse {
        failed(
            command_id(&request),
            format!("command {} is not accepted by this agent", request.command),
        )
    }
}

/// Container lifecycle commands through the `docker` CLI
#[derive(Clone)]
pub struct DockerCommandHandler {
    runner: Arc<dyn CommandRunner>,
}

impl DockerCommandHandler {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let output = self.runner.run(args).await?;
        if !output.success {
            let stderr = output.stderr.trim();
            if stderr.is_empty() {
                bail!("docker {} exited with code {:?}", args.join(" "), output.code);
            }
            bail!("{}", stderr);
        }
        Ok(output.stdout.trim_end().to_string())
    }

    /// Node containers (any state), excluding the agent itself
    async fn node_containers(&self) -> Result<Vec<String>> {
        let names = self
            .docker(&[
                "ps",
                "-a",
                "--filter",
                "name=node",
                "--filter",
                "name=3node",
                "--format",
                "{{.Names}}",
            ])
            .await?;
        Ok(names
            .lines()
            .map(str::trim)
            .filter(|n| n.contains("node") && !n.contains("mclient"))
            .map(str::to_string)
            .collect())
    }

    async fn lifecycle(&self, action: &str, target: &str) -> Result<String> {
        if target != "all" {
            self.docker(&[action, require_target(target)?]).await?;
            return Ok(format!("{}: {}", target, action));
        }

        let names = self.node_containers().await?;
        if names.is_empty() {
            bail!("no node containers found");
        }

        let mut lines = Vec::with_capacity(names.len());
        let mut failures = 0;
        for name in &names {
            match self.docker(&[action, name.as_str()]).await {
                Ok(_) => lines.push(format!("{}: {}", name, action)),
                Err(e) => {
                    failures += 1;
                    lines.push(format!("{}: failed ({})", name, e));
                }
            }
        }

        if failures == names.len() {
            bail!("{}", lines.join("\n"));
        }
        Ok(lines.join("\n"))
    }

    async fn logs(&self, target: &str, params: &Value) -> Result<String> {
        let target = require_target(target)?;
        if params["follow"].as_bool().unwrap_or(false) {
            bail!("follow mode is not supported over the relay channel");
        }

        let lines = params["lines"].as_u64().unwrap_or(DEFAULT_LOG_LINES).to_string();
        let output = self
            .runner
            .run(&["logs", "--tail", &lines, target])
            .await?;
        if !output.success {
            bail!("{}", output.stderr.trim());
        }
        // Container stderr arrives on our stderr
        Ok(format!("{}{}", output.stdout, output.stderr).trim_end().to_string())
    }

    async fn status(&self, target: &str) -> Result<String> {
        let format = "table {{.Names}}\t{{.Status}}";
        if target.is_empty() || target == "all" {
            return self.docker(&["ps", "--format", format]).await;
        }
        let filter = format!("name={}", target);
        self.docker(&["ps", "--filter", &filter, "--format", format])
            .await
    }

    async fn exec(&self, target: &str, params: &Value) -> Result<String> {
        let target = require_target(target)?;
        let command = params["command"]
            .as_str()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| anyhow!("exec requires params.command"))?;

        let mut args = vec!["exec", target];
        args.extend(command.split_whitespace());
        self.docker(&args).await
    }
}

#[async_trait]
impl CommandHandler for DockerCommandHandler {
    async fn handle(&self, request: CommandRequest) -> CommandResponse {
        let id = command_id(&request);
        info!(
            command_id = %id,
            command = %request.command,
            target = %request.target,
            "Received relay command"
        );

        let target = request.target.as_str();
        let outcome = match request.command.as_str() {
            "start" | "stop" => self.lifecycle(&request.command, target).await,
            "restart" => self.lifecycle("restart", target).await,
            "logs" => self.logs(target, &request.params).await,
            "status" => self.status(target).await,
            "exec" => self.exec(target, &request.params).await,
            other => Err(anyhow!("unsupported command: {}", other)),
        };

        match outcome {
            Ok(result) => CommandResponse {
                command_id: id,
                status: CommandStatus::Completed,
                result: Some(result),
                error: None,
                timestamp: chrono::Utc::now().timestamp(),
            },
            Err(e) => {
                warn!(command_id = %id, command = %request.command, error = %e, "Relay command failed");
                failed(id, e.to_string())
            }
        }
    }
}

fn require_target(target: &str) -> Result<&str> {
    let target = target.trim();
    if target.is_empty() {
        bail!("target is required");
    }
    Ok(target)
}

fn command_id(request: &CommandRequest) -> String {
    request
        .id
        .clone()
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn failed(command_id: String, error: String) -> CommandResponse {
    CommandResponse {
        command_id,
        status: CommandStatus::Failed,
        result: None,
        error: Some(error),
        timestamp: chrono::Utc::now().timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::testing::ScriptedRunner;
    use crate::collector::CommandOutput;
    use serde_json::json;

    fn request(command: &str, target: &str, params: Value) -> CommandRequest {
        CommandRequest {
            id: Some("cmd-1".to_string()),
            command: command.to_string(),
            target: target.to_string(),
            params,
        }
    }

    #[tokio::test]
    async fn test_restart_single_target() {
        let runner = ScriptedRunner::new(|_| CommandOutput::ok("node1\n"));
        let calls = runner.calls();
        let handler = DockerCommandHandler::new(Arc::new(runner));

        let response = handler.handle(request("restart", "node1", Value::Null)).await;

        assert_eq!(response.command_id, "cmd-1");
        assert_eq!(response.status, CommandStatus::Completed);
        assert_eq!(calls.lock().unwrap()[0], vec!["restart", "node1"]);
    }

    #[tokio::test]
    async fn test_stop_all_skips_own_container() {
        let runner = ScriptedRunner::new(|args| match args[0].as_str() {
            "ps" => CommandOutput::ok("node0\n3node1\nmclient-node\n"),
            _ => CommandOutput::ok(""),
        });
        let calls = runner.calls();
        let handler = DockerCommandHandler::new(Arc::new(runner));

        let response = handler.handle(request("stop", "all", Value::Null)).await;
        assert_eq!(response.status, CommandStatus::Completed);

        let stopped: Vec<String> = calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c[0] == "stop")
            .map(|c| c[1].clone())
            .collect();
        assert_eq!(stopped, vec!["node0", "3node1"]);
    }

    #[tokio::test]
    async fn test_logs_uses_tail_parameter() {
        let runner = ScriptedRunner::new(|_| CommandOutput {
            success: true,
            code: Some(0),
            stdout: "line1\n".to_string(),
            stderr: "warn1\n".to_string(),
        });
        let calls = runner.calls();
        let handler = DockerCommandHandler::new(Arc::new(runner));

        let response = handler
            .handle(request("logs", "node1", json!({"lines": 10})))
            .await;
        assert_eq!(response.result.as_deref(), Some("line1\nwarn1"));
        assert_eq!(calls.lock().unwrap()[0], vec!["logs", "--tail", "10", "node1"]);
    }

    #[tokio::test]
    async fn test_logs_follow_is_rejected() {
        let handler = DockerCommandHandler::new(Arc::new(ScriptedRunner::new(|_| {
            CommandOutput::ok("")
        })));
        let response = handler
            .handle(request("logs", "node1", json!({"follow": true})))
            .await;
        assert_eq!(response.status, CommandStatus::Failed);
    }

    #[tokio::test]
    async fn test_status_filters_by_target() {
        let runner = ScriptedRunner::new(|_| CommandOutput::ok("NAMES\tSTATUS\nnode1\tUp 2 hours\n"));
        let calls = runner.calls();
        let handler = DockerCommandHandler::new(Arc::new(runner));

        handler.handle(request("status", "node1", Value::Null)).await;
        handler.handle(request("status", "all", Value::Null)).await;

        let calls = calls.lock().unwrap();
        assert!(calls[0].contains(&"name=node1".to_string()));
        assert!(!calls[1].iter().any(|a| a.starts_with("name=")));
    }

    #[tokio::test]
    async fn test_exec_requires_command_param() {
        let handler = DockerCommandHandler::new(Arc::new(ScriptedRunner::new(|_| {
            CommandOutput::ok("")
        })));
        let response = handler.handle(request("exec", "node1", json!({}))).await;
        assert_eq!(response.status, CommandStatus::Failed);
        assert_eq!(response.error.as_deref(), Some("exec requires params.command"));
    }

    #[tokio::test]
    async fn test_exec_splits_command() {
        let runner = ScriptedRunner::new(|_| CommandOutput::ok("ok"));
        let calls = runner.calls();
        let handler = DockerCommandHandler::new(Arc::new(runner));

        handler
            .handle(request("exec", "node1", json!({"command": "ls  -la /root"})))
            .await;
        assert_eq!(calls.lock().unwrap()[0], vec!["exec", "node1", "ls", "-la", "/root"]);
    }

    #[tokio::test]
    async fn test_non_zero_exit_fails() {
        let handler = DockerCommandHandler::new(Arc::new(ScriptedRunner::new(|_| {
            CommandOutput::failed(1, "No such container: node9")
        })));
        let response = handler.handle(request("start", "node9", Value::Null)).await;
        assert_eq!(response.status, CommandStatus::Failed);
        assert_eq!(response.error.as_deref(), Some("No such container: node9"));
    }

    #[tokio::test]
    async fn test_unsupported_command_and_generated_id() {
        let handler = RejectingHandler;
        let response = handler
            .handle(CommandRequest {
                command: "payout".to_string(),
                ..Default::default()
            })
            .await;
        assert_eq!(response.status, CommandStatus::Failed);
        assert_eq!(response.command_id.len(), 36);

        let docker = DockerCommandHandler::new(Arc::new(ScriptedRunner::new(|_| {
            CommandOutput::ok("")
        })));
        let response = docker.handle(request("rotate_keys", "node1", Value::Null)).await;
        assert_eq!(response.error.as_deref(), Some("unsupported command: rotate_keys"));
    }
}
