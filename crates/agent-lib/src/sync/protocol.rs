//! Relay wire protocol
//!
//! Every frame is a JSON object discriminated by its `type` member. Frames
//! are decoded once at the boundary into [`ClientMessage`] (agent to relay)
//! or [`RelayMessage`] (relay to agent); unknown types decode to an
//! `Unknown` variant instead of failing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version string announced during registration
pub const CLIENT_VERSION: &str = "1.1.0";

/// Sequenced application envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "serverId", default)]
    pub server_id: String,
    /// Unix timestamp in milliseconds
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default)]
    pub data: Value,
}

/// Frames sent by the agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        #[serde(rename = "serverId", default)]
        server_id: Option<String>,
        #[serde(default)]
        version: String,
        #[serde(default)]
        timestamp: i64,
    },
    Stats(Envelope),
    Summary(Envelope),
    CommandResponse(Envelope),
    Heartbeat {
        #[serde(rename = "serverId", default)]
        server_id: String,
        #[serde(default)]
        timestamp: i64,
    },
    Ping {
        #[serde(default)]
        timestamp: i64,
    },
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
    #[serde(other)]
    Unknown,
}

/// Kinds of sequenced payloads the agent submits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    Stats,
    Summary,
    CommandResponse,
}

impl PayloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Stats => "stats",
            PayloadKind::Summary => "summary",
            PayloadKind::CommandResponse => "command_response",
        }
    }
}

impl ClientMessage {
    /// Wrap `data` into the envelope variant for `kind`
    pub fn envelope(kind: PayloadKind, server_id: &str, sequence: u64, data: Value) -> Self {
        let envelope = Envelope {
            server_id: server_id.to_string(),
            timestamp: now_millis(),
            sequence: Some(sequence),
            data,
        };
        match kind {
            PayloadKind::Stats => ClientMessage::Stats(envelope),
            PayloadKind::Summary => ClientMessage::Summary(envelope),
            PayloadKind::CommandResponse => ClientMessage::CommandResponse(envelope),
        }
    }

    pub fn register(server_id: &str) -> Self {
        ClientMessage::Register {
            server_id: Some(server_id.to_string()),
            version: CLIENT_VERSION.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn heartbeat(server_id: &str) -> Self {
        ClientMessage::Heartbeat {
            server_id: server_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn pong() -> Self {
        ClientMessage::Pong {
            timestamp: now_millis(),
        }
    }

    /// Sequence number of an enveloped frame
    pub fn sequence(&self) -> Option<u64> {
        match self {
            ClientMessage::Stats(e)
            | ClientMessage::Summary(e)
            | ClientMessage::CommandResponse(e) => e.sequence,
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::Stats(_) => "stats",
            ClientMessage::Summary(_) => "summary",
            ClientMessage::CommandResponse(_) => "command_response",
            ClientMessage::Heartbeat { .. } => "heartbeat",
            ClientMessage::Ping { .. } => "ping",
            ClientMessage::Pong { .. } => "pong",
            ClientMessage::Unknown => "unknown",
        }
    }
}

/// Remote command directive
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub params: Value,
}

/// Progress of a remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    InProgress,
    Completed,
    Failed,
}

/// Reply to a [`CommandRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub status: CommandStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    /// Unix timestamp in seconds
    pub timestamp: i64,
}

/// Frames sent by the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayMessage {
    RegisterAck {
        #[serde(default)]
        status: String,
        #[serde(rename = "serverId", default, skip_serializing_if = "Option::is_none")]
        server_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },
    StatsAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
        #[serde(default)]
        timestamp: i64,
    },
    SummaryAck {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        #[serde(default)]
        timestamp: i64,
    },
    HeartbeatAck {
        #[serde(default)]
        timestamp: i64,
    },
    Ping {
        #[serde(default)]
        timestamp: i64,
    },
    Pong {
        #[serde(default)]
        timestamp: i64,
    },
    Command {
        #[serde(default)]
        data: CommandRequest,
    },
    #[serde(other)]
    Unknown,
}

impl RelayMessage {
    /// Successful registration acknowledgment
    pub fn is_register_success(&self) -> bool {
        matches!(self, RelayMessage::RegisterAck { status, .. } if status == "success")
    }

    /// Sequence acknowledged by a `stats_ack` (`data.sequence` first, then `sequence`)
    pub fn acked_sequence(&self) -> Option<u64> {
        match self {
            RelayMessage::StatsAck { sequence, data, .. } => data
                .as_ref()
                .and_then(|d| d.get("sequence"))
                .and_then(Value::as_u64)
                .or(*sequence),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RelayMessage::RegisterAck { .. } => "register_ack",
            RelayMessage::StatsAck { .. } => "stats_ack",
            RelayMessage::SummaryAck { .. } => "summary_ack",
            RelayMessage::HeartbeatAck { .. } => "heartbeat_ack",
            RelayMessage::Ping { .. } => "ping",
            RelayMessage::Pong { .. } => "pong",
            RelayMessage::Command { .. } => "command",
            RelayMessage::Unknown => "unknown",
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
