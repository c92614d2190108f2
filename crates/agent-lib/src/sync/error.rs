//! Transport channel errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("connection to {url} failed: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("connection to {url} timed out")]
    ConnectTimeout { url: String },

    #[error("registration timed out")]
    RegistrationTimeout,

    #[error("registration rejected: {0}")]
    RegistrationRejected(String),

    #[error("connection closed by relay")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no relay reachable after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("channel is shutting down")]
    ShuttingDown,
}

pub type ChannelResult<T> = Result<T, ChannelError>;
