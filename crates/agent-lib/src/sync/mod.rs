//! Relay synchronization
//!
//! This module provides:
//! - The JSON wire protocol spoken with the relay
//! - A bounded pending queue for messages submitted while disconnected
//! - [`TransportChannel`], the registered WebSocket link with keepalive,
//!   heartbeats, inbound command routing and automatic reconnection

mod channel;
mod error;
mod protocol;
mod queue;


pub use channel::{
    ChannelConfig, ChannelStatus, ConnectTarget, ConnectionState, TransportChannel,
    TransportChannelBuilder,
};
pub use error::{ChannelError, ChannelResult};
pub use protocol::{
    now_millis, ClientMessage, CommandRequest, CommandResponse, CommandStatus, Envelope,
    PayloadKind, RelayMessage, CLIENT_VERSION,
};
pub use queue::{PendingQueue, QueueStats, QueuedMessage, DEFAULT_QUEUE_CAPACITY};
