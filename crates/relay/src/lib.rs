//! Relay server for fleet agents
//!
//! Terminates agent WebSocket connections, acknowledges their stats,
//! summaries and heartbeats, and forwards operator commands.

pub mod server;
pub mod tls;

pub use server::{ClientSummary, RelayConfig, RelayServer, RelayStats};
pub use tls::{load_acceptor, TlsError};
