//! Fleet agent wiring: configuration and the local HTTP API

pub mod api;
pub mod config;

pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
