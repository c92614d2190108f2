//! Agent library for validator fleet monitoring
//!
//! This crate provides the core functionality for:
//! - Container stats collection and chain node health polling
//! - Host resource sampling
//! - The periodic monitoring loop and rollup summaries
//! - The persistent relay channel with offline queueing
//! - Health checks and observability

pub mod collector;
pub mod command;
pub mod health;
pub mod host;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod supervisor;
pub mod sync;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger, TransmissionTotals};
