//! # Node Runtime Library
//!
//! Wiring behind the `courier-node` binary, exposed for testing.
//!
//! A node hosts one worker per configured queue next to an RPC client on a
//! shared broker, and probes each worker's health command on an interval.

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod probe;
pub mod runtime;

pub use config::NodeConfig;
pub use probe::{health_command, probe_once, run_health_probe, ProbeResult};
pub use runtime::NodeRuntime;

use thiserror::Error;

/// Node startup and configuration errors
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    WorkerConfig(#[from] worker_runtime::ConfigError),

    #[error(transparent)]
    RpcConfig(#[from] rpc_gateway::ConfigError),

    #[error(transparent)]
    Registry(#[from] worker_runtime::RegistryError),

    #[error("RPC client failed to start: {0}")]
    Client(#[from] rpc_gateway::RpcError),

    #[error("node already started")]
    AlreadyStarted,
}
