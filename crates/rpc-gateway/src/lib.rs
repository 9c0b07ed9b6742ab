//! # RPC Gateway
//!
//! Request/reply over a message broker, for a gateway that fronts a set of
//! independent workers.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          RPC GATEWAY                              │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  RpcClient::call(queue, command, payload, timeout)               │
//! │        │                                   ▲                     │
//! │        │ register                          │ Result<Value, RpcError>
//! │        ▼                                   │                     │
//! │  ┌──────────────────────────────────────────────┐                │
//! │  │           Correlation Registry                │ ◄── sweeper   │
//! │  │   (one oneshot slot per correlation ID)       │                │
//! │  └──────────────────────────────────────────────┘                │
//! │        │ publish                           ▲ fulfill             │
//! └────────┼───────────────────────────────────┼─────────────────────┘
//!          ▼                                   │
//!    worker queue ──► worker ──► reply queue ──► ReplyListener
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use rpc_gateway::{RpcClient, RpcClientConfig};
//!
//! let client = RpcClient::start(broker, RpcClientConfig::from_env()?, shutdown_rx).await?;
//! let user = client.call("IDENTITY", "identity.get", json!({"id": 7}), None).await?;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod listener;
pub mod registry;

pub use client::RpcClient;
pub use config::{ConfigError, RpcClientConfig, DEFAULT_RPC_TIMEOUT};
pub use error::{CodecStage, RpcError};
pub use listener::ReplyListener;
pub use registry::{
    run_sweeper, CallOutcome, CorrelationRegistry, FulfillOutcome, PendingCall, RegistryStats,
    RemoteFailure,
};
