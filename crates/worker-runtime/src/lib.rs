//! # Worker Runtime
//!
//! Hosts the command handlers of one worker behind one named queue.
//!
//! ## Usage
//!
//! ```ignore
//! use worker_runtime::{CommandRegistry, HandlerError, WorkerConfig, WorkerDispatcher};
//!
//! let commands = CommandRegistry::builder("identity")
//!     .command_fn("identity.get", |payload, _ctx| async move {
//!         lookup(payload).await.ok_or_else(|| HandlerError::not_found("user"))
//!     })
//!     .build()?;
//!
//! let worker = WorkerDispatcher::new(broker, commands, WorkerConfig::from_env("IDENTITY")?);
//! tokio::spawn(worker.run(shutdown_rx));
//! ```
//!
//! ## Guarantees
//!
//! - Every decodable delivery is acked exactly once, whatever its handler did
//! - Handler panics are contained and answered with `500`
//! - Unknown commands are answered with `501`
//! - At most `concurrency` handlers run at once

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod handler;
pub mod registry;

pub use config::{ConfigError, WorkerConfig, DEFAULT_CONCURRENCY};
pub use dedup::DedupWindow;
pub use dispatcher::{DispatchOutcome, ItemReport, WorkState, WorkerDispatcher};
pub use handler::{
    handler_fn, typed_handler, CommandContext, CommandHandler, FnHandler, HandlerError,
    HealthHandler, TypedHandler,
};
pub use registry::{CommandRegistry, CommandRegistryBuilder, RegistryError};
