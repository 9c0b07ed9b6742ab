//! # Shared Types Crate
//!
//! The wire contract shared by the RPC client and every worker.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: both envelopes and the correlation id are
//!   defined here and nowhere else.
//! - **Language-neutral wire format**: JSON with camelCase keys, so workers
//!   written in other languages can consume the same queues.
//! - **Correlation**: every request carries a `correlationId`; every reply
//!   echoes it.

pub mod correlation;
pub mod duration_str;
pub mod envelope;
pub mod errors;

pub use correlation::CorrelationId;
pub use envelope::{ErrorBody, ReplyEnvelope, WorkEnvelope};
pub use errors::{codes, WireError};

/// MIME type of every envelope body.
pub const CONTENT_TYPE_JSON: &str = "application/json";
