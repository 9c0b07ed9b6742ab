//! # Error Types
//!
//! Failure codes carried in reply envelopes and the codec error shared by
//! both ends of the broker.

use thiserror::Error;

/// Status codes placed in `error.code` of a failure reply.
///
/// HTTP-shaped so the gateway's HTTP layer can pass them through verbatim.
pub mod codes {
    /// Payload rejected by the handler.
    pub const BAD_REQUEST: i32 = 400;
    /// Caller is not allowed to run the command.
    pub const FORBIDDEN: i32 = 403;
    /// Record addressed by the payload does not exist.
    pub const NOT_FOUND: i32 = 404;
    /// Record already exists / version conflict.
    pub const CONFLICT: i32 = 409;
    /// Handler raised or panicked.
    pub const INTERNAL_ERROR: i32 = 500;
    /// No handler registered for the command name.
    pub const UNKNOWN_COMMAND: i32 = 501;
    /// Broker or downstream dependency failed.
    pub const BAD_GATEWAY: i32 = 502;
    /// No reply before the deadline.
    pub const GATEWAY_TIMEOUT: i32 = 504;
}

/// Errors encoding or decoding envelopes.
#[derive(Debug, Error)]
pub enum WireError {
    /// Body is not a valid envelope.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Reply claims failure but carries no error object, or the reverse.
    #[error("inconsistent reply envelope: {0}")]
    Inconsistent(&'static str),

    #[error("correlation id must be a non-empty string")]
    EmptyCorrelationId,
}
