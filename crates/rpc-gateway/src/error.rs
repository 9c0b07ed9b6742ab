//! Errors returned to callers of [`crate::RpcClient`].
//!
//! Every failure a caller can see is one of four kinds. Duplicate or stale
//! replies are never surfaced; the registry drops them.

use shared_bus::BrokerError;
use shared_types::{codes, ErrorBody, WireError};
use std::time::Duration;
use thiserror::Error;

/// Which side of the codec failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecStage {
    /// Request payload or envelope could not be encoded.
    Encode,
    /// Reply data could not be decoded into the caller's type.
    Decode,
}

/// RPC call failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcError {
    /// Publish failed or the broker connection was lost while waiting.
    #[error("transport error: {0}")]
    Transport(String),

    /// No reply arrived before the deadline.
    #[error("no reply within {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    /// The worker replied with a failure.
    #[error("remote error {code}: {message}")]
    Remote { code: i32, message: String },

    /// Payload could not be encoded, or reply data could not be decoded.
    #[error("codec error ({stage:?}): {message}")]
    Codec { stage: CodecStage, message: String },
}

impl RpcError {
    pub fn encode(err: impl std::fmt::Display) -> Self {
        Self::Codec {
            stage: CodecStage::Encode,
            message: err.to_string(),
        }
    }

    pub fn decode(err: impl std::fmt::Display) -> Self {
        Self::Codec {
            stage: CodecStage::Decode,
            message: err.to_string(),
        }
    }

    /// HTTP status an outer HTTP layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Timeout { .. } => codes::GATEWAY_TIMEOUT as u16,
            Self::Transport(_) => codes::BAD_GATEWAY as u16,
            Self::Remote { code, .. } if (400..=599).contains(code) => *code as u16,
            Self::Remote { .. } => codes::BAD_GATEWAY as u16,
            Self::Codec {
                stage: CodecStage::Encode,
                ..
            } => codes::BAD_REQUEST as u16,
            Self::Codec {
                stage: CodecStage::Decode,
                ..
            } => codes::BAD_GATEWAY as u16,
        }
    }

    /// Short label used for the `outcome` metric dimension.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport_error",
            Self::Timeout { .. } => "timeout",
            Self::Remote { .. } => "remote_error",
            Self::Codec { .. } => "codec_error",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl From<BrokerError> for RpcError {
    fn from(err: BrokerError) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<ErrorBody> for RpcError {
    fn from(body: ErrorBody) -> Self {
        Self::Remote {
            code: body.code,
            message: body.message,
        }
    }
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        Self::encode(err)
    }
}
