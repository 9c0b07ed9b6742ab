//! # Envelopes
//!
//! The two message shapes that travel over the broker.
//!
//! ```text
//! work  : { command, payload, correlationId, replyTo? }   -> worker queue
//! reply : { correlationId, success, data? | error? }      -> replyTo queue
//! ```
//!
//! Both are JSON with camelCase keys so non-Rust workers can share the queues.

use crate::correlation::CorrelationId;
use crate::errors::WireError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A request published to a worker queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkEnvelope {
    /// Command name; routing key for handler dispatch.
    pub command: String,
    /// Opaque structured payload.
    #[serde(default)]
    pub payload: Value,
    /// Correlation ID the reply must echo.
    pub correlation_id: CorrelationId,
    /// Queue to publish the reply to. Absent for fire-and-forget sends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl WorkEnvelope {
    /// Build a request that expects a reply on `reply_to`.
    pub fn request(
        command: impl Into<String>,
        payload: Value,
        correlation_id: CorrelationId,
        reply_to: impl Into<String>,
    ) -> Self {
        Self {
            command: command.into(),
            payload,
            correlation_id,
            reply_to: Some(reply_to.into()),
        }
    }

    /// Build a fire-and-forget notification.
    pub fn notification(command: impl Into<String>, payload: Value) -> Self {
        Self {
            command: command.into(),
            payload,
            correlation_id: CorrelationId::new(),
            reply_to: None,
        }
    }

    pub fn expects_reply(&self) -> bool {
        self.reply_to.is_some()
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Structured failure reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A reply published to the caller's reply queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyEnvelope {
    pub correlation_id: CorrelationId,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ReplyEnvelope {
    pub fn success(correlation_id: CorrelationId, data: Value) -> Self {
        Self {
            correlation_id,
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(correlation_id: CorrelationId, error: ErrorBody) -> Self {
        Self {
            correlation_id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Collapse the envelope into the outcome it describes.
    ///
    /// A success without `data` yields `null`. A failure must carry `error`.
    pub fn into_outcome(self) -> Result<Result<Value, ErrorBody>, WireError> {
        match (self.success, self.error) {
            (true, None) => Ok(Ok(self.data.unwrap_or(Value::Null))),
            (false, Some(error)) => Ok(Err(error)),
            (true, Some(_)) => Err(WireError::Inconsistent("success reply carries an error")),
            (false, None) => Err(WireError::Inconsistent("failure reply without error")),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, WireError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, WireError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
