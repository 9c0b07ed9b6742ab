//! Correlation ID for request/reply matching.
//!
//! On the wire the id is an opaque, non-empty string. Ids minted here are
//! random UUID v4 tokens so independent client processes never collide in
//! practice, but workers echo whatever token the producer chose.

use crate::errors::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Opaque token linking a request to its eventual reply.
///
/// Travels as a plain JSON string in the `correlationId` field of both
/// envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Generate a fresh correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Accept a token from another producer.
    pub fn parse(s: &str) -> Result<Self, WireError> {
        Self::try_from(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for CorrelationId {
    type Error = WireError;

    fn try_from(token: String) -> Result<Self, Self::Error> {
        if token.is_empty() {
            return Err(WireError::EmptyCorrelationId);
        }
        Ok(Self(token))
    }
}

impl FromStr for CorrelationId {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<CorrelationId> for String {
    fn from(id: CorrelationId) -> Self {
        id.0
    }
}
