//! # Broker Port
//!
//! The transport contract the RPC layer is written against. Any durable
//! queue broker with manual acknowledgement (AMQP 0-9-1 being the model)
//! can sit behind [`MessageBroker`]; [`crate::InMemoryBroker`] is the
//! reference implementation.

use crate::consumer::Consumer;
use crate::message::Message;
use crate::DEFAULT_MESSAGE_TTL;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by broker operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// The connection is down; nothing can be published or consumed.
    #[error("broker connection closed")]
    ConnectionClosed,

    /// Publish or consume against a queue that was never declared.
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    /// Redeclaration with options that differ from the existing queue.
    #[error("queue {name} already declared with different options")]
    QueueMismatch { name: String },

    /// Settlement of a delivery the broker no longer tracks
    /// (connection was lost after the delivery was handed out).
    #[error("delivery {delivery_tag} on {queue} is no longer outstanding")]
    UnknownDelivery { queue: String, delivery_tag: u64 },

    /// Backend specific failure.
    #[error("broker error: {0}")]
    Other(String),
}

/// Per-queue declaration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Survives a broker restart (connection loss in the in-memory broker).
    pub durable: bool,
    /// Deleted when its last consumer goes away.
    pub auto_delete: bool,
    /// Messages older than this are discarded instead of delivered.
    #[serde(with = "optional_millis")]
    pub message_ttl: Option<Duration>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            auto_delete: false,
            message_ttl: Some(DEFAULT_MESSAGE_TTL),
        }
    }
}

impl QueueOptions {
    /// Options for a worker queue with the given TTL.
    pub fn work_queue(message_ttl: Duration) -> Self {
        Self {
            message_ttl: Some(message_ttl),
            ..Self::default()
        }
    }

    /// Options for a client reply queue: transient, removed with its consumer.
    pub fn reply_queue() -> Self {
        Self {
            durable: false,
            auto_delete: true,
            message_ttl: None,
        }
    }
}

/// Per-consumer options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    /// Maximum unsettled deliveries handed to this consumer. `0` = unlimited.
    pub prefetch: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            prefetch: crate::DEFAULT_PREFETCH,
        }
    }
}

impl ConsumerOptions {
    pub fn with_prefetch(prefetch: usize) -> Self {
        Self { prefetch }
    }
}

/// Connection lifecycle as observed through [`crate::InMemoryBroker::connection_state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

/// Publish/consume contract over named queues.
///
/// Publishing is mandatory-routed: a publish to an undeclared queue fails
/// with [`BrokerError::QueueNotFound`] instead of silently dropping.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a queue. Idempotent for identical options.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    /// Delete a queue and every message in it. Active consumers end.
    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError>;

    /// Publish one message to a queue.
    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError>;

    /// Start consuming a queue with manual acknowledgement.
    async fn consume(&self, queue: &str, options: ConsumerOptions)
        -> Result<Consumer, BrokerError>;

    /// Whether the connection is currently usable.
    fn is_connected(&self) -> bool;

    /// Close the connection. Every consumer ends; unsettled deliveries of
    /// durable queues return to their queue marked as redelivered.
    async fn close(&self);
}

mod optional_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
