//! # Messages and Deliveries
//!
//! A [`Message`] is what gets published. A [`Delivery`] is one message handed
//! to one consumer, together with the handle used to settle it.
//!
//! Settlement (`ack`, `nack`, `reject`) consumes the delivery, so a delivery
//! can be settled at most once. A delivery dropped without settlement goes
//! back to its queue flagged as redelivered, which is how a worker crash
//! before ack turns into at-least-once delivery.

use crate::broker::BrokerError;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::time::Duration;

/// A message as published to a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Per-message TTL. The shorter of this and the queue TTL applies.
    pub expiration: Option<Duration>,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            content_type: None,
            expiration: None,
        }
    }

    /// Serialize `value` as a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            body: Bytes::from(serde_json::to_vec(value)?),
            content_type: Some("application/json".to_string()),
            expiration: None,
        })
    }

    #[must_use]
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = Some(expiration);
        self
    }

    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Processed; remove from the queue.
    Ack,
    /// Not processed; put it back for another attempt.
    Requeue,
    /// Not processable; drop it.
    Reject,
}

/// Backend hook that settles one delivery.
///
/// Implementations must treat an unsettled drop as a requeue.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn settle(self: Box<Self>, settlement: Settlement) -> Result<(), BrokerError>;
}

/// One message delivered to one consumer.
pub struct Delivery {
    pub message: Message,
    /// Broker-assigned tag, unique per broker.
    pub delivery_tag: u64,
    /// Set when the message was handed out before and never acked.
    pub redelivered: bool,
    /// Queue the message was consumed from.
    pub queue: String,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        message: Message,
        delivery_tag: u64,
        redelivered: bool,
        queue: impl Into<String>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            message,
            delivery_tag,
            redelivered,
            queue: queue.into(),
            acker,
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.message.body
    }

    /// Acknowledge: the message is done and will not be redelivered.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.settle(Settlement::Ack).await
    }

    /// Negative acknowledgement, optionally returning the message to the queue.
    pub async fn nack(self, requeue: bool) -> Result<(), BrokerError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        self.acker.settle(settlement).await
    }

    /// Drop the message without redelivery.
    pub async fn reject(self) -> Result<(), BrokerError> {
        self.acker.settle(Settlement::Reject).await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("queue", &self.queue)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.message.body.len())
            .finish()
    }
}
