//! # Shared Bus - Broker Transport
//!
//! Queue-based broker abstraction the RPC client and the workers share.
//!
//! ## Delivery Contract
//!
//! ```text
//!  publish()          ┌──────────────┐        consume()
//! ──────────────────► │  queue (FIFO) │ ──────────────────► Delivery
//!                     └──────────────┘                        │
//!                            ▲                                │ ack / nack / reject
//!                            └──── requeue (redelivered) ◄────┘ (or drop = requeue)
//! ```
//!
//! - **Manual acknowledgement:** every delivery is settled exactly once;
//!   settlement consumes the [`Delivery`].
//! - **At-least-once:** an unsettled delivery returns to its queue flagged
//!   `redelivered`.
//! - **Backpressure:** per-consumer prefetch bounds unsettled deliveries.
//! - **Mandatory publish:** publishing to an undeclared queue is an error.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod backoff;
pub mod broker;
pub mod consumer;
pub mod memory;
pub mod message;

use std::time::Duration;
use tokio::time::Instant;

// Re-export main types
pub use backoff::Backoff;
pub use broker::{BrokerError, ConnectionState, ConsumerOptions, MessageBroker, QueueOptions};
pub use consumer::Consumer;
pub use memory::{InMemoryBroker, QueueStats};
pub use message::{Acknowledger, Delivery, Message, Settlement};

/// Default unsettled deliveries per consumer.
pub const DEFAULT_PREFETCH: usize = 16;

/// Default per-queue message TTL.
pub const DEFAULT_MESSAGE_TTL: Duration = Duration::from_secs(10);

/// Furthest deadline handed out; about thirty years.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + ttl`, saturating at [`FAR_FUTURE`] instead of overflowing.
pub fn deadline_after(start: Instant, ttl: Duration) -> Instant {
    start
        .checked_add(ttl.min(FAR_FUTURE))
        .unwrap_or_else(|| start + FAR_FUTURE)
}
