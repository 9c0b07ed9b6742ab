//! # Consumer
//!
//! Receiving side of a queue subscription.

use crate::message::Delivery;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::pin::Pin;
use std::task::{Context, Poll};

/// A live subscription to one queue.
///
/// Yields deliveries until the consumer is finished (connection lost or
/// queue deleted), after which `recv` returns `None` forever. Dropping the
/// consumer cancels the subscription.
pub struct Consumer {
    queue: String,
    deliveries: BoxStream<'static, Delivery>,
    finished: bool,
}

impl Consumer {
    /// Wrap a backend delivery stream.
    pub fn new(queue: impl Into<String>, deliveries: BoxStream<'static, Delivery>) -> Self {
        Self {
            queue: queue.into(),
            deliveries,
            finished: false,
        }
    }

    /// Receive the next delivery.
    ///
    /// # Returns
    ///
    /// - `Some(delivery)` - The next message, already counted against prefetch
    /// - `None` - The consumer is finished
    pub async fn recv(&mut self) -> Option<Delivery> {
        if self.finished {
            return None;
        }
        let next = self.deliveries.next().await;
        if next.is_none() {
            self.finished = true;
        }
        next
    }

    /// Queue this consumer reads from.
    #[must_use]
    pub fn queue(&self) -> &str {
        &self.queue
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Stream for Consumer {
    type Item = Delivery;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }
        let polled = self.deliveries.poll_next_unpin(cx);
        if let Poll::Ready(None) = polled {
            self.finished = true;
        }
        polled
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.queue)
            .field("finished", &self.finished)
            .finish()
    }
}
