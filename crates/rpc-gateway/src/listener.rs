//! Reply Listener - consumes the client's reply queue and routes replies to
//! the correlation registry.
//!
//! Replies are acked as soon as they are routed. A reply nobody is waiting
//! for (duplicate, late, unknown) is still acked; the registry drops it.
//!
//! If the consumer ends while the client is still running, the connection
//! was lost: every pending call fails with a transport error and the
//! listener re-declares its reply queue and resumes with backoff. Until it
//! is consuming again its readiness flag is down, so callers fail fast
//! instead of publishing requests whose replies have nowhere to go.

use crate::registry::{CorrelationRegistry, FulfillOutcome};
use shared_bus::{Backoff, Consumer, ConsumerOptions, Delivery, MessageBroker, QueueOptions};
use shared_types::ReplyEnvelope;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

/// Routes replies from one reply queue into a [`CorrelationRegistry`].
pub struct ReplyListener {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<CorrelationRegistry>,
    reply_queue: String,
    backoff: Backoff,
    /// Up while a consumer is attached to the reply queue.
    ready: Arc<AtomicBool>,
}

impl ReplyListener {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        registry: Arc<CorrelationRegistry>,
        reply_queue: impl Into<String>,
        reconnect_backoff: Duration,
        max_reconnect_backoff: Duration,
    ) -> Self {
        Self {
            broker,
            registry,
            reply_queue: reply_queue.into(),
            backoff: Backoff::new(reconnect_backoff, max_reconnect_backoff),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared flag that is `true` while replies can be received.
    pub fn readiness(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.ready)
    }

    /// Declare the reply queue and start consuming it.
    pub async fn subscribe(&self) -> Result<Consumer, shared_bus::BrokerError> {
        self.broker
            .declare_queue(&self.reply_queue, QueueOptions::reply_queue())
            .await?;
        let consumer = self
            .broker
            .consume(&self.reply_queue, ConsumerOptions::with_prefetch(0))
            .await?;
        self.ready.store(true, Ordering::Release);
        Ok(consumer)
    }

    /// Run the listener loop until `shutdown` flips to `true`.
    #[instrument(skip_all, fields(queue = %self.reply_queue))]
    pub async fn run(mut self, mut consumer: Consumer, mut shutdown: watch::Receiver<bool>) {
        info!("Reply listener started");

        loop {
            tokio::select! {
                delivery = consumer.recv() => match delivery {
                    Some(delivery) => self.handle_delivery(delivery).await,
                    None => {
                        self.ready.store(false, Ordering::Release);
                        if *shutdown.borrow() {
                            break;
                        }
                        self.registry.fail_all("reply consumer lost its broker connection");
                        match self.resubscribe(&mut shutdown).await {
                            Some(next) => consumer = next,
                            None => break,
                        }
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.ready.store(false, Ordering::Release);
        info!("Reply listener stopped");
    }

    /// Route one reply and ack it.
    pub async fn handle_delivery(&self, delivery: Delivery) {
        match ReplyEnvelope::from_slice(delivery.body()) {
            Ok(reply) => {
                let correlation_id = reply.correlation_id.clone();
                match reply.into_outcome() {
                    Ok(result) => {
                        if self.registry.fulfill(&correlation_id, result)
                            == FulfillOutcome::Discarded
                        {
                            debug!(
                                correlation_id = %correlation_id,
                                redelivered = delivery.redelivered,
                                "Reply matched no pending call"
                            );
                        }
                    }
                    Err(e) => warn!(
                        correlation_id = %correlation_id,
                        error = %e,
                        "Dropping inconsistent reply"
                    ),
                }
            }
            Err(e) => {
                warn!(
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Dropping malformed reply"
                );
            }
        }

        if let Err(e) = delivery.ack().await {
            debug!(error = %e, "Reply ack failed");
        }
    }

    async fn resubscribe(&mut self, shutdown: &mut watch::Receiver<bool>) -> Option<Consumer> {
        loop {
            let delay = self.backoff.next_delay();
            warn!(
                attempt = self.backoff.attempts(),
                delay_ms = delay.as_millis() as u64,
                "Reply consumer ended, resubscribing"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return None;
                    }
                }
            }

            match self.subscribe().await {
                Ok(consumer) => {
                    self.backoff.reset();
                    info!("Reply consumer restored");
                    return Some(consumer);
                }
                Err(e) => debug!(error = %e, "Resubscribe failed"),
            }
        }
    }
}
