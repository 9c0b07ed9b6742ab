//! # In-Memory Broker
//!
//! Reference [`MessageBroker`] for single-process deployments and tests.
//!
//! Behaves like an AMQP broker reached over one connection:
//!
//! - FIFO queues with per-queue and per-message TTL, applied at dequeue
//! - manual acknowledgement; `nack(requeue)` puts the message back at the head
//! - per-consumer prefetch: at most `prefetch` unsettled deliveries
//! - auto-delete queues vanish with their last consumer
//! - [`InMemoryBroker::disconnect`] models connection loss: consumers end,
//!   non-durable queues are lost, unsettled messages of durable queues are
//!   requeued as redelivered; [`InMemoryBroker::reconnect`] reopens it.

use crate::broker::{BrokerError, ConnectionState, ConsumerOptions, MessageBroker, QueueOptions};
use crate::consumer::Consumer;
use crate::message::{Acknowledger, Delivery, Message, Settlement};
use async_trait::async_trait;
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Point-in-time view of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Messages waiting to be delivered.
    pub ready: usize,
    /// Messages delivered and not yet settled.
    pub unacked: usize,
    /// Active consumers.
    pub consumers: usize,
    pub published: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub rejected: u64,
    /// Messages discarded because their TTL ran out before delivery.
    pub expired: u64,
}

struct StoredMessage {
    message: Message,
    expires_at: Option<Instant>,
    redelivered: bool,
}

impl StoredMessage {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct QueueState {
    options: QueueOptions,
    generation: u64,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
    consumers: usize,
    counters: QueueStats,
}

impl QueueState {
    fn new(options: QueueOptions, generation: u64) -> Self {
        Self {
            options,
            generation,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: 0,
            counters: QueueStats::default(),
        }
    }

    /// Put every unsettled message back at the head, preserving order.
    fn requeue_unacked(&mut self) {
        let mut tags: Vec<u64> = self.unacked.keys().copied().collect();
        tags.sort_unstable();
        for tag in tags.into_iter().rev() {
            if let Some(mut stored) = self.unacked.remove(&tag) {
                stored.redelivered = true;
                self.ready.push_front(stored);
                self.counters.requeued += 1;
            }
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            ready: self.ready.len(),
            unacked: self.unacked.len(),
            consumers: self.consumers,
            ..self.counters
        }
    }
}

struct BrokerState {
    connected: bool,
    /// Bumped on every disconnect; consumers and deliveries from an older
    /// epoch are dead.
    epoch: u64,
    next_generation: u64,
    queues: HashMap<String, QueueState>,
}

struct Shared {
    state: Mutex<BrokerState>,
    /// Woken on every state change that a waiting consumer could care about.
    notify: Notify,
    next_tag: AtomicU64,
    connection: watch::Sender<ConnectionState>,
}

/// In-process broker shared by a gateway and its workers.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (connection, _) = watch::channel(ConnectionState::Connected);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState {
                    connected: true,
                    epoch: 0,
                    next_generation: 0,
                    queues: HashMap::new(),
                }),
                notify: Notify::new(),
                next_tag: AtomicU64::new(1),
                connection,
            }),
        }
    }

    /// Snapshot of a queue's counters, `None` if the queue does not exist.
    #[must_use]
    pub fn queue_stats(&self, name: &str) -> Option<QueueStats> {
        self.shared.state.lock().queues.get(name).map(QueueState::stats)
    }

    /// Names of all declared queues.
    #[must_use]
    pub fn queue_names(&self) -> Vec<String> {
        self.shared.state.lock().queues.keys().cloned().collect()
    }

    /// Watch connection state transitions.
    #[must_use]
    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.connection.subscribe()
    }

    /// Drop the connection.
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            state.epoch += 1;
            state.queues.retain(|_, queue| queue.options.durable);
            for queue in state.queues.values_mut() {
                queue.requeue_unacked();
                queue.consumers = 0;
            }
        }
        warn!("In-memory broker connection closed");
        self.shared.connection.send_replace(ConnectionState::Disconnected);
        self.shared.notify.notify_waiters();
    }

    /// Reopen the connection after [`disconnect`](Self::disconnect).
    ///
    /// Durable queues and their ready messages survive; consumers must be
    /// re-created.
    pub fn reconnect(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.connected {
                return;
            }
            state.connected = true;
        }
        debug!("In-memory broker connection re-established");
        self.shared.connection.send_replace(ConnectionState::Connected);
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        let mut state = self.shared.state.lock();
        if !state.connected {
            return Err(BrokerError::ConnectionClosed);
        }
        if let Some(existing) = state.queues.get(name) {
            if existing.options != options {
                return Err(BrokerError::QueueMismatch {
                    name: name.to_string(),
                });
            }
            return Ok(());
        }

        let generation = state.next_generation;
        state.next_generation += 1;
        state
            .queues
            .insert(name.to_string(), QueueState::new(options, generation));
        debug!(queue = name, durable = options.durable, "Queue declared");
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        let removed = {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return Err(BrokerError::ConnectionClosed);
            }
            state.queues.remove(name)
        };
        if let Some(queue) = removed {
            debug!(
                queue = name,
                dropped = queue.ready.len() + queue.unacked.len(),
                "Queue deleted"
            );
            self.shared.notify.notify_waiters();
        }
        Ok(())
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return Err(BrokerError::ConnectionClosed);
            }
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

            let ttl = match (message.expiration, target.options.message_ttl) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            let expires_at = ttl.map(|ttl| crate::deadline_after(Instant::now(), ttl));

            target.ready.push_back(StoredMessage {
                message,
                expires_at,
                redelivered: false,
            });
            target.counters.published += 1;
            trace!(queue = queue, ready = target.ready.len(), "Message published");
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumerOptions,
    ) -> Result<Consumer, BrokerError> {
        let (epoch, generation) = {
            let mut state = self.shared.state.lock();
            if !state.connected {
                return Err(BrokerError::ConnectionClosed);
            }
            let epoch = state.epoch;
            let target = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
            target.consumers += 1;
            (epoch, target.generation)
        };

        debug!(queue = queue, prefetch = options.prefetch, "Consumer started");

        let consumer = ConsumerState {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            epoch,
            generation,
            prefetch: (options.prefetch > 0).then(|| Arc::new(Semaphore::new(options.prefetch))),
        };

        let deliveries = futures::stream::unfold(consumer, |mut consumer| async move {
            let delivery = consumer.next_delivery().await?;
            Some((delivery, consumer))
        })
        .boxed();

        Ok(Consumer::new(queue, deliveries))
    }

    fn is_connected(&self) -> bool {
        self.shared.state.lock().connected
    }

    async fn close(&self) {
        self.disconnect();
    }
}

struct ConsumerState {
    shared: Arc<Shared>,
    queue: String,
    epoch: u64,
    generation: u64,
    prefetch: Option<Arc<Semaphore>>,
}

impl ConsumerState {
    fn is_live(&self, state: &BrokerState) -> bool {
        state.connected
            && state.epoch == self.epoch
            && state
                .queues
                .get(&self.queue)
                .is_some_and(|q| q.generation == self.generation)
    }

    async fn wait_until_dead(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let live = self.is_live(&self.shared.state.lock());
            if !live {
                return;
            }
            notified.await;
        }
    }

    async fn next_delivery(&mut self) -> Option<Delivery> {
        let mut permit: Option<OwnedSemaphorePermit> = match self.prefetch.clone() {
            Some(semaphore) => tokio::select! {
                acquired = semaphore.acquire_owned() => Some(acquired.ok()?),
                _ = self.wait_until_dead() => return None,
            },
            None => None,
        };

        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if !self.is_live(&state) {
                    return None;
                }
                let queue = state.queues.get_mut(&self.queue)?;
                let now = Instant::now();

                while let Some(stored) = queue.ready.pop_front() {
                    if stored.is_expired(now) {
                        queue.counters.expired += 1;
                        trace!(queue = %self.queue, "Message expired before delivery");
                        continue;
                    }

                    let tag = self.shared.next_tag.fetch_add(1, Ordering::Relaxed);
                    let acker = MemoryAcker {
                        shared: Arc::clone(&self.shared),
                        queue: self.queue.clone(),
                        tag,
                        epoch: self.epoch,
                        generation: self.generation,
                        permit: permit.take(),
                        settled: false,
                    };
                    let delivery = Delivery::new(
                        stored.message.clone(),
                        tag,
                        stored.redelivered,
                        self.queue.clone(),
                        Box::new(acker),
                    );
                    queue.unacked.insert(tag, stored);
                    queue.counters.delivered += 1;
                    return Some(delivery);
                }
            }

            notified.await;
        }
    }
}

impl Drop for ConsumerState {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if !self.is_live(&state) {
            return;
        }
        let remove = match state.queues.get_mut(&self.queue) {
            Some(queue) => {
                queue.consumers = queue.consumers.saturating_sub(1);
                queue.consumers == 0 && queue.options.auto_delete
            }
            None => false,
        };
        if remove {
            state.queues.remove(&self.queue);
            debug!(queue = %self.queue, "Auto-delete queue removed with last consumer");
        } else {
            debug!(queue = %self.queue, "Consumer cancelled");
        }
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    epoch: u64,
    generation: u64,
    permit: Option<OwnedSemaphorePermit>,
    settled: bool,
}

impl MemoryAcker {
    fn apply(&mut self, settlement: Settlement) -> Result<(), BrokerError> {
        self.settled = true;
        let _permit = self.permit.take();

        let unknown = || BrokerError::UnknownDelivery {
            queue: self.queue.clone(),
            delivery_tag: self.tag,
        };

        let mut state = self.shared.state.lock();
        if state.epoch != self.epoch {
            return Err(unknown());
        }
        let queue = match state.queues.get_mut(&self.queue) {
            Some(queue) if queue.generation == self.generation => queue,
            _ => return Err(unknown()),
        };
        let mut stored = queue.unacked.remove(&self.tag).ok_or_else(unknown)?;

        match settlement {
            Settlement::Ack => queue.counters.acked += 1,
            Settlement::Reject => queue.counters.rejected += 1,
            Settlement::Requeue => {
                stored.redelivered = true;
                queue.ready.push_front(stored);
                queue.counters.requeued += 1;
                drop(state);
                self.shared.notify.notify_waiters();
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn settle(mut self: Box<Self>, settlement: Settlement) -> Result<(), BrokerError> {
        self.apply(settlement)
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if self.apply(Settlement::Requeue).is_ok() {
            debug!(
                queue = %self.queue,
                delivery_tag = self.tag,
                "Unsettled delivery dropped, message requeued"
            );
        }
    }
}
