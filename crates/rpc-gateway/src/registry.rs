//! Correlation Registry - pending calls keyed by correlation ID.
//!
//! Flow:
//! 1. The client calls `register()` and gets a [`PendingCall`] handle
//! 2. The client publishes a work envelope carrying the handle's ID
//! 3. The reply listener calls `fulfill()` when the reply arrives
//! 4. The client awaits the handle with [`CorrelationRegistry::wait`] until
//!    its deadline
//!
//! Presence in the map means "pending". Every transition out of pending
//! (`fulfill`, `expire`, `cancel`, `fail_all`) is an atomic map removal, so
//! exactly one of them wins for a given ID and a waiter is woken at most once.

use courier_telemetry::metrics::{RPC_DISCARDED_REPLIES, RPC_PENDING};
use dashmap::DashMap;
use serde_json::Value;
use shared_bus::deadline_after;
use shared_types::{CorrelationId, ErrorBody};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Failure reported by a worker.
pub type RemoteFailure = ErrorBody;

/// What a waiter is woken with.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    /// A reply arrived in time.
    Reply(Result<Value, RemoteFailure>),
    /// The deadline passed first.
    Expired,
    /// The broker connection was lost while waiting.
    TransportLost(String),
}

/// Result of offering a reply to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FulfillOutcome {
    /// The reply completed a pending call.
    Fulfilled,
    /// Unknown, expired or already completed ID. The reply was dropped.
    Discarded,
}

struct PendingEntry {
    sender: oneshot::Sender<CallOutcome>,
    created_at: Instant,
    deadline: Instant,
    queue: String,
    command: String,
}

/// Caller's side of a registered call.
#[derive(Debug)]
pub struct PendingCall {
    correlation_id: CorrelationId,
    deadline: Instant,
    receiver: oneshot::Receiver<CallOutcome>,
}

impl PendingCall {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Lifetime counters.
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub registered: AtomicU64,
    pub fulfilled: AtomicU64,
    pub expired: AtomicU64,
    pub cancelled: AtomicU64,
    /// Duplicate or stale replies dropped.
    pub discarded: AtomicU64,
    /// Calls failed by connection loss.
    pub failed: AtomicU64,
}

impl RegistryStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Registry of calls awaiting a reply.
///
/// One per client process, shared by `Arc` between the client, the reply
/// listener and the sweeper.
#[derive(Default)]
pub struct CorrelationRegistry {
    pending: DashMap<CorrelationId, PendingEntry>,
    stats: RegistryStats,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a pending call with a fresh correlation ID.
    ///
    /// Oversized `ttl` values saturate to a far-future deadline.
    pub fn register(&self, queue: &str, command: &str, ttl: Duration) -> PendingCall {
        let correlation_id = CorrelationId::new();
        let (sender, receiver) = oneshot::channel();
        let created_at = Instant::now();
        let deadline = deadline_after(created_at, ttl);

        self.pending.insert(
            correlation_id.clone(),
            PendingEntry {
                sender,
                created_at,
                deadline,
                queue: queue.to_string(),
                command: command.to_string(),
            },
        );
        RegistryStats::bump(&self.stats.registered);
        RPC_PENDING.inc();

        debug!(
            correlation_id = %correlation_id,
            queue = queue,
            command = command,
            ttl_ms = ttl.as_millis() as u64,
            "Registered pending call"
        );

        PendingCall {
            correlation_id,
            deadline,
            receiver,
        }
    }

    /// Complete a pending call with the worker's answer.
    ///
    /// The first transition wins. Replies for unknown, expired or already
    /// fulfilled IDs are dropped and counted, never reported as errors.
    pub fn fulfill(
        &self,
        correlation_id: &CorrelationId,
        result: Result<Value, RemoteFailure>,
    ) -> FulfillOutcome {
        let Some((_, entry)) = self.pending.remove(correlation_id) else {
            RegistryStats::bump(&self.stats.discarded);
            RPC_DISCARDED_REPLIES.inc();
            debug!(
                correlation_id = %correlation_id,
                "Discarding duplicate or stale reply"
            );
            return FulfillOutcome::Discarded;
        };
        RPC_PENDING.dec();
        RegistryStats::bump(&self.stats.fulfilled);

        let elapsed = entry.created_at.elapsed();
        if entry.sender.send(CallOutcome::Reply(result)).is_err() {
            // Caller stopped waiting; the entry is gone either way.
            debug!(
                correlation_id = %correlation_id,
                command = %entry.command,
                "Reply arrived after caller went away"
            );
        } else {
            debug!(
                correlation_id = %correlation_id,
                queue = %entry.queue,
                command = %entry.command,
                elapsed_ms = elapsed.as_millis() as u64,
                "Fulfilled pending call"
            );
        }
        FulfillOutcome::Fulfilled
    }

    /// Expire a call whose deadline has passed.
    ///
    /// Returns `false` when the call is not pending or its deadline is still
    /// in the future.
    pub fn expire(&self, correlation_id: &CorrelationId) -> bool {
        let now = Instant::now();
        let Some((_, entry)) = self
            .pending
            .remove_if(correlation_id, |_, entry| now >= entry.deadline)
        else {
            return false;
        };
        RPC_PENDING.dec();
        RegistryStats::bump(&self.stats.expired);

        warn!(
            correlation_id = %correlation_id,
            queue = %entry.queue,
            command = %entry.command,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Pending call expired without a reply"
        );
        let _ = entry.sender.send(CallOutcome::Expired);
        true
    }

    /// Drop a pending call without waking its waiter.
    ///
    /// Used when the request never made it onto the broker.
    pub fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        if self.pending.remove(correlation_id).is_some() {
            RPC_PENDING.dec();
            RegistryStats::bump(&self.stats.cancelled);
            debug!(correlation_id = %correlation_id, "Cancelled pending call");
            true
        } else {
            false
        }
    }

    /// Expire every call past its deadline. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let overdue: Vec<CorrelationId> = self
            .pending
            .iter()
            .filter(|entry| now >= entry.deadline)
            .map(|entry| entry.key().clone())
            .collect();

        overdue.iter().filter(|id| self.expire(id)).count()
    }

    /// Wake every pending waiter with a transport failure.
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<CorrelationId> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut failed = 0;

        for id in ids {
            if let Some((_, entry)) = self.pending.remove(&id) {
                RPC_PENDING.dec();
                RegistryStats::bump(&self.stats.failed);
                let _ = entry
                    .sender
                    .send(CallOutcome::TransportLost(reason.to_string()));
                failed += 1;
            }
        }

        if failed > 0 {
            warn!(failed, reason, "Failed pending calls after connection loss");
        }
        failed
    }

    /// Await the outcome of a registered call, expiring it at its deadline.
    pub async fn wait(&self, call: PendingCall) -> CallOutcome {
        let PendingCall {
            correlation_id,
            deadline,
            mut receiver,
        } = call;

        if let Ok(received) = tokio::time::timeout_at(deadline, &mut receiver).await {
            return received.unwrap_or_else(|_| cancelled_outcome());
        }

        // A reply may have won the race against the deadline; whichever
        // transition removed the entry has already sent on the channel.
        self.expire(&correlation_id);
        receiver.await.unwrap_or_else(|_| cancelled_outcome())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, correlation_id: &CorrelationId) -> bool {
        self.pending.contains_key(correlation_id)
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }
}

fn cancelled_outcome() -> CallOutcome {
    CallOutcome::TransportLost("pending call was cancelled".to_string())
}

/// Periodically expire overdue calls until `shutdown` flips to `true`.
///
/// Waiters expire themselves at their deadline; the sweeper only reclaims
/// entries whose caller stopped waiting.
pub async fn run_sweeper(
    registry: Arc<CorrelationRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let removed = registry.sweep_expired();
                if removed > 0 {
                    debug!(removed, "Swept expired pending calls");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Registry sweeper stopping");
                    break;
                }
            }
        }
    }
}
