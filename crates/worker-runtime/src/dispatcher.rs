//! # Worker Dispatch Loop
//!
//! Consumes one work queue and turns every delivery into exactly one
//! settlement.
//!
//! ## Item Flow
//!
//! ```text
//! Delivery
//!    │ decode WorkEnvelope ──── undecodable ───► reject (no reply possible)
//!    ▼
//! Received
//!    │ redelivered + completed recently ──► re-publish stored reply ─┐
//!    ▼                                                                │
//! Handling ── unknown command ─► 501 failure                          │
//!    │        handler Err(e)   ─► e.code failure                      │
//!    │        handler panic    ─► 500 failure                         │
//!    ▼                                                                │
//! Replied | ReplySkipped (no replyTo, or reply publish failed)        │
//!    │                                                                │
//!    ▼                                                                ▼
//! Acknowledged ◄──────────────────────────────────────────────────────┘
//! ```
//!
//! The ack is unconditional: every decodable item is acked once its branch
//! resolves, whatever the handler did. A worker that dies before acking
//! leaves the item unsettled and the broker redelivers it.

use crate::config::WorkerConfig;
use crate::dedup::DedupWindow;
use crate::handler::CommandContext;
use crate::registry::CommandRegistry;
use courier_telemetry::metrics::{
    WORKER_HANDLER_DURATION, WORKER_IN_FLIGHT, WORKER_MESSAGES, WORKER_REPLY_FAILURES,
    WORKER_SETTLEMENTS,
};
use courier_telemetry::{metric_inc, metric_observe};
use shared_bus::{
    Backoff, BrokerError, Consumer, ConsumerOptions, Delivery, Message, MessageBroker,
    QueueOptions,
};
use shared_types::{codes, ErrorBody, ReplyEnvelope, WorkEnvelope, CONTENT_TYPE_JSON};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

/// Where a work item is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkState {
    Received,
    Handling,
    /// A reply was published to `replyTo`.
    Replied,
    /// No reply went out: fire-and-forget, or the reply publish failed.
    ReplySkipped,
    Acknowledged,
    /// Undecodable; dropped without reply.
    Rejected,
}

/// How the handler branch resolved. Used for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Success,
    HandlerError,
    UnknownCommand,
    Panic,
    Deduplicated,
    Malformed,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::HandlerError => "handler_error",
            Self::UnknownCommand => "unknown_command",
            Self::Panic => "panic",
            Self::Deduplicated => "deduplicated",
            Self::Malformed => "malformed",
        }
    }
}

/// Result of processing one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemReport {
    pub state: WorkState,
    pub outcome: DispatchOutcome,
    /// The settlement reached the broker.
    pub settled: bool,
}

/// Dispatches deliveries from one queue to registered handlers.
pub struct WorkerDispatcher {
    broker: Arc<dyn MessageBroker>,
    config: WorkerConfig,
    unit: DispatchUnit,
    limiter: Arc<Semaphore>,
}

/// Everything a spawned item task needs.
#[derive(Clone)]
struct DispatchUnit {
    broker: Arc<dyn MessageBroker>,
    commands: Arc<CommandRegistry>,
    queue: Arc<str>,
    dedup: Option<Arc<DedupWindow>>,
}

impl WorkerDispatcher {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        commands: CommandRegistry,
        config: WorkerConfig,
    ) -> Self {
        let dedup = config
            .dedup_window
            .map(|window| Arc::new(DedupWindow::new(window)));
        let unit = DispatchUnit {
            broker: Arc::clone(&broker),
            commands: Arc::new(commands),
            queue: Arc::from(config.queue.as_str()),
            dedup,
        };
        Self {
            broker,
            limiter: Arc::new(Semaphore::new(config.concurrency)),
            config,
            unit,
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    pub fn commands(&self) -> &CommandRegistry {
        &self.unit.commands
    }

    /// Declare the work queue and start consuming with `prefetch = concurrency`.
    pub async fn subscribe(&self) -> Result<Consumer, BrokerError> {
        self.broker
            .declare_queue(
                &self.config.queue,
                QueueOptions::work_queue(self.config.message_ttl),
            )
            .await?;
        self.broker
            .consume(
                &self.config.queue,
                ConsumerOptions::with_prefetch(self.config.concurrency),
            )
            .await
    }

    /// Process a single delivery inline.
    pub async fn process(&self, delivery: Delivery) -> ItemReport {
        self.unit.process(delivery).await
    }

    /// Run until `shutdown` flips to `true`, then wait for in-flight items.
    ///
    /// A consumer that ends while not shutting down means the connection was
    /// lost; the worker re-declares and re-consumes with backoff.
    #[instrument(skip_all, fields(queue = %self.config.queue))]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Backoff::new(
            self.config.reconnect_backoff,
            self.config.max_reconnect_backoff,
        );
        let mut in_flight: JoinSet<ItemReport> = JoinSet::new();

        'supervise: while !*shutdown.borrow() {
            let mut consumer = match self.subscribe().await {
                Ok(consumer) => {
                    backoff.reset();
                    info!(
                        concurrency = self.config.concurrency,
                        commands = self.unit.commands.len(),
                        "Worker consuming"
                    );
                    consumer
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %e,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Worker subscribe failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => continue 'supervise,
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break 'supervise;
                            }
                            continue 'supervise;
                        }
                    }
                }
            };

            loop {
                tokio::select! {
                    delivery = consumer.recv() => match delivery {
                        Some(delivery) => {
                            let Ok(permit) = Arc::clone(&self.limiter).acquire_owned().await else {
                                break 'supervise;
                            };
                            let unit = self.unit.clone();
                            in_flight.spawn(async move {
                                let report = unit.process(delivery).await;
                                drop(permit);
                                report
                            });
                        }
                        None => {
                            if !*shutdown.borrow() {
                                warn!("Work consumer ended, reconnecting");
                            }
                            break;
                        }
                    },
                    Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                        if let Err(e) = joined {
                            error!(error = %e, "Work item task failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'supervise;
                        }
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }
            let delay = backoff.next_delay();
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        let draining = in_flight.len();
        if draining > 0 {
            info!(in_flight = draining, "Draining in-flight work items");
        }
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Work item task failed");
            }
        }
        info!("Worker stopped");
    }
}

impl DispatchUnit {
    async fn process(&self, delivery: Delivery) -> ItemReport {
        let envelope = match WorkEnvelope::from_slice(delivery.body()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(
                    queue = %self.queue,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Rejecting undecodable work item"
                );
                metric_inc!(WORKER_MESSAGES, &[&*self.queue, DispatchOutcome::Malformed.as_str()]);
                let settled = self.settle(delivery.reject().await, "reject");
                return ItemReport {
                    state: WorkState::Rejected,
                    outcome: DispatchOutcome::Malformed,
                    settled,
                };
            }
        };

        let ctx = CommandContext {
            correlation_id: envelope.correlation_id.clone(),
            command: envelope.command.clone(),
            queue: self.queue.to_string(),
            redelivered: delivery.redelivered,
        };
        let mut state = WorkState::Received;
        debug!(
            correlation_id = %ctx.correlation_id,
            command = %ctx.command,
            redelivered = ctx.redelivered,
            state = ?state,
            "Work item received"
        );

        let cached = if delivery.redelivered {
            self.dedup
                .as_ref()
                .and_then(|dedup| dedup.lookup(&ctx.correlation_id))
        } else {
            None
        };

        let (reply, outcome) = match cached {
            Some(reply) => {
                info!(
                    correlation_id = %ctx.correlation_id,
                    command = %ctx.command,
                    "Redelivered item already completed, replaying stored reply"
                );
                (reply, DispatchOutcome::Deduplicated)
            }
            None => {
                state = WorkState::Handling;
                let (reply, outcome) = self.execute(&envelope, &ctx).await;
                if let Some(dedup) = &self.dedup {
                    dedup.record(ctx.correlation_id.clone(), reply.clone());
                }
                (reply, outcome)
            }
        };
        metric_inc!(WORKER_MESSAGES, &[&*self.queue, outcome.as_str()]);

        state = match envelope.reply_to.as_deref() {
            Some(reply_to) => self.publish_reply(reply_to, &reply, &ctx, state).await,
            None => WorkState::ReplySkipped,
        };

        let settled = self.settle(delivery.ack().await, "ack");
        if settled {
            state = WorkState::Acknowledged;
        }
        debug!(
            correlation_id = %ctx.correlation_id,
            command = %ctx.command,
            outcome = outcome.as_str(),
            state = ?state,
            "Work item done"
        );

        ItemReport {
            state,
            outcome,
            settled,
        }
    }

    /// Run the handler on its own task so a panic stays contained.
    async fn execute(
        &self,
        envelope: &WorkEnvelope,
        ctx: &CommandContext,
    ) -> (ReplyEnvelope, DispatchOutcome) {
        let correlation_id = envelope.correlation_id.clone();

        let Some(handler) = self.commands.get(&envelope.command).cloned() else {
            warn!(
                correlation_id = %correlation_id,
                command = %envelope.command,
                "Unknown command"
            );
            let body = ErrorBody::new(
                codes::UNKNOWN_COMMAND,
                format!("Unknown command: {}", envelope.command),
            );
            return (
                ReplyEnvelope::failure(correlation_id, body),
                DispatchOutcome::UnknownCommand,
            );
        };

        let payload = envelope.payload.clone();
        let task_ctx = ctx.clone();
        let started = Instant::now();
        WORKER_IN_FLIGHT.with_label_values(&[&*self.queue]).inc();

        let joined = tokio::spawn(async move { handler.handle(payload, &task_ctx).await }).await;

        WORKER_IN_FLIGHT.with_label_values(&[&*self.queue]).dec();
        metric_observe!(
            WORKER_HANDLER_DURATION,
            &[&*self.queue, envelope.command.as_str()],
            started.elapsed().as_secs_f64()
        );

        match joined {
            Ok(Ok(data)) => (
                ReplyEnvelope::success(correlation_id, data),
                DispatchOutcome::Success,
            ),
            Ok(Err(e)) => {
                debug!(
                    correlation_id = %correlation_id,
                    command = %envelope.command,
                    code = e.code,
                    error = %e.message,
                    "Handler returned an error"
                );
                (
                    ReplyEnvelope::failure(correlation_id, e.into()),
                    DispatchOutcome::HandlerError,
                )
            }
            Err(join_error) => {
                let detail = if join_error.is_panic() {
                    panic_message(join_error.into_panic())
                } else {
                    "handler task cancelled".to_string()
                };
                error!(
                    correlation_id = %correlation_id,
                    command = %envelope.command,
                    panic = %detail,
                    "Handler panicked"
                );
                let body = ErrorBody::new(codes::INTERNAL_ERROR, "Internal error");
                (
                    ReplyEnvelope::failure(correlation_id, body),
                    DispatchOutcome::Panic,
                )
            }
        }
    }

    async fn publish_reply(
        &self,
        reply_to: &str,
        reply: &ReplyEnvelope,
        ctx: &CommandContext,
        state: WorkState,
    ) -> WorkState {
        let body = match reply.to_vec() {
            Ok(body) => body,
            Err(e) => {
                error!(correlation_id = %ctx.correlation_id, error = %e, "Reply encoding failed");
                return WorkState::ReplySkipped;
            }
        };
        let message = Message::new(body).with_content_type(CONTENT_TYPE_JSON);

        match self.broker.publish(reply_to, message).await {
            Ok(()) => {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    reply_to = reply_to,
                    from = ?state,
                    "Reply published"
                );
                WorkState::Replied
            }
            Err(e) => {
                metric_inc!(WORKER_REPLY_FAILURES, &[&*self.queue]);
                warn!(
                    correlation_id = %ctx.correlation_id,
                    command = %ctx.command,
                    reply_to = reply_to,
                    error = %e,
                    "Reply publish failed; acknowledging anyway"
                );
                WorkState::ReplySkipped
            }
        }
    }

    fn settle(&self, result: Result<(), BrokerError>, kind: &'static str) -> bool {
        match result {
            Ok(()) => {
                metric_inc!(WORKER_SETTLEMENTS, &[&*self.queue, kind]);
                true
            }
            Err(e) => {
                metric_inc!(WORKER_SETTLEMENTS, &[&*self.queue, "failed"]);
                warn!(queue = %self.queue, settlement = kind, error = %e, "Settlement failed");
                false
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
