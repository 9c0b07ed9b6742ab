//! RPC Client - request/reply over named worker queues.
//!
//! ```text
//! call() ─► register ─► publish WorkEnvelope ─► wait(deadline)
//!                                                   ▲
//!            ReplyListener ─► registry.fulfill() ───┘
//! ```
//!
//! Each call publishes exactly once and creates exactly one registry entry,
//! which is gone by the time `call` returns. There are no retries. A call
//! made while the reply queue has no consumer fails with a transport error
//! before anything is published.

use crate::config::RpcClientConfig;
use crate::error::RpcError;
use crate::listener::ReplyListener;
use crate::registry::{run_sweeper, CallOutcome, CorrelationRegistry};
use courier_telemetry::metrics::{RPC_CALLS, RPC_CALL_DURATION, RPC_NOTIFICATIONS};
use courier_telemetry::{log_rpc_event, metric_inc, metric_observe};
use dashmap::DashSet;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use shared_bus::{Message, MessageBroker};
use shared_types::{CorrelationId, WorkEnvelope, CONTENT_TYPE_JSON};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Client for calling workers through the broker.
///
/// Cheap to clone; clones share the registry and the reply queue.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<dyn MessageBroker>,
    registry: Arc<CorrelationRegistry>,
    reply_queue: String,
    reply_ready: Arc<AtomicBool>,
    config: RpcClientConfig,
    /// Worker queues already declared by this client.
    declared: DashSet<String>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Removes the registration if the caller stops waiting early.
struct Registration<'a> {
    registry: &'a CorrelationRegistry,
    correlation_id: CorrelationId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.cancel(&self.correlation_id);
    }
}

impl RpcClient {
    /// Declare a private reply queue, start the reply listener and the
    /// registry sweeper, and return a ready client.
    ///
    /// Background tasks stop when `shutdown` flips to `true`.
    pub async fn start(
        broker: Arc<dyn MessageBroker>,
        config: RpcClientConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, RpcError> {
        let registry = CorrelationRegistry::new_shared();
        let reply_queue = format!("{}.{}", config.reply_queue_prefix, Uuid::new_v4());

        let listener = ReplyListener::new(
            Arc::clone(&broker),
            Arc::clone(&registry),
            reply_queue.clone(),
            config.reconnect_backoff,
            config.max_reconnect_backoff,
        );
        let consumer = listener.subscribe().await?;
        let reply_ready = listener.readiness();

        let tasks = vec![
            tokio::spawn(listener.run(consumer, shutdown.clone())),
            tokio::spawn(run_sweeper(
                Arc::clone(&registry),
                config.sweep_interval,
                shutdown,
            )),
        ];

        info!(reply_queue = %reply_queue, "RPC client started");

        Ok(Self {
            inner: Arc::new(Inner {
                broker,
                registry,
                reply_queue,
                reply_ready,
                config,
                declared: DashSet::new(),
                tasks: tokio::sync::Mutex::new(tasks),
            }),
        })
    }

    /// Call `command` on the worker bound to `queue` and wait for its reply.
    ///
    /// `timeout` defaults to the configured call timeout. It bounds the wait
    /// and is also the message's expiration, so a worker never picks up a
    /// request nobody is waiting for anymore.
    pub async fn call(
        &self,
        queue: &str,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let timeout = timeout.unwrap_or(self.inner.config.default_timeout);
        let started = Instant::now();

        let result = self.call_inner(queue, command, payload, timeout).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.outcome_label(),
        };
        metric_inc!(RPC_CALLS, &[queue, outcome]);
        metric_observe!(RPC_CALL_DURATION, &[queue], started.elapsed().as_secs_f64());
        result
    }

    async fn call_inner(
        &self,
        queue: &str,
        command: &str,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, RpcError> {
        if !self.reply_consumer_ready() {
            return Err(RpcError::Transport(format!(
                "reply queue {} has no consumer",
                self.inner.reply_queue
            )));
        }

        let registry = &self.inner.registry;
        let call = registry.register(queue, command, timeout);
        let correlation_id = call.correlation_id().clone();
        let _registration = Registration {
            registry,
            correlation_id: correlation_id.clone(),
        };

        let envelope = WorkEnvelope::request(
            command,
            payload,
            correlation_id.clone(),
            &self.inner.reply_queue,
        );
        if let Err(e) = self.publish(queue, &envelope, Some(timeout)).await {
            registry.cancel(&correlation_id);
            log_rpc_event!(warn, correlation_id, queue, command, "RPC publish failed", error = %e);
            return Err(e);
        }
        log_rpc_event!(debug, correlation_id, queue, command, "RPC request published");

        match registry.wait(call).await {
            CallOutcome::Reply(Ok(data)) => Ok(data),
            CallOutcome::Reply(Err(failure)) => Err(failure.into()),
            CallOutcome::Expired => {
                log_rpc_event!(
                    warn,
                    correlation_id,
                    queue,
                    command,
                    "RPC call timed out",
                    timeout_ms = timeout.as_millis() as u64
                );
                Err(RpcError::Timeout { timeout })
            }
            CallOutcome::TransportLost(reason) => Err(RpcError::Transport(reason)),
        }
    }

    /// Typed wrapper around [`call`](Self::call).
    pub async fn call_typed<Req, Resp>(
        &self,
        queue: &str,
        command: &str,
        request: &Req,
        timeout: Option<Duration>,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let payload = serde_json::to_value(request).map_err(RpcError::encode)?;
        let data = self.call(queue, command, payload, timeout).await?;
        serde_json::from_value(data).map_err(RpcError::decode)
    }

    /// Publish `command` without waiting for, or asking for, a reply.
    pub async fn send(&self, queue: &str, command: &str, payload: Value) -> Result<(), RpcError> {
        let envelope = WorkEnvelope::notification(command, payload);
        self.publish(queue, &envelope, None).await?;
        metric_inc!(RPC_NOTIFICATIONS, &[queue]);
        debug!(
            correlation_id = %envelope.correlation_id,
            queue = queue,
            command = command,
            "Notification published"
        );
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        envelope: &WorkEnvelope,
        expiration: Option<Duration>,
    ) -> Result<(), RpcError> {
        self.ensure_declared(queue).await?;

        let mut message = Message::new(envelope.to_vec()?).with_content_type(CONTENT_TYPE_JSON);
        if let Some(expiration) = expiration {
            message = message.with_expiration(expiration);
        }
        self.inner.broker.publish(queue, message).await?;
        Ok(())
    }

    async fn ensure_declared(&self, queue: &str) -> Result<(), RpcError> {
        if self.inner.declared.contains(queue) {
            return Ok(());
        }
        self.inner
            .broker
            .declare_queue(queue, self.inner.config.work_queue)
            .await?;
        self.inner.declared.insert(queue.to_string());
        Ok(())
    }

    /// Name of this client's reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Whether the reply listener is currently consuming the reply queue.
    pub fn reply_consumer_ready(&self) -> bool {
        self.inner.reply_ready.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Arc<CorrelationRegistry> {
        &self.inner.registry
    }

    pub fn pending_count(&self) -> usize {
        self.inner.registry.pending_count()
    }

    pub fn config(&self) -> &RpcClientConfig {
        &self.inner.config
    }

    /// Wait for the background tasks to finish after shutdown was signalled.
    pub async fn join(&self) {
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            let _ = task.await;
        }
    }
}
