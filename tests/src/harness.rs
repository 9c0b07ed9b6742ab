//! # Test Harness
//!
//! One in-memory broker, one RPC client and any number of workers, torn
//! down together.

use async_trait::async_trait;
use parking_lot::Mutex;
use rpc_gateway::{RpcClient, RpcClientConfig};
use serde_json::{json, Value};
use shared_bus::{
    BrokerError, Consumer, ConsumerOptions, InMemoryBroker, Message, MessageBroker, QueueOptions,
};
use shared_types::ReplyEnvelope;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use worker_runtime::{CommandRegistry, HandlerError, WorkerConfig, WorkerDispatcher};

pub struct Harness {
    pub broker: InMemoryBroker,
    pub client: RpcClient,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Harness {
    pub async fn new() -> Self {
        let broker = InMemoryBroker::new();
        Self::with_broker(Arc::new(broker.clone()), broker).await
    }

    /// Client publishes through `client_broker`; workers and assertions use
    /// `broker`, which `client_broker` wraps.
    async fn with_broker(client_broker: Arc<dyn MessageBroker>, broker: InMemoryBroker) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let client = RpcClient::start(client_broker, RpcClientConfig::default(), shutdown_rx)
            .await
            .expect("client starts");
        Self {
            broker,
            client,
            shutdown_tx,
            workers: Vec::new(),
        }
    }

    /// Harness whose client sends through `flaky`.
    pub async fn with_flaky(flaky: FlakyBroker) -> Self {
        let broker = flaky.inner.clone();
        Self::with_broker(Arc::new(flaky), broker).await
    }

    pub fn spawn_worker(&mut self, commands: CommandRegistry, config: WorkerConfig) {
        let dispatcher = self.dispatcher(commands, config);
        self.workers
            .push(tokio::spawn(dispatcher.run(self.shutdown_tx.subscribe())));
    }

    /// A dispatcher on the harness broker that the test drives by hand.
    pub fn dispatcher(&self, commands: CommandRegistry, config: WorkerConfig) -> WorkerDispatcher {
        WorkerDispatcher::new(Arc::new(self.broker.clone()), commands, config)
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
        self.client.join().await;
    }
}

/// Registry with a `sleep` command that waits `delay_ms` and echoes `tag`,
/// plus commands that fail in each supported way.
pub fn scripted_commands(service: &str) -> CommandRegistry {
    CommandRegistry::builder(service)
        .command_fn("sleep", |payload: Value, _ctx| async move {
            let delay = payload["delay_ms"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(json!({ "tag": payload["tag"].clone() }))
        })
        .command_fn("conflict", |_, _| async {
            Err::<Value, _>(HandlerError::conflict("already exists"))
        })
        .command_fn("explode", |payload: Value, _ctx| async move {
            if payload.is_null() {
                return Ok::<Value, HandlerError>(Value::Null);
            }
            panic!("handler exploded");
        })
        .build()
        .expect("scripted registry builds")
}

/// Declare a plain reply queue and consume it.
pub async fn reply_consumer(broker: &InMemoryBroker, name: &str) -> Consumer {
    broker
        .declare_queue(name, QueueOptions::reply_queue())
        .await
        .expect("declare reply queue");
    broker
        .consume(name, ConsumerOptions::with_prefetch(0))
        .await
        .expect("consume reply queue")
}

/// Next reply on `consumer`, acked.
pub async fn next_reply(consumer: &mut Consumer) -> ReplyEnvelope {
    let delivery = tokio::time::timeout(Duration::from_secs(5), consumer.recv())
        .await
        .expect("reply within 5s")
        .expect("reply consumer open");
    let reply = ReplyEnvelope::from_slice(delivery.body()).expect("valid reply");
    delivery.ack().await.expect("ack reply");
    reply
}

/// Poll `condition` every 5ms for up to 5s.
pub async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Broker wrapper that can fail publishes to selected queues.
#[derive(Clone)]
pub struct FlakyBroker {
    inner: InMemoryBroker,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl FlakyBroker {
    pub fn new(inner: InMemoryBroker) -> Self {
        Self {
            inner,
            failing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn fail_publishes_to(&self, queue: &str) {
        self.failing.lock().insert(queue.to_string());
    }

    /// Let every publish through again.
    pub fn heal(&self) {
        self.failing.lock().clear();
    }
}

#[async_trait]
impl MessageBroker for FlakyBroker {
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.inner.declare_queue(name, options).await
    }

    async fn delete_queue(&self, name: &str) -> Result<(), BrokerError> {
        self.inner.delete_queue(name).await
    }

    async fn publish(&self, queue: &str, message: Message) -> Result<(), BrokerError> {
        if self.failing.lock().contains(queue) {
            return Err(BrokerError::Other(format!("publish to {queue} refused")));
        }
        self.inner.publish(queue, message).await
    }

    async fn consume(
        &self,
        queue: &str,
        options: ConsumerOptions,
    ) -> Result<Consumer, BrokerError> {
        self.inner.consume(queue, options).await
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    async fn close(&self) {
        self.inner.close().await
    }
}
