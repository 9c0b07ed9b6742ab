//! Node runtime: owns the broker, the workers and the RPC client.
//!
//! ## Startup Sequence
//!
//! 1. Build one command registry per configured queue
//! 2. Start one worker dispatcher per queue
//! 3. Start the RPC client (reply queue, listener, sweeper)
//! 4. Start the health probe, if enabled
//!
//! ## Shutdown Sequence
//!
//! 1. Signal shutdown to all tasks
//! 2. Wait up to the grace period for workers to drain in-flight items
//! 3. Stop the client's background tasks
//! 4. Close the broker connection

use crate::config::NodeConfig;
use crate::probe::{health_command, run_health_probe};
use crate::NodeError;
use rpc_gateway::RpcClient;
use shared_bus::{InMemoryBroker, MessageBroker};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use worker_runtime::{CommandRegistry, WorkerDispatcher};

pub struct NodeRuntime {
    config: NodeConfig,
    broker: InMemoryBroker,
    client: Option<RpcClient>,
    workers: Vec<JoinHandle<()>>,
    probe: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl NodeRuntime {
    pub fn new(config: NodeConfig) -> Self {
        Self::with_broker(config, InMemoryBroker::new())
    }

    /// Run on an existing broker handle, shared with other components.
    pub fn with_broker(config: NodeConfig, broker: InMemoryBroker) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            broker,
            client: None,
            workers: Vec::new(),
            probe: None,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Start workers, client and probe. Calling `start` twice is an error.
    pub async fn start(&mut self) -> Result<(), NodeError> {
        if self.client.is_some() {
            return Err(NodeError::AlreadyStarted);
        }
        self.config.validate()?;

        info!("===========================================");
        info!("  Courier Node Runtime v{}", env!("CARGO_PKG_VERSION"));
        info!("===========================================");

        let broker: Arc<dyn MessageBroker> = Arc::new(self.broker.clone());

        for worker_config in &self.config.workers {
            let commands = CommandRegistry::builder(&worker_config.queue)
                .health_command(health_command(&worker_config.queue))
                .build()?;
            let dispatcher =
                WorkerDispatcher::new(Arc::clone(&broker), commands, worker_config.clone());
            self.workers
                .push(tokio::spawn(dispatcher.run(self.shutdown_rx.clone())));
            info!(
                queue = %worker_config.queue,
                concurrency = worker_config.concurrency,
                "Worker started"
            );
        }

        let client = RpcClient::start(
            Arc::clone(&broker),
            self.config.rpc.clone(),
            self.shutdown_rx.clone(),
        )
        .await?;

        if let Some(interval) = self.config.probe_interval {
            let queues = self.config.queues().map(str::to_string).collect();
            self.probe = Some(tokio::spawn(run_health_probe(
                client.clone(),
                queues,
                interval,
                self.shutdown_rx.clone(),
            )));
        }

        info!(
            queues = ?self.config.queues().collect::<Vec<_>>(),
            reply_queue = %client.reply_queue(),
            "All workers initialized and running"
        );
        self.client = Some(client);
        Ok(())
    }

    /// The node's RPC client, once started.
    pub fn client(&self) -> Option<&RpcClient> {
        self.client.as_ref()
    }

    pub fn broker(&self) -> &InMemoryBroker {
        &self.broker
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Shutdown the node gracefully.
    pub async fn shutdown(mut self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.shutdown_tx.send(true) {
            error!("Failed to send shutdown signal: {}", e);
        }

        let grace = self.config.shutdown_grace;
        let workers = std::mem::take(&mut self.workers);
        let drained = tokio::time::timeout(grace, async {
            for handle in workers {
                if let Err(e) = handle.await {
                    error!("Worker task failed: {}", e);
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "Workers did not drain in time");
        }

        if let Some(probe) = self.probe.take() {
            let _ = probe.await;
        }
        if let Some(client) = self.client.take() {
            client.join().await;
        }
        self.broker.close().await;

        info!("Shutdown complete");
    }
}
