//! Node configuration, assembled from `COURIER_*` environment variables.

use crate::NodeError;
use rpc_gateway::RpcClientConfig;
use std::env;
use std::time::Duration;
use worker_runtime::WorkerConfig;

/// Queues served when `COURIER_WORKER_QUEUES` is unset.
pub const DEFAULT_WORKER_QUEUES: &str = "HEALTH";

/// Default delay between two health probe rounds.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// How long shutdown waits for workers to drain.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// One worker per entry, bound to the queue of the same name
    pub workers: Vec<WorkerConfig>,
    pub rpc: RpcClientConfig,
    /// `None` disables health probing
    pub probe_interval: Option<Duration>,
    pub shutdown_grace: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            workers: vec![WorkerConfig::for_queue(DEFAULT_WORKER_QUEUES)],
            rpc: RpcClientConfig::default(),
            probe_interval: Some(DEFAULT_PROBE_INTERVAL),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl NodeConfig {
    /// Load configuration from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `COURIER_WORKER_QUEUES`: comma separated queue names (default: HEALTH)
    /// - `COURIER_PROBE_INTERVAL_SECS`: seconds between probes, `0` disables (default: 30)
    /// - every variable read by [`RpcClientConfig::from_env`] and
    ///   [`WorkerConfig::from_env`]
    pub fn from_env() -> Result<Self, NodeError> {
        let queues = env::var("COURIER_WORKER_QUEUES")
            .unwrap_or_else(|_| DEFAULT_WORKER_QUEUES.to_string());

        let workers = parse_queue_list(&queues)
            .into_iter()
            .map(WorkerConfig::from_env)
            .collect::<Result<Vec<_>, _>>()?;

        let probe_interval = match env::var("COURIER_PROBE_INTERVAL_SECS") {
            Ok(value) => {
                let secs: u64 = value.trim().parse().map_err(|_| {
                    NodeError::Config(format!("invalid value for COURIER_PROBE_INTERVAL_SECS: {value}"))
                })?;
                (secs > 0).then(|| Duration::from_secs(secs))
            }
            Err(_) => Some(DEFAULT_PROBE_INTERVAL),
        };

        let config = Self {
            workers,
            rpc: RpcClientConfig::from_env()?,
            probe_interval,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        };
        config.validate()?;
        Ok(config)
    }

    /// Configuration serving `queues` with default settings.
    pub fn for_queues<I, S>(queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            workers: queues.into_iter().map(WorkerConfig::for_queue).collect(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), NodeError> {
        if self.workers.is_empty() {
            return Err(NodeError::Config("at least one worker queue is required".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for worker in &self.workers {
            worker.validate()?;
            if !seen.insert(worker.queue.as_str()) {
                return Err(NodeError::Config(format!(
                    "queue {} configured twice",
                    worker.queue
                )));
            }
        }
        self.rpc.validate()?;
        Ok(())
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.workers.iter().map(|w| w.queue.as_str())
    }
}

fn parse_queue_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .map(str::to_string)
        .collect()
}
