//! Periodic health probing of the node's workers.
//!
//! Each round calls `<queue>.health` on every served queue through the
//! regular RPC path, so a passing probe proves the whole publish, dispatch,
//! reply and correlate loop.

use futures::future::join_all;
use rpc_gateway::{RpcClient, RpcError};
use serde_json::Value;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Result of probing one queue.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub queue: String,
    pub latency: Duration,
    pub outcome: Result<Value, RpcError>,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        matches!(&self.outcome, Ok(body) if body.get("status").and_then(Value::as_str) == Some("ok"))
    }
}

/// Health command answered by the worker bound to `queue`.
pub fn health_command(queue: &str) -> String {
    format!("{}.health", queue.to_lowercase())
}

/// Probe every queue once, concurrently.
pub async fn probe_once(client: &RpcClient, queues: &[String], timeout: Duration) -> Vec<ProbeResult> {
    let probes = queues.iter().map(|queue| async move {
        let started = Instant::now();
        let outcome = client
            .call(queue, &health_command(queue), Value::Null, Some(timeout))
            .await;
        ProbeResult {
            queue: queue.clone(),
            latency: started.elapsed(),
            outcome,
        }
    });
    join_all(probes).await
}

/// Probe all queues every `interval` until `shutdown` flips.
pub async fn run_health_probe(
    client: RpcClient,
    queues: Vec<String>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // first tick completes immediately; give workers one interval to come up
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let probe_timeout = interval.min(client.config().default_timeout);
                for result in probe_once(&client, &queues, probe_timeout).await {
                    if result.is_healthy() {
                        debug!(
                            queue = %result.queue,
                            latency_ms = result.latency.as_millis() as u64,
                            "Health probe passed"
                        );
                    } else {
                        warn!(
                            queue = %result.queue,
                            latency_ms = result.latency.as_millis() as u64,
                            outcome = ?result.outcome,
                            "Health probe failed"
                        );
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("Health probe stopping");
                    break;
                }
            }
        }
    }
}
