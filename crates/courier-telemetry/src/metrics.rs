//! Prometheus metrics for the RPC client and the workers.
//!
//! All metrics follow the naming convention: `courier_<component>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., rpc_calls_total)
//! - **Gauge**: Value that can go up or down (e.g., rpc_pending_calls)
//! - **Histogram**: Distribution of values (e.g., rpc_call_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // RPC CLIENT METRICS
    // =========================================================================

    /// Calls by target queue and outcome
    pub static ref RPC_CALLS: IntCounterVec = IntCounterVec::new(
        Opts::new("courier_rpc_calls_total", "RPC calls issued, by outcome"),
        &["queue", "outcome"]  // outcome: success/remote_error/timeout/transport_error/codec_error
    ).expect("metric creation failed");

    /// Call latency, publish to return
    pub static ref RPC_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "courier_rpc_call_duration_seconds",
            "Time from publish to reply or timeout"
        ).buckets(exponential_buckets(0.001, 2.0, 15).expect("valid buckets")),
        &["queue"]
    ).expect("metric creation failed");

    /// Calls currently awaiting a reply
    pub static ref RPC_PENDING: IntGauge = IntGauge::new(
        "courier_rpc_pending_calls",
        "Pending calls held in the correlation registry"
    ).expect("metric creation failed");

    /// Replies that arrived for an unknown, expired or already fulfilled call
    pub static ref RPC_DISCARDED_REPLIES: IntCounter = IntCounter::new(
        "courier_rpc_discarded_replies_total",
        "Duplicate or stale replies dropped by the correlation registry"
    ).expect("metric creation failed");

    /// Fire-and-forget sends
    pub static ref RPC_NOTIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("courier_rpc_notifications_total", "Fire-and-forget messages published"),
        &["queue"]
    ).expect("metric creation failed");

    // =========================================================================
    // WORKER METRICS
    // =========================================================================

    /// Work items by queue and outcome
    pub static ref WORKER_MESSAGES: IntCounterVec = IntCounterVec::new(
        Opts::new("courier_worker_messages_total", "Work items processed, by outcome"),
        &["queue", "outcome"]  // outcome: success/handler_error/unknown_command/panic/malformed/deduplicated
    ).expect("metric creation failed");

    /// Settlements issued by workers
    pub static ref WORKER_SETTLEMENTS: IntCounterVec = IntCounterVec::new(
        Opts::new("courier_worker_settlements_total", "Deliveries settled by workers"),
        &["queue", "settlement"]  // settlement: ack/reject/failed
    ).expect("metric creation failed");

    /// Replies that could not be published
    pub static ref WORKER_REPLY_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new(
            "courier_worker_reply_publish_failures_total",
            "Replies lost because publishing to reply-to failed"
        ),
        &["queue"]
    ).expect("metric creation failed");

    /// Handler execution time
    pub static ref WORKER_HANDLER_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "courier_worker_handler_duration_seconds",
            "Time spent inside command handlers"
        ).buckets(exponential_buckets(0.0005, 2.0, 15).expect("valid buckets")),
        &["queue", "command"]
    ).expect("metric creation failed");

    /// Handlers currently executing
    pub static ref WORKER_IN_FLIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("courier_worker_in_flight", "Work items currently being handled"),
        &["queue"]
    ).expect("metric creation failed");
}

static REGISTERED: OnceLock<Result<(), String>> = OnceLock::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<(), TelemetryError> {
    REGISTERED
        .get_or_init(|| {
            let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
                // RPC client
                Box::new(RPC_CALLS.clone()),
                Box::new(RPC_CALL_DURATION.clone()),
                Box::new(RPC_PENDING.clone()),
                Box::new(RPC_DISCARDED_REPLIES.clone()),
                Box::new(RPC_NOTIFICATIONS.clone()),
                // Worker
                Box::new(WORKER_MESSAGES.clone()),
                Box::new(WORKER_SETTLEMENTS.clone()),
                Box::new(WORKER_REPLY_FAILURES.clone()),
                Box::new(WORKER_HANDLER_DURATION.clone()),
                Box::new(WORKER_IN_FLIGHT.clone()),
            ];

            for metric in metrics {
                REGISTRY.register(metric).map_err(|e| e.to_string())?;
            }
            Ok(())
        })
        .clone()
        .map_err(TelemetryError::MetricsInit)
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}
