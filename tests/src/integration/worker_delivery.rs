//! # Worker Delivery Guarantees
//!
//! Ack-always settlement, redelivery, prefetch, queue TTL and the redelivery
//! dedup window, observed through broker queue statistics.

#[cfg(test)]
mod tests {
    use crate::harness::{eventually, next_reply, reply_consumer, scripted_commands, Harness};
    use rpc_gateway::RpcError;
    use serde_json::{json, Value};
    use shared_bus::{ConsumerOptions, InMemoryBroker, Message, MessageBroker, QueueOptions};
    use shared_types::{CorrelationId, WorkEnvelope};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use worker_runtime::{CommandRegistry, DispatchOutcome, WorkState, WorkerConfig};

    async fn publish_request(
        broker: &InMemoryBroker,
        queue: &str,
        command: &str,
        payload: Value,
        reply_to: &str,
    ) -> WorkEnvelope {
        let envelope = WorkEnvelope::request(command, payload, CorrelationId::new(), reply_to);
        broker
            .publish(queue, Message::json(&envelope).unwrap())
            .await
            .unwrap();
        envelope
    }

    fn counting_commands(service: &str, counter: Arc<AtomicUsize>) -> CommandRegistry {
        CommandRegistry::builder(service)
            .command_fn("count", move |_, ctx| {
                let counter = Arc::clone(&counter);
                async move {
                    let runs = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(json!({ "runs": runs, "redelivered": ctx.redelivered }))
                }
            })
            .build()
            .unwrap()
    }

    // =========================================================================
    // ACK-ALWAYS
    // =========================================================================

    #[tokio::test]
    async fn test_every_outcome_is_acked_exactly_once() {
        let mut harness = Harness::new().await;
        let broker = harness.broker.clone();
        broker
            .declare_queue("W", QueueOptions::default())
            .await
            .unwrap();
        let mut replies = reply_consumer(&broker, "replies.W").await;
        harness.spawn_worker(scripted_commands("w"), WorkerConfig::for_queue("W"));

        let mut expected = HashMap::new();
        for (command, payload, code) in [
            ("sleep", json!({"tag": "ok"}), None),
            ("conflict", Value::Null, Some(409)),
            ("explode", json!({"boom": true}), Some(500)),
            ("w.missing", Value::Null, Some(501)),
        ] {
            let envelope = publish_request(&broker, "W", command, payload, "replies.W").await;
            expected.insert(envelope.correlation_id, code);
        }

        for _ in 0..expected.len() {
            let reply = next_reply(&mut replies).await;
            let code = expected
                .remove(&reply.correlation_id)
                .expect("reply for a request we sent");
            match code {
                None => assert!(reply.success),
                Some(code) => {
                    assert!(!reply.success);
                    assert_eq!(reply.error.unwrap().code, code);
                }
            }
        }
        assert!(expected.is_empty());

        eventually(|| {
            let broker = broker.clone();
            async move { broker.queue_stats("W").is_some_and(|s| s.acked == 4) }
        })
        .await;
        let stats = broker.queue_stats("W").unwrap();
        assert_eq!(stats.unacked, 0);
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.rejected, 0);

        // still serving after the panic
        let reply = harness
            .client
            .call("W", "w.health", Value::Null, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply["status"], "ok");

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_malformed_item_is_rejected_not_requeued() {
        let mut harness = Harness::new().await;
        let broker = harness.broker.clone();
        broker
            .declare_queue("W", QueueOptions::default())
            .await
            .unwrap();
        harness.spawn_worker(scripted_commands("w"), WorkerConfig::for_queue("W"));

        broker
            .publish("W", Message::new("{not json"))
            .await
            .unwrap();

        eventually(|| {
            let broker = broker.clone();
            async move { broker.queue_stats("W").is_some_and(|s| s.rejected == 1) }
        })
        .await;
        let stats = broker.queue_stats("W").unwrap();
        assert_eq!(stats.requeued, 0);
        assert_eq!(stats.ready, 0);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_in_flight_item() {
        let mut harness = Harness::new().await;
        let broker = harness.broker.clone();
        harness.spawn_worker(scripted_commands("w"), WorkerConfig::for_queue("W"));

        harness
            .client
            .send("W", "sleep", json!({"delay_ms": 100}))
            .await
            .unwrap();
        eventually(|| {
            let broker = broker.clone();
            async move { broker.queue_stats("W").is_some_and(|s| s.unacked == 1) }
        })
        .await;

        harness.shutdown().await;

        let stats = broker.queue_stats("W").unwrap();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.unacked, 0);
    }

    // =========================================================================
    // REDELIVERY
    // =========================================================================

    #[tokio::test]
    async fn test_unsettled_item_is_redelivered_to_worker() {
        let mut harness = Harness::new().await;
        let broker = harness.broker.clone();
        broker
            .declare_queue("R", QueueOptions::default())
            .await
            .unwrap();
        let mut replies = reply_consumer(&broker, "replies.R").await;
        let envelope = publish_request(&broker, "R", "count", Value::Null, "replies.R").await;

        // a worker that crashes mid-item: takes the delivery, never settles
        {
            let mut crashed = broker
                .consume("R", ConsumerOptions::with_prefetch(1))
                .await
                .unwrap();
            let delivery = crashed.recv().await.unwrap();
            assert!(!delivery.redelivered);
        }
        assert_eq!(broker.queue_stats("R").unwrap().requeued, 1);

        let counter = Arc::new(AtomicUsize::new(0));
        harness.spawn_worker(
            counting_commands("r", Arc::clone(&counter)),
            WorkerConfig::for_queue("R"),
        );

        let reply = next_reply(&mut replies).await;
        assert_eq!(reply.correlation_id, envelope.correlation_id);
        assert_eq!(reply.data, Some(json!({"runs": 1, "redelivered": true})));

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_dedup_window_replays_completed_reply() {
        let harness = Harness::new().await;
        let broker = harness.broker.clone();
        broker
            .declare_queue("D", QueueOptions::default())
            .await
            .unwrap();
        let mut replies = reply_consumer(&broker, "replies.D").await;

        let counter = Arc::new(AtomicUsize::new(0));
        let dispatcher = harness.dispatcher(
            counting_commands("d", Arc::clone(&counter)),
            WorkerConfig {
                dedup_window: Some(Duration::from_secs(60)),
                ..WorkerConfig::for_queue("D")
            },
        );
        let mut deliveries = broker
            .consume("D", ConsumerOptions::with_prefetch(1))
            .await
            .unwrap();

        let envelope = publish_request(&broker, "D", "count", Value::Null, "replies.D").await;
        let first = dispatcher
            .process(deliveries.recv().await.unwrap())
            .await;
        assert_eq!(first.outcome, DispatchOutcome::Success);
        assert_eq!(first.state, WorkState::Acknowledged);

        // the same item shows up again and is abandoned once before redelivery
        broker
            .publish("D", Message::json(&envelope).unwrap())
            .await
            .unwrap();
        drop(deliveries.recv().await.unwrap());
        let redelivered = deliveries.recv().await.unwrap();
        assert!(redelivered.redelivered);

        let second = dispatcher.process(redelivered).await;
        assert_eq!(second.outcome, DispatchOutcome::Deduplicated);
        assert!(second.settled);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let a = next_reply(&mut replies).await;
        let b = next_reply(&mut replies).await;
        assert_eq!(a, b);
        assert_eq!(a.data, Some(json!({"runs": 1, "redelivered": false})));

        harness.shutdown().await;
    }

    // =========================================================================
    // PREFETCH
    // =========================================================================

    #[tokio::test]
    async fn test_concurrency_is_bounded_by_prefetch() {
        let mut harness = Harness::new().await;
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let done = Arc::new(AtomicUsize::new(0));

        let commands = {
            let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
            CommandRegistry::builder("p")
                .command_fn("p.work", move |_, _| {
                    let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
                    async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok(Value::Null)
                    }
                })
                .build()
                .unwrap()
        };
        harness.spawn_worker(
            commands,
            WorkerConfig {
                concurrency: 2,
                ..WorkerConfig::for_queue("P")
            },
        );

        for _ in 0..6 {
            harness.client.send("P", "p.work", Value::Null).await.unwrap();
        }

        eventually(|| {
            let done = Arc::clone(&done);
            async move { done.load(Ordering::SeqCst) == 6 }
        })
        .await;
        assert_eq!(peak.load(Ordering::SeqCst), 2);

        harness.shutdown().await;
    }

    // =========================================================================
    // TTL
    // =========================================================================

    #[tokio::test]
    async fn test_queue_ttl_drops_stale_requests() {
        let mut harness = Harness::new().await;
        let broker = harness.broker.clone();
        let ttl = Duration::from_millis(50);
        broker
            .declare_queue("T", QueueOptions::work_queue(ttl))
            .await
            .unwrap();
        publish_request(&broker, "T", "count", Value::Null, "nobody").await;

        tokio::time::sleep(Duration::from_millis(100)).await;

        let counter = Arc::new(AtomicUsize::new(0));
        harness.spawn_worker(
            counting_commands("t", Arc::clone(&counter)),
            WorkerConfig {
                message_ttl: ttl,
                ..WorkerConfig::for_queue("T")
            },
        );

        eventually(|| {
            let broker = broker.clone();
            async move { broker.queue_stats("T").is_some_and(|s| s.expired == 1) }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_timed_out_request_is_never_executed() {
        let mut harness = Harness::new().await;
        let broker = harness.broker.clone();

        let err = harness
            .client
            .call("LATE", "count", Value::Null, Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));

        let counter = Arc::new(AtomicUsize::new(0));
        harness.spawn_worker(
            counting_commands("late", Arc::clone(&counter)),
            WorkerConfig::for_queue("LATE"),
        );

        eventually(|| {
            let broker = broker.clone();
            async move { broker.queue_stats("LATE").is_some_and(|s| s.expired == 1) }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        harness.shutdown().await;
    }
}
