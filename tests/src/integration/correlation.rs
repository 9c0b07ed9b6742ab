//! # Correlation Guarantees
//!
//! Every pending call leaves the registry exactly once: fulfilled, expired,
//! cancelled or failed. Duplicate and late replies are discarded.

#[cfg(test)]
mod tests {
    use crate::harness::{eventually, FlakyBroker, Harness};
    use rpc_gateway::{CallOutcome, CorrelationRegistry, FulfillOutcome, RpcError};
    use serde_json::{json, Value};
    use shared_bus::{ConsumerOptions, InMemoryBroker, Message, MessageBroker};
    use shared_types::{ErrorBody, ReplyEnvelope, WorkEnvelope};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use worker_runtime::{CommandRegistry, WorkerConfig};

    // =========================================================================
    // EXACTLY-ONCE FULFILLMENT
    // =========================================================================

    #[tokio::test]
    async fn test_second_fulfillment_is_discarded() {
        let registry = CorrelationRegistry::new_shared();
        let call = registry.register("ORDER", "order.get", Duration::from_secs(5));
        let id = call.correlation_id().clone();

        assert_eq!(
            registry.fulfill(&id, Ok(json!("first"))),
            FulfillOutcome::Fulfilled
        );
        assert_eq!(
            registry.fulfill(&id, Err(ErrorBody::new(500, "second"))),
            FulfillOutcome::Discarded
        );

        match registry.wait(call).await {
            CallOutcome::Reply(Ok(value)) => assert_eq!(value, json!("first")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(registry.pending_count(), 0);
        assert_eq!(registry.stats().discarded.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_fulfillments_have_one_winner() {
        for _ in 0..100 {
            let registry = CorrelationRegistry::new_shared();
            let call = registry.register("ORDER", "order.get", Duration::from_secs(5));
            let id = call.correlation_id().clone();

            let racers: Vec<_> = (0..8)
                .map(|i| {
                    let registry = Arc::clone(&registry);
                    let id = id.clone();
                    tokio::spawn(async move { registry.fulfill(&id, Ok(json!(i))) })
                })
                .collect();

            let mut winners = 0;
            for racer in racers {
                if racer.await.unwrap() == FulfillOutcome::Fulfilled {
                    winners += 1;
                }
            }
            assert_eq!(winners, 1);
            assert!(matches!(registry.wait(call).await, CallOutcome::Reply(Ok(_))));
        }
    }

    /// A worker that answers twice: the caller sees the first answer, the
    /// second is dropped by the reply listener.
    #[tokio::test]
    async fn test_duplicate_reply_over_broker() {
        let harness = Harness::new().await;
        let broker = harness.broker.clone();
        broker
            .declare_queue("DUP", shared_bus::QueueOptions::default())
            .await
            .unwrap();
        let mut work = broker
            .consume("DUP", ConsumerOptions::default())
            .await
            .unwrap();

        let responder = tokio::spawn(async move {
            let delivery = work.recv().await.unwrap();
            let envelope = WorkEnvelope::from_slice(delivery.body()).unwrap();
            let reply_to = envelope.reply_to.clone().unwrap();
            for answer in ["one", "two"] {
                let reply = ReplyEnvelope::success(envelope.correlation_id.clone(), json!(answer));
                broker
                    .publish(&reply_to, Message::json(&reply).unwrap())
                    .await
                    .unwrap();
            }
            delivery.ack().await.unwrap();
        });

        let reply = harness
            .client
            .call("DUP", "dup.get", Value::Null, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply, json!("one"));
        responder.await.unwrap();

        let registry = Arc::clone(harness.client.registry());
        eventually(|| {
            let registry = Arc::clone(&registry);
            async move { registry.stats().discarded.load(Ordering::SeqCst) == 1 }
        })
        .await;
        assert_eq!(harness.client.pending_count(), 0);

        harness.shutdown().await;
    }

    // =========================================================================
    // NO LEAKED REGISTRATIONS
    // =========================================================================

    #[tokio::test]
    async fn test_publish_failure_leaves_no_registration() {
        let flaky = FlakyBroker::new(InMemoryBroker::new());
        flaky.fail_publishes_to("BROKEN");
        let mut harness = Harness::with_flaky(flaky.clone()).await;

        let err = harness
            .client
            .call("BROKEN", "broken.get", Value::Null, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();

        assert!(matches!(err, RpcError::Transport(_)));
        assert_eq!(err.status_code(), 502);
        assert_eq!(harness.client.pending_count(), 0);
        let stats = harness.client.registry().stats();
        assert_eq!(stats.registered.load(Ordering::SeqCst), 1);
        assert_eq!(stats.cancelled.load(Ordering::SeqCst), 1);

        // once publishes go through again the same client recovers
        flaky.heal();
        harness.spawn_worker(
            CommandRegistry::builder("broken").build().unwrap(),
            WorkerConfig::for_queue("BROKEN"),
        );
        let reply = harness
            .client
            .call("BROKEN", "broken.health", Value::Null, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply["status"], "ok");
        assert_eq!(harness.client.pending_count(), 0);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_abandoned_call_is_removed() {
        let harness = Harness::new().await;

        // nobody consumes SILENT; the caller gives up first
        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            harness
                .client
                .call("SILENT", "silent.get", Value::Null, Some(Duration::from_secs(5))),
        )
        .await;

        assert!(abandoned.is_err());
        assert_eq!(harness.client.pending_count(), 0);

        harness.shutdown().await;
    }

    // =========================================================================
    // TIMEOUTS
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_at_deadline() {
        let harness = Harness::new().await;
        let timeout = Duration::from_millis(100);

        let started = Instant::now();
        let err = harness
            .client
            .call("SILENT", "silent.get", Value::Null, Some(timeout))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert_eq!(err, RpcError::Timeout { timeout });
        assert_eq!(err.status_code(), 504);
        assert!(elapsed >= timeout, "fired early: {elapsed:?}");
        assert!(
            elapsed <= timeout + Duration::from_millis(5),
            "fired late: {elapsed:?}"
        );
        assert_eq!(harness.client.pending_count(), 0);
        assert_eq!(
            harness.client.registry().stats().expired.load(Ordering::SeqCst),
            1
        );

        harness.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_after_timeout_is_discarded() {
        let harness = Harness::new().await;
        let registry = Arc::clone(harness.client.registry());
        let broker = harness.broker.clone();

        broker
            .declare_queue("LATE", shared_bus::QueueOptions::default())
            .await
            .unwrap();
        let mut work = broker
            .consume("LATE", ConsumerOptions::default())
            .await
            .unwrap();

        // the worker takes the request at once but answers only when told
        let (answer_tx, answer_rx) = tokio::sync::oneshot::channel::<()>();
        let worker_broker = broker.clone();
        let slow_worker = tokio::spawn(async move {
            let delivery = work.recv().await.unwrap();
            let envelope = WorkEnvelope::from_slice(delivery.body()).unwrap();
            answer_rx.await.unwrap();
            let reply = ReplyEnvelope::success(envelope.correlation_id.clone(), json!("too late"));
            worker_broker
                .publish(
                    envelope.reply_to.as_deref().unwrap(),
                    Message::json(&reply).unwrap(),
                )
                .await
                .unwrap();
            delivery.ack().await.unwrap();
        });

        let err = harness
            .client
            .call("LATE", "late.get", Value::Null, Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        answer_tx.send(()).unwrap();
        slow_worker.await.unwrap();

        eventually(|| {
            let registry = Arc::clone(&registry);
            async move { registry.stats().discarded.load(Ordering::SeqCst) == 1 }
        })
        .await;
        assert_eq!(registry.pending_count(), 0);

        harness.shutdown().await;
    }
}
