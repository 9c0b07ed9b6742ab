//! # RPC Round Trips
//!
//! Client → work queue → worker → reply queue → client, end to end.

#[cfg(test)]
mod tests {
    use crate::harness::{eventually, scripted_commands, Harness};
    use rpc_gateway::RpcError;
    use serde::{Deserialize, Serialize};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use tokio_test::assert_ok;
    use worker_runtime::{CommandRegistry, WorkerConfig};

    const TIMEOUT: Option<Duration> = Some(Duration::from_secs(5));

    // =========================================================================
    // HEALTH AND TYPED CALLS
    // =========================================================================

    #[tokio::test]
    async fn test_echo_health_round_trip() {
        let mut harness = Harness::new().await;
        harness.spawn_worker(
            CommandRegistry::builder("echo").build().unwrap(),
            WorkerConfig::for_queue("H"),
        );

        let reply = assert_ok!(
            harness
                .client
                .call("H", "echo.health", json!({}), TIMEOUT)
                .await
        );
        assert_eq!(reply, json!({"status": "ok"}));
        assert_eq!(harness.client.pending_count(), 0);

        harness.shutdown().await;
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Sum {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Total {
        total: i64,
    }

    #[tokio::test]
    async fn test_typed_call() {
        let mut harness = Harness::new().await;
        let commands = CommandRegistry::builder("calc")
            .command_typed("calc.sum", |req: Sum, _ctx| async move {
                Ok(Total { total: req.a + req.b })
            })
            .build()
            .unwrap();
        harness.spawn_worker(commands, WorkerConfig::for_queue("CALC"));

        let total: Total = harness
            .client
            .call_typed("CALC", "calc.sum", &Sum { a: 2, b: 40 }, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(total, Total { total: 42 });

        // payload the handler cannot decode is a 400 from the worker
        let err = harness
            .client
            .call("CALC", "calc.sum", json!({"a": "two"}), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: 400, .. }));

        harness.shutdown().await;
    }

    // =========================================================================
    // FAILURE REPLIES
    // =========================================================================

    #[tokio::test]
    async fn test_handler_error_reaches_caller() {
        let mut harness = Harness::new().await;
        harness.spawn_worker(scripted_commands("order"), WorkerConfig::for_queue("ORDER"));

        let err = harness
            .client
            .call("ORDER", "conflict", Value::Null, TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RpcError::Remote {
                code: 409,
                message: "already exists".into()
            }
        );
        assert_eq!(err.status_code(), 409);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_command_is_501() {
        let mut harness = Harness::new().await;
        harness.spawn_worker(scripted_commands("order"), WorkerConfig::for_queue("ORDER"));

        let err = harness
            .client
            .call("ORDER", "order.refund", Value::Null, TIMEOUT)
            .await
            .unwrap_err();
        match err {
            RpcError::Remote { code, message } => {
                assert_eq!(code, 501);
                assert!(message.contains("order.refund"));
            }
            other => panic!("expected remote error, got {other:?}"),
        }

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_panic_is_500_and_worker_survives() {
        let mut harness = Harness::new().await;
        harness.spawn_worker(scripted_commands("order"), WorkerConfig::for_queue("ORDER"));

        let err = harness
            .client
            .call("ORDER", "explode", json!({"boom": true}), TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Remote { code: 500, .. }));

        let reply = harness
            .client
            .call("ORDER", "order.health", Value::Null, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(reply["status"], "ok");

        harness.shutdown().await;
    }

    // =========================================================================
    // CONCURRENCY
    // =========================================================================

    #[tokio::test]
    async fn test_out_of_order_replies_reach_their_callers() {
        let mut harness = Harness::new().await;
        harness.spawn_worker(scripted_commands("slow"), WorkerConfig::for_queue("SLOW"));
        let client = harness.client.clone();

        let started = Instant::now();
        let slow = {
            let client = client.clone();
            tokio::spawn(async move {
                let reply = client
                    .call("SLOW", "sleep", json!({"delay_ms": 300, "tag": "A"}), TIMEOUT)
                    .await;
                (reply, started.elapsed())
            })
        };
        // make sure A is published first
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fast = {
            let client = client.clone();
            tokio::spawn(async move {
                let reply = client
                    .call("SLOW", "sleep", json!({"delay_ms": 10, "tag": "B"}), TIMEOUT)
                    .await;
                (reply, started.elapsed())
            })
        };

        let (a, a_elapsed) = slow.await.unwrap();
        let (b, b_elapsed) = fast.await.unwrap();

        assert_eq!(a.unwrap(), json!({"tag": "A"}));
        assert_eq!(b.unwrap(), json!({"tag": "B"}));
        assert!(b_elapsed < a_elapsed, "B should complete before A");
        assert_eq!(client.pending_count(), 0);

        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_many_concurrent_calls() {
        let mut harness = Harness::new().await;
        harness.spawn_worker(scripted_commands("slow"), WorkerConfig::for_queue("SLOW"));

        let calls = (0..50).map(|i| {
            let client = harness.client.clone();
            tokio::spawn(async move {
                client
                    .call("SLOW", "sleep", json!({"delay_ms": 1, "tag": i}), TIMEOUT)
                    .await
            })
        });
        let handles: Vec<_> = calls.collect();

        for (i, handle) in handles.into_iter().enumerate() {
            let reply = handle.await.unwrap().unwrap();
            assert_eq!(reply, json!({"tag": i}));
        }
        assert_eq!(harness.client.pending_count(), 0);

        harness.shutdown().await;
    }

    // =========================================================================
    // FIRE AND FORGET
    // =========================================================================

    #[tokio::test]
    async fn test_notification_runs_without_reply() {
        let mut harness = Harness::new().await;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let commands = CommandRegistry::builder("audit")
            .command_fn("audit.record", move |_, _| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
            .build()
            .unwrap();
        harness.spawn_worker(commands, WorkerConfig::for_queue("AUDIT"));

        assert_ok!(
            harness
                .client
                .send("AUDIT", "audit.record", json!({"event": "login"}))
                .await
        );

        eventually(|| {
            let broker = harness.broker.clone();
            async move { broker.queue_stats("AUDIT").is_some_and(|s| s.acked == 1) }
        })
        .await;
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(harness.client.pending_count(), 0);
        assert_eq!(harness.client.registry().stats().registered.load(Ordering::SeqCst), 0);

        harness.shutdown().await;
    }
}
