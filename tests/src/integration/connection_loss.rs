//! # Connection Loss
//!
//! Losing the broker connection fails every waiting call with a transport
//! error instead of leaving it to time out. Workers and the reply listener
//! re-subscribe once the connection is back.

#[cfg(test)]
mod tests {
    use crate::harness::{eventually, Harness};
    use rpc_gateway::RpcError;
    use serde_json::Value;
    use std::sync::atomic::Ordering;
    use std::time::Duration;
    use worker_runtime::{CommandRegistry, WorkerConfig};

    #[tokio::test]
    async fn test_waiting_call_fails_with_transport_error() {
        let harness = Harness::new().await;
        let client = harness.client.clone();

        let waiting = tokio::spawn(async move {
            client
                .call("SILENT", "silent.get", Value::Null, Some(Duration::from_secs(10)))
                .await
        });
        eventually(|| {
            let client = harness.client.clone();
            async move { client.pending_count() == 1 }
        })
        .await;

        harness.broker.disconnect();

        let err = tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("call fails promptly")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)), "got {err:?}");
        assert_eq!(err.status_code(), 502);
        assert_eq!(harness.client.pending_count(), 0);
        assert_eq!(
            harness.client.registry().stats().failed.load(Ordering::SeqCst),
            1
        );

        harness.broker.reconnect();
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails_fast() {
        let harness = Harness::new().await;
        harness.broker.disconnect();

        let err = harness
            .client
            .call("ORDER", "order.get", Value::Null, Some(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
        assert_eq!(harness.client.pending_count(), 0);

        harness.broker.reconnect();
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn test_calls_succeed_again_after_reconnect() {
        let mut harness = Harness::new().await;
        harness.spawn_worker(
            CommandRegistry::builder("echo").build().unwrap(),
            WorkerConfig::for_queue("H"),
        );

        let reply = harness
            .client
            .call("H", "echo.health", Value::Null, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(reply["status"], "ok");

        harness.broker.disconnect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.broker.reconnect();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let attempt = harness
                .client
                .call("H", "echo.health", Value::Null, Some(Duration::from_millis(250)))
                .await;
            match attempt {
                Ok(reply) => {
                    assert_eq!(reply["status"], "ok");
                    break;
                }
                Err(e) => {
                    assert!(
                        tokio::time::Instant::now() < deadline,
                        "no recovery within 5s, last error: {e}"
                    );
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        assert_eq!(harness.client.pending_count(), 0);

        harness.shutdown().await;
    }
}
