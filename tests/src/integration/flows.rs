//! # End-to-End Tunnel Flows
//!
//! Public caller → broker `/forward` → WebSocket tunnel → worker → back.
//!
//! ## Flows Tested:
//!
//! 1. **Round trip**: an envelope reaches the worker and its reply is replayed
//! 2. **Local replay**: `HttpForwardHandler` against a real local HTTP service
//! 3. **Correlation**: concurrent requests answered out of order
//! 4. **Failure paths**: worker errors, stalls, disconnects and shutdowns

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_tungstenite::tungstenite::Message;

    use crate::integration::harness::{
        broker_config, start_local_service, worker_config, RunningBroker, RunningWorker, WAIT,
    };
    use tunnel_broker::RequestId;
    use tunnel_worker::{HttpForwardHandler, RequestHandler, WorkerEvent};

    // =============================================================================
    // TEST HANDLERS
    // =============================================================================

    /// Replies 200 with the received envelope under `echo`
    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _request_id: RequestId, payload: Value) -> Result<Value, String> {
            Ok(json!({"status_code": 200, "body": {"echo": payload}}))
        }
    }

    /// Replies with a fixed text body
    struct Labelled(&'static str);

    #[async_trait]
    impl RequestHandler for Labelled {
        async fn handle(&self, _request_id: RequestId, _payload: Value) -> Result<Value, String> {
            Ok(json!({"status_code": 200, "body": self.0}))
        }
    }

    struct Failing;

    #[async_trait]
    impl RequestHandler for Failing {
        async fn handle(&self, _request_id: RequestId, _payload: Value) -> Result<Value, String> {
            Err("local service refused".into())
        }
    }

    /// Earlier requests (smaller `n`) take longer
    struct Staggered;

    #[async_trait]
    impl RequestHandler for Staggered {
        async fn handle(&self, _request_id: RequestId, payload: Value) -> Result<Value, String> {
            let n = payload["body"]["n"].as_u64().ok_or("missing n")?;
            tokio::time::sleep(Duration::from_millis((10 - n) * 15)).await;
            Ok(json!({"n": n}))
        }
    }

    struct Stalled;

    #[async_trait]
    impl RequestHandler for Stalled {
        async fn handle(&self, _request_id: RequestId, _payload: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Value::Null)
        }
    }

    // =============================================================================
    // ROUND TRIPS
    // =============================================================================

    #[tokio::test]
    async fn test_forward_roundtrip_over_websocket() {
        let broker = RunningBroker::start(broker_config()).await;
        let worker = RunningWorker::start(
            worker_config(&broker).with_metadata("addr", "10.0.0.5"),
            Arc::new(Echo),
        )
        .await;
        assert_eq!(worker.worker_id.as_str(), "w1");

        let response = reqwest::Client::new()
            .post(broker.url("/forward/api/items?page=2"))
            .json(&json!({"name": "widget"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let body: Value = response.json().await.unwrap();
        let echo = &body["echo"];
        assert_eq!(echo["method"], "POST");
        assert_eq!(echo["path"], "/api/items");
        assert_eq!(echo["query"]["page"], "2");
        assert_eq!(echo["body"], json!({"name": "widget"}));

        let workers: Value = reqwest::get(broker.url("/workers"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(workers["workers"][0]["metadata"]["addr"], "10.0.0.5");

        worker.stop().await.unwrap();
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_http_forward_handler_replays_against_local_service() {
        let local = start_local_service(Router::new().route(
            "/hooks",
            post(|Json(body): Json<Value>| async move {
                (
                    StatusCode::CREATED,
                    [("x-local", "yes")],
                    Json(json!({"received": body})),
                )
            }),
        ))
        .await;

        let broker = RunningBroker::start(broker_config()).await;
        let handler =
            HttpForwardHandler::new(format!("http://{local}"), Duration::from_secs(5)).unwrap();
        let worker = RunningWorker::start(worker_config(&broker), Arc::new(handler)).await;

        let response = reqwest::Client::new()
            .post(broker.url("/forward/hooks"))
            .json(&json!({"event": "message"}))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::CREATED);
        assert_eq!(response.headers()["x-local"], "yes");
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["received"], json!({"event": "message"}));

        worker.stop().await.unwrap();
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_requests_are_correlated() {
        let broker = RunningBroker::start(broker_config()).await;
        let worker = RunningWorker::start(worker_config(&broker), Arc::new(Staggered)).await;

        let client = reqwest::Client::new();
        let calls = (0..10u64).map(|n| {
            let client = client.clone();
            let url = broker.url("/forward/work");
            async move {
                let response = client.post(url).json(&json!({"n": n})).send().await.unwrap();
                let body: Value = response.json().await.unwrap();
                (n, body["n"].as_u64())
            }
        });

        for (sent, answered) in futures::future::join_all(calls).await {
            assert_eq!(answered, Some(sent));
        }
        assert_eq!(broker.pending_count(), 0);

        worker.stop().await.unwrap();
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_target_selection_headers() {
        let broker = RunningBroker::start(broker_config()).await;
        let first = RunningWorker::start(worker_config(&broker), Arc::new(Labelled("first"))).await;
        let second =
            RunningWorker::start(worker_config(&broker), Arc::new(Labelled("second"))).await;

        let client = reqwest::Client::new();
        let ask = |target: Option<String>| {
            let mut request = client.get(broker.url("/forward/who"));
            if let Some(target) = target {
                request = request.header("x-tunnel-worker", target);
            }
            async move { request.send().await.unwrap().text().await.unwrap() }
        };

        assert_eq!(ask(None).await, "first");
        assert_eq!(ask(Some("latest".into())).await, "second");
        assert_eq!(ask(Some(first.worker_id.to_string())).await, "first");
        assert_eq!(ask(Some(second.worker_id.to_string())).await, "second");

        first.stop().await.unwrap();
        second.stop().await.unwrap();
        broker.stop().await;
    }

    // =============================================================================
    // FAILURE PATHS
    // =============================================================================

    #[tokio::test]
    async fn test_worker_error_is_bad_gateway() {
        let broker = RunningBroker::start(broker_config()).await;
        let worker = RunningWorker::start(worker_config(&broker), Arc::new(Failing)).await;

        let response = reqwest::get(broker.url("/forward/x")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);

        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error"], "worker_error");
        assert_eq!(body["message"], "local service refused");

        worker.stop().await.unwrap();
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_stalled_worker_times_out() {
        let broker = RunningBroker::start(broker_config()).await;
        let worker = RunningWorker::start(worker_config(&broker), Arc::new(Stalled)).await;

        let response = reqwest::Client::new()
            .get(broker.url("/forward/slow"))
            .header("x-tunnel-timeout-ms", "100")
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(broker.pending_count(), 0);
        // A timeout does not cost the worker its registration
        assert_eq!(broker.worker_count(), 1);

        worker.stop().await.unwrap();
        broker.stop().await;
    }

    #[tokio::test]
    async fn test_worker_shutdown_deregisters() {
        let broker = RunningBroker::start(broker_config()).await;
        let worker = RunningWorker::start(worker_config(&broker), Arc::new(Echo)).await;
        broker.wait_for_workers(1).await;

        worker.stop().await.unwrap();
        broker.wait_for_workers(0).await;

        let response = reqwest::get(broker.url("/forward/x")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_broker_shutdown_disconnects_worker() {
        let broker = RunningBroker::start(broker_config()).await;
        let mut worker = RunningWorker::start(worker_config(&broker), Arc::new(Echo)).await;

        broker.stop().await;

        let event = tokio::time::timeout(WAIT, worker.events.recv()).await.unwrap();
        assert_eq!(event, Some(WorkerEvent::Disconnected));

        // Reconnect attempts fail against the stopped broker until shutdown
        worker.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_reconnects_to_restarted_channel() {
        let broker = RunningBroker::start(broker_config()).await;
        let mut worker = RunningWorker::start(worker_config(&broker), Arc::new(Echo)).await;
        let first_id = worker.worker_id.clone();

        // Force-close the channel from the broker side
        let (_, handle) = broker
            .service
            .state()
            .registry()
            .pick_available(&tunnel_broker::TargetSelector::Worker(first_id.clone()))
            .unwrap();
        handle.close();

        let second_id = worker.next_registration().await;
        assert_ne!(first_id, second_id);
        broker.wait_for_workers(1).await;

        let response = reqwest::get(broker.url("/forward/again")).await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);

        worker.stop().await.unwrap();
        broker.stop().await;
    }

    // =============================================================================
    // RAW PROTOCOL
    // =============================================================================

    #[tokio::test]
    async fn test_raw_register_handshake() {
        let broker = RunningBroker::start(broker_config()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(broker.tunnel_url())
            .await
            .unwrap();

        let register = json!({"type": "register", "metadata": {"region": "lab"}});
        ws.send(Message::Text(register.to_string())).await.unwrap();

        let ack = match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text).unwrap(),
            other => panic!("expected register_ack, got {other:?}"),
        };
        assert_eq!(ack["type"], "register_ack");
        assert!(ack["worker_id"].as_str().unwrap().starts_with('w'));
        broker.wait_for_workers(1).await;

        ws.send(Message::Text(json!({"type": "heartbeat"}).to_string()))
            .await
            .unwrap();
        let reply = match tokio::time::timeout(WAIT, ws.next()).await.unwrap() {
            Some(Ok(Message::Text(text))) => serde_json::from_str::<Value>(&text).unwrap(),
            other => panic!("expected heartbeat_ack, got {other:?}"),
        };
        assert_eq!(reply["type"], "heartbeat_ack");

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_raw_channel_closed_without_register() {
        let broker = RunningBroker::start(broker_config()).await;
        let (mut ws, _) = tokio_tungstenite::connect_async(broker.tunnel_url())
            .await
            .unwrap();

        ws.send(Message::Text(json!({"type": "heartbeat"}).to_string()))
            .await
            .unwrap();

        let next = tokio::time::timeout(WAIT, ws.next()).await.unwrap();
        assert!(
            !matches!(next, Some(Ok(Message::Text(_)))),
            "expected the channel to close, got {next:?}"
        );
        assert_eq!(broker.worker_count(), 0);

        broker.stop().await;
    }
}
