/// Integration tests for the messaging bridge
///
/// These run real transports (FIFOs, shared-storage inboxes) against a temp
/// directory and a scripted container runtime, covering fallback, retry,
/// broadcast isolation, listener lifecycle and request/response correlation.
mod common;

use async_trait::async_trait;
use common::{eventually, test_config, ScriptedRuntime};
use parley_core::{
    Bridge, BridgeError, BridgeEvent, DeliveryDetail, ListenOptions, Message, MessageHandler,
    NamedPipeTransport, RequestOptions, RetryPolicy, SendOptions, SharedStorageTransport,
    StrategyKind, Transport,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::TryRecvError;

fn storage_only(identity: &str, root: &Path, runtime: Arc<ScriptedRuntime>) -> Bridge {
    let config = test_config(identity, root);
    let storage: Arc<dyn Transport> = Arc::new(SharedStorageTransport::new(&config));
    Bridge::builder(config)
        .runtime(runtime)
        .transports(vec![storage])
        .build()
        .unwrap()
}

async fn next_message(
    events: &mut tokio::sync::broadcast::Receiver<BridgeEvent>,
    within: Duration,
) -> Message {
    match tokio::time::timeout(within, events.recv()).await {
        Ok(Ok(BridgeEvent::Message(message))) => message,
        other => panic!("no message event: {other:?}"),
    }
}

/// Answers every request by echoing its data, or with an error for "fail".
struct Echo;

#[async_trait]
impl MessageHandler for Echo {
    async fn handle(&self, bridge: &Bridge, message: &Message) -> Result<(), String> {
        if !message.is_request() {
            return Ok(());
        }
        let data = message.payload.get("data").cloned().unwrap_or(Value::Null);
        let (result, error) = match message.action() {
            Some("fail") => (None, Some(json!({"code": 42, "message": "refused"}))),
            _ => (Some(data), None),
        };
        bridge
            .respond(message, result, error, &SendOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }

    fn name(&self) -> &str {
        "echo"
    }
}

#[tokio::test]
async fn test_falls_back_to_terminal_when_pipe_has_no_reader() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::with_running(&["bob"]));
    runtime.set_ps_output("    1 ?        tini\n   17 pts/3    bash\n");

    let bridge = Bridge::builder(test_config("alice", dir.path()))
        .runtime(runtime.clone())
        .build()
        .unwrap();

    let receipt = bridge
        .send("bob", "hello", &SendOptions::default())
        .await
        .unwrap();

    assert_eq!(receipt.strategy, StrategyKind::TerminalDevice);
    assert!(receipt.success);
    assert_eq!(
        receipt.detail,
        DeliveryDetail::Terminal {
            device: "/dev/pts/3".to_string()
        }
    );

    let writes = runtime.calls_to("sh");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].container, "bob");
    assert_eq!(writes[0].command[2], "cat > '/dev/pts/3'");
    let block = String::from_utf8(writes[0].input.clone().unwrap()).unwrap();
    assert!(block.contains("| hello\r\n"));
    assert!(block.contains("from alice to bob"));
}

#[tokio::test]
async fn test_forced_pipe_failure_is_not_masked() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());
    let bridge = Bridge::builder(test_config("alice", dir.path()))
        .runtime(runtime.clone())
        .build()
        .unwrap();

    let err = bridge
        .send("bob", "hello", &SendOptions::via(StrategyKind::NamedPipe))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        BridgeError::Delivery {
            strategy: StrategyKind::NamedPipe,
            ..
        }
    ));
    assert!(runtime.calls().is_empty());
}

#[tokio::test]
async fn test_pipe_delivery_to_live_listener() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());

    let config = test_config("bob", dir.path());
    let pipe: Arc<dyn Transport> = Arc::new(NamedPipeTransport::new(&config));
    let bob = Bridge::builder(config)
        .runtime(runtime.clone())
        .transports(vec![pipe])
        .build()
        .unwrap();
    let mut events = bob.subscribe();
    let listening = bob.listen("bob", &ListenOptions::default()).await.unwrap();
    assert_eq!(listening, vec![StrategyKind::NamedPipe]);

    let alice = Bridge::builder(test_config("alice", dir.path()))
        .runtime(runtime)
        .build()
        .unwrap();
    let receipt = alice
        .send("bob", json!({"text": "over the pipe"}), &SendOptions::default())
        .await
        .unwrap();
    assert_eq!(receipt.strategy, StrategyKind::NamedPipe);

    let message = next_message(&mut events, Duration::from_secs(2)).await;
    assert_eq!(message.from, "alice");
    assert_eq!(message.payload, json!({"text": "over the pipe"}));
    assert_eq!(message.id(), receipt.message_id);

    bob.shutdown().await;
}

#[tokio::test]
async fn test_retry_runs_whole_chain_each_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());
    runtime.fail_exec_with(1);

    let mut config = test_config("alice", dir.path());
    config.retry = RetryPolicy::new(3, Duration::from_millis(10));
    let exec: Arc<dyn Transport> = Arc::new(parley_core::ExecTransport::new(
        &config,
        runtime.clone(),
    ));
    let bridge = Bridge::builder(config)
        .runtime(runtime.clone())
        .transports(vec![exec])
        .build()
        .unwrap();

    let err = bridge
        .send("bob", "hello", &SendOptions::default())
        .await
        .unwrap_err();

    match err {
        BridgeError::AggregateDelivery {
            target,
            attempts,
            failures,
        } => {
            assert_eq!(target, "bob");
            assert_eq!(attempts, 3);
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].strategy, StrategyKind::Exec);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runtime.calls_to("sh").len(), 3);
}

#[tokio::test]
async fn test_unknown_target_is_not_attempted() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::with_running(&["alice"]));

    let mut config = test_config("alice", dir.path());
    config.runtime.verify_targets = true;
    let bridge = Bridge::builder(config)
        .runtime(runtime.clone())
        .build()
        .unwrap();

    let err = bridge
        .send("ghost", "boo", &SendOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, BridgeError::UnknownTarget(ref name) if name == "ghost"));
    assert!(runtime.calls().is_empty());
    assert!(!dir.path().join("messages").join("ghost").exists());
}

#[tokio::test]
async fn test_broadcast_isolates_failures() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::with_running(&["t1", "t3"]));

    let mut config = test_config("alice", dir.path());
    config.runtime.verify_targets = true;
    let storage: Arc<dyn Transport> = Arc::new(SharedStorageTransport::new(&config));
    let bridge = Bridge::builder(config)
        .runtime(runtime)
        .transports(vec![storage])
        .build()
        .unwrap();

    let targets = vec!["t1".to_string(), "t2".to_string(), "t3".to_string()];
    let report = bridge
        .broadcast(&targets, json!({"announce": "deploy"}), &SendOptions::default())
        .await
        .unwrap();

    assert_eq!(report.outcomes.len(), 3);
    assert!(report.get("t1").unwrap().is_delivered());
    assert!(report.get("t3").unwrap().is_delivered());
    assert!(matches!(
        report.get("t2").unwrap().result,
        Err(BridgeError::UnknownTarget(_))
    ));
    assert!(!report.all_delivered());
    assert_eq!(report.delivered().count(), 2);

    let receipts: Vec<_> = report
        .delivered()
        .map(|o| o.result.as_ref().unwrap().message_id.clone())
        .collect();
    assert_ne!(receipts[0], receipts[1]);
}

#[tokio::test]
async fn test_broadcast_running_skips_self() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::with_running(&["alice", "bob", "carol"]));
    let bridge = storage_only("alice", dir.path(), runtime);

    let report = bridge
        .broadcast_running("hi all", &SendOptions::default())
        .await
        .unwrap();

    let targets: Vec<_> = report.outcomes.iter().map(|o| o.target.as_str()).collect();
    assert_eq!(targets, vec!["bob", "carol"]);
    assert!(report.all_delivered());
}

#[tokio::test]
async fn test_request_response_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());

    let alice = storage_only("alice", dir.path(), runtime.clone());
    let bob = storage_only("bob", dir.path(), runtime);
    bob.on_message(Arc::new(Echo));
    alice.listen("alice", &ListenOptions::default()).await.unwrap();
    bob.listen("bob", &ListenOptions::default()).await.unwrap();

    let options = RequestOptions::with_timeout(Duration::from_secs(5));
    let structured = json!({"a": 1, "b": [2, 3]});
    let result = alice
        .request("bob", "echo", structured.clone(), &options)
        .await
        .unwrap();
    assert_eq!(result, structured);

    let text = alice
        .request("bob", "echo", json!("plain string"), &options)
        .await
        .unwrap();
    assert_eq!(text, json!("plain string"));
    assert_eq!(alice.pending_count(), 0);

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_remote_error_rejects_request() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());

    let alice = storage_only("alice", dir.path(), runtime.clone());
    let bob = storage_only("bob", dir.path(), runtime);
    bob.on_message(Arc::new(Echo));
    alice.listen("alice", &ListenOptions::default()).await.unwrap();
    bob.listen("bob", &ListenOptions::default()).await.unwrap();

    let err = alice
        .request(
            "bob",
            "fail",
            Value::Null,
            &RequestOptions::with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap_err();

    match err {
        BridgeError::Remote(value) => assert_eq!(value["code"], 42),
        other => panic!("unexpected error: {other}"),
    }

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_request_times_out_without_responder() {
    let dir = tempfile::tempdir().unwrap();
    let alice = storage_only("alice", dir.path(), Arc::new(ScriptedRuntime::new()));

    let started = Instant::now();
    let err = alice
        .request(
            "bob",
            "ping",
            Value::Null,
            &RequestOptions::with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, BridgeError::Timeout { .. }));
    assert!(elapsed >= Duration::from_millis(95), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    assert_eq!(alice.pending_count(), 0);
}

#[tokio::test]
async fn test_request_timeout_not_delayed_by_slow_strategy() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config("alice", dir.path());
    // Nobody reads bob's pipe, so the first strategy spins for 400ms.
    config.pipe.open_timeout_ms = 400;
    let transports: Vec<Arc<dyn Transport>> = vec![
        Arc::new(NamedPipeTransport::new(&config)),
        Arc::new(SharedStorageTransport::new(&config)),
    ];
    let alice = Bridge::builder(config)
        .runtime(Arc::new(ScriptedRuntime::new()))
        .transports(transports)
        .build()
        .unwrap();

    let started = Instant::now();
    let err = alice
        .request(
            "bob",
            "ping",
            Value::Null,
            &RequestOptions::with_timeout(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, BridgeError::Timeout { .. }), "{err}");
    assert!(elapsed < Duration::from_millis(250), "{elapsed:?}");
    assert_eq!(alice.pending_count(), 0);
    alice.shutdown().await;
}

#[tokio::test]
async fn test_late_response_is_dropped_quietly() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());
    let alice = storage_only("alice", dir.path(), runtime.clone());
    let bob = storage_only("bob", dir.path(), runtime);
    let mut events = alice.subscribe();
    alice.listen("alice", &ListenOptions::default()).await.unwrap();

    let options = RequestOptions {
        request_id: Some("late-1".to_string()),
        timeout: Some(Duration::from_millis(100)),
        ..RequestOptions::default()
    };
    let err = alice
        .request("bob", "ping", Value::Null, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Timeout { .. }));

    // Bob finally answers the request that is sitting in his inbox.
    let request = Message::request("late-1", "alice", "bob", "ping", Value::Null);
    let response = Message::response_to(&request, "bob", Some(json!("too late")), None).unwrap();
    bob.send_message("alice", &response, &SendOptions::default())
        .await
        .unwrap();

    let inbox = dir.path().join("messages").join("alice");
    assert!(
        eventually(Duration::from_secs(2), || {
            std::fs::read_dir(&inbox).map(|d| d.count() == 0).unwrap_or(false)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(alice.pending_count(), 0);

    // The bridge is still healthy afterwards.
    bob.send("alice", "still here", &SendOptions::default())
        .await
        .unwrap();
    let message = next_message(&mut events, Duration::from_secs(2)).await;
    assert_eq!(message.payload, json!("still here"));

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_request_id_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let alice = storage_only("alice", dir.path(), Arc::new(ScriptedRuntime::new()));

    let options = RequestOptions {
        request_id: Some("req-fixed".to_string()),
        timeout: Some(Duration::from_secs(10)),
        ..RequestOptions::default()
    };

    let first = {
        let alice = alice.clone();
        let options = options.clone();
        tokio::spawn(async move { alice.request("bob", "ping", Value::Null, &options).await })
    };
    assert!(eventually(Duration::from_secs(2), || alice.pending_count() == 1).await);

    let err = alice
        .request("bob", "ping", Value::Null, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::DuplicateRequestId(ref id) if id == "req-fixed"));
    assert_eq!(alice.pending_count(), 1);

    alice.shutdown().await;
    assert!(matches!(
        first.await.unwrap(),
        Err(BridgeError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_respond_requires_request() {
    let dir = tempfile::tempdir().unwrap();
    let bob = storage_only("bob", dir.path(), Arc::new(ScriptedRuntime::new()));

    let plain = Message::new("alice", "bob", "not a request");
    let err = bob
        .respond(&plain, Some(json!(1)), None, &SendOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::NotARequest(_)));
}

#[tokio::test]
async fn test_stop_is_idempotent_and_silences_listeners() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(ScriptedRuntime::new());
    let alice = storage_only("alice", dir.path(), runtime.clone());
    let bob = storage_only("bob", dir.path(), runtime);

    let mut events = bob.subscribe();
    bob.listen("bob", &ListenOptions::default()).await.unwrap();
    // A second listen reuses the running listener.
    bob.listen("bob", &ListenOptions::default()).await.unwrap();
    assert_eq!(
        bob.active_listeners().await,
        vec![(StrategyKind::SharedStorage, "bob".to_string())]
    );

    alice
        .send("bob", "before stop", &SendOptions::default())
        .await
        .unwrap();
    let message = next_message(&mut events, Duration::from_secs(2)).await;
    assert_eq!(message.payload, json!("before stop"));

    bob.stop().await;
    bob.stop().await;
    assert!(bob.active_listeners().await.is_empty());

    alice
        .send("bob", "after stop", &SendOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));

    // The undelivered message is still waiting in the inbox.
    let inbox = dir.path().join("messages").join("bob");
    assert_eq!(std::fs::read_dir(inbox).unwrap().count(), 1);
}

#[tokio::test]
async fn test_listen_on_send_only_strategy_fails() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = Bridge::builder(test_config("alice", dir.path()))
        .runtime(Arc::new(ScriptedRuntime::new()))
        .build()
        .unwrap();

    let err = bridge
        .listen(
            "alice",
            &ListenOptions::only([StrategyKind::TerminalDevice, StrategyKind::Exec]),
        )
        .await
        .unwrap_err();
    assert!(err.is_capability());
    assert!(bridge.active_listeners().await.is_empty());
}

#[tokio::test]
async fn test_listen_rejects_malformed_identity() {
    let dir = tempfile::tempdir().unwrap();
    let bridge = storage_only("alice", dir.path(), Arc::new(ScriptedRuntime::new()));

    let err = bridge
        .listen("../escape", &ListenOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidTarget(_)));
    assert!(!dir.path().join("escape").exists());
}

#[tokio::test]
async fn test_shutdown_rejects_pending_requests() {
    let dir = tempfile::tempdir().unwrap();
    let alice = storage_only("alice", dir.path(), Arc::new(ScriptedRuntime::new()));
    alice.listen("alice", &ListenOptions::default()).await.unwrap();

    let waiting: Vec<_> = (0..3)
        .map(|i| {
            let alice = alice.clone();
            tokio::spawn(async move {
                alice
                    .request(
                        "bob",
                        &format!("job-{i}"),
                        Value::Null,
                        &RequestOptions::with_timeout(Duration::from_secs(30)),
                    )
                    .await
            })
        })
        .collect();
    assert!(eventually(Duration::from_secs(2), || alice.pending_count() == 3).await);

    alice.shutdown().await;
    alice.shutdown().await;

    for handle in waiting {
        assert!(matches!(handle.await.unwrap(), Err(BridgeError::ShuttingDown)));
    }
    assert_eq!(alice.pending_count(), 0);
    assert!(alice.active_listeners().await.is_empty());
    assert!(matches!(
        alice.send("bob", "late", &SendOptions::default()).await,
        Err(BridgeError::ShuttingDown)
    ));
}
