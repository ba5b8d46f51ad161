//! Request/response tests against real `sh` workers

#![cfg(unix)]

mod common;

use agentlink::{ClientError, ClientEvent, RpcClient, WorkerState};
use common::{mock_worker, sh_options, write_script};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

async fn started_mock() -> (tempfile::TempDir, RpcClient) {
    let (dir, options) = mock_worker();
    let client = RpcClient::new(options);
    client.start().await.unwrap();
    (dir, client)
}

#[tokio::test]
async fn test_ping_returns_pong() {
    let (_dir, client) = started_mock().await;
    let result = client
        .call_with_timeout("ping", None, Duration::from_millis(1000))
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
    assert_eq!(client.ping().await.unwrap(), "pong");
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_echo_params_round_trip() {
    let (_dir, client) = started_mock().await;
    let params = json!({"sheet": "Données", "cells": [[1, 2], [3, 4]], "ok": true});
    let result = client.call("echo", Some(params.clone())).await.unwrap();
    assert_eq!(result, params);
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_rpc_error_passed_through() {
    let (_dir, client) = started_mock().await;

    match client.call("fail", None).await {
        Err(ClientError::Rpc(err)) => {
            assert_eq!(err.code, -32000);
            assert_eq!(err.message, "Execution failed: fail");
        }
        other => panic!("Expected Rpc error, got {:?}", other),
    }
    match client.call("no_such_method", None).await {
        Err(ClientError::Rpc(err)) => {
            assert_eq!(err.code, -32601);
            assert_eq!(err.message, "Method not found: no_such_method");
        }
        other => panic!("Expected Rpc error, got {:?}", other),
    }
    // The connection survives worker-side errors
    assert_eq!(client.ping().await.unwrap(), "pong");
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_is_isolated() {
    let (_dir, client) = started_mock().await;

    let started = Instant::now();
    let (slow, fast) = tokio::join!(
        client.call_with_timeout("slow_echo", Some(json!({"x": 1})), Duration::from_millis(50)),
        client.call_with_timeout("ping", None, Duration::from_secs(2)),
    );

    match slow {
        Err(ClientError::Timeout { method, timeout }) => {
            assert_eq!(method, "slow_echo");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("Expected Timeout, got {:?}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(fast.unwrap(), "pong");

    // A timed-out call leaves the worker usable
    assert_eq!(client.state(), WorkerState::Ready);
    assert_eq!(client.ping().await.unwrap(), "pong");
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_scrambled_responses_reach_their_callers() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "reverse.sh",
        r#"
ready
IFS= read -r l1
IFS= read -r l2
IFS= read -r l3
for line in "$l3" "$l1" "$l2"; do
  id=$(id_of "$line")
  n=$(printf '%s' "$line" | sed -n 's/.*"params":{"n":\([0-9]*\)}.*/\1/p')
  printf '{"jsonrpc":"2.0","id":%s,"result":{"n":%s}}\n' "$id" "$n"
done
while IFS= read -r line; do :; done
"#,
    );
    let client = RpcClient::new(sh_options(&script));
    client.start().await.unwrap();

    let (a, b, c) = tokio::join!(
        client.call("work", Some(json!({"n": 1}))),
        client.call("work", Some(json!({"n": 2}))),
        client.call("work", Some(json!({"n": 3}))),
    );
    assert_eq!(a.unwrap(), json!({"n": 1}));
    assert_eq!(b.unwrap(), json!({"n": 2}));
    assert_eq!(c.unwrap(), json!({"n": 3}));

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_fails_every_pending_call() {
    let (_dir, client) = started_mock().await;

    let (a, b, c, crash) = tokio::join!(
        client.call("slow_echo", Some(json!({"x": 1}))),
        client.call("slow_echo", Some(json!({"x": 2}))),
        client.call("slow_echo", Some(json!({"x": 3}))),
        client.call("crash", None),
    );
    for result in [a, b, c, crash] {
        match result {
            Err(ClientError::Disconnected { reason }) => {
                assert!(reason.contains("exited with code 1"), "reason: {}", reason)
            }
            other => panic!("Expected Disconnected, got {:?}", other),
        }
    }

    assert_eq!(client.state(), WorkerState::Crashed);
    assert!(matches!(
        client.call("ping", None).await,
        Err(ClientError::NotStarted)
    ));
    assert!(matches!(
        client.notify("log", None).await,
        Err(ClientError::NotStarted)
    ));
}

#[tokio::test]
async fn test_unknown_ids_and_junk_are_tolerated() {
    let (_dir, client) = started_mock().await;
    let malformed = Arc::new(Mutex::new(Vec::new()));
    let m = Arc::clone(&malformed);
    client.subscribe("malformed", move |event| {
        if let ClientEvent::Malformed { line, .. } = event {
            m.lock().unwrap().push(line.clone());
        }
    });

    assert_eq!(client.call("noisy_ping", None).await.unwrap(), "pong");
    assert_eq!(
        *malformed.lock().unwrap(),
        vec![Some("warning: something unexpected".to_string())]
    );
    assert_eq!(client.ping().await.unwrap(), "pong");
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_notifications_fan_out_in_order() {
    let (_dir, client) = started_mock().await;
    let first = Arc::new(Mutex::new(Vec::new()));
    let second = Arc::new(Mutex::new(Vec::new()));
    for sink in [&first, &second] {
        let sink = Arc::clone(sink);
        client.subscribe("progress", move |event| {
            if let ClientEvent::Notification { params, .. } = event {
                sink.lock().unwrap().push(params.clone().unwrap_or(Value::Null));
            }
        });
    }

    // Notifications written before the response are dispatched first
    assert_eq!(client.call("progress_call", None).await.unwrap(), "done");
    let expected = vec![json!({"pct": 10}), json!({"pct": 50}), json!({"pct": 100})];
    assert_eq!(*first.lock().unwrap(), expected);
    assert_eq!(*second.lock().unwrap(), expected);

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_notify_reaches_worker() {
    let (_dir, client) = started_mock().await;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    client.subscribe("said", move |event| {
        if let ClientEvent::Notification { params, .. } = event {
            let _ = tx.send(params.clone());
        }
    });

    client.notify("say", Some(json!({"msg": "hi"}))).await.unwrap();
    let params = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(params, Some(json!({"msg": "hi"})));

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_error_notification_updates_last_error() {
    let (_dir, client) = started_mock().await;
    assert_eq!(client.last_error(), None);

    let err = client.call("explode", None).await.unwrap_err();
    assert_eq!(err.code(), "RPC_ERROR");
    assert_eq!(client.last_error().as_deref(), Some("boom"));

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_stderr_is_published() {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let (_dir, options) = mock_worker();
    let client = RpcClient::new(options);
    client.subscribe("stderr", move |event| {
        if let ClientEvent::Stderr { line } = event {
            let _ = tx.send(line.clone());
        }
    });
    client.start().await.unwrap();

    let line = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(line, "mock worker starting");

    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_check_health() {
    let (_dir, client) = started_mock().await;
    let status = client.check_health().await;
    assert!(status.connected);
    assert!(status.ready);
    assert_eq!(status.pid, client.pid());

    client.stop().await.unwrap();
    let status = client.check_health().await;
    assert!(!status.connected);
    assert!(!status.ready);
    assert_eq!(status.state, WorkerState::Stopped);
}

#[tokio::test]
async fn test_crlf_worker_output_is_accepted() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "crlf.sh",
        r#"
printf '{"jsonrpc":"2.0","method":"agent.ready"}\r\n'
while IFS= read -r line; do
  line=$(printf '%s' "$line" | tr -d '\r')
  id=$(id_of "$line")
  printf '{"jsonrpc":"2.0","result":"pong","id":%s}\r\n' "$id"
done
"#,
    );
    let client = RpcClient::new(
        sh_options(&script).with_line_ending(agentlink::transport::LineEnding::CrLf),
    );
    client.start().await.unwrap();
    assert_eq!(client.state(), WorkerState::Ready);
    assert_eq!(client.ping().await.unwrap(), "pong");
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_unbounded_timeout_still_answers() {
    let (_dir, client) = started_mock().await;
    let result = client
        .call_with_timeout("ping", None, Duration::MAX)
        .await
        .unwrap();
    assert_eq!(result, json!("pong"));
    client.stop().await.unwrap();
}

#[tokio::test]
async fn test_timeout_covers_blocked_stdin() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "deaf.sh", "ready\nexec sleep 30\n");
    let client = RpcClient::new(sh_options(&script));
    client.start().await.unwrap();

    // Far more than a pipe buffer, so the write blocks
    let blob = "x".repeat(1024 * 1024);
    let started = Instant::now();
    let (upload, queued) = tokio::join!(
        client.call_with_timeout("upload", Some(json!({"blob": blob})), Duration::from_millis(300)),
        client.call_with_timeout("ping", None, Duration::from_millis(100)),
    );
    assert!(started.elapsed() < Duration::from_secs(2));

    match upload {
        Err(ClientError::Timeout { method, .. }) => assert_eq!(method, "upload"),
        other => panic!("Expected Timeout, got {:?}", other),
    }
    // Queued behind the blocked write, it gives up at its own deadline
    match queued {
        Err(ClientError::Timeout { method, .. }) => assert_eq!(method, "ping"),
        other => panic!("Expected Timeout, got {:?}", other),
    }

    // A half-written line leaves the stream unusable, so the worker is gone
    assert!(matches!(
        client.call("ping", None).await,
        Err(ClientError::NotStarted | ClientError::Disconnected { .. })
    ));
    client.stop().await.unwrap();
}
