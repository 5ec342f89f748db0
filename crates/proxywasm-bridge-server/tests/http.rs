//! End-to-end tests over a real socket.
//!
//! Each test starts a [`BridgeServer`] on an ephemeral port and talks to it
//! with `reqwest`.

use std::collections::HashSet;

use proxywasm_bridge_common::RuntimeConfig;
use proxywasm_bridge_server::{AppState, BridgeServer, TestHandle};
use reqwest::StatusCode;
use serde_json::Value;

/// Logs header `a` and pauses when it is present; traps on header `t`.
const GUEST: &str = r#"
    (module
        (import "env" "proxy_log" (func $log (param i32 i32 i32) (result i32)))
        (import "env" "proxy_get_header_map_value"
            (func $get (param i32 i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (global $heap (mut i32) (i32.const 1024))
        (data (i32.const 16) "at")

        (func (export "proxy_on_memory_allocate") (param $size i32) (result i32)
            (local $ptr i32)
            (local.set $ptr (global.get $heap))
            (global.set $heap (i32.add (global.get $heap) (local.get $size)))
            (local.get $ptr))

        (func (export "proxy_on_context_create") (param i32 i32 i32))

        (func (export "proxy_on_request_headers") (param i32 i32 i32) (result i32)
            (if (i32.eqz (call $get (i32.const 0) (i32.const 17) (i32.const 1)
                                    (i32.const 32) (i32.const 36)))
                (then unreachable))
            (if (i32.eqz (call $get (i32.const 0) (i32.const 16) (i32.const 1)
                                    (i32.const 32) (i32.const 36)))
                (then
                    (drop (call $log (i32.const 2)
                                     (i32.load (i32.const 32))
                                     (i32.load (i32.const 36))))
                    (return (i32.const 1))))
            (i32.const 0))

        (func (export "proxy_on_done") (param i32) (result i32)
            (i32.const 1))
    )
"#;

async fn start() -> TestHandle {
    let state = AppState::from_wat(&RuntimeConfig::default(), GUEST).unwrap();
    BridgeServer::start_test(state).await.unwrap()
}

#[tokio::test]
async fn test_health_over_socket() {
    let server = start().await;

    let resp = reqwest::get(format!("{}/health", server.url())).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.text().await.unwrap(), "OK");

    server.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_requests_see_their_own_headers() {
    let server = start().await;
    let client = reqwest::Client::new();

    let mut tasks = Vec::new();
    for i in 0..16 {
        let client = client.clone();
        let url = format!("{}/item/{i}", server.url());
        tasks.push(tokio::spawn(async move {
            let resp = client
                .get(url)
                .header("a", format!("value-{i}"))
                .send()
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            (i, resp.json::<Value>().await.unwrap())
        }));
    }

    let mut ids = HashSet::new();
    for task in tasks {
        let (i, body) = task.await.unwrap();
        assert_eq!(body["action"], "pause");
        assert_eq!(body["logs"].as_array().unwrap().len(), 1);
        assert_eq!(body["logs"][0]["message"], format!("value-{i}"));

        let id = body["context_id"].as_i64().unwrap();
        assert!(id > 1);
        assert!(ids.insert(id), "context id {id} reused");
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_trap_reported_and_guest_keeps_serving() {
    let server = start().await;
    let client = reqwest::Client::new();

    let resp = client
        .get(server.url())
        .header("t", "1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "trap");

    let resp = client
        .get(server.url())
        .header("a", "after")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["logs"][0]["message"], "after");

    let resp = client
        .get(format!("{}/ready", server.url()))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    server.shutdown().await;
}

#[tokio::test]
async fn test_stopped_guest_is_unavailable() {
    let server = start().await;
    server.state().plugin().stop();

    let resp = reqwest::get(server.url()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["type"], "unavailable");

    server.shutdown().await;
}
