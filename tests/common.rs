//! Common test utilities.
//!
//! Shared helpers for integration tests. Import with `mod common;`.
#![allow(dead_code)]

use floodkv::control::api::{CtrlHandler, CtrlRequest, CtrlResponse};
use floodkv::core::config::Config;
use floodkv::ops::observability::CounterSnapshot;
use floodkv::store::value::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Build a value with a payload and eagerly computed hash.
pub fn value(version: i64, originator: &str, payload: &[u8], ttl: i64, ttl_version: i64) -> Value {
    Value::new(version, originator, payload.to_vec(), ttl, ttl_version)
}

/// Grab a free TCP port from the OS.
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind ephemeral");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

/// Configuration for one test node with statically configured peers.
pub fn node_config(
    node_name: &str,
    peer_port: u16,
    ctrl_port: u16,
    peers: &[(&str, u16)],
) -> Config {
    let peer_lines: String = peers
        .iter()
        .map(|(peer_id, port)| {
            format!(r#"{{ peer_id = "{peer_id}", addr = "127.0.0.1:{port}" }}, "#)
        })
        .collect();
    let toml = format!(
        r#"
node_name = "{node_name}"

[[areas]]
area_id = "0"
peers = [{peer_lines}]

[listen]
peer_bind = "127.0.0.1:{peer_port}"
ctrl_bind = "127.0.0.1:{ctrl_port}"

[timers]
keep_alive_interval_ms = 200
hold_time_ms = 1000
graceful_restart_ms = 1000
read_timeout_ms = 2000
conn_timeout_ms = 1000
long_poll_hold_ms = 500

[backoff]
initial_backoff_ms = 50
max_backoff_ms = 400
"#
    );
    Config::from_toml(&toml).expect("test config is valid")
}

/// Read one key through the control surface.
pub async fn get_value(handler: &CtrlHandler, key: &str) -> Option<Value> {
    match handler
        .handle(CtrlRequest::KeyGetValues {
            area: "0".into(),
            keys: vec![key.to_string()],
        })
        .await
    {
        CtrlResponse::Publication(publication) => publication.key_vals.get(key).cloned(),
        other => panic!("unexpected response: {other:?}"),
    }
}

/// Write one key through the control surface; returns the accepted keys.
pub async fn set_value(handler: &CtrlHandler, key: &str, v: Value) -> Vec<String> {
    match handler
        .handle(CtrlRequest::KeySetValues {
            area: "0".into(),
            key_vals: HashMap::from([(key.to_string(), v)]),
        })
        .await
    {
        CtrlResponse::SetKeyVals(result) => result.accepted_keys,
        other => panic!("unexpected response: {other:?}"),
    }
}

/// Counter snapshot for the default test area.
pub async fn counters(handler: &CtrlHandler) -> CounterSnapshot {
    match handler
        .handle(CtrlRequest::Counters { area: "0".into() })
        .await
    {
        CtrlResponse::Counters(counters) => counters,
        other => panic!("unexpected response: {other:?}"),
    }
}

/// Poll until a key is present; panics on timeout.
pub async fn wait_for_key(handler: &CtrlHandler, key: &str, timeout: Duration) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(v) = get_value(handler, key).await {
            return v;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for key '{key}'");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Poll until a key is absent; panics on timeout.
pub async fn wait_for_key_gone(handler: &CtrlHandler, key: &str, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if get_value(handler, key).await.is_none() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for key '{key}' to expire");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}
