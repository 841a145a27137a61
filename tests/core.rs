//! Tests for core infrastructure: config gate, errors, time.

mod common;

use floodkv::core::config::{Config, ConfigOverrides};
use floodkv::core::error::KvError;
use floodkv::core::time::{Clock, ManualClock, Tick};
use std::io::Write;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write config");
    file
}

#[test]
fn config_loads_from_file() {
    let file = write_config(
        r#"
node_name = "node-1"

[[areas]]
area_id = "spine"
neighbor_regexes = ["rsw.*"]

[kvstore]
key_ttl_ms = 60000
"#,
    );
    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.node_name, "node-1");
    assert_eq!(config.areas.len(), 1);
    assert_eq!(config.kvstore.key_ttl_ms, 60_000);
}

#[test]
fn missing_file_is_invalid_config() {
    let err = Config::from_file(std::path::Path::new("/nonexistent/floodkv.toml")).unwrap_err();
    assert!(matches!(err, KvError::InvalidConfig { .. }));
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn malformed_toml_is_invalid_config() {
    let file = write_config("node_name = [not toml");
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(matches!(err, KvError::InvalidConfig { .. }));
}

#[test]
fn gate_failure_names_the_field() {
    let file = write_config(
        r#"
node_name = "node-1"

[kvstore.flood_rate]
flood_msg_burst_size = 0
"#,
    );
    let err = Config::from_file(file.path()).unwrap_err();
    assert!(err.to_string().contains("flood_msg_burst_size"));
}

#[test]
fn effective_config_round_trips_through_toml() {
    let config = Config::from_toml(r#"node_name = "node-1""#).unwrap();
    let rendered = toml::to_string_pretty(&config).unwrap();
    let reparsed = Config::from_toml(&rendered).unwrap();
    assert_eq!(reparsed.node_name, config.node_name);
    assert_eq!(reparsed.kvstore.key_ttl_ms, config.kvstore.key_ttl_ms);
    assert_eq!(
        reparsed.timers.keep_alive_interval_ms,
        config.timers.keep_alive_interval_ms
    );
}

#[test]
fn overrides_do_not_bypass_the_gate() {
    let mut config = Config::from_toml(r#"node_name = "node-1""#).unwrap();
    config.apply_overrides(&ConfigOverrides {
        log_level: Some("nope".into()),
        ..Default::default()
    });
    assert!(config.validate().is_err());
}

#[test]
fn error_exit_codes() {
    assert_eq!(KvError::invalid_config("x").exit_code(), 1);
    assert_eq!(
        KvError::OutOfRange {
            field: "ttl",
            value: -1,
            min: 1,
            max: 100
        }
        .exit_code(),
        1
    );
    assert_eq!(KvError::internal("x").exit_code(), 2);
    assert_eq!(KvError::Cancelled.exit_code(), 2);
}

#[test]
fn error_classification() {
    let unreachable = KvError::PeerUnreachable {
        peer_id: "node-2".into(),
        message: "refused".into(),
    };
    assert!(unreachable.is_retriable());
    assert!(!unreachable.is_fatal());

    let sync = KvError::SyncTimeout {
        peer_id: "node-2".into(),
        elapsed_ms: 10_000,
    };
    assert!(sync.is_retriable());

    assert!(KvError::internal("corrupt").is_fatal());
    assert!(!KvError::invalid_request("x").is_retriable());
}

#[test]
fn manual_clock_drives_ticks() {
    let clock = ManualClock::new(Tick::new(100));
    assert_eq!(clock.now(), Tick::new(100));
    clock.advance(400);
    assert_eq!(clock.now(), Tick::new(500));
}
