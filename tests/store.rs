//! Tests for the per-area store: merge, diff, filters, TTL.

mod common;

use common::value;
use floodkv::core::constants::TTL_INFINITY;
use floodkv::core::time::Tick;
use floodkv::ops::observability::KvCounters;
use floodkv::store::diff::dump_difference;
use floodkv::store::filter::{FilterOperator, KeyFilter};
use floodkv::store::kv_store::KvStoreDb;
use floodkv::store::merge::merge_key_values;
use floodkv::store::value::{compare_values, Value, ValueOrder};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn store() -> KvStoreDb {
    KvStoreDb::new("0", "node-1", 300_000, None, Arc::new(KvCounters::new()))
}

fn batch(key: &str, value: Value) -> HashMap<String, Value> {
    HashMap::from([(key.to_string(), value)])
}

// ============================================================================
// Version / originator / payload conflict resolution
// ============================================================================

#[test]
fn version_monotonicity() {
    let mut db = store();

    let result = db.set_key_vals(batch("k", value(1, "A", b"x", 1_000, 0)), Tick::zero());
    assert_eq!(result.accepted_keys(), vec!["k".to_string()]);

    // A version-0 value is dropped silently: nothing accepted.
    let result = db.set_key_vals(batch("k", value(0, "A", b"y", 1_000, 0)), Tick::zero());
    assert!(result.accepted_keys().is_empty());

    let stored = &db.get_key_vals(&["k".to_string()]).key_vals["k"];
    assert_eq!(stored.version, 1);
    assert_eq!(stored.payload.as_deref(), Some(b"x".as_slice()));
}

#[test]
fn originator_tie_break() {
    let mut db = store();
    let mut rx = db.subscribe(None);

    db.set_key_vals(batch("k", value(5, "A", b"a", 1_000, 0)), Tick::zero());
    let result = db.set_key_vals(batch("k", value(5, "B", b"b", 1_000, 0)), Tick::zero());
    assert_eq!(result.accepted_keys(), vec!["k".to_string()]);

    let stored = &db.get_key_vals(&["k".to_string()]).key_vals["k"];
    assert_eq!(stored.originator_id, "B");
    assert_eq!(stored.payload.as_deref(), Some(b"b".as_slice()));

    // Both accepted batches produced a publication naming the key.
    let first = rx.try_recv().unwrap();
    assert!(first.key_vals.contains_key("k"));
    let second = rx.try_recv().unwrap();
    assert!(second.key_vals.contains_key("k"));
    assert_eq!(second.key_vals["k"].originator_id, "B");
}

#[test]
fn ttl_only_refresh_keeps_payload_and_hash() {
    let mut db = store();
    db.set_key_vals(batch("k", value(7, "A", b"p", 500, 3)), Tick::zero());
    let original_hash = db.get_key_vals(&["k".to_string()]).key_vals["k"].hash;

    let refresh = Value::ttl_refresh(7, "A", 2_000, 4);
    let result = db.set_key_vals(batch("k", refresh), Tick::zero());
    assert_eq!(result.accepted_keys(), vec!["k".to_string()]);

    let stored = &db.get_key_vals(&["k".to_string()]).key_vals["k"];
    assert_eq!(stored.ttl, 2_000);
    assert_eq!(stored.ttl_version, 4);
    assert_eq!(stored.payload.as_deref(), Some(b"p".as_slice()));
    assert_eq!(stored.hash, original_hash);
}

#[test]
fn payload_tie_break_after_restart() {
    let mut db = store();
    db.set_key_vals(batch("k", value(3, "A", b"alpha", 1_000, 0)), Tick::zero());

    // Same version and originator, different bytes: the higher payload
    // wins so both sides settle on the same incarnation.
    let result = db.set_key_vals(batch("k", value(3, "A", b"beta", 1_000, 0)), Tick::zero());
    assert_eq!(result.accepted_keys(), vec!["k".to_string()]);
    let stored = &db.get_key_vals(&["k".to_string()]).key_vals["k"];
    assert_eq!(stored.payload.as_deref(), Some(b"beta".as_slice()));
}

#[test]
fn stored_value_never_regresses_under_merge() {
    let mut local = HashMap::new();
    let inputs = vec![
        value(1, "A", b"x", 1_000, 0),
        value(3, "B", b"y", 1_000, 0),
        value(2, "Z", b"old", 1_000, 9),
        value(3, "A", b"z", 1_000, 5),
        value(3, "B", b"y", 1_000, 2),
        Value::ttl_refresh(3, "B", 5_000, 3),
        value(4, "A", b"w", TTL_INFINITY, 0),
        value(4, "A", b"v", 1_000, 0),
    ];

    for input in inputs {
        let before = local.get("k").cloned();
        merge_key_values(&mut local, HashMap::from([("k".to_string(), input)]), None);
        if let (Some(before), Some(after)) = (before, local.get("k")) {
            assert_ne!(
                compare_values(after, &before),
                ValueOrder::Less,
                "merge regressed the stored value"
            );
        }
    }
}

#[test]
fn merge_of_own_delta_is_idempotent() {
    let mut local = HashMap::new();
    let mut batch = HashMap::new();
    batch.insert("k1".to_string(), value(2, "A", b"x", 1_000, 1));
    batch.insert("k2".to_string(), value(1, "B", b"y", TTL_INFINITY, 0));

    let first = merge_key_values(&mut local, batch, None);
    assert_eq!(first.updates.len(), 2);
    let snapshot = local.clone();

    let second = merge_key_values(&mut local, first.updates, None);
    assert!(second.updates.is_empty());
    assert_eq!(local, snapshot);
}

// ============================================================================
// Filters
// ============================================================================

#[test]
fn or_filter_matches_any_dimension() {
    let originators: HashSet<String> = ["node-7".to_string()].into();
    let filter =
        KeyFilter::new(vec!["adj:".into()], originators, FilterOperator::Or).unwrap();

    let v_other = value(1, "node-9", b"x", 1_000, 0);
    let v_match = value(1, "node-7", b"x", 1_000, 0);
    assert!(filter.matches("adj:x", &v_other));
    assert!(filter.matches("anything", &v_match));
    assert!(!filter.matches("anything", &v_other));
}

#[test]
fn and_filter_requires_all_dimensions() {
    let originators: HashSet<String> = ["node-7".to_string()].into();
    let filter =
        KeyFilter::new(vec!["adj:".into()], originators, FilterOperator::And).unwrap();

    let v_other = value(1, "node-9", b"x", 1_000, 0);
    let v_match = value(1, "node-7", b"x", 1_000, 0);
    assert!(filter.matches("adj:x", &v_match));
    assert!(!filter.matches("adj:x", &v_other));
    assert!(!filter.matches("prefix:x", &v_match));
}

#[test]
fn leaf_node_ingress_filter_guards_the_map() {
    let originators: HashSet<String> = ["node-1".to_string()].into();
    let filter =
        KeyFilter::new(vec!["adj:".into()], originators, FilterOperator::Or).unwrap();
    let mut db = KvStoreDb::new(
        "0",
        "node-1",
        300_000,
        Some(filter),
        Arc::new(KvCounters::new()),
    );

    let mut kvs = HashMap::new();
    kvs.insert("adj:kept".to_string(), value(1, "node-9", b"x", 1_000, 0));
    kvs.insert("prefix:kept".to_string(), value(1, "node-1", b"y", 1_000, 0));
    kvs.insert("prefix:dropped".to_string(), value(1, "node-9", b"z", 1_000, 0));
    let result = db.set_key_vals(kvs, Tick::zero());

    let mut accepted = result.accepted_keys();
    accepted.sort();
    assert_eq!(accepted, vec!["adj:kept".to_string(), "prefix:kept".to_string()]);
    assert_eq!(db.counters().snapshot().rejected_filtered, 1);
}

// ============================================================================
// TTL boundaries
// ============================================================================

#[test]
fn infinite_ttl_never_expires_nor_decrements() {
    let mut db = store();
    db.set_key_vals(batch("k", value(1, "A", b"x", TTL_INFINITY, 0)), Tick::zero());
    assert!(db.next_expiry().is_none());

    let forwarded =
        floodkv::store::ttl::decrement_ttl(&db.get_key_vals(&["k".to_string()]).key_vals["k"], 1)
            .unwrap();
    assert_eq!(forwarded.ttl, TTL_INFINITY);
}

#[test]
fn decrement_to_zero_blocks_forwarding_but_not_the_local_copy() {
    let mut db = store();
    db.set_key_vals(batch("k", value(1, "A", b"x", 1, 0)), Tick::zero());

    let stored = db.get_key_vals(&["k".to_string()]).key_vals["k"].clone();
    assert!(floodkv::store::ttl::decrement_ttl(&stored, 1).is_none());

    // Still present locally until the expiry timer fires.
    assert_eq!(db.len(), 1);
    let publication = db.advance_expiry(Tick::new(1)).unwrap();
    assert_eq!(publication.expired_keys, vec!["k".to_string()]);
    assert_eq!(db.len(), 0);
}

// ============================================================================
// Three-way diff
// ============================================================================

#[test]
fn three_way_diff_literal_scenario() {
    // my = {k1, k2_old}, req = {k2_new, k3}: publish k1, request k2 and k3.
    let mut my = HashMap::new();
    my.insert("k1".to_string(), value(1, "A", b"v1", 1_000, 0));
    my.insert("k2".to_string(), value(2, "A", b"mine", 1_000, 0));

    let mut req = HashMap::new();
    req.insert("k2".to_string(), value(5, "A", b"theirs", 1_000, 0));
    req.insert("k3".to_string(), value(1, "A", b"v3", 1_000, 0));

    assert_eq!(
        compare_values(&my["k2"], &req["k2"]),
        ValueOrder::Less,
        "precondition"
    );

    let publication = dump_difference("0", &my, &req);
    assert_eq!(publication.key_vals.len(), 1);
    assert!(publication.key_vals.contains_key("k1"));
    let mut wanted = publication.tobe_updated_keys.unwrap();
    wanted.sort();
    assert_eq!(wanted, vec!["k2".to_string(), "k3".to_string()]);
}

#[test]
fn identical_stores_sync_to_nothing() {
    let mut db_a = store();
    let mut db_b = store();
    let kvs = HashMap::from([
        ("k1".to_string(), value(1, "A", b"x", TTL_INFINITY, 0)),
        ("k2".to_string(), value(4, "B", b"y", TTL_INFINITY, 2)),
    ]);
    db_a.set_key_vals(kvs.clone(), Tick::zero());
    db_b.set_key_vals(kvs, Tick::zero());

    let publication = db_a.full_sync_response(&db_b.dump_hashes(None));
    assert!(publication.key_vals.is_empty());
    assert!(publication.tobe_updated_keys.unwrap().is_empty());
}
