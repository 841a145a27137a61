//! Tests for the flooding layer: framing, sessions, and a deterministic
//! two-node exchange driven entirely through the session state machines.

mod common;

use bytes::BytesMut;
use common::value;
use floodkv::core::time::Tick;
use floodkv::net::codec::{DecodeResult, FrameCodec};
use floodkv::net::message::PeerMessage;
use floodkv::net::peer::{PeerAction, PeerInput, PeerSession, PeerState, SessionConfig};
use floodkv::ops::observability::KvCounters;
use floodkv::store::kv_store::KvStoreDb;
use floodkv::store::ttl::decrement_ttl;
use floodkv::store::value::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

// ============================================================================
// Framing
// ============================================================================

#[test]
fn codec_round_trips_a_full_sync_request() {
    let codec = FrameCodec::new();
    let mut key_hashes = HashMap::new();
    for i in 0..100 {
        key_hashes.insert(
            format!("adj:node-{i}"),
            value(i + 1, "node-1", b"payload", 60_000, 0).to_hash_only(),
        );
    }
    let message = PeerMessage::FullSyncReq {
        area: "0".to_string(),
        key_hashes,
    };

    let mut buffer = BytesMut::new();
    codec.encode(&message, &mut buffer).unwrap();
    match codec.decode::<PeerMessage>(&mut buffer) {
        DecodeResult::Complete(decoded) => assert_eq!(decoded, message),
        other => panic!("expected frame, got {other:?}"),
    }
}

#[test]
fn droppable_classification() {
    let keep_alive = PeerMessage::KeepAlive {
        area: "0".into(),
        seq: 1,
    };
    let flood = PeerMessage::Flood {
        area: "0".into(),
        key_vals: HashMap::new(),
    };
    assert!(keep_alive.is_droppable());
    assert!(!flood.is_droppable());
}

// ============================================================================
// Deterministic two-node exchange
//
// A miniature driver translating session actions against real stores,
// with message queues standing in for the transport.
// ============================================================================

const TTL_DECREMENT_MS: i64 = 1;

struct TestNode {
    db: KvStoreDb,
    session: PeerSession,
    outbox: VecDeque<PeerMessage>,
}

impl TestNode {
    fn new(name: &str, peer: &str) -> Self {
        let mut config = SessionConfig::new("0", peer);
        config.flood_pending_ms = 0;
        Self {
            db: KvStoreDb::new("0", name, 300_000, None, Arc::new(KvCounters::new())),
            session: PeerSession::new(config, Tick::zero()),
            outbox: VecDeque::new(),
        }
    }

    fn feed(&mut self, input: PeerInput, now: Tick) {
        let actions = self.session.handle(input, now);
        for action in actions {
            self.perform(action, now);
        }
    }

    fn perform(&mut self, action: PeerAction, now: Tick) {
        match action {
            PeerAction::Connect | PeerAction::Close => {}
            PeerAction::SendKeepAlive { seq } => self.outbox.push_back(PeerMessage::KeepAlive {
                area: "0".into(),
                seq,
            }),
            PeerAction::InitiateFullSync => {
                self.outbox.push_back(PeerMessage::FullSyncReq {
                    area: "0".into(),
                    key_hashes: self.db.dump_hashes(None),
                });
            }
            PeerAction::RespondFullSync { key_hashes } => {
                let diff = self.db.full_sync_response(&key_hashes);
                self.outbox.push_back(PeerMessage::FullSyncResp {
                    area: "0".into(),
                    key_vals: decrement_all(diff.key_vals),
                    tobe_updated_keys: diff.tobe_updated_keys.unwrap_or_default(),
                });
            }
            PeerAction::MergeKeyVals { key_vals } => {
                self.db.set_key_vals(key_vals, now);
            }
            PeerAction::SendValues { keys } => {
                let publication = self.db.get_key_vals(&keys);
                let key_vals = decrement_all(publication.key_vals);
                if !key_vals.is_empty() {
                    self.outbox.push_back(PeerMessage::Flood {
                        area: "0".into(),
                        key_vals,
                    });
                }
            }
            PeerAction::SendFlood { key_vals } => {
                let key_vals = decrement_all(key_vals);
                if !key_vals.is_empty() {
                    self.outbox.push_back(PeerMessage::Flood {
                        area: "0".into(),
                        key_vals,
                    });
                }
            }
        }
    }
}

fn decrement_all(key_vals: HashMap<String, Value>) -> HashMap<String, Value> {
    key_vals
        .into_iter()
        .filter_map(|(k, v)| decrement_ttl(&v, TTL_DECREMENT_MS).map(|v| (k, v)))
        .collect()
}

/// Shuttle queued messages between the two nodes until both go quiet.
fn pump(a: &mut TestNode, b: &mut TestNode, now: Tick) {
    for _ in 0..64 {
        if a.outbox.is_empty() && b.outbox.is_empty() {
            return;
        }
        while let Some(message) = a.outbox.pop_front() {
            b.feed(PeerInput::Message(message), now);
        }
        while let Some(message) = b.outbox.pop_front() {
            a.feed(PeerInput::Message(message), now);
        }
    }
    panic!("exchange did not quiesce");
}

fn connect(a: &mut TestNode, b: &mut TestNode, now: Tick) {
    a.feed(PeerInput::Start, now);
    b.feed(PeerInput::Start, now);
    a.feed(PeerInput::TransportUp, now);
    b.feed(PeerInput::TransportUp, now);
    pump(a, b, now);
    assert_eq!(a.session.state(), PeerState::Established);
    assert_eq!(b.session.state(), PeerState::Established);
}

fn dump(db: &KvStoreDb) -> HashMap<String, (i64, String, Option<Vec<u8>>)> {
    db.dump_all(None)
        .key_vals
        .into_iter()
        .map(|(k, v)| (k, (v.version, v.originator_id, v.payload)))
        .collect()
}

#[test]
fn three_way_full_sync_reconciles_divergence() {
    let mut a = TestNode::new("node-a", "node-b");
    let mut b = TestNode::new("node-b", "node-a");
    let now = Tick::zero();

    // Divergent seed state: a key only A has, a key only B has, and a
    // conflict where B holds the newer version.
    a.db.set_key_vals(
        HashMap::from([
            ("only-a".to_string(), value(1, "node-a", b"a", 60_000, 0)),
            ("conflict".to_string(), value(2, "node-a", b"old", 60_000, 0)),
        ]),
        now,
    );
    b.db.set_key_vals(
        HashMap::from([
            ("only-b".to_string(), value(1, "node-b", b"b", 60_000, 0)),
            ("conflict".to_string(), value(5, "node-b", b"new", 60_000, 0)),
        ]),
        now,
    );

    connect(&mut a, &mut b, now);

    let dump_a = dump(&a.db);
    let dump_b = dump(&b.db);
    assert_eq!(dump_a, dump_b);
    assert_eq!(dump_a.len(), 3);
    assert_eq!(
        dump_a["conflict"],
        (5, "node-b".to_string(), Some(b"new".to_vec()))
    );
}

#[test]
fn established_deltas_flood_with_decremented_ttl() {
    let mut a = TestNode::new("node-a", "node-b");
    let mut b = TestNode::new("node-b", "node-a");
    let now = Tick::zero();
    connect(&mut a, &mut b, now);

    let result = a.db.set_key_vals(
        HashMap::from([("k".to_string(), value(1, "node-a", b"x", 1_000, 0))]),
        now,
    );
    a.feed(PeerInput::LocalDelta(result.updates), now);
    pump(&mut a, &mut b, now);

    let stored = &b.db.get_key_vals(&["k".to_string()]).key_vals["k"];
    assert_eq!(stored.version, 1);
    assert_eq!(stored.ttl, 1_000 - TTL_DECREMENT_MS);
}

#[test]
fn rejected_flood_produces_no_onward_flood() {
    let mut a = TestNode::new("node-a", "node-b");
    let mut b = TestNode::new("node-b", "node-a");
    let now = Tick::zero();
    connect(&mut a, &mut b, now);

    a.db.set_key_vals(
        HashMap::from([("k".to_string(), value(5, "origin", b"new", 60_000, 0))]),
        now,
    );

    // An older incarnation arrives from the peer: merge rejects it, the
    // delta is empty, and nothing is queued outbound.
    a.feed(
        PeerInput::Message(PeerMessage::Flood {
            area: "0".into(),
            key_vals: HashMap::from([("k".to_string(), value(3, "origin", b"stale", 60_000, 0))]),
        }),
        now,
    );
    assert!(a.outbox.is_empty());
    assert_eq!(a.db.counters().snapshot().rejected_stale, 1);
    assert_eq!(
        a.db.get_key_vals(&["k".to_string()]).key_vals["k"].version,
        5
    );
}

#[test]
fn ttl_refresh_floods_reach_the_peer() {
    let mut a = TestNode::new("node-a", "node-b");
    let mut b = TestNode::new("node-b", "node-a");
    let now = Tick::zero();
    connect(&mut a, &mut b, now);

    let result = a.db.set_key_vals(
        HashMap::from([("self:k".to_string(), value(1, "node-a", b"x", 300_000, 0))]),
        now,
    );
    a.feed(PeerInput::LocalDelta(result.updates), now);
    pump(&mut a, &mut b, now);

    // The refresh interval for the 300s configured TTL is 75s.
    let later = Tick::new(75_000);
    let refresh = a.db.ttl_refresh(later).expect("refresh due");
    a.feed(PeerInput::LocalDelta(refresh.key_vals), later);
    pump(&mut a, &mut b, later);

    let stored = &b.db.get_key_vals(&["self:k".to_string()]).key_vals["self:k"];
    assert_eq!(stored.ttl_version, 1);
    assert_eq!(stored.ttl, 300_000 - TTL_DECREMENT_MS);
    assert_eq!(stored.payload.as_deref(), Some(b"x".as_slice()));
}
