//! TTL engine.
//!
//! Three concerns live here:
//! - the expiry queue: a min-heap of deadlines with a key map for lazy
//!   invalidation, drained by the store's event loop;
//! - the originator-side refresh schedule for self-originated keys;
//! - the per-hop TTL decrement applied when re-flooding.
//!
//! Values with [`TTL_INFINITY`] never enter the queue and are never
//! decremented.

use crate::core::constants::{TTL_INFINITY, TTL_REFRESH_FLOOR_MS};
use crate::core::time::Tick;
use crate::store::value::Value;
use std::collections::{BinaryHeap, HashMap};

/// An entry in the expiry queue.
#[derive(Debug, Clone, Eq, PartialEq)]
struct ExpiryEntry {
    deadline: Tick,
    key: String,
}

impl Ord for ExpiryEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse ordering for min-heap (earliest deadline first).
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.key.cmp(&self.key))
    }
}

impl PartialOrd for ExpiryEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of key expiry deadlines.
///
/// Re-scheduling a key leaves the superseded heap entry in place; it is
/// recognized as stale during collection because the key map no longer
/// carries its deadline.
#[derive(Debug, Default)]
pub struct ExpiryQueue {
    heap: BinaryHeap<ExpiryEntry>,
    key_deadline: HashMap<String, Tick>,
}

impl ExpiryQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule or re-schedule a key.
    pub fn schedule(&mut self, key: impl Into<String>, deadline: Tick) {
        let key = key.into();
        self.key_deadline.insert(key.clone(), deadline);
        self.heap.push(ExpiryEntry { deadline, key });
    }

    /// Drop a key's pending expiry (lazy: the heap entry stays behind).
    pub fn cancel(&mut self, key: &str) -> bool {
        self.key_deadline.remove(key).is_some()
    }

    /// Collect every key whose deadline is at or before `now`.
    pub fn collect_expired(&mut self, now: Tick) -> Vec<String> {
        let mut expired = Vec::new();

        while let Some(entry) = self.heap.peek() {
            if self.key_deadline.get(&entry.key) != Some(&entry.deadline) {
                // Stale entry, the key was re-scheduled or cancelled.
                self.heap.pop();
                continue;
            }
            if !now.is_at_or_after(entry.deadline) {
                // Earliest live deadline is in the future.
                break;
            }
            let entry = self.heap.pop().expect("peeked entry");
            self.key_deadline.remove(&entry.key);
            expired.push(entry.key);
        }

        expired
    }

    /// Earliest live deadline, if any.
    pub fn peek_next_deadline(&self) -> Option<Tick> {
        self.heap
            .iter()
            .filter(|e| self.key_deadline.get(&e.key) == Some(&e.deadline))
            .map(|e| e.deadline)
            .min()
    }

    /// Number of keys with a pending deadline.
    pub fn len(&self) -> usize {
        self.key_deadline.len()
    }

    /// Check if no key has a pending deadline.
    pub fn is_empty(&self) -> bool {
        self.key_deadline.is_empty()
    }
}

/// Refresh bookkeeping for one self-originated key.
#[derive(Debug, Clone)]
pub struct SelfOriginated {
    /// When the TTL was last re-advertised.
    pub last_refresh: Tick,
}

/// Interval at which the originator re-advertises a key's TTL.
///
/// A quarter of the key TTL, floored so short TTLs do not turn into a
/// refresh storm.
pub fn refresh_interval_ms(key_ttl_ms: i64) -> u64 {
    ((key_ttl_ms / 4).max(0) as u64).max(TTL_REFRESH_FLOOR_MS)
}

/// Apply the per-hop decrement to a value about to be forwarded.
///
/// Returns `None` when the decremented TTL would be non-positive, in
/// which case the value must not be forwarded (local expiry is the TTL
/// queue's job, not the forwarding path's).
pub fn decrement_ttl(value: &Value, decrement_ms: i64) -> Option<Value> {
    if value.ttl == TTL_INFINITY {
        return Some(value.clone());
    }
    let remaining = value.ttl - decrement_ms;
    if remaining <= 0 {
        return None;
    }
    let mut forwarded = value.clone();
    forwarded.ttl = remaining;
    Some(forwarded)
}
