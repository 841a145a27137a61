//! Per-area key-value store.
//!
//! A [`KvStoreDb`] owns one area's map and fronts the merge, TTL, and
//! diff engines. All mutation runs on the owning event loop; peers and
//! the control surface reach it through that loop's mailbox, never by
//! sharing the map.
//!
//! Publication guarantee: every accepted batch is delivered to the
//! subscriber streams exactly once, whole, in merge-acceptance order.

use crate::core::error::{KvError, KvResult};
use crate::core::time::Tick;
use crate::ops::observability::KvCounters;
use crate::store::diff::dump_difference;
use crate::store::filter::KeyFilter;
use crate::store::merge::{merge_key_values, MergeResult};
use crate::store::ttl::{refresh_interval_ms, ExpiryQueue, SelfOriginated};
use crate::store::types::Publication;
use crate::store::value::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A publication subscriber with an optional egress filter.
struct Subscriber {
    filter: Option<KeyFilter>,
    tx: mpsc::UnboundedSender<Publication>,
}

/// One area's replicated key-value state.
pub struct KvStoreDb {
    area: String,
    node_name: String,
    key_ttl_ms: i64,
    key_vals: HashMap<String, Value>,
    expiry: ExpiryQueue,
    ingress_filter: Option<KeyFilter>,
    self_originated: HashMap<String, SelfOriginated>,
    subscribers: Vec<Subscriber>,
    counters: Arc<KvCounters>,
}

impl KvStoreDb {
    /// Create an empty store for an area.
    pub fn new(
        area: impl Into<String>,
        node_name: impl Into<String>,
        key_ttl_ms: i64,
        ingress_filter: Option<KeyFilter>,
        counters: Arc<KvCounters>,
    ) -> Self {
        Self {
            area: area.into(),
            node_name: node_name.into(),
            key_ttl_ms,
            key_vals: HashMap::new(),
            expiry: ExpiryQueue::new(),
            ingress_filter,
            self_originated: HashMap::new(),
            subscribers: Vec::new(),
            counters,
        }
    }

    /// Area this store replicates.
    pub fn area(&self) -> &str {
        &self.area
    }

    /// This node's originator ID.
    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    /// Number of keys held.
    pub fn len(&self) -> usize {
        self.key_vals.len()
    }

    /// Check if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty()
    }

    /// Shared counter handle.
    pub fn counters(&self) -> &Arc<KvCounters> {
        &self.counters
    }

    /// Merge a batch, schedule TTLs, and publish the accepted delta.
    ///
    /// Returns the merge result; `result.updates` is the delta to flood.
    pub fn set_key_vals(&mut self, key_vals: HashMap<String, Value>, now: Tick) -> MergeResult {
        let result = merge_key_values(&mut self.key_vals, key_vals, self.ingress_filter.as_ref());
        self.counters.record_merge(&result.stats);

        for key in result.updates.keys() {
            self.after_accept(key, now);
        }

        if !result.updates.is_empty() {
            let publication =
                Publication::with_key_vals(self.area.clone(), result.updates.clone());
            self.publish(publication);
        }

        result
    }

    /// Bookkeeping for a key the merge just accepted.
    fn after_accept(&mut self, key: &str, now: Tick) {
        let Some(stored) = self.key_vals.get(key) else {
            return;
        };

        if stored.is_immortal() {
            self.expiry.cancel(key);
        } else {
            self.expiry.schedule(key, now.add_ms(stored.ttl as u64));
        }

        if stored.originator_id == self.node_name {
            self.self_originated
                .insert(key.to_string(), SelfOriginated { last_refresh: now });
        } else {
            self.self_originated.remove(key);
        }
    }

    /// Read specific keys. Unknown keys are simply absent from the reply.
    pub fn get_key_vals(&self, keys: &[String]) -> Publication {
        let mut publication = Publication::new(self.area.clone());
        for key in keys {
            if let Some(value) = self.key_vals.get(key) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        publication
    }

    /// Dump every entry passing the egress filter.
    pub fn dump_all(&self, filter: Option<&KeyFilter>) -> Publication {
        let mut publication = Publication::new(self.area.clone());
        for (key, value) in &self.key_vals {
            if filter.map_or(true, |f| f.matches(key, value)) {
                publication.key_vals.insert(key.clone(), value.clone());
            }
        }
        publication
    }

    /// Payload-stripped dump for full-sync requests.
    pub fn dump_hashes(&self, filter: Option<&KeyFilter>) -> HashMap<String, Value> {
        self.key_vals
            .iter()
            .filter(|(key, value)| filter.map_or(true, |f| f.matches(key, value)))
            .map(|(key, value)| (key.clone(), value.to_hash_only()))
            .collect()
    }

    /// Answer a full-sync request with the three-way difference.
    pub fn full_sync_response(&self, req_key_vals: &HashMap<String, Value>) -> Publication {
        dump_difference(&self.area, &self.key_vals, req_key_vals)
    }

    /// Mark keys deleted: re-advertise with an empty payload, a bumped
    /// version, and a finite TTL so the tombstone ages out everywhere.
    pub fn delete_keys(&mut self, keys: &[String], now: Tick) -> KvResult<MergeResult> {
        let mut batch = HashMap::new();
        for key in keys {
            if key.is_empty() {
                return Err(KvError::invalid_request("empty key in delete"));
            }
            let Some(stored) = self.key_vals.get(key) else {
                continue;
            };
            // Tombstones must age out even when locally originated keys
            // are configured immortal.
            let ttl = if self.key_ttl_ms == crate::core::constants::TTL_INFINITY {
                crate::core::constants::DEFAULT_KEY_TTL_MS
            } else {
                self.key_ttl_ms
            };
            batch.insert(
                key.clone(),
                Value::new(
                    stored.version + 1,
                    self.node_name.clone(),
                    Vec::new(),
                    ttl,
                    0,
                ),
            );
        }
        Ok(self.set_key_vals(batch, now))
    }

    /// Re-advertise TTLs for self-originated keys that are due.
    ///
    /// Emits TTL-only values with a bumped ttl_version and the full
    /// configured TTL, merged locally so the delta floods like any other
    /// accepted batch.
    pub fn ttl_refresh(&mut self, now: Tick) -> Option<Publication> {
        if self.key_ttl_ms == crate::core::constants::TTL_INFINITY {
            return None;
        }
        let interval = refresh_interval_ms(self.key_ttl_ms);

        let mut batch = HashMap::new();
        for (key, tracking) in &self.self_originated {
            if now.since(tracking.last_refresh) < interval {
                continue;
            }
            let Some(stored) = self.key_vals.get(key) else {
                continue;
            };
            if stored.is_immortal() {
                continue;
            }
            batch.insert(
                key.clone(),
                Value::ttl_refresh(
                    stored.version,
                    stored.originator_id.clone(),
                    self.key_ttl_ms,
                    stored.ttl_version + 1,
                ),
            );
        }

        if batch.is_empty() {
            return None;
        }
        debug!(area = %self.area, keys = batch.len(), "refreshing self-originated ttls");
        let result = self.set_key_vals(batch, now);
        if result.updates.is_empty() {
            return None;
        }
        Some(Publication::with_key_vals(
            self.area.clone(),
            result.updates,
        ))
    }

    /// Remove every key whose TTL has run out and publish the expiry.
    pub fn advance_expiry(&mut self, now: Tick) -> Option<Publication> {
        let expired = self.expiry.collect_expired(now);
        if expired.is_empty() {
            return None;
        }

        for key in &expired {
            self.key_vals.remove(key);
            self.self_originated.remove(key);
        }
        KvCounters::add(&self.counters.expired_keys, expired.len() as u64);
        info!(area = %self.area, count = expired.len(), "expired keys");

        let mut publication = Publication::new(self.area.clone());
        publication.expired_keys = expired;
        self.publish(publication.clone());
        Some(publication)
    }

    /// Earliest pending expiry deadline, for loop scheduling.
    pub fn next_expiry(&self) -> Option<Tick> {
        self.expiry.peek_next_deadline()
    }

    /// Open a publication stream starting from "now" (no backlog replay).
    pub fn subscribe(&mut self, filter: Option<KeyFilter>) -> mpsc::UnboundedReceiver<Publication> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(Subscriber { filter, tx });
        rx
    }

    /// Fan a publication out to the subscriber streams.
    fn publish(&mut self, publication: Publication) {
        self.subscribers.retain(|subscriber| {
            let filtered = match &subscriber.filter {
                None => publication.clone(),
                Some(filter) => {
                    let mut copy = publication.clone();
                    copy.key_vals
                        .retain(|key, value| filter.matches(key, value));
                    copy
                }
            };
            if filtered.is_empty() {
                return !subscriber.tx.is_closed();
            }
            subscriber.tx.send(filtered).is_ok()
        });
    }

    /// Verify stored hashes; a mismatch is state corruption.
    pub fn verify_integrity(&self) -> KvResult<()> {
        for (key, value) in &self.key_vals {
            if !value.hash_consistent() {
                return Err(KvError::internal(format!(
                    "stored hash mismatch for key '{key}' in area '{}'",
                    self.area
                )));
            }
        }
        Ok(())
    }

    /// All entries, for snapshot persistence.
    pub fn export_entries(&self) -> Vec<(String, Value)> {
        self.key_vals
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Seed the store from a snapshot, running entries through merge so
    /// every invariant (hash presence, TTL validity) holds.
    pub fn import_entries(&mut self, entries: Vec<(String, Value)>, now: Tick) -> usize {
        let batch: HashMap<String, Value> = entries.into_iter().collect();
        let result = self.set_key_vals(batch, now);
        result.updates.len()
    }
}
