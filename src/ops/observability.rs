//! Counters and health reporting.
//!
//! Every store and peer session shares one [`KvCounters`] handle.
//! Counters are monotonic; [`KvCounters::snapshot`] produces the
//! serializable view the status command and tests read.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for one node.
#[derive(Debug, Default)]
pub struct KvCounters {
    /// Full-record updates accepted by merge.
    pub val_updates: AtomicU64,
    /// TTL-only updates accepted by merge.
    pub ttl_updates: AtomicU64,
    /// Values dropped: older than stored.
    pub rejected_stale: AtomicU64,
    /// Values dropped: invalid TTL or version.
    pub rejected_bad_ttl: AtomicU64,
    /// Values dropped: ingress filter mismatch.
    pub rejected_filtered: AtomicU64,
    /// Values dropped: TTL-only for an incarnation we do not hold.
    pub rejected_ttl_only_newer: AtomicU64,
    /// Keys removed by TTL expiry.
    pub expired_keys: AtomicU64,
    /// Flood messages sent to peers.
    pub floods_sent: AtomicU64,
    /// Floods not produced because the delta was empty.
    pub floods_suppressed: AtomicU64,
    /// Flood messages deferred by rate limiting.
    pub floods_throttled: AtomicU64,
    /// Full-sync rounds completed.
    pub full_syncs_completed: AtomicU64,
    /// Full-sync rounds that hit their deadline.
    pub full_sync_timeouts: AtomicU64,
    /// Peer sessions that entered backoff.
    pub peer_backoffs: AtomicU64,
    /// Keep-alive messages sent.
    pub keep_alives_sent: AtomicU64,
}

impl KvCounters {
    /// Create a zeroed counter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump a counter by one.
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Fold one merge outcome into the counters.
    pub fn record_merge(&self, stats: &crate::store::merge::MergeStats) {
        Self::add(&self.val_updates, stats.val_updates);
        Self::add(&self.ttl_updates, stats.ttl_updates);
        Self::add(&self.rejected_stale, stats.rejected_stale);
        Self::add(&self.rejected_bad_ttl, stats.rejected_bad_ttl);
        Self::add(&self.rejected_filtered, stats.rejected_filtered);
        Self::add(&self.rejected_ttl_only_newer, stats.rejected_ttl_only_newer);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            val_updates: self.val_updates.load(Ordering::Relaxed),
            ttl_updates: self.ttl_updates.load(Ordering::Relaxed),
            rejected_stale: self.rejected_stale.load(Ordering::Relaxed),
            rejected_bad_ttl: self.rejected_bad_ttl.load(Ordering::Relaxed),
            rejected_filtered: self.rejected_filtered.load(Ordering::Relaxed),
            rejected_ttl_only_newer: self.rejected_ttl_only_newer.load(Ordering::Relaxed),
            expired_keys: self.expired_keys.load(Ordering::Relaxed),
            floods_sent: self.floods_sent.load(Ordering::Relaxed),
            floods_suppressed: self.floods_suppressed.load(Ordering::Relaxed),
            floods_throttled: self.floods_throttled.load(Ordering::Relaxed),
            full_syncs_completed: self.full_syncs_completed.load(Ordering::Relaxed),
            full_sync_timeouts: self.full_sync_timeouts.load(Ordering::Relaxed),
            peer_backoffs: self.peer_backoffs.load(Ordering::Relaxed),
            keep_alives_sent: self.keep_alives_sent.load(Ordering::Relaxed),
        }
    }
}

/// Serializable counter view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSnapshot {
    pub val_updates: u64,
    pub ttl_updates: u64,
    pub rejected_stale: u64,
    pub rejected_bad_ttl: u64,
    pub rejected_filtered: u64,
    pub rejected_ttl_only_newer: u64,
    pub expired_keys: u64,
    pub floods_sent: u64,
    pub floods_suppressed: u64,
    pub floods_throttled: u64,
    pub full_syncs_completed: u64,
    pub full_sync_timeouts: u64,
    pub peer_backoffs: u64,
    pub keep_alives_sent: u64,
}

/// Health summary for the status command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall healthy state.
    pub healthy: bool,
    /// Status message.
    pub message: String,
    /// Areas currently served.
    pub areas: Vec<AreaHealth>,
}

/// Per-area health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaHealth {
    /// Area identifier.
    pub area: String,
    /// Number of keys held.
    pub key_count: usize,
    /// Number of peers in Established state.
    pub established_peers: usize,
    /// Number of configured peers.
    pub configured_peers: usize,
}

impl HealthStatus {
    /// Create a healthy status.
    pub fn healthy(areas: Vec<AreaHealth>) -> Self {
        Self {
            healthy: true,
            message: "OK".to_string(),
            areas,
        }
    }

    /// Create an unhealthy status.
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            areas: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_stats_fold_into_counters() {
        let counters = KvCounters::new();
        let stats = crate::store::merge::MergeStats {
            val_updates: 3,
            ttl_updates: 1,
            rejected_stale: 2,
            ..Default::default()
        };
        counters.record_merge(&stats);
        counters.record_merge(&stats);

        let snap = counters.snapshot();
        assert_eq!(snap.val_updates, 6);
        assert_eq!(snap.ttl_updates, 2);
        assert_eq!(snap.rejected_stale, 4);
        assert_eq!(snap.rejected_filtered, 0);
    }
}
