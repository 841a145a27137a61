//! Merge engine.
//!
//! [`merge_key_values`] folds an incoming batch into a local map and
//! returns the effective delta, which becomes the next outbound flood.
//! The decision per key is one of three: replace the whole record
//! ("update all"), refresh only the TTL fields ("update ttl"), or drop.
//!
//! The rules, in order, for a value carrying a payload:
//! newer version wins; at equal versions the higher originator wins; at
//! equal originators the higher payload wins (a deterministic tie-break;
//! without it two stores holding different bytes under the same version
//! after a restart would never reconcile); equal payloads retain the
//! higher ttl_version. A value without a payload can only refresh the TTL
//! of the exact incarnation already stored.

use crate::store::filter::KeyFilter;
use crate::store::value::{digest, Value};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Per-reason drop and update counts for one merge call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Full-record updates applied.
    pub val_updates: u64,
    /// TTL-only updates applied.
    pub ttl_updates: u64,
    /// Dropped: version older than stored.
    pub rejected_stale: u64,
    /// Dropped: non-positive finite TTL or non-positive version.
    pub rejected_bad_ttl: u64,
    /// Dropped: ingress filter mismatch.
    pub rejected_filtered: u64,
    /// Dropped: TTL-only value claiming a version we do not hold.
    pub rejected_ttl_only_newer: u64,
}

impl MergeStats {
    /// Total values dropped.
    pub fn rejected_total(&self) -> u64 {
        self.rejected_stale
            + self.rejected_bad_ttl
            + self.rejected_filtered
            + self.rejected_ttl_only_newer
    }
}

/// Result of merging one batch.
#[derive(Debug, Default)]
pub struct MergeResult {
    /// Accepted entries, keyed by key. Empty means nothing to flood.
    pub updates: HashMap<String, Value>,
    /// Drop/update accounting.
    pub stats: MergeStats,
}

impl MergeResult {
    /// Keys accepted by this merge, for `key_set_values` replies.
    pub fn accepted_keys(&self) -> Vec<String> {
        self.updates.keys().cloned().collect()
    }
}

/// Merge `key_vals` into `local`, returning the accepted delta.
///
/// Pure with respect to everything but `local`: no clocks, no IO. The
/// caller owns expiry scheduling for the accepted entries.
pub fn merge_key_values(
    local: &mut HashMap<String, Value>,
    key_vals: HashMap<String, Value>,
    filter: Option<&KeyFilter>,
) -> MergeResult {
    let mut result = MergeResult::default();

    for (key, value) in key_vals {
        if let Some(filter) = filter {
            if !filter.matches(&key, &value) {
                debug!(%key, originator = %value.originator_id, "not adding, filtered");
                result.stats.rejected_filtered += 1;
                continue;
            }
        }

        // TTL must be infinite or positive, version must start at 1.
        if !value.has_valid_ttl() || value.version < 1 {
            result.stats.rejected_bad_ttl += 1;
            continue;
        }

        // Absent key compares as version 0, so any valid version beats it.
        let my_version = local.get(&key).map(|v| v.version).unwrap_or(0);
        if value.version < my_version {
            result.stats.rejected_stale += 1;
            continue;
        }

        let mut update_all = false;
        let mut update_ttl = false;

        if value.payload.is_some() {
            if value.version > my_version {
                update_all = true;
            } else if let Some(mine) = local.get(&key) {
                if value.originator_id > mine.originator_id {
                    // Versions equal, higher originator wins.
                    update_all = true;
                } else if value.originator_id == mine.originator_id {
                    match (&value.payload, &mine.payload) {
                        (Some(incoming), Some(stored)) => match incoming.cmp(stored) {
                            std::cmp::Ordering::Greater => {
                                debug!(%key, "Previous incarnation reflected back");
                                update_all = true;
                            }
                            std::cmp::Ordering::Equal => {
                                // Same incarnation: retain the higher TTL lineage.
                                if value.ttl_version > mine.ttl_version {
                                    update_ttl = true;
                                }
                            }
                            std::cmp::Ordering::Less => {}
                        },
                        _ => {}
                    }
                }
            }
        } else {
            // TTL-only refresh: applies only to the incarnation we hold.
            match local.get(&key) {
                Some(mine)
                    if value.version == mine.version
                        && value.originator_id == mine.originator_id =>
                {
                    if value.ttl_version > mine.ttl_version {
                        update_ttl = true;
                    }
                }
                _ => {
                    // A TTL refresh can never introduce an incarnation.
                    warn!(
                        %key,
                        version = value.version,
                        originator = %value.originator_id,
                        "ttl-only value for unknown incarnation, rejecting"
                    );
                    result.stats.rejected_ttl_only_newer += 1;
                    continue;
                }
            }
        }

        if update_all {
            let mut stored = value.clone();
            if stored.hash.is_none() {
                stored.hash = Some(digest(
                    stored.version,
                    &stored.originator_id,
                    stored.payload.as_deref(),
                ));
            }
            debug!(
                %key,
                version = stored.version,
                originator = %stored.originator_id,
                ttl = stored.ttl,
                ttl_version = stored.ttl_version,
                "updating key"
            );
            local.insert(key.clone(), stored);
            result.stats.val_updates += 1;
        } else if update_ttl {
            if let Some(entry) = local.get_mut(&key) {
                entry.ttl = value.ttl;
                entry.ttl_version = value.ttl_version;
            }
            result.stats.ttl_updates += 1;
        } else {
            continue;
        }

        // Announce the update as received; receivers compute missing hashes.
        result.updates.insert(key, value);
    }

    debug!(
        accepted = result.updates.len(),
        val_updates = result.stats.val_updates,
        ttl_updates = result.stats.ttl_updates,
        "merged batch"
    );
    result
}
