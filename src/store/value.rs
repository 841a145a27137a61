//! Versioned value records.
//!
//! A [`Value`] is the unit of replication: an immutable-by-convention
//! record identified by `(version, originator_id, payload)`, its
//! *incarnation*, plus TTL fields that may advance within an incarnation.
//! [`compare_values`] is the total-ish order every store applies for
//! conflict resolution; it must produce the same answer on every node.

use crate::core::constants::TTL_INFINITY;
use serde::{Deserialize, Serialize};
use std::hash::Hasher;
use twox_hash::XxHash64;

/// A replicated key's value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Value {
    /// Monotonically increasing version, >= 1. 0 is the "absent" sentinel
    /// used only when comparing against a missing local entry.
    pub version: i64,

    /// Node that produced this incarnation.
    pub originator_id: String,

    /// Opaque payload bytes. `None` marks a TTL-only refresh.
    pub payload: Option<Vec<u8>>,

    /// Remaining lifetime in milliseconds, or [`TTL_INFINITY`].
    pub ttl: i64,

    /// Counter advanced by the originator on every TTL refresh of the
    /// same incarnation.
    pub ttl_version: i64,

    /// Digest of `(version, originator_id, payload)`. May be absent on
    /// the wire; the receiver computes it on first store.
    pub hash: Option<u64>,
}

impl Value {
    /// Create a value with a payload. The hash is computed eagerly.
    pub fn new(
        version: i64,
        originator_id: impl Into<String>,
        payload: Vec<u8>,
        ttl: i64,
        ttl_version: i64,
    ) -> Self {
        let originator_id = originator_id.into();
        let hash = Some(digest(version, &originator_id, Some(&payload)));
        Self {
            version,
            originator_id,
            payload: Some(payload),
            ttl,
            ttl_version,
            hash,
        }
    }

    /// Create a TTL-only refresh value (no payload, no hash).
    pub fn ttl_refresh(
        version: i64,
        originator_id: impl Into<String>,
        ttl: i64,
        ttl_version: i64,
    ) -> Self {
        Self {
            version,
            originator_id: originator_id.into(),
            payload: None,
            ttl,
            ttl_version,
            hash: None,
        }
    }

    /// Check if this value never expires in transit.
    pub fn is_immortal(&self) -> bool {
        self.ttl == TTL_INFINITY
    }

    /// Check if the TTL field is acceptable: infinite or positive.
    pub fn has_valid_ttl(&self) -> bool {
        self.ttl == TTL_INFINITY || self.ttl > 0
    }

    /// Copy with the payload stripped, for hash dumps in full-sync
    /// requests. Version, originator, hash and ttl_version survive.
    pub fn to_hash_only(&self) -> Value {
        Value {
            version: self.version,
            originator_id: self.originator_id.clone(),
            payload: None,
            ttl: self.ttl,
            ttl_version: self.ttl_version,
            hash: self.hash,
        }
    }

    /// Verify the stored hash against the payload, when both are present.
    pub fn hash_consistent(&self) -> bool {
        match (self.hash, &self.payload) {
            (Some(h), Some(payload)) => {
                h == digest(self.version, &self.originator_id, Some(payload))
            }
            _ => true,
        }
    }
}

/// Deterministic digest of an incarnation.
///
/// 64 bits suffice for divergence detection; collisions only cost an
/// extra payload exchange during full-sync.
pub fn digest(version: i64, originator_id: &str, payload: Option<&[u8]>) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(&version.to_le_bytes());
    hasher.write(originator_id.as_bytes());
    if let Some(payload) = payload {
        hasher.write(&[1]);
        hasher.write(payload);
    } else {
        hasher.write(&[0]);
    }
    hasher.finish()
}

/// Outcome of comparing two values for conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueOrder {
    /// First value wins.
    Greater,
    /// Second value wins.
    Less,
    /// Identical incarnation and ttl_version.
    Equal,
    /// Not enough information; callers treat this conservatively and
    /// exchange both directions.
    Unknown,
}

/// Compare two values to find out which is better.
///
/// Order of inspection: version, then originator, then ttl_version
/// when both hashes are present and equal, then raw payload bytes.
/// Missing payloads on either side yield [`ValueOrder::Unknown`].
pub fn compare_values(a: &Value, b: &Value) -> ValueOrder {
    if a.version != b.version {
        return if a.version > b.version {
            ValueOrder::Greater
        } else {
            ValueOrder::Less
        };
    }

    if a.originator_id != b.originator_id {
        return if a.originator_id > b.originator_id {
            ValueOrder::Greater
        } else {
            ValueOrder::Less
        };
    }

    // Same version and originator. Equal hashes imply equal payloads, so
    // only the TTL lineage can differ.
    if let (Some(ha), Some(hb)) = (a.hash, b.hash) {
        if ha == hb {
            return match a.ttl_version.cmp(&b.ttl_version) {
                std::cmp::Ordering::Greater => ValueOrder::Greater,
                std::cmp::Ordering::Less => ValueOrder::Less,
                std::cmp::Ordering::Equal => ValueOrder::Equal,
            };
        }
    }

    // Hashes missing or different: fall back to the payload bytes.
    match (&a.payload, &b.payload) {
        (Some(pa), Some(pb)) => match pa.cmp(pb) {
            std::cmp::Ordering::Greater => ValueOrder::Greater,
            std::cmp::Ordering::Less => ValueOrder::Less,
            std::cmp::Ordering::Equal => ValueOrder::Equal,
        },
        _ => ValueOrder::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(version: i64, originator: &str, payload: &[u8], ttl_version: i64) -> Value {
        Value::new(version, originator, payload.to_vec(), 1_000, ttl_version)
    }

    #[test]
    fn digest_is_deterministic() {
        let a = digest(3, "node-a", Some(b"alpha"));
        let b = digest(3, "node-a", Some(b"alpha"));
        assert_eq!(a, b);
        assert_ne!(a, digest(4, "node-a", Some(b"alpha")));
        assert_ne!(a, digest(3, "node-b", Some(b"alpha")));
        assert_ne!(a, digest(3, "node-a", Some(b"beta")));
        assert_ne!(a, digest(3, "node-a", None));
    }

    #[test]
    fn version_dominates() {
        let newer = val(2, "a", b"x", 0);
        let older = val(1, "z", b"zzz", 9);
        assert_eq!(compare_values(&newer, &older), ValueOrder::Greater);
        assert_eq!(compare_values(&older, &newer), ValueOrder::Less);
    }

    #[test]
    fn originator_breaks_version_tie() {
        let a = val(5, "node-a", b"x", 0);
        let b = val(5, "node-b", b"x", 0);
        assert_eq!(compare_values(&b, &a), ValueOrder::Greater);
        assert_eq!(compare_values(&a, &b), ValueOrder::Less);
    }

    #[test]
    fn equal_hash_compares_ttl_version() {
        let a = val(5, "node-a", b"x", 2);
        let b = val(5, "node-a", b"x", 1);
        assert_eq!(compare_values(&a, &b), ValueOrder::Greater);
        assert_eq!(compare_values(&b, &a), ValueOrder::Less);
        let c = val(5, "node-a", b"x", 2);
        assert_eq!(compare_values(&a, &c), ValueOrder::Equal);
    }

    #[test]
    fn payload_breaks_hash_mismatch() {
        let a = val(5, "node-a", b"beta", 0);
        let b = val(5, "node-a", b"alpha", 0);
        assert_eq!(compare_values(&a, &b), ValueOrder::Greater);
    }

    #[test]
    fn missing_payload_is_unknown() {
        let a = val(5, "node-a", b"x", 0);
        let mut b = val(5, "node-a", b"y", 0);
        b.payload = None;
        b.hash = None;
        assert_eq!(compare_values(&a, &b), ValueOrder::Unknown);
        assert_eq!(compare_values(&b, &a), ValueOrder::Unknown);
    }

    #[test]
    fn hash_only_copy_strips_payload() {
        let v = val(7, "node-a", b"payload", 3);
        let stripped = v.to_hash_only();
        assert!(stripped.payload.is_none());
        assert_eq!(stripped.hash, v.hash);
        assert_eq!(stripped.version, 7);
        assert_eq!(stripped.ttl_version, 3);
    }

    #[test]
    fn hash_consistency_check() {
        let v = val(1, "a", b"x", 0);
        assert!(v.hash_consistent());
        let mut corrupted = v.clone();
        corrupted.hash = Some(corrupted.hash.unwrap() ^ 1);
        assert!(!corrupted.hash_consistent());
    }
}
