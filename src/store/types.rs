//! Store-facing data types.
//!
//! A [`Publication`] is the unit both of full-sync responses and of the
//! delta stream subscribers and peers observe.

use crate::store::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A batch of key-value state emitted by a store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Replication domain this publication belongs to.
    pub area: String,

    /// Entries the receiver should merge.
    pub key_vals: HashMap<String, Value>,

    /// Keys removed locally because their TTL ran out.
    pub expired_keys: Vec<String>,

    /// Full-sync only: keys where the requester holds the better value
    /// and should send it back.
    pub tobe_updated_keys: Option<Vec<String>>,
}

impl Publication {
    /// Create an empty publication for an area.
    pub fn new(area: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            ..Default::default()
        }
    }

    /// Create a delta publication from accepted key-vals.
    pub fn with_key_vals(area: impl Into<String>, key_vals: HashMap<String, Value>) -> Self {
        Self {
            area: area.into(),
            key_vals,
            ..Default::default()
        }
    }

    /// Check if there is nothing to deliver.
    pub fn is_empty(&self) -> bool {
        self.key_vals.is_empty()
            && self.expired_keys.is_empty()
            && self
                .tobe_updated_keys
                .as_ref()
                .map_or(true, |keys| keys.is_empty())
    }
}

/// Reply to a `key_set_values` request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SetKeyValsResult {
    /// Keys the merge accepted, in no particular order. Callers infer
    /// rejections from the difference against what they submitted.
    pub accepted_keys: Vec<String>,
}

/// A peer as seen by the control surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Stable peer node name.
    pub peer_id: String,
    /// Transport address, `host:port`.
    pub addr: String,
}

/// Serializable description of a key filter, used on the control surface
/// and in configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterSpec {
    /// Key prefix regexes.
    #[serde(default)]
    pub key_prefixes: Vec<String>,
    /// Originator IDs.
    #[serde(default)]
    pub originator_ids: Vec<String>,
    /// AND/OR combination, defaults to OR.
    #[serde(default)]
    pub operator: crate::store::filter::FilterOperator,
}

impl FilterSpec {
    /// Compile into a [`crate::store::filter::KeyFilter`].
    pub fn compile(&self) -> crate::core::error::KvResult<crate::store::filter::KeyFilter> {
        crate::store::filter::KeyFilter::new(
            self.key_prefixes.clone(),
            self.originator_ids.iter().cloned().collect(),
            self.operator,
        )
    }

    /// Whether this spec matches everything (no dimensions configured).
    pub fn is_match_all(&self) -> bool {
        self.key_prefixes.is_empty() && self.originator_ids.is_empty()
    }
}
