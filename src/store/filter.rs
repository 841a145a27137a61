//! Key and originator filters.
//!
//! A [`KeyFilter`] combines a set of key-prefix regexes with a set of
//! originator IDs under an AND/OR operator. Stores apply filters on merge
//! ingress and on dump/flood egress.

use crate::core::error::{KvError, KvResult};
use crate::store::value::Value;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// How the prefix and originator dimensions combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FilterOperator {
    /// Match if any configured dimension matches.
    #[default]
    #[serde(rename = "OR")]
    Or,
    /// Match if every configured dimension matches.
    #[serde(rename = "AND")]
    And,
}

/// Predicate over `(key, value)` pairs.
#[derive(Debug, Clone)]
pub struct KeyFilter {
    key_prefixes: Vec<String>,
    regex_set: RegexSet,
    originator_ids: HashSet<String>,
    operator: FilterOperator,
}

impl KeyFilter {
    /// Compile a filter. Fails if any prefix regex is malformed.
    pub fn new(
        key_prefixes: Vec<String>,
        originator_ids: HashSet<String>,
        operator: FilterOperator,
    ) -> KvResult<Self> {
        // Anchor each prefix so "adj:" does not match mid-key.
        let anchored: Vec<String> = key_prefixes.iter().map(|p| format!("^{p}")).collect();
        let regex_set = RegexSet::new(&anchored).map_err(|e| {
            KvError::invalid_config(format!("bad key prefix regex: {e}"))
        })?;
        Ok(Self {
            key_prefixes,
            regex_set,
            originator_ids,
            operator,
        })
    }

    /// Filter matching everything.
    pub fn match_all() -> Self {
        Self::new(Vec::new(), HashSet::new(), FilterOperator::Or)
            .expect("empty filter always compiles")
    }

    /// Configured key prefixes.
    pub fn key_prefixes(&self) -> &[String] {
        &self.key_prefixes
    }

    /// Configured originator IDs.
    pub fn originator_ids(&self) -> &HashSet<String> {
        &self.originator_ids
    }

    /// Configured operator.
    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    /// Evaluate the filter against a key and its value.
    pub fn matches(&self, key: &str, value: &Value) -> bool {
        match self.operator {
            FilterOperator::Or => self.matches_any(key, value),
            FilterOperator::And => self.matches_all(key, value),
        }
    }

    fn matches_any(&self, key: &str, value: &Value) -> bool {
        if self.key_prefixes.is_empty() && self.originator_ids.is_empty() {
            // No filter and nothing to match against.
            return true;
        }
        if !self.key_prefixes.is_empty() && self.regex_set.is_match(key) {
            return true;
        }
        if !self.originator_ids.is_empty() && self.originator_ids.contains(&value.originator_id) {
            return true;
        }
        false
    }

    fn matches_all(&self, key: &str, value: &Value) -> bool {
        if self.key_prefixes.is_empty() && self.originator_ids.is_empty() {
            return true;
        }
        if !self.key_prefixes.is_empty() && !self.regex_set.is_match(key) {
            return false;
        }
        if !self.originator_ids.is_empty() && !self.originator_ids.contains(&value.originator_id) {
            return false;
        }
        true
    }
}

impl std::fmt::Display for KeyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "prefixes=[{}] originators=[{}] op={:?}",
            self.key_prefixes.join(", "),
            self.originator_ids
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", "),
            self.operator
        )
    }
}
