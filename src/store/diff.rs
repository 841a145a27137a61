//! Three-way full-sync difference.
//!
//! Given my key map and the hash dump a sync initiator sent, compute the
//! publication that (a) carries every entry of mine the initiator should
//! accept and (b) names every key where the initiator holds the better
//! value, so it knows what to send back in the final leg.

use crate::store::types::Publication;
use crate::store::value::{compare_values, Value, ValueOrder};
use std::collections::{HashMap, HashSet};

/// Compute the full-sync response publication.
///
/// `key_vals` gets my entries that are strictly better or ambiguous, plus
/// entries only I hold. `tobe_updated_keys` gets keys where the requester
/// is strictly better or ambiguous, plus keys only it holds. Ambiguous
/// comparisons land on both sides so the next leg resolves them with full
/// values.
pub fn dump_difference(
    area: &str,
    my_key_vals: &HashMap<String, Value>,
    req_key_vals: &HashMap<String, Value>,
) -> Publication {
    let mut publication = Publication::new(area);
    let mut tobe_updated_keys = Vec::new();

    let all_keys: HashSet<&String> = my_key_vals.keys().chain(req_key_vals.keys()).collect();

    for key in all_keys {
        match (my_key_vals.get(key), req_key_vals.get(key)) {
            (None, _) => tobe_updated_keys.push(key.clone()),
            (Some(my_val), None) => {
                publication.key_vals.insert(key.clone(), my_val.clone());
            }
            (Some(my_val), Some(req_val)) => match compare_values(my_val, req_val) {
                ValueOrder::Greater => {
                    publication.key_vals.insert(key.clone(), my_val.clone());
                }
                ValueOrder::Less => tobe_updated_keys.push(key.clone()),
                ValueOrder::Unknown => {
                    publication.key_vals.insert(key.clone(), my_val.clone());
                    tobe_updated_keys.push(key.clone());
                }
                ValueOrder::Equal => {}
            },
        }
    }

    publication.tobe_updated_keys = Some(tobe_updated_keys);
    publication
}
