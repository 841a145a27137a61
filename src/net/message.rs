//! Flood protocol messages.
//!
//! Everything peers exchange is one [`PeerMessage`] per frame. `Hello`
//! is transport setup (it names the dialing node so inbound frames can
//! be attributed to a peer session); the remaining four types are the
//! replication protocol proper.

use crate::store::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One frame on a peer connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PeerMessage {
    /// First frame on every connection: who is dialing, for which area.
    Hello {
        /// Dialing node's name.
        node_name: String,
        /// Area this connection serves.
        area: String,
    },

    /// Full-sync leg one: the initiator's payload-stripped key map.
    FullSyncReq {
        /// Area being synchronized.
        area: String,
        /// Payload-stripped values: version, originator, hash,
        /// ttl_version per key.
        key_hashes: HashMap<String, Value>,
    },

    /// Full-sync leg two: values the initiator should accept plus keys
    /// it should send back.
    FullSyncResp {
        /// Area being synchronized.
        area: String,
        /// Entries the initiator should merge.
        key_vals: HashMap<String, Value>,
        /// Keys where the initiator holds the better value.
        tobe_updated_keys: Vec<String>,
    },

    /// Incremental delta flood. TTLs are already decremented for this hop.
    Flood {
        /// Area the delta belongs to.
        area: String,
        /// Accepted entries to merge.
        key_vals: HashMap<String, Value>,
    },

    /// Liveness probe.
    KeepAlive {
        /// Area the session serves.
        area: String,
        /// Monotonic per-session sequence number.
        seq: u64,
    },
}

impl PeerMessage {
    /// Area this message belongs to.
    pub fn area(&self) -> &str {
        match self {
            PeerMessage::Hello { area, .. }
            | PeerMessage::FullSyncReq { area, .. }
            | PeerMessage::FullSyncResp { area, .. }
            | PeerMessage::Flood { area, .. }
            | PeerMessage::KeepAlive { area, .. } => area,
        }
    }

    /// Whether this message may be dropped under backpressure.
    ///
    /// Keep-alives are droppable; merge-carrying messages never are.
    pub fn is_droppable(&self) -> bool {
        matches!(self, PeerMessage::KeepAlive { .. })
    }

    /// Short kind tag for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            PeerMessage::Hello { .. } => "hello",
            PeerMessage::FullSyncReq { .. } => "full_sync_req",
            PeerMessage::FullSyncResp { .. } => "full_sync_resp",
            PeerMessage::Flood { .. } => "flood",
            PeerMessage::KeepAlive { .. } => "keep_alive",
        }
    }
}
