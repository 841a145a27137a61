//! Peer session state machine.
//!
//! Each peer is driven by a [`PeerSession`]: a state machine without IO.
//! Tagged [`PeerInput`] events go in, tagged [`PeerAction`] effects come
//! out, and the flooder performs them. Keeping the machine pure makes
//! every transition testable with plain ticks.
//!
//! ```text
//! Idle -> Connecting -> Syncing -> Established
//!              ^            |          |
//!              |            v          v
//!              +--------- Backoff <----+        (-> Closed)
//! ```

use crate::core::config::FloodRate;
use crate::core::constants::{FLOOD_PENDING_MS, MAX_KEYS_PER_FLOOD};
use crate::core::time::Tick;
use crate::net::message::PeerMessage;
use crate::net::rate::TokenBucket;
use crate::store::value::{digest, Value};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created, not started.
    Idle,
    /// Dialing the transport.
    Connecting,
    /// Transport up, full-sync in flight.
    Syncing,
    /// Synchronized; floods and keep-alives flow.
    Established,
    /// Waiting out the reconnect delay.
    Backoff,
    /// Torn down; terminal.
    Closed,
}

/// Inputs to the session.
#[derive(Debug)]
pub enum PeerInput {
    /// Begin connecting.
    Start,
    /// The driver's dial completed and the Hello frame was sent.
    TransportUp,
    /// The transport failed or was closed by the peer.
    TransportDown,
    /// A frame arrived from this peer.
    Message(PeerMessage),
    /// The local store accepted a delta that must reach this peer.
    LocalDelta(HashMap<String, Value>),
    /// Periodic timer.
    Tick,
    /// Tear the session down for good.
    Stop,
}

/// Effects the driver must perform.
#[derive(Debug, PartialEq)]
pub enum PeerAction {
    /// Dial the peer and send Hello.
    Connect,
    /// Send a keep-alive frame.
    SendKeepAlive {
        /// Sequence number to carry.
        seq: u64,
    },
    /// Dump local key hashes and send a FullSyncReq.
    InitiateFullSync,
    /// Compute the three-way difference against these hashes and send a
    /// FullSyncResp.
    RespondFullSync {
        /// The initiator's payload-stripped key map.
        key_hashes: HashMap<String, Value>,
    },
    /// Merge these entries into the store; flood the accepted delta to
    /// every other established peer.
    MergeKeyVals {
        /// Entries received from this peer.
        key_vals: HashMap<String, Value>,
    },
    /// Send this peer our current values for the named keys (final
    /// full-sync leg).
    SendValues {
        /// Keys the peer asked for.
        keys: Vec<String>,
    },
    /// Send a flood frame with these entries (TTL decrement applies).
    SendFlood {
        /// Coalesced delta batch.
        key_vals: HashMap<String, Value>,
    },
    /// Drop the transport.
    Close,
}

/// Static session parameters.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Area the session serves.
    pub area: String,
    /// Remote node name.
    pub peer_id: String,
    /// Keep-alive emission interval, ms.
    pub keep_alive_interval_ms: u64,
    /// Deadline for one full-sync round, ms.
    pub sync_timeout_ms: u64,
    /// First reconnect delay, ms.
    pub initial_backoff_ms: u64,
    /// Reconnect delay ceiling, ms.
    pub max_backoff_ms: u64,
    /// Flood rate bounds.
    pub flood_rate: FloodRate,
    /// Delta coalescing window, ms.
    pub flood_pending_ms: u64,
    /// Cap on keys per flood frame.
    pub max_keys_per_flood: usize,
}

impl SessionConfig {
    /// Session parameters from node configuration.
    pub fn new(area: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            area: area.into(),
            peer_id: peer_id.into(),
            keep_alive_interval_ms: crate::core::constants::DEFAULT_KEEP_ALIVE_MS,
            sync_timeout_ms: crate::core::constants::DEFAULT_READ_TIMEOUT_MS,
            initial_backoff_ms: crate::core::constants::DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: crate::core::constants::DEFAULT_MAX_BACKOFF_MS,
            flood_rate: FloodRate::default(),
            flood_pending_ms: FLOOD_PENDING_MS,
            max_keys_per_flood: MAX_KEYS_PER_FLOOD,
        }
    }
}

/// Per-peer replication session.
pub struct PeerSession {
    config: SessionConfig,
    state: PeerState,

    bucket: TokenBucket,
    /// Deltas coalesced while the bucket is dry or the pending window is
    /// open. Keyed so a newer accepted value replaces an older one.
    pending: HashMap<String, Value>,
    pending_since: Option<Tick>,

    ka_seq: u64,
    last_ka_tx: Tick,
    last_rx: Tick,

    backoff_ms: u64,
    reconnect_at: Option<Tick>,
    sync_deadline: Option<Tick>,
    sync_timeouts: u64,

    rng: SmallRng,
}

impl PeerSession {
    /// Create an idle session.
    pub fn new(config: SessionConfig, now: Tick) -> Self {
        let bucket = TokenBucket::new(
            config.flood_rate.flood_msg_per_sec,
            config.flood_rate.flood_msg_burst_size,
            now,
        );
        // Seed from the peer name: deterministic per peer, distinct
        // across peers, so backoff jitter does not synchronize.
        let rng = SmallRng::seed_from_u64(digest(0, &config.peer_id, None));
        let backoff_ms = config.initial_backoff_ms;
        Self {
            config,
            state: PeerState::Idle,
            bucket,
            pending: HashMap::new(),
            pending_since: None,
            ka_seq: 0,
            last_ka_tx: now,
            last_rx: now,
            backoff_ms,
            reconnect_at: None,
            sync_deadline: None,
            sync_timeouts: 0,
            rng,
        }
    }

    /// Current state.
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Remote node name.
    pub fn peer_id(&self) -> &str {
        &self.config.peer_id
    }

    /// Check if floods flow on this session.
    pub fn is_established(&self) -> bool {
        self.state == PeerState::Established
    }

    /// Full-sync rounds that hit their deadline.
    pub fn sync_timeouts(&self) -> u64 {
        self.sync_timeouts
    }

    /// Number of coalesced keys waiting for a token.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed one input; returns the effects to perform, in order.
    pub fn handle(&mut self, input: PeerInput, now: Tick) -> Vec<PeerAction> {
        match input {
            PeerInput::Start => self.on_start(),
            PeerInput::TransportUp => self.on_transport_up(now),
            PeerInput::TransportDown => self.on_transport_down(now),
            PeerInput::Message(message) => self.on_message(message, now),
            PeerInput::LocalDelta(key_vals) => self.on_local_delta(key_vals, now),
            PeerInput::Tick => self.on_tick(now),
            PeerInput::Stop => self.on_stop(),
        }
    }

    fn on_start(&mut self) -> Vec<PeerAction> {
        match self.state {
            PeerState::Idle | PeerState::Backoff => {
                self.state = PeerState::Connecting;
                vec![PeerAction::Connect]
            }
            _ => Vec::new(),
        }
    }

    fn on_transport_up(&mut self, now: Tick) -> Vec<PeerAction> {
        if self.state != PeerState::Connecting {
            return Vec::new();
        }
        info!(peer = %self.config.peer_id, area = %self.config.area, "transport up, starting full-sync");
        self.state = PeerState::Syncing;
        self.backoff_ms = self.config.initial_backoff_ms;
        self.reconnect_at = None;
        self.sync_deadline = Some(now.add_ms(self.config.sync_timeout_ms));
        self.last_rx = now;
        self.last_ka_tx = now;
        vec![PeerAction::InitiateFullSync]
    }

    fn on_transport_down(&mut self, now: Tick) -> Vec<PeerAction> {
        match self.state {
            PeerState::Closed | PeerState::Idle | PeerState::Backoff => Vec::new(),
            _ => {
                let delay = self.jittered_backoff();
                warn!(
                    peer = %self.config.peer_id,
                    area = %self.config.area,
                    retry_in_ms = delay,
                    "peer unreachable, backing off"
                );
                self.state = PeerState::Backoff;
                self.reconnect_at = Some(now.add_ms(delay));
                self.sync_deadline = None;
                // Pending deltas are dropped: the full-sync on reconnect
                // reconciles anything missed.
                self.pending.clear();
                self.pending_since = None;
                vec![PeerAction::Close]
            }
        }
    }

    fn on_message(&mut self, message: PeerMessage, now: Tick) -> Vec<PeerAction> {
        if matches!(self.state, PeerState::Closed | PeerState::Idle) {
            return Vec::new();
        }
        self.last_rx = now;

        match message {
            PeerMessage::Hello { node_name, .. } => {
                debug!(peer = %node_name, "hello received");
                Vec::new()
            }
            PeerMessage::KeepAlive { seq, .. } => {
                debug!(peer = %self.config.peer_id, seq, "keep-alive received");
                Vec::new()
            }
            PeerMessage::FullSyncReq { key_hashes, .. } => {
                vec![PeerAction::RespondFullSync { key_hashes }]
            }
            PeerMessage::FullSyncResp {
                key_vals,
                tobe_updated_keys,
                ..
            } => {
                if self.state != PeerState::Syncing {
                    // A response for a sync we already abandoned.
                    return Vec::new();
                }
                let mut actions = Vec::new();
                if !key_vals.is_empty() {
                    actions.push(PeerAction::MergeKeyVals { key_vals });
                }
                if !tobe_updated_keys.is_empty() {
                    actions.push(PeerAction::SendValues {
                        keys: tobe_updated_keys,
                    });
                }
                info!(peer = %self.config.peer_id, area = %self.config.area, "full-sync complete");
                self.state = PeerState::Established;
                self.sync_deadline = None;
                actions
            }
            PeerMessage::Flood { key_vals, .. } => {
                if key_vals.is_empty() {
                    return Vec::new();
                }
                vec![PeerAction::MergeKeyVals { key_vals }]
            }
        }
    }

    fn on_local_delta(
        &mut self,
        key_vals: HashMap<String, Value>,
        now: Tick,
    ) -> Vec<PeerAction> {
        if self.state != PeerState::Established || key_vals.is_empty() {
            return Vec::new();
        }
        if self.pending.is_empty() {
            self.pending_since = Some(now);
        }
        self.pending.extend(key_vals);
        self.maybe_flush(now)
    }

    fn on_tick(&mut self, now: Tick) -> Vec<PeerAction> {
        match self.state {
            PeerState::Backoff => {
                if self.reconnect_at.is_some_and(|at| now.is_at_or_after(at)) {
                    self.state = PeerState::Connecting;
                    self.reconnect_at = None;
                    vec![PeerAction::Connect]
                } else {
                    Vec::new()
                }
            }
            PeerState::Syncing => {
                if self.sync_deadline.is_some_and(|d| now.is_at_or_after(d)) {
                    self.sync_timeouts += 1;
                    warn!(peer = %self.config.peer_id, area = %self.config.area, "full-sync timed out, restarting");
                    self.sync_deadline = Some(now.add_ms(self.config.sync_timeout_ms));
                    vec![PeerAction::InitiateFullSync]
                } else {
                    Vec::new()
                }
            }
            PeerState::Established => {
                // Two missed keep-alive intervals means the peer is gone.
                if now.since(self.last_rx) >= 2 * self.config.keep_alive_interval_ms {
                    return self.on_transport_down(now);
                }
                let mut actions = Vec::new();
                if now.since(self.last_ka_tx) >= self.config.keep_alive_interval_ms {
                    self.ka_seq += 1;
                    self.last_ka_tx = now;
                    actions.push(PeerAction::SendKeepAlive { seq: self.ka_seq });
                }
                actions.extend(self.maybe_flush(now));
                actions
            }
            _ => Vec::new(),
        }
    }

    fn on_stop(&mut self) -> Vec<PeerAction> {
        if self.state == PeerState::Closed {
            return Vec::new();
        }
        self.state = PeerState::Closed;
        self.pending.clear();
        vec![PeerAction::Close]
    }

    /// Flush coalesced deltas once the pending window has elapsed and
    /// tokens are available, in bounded chunks.
    fn maybe_flush(&mut self, now: Tick) -> Vec<PeerAction> {
        let Some(since) = self.pending_since else {
            return Vec::new();
        };
        if now.since(since) < self.config.flood_pending_ms {
            return Vec::new();
        }

        let mut actions = Vec::new();
        while !self.pending.is_empty() && self.bucket.try_acquire(now) {
            let chunk: HashMap<String, Value> = if self.pending.len() <= self.config.max_keys_per_flood
            {
                std::mem::take(&mut self.pending)
            } else {
                let keys: Vec<String> = self
                    .pending
                    .keys()
                    .take(self.config.max_keys_per_flood)
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|k| self.pending.remove_entry(&k))
                    .collect()
            };
            actions.push(PeerAction::SendFlood { key_vals: chunk });
        }

        if self.pending.is_empty() {
            self.pending_since = None;
        }
        actions
    }

    /// Current backoff with jitter, doubling the base for next time.
    fn jittered_backoff(&mut self) -> u64 {
        let base = self.backoff_ms;
        self.backoff_ms = (self.backoff_ms * 2).min(self.config.max_backoff_ms);
        // Uniform in [base/2, base]: staggered but never immediate.
        let half = (base / 2).max(1);
        half + self.rng.gen_range(0..=base.saturating_sub(half))
    }
}
