//! Store event loop and peer transport driver.
//!
//! One [`Flooder`] task runs per area. It owns the area's [`KvStoreDb`]
//! outright, so every merge happens on this loop, and drives a
//! [`PeerSession`] per peer, performing the actions the sessions emit:
//! dialing, framing, full-sync legs, delta fan-out, keep-alives.
//!
//! External callers reach the store through the [`StoreCommand`] mailbox.
//! Per-peer ordering is FIFO; there is no cross-peer ordering, the merge
//! rule makes it unnecessary.

use crate::core::config::{Config, FloodRate, TimerConfig};
use crate::core::error::{KvError, KvResult};
use crate::core::time::{Clock, Tick};
use crate::net::codec::{DecodeResult, FrameCodec};
use crate::net::message::PeerMessage;
use crate::net::peer::{PeerAction, PeerInput, PeerSession, PeerState, SessionConfig};
use crate::ops::observability::{CounterSnapshot, KvCounters};
use crate::store::filter::KeyFilter;
use crate::store::kv_store::KvStoreDb;
use crate::store::ttl::decrement_ttl;
use crate::store::types::{FilterSpec, PeerSpec, Publication, SetKeyValsResult};
use crate::store::value::Value;
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Frame writer for one connection.
///
/// Two lanes implement the backpressure policy: merge-carrying frames
/// ride an unbounded FIFO and are never dropped; keep-alives ride a
/// latest-wins slot, so a slow connection sheds superseded probes first.
struct ConnWriter {
    data_tx: mpsc::UnboundedSender<PeerMessage>,
    keep_alive_tx: watch::Sender<Option<PeerMessage>>,
}

impl ConnWriter {
    /// Queue a frame on the lane its droppability demands.
    fn send(&self, message: PeerMessage) -> Result<(), ()> {
        if message.is_droppable() {
            // Overwriting sheds the previous, now stale, keep-alive.
            self.keep_alive_tx.send(Some(message)).map_err(|_| ())
        } else {
            self.data_tx.send(message).map_err(|_| ())
        }
    }
}

/// Requests the control surface sends to a store loop.
pub enum StoreCommand {
    /// Merge a batch and report the accepted keys.
    SetKeyVals {
        key_vals: HashMap<String, Value>,
        resp: oneshot::Sender<SetKeyValsResult>,
    },
    /// Read specific keys.
    GetKeyVals {
        keys: Vec<String>,
        resp: oneshot::Sender<Publication>,
    },
    /// Dump all entries passing a filter.
    DumpAll {
        filter: Option<FilterSpec>,
        resp: oneshot::Sender<KvResult<Publication>>,
    },
    /// Tombstone keys.
    DeleteKeys {
        keys: Vec<String>,
        resp: oneshot::Sender<KvResult<SetKeyValsResult>>,
    },
    /// Register a peer and start its session.
    AddPeer {
        peer: PeerSpec,
        resp: oneshot::Sender<()>,
    },
    /// Tear a peer session down.
    DelPeer {
        peer_id: String,
        resp: oneshot::Sender<bool>,
    },
    /// Describe every peer session.
    PeerDump {
        resp: oneshot::Sender<Vec<PeerStatus>>,
    },
    /// Open a publication stream from "now".
    Subscribe {
        filter: Option<FilterSpec>,
        resp: oneshot::Sender<KvResult<mpsc::UnboundedReceiver<Publication>>>,
    },
    /// Counter snapshot.
    Counters {
        resp: oneshot::Sender<CounterSnapshot>,
    },
    /// Export all entries (snapshot persistence).
    Export {
        resp: oneshot::Sender<Vec<(String, Value)>>,
    },
    /// Stop the loop; cancels peer sessions.
    Shutdown,
}

/// One peer as reported by `peer_dump`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PeerStatus {
    /// Peer node name.
    pub peer_id: String,
    /// Configured transport address; empty for inbound-only peers.
    pub addr: String,
    /// Session state name.
    pub state: String,
}

/// An accepted inbound connection, routed here after its Hello frame.
pub struct InboundConn {
    /// Dialing node's name from the Hello frame.
    pub peer_id: String,
    /// The connection itself.
    pub stream: TcpStream,
    /// Bytes read past the Hello frame while parsing it.
    pub initial: BytesMut,
}

/// Internal events from per-connection IO tasks.
enum PeerEvent {
    /// Outbound dial completed; Hello has been queued.
    Dialed {
        peer_id: String,
        writer: ConnWriter,
    },
    /// Outbound dial failed or timed out.
    DialFailed { peer_id: String },
    /// A frame arrived from this peer (either direction).
    Received { peer_id: String, message: PeerMessage },
    /// A connection to this peer closed.
    ConnClosed { peer_id: String, outbound: bool },
}

/// Per-peer bookkeeping around the session state machine.
struct PeerEntry {
    spec: PeerSpec,
    session: PeerSession,
    /// Writer for the connection we dialed.
    out_tx: Option<ConnWriter>,
    /// Writer for the connection the peer dialed.
    in_tx: Option<ConnWriter>,
    /// A dial task is in flight.
    dialing: bool,
    /// Session sync timeouts already folded into the shared counters.
    sync_timeouts_seen: u64,
}

impl PeerEntry {
    /// Preferred writer: the connection we own, else the inbound one.
    fn writer(&self) -> Option<&ConnWriter> {
        self.out_tx.as_ref().or(self.in_tx.as_ref())
    }
}

/// Per-area store loop and peer driver.
pub struct Flooder {
    area: String,
    node_name: String,
    db: KvStoreDb,
    egress_filter: Option<KeyFilter>,
    ttl_decrement_ms: i64,
    timers: TimerConfig,
    flood_rate: FloodRate,
    backoff_initial_ms: u64,
    backoff_max_ms: u64,
    counters: Arc<KvCounters>,
    clock: Arc<dyn Clock>,

    peers: HashMap<String, PeerEntry>,

    cmd_rx: mpsc::Receiver<StoreCommand>,
    inbound_rx: mpsc::Receiver<InboundConn>,
    event_tx: mpsc::Sender<PeerEvent>,
    event_rx: mpsc::Receiver<PeerEvent>,
}

/// Handle for talking to a running flooder.
#[derive(Clone)]
pub struct StoreHandle {
    /// Area served by the loop.
    pub area: String,
    /// Command mailbox.
    pub cmd_tx: mpsc::Sender<StoreCommand>,
    /// Where the listener routes inbound connections for this area.
    pub inbound_tx: mpsc::Sender<InboundConn>,
}

impl Flooder {
    /// Build a flooder and its handle for one area.
    pub fn new(
        area: impl Into<String>,
        config: &Config,
        db: KvStoreDb,
        clock: Arc<dyn Clock>,
    ) -> (Self, StoreHandle) {
        let area = area.into();
        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (event_tx, event_rx) = mpsc::channel(1_024);
        let counters = db.counters().clone();
        let egress_filter = config
            .kv_store_filter()
            .ok()
            .flatten();

        let flooder = Self {
            node_name: config.node_name.clone(),
            db,
            egress_filter,
            ttl_decrement_ms: config.kvstore.ttl_decrement_ms,
            timers: config.timers,
            flood_rate: config.kvstore.flood_rate,
            backoff_initial_ms: config.backoff.initial_backoff_ms,
            backoff_max_ms: config.backoff.max_backoff_ms,
            counters,
            clock,
            peers: HashMap::new(),
            cmd_rx,
            inbound_rx,
            event_tx,
            event_rx,
            area: area.clone(),
        };
        let handle = StoreHandle {
            area,
            cmd_tx,
            inbound_tx,
        };
        (flooder, handle)
    }

    fn session_config(&self, peer_id: &str) -> SessionConfig {
        SessionConfig {
            area: self.area.clone(),
            peer_id: peer_id.to_string(),
            keep_alive_interval_ms: self.timers.keep_alive_interval_ms,
            sync_timeout_ms: self.timers.read_timeout_ms,
            initial_backoff_ms: self.backoff_initial_ms,
            max_backoff_ms: self.backoff_max_ms,
            flood_rate: self.flood_rate,
            flood_pending_ms: crate::core::constants::FLOOD_PENDING_MS,
            max_keys_per_flood: crate::core::constants::MAX_KEYS_PER_FLOOD,
        }
    }

    /// Run until shutdown.
    pub async fn run(mut self) {
        info!(area = %self.area, "store loop running");
        let mut timer = tokio::time::interval(Duration::from_millis(
            crate::core::constants::KEEP_ALIVE_CHECK_INTERVAL_MS,
        ));
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => {
                    match command {
                        Some(StoreCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(event) = self.event_rx.recv() => {
                    self.handle_event(event);
                }
                Some(inbound) = self.inbound_rx.recv() => {
                    self.register_inbound(inbound);
                }
                _ = timer.tick() => {
                    self.on_timer();
                }
            }
        }

        // Shutdown: cancel every session and drop the transports.
        let now = self.clock.now();
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.drive(&peer_id, PeerInput::Stop, now);
        }
        info!(area = %self.area, "store loop stopped");
    }

    fn handle_command(&mut self, command: StoreCommand) {
        let now = self.clock.now();
        match command {
            StoreCommand::SetKeyVals { key_vals, resp } => {
                let result = self.db.set_key_vals(key_vals, now);
                let accepted = result.accepted_keys();
                self.flood_delta(result.updates, None, now);
                let _ = resp.send(SetKeyValsResult {
                    accepted_keys: accepted,
                });
            }
            StoreCommand::GetKeyVals { keys, resp } => {
                let _ = resp.send(self.db.get_key_vals(&keys));
            }
            StoreCommand::DumpAll { filter, resp } => {
                let _ = resp.send(self.dump_all(filter));
            }
            StoreCommand::DeleteKeys { keys, resp } => {
                let result = match self.db.delete_keys(&keys, now) {
                    Ok(result) => {
                        let accepted = result.accepted_keys();
                        self.flood_delta(result.updates, None, now);
                        Ok(SetKeyValsResult {
                            accepted_keys: accepted,
                        })
                    }
                    Err(e) => Err(e),
                };
                let _ = resp.send(result);
            }
            StoreCommand::AddPeer { peer, resp } => {
                self.add_peer(peer, now);
                let _ = resp.send(());
            }
            StoreCommand::DelPeer { peer_id, resp } => {
                let existed = self.peers.contains_key(&peer_id);
                if existed {
                    self.drive(&peer_id, PeerInput::Stop, now);
                    self.peers.remove(&peer_id);
                }
                let _ = resp.send(existed);
            }
            StoreCommand::PeerDump { resp } => {
                let peers = self
                    .peers
                    .values()
                    .map(|entry| PeerStatus {
                        peer_id: entry.spec.peer_id.clone(),
                        addr: entry.spec.addr.clone(),
                        state: format!("{:?}", entry.session.state()),
                    })
                    .collect();
                let _ = resp.send(peers);
            }
            StoreCommand::Subscribe { filter, resp } => {
                let result = match filter {
                    None => Ok(self.db.subscribe(None)),
                    Some(spec) => spec.compile().map(|f| self.db.subscribe(Some(f))),
                };
                let _ = resp.send(result);
            }
            StoreCommand::Counters { resp } => {
                let _ = resp.send(self.counters.snapshot());
            }
            StoreCommand::Export { resp } => {
                let _ = resp.send(self.db.export_entries());
            }
            StoreCommand::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn dump_all(&mut self, filter: Option<FilterSpec>) -> KvResult<Publication> {
        match filter {
            None => Ok(self.db.dump_all(None)),
            Some(spec) if spec.is_match_all() => Ok(self.db.dump_all(None)),
            Some(spec) => {
                let filter = spec.compile().map_err(|e| {
                    KvError::invalid_request(format!("bad dump filter: {e}"))
                })?;
                Ok(self.db.dump_all(Some(&filter)))
            }
        }
    }

    fn add_peer(&mut self, peer: PeerSpec, now: Tick) {
        let peer_id = peer.peer_id.clone();
        if let Some(existing) = self.peers.get_mut(&peer_id) {
            existing.spec = peer;
            return;
        }
        let session = PeerSession::new(self.session_config(&peer_id), now);
        self.peers.insert(
            peer_id.clone(),
            PeerEntry {
                spec: peer,
                session,
                out_tx: None,
                in_tx: None,
                dialing: false,
                sync_timeouts_seen: 0,
            },
        );
        self.drive(&peer_id, PeerInput::Start, now);
    }

    fn register_inbound(&mut self, inbound: InboundConn) {
        let now = self.clock.now();
        let peer_id = inbound.peer_id.clone();
        debug!(area = %self.area, peer = %peer_id, "inbound connection");

        if !self.peers.contains_key(&peer_id) {
            // A neighbor we have not been told about yet; serve it and
            // let the session sync both directions.
            let session = PeerSession::new(self.session_config(&peer_id), now);
            self.peers.insert(
                peer_id.clone(),
                PeerEntry {
                    spec: PeerSpec {
                        peer_id: peer_id.clone(),
                        addr: String::new(),
                    },
                    session,
                    out_tx: None,
                    in_tx: None,
                    dialing: false,
                    sync_timeouts_seen: 0,
                },
            );
        }

        let writer = spawn_conn_tasks(
            inbound.stream,
            peer_id.clone(),
            false,
            self.event_tx.clone(),
            None,
            inbound.initial,
        );
        if let Some(entry) = self.peers.get_mut(&peer_id) {
            entry.in_tx = Some(writer);
        }

        // An inbound transport is as good as one we dialed for bringing
        // the session up.
        match self.peers[&peer_id].session.state() {
            PeerState::Idle | PeerState::Backoff => {
                self.drive(&peer_id, PeerInput::Start, now);
                self.drive(&peer_id, PeerInput::TransportUp, now);
            }
            PeerState::Connecting => {
                self.drive(&peer_id, PeerInput::TransportUp, now);
            }
            _ => {}
        }
    }

    fn handle_event(&mut self, event: PeerEvent) {
        let now = self.clock.now();
        match event {
            PeerEvent::Dialed { peer_id, writer } => {
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.dialing = false;
                    entry.out_tx = Some(writer);
                    self.drive(&peer_id, PeerInput::TransportUp, now);
                }
            }
            PeerEvent::DialFailed { peer_id } => {
                if let Some(entry) = self.peers.get_mut(&peer_id) {
                    entry.dialing = false;
                    KvCounters::bump(&self.counters.peer_backoffs);
                    self.drive(&peer_id, PeerInput::TransportDown, now);
                }
            }
            PeerEvent::Received { peer_id, message } => {
                if message.area() != self.area {
                    warn!(
                        area = %self.area,
                        peer = %peer_id,
                        got = message.area(),
                        "frame for wrong area dropped"
                    );
                    return;
                }
                self.drive(&peer_id, PeerInput::Message(message), now);
            }
            PeerEvent::ConnClosed { peer_id, outbound } => {
                let Some(entry) = self.peers.get_mut(&peer_id) else {
                    return;
                };
                if outbound {
                    entry.out_tx = None;
                } else {
                    entry.in_tx = None;
                }
                // Only a fully disconnected peer drops the session.
                if entry.out_tx.is_none() && entry.in_tx.is_none() {
                    KvCounters::bump(&self.counters.peer_backoffs);
                    self.drive(&peer_id, PeerInput::TransportDown, now);
                }
            }
        }
    }

    fn on_timer(&mut self) {
        let now = self.clock.now();

        // Session housekeeping: keep-alives, backoff expiry, sync
        // deadlines, pending flushes.
        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.drive(&peer_id, PeerInput::Tick, now);
        }

        // Re-advertise TTLs for self-originated keys; the delta floods
        // like any accepted batch.
        if let Some(refresh) = self.db.ttl_refresh(now) {
            self.flood_delta(refresh.key_vals, None, now);
        }

        // Expiry is local; expired keys are published, never flooded.
        self.db.advance_expiry(now);
    }

    /// Feed one input to a session and perform the resulting actions.
    fn drive(&mut self, peer_id: &str, input: PeerInput, now: Tick) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        let actions = entry.session.handle(input, now);
        let timeouts = entry.session.sync_timeouts();
        if timeouts > entry.sync_timeouts_seen {
            KvCounters::add(
                &self.counters.full_sync_timeouts,
                timeouts - entry.sync_timeouts_seen,
            );
            entry.sync_timeouts_seen = timeouts;
        }
        for action in actions {
            self.perform(peer_id, action, now);
        }
    }

    fn perform(&mut self, peer_id: &str, action: PeerAction, now: Tick) {
        match action {
            PeerAction::Connect => self.start_dial(peer_id),
            PeerAction::Close => {
                if let Some(entry) = self.peers.get_mut(peer_id) {
                    entry.out_tx = None;
                    entry.in_tx = None;
                }
            }
            PeerAction::SendKeepAlive { seq } => {
                KvCounters::bump(&self.counters.keep_alives_sent);
                self.send(
                    peer_id,
                    PeerMessage::KeepAlive {
                        area: self.area.clone(),
                        seq,
                    },
                );
            }
            PeerAction::InitiateFullSync => {
                let key_hashes = self.db.dump_hashes(self.egress_filter.as_ref());
                self.send(
                    peer_id,
                    PeerMessage::FullSyncReq {
                        area: self.area.clone(),
                        key_hashes,
                    },
                );
            }
            PeerAction::RespondFullSync { key_hashes } => {
                let diff = self.db.full_sync_response(&key_hashes);
                KvCounters::bump(&self.counters.full_syncs_completed);
                self.send(
                    peer_id,
                    PeerMessage::FullSyncResp {
                        area: self.area.clone(),
                        key_vals: self.decrement_batch(diff.key_vals),
                        tobe_updated_keys: diff.tobe_updated_keys.unwrap_or_default(),
                    },
                );
            }
            PeerAction::MergeKeyVals { key_vals } => {
                let result = self.db.set_key_vals(key_vals, now);
                if result.updates.is_empty() {
                    // Nothing accepted: suppress the re-flood entirely.
                    KvCounters::bump(&self.counters.floods_suppressed);
                } else {
                    self.flood_delta(result.updates, Some(peer_id), now);
                }
            }
            PeerAction::SendValues { keys } => {
                let publication = self.db.get_key_vals(&keys);
                let key_vals = self.decrement_batch(publication.key_vals);
                if !key_vals.is_empty() {
                    self.send(
                        peer_id,
                        PeerMessage::Flood {
                            area: self.area.clone(),
                            key_vals,
                        },
                    );
                }
            }
            PeerAction::SendFlood { key_vals } => {
                let key_vals = self.decrement_batch(key_vals);
                if key_vals.is_empty() {
                    return;
                }
                KvCounters::bump(&self.counters.floods_sent);
                self.send(
                    peer_id,
                    PeerMessage::Flood {
                        area: self.area.clone(),
                        key_vals,
                    },
                );
            }
        }
    }

    /// Apply the per-hop TTL decrement; entries that would die in
    /// transit are not forwarded.
    fn decrement_batch(&self, key_vals: HashMap<String, Value>) -> HashMap<String, Value> {
        key_vals
            .into_iter()
            .filter_map(|(key, value)| {
                decrement_ttl(&value, self.ttl_decrement_ms).map(|v| (key, v))
            })
            .collect()
    }

    /// Queue an accepted delta to every established session except the
    /// one it arrived on.
    fn flood_delta(
        &mut self,
        updates: HashMap<String, Value>,
        exclude: Option<&str>,
        now: Tick,
    ) {
        if updates.is_empty() {
            return;
        }
        let targets: Vec<String> = self
            .peers
            .values()
            .filter(|entry| entry.session.is_established())
            .filter(|entry| exclude != Some(entry.session.peer_id()))
            .map(|entry| entry.spec.peer_id.clone())
            .collect();
        for peer_id in targets {
            self.drive(&peer_id, PeerInput::LocalDelta(updates.clone()), now);
            if self
                .peers
                .get(&peer_id)
                .is_some_and(|entry| entry.session.pending_len() > 0)
            {
                KvCounters::bump(&self.counters.floods_throttled);
            }
        }
    }

    /// Send one frame to a peer, preferring the connection we dialed.
    /// Merge-carrying frames are queued unconditionally; under
    /// backpressure only superseded keep-alives are shed.
    fn send(&mut self, peer_id: &str, message: PeerMessage) {
        let Some(entry) = self.peers.get(peer_id) else {
            return;
        };
        let Some(writer) = entry.writer() else {
            debug!(peer = %peer_id, kind = message.kind(), "no transport, frame dropped");
            return;
        };
        let kind = message.kind();
        if writer.send(message).is_err() {
            // The writer task is gone; a ConnClosed event is already on
            // its way and the session will resync after reconnect.
            debug!(peer = %peer_id, kind, "write lane closed");
        }
    }

    fn start_dial(&mut self, peer_id: &str) {
        let Some(entry) = self.peers.get_mut(peer_id) else {
            return;
        };
        if entry.dialing || entry.spec.addr.is_empty() {
            return;
        }
        entry.dialing = true;

        let addr = entry.spec.addr.clone();
        let peer_id = peer_id.to_string();
        let area = self.area.clone();
        let node_name = self.node_name.clone();
        let event_tx = self.event_tx.clone();
        let conn_timeout = Duration::from_millis(self.timers.conn_timeout_ms);

        tokio::spawn(async move {
            let dialed = tokio::time::timeout(conn_timeout, TcpStream::connect(&addr)).await;
            match dialed {
                Ok(Ok(stream)) => {
                    let hello = PeerMessage::Hello {
                        node_name,
                        area,
                    };
                    let writer = spawn_conn_tasks(
                        stream,
                        peer_id.clone(),
                        true,
                        event_tx.clone(),
                        Some(hello),
                        BytesMut::new(),
                    );
                    let _ = event_tx.send(PeerEvent::Dialed { peer_id, writer }).await;
                }
                Ok(Err(e)) => {
                    debug!(peer = %peer_id, %addr, "dial failed: {e}");
                    let _ = event_tx.send(PeerEvent::DialFailed { peer_id }).await;
                }
                Err(_) => {
                    debug!(peer = %peer_id, %addr, "dial timed out");
                    let _ = event_tx.send(PeerEvent::DialFailed { peer_id }).await;
                }
            }
        });
    }
}

/// Spawn the read/write tasks for one connection.
///
/// Returns the frame writer. The reader forwards decoded frames as
/// events; either side closing surfaces as `ConnClosed`.
fn spawn_conn_tasks(
    stream: TcpStream,
    peer_id: String,
    outbound: bool,
    event_tx: mpsc::Sender<PeerEvent>,
    first_frame: Option<PeerMessage>,
    initial: BytesMut,
) -> ConnWriter {
    let (data_tx, mut data_rx) = mpsc::unbounded_channel::<PeerMessage>();
    let (keep_alive_tx, mut keep_alive_rx) = watch::channel::<Option<PeerMessage>>(None);
    let writer = ConnWriter {
        data_tx,
        keep_alive_tx,
    };
    let (mut read_half, mut write_half) = stream.into_split();
    let codec = FrameCodec::new();

    // Writer: data frames first and in FIFO order, the freshest
    // keep-alive when the data lane is idle.
    {
        let peer_id = peer_id.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let mut buffer = BytesMut::new();
            if let Some(frame) = first_frame {
                if codec.encode(&frame, &mut buffer).is_err()
                    || write_half.write_all(&buffer).await.is_err()
                {
                    let _ = event_tx
                        .send(PeerEvent::ConnClosed { peer_id, outbound })
                        .await;
                    return;
                }
                buffer.clear();
            }
            loop {
                let message = tokio::select! {
                    biased;
                    message = data_rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                    changed = keep_alive_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        match keep_alive_rx.borrow_and_update().clone() {
                            Some(message) => message,
                            None => continue,
                        }
                    }
                };
                if codec.encode(&message, &mut buffer).is_err() {
                    continue;
                }
                if write_half.write_all(&buffer).await.is_err() {
                    break;
                }
                buffer.clear();
            }
            let _ = event_tx
                .send(PeerEvent::ConnClosed { peer_id, outbound })
                .await;
        });
    }

    // Reader: accumulate, decode, forward. Starts from any bytes the
    // listener read past the Hello frame.
    tokio::spawn(async move {
        let mut buffer = initial;
        buffer.reserve(64 * 1024);
        let mut drained_initial = buffer.is_empty();
        loop {
            if drained_initial {
                match read_half.read_buf(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            drained_initial = true;
            'frames: loop {
                match codec.decode::<PeerMessage>(&mut buffer) {
                    DecodeResult::Complete(message) => {
                        if event_tx
                            .send(PeerEvent::Received {
                                peer_id: peer_id.clone(),
                                message,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    DecodeResult::Incomplete => break 'frames,
                    DecodeResult::Invalid(reason) => {
                        warn!(peer = %peer_id, %reason, "bad frame, dropping connection");
                        let _ = event_tx
                            .send(PeerEvent::ConnClosed { peer_id, outbound })
                            .await;
                        return;
                    }
                }
            }
        }
        let _ = event_tx
            .send(PeerEvent::ConnClosed { peer_id, outbound })
            .await;
    });

    writer
}
