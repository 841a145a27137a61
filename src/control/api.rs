//! Control surface.
//!
//! Typed request/response pairs dispatched to the per-area store loops.
//! The same length-prefixed framing as the flood protocol carries these
//! over the control listener; in-process consumers call
//! [`CtrlHandler`] directly and can open true publication streams.

use crate::core::error::{KvError, KvResult};
use crate::net::codec::{DecodeResult, FrameCodec};
use crate::net::flooder::{PeerStatus, StoreCommand, StoreHandle};
use crate::ops::observability::CounterSnapshot;
use crate::store::types::{FilterSpec, PeerSpec, Publication, SetKeyValsResult};
use crate::store::value::Value;
use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// One control request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtrlRequest {
    /// Read specific keys.
    KeyGetValues { area: String, keys: Vec<String> },
    /// Dump all entries passing a filter.
    KeyDumpAll {
        area: String,
        filter: Option<FilterSpec>,
    },
    /// Merge a batch.
    KeySetValues {
        area: String,
        key_vals: HashMap<String, Value>,
    },
    /// Tombstone keys.
    KeyDel { area: String, keys: Vec<String> },
    /// Register a peer.
    PeerAdd { area: String, peer: PeerSpec },
    /// Remove a peer.
    PeerDel { area: String, peer_id: String },
    /// Describe peer sessions.
    PeerDump { area: String },
    /// Wait for the next publication, up to the long-poll hold time.
    /// An empty publication in the reply means "no change".
    LongPollUpdates {
        area: String,
        filter: Option<FilterSpec>,
    },
    /// Counter snapshot for an area.
    Counters { area: String },
    /// List served areas.
    Areas,
}

/// One control response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CtrlResponse {
    /// Key-value state.
    Publication(Publication),
    /// Accepted keys of a set/del.
    SetKeyVals(SetKeyValsResult),
    /// Peer session states.
    Peers(Vec<PeerStatus>),
    /// Counter snapshot.
    Counters(CounterSnapshot),
    /// Served areas.
    Areas(Vec<String>),
    /// Success without a body.
    Ack,
    /// Request failed.
    Error {
        /// Stable error kind tag.
        kind: String,
        /// Human-readable diagnostic naming the offending field.
        message: String,
    },
}

impl CtrlResponse {
    fn from_error(error: KvError) -> Self {
        let kind = match &error {
            KvError::InvalidConfig { .. } => "INVALID_CONFIG",
            KvError::InvalidRequest { .. } => "INVALID_REQUEST",
            KvError::OutOfRange { .. } => "OUT_OF_RANGE",
            KvError::PeerUnreachable { .. } => "PEER_UNREACHABLE",
            KvError::SyncTimeout { .. } => "SYNC_TIMEOUT",
            KvError::Cancelled => "CANCELLED",
            KvError::Internal { .. } => "INTERNAL",
        };
        CtrlResponse::Error {
            kind: kind.to_string(),
            message: error.to_string(),
        }
    }
}

/// Dispatches control requests to per-area store loops.
#[derive(Clone)]
pub struct CtrlHandler {
    stores: HashMap<String, StoreHandle>,
    long_poll_hold_ms: u64,
}

impl CtrlHandler {
    /// Build a handler over the given store handles.
    pub fn new(stores: HashMap<String, StoreHandle>, long_poll_hold_ms: u64) -> Self {
        Self {
            stores,
            long_poll_hold_ms,
        }
    }

    /// Served areas.
    pub fn areas(&self) -> Vec<String> {
        let mut areas: Vec<String> = self.stores.keys().cloned().collect();
        areas.sort();
        areas
    }

    fn store(&self, area: &str) -> KvResult<&StoreHandle> {
        self.stores
            .get(area)
            .ok_or_else(|| KvError::invalid_request(format!("unknown area: {area}")))
    }

    async fn roundtrip<T>(
        &self,
        area: &str,
        make: impl FnOnce(oneshot::Sender<T>) -> StoreCommand,
    ) -> KvResult<T> {
        let handle = self.store(area)?;
        let (tx, rx) = oneshot::channel();
        handle
            .cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| KvError::Cancelled)?;
        rx.await.map_err(|_| KvError::Cancelled)
    }

    /// Open a publication stream from "now" for in-process consumers.
    pub async fn subscribe(
        &self,
        area: &str,
        filter: Option<FilterSpec>,
    ) -> KvResult<mpsc::UnboundedReceiver<Publication>> {
        self.roundtrip(area, |resp| StoreCommand::Subscribe { filter, resp })
            .await?
    }

    /// Handle one request.
    pub async fn handle(&self, request: CtrlRequest) -> CtrlResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => CtrlResponse::from_error(error),
        }
    }

    async fn dispatch(&self, request: CtrlRequest) -> KvResult<CtrlResponse> {
        match request {
            CtrlRequest::KeyGetValues { area, keys } => {
                if keys.is_empty() || keys.iter().any(String::is_empty) {
                    return Err(KvError::invalid_request("keys must be non-empty"));
                }
                let publication = self
                    .roundtrip(&area, |resp| StoreCommand::GetKeyVals { keys, resp })
                    .await?;
                Ok(CtrlResponse::Publication(publication))
            }
            CtrlRequest::KeyDumpAll { area, filter } => {
                let publication = self
                    .roundtrip(&area, |resp| StoreCommand::DumpAll { filter, resp })
                    .await??;
                Ok(CtrlResponse::Publication(publication))
            }
            CtrlRequest::KeySetValues { area, key_vals } => {
                if key_vals.is_empty() || key_vals.keys().any(|k| k.is_empty()) {
                    return Err(KvError::invalid_request("key_vals must be non-empty"));
                }
                let result = self
                    .roundtrip(&area, |resp| StoreCommand::SetKeyVals { key_vals, resp })
                    .await?;
                Ok(CtrlResponse::SetKeyVals(result))
            }
            CtrlRequest::KeyDel { area, keys } => {
                if keys.is_empty() || keys.iter().any(String::is_empty) {
                    return Err(KvError::invalid_request("keys must be non-empty"));
                }
                let result = self
                    .roundtrip(&area, |resp| StoreCommand::DeleteKeys { keys, resp })
                    .await??;
                Ok(CtrlResponse::SetKeyVals(result))
            }
            CtrlRequest::PeerAdd { area, peer } => {
                if peer.peer_id.is_empty() {
                    return Err(KvError::invalid_request("peer_id must be non-empty"));
                }
                peer.addr.parse::<std::net::SocketAddr>().map_err(|e| {
                    KvError::invalid_request(format!("bad peer address '{}': {e}", peer.addr))
                })?;
                self.roundtrip(&area, |resp| StoreCommand::AddPeer { peer, resp })
                    .await?;
                Ok(CtrlResponse::Ack)
            }
            CtrlRequest::PeerDel { area, peer_id } => {
                let existed = self
                    .roundtrip(&area, |resp| StoreCommand::DelPeer { peer_id, resp })
                    .await?;
                if existed {
                    Ok(CtrlResponse::Ack)
                } else {
                    Err(KvError::invalid_request("unknown peer"))
                }
            }
            CtrlRequest::PeerDump { area } => {
                let peers = self
                    .roundtrip(&area, |resp| StoreCommand::PeerDump { resp })
                    .await?;
                Ok(CtrlResponse::Peers(peers))
            }
            CtrlRequest::LongPollUpdates { area, filter } => {
                let mut rx = self.subscribe(&area, filter).await?;
                let hold = Duration::from_millis(self.long_poll_hold_ms);
                match tokio::time::timeout(hold, rx.recv()).await {
                    Ok(Some(publication)) => Ok(CtrlResponse::Publication(publication)),
                    // Held to the deadline with no change, or the store
                    // shut down: an empty publication either way.
                    Ok(None) | Err(_) => {
                        Ok(CtrlResponse::Publication(Publication::new(area)))
                    }
                }
            }
            CtrlRequest::Counters { area } => {
                let counters = self
                    .roundtrip(&area, |resp| StoreCommand::Counters { resp })
                    .await?;
                Ok(CtrlResponse::Counters(counters))
            }
            CtrlRequest::Areas => Ok(CtrlResponse::Areas(self.areas())),
        }
    }
}

/// Serve control requests on a listener until the process shuts down.
pub async fn serve_ctrl(listener: TcpListener, handler: CtrlHandler) {
    info!(addr = ?listener.local_addr().ok(), "control listener running");
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "control connection");
                let handler = handler.clone();
                tokio::spawn(serve_ctrl_conn(stream, handler));
            }
            Err(e) => {
                warn!("control accept failed: {e}");
            }
        }
    }
}

/// One control connection: a sequence of request/response frames.
async fn serve_ctrl_conn(mut stream: TcpStream, handler: CtrlHandler) {
    let codec = FrameCodec::new();
    let mut read_buffer = BytesMut::with_capacity(16 * 1024);
    let mut write_buffer = BytesMut::new();

    loop {
        let request: CtrlRequest = loop {
            match codec.decode::<CtrlRequest>(&mut read_buffer) {
                DecodeResult::Complete(request) => break request,
                DecodeResult::Invalid(reason) => {
                    debug!(%reason, "bad control frame");
                    return;
                }
                DecodeResult::Incomplete => match stream.read_buf(&mut read_buffer).await {
                    Ok(0) | Err(_) => return,
                    Ok(_) => {}
                },
            }
        };

        let response = handler.handle(request).await;
        write_buffer.clear();
        if codec.encode(&response, &mut write_buffer).is_err() {
            return;
        }
        if stream.write_all(&write_buffer).await.is_err() {
            return;
        }
    }
}

/// Thin client for the control surface, used by the CLI.
pub struct CtrlClient {
    stream: TcpStream,
    codec: FrameCodec,
    buffer: BytesMut,
}

impl CtrlClient {
    /// Connect to a control listener.
    pub async fn connect(addr: &str) -> KvResult<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            KvError::invalid_request(format!("cannot reach control endpoint {addr}: {e}"))
        })?;
        Ok(Self {
            stream,
            codec: FrameCodec::new(),
            buffer: BytesMut::with_capacity(16 * 1024),
        })
    }

    /// Send one request and wait for its response.
    pub async fn call(&mut self, request: &CtrlRequest) -> KvResult<CtrlResponse> {
        let mut out = BytesMut::new();
        self.codec
            .encode(request, &mut out)
            .map_err(KvError::internal)?;
        self.stream
            .write_all(&out)
            .await
            .map_err(|e| KvError::invalid_request(format!("control write failed: {e}")))?;

        loop {
            match self.codec.decode::<CtrlResponse>(&mut self.buffer) {
                DecodeResult::Complete(response) => return Ok(response),
                DecodeResult::Invalid(reason) => {
                    return Err(KvError::invalid_request(format!(
                        "bad control response: {reason}"
                    )))
                }
                DecodeResult::Incomplete => {
                    let n = self.stream.read_buf(&mut self.buffer).await.map_err(|e| {
                        KvError::invalid_request(format!("control read failed: {e}"))
                    })?;
                    if n == 0 {
                        return Err(KvError::Cancelled);
                    }
                }
            }
        }
    }
}
