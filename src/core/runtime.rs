//! Runtime orchestration.
//!
//! Builds one store loop per configured area, wires the peer and control
//! listeners to them, and owns startup/shutdown: snapshot load before
//! peering begins, snapshot persist on exit, session cancellation on
//! shutdown.

use crate::control::api::{serve_ctrl, CtrlHandler};
use crate::core::config::Config;
use crate::core::error::{KvError, KvResult};
use crate::core::time::{Clock, MonotonicClock};
use crate::net::codec::{DecodeResult, FrameCodec};
use crate::net::flooder::{Flooder, InboundConn, StoreCommand, StoreHandle};
use crate::net::message::PeerMessage;
use crate::ops::observability::KvCounters;
use crate::storage::snapshot::SnapshotStore;
use crate::store::kv_store::KvStoreDb;
use anyhow::{Context, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// Interval between periodic snapshot writes.
const SNAPSHOT_PERSIST_INTERVAL: Duration = Duration::from_secs(30);

/// A running node: per-area store loops plus listeners.
pub struct Runtime {
    config: Config,
    clock: Arc<dyn Clock>,
    handles: HashMap<String, StoreHandle>,
    snapshots: Option<Arc<SnapshotStore>>,
}

impl Runtime {
    /// Create a runtime from validated configuration.
    pub fn new(config: Config) -> KvResult<Self> {
        // The gate runs again here so a Runtime can never be built on an
        // unvalidated config handed over programmatically.
        config.validate()?;
        let snapshots = config.snapshot.enabled.then(|| {
            Arc::new(SnapshotStore::new(
                config.snapshot.dir.clone(),
                config.snapshot.staleness_bound_ms,
            ))
        });
        Ok(Self {
            config,
            clock: Arc::new(MonotonicClock::new()),
            handles: HashMap::new(),
            snapshots,
        })
    }

    /// Handles for the running store loops.
    pub fn handles(&self) -> &HashMap<String, StoreHandle> {
        &self.handles
    }

    /// Control handler over the running store loops.
    pub fn ctrl_handler(&self) -> CtrlHandler {
        CtrlHandler::new(self.handles.clone(), self.config.timers.long_poll_hold_ms)
    }

    /// Build the stores and spawn loops and listeners.
    pub async fn start(&mut self) -> Result<()> {
        let ingress_filter = self
            .config
            .kv_store_filter()
            .map_err(|e| anyhow::anyhow!(e))?;

        for area_config in self.config.effective_areas() {
            let area = area_config.area_id.clone();
            let counters = Arc::new(KvCounters::new());
            let mut db = KvStoreDb::new(
                area.as_str(),
                self.config.node_name.as_str(),
                self.config.kvstore.key_ttl_ms,
                ingress_filter.clone(),
                counters,
            );

            // Seed from disk before any peer can talk to us.
            if let Some(snapshots) = &self.snapshots {
                match snapshots.load(&area) {
                    Ok(Some(entries)) => {
                        let count = db.import_entries(entries, self.clock.now());
                        info!(area = %area, keys = count, "store seeded from snapshot");
                    }
                    Ok(None) => {}
                    Err(e) => warn!(area = %area, "snapshot load failed: {e:#}"),
                }
            }

            let (flooder, handle) =
                Flooder::new(area.as_str(), &self.config, db, self.clock.clone());
            tokio::spawn(flooder.run());

            for peer in &area_config.peers {
                let (tx, rx) = oneshot::channel();
                handle
                    .cmd_tx
                    .send(StoreCommand::AddPeer {
                        peer: peer.clone(),
                        resp: tx,
                    })
                    .await
                    .map_err(|_| KvError::Cancelled)?;
                rx.await.map_err(|_| KvError::Cancelled)?;
            }

            self.handles.insert(area, handle);
        }

        // Peer listener: route each connection by its Hello frame.
        let peer_listener = TcpListener::bind(&self.config.listen.peer_bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen.peer_bind))?;
        info!(addr = %self.config.listen.peer_bind, "peer listener running");
        tokio::spawn(accept_peers(
            peer_listener,
            self.handles
                .iter()
                .map(|(area, handle)| (area.clone(), handle.inbound_tx.clone()))
                .collect(),
            Duration::from_millis(self.config.timers.conn_timeout_ms),
        ));

        // Control listener.
        let ctrl_listener = TcpListener::bind(&self.config.listen.ctrl_bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.listen.ctrl_bind))?;
        tokio::spawn(serve_ctrl(ctrl_listener, self.ctrl_handler()));

        Ok(())
    }

    /// Run until interrupted, then shut down cleanly.
    pub async fn run(mut self) -> Result<()> {
        self.start().await?;

        if let Some(snapshots) = self.snapshots.clone() {
            let handles = self.handles.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(SNAPSHOT_PERSIST_INTERVAL);
                timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    timer.tick().await;
                    persist_all(&handles, &snapshots).await;
                }
            });
        }

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received");
        self.shutdown().await;
        Ok(())
    }

    /// Persist snapshots and stop every store loop.
    pub async fn shutdown(&mut self) {
        if let Some(snapshots) = &self.snapshots {
            persist_all(&self.handles, snapshots).await;
        }
        for (area, handle) in &self.handles {
            if handle.cmd_tx.send(StoreCommand::Shutdown).await.is_err() {
                warn!(area = %area, "store loop already gone");
            }
        }
    }
}

/// Write a snapshot for every area that answers an export.
async fn persist_all(handles: &HashMap<String, StoreHandle>, snapshots: &Arc<SnapshotStore>) {
    for (area, handle) in handles {
        let (tx, rx) = oneshot::channel();
        if handle
            .cmd_tx
            .send(StoreCommand::Export { resp: tx })
            .await
            .is_err()
        {
            continue;
        }
        let Ok(entries) = rx.await else { continue };
        let snapshots = snapshots.clone();
        let area = area.clone();
        let result =
            tokio::task::spawn_blocking(move || snapshots.persist(&area, &entries)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("snapshot persist failed: {e:#}"),
            Err(e) => warn!("snapshot persist task failed: {e}"),
        }
    }
}

/// Accept peer connections, parse the Hello frame, and route the stream
/// to the owning area's loop.
async fn accept_peers(
    listener: TcpListener,
    inbound: HashMap<String, mpsc::Sender<InboundConn>>,
    hello_timeout: Duration,
) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("peer accept failed: {e}");
                continue;
            }
        };

        let inbound = inbound.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(hello_timeout, read_hello(stream)).await {
                Ok(Ok((peer_id, area, stream, leftover))) => {
                    let Some(tx) = inbound.get(&area) else {
                        warn!(%remote, %area, "hello for unknown area");
                        return;
                    };
                    let _ = tx
                        .send(InboundConn {
                            peer_id,
                            stream,
                            initial: leftover,
                        })
                        .await;
                }
                Ok(Err(reason)) => {
                    warn!(%remote, %reason, "bad hello");
                }
                Err(_) => {
                    warn!(%remote, "hello timed out");
                }
            }
        });
    }
}

/// Read frames until the Hello arrives; anything else first is an error.
async fn read_hello(
    mut stream: TcpStream,
) -> std::result::Result<(String, String, TcpStream, BytesMut), String> {
    let codec = FrameCodec::new();
    let mut buffer = BytesMut::with_capacity(4 * 1024);
    loop {
        match codec.decode::<PeerMessage>(&mut buffer) {
            DecodeResult::Complete(PeerMessage::Hello { node_name, area }) => {
                return Ok((node_name, area, stream, buffer));
            }
            DecodeResult::Complete(message) => {
                return Err(format!("expected hello, got {}", message.kind()));
            }
            DecodeResult::Invalid(reason) => return Err(reason),
            DecodeResult::Incomplete => match stream.read_buf(&mut buffer).await {
                Ok(0) => return Err("connection closed before hello".to_string()),
                Ok(_) => {}
                Err(e) => return Err(format!("read failed: {e}")),
            },
        }
    }
}
