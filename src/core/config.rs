//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files with CLI overrides. Every
//! constraint the store and flooding layers rely on is checked by
//! [`Config::validate`] before any store is constructed; a failure
//! surfaces as [`KvError::InvalidConfig`] and the process exits with
//! code 1.

use crate::core::constants::{
    DEFAULT_CONN_TIMEOUT_MS, DEFAULT_FLOOD_MSG_BURST_SIZE, DEFAULT_FLOOD_MSG_PER_SEC,
    DEFAULT_GRACEFUL_RESTART_MS, DEFAULT_HOLD_TIME_MS, DEFAULT_INITIAL_BACKOFF_MS,
    DEFAULT_KEEP_ALIVE_MS, DEFAULT_KEY_TTL_MS, DEFAULT_LONG_POLL_HOLD_MS, DEFAULT_MAX_BACKOFF_MS,
    DEFAULT_READ_TIMEOUT_MS, DEFAULT_SNAPSHOT_STALENESS_MS, DEFAULT_TTL_DECREMENT_MS,
    NODE_LABEL_RANGE_PREFIX, PREFIX_ALLOC_MARKER, TTL_INFINITY,
};
use crate::core::error::{KvError, KvResult};
use crate::store::filter::{FilterOperator, KeyFilter};
use crate::store::types::PeerSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Stable node name, used as the originator ID for local keys.
    pub node_name: String,

    /// Replication areas. Empty means the reserved default area only.
    #[serde(default)]
    pub areas: Vec<AreaConfig>,

    /// Store behavior.
    #[serde(default)]
    pub kvstore: KvStoreConfig,

    /// Session and request timers.
    #[serde(default)]
    pub timers: TimerConfig,

    /// Reconnect backoff bounds.
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Step-detector windows used by link-quality consumers.
    #[serde(default)]
    pub step_detector: StepDetectorConfig,

    /// Prefix allocation policy knobs.
    #[serde(default)]
    pub prefix_alloc: PrefixAllocConfig,

    /// Optional on-disk snapshot of the map.
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Listener bind addresses.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// One replication area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AreaConfig {
    /// Area identifier, non-empty and unique per node.
    pub area_id: String,

    /// Regexes selecting neighbor names allowed to peer in this area.
    #[serde(default)]
    pub neighbor_regexes: Vec<String>,

    /// Regexes selecting interfaces included in this area.
    #[serde(default)]
    pub include_interface_regexes: Vec<String>,

    /// Regexes selecting interfaces whose prefixes are redistributed.
    #[serde(default)]
    pub redistribute_interface_regexes: Vec<String>,

    /// Statically configured peers.
    #[serde(default)]
    pub peers: Vec<PeerSpec>,
}

impl AreaConfig {
    /// Area with an ID and no regexes or peers.
    pub fn new(area_id: impl Into<String>) -> Self {
        Self {
            area_id: area_id.into(),
            neighbor_regexes: Vec::new(),
            include_interface_regexes: Vec::new(),
            redistribute_interface_regexes: Vec::new(),
            peers: Vec::new(),
        }
    }
}

/// Store behavior knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvStoreConfig {
    /// TTL applied to locally originated keys, ms or TTL_INFINITY.
    #[serde(default = "default_key_ttl_ms")]
    pub key_ttl_ms: i64,

    /// Per-hop TTL decrement on re-flood, ms.
    #[serde(default = "default_ttl_decrement_ms")]
    pub ttl_decrement_ms: i64,

    /// Flood rate limiting.
    #[serde(default)]
    pub flood_rate: FloodRate,

    /// Leaf-node mode: filter ingress to a subset of the key space.
    #[serde(default)]
    pub set_leaf_node: bool,

    /// Key prefix regexes kept in leaf-node mode.
    #[serde(default)]
    pub key_prefix_filters: Vec<String>,

    /// Originator IDs kept in leaf-node mode.
    #[serde(default)]
    pub key_originator_id_filters: Vec<String>,

    /// How the filter dimensions combine.
    #[serde(default)]
    pub filter_operator: FilterOperator,
}

impl Default for KvStoreConfig {
    fn default() -> Self {
        Self {
            key_ttl_ms: default_key_ttl_ms(),
            ttl_decrement_ms: default_ttl_decrement_ms(),
            flood_rate: FloodRate::default(),
            set_leaf_node: false,
            key_prefix_filters: Vec::new(),
            key_originator_id_filters: Vec::new(),
            filter_operator: FilterOperator::default(),
        }
    }
}

/// Token-bucket flood rate limits, per peer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FloodRate {
    /// Token refill rate.
    #[serde(default = "default_flood_msg_per_sec")]
    pub flood_msg_per_sec: u32,

    /// Token bucket capacity.
    #[serde(default = "default_flood_msg_burst_size")]
    pub flood_msg_burst_size: u32,
}

impl Default for FloodRate {
    fn default() -> Self {
        Self {
            flood_msg_per_sec: default_flood_msg_per_sec(),
            flood_msg_burst_size: default_flood_msg_burst_size(),
        }
    }
}

/// Session and request timers, all in milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Keep-alive emission interval.
    #[serde(default = "default_keep_alive_ms")]
    pub keep_alive_interval_ms: u64,

    /// Peer hold time; must exceed the keep-alive interval.
    #[serde(default = "default_hold_time_ms")]
    pub hold_time_ms: u64,

    /// Graceful-restart window; at least three keep-alive intervals.
    #[serde(default = "default_graceful_restart_ms")]
    pub graceful_restart_ms: u64,

    /// Deadline for a peer read or full-sync round.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Deadline for establishing a peer transport.
    #[serde(default = "default_conn_timeout_ms")]
    pub conn_timeout_ms: u64,

    /// Hold time for long-poll subscriber requests.
    #[serde(default = "default_long_poll_hold_ms")]
    pub long_poll_hold_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval_ms: default_keep_alive_ms(),
            hold_time_ms: default_hold_time_ms(),
            graceful_restart_ms: default_graceful_restart_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            conn_timeout_ms: default_conn_timeout_ms(),
            long_poll_hold_ms: default_long_poll_hold_ms(),
        }
    }
}

/// Exponential reconnect backoff bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First retry delay, ms.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Delay ceiling, ms.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Step-detector windows and thresholds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StepDetectorConfig {
    /// Fast sampling window size.
    #[serde(default)]
    pub fast_window_size: u32,

    /// Slow sampling window size; at least the fast window.
    #[serde(default)]
    pub slow_window_size: u32,

    /// Lower change threshold.
    #[serde(default)]
    pub lower_threshold: u32,

    /// Upper change threshold; at least the lower threshold.
    #[serde(default)]
    pub upper_threshold: u32,
}

/// Prefix allocation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrefixAllocMode {
    /// Allocations are configured statically; no seed prefix.
    #[default]
    Static,
    /// This node allocates out of a seed learned from the network.
    DynamicLeafNode,
    /// This node owns the seed prefix and carves allocations from it.
    DynamicRootNode,
}

/// Prefix allocation policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrefixAllocConfig {
    /// Whether prefix allocation runs at all.
    #[serde(default)]
    pub enabled: bool,

    /// Allocation mode.
    #[serde(default)]
    pub mode: PrefixAllocMode,

    /// Seed prefix, `addr/len`; required only for the root mode.
    #[serde(default)]
    pub seed_prefix: Option<String>,

    /// Length of allocated prefixes; must exceed the seed length.
    #[serde(default)]
    pub allocate_prefix_len: Option<u8>,

    /// Whether IPv4 allocation is enabled.
    #[serde(default)]
    pub enable_v4: bool,
}

/// On-disk snapshot of the map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Whether snapshots are written and loaded.
    #[serde(default)]
    pub enabled: bool,

    /// Directory holding one snapshot file per area.
    #[serde(default = "default_snapshot_dir")]
    pub dir: String,

    /// Snapshots older than this at startup are ignored, ms.
    #[serde(default = "default_snapshot_staleness_ms")]
    pub staleness_bound_ms: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: default_snapshot_dir(),
            staleness_bound_ms: default_snapshot_staleness_ms(),
        }
    }
}

/// Listener bind addresses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Peer flood protocol listener.
    #[serde(default = "default_peer_bind")]
    pub peer_bind: String,

    /// Control surface listener.
    #[serde(default = "default_ctrl_bind")]
    pub ctrl_bind: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            peer_bind: default_peer_bind(),
            ctrl_bind: default_ctrl_bind(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

// Default value functions

fn default_key_ttl_ms() -> i64 {
    DEFAULT_KEY_TTL_MS
}

fn default_ttl_decrement_ms() -> i64 {
    DEFAULT_TTL_DECREMENT_MS
}

fn default_flood_msg_per_sec() -> u32 {
    DEFAULT_FLOOD_MSG_PER_SEC
}

fn default_flood_msg_burst_size() -> u32 {
    DEFAULT_FLOOD_MSG_BURST_SIZE
}

fn default_keep_alive_ms() -> u64 {
    DEFAULT_KEEP_ALIVE_MS
}

fn default_hold_time_ms() -> u64 {
    DEFAULT_HOLD_TIME_MS
}

fn default_graceful_restart_ms() -> u64 {
    DEFAULT_GRACEFUL_RESTART_MS
}

fn default_read_timeout_ms() -> u64 {
    DEFAULT_READ_TIMEOUT_MS
}

fn default_conn_timeout_ms() -> u64 {
    DEFAULT_CONN_TIMEOUT_MS
}

fn default_long_poll_hold_ms() -> u64 {
    DEFAULT_LONG_POLL_HOLD_MS
}

fn default_initial_backoff_ms() -> u64 {
    DEFAULT_INITIAL_BACKOFF_MS
}

fn default_max_backoff_ms() -> u64 {
    DEFAULT_MAX_BACKOFF_MS
}

fn default_snapshot_dir() -> String {
    "data".to_string()
}

fn default_snapshot_staleness_ms() -> u64 {
    DEFAULT_SNAPSHOT_STALENESS_MS
}

fn default_peer_bind() -> String {
    "0.0.0.0:6622".to_string()
}

fn default_ctrl_bind() -> String {
    "127.0.0.1:6623".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn from_file(path: &Path) -> KvResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            KvError::invalid_config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Load and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> KvResult<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| KvError::invalid_config(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Areas this node participates in; the reserved default area when
    /// none are configured.
    pub fn effective_areas(&self) -> Vec<AreaConfig> {
        if self.areas.is_empty() {
            vec![AreaConfig::new(crate::core::constants::DEFAULT_AREA_ID)]
        } else {
            self.areas.clone()
        }
    }

    /// Ingress filter for leaf-node mode.
    ///
    /// The effective prefix list always includes the node-label and
    /// prefix-allocation markers, and the effective originator set
    /// includes the local node name, so a leaf keeps the keys it needs
    /// to function no matter how narrow the configured filters are.
    pub fn kv_store_filter(&self) -> KvResult<Option<KeyFilter>> {
        if !self.kvstore.set_leaf_node {
            return Ok(None);
        }
        let mut prefixes = self.kvstore.key_prefix_filters.clone();
        prefixes.push(PREFIX_ALLOC_MARKER.to_string());
        prefixes.push(NODE_LABEL_RANGE_PREFIX.to_string());

        let mut originators: HashSet<String> = self
            .kvstore
            .key_originator_id_filters
            .iter()
            .cloned()
            .collect();
        originators.insert(self.node_name.clone());

        KeyFilter::new(prefixes, originators, self.kvstore.filter_operator).map(Some)
    }

    /// Validate every constraint the store and flooder rely on.
    pub fn validate(&self) -> KvResult<()> {
        self.validate_node()?;
        self.validate_areas()?;
        self.validate_kvstore()?;
        self.validate_timers()?;
        self.validate_backoff()?;
        self.validate_step_detector()?;
        self.validate_prefix_alloc()?;
        self.validate_telemetry()?;
        Ok(())
    }

    fn validate_node(&self) -> KvResult<()> {
        if self.node_name.is_empty() {
            return Err(KvError::invalid_config("node_name must not be empty"));
        }
        Ok(())
    }

    fn validate_areas(&self) -> KvResult<()> {
        let mut seen = HashSet::new();
        for area in &self.areas {
            if area.area_id.is_empty() {
                return Err(KvError::invalid_config("area_id must not be empty"));
            }
            if !seen.insert(&area.area_id) {
                return Err(KvError::invalid_config(format!(
                    "duplicate area_id: {}",
                    area.area_id
                )));
            }
            for pattern in area
                .neighbor_regexes
                .iter()
                .chain(&area.include_interface_regexes)
                .chain(&area.redistribute_interface_regexes)
            {
                regex::Regex::new(pattern).map_err(|e| {
                    KvError::invalid_config(format!(
                        "area {}: bad regex '{pattern}': {e}",
                        area.area_id
                    ))
                })?;
            }
            for peer in &area.peers {
                if peer.peer_id.is_empty() {
                    return Err(KvError::invalid_config(format!(
                        "area {}: peer with empty peer_id",
                        area.area_id
                    )));
                }
                peer.addr.parse::<std::net::SocketAddr>().map_err(|e| {
                    KvError::invalid_config(format!(
                        "area {}: peer {} has bad address '{}': {e}",
                        area.area_id, peer.peer_id, peer.addr
                    ))
                })?;
            }
        }
        Ok(())
    }

    fn validate_kvstore(&self) -> KvResult<()> {
        let kv = &self.kvstore;
        if kv.key_ttl_ms != TTL_INFINITY && kv.key_ttl_ms <= 0 {
            return Err(KvError::invalid_config(
                "kvstore.key_ttl_ms must be positive or TTL_INFINITY",
            ));
        }
        if kv.ttl_decrement_ms <= 0 {
            return Err(KvError::OutOfRange {
                field: "kvstore.ttl_decrement_ms",
                value: kv.ttl_decrement_ms,
                min: 1,
                max: i64::MAX,
            });
        }
        if kv.flood_rate.flood_msg_per_sec == 0 {
            return Err(KvError::invalid_config(
                "kvstore.flood_rate.flood_msg_per_sec must be > 0",
            ));
        }
        if kv.flood_rate.flood_msg_burst_size == 0 {
            return Err(KvError::invalid_config(
                "kvstore.flood_rate.flood_msg_burst_size must be > 0",
            ));
        }
        // Leaf-node filters must compile even before a store exists.
        self.kv_store_filter()?;
        Ok(())
    }

    fn validate_timers(&self) -> KvResult<()> {
        let t = &self.timers;
        if t.keep_alive_interval_ms == 0 {
            return Err(KvError::invalid_config(
                "timers.keep_alive_interval_ms must be > 0",
            ));
        }
        if t.keep_alive_interval_ms >= t.hold_time_ms {
            return Err(KvError::invalid_config(format!(
                "timers.keep_alive_interval_ms ({}) must be less than hold_time_ms ({})",
                t.keep_alive_interval_ms, t.hold_time_ms
            )));
        }
        if t.graceful_restart_ms < 3 * t.keep_alive_interval_ms {
            return Err(KvError::invalid_config(format!(
                "timers.graceful_restart_ms ({}) must be at least 3x keep_alive_interval_ms ({})",
                t.graceful_restart_ms, t.keep_alive_interval_ms
            )));
        }
        if t.read_timeout_ms == 0 || t.conn_timeout_ms == 0 || t.long_poll_hold_ms == 0 {
            return Err(KvError::invalid_config("timers must be > 0"));
        }
        Ok(())
    }

    fn validate_backoff(&self) -> KvResult<()> {
        if self.backoff.initial_backoff_ms > self.backoff.max_backoff_ms {
            return Err(KvError::invalid_config(format!(
                "backoff.initial_backoff_ms ({}) cannot exceed max_backoff_ms ({})",
                self.backoff.initial_backoff_ms, self.backoff.max_backoff_ms
            )));
        }
        Ok(())
    }

    fn validate_step_detector(&self) -> KvResult<()> {
        let sd = &self.step_detector;
        if sd.fast_window_size > sd.slow_window_size {
            return Err(KvError::invalid_config(format!(
                "step_detector.fast_window_size ({}) cannot exceed slow_window_size ({})",
                sd.fast_window_size, sd.slow_window_size
            )));
        }
        if sd.lower_threshold > sd.upper_threshold {
            return Err(KvError::invalid_config(format!(
                "step_detector.lower_threshold ({}) cannot exceed upper_threshold ({})",
                sd.lower_threshold, sd.upper_threshold
            )));
        }
        Ok(())
    }

    fn validate_prefix_alloc(&self) -> KvResult<()> {
        let pa = &self.prefix_alloc;
        if !pa.enabled {
            return Ok(());
        }
        match pa.mode {
            PrefixAllocMode::Static | PrefixAllocMode::DynamicLeafNode => {
                if pa.seed_prefix.is_some() {
                    return Err(KvError::invalid_config(format!(
                        "prefix_alloc.seed_prefix must not be set in {:?} mode",
                        pa.mode
                    )));
                }
            }
            PrefixAllocMode::DynamicRootNode => {
                let seed = pa.seed_prefix.as_deref().ok_or_else(|| {
                    KvError::invalid_config(
                        "prefix_alloc.seed_prefix required in dynamic_root_node mode",
                    )
                })?;
                let (addr, seed_len) = parse_prefix(seed)?;
                let alloc_len = pa.allocate_prefix_len.ok_or_else(|| {
                    KvError::invalid_config(
                        "prefix_alloc.allocate_prefix_len required in dynamic_root_node mode",
                    )
                })?;
                if alloc_len <= seed_len {
                    return Err(KvError::invalid_config(format!(
                        "prefix_alloc.allocate_prefix_len ({alloc_len}) must exceed seed prefix length ({seed_len})"
                    )));
                }
                if addr.is_ipv4() && !pa.enable_v4 {
                    return Err(KvError::invalid_config(
                        "prefix_alloc: v4 seed prefix requires enable_v4",
                    ));
                }
            }
        }
        Ok(())
    }

    fn validate_telemetry(&self) -> KvResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.telemetry.log_level.as_str()) {
            return Err(KvError::invalid_config(format!(
                "telemetry.log_level must be one of {:?}, got: {}",
                valid_levels, self.telemetry.log_level
            )));
        }
        Ok(())
    }
}

/// Parse an `addr/len` prefix string.
fn parse_prefix(prefix: &str) -> KvResult<(IpAddr, u8)> {
    let (addr, len) = prefix.split_once('/').ok_or_else(|| {
        KvError::invalid_config(format!("bad prefix '{prefix}': expected addr/len"))
    })?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|e| KvError::invalid_config(format!("bad prefix address '{addr}': {e}")))?;
    let len: u8 = len
        .parse()
        .map_err(|e| KvError::invalid_config(format!("bad prefix length '{len}': {e}")))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(KvError::invalid_config(format!(
            "prefix length {len} exceeds {max} for '{prefix}'"
        )));
    }
    Ok((addr, len))
}

/// CLI overrides applied after file parsing, before validation.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    /// Override log level.
    pub log_level: Option<String>,
    /// Override the snapshot directory.
    pub snapshot_dir: Option<String>,
    /// Override the peer listener bind address.
    pub peer_bind: Option<String>,
    /// Override the control listener bind address.
    pub ctrl_bind: Option<String>,
}

impl Config {
    /// Apply CLI overrides to the configuration.
    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(ref log_level) = overrides.log_level {
            self.telemetry.log_level = log_level.clone();
        }
        if let Some(ref dir) = overrides.snapshot_dir {
            self.snapshot.dir = dir.clone();
        }
        if let Some(ref peer_bind) = overrides.peer_bind {
            self.listen.peer_bind = peer_bind.clone();
        }
        if let Some(ref ctrl_bind) = overrides.ctrl_bind {
            self.listen.ctrl_bind = ctrl_bind.clone();
        }
    }
}
