//! Protocol constants.
//!
//! Timer defaults and well-known key markers shared across the store and
//! flooding layers. Values that operators commonly tune live in
//! [`crate::core::config`]; everything here is part of the protocol contract.

/// TTL sentinel meaning "never expires in transit".
///
/// A value carrying this TTL is never queued for expiry and is never
/// decremented on forward.
pub const TTL_INFINITY: i64 = i64::MAX;

/// Default TTL applied to locally originated keys (5 minutes).
pub const DEFAULT_KEY_TTL_MS: i64 = 300_000;

/// Default per-hop TTL decrement applied when re-flooding (1 ms).
pub const DEFAULT_TTL_DECREMENT_MS: i64 = 1;

/// Floor for the originator-side TTL refresh interval.
///
/// Refresh runs at `key_ttl / 4`, but never more often than this.
pub const TTL_REFRESH_FLOOR_MS: u64 = 1_000;

/// Window for coalescing accepted deltas into one outbound flood.
pub const FLOOD_PENDING_MS: u64 = 100;

/// Hard cap on keys carried by a single flood message.
///
/// Coalesced batches larger than this are flushed in chunks.
pub const MAX_KEYS_PER_FLOOD: usize = 1_024;

/// Granularity of the session timer driving keep-alive and backoff checks.
pub const KEEP_ALIVE_CHECK_INTERVAL_MS: u64 = 50;

/// Default keep-alive emission interval.
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 1_000;

/// Default peer hold time.
pub const DEFAULT_HOLD_TIME_MS: u64 = 3_000;

/// Default graceful-restart window.
pub const DEFAULT_GRACEFUL_RESTART_MS: u64 = 30_000;

/// Default initial reconnect backoff.
pub const DEFAULT_INITIAL_BACKOFF_MS: u64 = 64;

/// Default maximum reconnect backoff.
pub const DEFAULT_MAX_BACKOFF_MS: u64 = 8_192;

/// Default deadline for a peer read or full-sync round.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 10_000;

/// Default deadline for establishing a peer transport.
pub const DEFAULT_CONN_TIMEOUT_MS: u64 = 5_000;

/// Default hold time for long-poll subscriber requests.
pub const DEFAULT_LONG_POLL_HOLD_MS: u64 = 20_000;

/// Default flood rate: messages per second refill.
pub const DEFAULT_FLOOD_MSG_PER_SEC: u32 = 1_024;

/// Default flood rate: token bucket capacity.
pub const DEFAULT_FLOOD_MSG_BURST_SIZE: u32 = 128;

/// Default bound on snapshot age before it is ignored at startup.
pub const DEFAULT_SNAPSHOT_STALENESS_MS: u64 = 600_000;

/// Upper bound on a single wire frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Reserved identifier of the default replication area.
pub const DEFAULT_AREA_ID: &str = "0";

/// Key marker for adjacency databases.
pub const ADJ_DB_MARKER: &str = "adj:";

/// Key marker for prefix databases.
pub const PREFIX_DB_MARKER: &str = "prefix:";

/// Key marker for prefix-allocation entries.
pub const PREFIX_ALLOC_MARKER: &str = "allocprefix:";

/// Key marker for node-label range allocations.
pub const NODE_LABEL_RANGE_PREFIX: &str = "nodeLabel:";
