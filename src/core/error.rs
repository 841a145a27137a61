//! Error types.
//!
//! FloodKV defines one error enum covering the gate, the control surface,
//! and the peer sessions. Rejected values are deliberately *not* errors:
//! merge records them as counters and `key_set_values` reports the accepted
//! keys, so callers infer rejections without an error path.

use thiserror::Error;

/// Common FloodKV error conditions.
#[derive(Debug, Error)]
pub enum KvError {
    /// Configuration failed gate checks. Surfaced at startup, fatal.
    #[error("invalid config: {message}")]
    InvalidConfig { message: String },

    /// Malformed request fields, unknown area, empty key.
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Numeric option outside allowed bounds.
    #[error("{field} out of range: {value} not in [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Peer session entered backoff; retried automatically.
    #[error("peer {peer_id} unreachable: {message}")]
    PeerUnreachable { peer_id: String, message: String },

    /// Full-sync did not complete within its deadline.
    #[error("full-sync with {peer_id} timed out after {elapsed_ms}ms")]
    SyncTimeout { peer_id: String, elapsed_ms: u64 },

    /// In-flight work cancelled by shutdown.
    #[error("cancelled")]
    Cancelled,

    /// Invariant violation, e.g. a stored hash mismatch.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl KvError {
    /// Create an InvalidConfig error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an InvalidRequest error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create an Internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Check if this error should be retried automatically.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::PeerUnreachable { .. } | Self::SyncTimeout { .. }
        )
    }

    /// Check if this error is fatal to the whole store.
    ///
    /// Recoverable errors are confined to the affected peer session or
    /// request; only `Internal` halts a store.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Internal { .. })
    }

    /// Process exit code for this error when it reaches `main`.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::InvalidConfig { .. } | Self::OutOfRange { .. } => 1,
            _ => 2,
        }
    }
}

/// Result type using KvError.
pub type KvResult<T> = Result<T, KvError>;
