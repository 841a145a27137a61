//! Persistence: optional per-area snapshots.

pub mod snapshot;
