//! On-disk snapshots.
//!
//! One file per area holding the current map as a length-prefixed
//! sequence of bincode-encoded entries. Writes go to a temp file that is
//! atomically renamed over the target, so a crash mid-write never leaves
//! a torn snapshot. On startup a snapshot older than the staleness bound
//! is ignored; a fresh full-sync repopulates the map instead.

use crate::store::value::Value;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Magic bytes heading every snapshot file.
const SNAPSHOT_MAGIC: &[u8; 4] = b"FKV1";

/// Per-area snapshot reader/writer.
pub struct SnapshotStore {
    dir: PathBuf,
    staleness_bound: Duration,
}

impl SnapshotStore {
    /// Snapshot store rooted at a directory.
    pub fn new(dir: impl Into<PathBuf>, staleness_bound_ms: u64) -> Self {
        Self {
            dir: dir.into(),
            staleness_bound: Duration::from_millis(staleness_bound_ms),
        }
    }

    /// Path of an area's snapshot file.
    pub fn path_for(&self, area: &str) -> PathBuf {
        // Area IDs are free-form; keep the file name tame.
        let safe: String = area
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.kvsnap"))
    }

    /// Write an area's entries, atomically replacing any previous file.
    pub fn persist(&self, area: &str, entries: &[(String, Value)]) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;

        let target = self.path_for(area);
        let tmp = target.with_extension("kvsnap.tmp");
        {
            let file = File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let mut writer = BufWriter::new(file);
            writer.write_all(SNAPSHOT_MAGIC)?;
            writer.write_all(&(entries.len() as u32).to_be_bytes())?;
            for entry in entries {
                let body = bincode::serialize(entry).context("failed to encode entry")?;
                writer.write_all(&(body.len() as u32).to_be_bytes())?;
                writer.write_all(&body)?;
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        fs::rename(&tmp, &target)
            .with_context(|| format!("failed to move snapshot into {}", target.display()))?;
        info!(area, entries = entries.len(), path = %target.display(), "snapshot written");
        Ok(())
    }

    /// Load an area's entries if a snapshot exists and is fresh enough.
    pub fn load(&self, area: &str) -> Result<Option<Vec<(String, Value)>>> {
        let path = self.path_for(area);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(_) => return Ok(None),
        };

        let age = metadata
            .modified()
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .unwrap_or(Duration::MAX);
        if age > self.staleness_bound {
            warn!(area, path = %path.display(), age_s = age.as_secs(), "snapshot too stale, ignoring");
            return Ok(None);
        }

        let entries = read_snapshot(&path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        info!(area, entries = entries.len(), "snapshot loaded");
        Ok(Some(entries))
    }
}

fn read_snapshot(path: &Path) -> Result<Vec<(String, Value)>> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    anyhow::ensure!(&magic == SNAPSHOT_MAGIC, "bad snapshot magic");

    let mut count_buf = [0u8; 4];
    reader.read_exact(&mut count_buf)?;
    let count = u32::from_be_bytes(count_buf) as usize;

    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body)?;
        let entry: (String, Value) =
            bincode::deserialize(&body).context("failed to decode entry")?;
        entries.push(entry);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::TTL_INFINITY;
    use tempfile::TempDir;

    fn entries() -> Vec<(String, Value)> {
        vec![
            (
                "adj:node-1".to_string(),
                Value::new(3, "node-1", b"links".to_vec(), TTL_INFINITY, 0),
            ),
            (
                "prefix:node-1".to_string(),
                Value::new(1, "node-1", b"routes".to_vec(), 300_000, 2),
            ),
        ]
    }

    #[test]
    fn round_trip() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 60_000);

        store.persist("0", &entries()).unwrap();
        let loaded = store.load("0").unwrap().unwrap();
        assert_eq!(loaded, entries());
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 60_000);
        assert!(store.load("0").unwrap().is_none());
    }

    #[test]
    fn stale_snapshot_is_ignored() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 60_000);
        store.persist("0", &entries()).unwrap();

        // A zero staleness bound makes any existing file too old.
        let strict = SnapshotStore::new(dir.path(), 0);
        assert!(strict.load("0").unwrap().is_none());
    }

    #[test]
    fn rewrite_replaces_previous_content() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 60_000);
        store.persist("0", &entries()).unwrap();

        let smaller = vec![entries().remove(0)];
        store.persist("0", &smaller).unwrap();
        assert_eq!(store.load("0").unwrap().unwrap(), smaller);
    }

    #[test]
    fn corrupt_snapshot_errors() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 60_000);
        std::fs::write(store.path_for("0"), b"not a snapshot").unwrap();
        assert!(store.load("0").is_err());
    }

    #[test]
    fn distinct_areas_use_distinct_files() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path(), 60_000);
        assert_ne!(store.path_for("a"), store.path_for("b"));
        assert_ne!(store.path_for("a/x"), store.path_for("b/x"));
    }
}
