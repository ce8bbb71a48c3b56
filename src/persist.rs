//! Persistent snapshots (`CHECKPOINT`/`DBRESTORE`), gated behind the
//! `persistence` feature: there is no automatic on-disk durability layer,
//! only this one explicit persistent-snapshot command pair.
//!
//! A `StoreError`-style enum wraps IO and serialization failures around a
//! flat JSON-on-disk format: a [`DumpRecord`] snapshot of every
//! `PERSISTENT`-flagged KV record.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::kv::{DumpRecord, KvStore};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The on-disk snapshot format: the generation counter at snapshot time
/// (so a restore can tell how stale the snapshot is relative to the
/// store it's loaded into) plus the dumped records themselves.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    gennum: u64,
    records: Vec<DumpRecord>,
}

/// Write every `PERSISTENT`-flagged record of `store` to `path` as JSON;
/// this is what backs the `CHECKPOINT` command. Writes to a sibling temp file first
/// and renames over `path`, so a crash mid-write never leaves a truncated
/// snapshot in place.
pub fn write_snapshot(store: &KvStore, gennum: u64, path: &Path) -> Result<usize, PersistError> {
    let records = store.dump(true);
    let count = records.len();
    let snapshot = Snapshot { gennum, records };
    let encoded = serde_json::to_vec_pretty(&snapshot)?;

    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, &encoded)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(count)
}

/// Load a snapshot written by [`write_snapshot`] back into `store`. Not
/// called automatically at daemon startup; exposed for an explicit
/// `DBRESTORE` command or a test harness that wants to seed a store from
/// a fixture.
pub fn read_snapshot(store: &mut KvStore, path: &Path) -> Result<usize, PersistError> {
    let encoded = std::fs::read(path)?;
    let snapshot: Snapshot = serde_json::from_slice(&encoded)?;
    let count = snapshot.records.len();
    store.restore(snapshot.records);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Key;
    use crate::kv::{MergeOp, PredicateDecision, RecordBody, RecordFlags};

    fn always_accept(_: Option<&crate::kv::Record>, _: &RecordBody, _: RecordFlags) -> PredicateDecision {
        PredicateDecision::accept()
    }

    #[test]
    fn write_then_read_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sid.db");

        let mut store = KvStore::new();
        let key = Key::device("8_0", "#RDY").compose();
        store
            .set(&key, "sid-core", RecordFlags::PERSISTENT, RecordBody::Blob(b"UNPROCESSED".to_vec()), 3, 42, MergeOp::NoOp, always_accept)
            .unwrap();
        let transient_key = Key::device("8_0", "#RES").compose();
        store
            .set(&transient_key, "sid-core", RecordFlags::empty(), RecordBody::Blob(b"UNPROCESSED".to_vec()), 3, 42, MergeOp::NoOp, always_accept)
            .unwrap();

        let written = write_snapshot(&store, 3, &path).unwrap();
        assert_eq!(written, 1);

        let mut restored = KvStore::new();
        let read = read_snapshot(&mut restored, &path).unwrap();
        assert_eq!(read, 1);
        assert_eq!(restored.get(&key).unwrap().as_blob(), Some(b"UNPROCESSED".as_slice()));
        assert!(restored.get(&transient_key).is_none());
    }

    #[test]
    fn read_snapshot_surfaces_missing_file_as_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.db");
        let mut store = KvStore::new();
        assert!(matches!(read_snapshot(&mut store, &path), Err(PersistError::Io(_))));
    }
}
