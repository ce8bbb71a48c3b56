//! Main-store synchronization: the worker-side
//! export of every `SYNC`-flagged record into a flat buffer, and the
//! proxy-side walk that merges that buffer back into the main store under
//! sequence-number and ownership rules.
//!
//! The memfd/ancillary-FD handoff itself lives in [`crate::buffer`] and
//! [`crate::worker::channel`]; this module is the value-level protocol that
//! rides inside that buffer, kept separate so it can be exercised against a
//! plain in-memory `Vec<u8>` in tests without any process/FD machinery.

use crate::error::{CommandError, KvError};
use crate::keys::{Key, Op};
use crate::kv::{KvStore, MergeOp, PredicateDecision, RecordBody, RecordFlags, RecordHeader};

/// Encode one record's header + body as
/// `[is_vector:1][gennum:8][seqnum:8][flags:1][owner_len:2][owner]
/// [ blob_len:4][blob] | [elem_count:4] ([elem_len:4][elem])* ]`,
/// the in-buffer equivalent of a "header fields plus payload
/// elements" record layout.
fn encode_record(header: &RecordHeader, body: &RecordBody) -> Vec<u8> {
    let mut out = Vec::new();
    out.push(body.is_vector() as u8);
    out.extend_from_slice(&header.gennum.to_le_bytes());
    out.extend_from_slice(&header.seqnum.to_le_bytes());
    out.push(header.flags.bits());
    out.extend_from_slice(&(header.owner.len() as u16).to_le_bytes());
    out.extend_from_slice(header.owner.as_bytes());
    match body {
        RecordBody::Blob(b) => {
            out.extend_from_slice(&(b.len() as u32).to_le_bytes());
            out.extend_from_slice(b);
        }
        RecordBody::Vector(elems) => {
            out.extend_from_slice(&(elems.len() as u32).to_le_bytes());
            for elem in elems {
                out.extend_from_slice(&(elem.len() as u32).to_le_bytes());
                out.extend_from_slice(elem);
            }
        }
    }
    out
}

fn decode_record(bytes: &[u8]) -> Option<(RecordHeader, RecordBody)> {
    let mut cursor = 0usize;
    let take = |cursor: &mut usize, n: usize| -> Option<&[u8]> {
        let slice = bytes.get(*cursor..*cursor + n)?;
        *cursor += n;
        Some(slice)
    };
    let is_vector = take(&mut cursor, 1)?[0] != 0;
    let gennum = u64::from_le_bytes(take(&mut cursor, 8)?.try_into().ok()?);
    let seqnum = u64::from_le_bytes(take(&mut cursor, 8)?.try_into().ok()?);
    let flags = RecordFlags::from_bits_truncate(take(&mut cursor, 1)?[0]);
    let owner_len = u16::from_le_bytes(take(&mut cursor, 2)?.try_into().ok()?) as usize;
    let owner = String::from_utf8(take(&mut cursor, owner_len)?.to_vec()).ok()?;
    let header = RecordHeader { gennum, seqnum, flags, owner };
    let body = if is_vector {
        let count = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().ok()?) as usize;
        let mut elems = Vec::with_capacity(count);
        for _ in 0..count {
            let len = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().ok()?) as usize;
            elems.push(take(&mut cursor, len)?.to_vec());
        }
        RecordBody::Vector(elems)
    } else {
        let len = u32::from_le_bytes(take(&mut cursor, 4)?.try_into().ok()?) as usize;
        RecordBody::Blob(take(&mut cursor, len)?.to_vec())
    };
    Some((header, body))
}

/// Serialize every `SYNC`-flagged record of `store` into a flat export
/// buffer, on the worker side: a total-byte-count prefix, then one
/// `[key_len:4][key][record_len:4][record]` entry per SYNC record, in key
/// order (the same order [`KvStore::iter_sync`] walks the `>`..`?` alias
/// range in).
pub fn build_export_buffer(store: &KvStore) -> Vec<u8> {
    let mut body = Vec::new();
    for (key, record) in store.iter_sync() {
        let encoded = encode_record(&record.header, &record.body);
        body.extend_from_slice(&(key.len() as u32).to_le_bytes());
        body.extend_from_slice(key);
        body.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
        body.extend_from_slice(&encoded);
    }
    let mut out = Vec::with_capacity(8 + body.len());
    out.extend_from_slice(&(body.len() as u64).to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// One entry walked out of an export buffer.
struct ExportEntry {
    key: Vec<u8>,
    header: RecordHeader,
    body: RecordBody,
}

fn parse_export_buffer(buf: &[u8]) -> Option<Vec<ExportEntry>> {
    if buf.len() < 8 {
        return None;
    }
    let total = u64::from_le_bytes(buf[0..8].try_into().ok()?) as usize;
    let body = buf.get(8..8 + total)?;
    let mut cursor = 0usize;
    let mut entries = Vec::new();
    while cursor < body.len() {
        let key_len = u32::from_le_bytes(body.get(cursor..cursor + 4)?.try_into().ok()?) as usize;
        cursor += 4;
        let key = body.get(cursor..cursor + key_len)?.to_vec();
        cursor += key_len;
        let rec_len = u32::from_le_bytes(body.get(cursor..cursor + 4)?.try_into().ok()?) as usize;
        cursor += 4;
        let (header, record_body) = decode_record(body.get(cursor..cursor + rec_len)?)?;
        cursor += rec_len;
        entries.push(ExportEntry { key, header, body: record_body });
    }
    Some(entries)
}

/// Why a merge entry was rejected, reusing the existing component error
/// enums rather than inventing a parallel one (`StaleSeqnum` lives on
/// [`CommandError`], ownership mismatches on [`KvError`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncRejection {
    Kv(KvError),
    Command(CommandError),
}

/// What happened to each entry of an export buffer once merged. A
/// per-record merge predicate rejecting is logged and
/// skipped; subsequent records continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Unset,
    Rejected(SyncRejection),
}

/// Merge a worker's `memfd` sync export directly, the call site a proxy
/// uses once [`crate::worker::channel::WorkerChannel::recv_with_fd`] has
/// handed back a `DataExt` frame's ancillary FD.
pub fn apply_mapped_export(
    store: &mut KvStore,
    mapped: &crate::buffer::file::MappedFile,
) -> Vec<(Vec<u8>, MergeOutcome)> {
    apply_export_buffer(store, mapped.as_slice())
}

/// Merge one worker's export buffer into the main store, on the proxy
/// side. Every entry is attempted independently; a rejected entry is
/// recorded in the returned report and does not abort the remaining
/// entries. Relation propagation (`DELTA_WITH_REL`) is intentionally not
/// re-applied here: the worker already updated inverse keys before export,
/// and redoing it at the proxy would double the effect.
pub fn apply_export_buffer(store: &mut KvStore, buf: &[u8]) -> Vec<(Vec<u8>, MergeOutcome)> {
    let Some(entries) = parse_export_buffer(buf) else {
        return Vec::new();
    };
    let mut report = Vec::with_capacity(entries.len());
    for entry in entries {
        let outcome = apply_one(store, &entry);
        report.push((entry.key, outcome));
    }
    report
}

/// An empty-blob `SET` entry is this crate's unset convention: the worker
/// has nothing else to say "this key should disappear" with, since an empty
/// vector body is still a meaningful value (an emptied relation). Only
/// blob-valued SET entries are read this way.
fn is_unset_intent(key: &Key, body: &RecordBody) -> bool {
    matches!(key.op, Op::Set | Op::Illegal) && matches!(body, RecordBody::Blob(b) if b.is_empty())
}

fn apply_one(store: &mut KvStore, entry: &ExportEntry) -> MergeOutcome {
    let Some(parsed_key) = Key::parse(&entry.key) else {
        return MergeOutcome::Rejected(SyncRejection::Kv(KvError::PredicateRejected));
    };

    if is_unset_intent(&parsed_key, &entry.body) {
        return apply_unset(store, entry);
    }

    match parsed_key.op {
        Op::Set | Op::Illegal => apply_set(store, entry),
        Op::Plus => apply_delta(store, entry, crate::delta::DeltaOp::Plus),
        Op::Minus => apply_delta(store, entry, crate::delta::DeltaOp::Minus),
    }
}

/// A plain SET merge: rejected outright on a stale `seqnum`; ownership
/// (`MOD_PRIVATE`/`MOD_PROTECTED`/`MOD_RESERVED`) is then enforced the same
/// way a local write would be, by [`KvStore::set`] itself.
fn apply_set(store: &mut KvStore, entry: &ExportEntry) -> MergeOutcome {
    if let Some(old) = store.get(&entry.key) {
        if entry.header.seqnum < old.header.seqnum {
            return MergeOutcome::Rejected(SyncRejection::Command(CommandError::StaleSeqnum {
                stored: old.header.seqnum,
                incoming: entry.header.seqnum,
            }));
        }
    }
    match store.set(
        &entry.key,
        &entry.header.owner,
        entry.header.flags,
        entry.body.clone(),
        entry.header.gennum,
        entry.header.seqnum,
        MergeOp::Merge,
        |_, _, _| PredicateDecision::accept(),
    ) {
        Ok(_) => MergeOutcome::Applied,
        Err(e) => MergeOutcome::Rejected(SyncRejection::Kv(e)),
    }
}

/// An unset entry is refused outright when the existing record is owned by
/// someone other than the exporting worker's owner tag: a worker may
/// not retract another module's record.
fn apply_unset(store: &mut KvStore, entry: &ExportEntry) -> MergeOutcome {
    if let Some(old) = store.get(&entry.key) {
        if old.header.owner != entry.header.owner {
            return MergeOutcome::Rejected(SyncRejection::Kv(KvError::OwnerMismatch {
                owner: old.header.owner.clone(),
                writer: entry.header.owner.clone(),
            }));
        }
    }
    match store.unset(&entry.key, |_| true) {
        Ok(_) => MergeOutcome::Unset,
        Err(e) => MergeOutcome::Rejected(SyncRejection::Kv(e)),
    }
}

/// A PLUS/MINUS merge: run the delta engine against whatever vector the
/// main store currently holds for this key.
fn apply_delta(store: &mut KvStore, entry: &ExportEntry, op: crate::delta::DeltaOp) -> MergeOutcome {
    let incoming = match &entry.body {
        RecordBody::Vector(v) => v.clone(),
        RecordBody::Blob(_) => return MergeOutcome::Rejected(SyncRejection::Kv(KvError::UdevNamespaceVectorValue)),
    };
    let old = store
        .get(&entry.key)
        .and_then(|r| r.as_vector())
        .map(|v| v.to_vec())
        .unwrap_or_default();
    let delta = match crate::delta::compute_delta(&old, &incoming, op) {
        Ok(d) => d,
        Err(e) => return MergeOutcome::Rejected(SyncRejection::Kv(KvError::from(e))),
    };
    match crate::delta::write_delta(
        store,
        &entry.key,
        &entry.header.owner,
        entry.header.flags,
        entry.header.gennum,
        entry.header.seqnum,
        &delta,
    ) {
        Ok(()) => MergeOutcome::Applied,
        Err(e) => MergeOutcome::Rejected(SyncRejection::Kv(KvError::from(e))),
    }
}

impl From<crate::error::DeltaError> for KvError {
    fn from(e: crate::error::DeltaError) -> Self {
        match e {
            crate::error::DeltaError::UnsortedVector => KvError::PredicateRejected,
            crate::error::DeltaError::Kv(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::Record;

    fn always_accept(_: Option<&Record>, _: &RecordBody, _: RecordFlags) -> PredicateDecision {
        PredicateDecision::accept()
    }

    #[test]
    fn export_then_apply_round_trips_a_blob() {
        let mut worker_store = KvStore::new();
        let key = Key::device("8_0", "SYNTH_UUID").compose();
        worker_store
            .set(&key, "sid-dm", RecordFlags::SYNC, RecordBody::Blob(b"abc".to_vec()), 1, 42, MergeOp::NoOp, always_accept)
            .unwrap();

        let export = build_export_buffer(&worker_store);
        let mut main_store = KvStore::new();
        let report = apply_export_buffer(&mut main_store, &export);
        assert_eq!(report, vec![(key.clone(), MergeOutcome::Applied)]);
        assert_eq!(main_store.get(&key).unwrap().as_blob(), Some(b"abc".as_slice()));
    }

    #[test]
    fn stale_seqnum_is_discarded() {
        let mut main_store = KvStore::new();
        let key = Key::device("8_0", "usr_key").compose();
        main_store
            .set(&key, "mod-x", RecordFlags::SYNC, RecordBody::Blob(b"fresh".to_vec()), 1, 100, MergeOp::NoOp, always_accept)
            .unwrap();

        let mut worker_store = KvStore::new();
        worker_store
            .set(&key, "mod-x", RecordFlags::SYNC, RecordBody::Blob(b"stale".to_vec()), 1, 99, MergeOp::NoOp, always_accept)
            .unwrap();
        let export = build_export_buffer(&worker_store);

        let report = apply_export_buffer(&mut main_store, &export);
        assert!(matches!(
            &report[0].1,
            MergeOutcome::Rejected(SyncRejection::Command(CommandError::StaleSeqnum { stored: 100, incoming: 99 }))
        ));
        assert_eq!(main_store.get(&key).unwrap().as_blob(), Some(b"fresh".as_slice()));
    }

    #[test]
    fn unset_intent_is_rejected_when_owner_differs() {
        let mut main_store = KvStore::new();
        let key = Key::device("8_0", "usr_key").compose();
        main_store
            .set(&key, "mod-a", RecordFlags::SYNC, RecordBody::Blob(b"v".to_vec()), 1, 1, MergeOp::NoOp, always_accept)
            .unwrap();

        let mut worker_store = KvStore::new();
        // An "unset" export entry: empty blob body, a different owner
        // attempting the removal.
        worker_store
            .set(&key, "mod-b", RecordFlags::SYNC, RecordBody::Blob(Vec::new()), 1, 2, MergeOp::NoOp, always_accept)
            .unwrap();
        let export = build_export_buffer(&worker_store);

        let report = apply_export_buffer(&mut main_store, &export);
        assert!(matches!(&report[0].1, MergeOutcome::Rejected(SyncRejection::Kv(KvError::OwnerMismatch { .. }))));
        assert!(main_store.get(&key).is_some());
    }

    #[test]
    fn unset_intent_succeeds_for_same_owner() {
        let mut main_store = KvStore::new();
        let key = Key::device("8_0", "usr_key").compose();
        main_store
            .set(&key, "mod-a", RecordFlags::SYNC, RecordBody::Blob(b"v".to_vec()), 1, 1, MergeOp::NoOp, always_accept)
            .unwrap();

        let mut worker_store = KvStore::new();
        worker_store
            .set(&key, "mod-a", RecordFlags::SYNC, RecordBody::Blob(Vec::new()), 1, 2, MergeOp::NoOp, always_accept)
            .unwrap();
        let export = build_export_buffer(&worker_store);

        let report = apply_export_buffer(&mut main_store, &export);
        assert_eq!(report, vec![(key.clone(), MergeOutcome::Unset)]);
        assert!(main_store.get(&key).is_none());
    }

    #[test]
    fn plus_merge_unions_into_existing_vector() {
        let mut main_store = KvStore::new();
        let key = Key::device("8_0", "GMB").with_op(Op::Plus).compose();
        main_store
            .set(&key, "sid-dm", RecordFlags::SYNC, RecordBody::Vector(vec![b"a".to_vec()]), 1, 1, MergeOp::NoOp, always_accept)
            .unwrap();

        let mut worker_store = KvStore::new();
        worker_store
            .set(&key, "sid-dm", RecordFlags::SYNC, RecordBody::Vector(vec![b"b".to_vec()]), 1, 2, MergeOp::NoOp, always_accept)
            .unwrap();
        let export = build_export_buffer(&worker_store);

        apply_export_buffer(&mut main_store, &export);
        let merged = main_store.get(&key).unwrap().as_vector().unwrap();
        assert_eq!(merged, &vec![b"a".to_vec(), b"b".to_vec()]);
    }
}
