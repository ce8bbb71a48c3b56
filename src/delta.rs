//! The delta engine.
//!
//! Applies one of three operators to a vector value already held by the KV
//! store, via a sorted merge of the existing elements against the
//! caller-supplied incoming elements (both ascending under byte-wise
//! comparison, per the KV record invariant in [`crate::kv::record`]):
//!
//! - `Set`: the incoming vector *becomes* the value.
//! - `Plus`: the incoming elements are unioned in.
//! - `Minus`: the incoming elements are removed.
//!
//! Each application also reports the `plus`/`minus` vectors (elements
//! added/removed relative to the prior value) so that callers performing
//! relation maintenance ([`apply_with_rel`]) or absolute-delta bookkeeping
//! ([`apply_absolute_companions`]) don't have to recompute the diff.

use crate::error::DeltaError;
use crate::keys::{Domain, Key, Namespace, Op};
use crate::kv::{KvStore, MergeOp, PredicateDecision, RecordBody, RecordFlags};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Set,
    Plus,
    Minus,
}

impl From<Op> for DeltaOp {
    fn from(op: Op) -> Self {
        match op {
            Op::Set | Op::Illegal => DeltaOp::Set,
            Op::Plus => DeltaOp::Plus,
            Op::Minus => DeltaOp::Minus,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeltaResult {
    pub final_vec: Vec<Vec<u8>>,
    pub plus: Vec<Vec<u8>>,
    pub minus: Vec<Vec<u8>>,
}

/// Merge `old` and `incoming` (each strictly ascending) under `op`,
/// producing the resulting vector plus the elements added/removed relative
/// to `old`. A two-pointer merge, since both inputs are already sorted.
pub fn compute_delta(old: &[Vec<u8>], incoming: &[Vec<u8>], op: DeltaOp) -> Result<DeltaResult, DeltaError> {
    if !is_ascending(old) || !is_ascending(incoming) {
        return Err(DeltaError::UnsortedVector);
    }
    match op {
        DeltaOp::Set => {
            let mut plus = Vec::new();
            let mut minus = Vec::new();
            let (mut i, mut j) = (0, 0);
            while i < old.len() || j < incoming.len() {
                match (old.get(i), incoming.get(j)) {
                    (Some(o), Some(n)) if o == n => {
                        i += 1;
                        j += 1;
                    }
                    (Some(o), Some(n)) if o < n => {
                        minus.push(o.clone());
                        i += 1;
                    }
                    (Some(_), Some(n)) => {
                        plus.push(n.clone());
                        j += 1;
                    }
                    (Some(o), None) => {
                        minus.push(o.clone());
                        i += 1;
                    }
                    (None, Some(n)) => {
                        plus.push(n.clone());
                        j += 1;
                    }
                    (None, None) => unreachable!(),
                }
            }
            Ok(DeltaResult { final_vec: incoming.to_vec(), plus, minus })
        }
        DeltaOp::Plus => {
            let mut final_vec = Vec::with_capacity(old.len() + incoming.len());
            let mut plus = Vec::new();
            let (mut i, mut j) = (0, 0);
            while i < old.len() || j < incoming.len() {
                match (old.get(i), incoming.get(j)) {
                    (Some(o), Some(n)) if o == n => {
                        final_vec.push(o.clone());
                        i += 1;
                        j += 1;
                    }
                    (Some(o), Some(n)) if o < n => {
                        final_vec.push(o.clone());
                        i += 1;
                    }
                    (Some(_), Some(n)) => {
                        final_vec.push(n.clone());
                        plus.push(n.clone());
                        j += 1;
                    }
                    (Some(o), None) => {
                        final_vec.push(o.clone());
                        i += 1;
                    }
                    (None, Some(n)) => {
                        final_vec.push(n.clone());
                        plus.push(n.clone());
                        j += 1;
                    }
                    (None, None) => unreachable!(),
                }
            }
            Ok(DeltaResult { final_vec, plus, minus: Vec::new() })
        }
        DeltaOp::Minus => {
            let mut final_vec = Vec::with_capacity(old.len());
            let mut minus = Vec::new();
            let (mut i, mut j) = (0, 0);
            while i < old.len() {
                match incoming.get(j) {
                    Some(n) if &old[i] == n => {
                        minus.push(old[i].clone());
                        i += 1;
                        j += 1;
                    }
                    Some(n) if &old[i] > n => {
                        j += 1;
                    }
                    _ => {
                        final_vec.push(old[i].clone());
                        i += 1;
                    }
                }
            }
            Ok(DeltaResult { final_vec, plus: Vec::new(), minus })
        }
    }
}

fn is_ascending(elems: &[Vec<u8>]) -> bool {
    elems.windows(2).all(|w| w[0] < w[1])
}

/// Apply a computed delta to `key`'s vector value in `store`, under
/// `owner`/`flags`/`gennum`/`seqnum`, accepting every write unconditionally.
/// Relation callers that need ownership/protection enforcement should use
/// [`KvStore::set`] directly with their own predicate; this helper is the
/// common case used by the scan pipeline's own writes.
pub fn write_delta(
    store: &mut KvStore,
    key: &[u8],
    owner: &str,
    flags: RecordFlags,
    gennum: u64,
    seqnum: u64,
    result: &DeltaResult,
) -> Result<(), DeltaError> {
    store
        .set(
            key,
            owner,
            flags,
            RecordBody::Vector(result.final_vec.clone()),
            gennum,
            seqnum,
            MergeOp::NoOp,
            |_, _, _| PredicateDecision::accept(),
        )
        .map_err(DeltaError::from)?;
    Ok(())
}

/// `DELTA_WITH_REL`: propagate a forward-key delta to the inverse relation,
/// bounded to a single recursion level (`DELTA_WITH_DIFF`): for each element
/// added to `forward_key`'s vector, union `forward_id` into that element's
/// inverse-key vector; for each element removed, remove `forward_id` from
/// it. The inverse keys themselves are never further propagated.
pub fn apply_with_rel(
    store: &mut KvStore,
    forward_key: &Key,
    forward_id: &[u8],
    delta: &DeltaResult,
    owner: &str,
    gennum: u64,
    seqnum: u64,
) -> Result<(), DeltaError> {
    for added in &delta.plus {
        let inverse_key = inverse_key_for(forward_key, added).compose();
        propagate_one(store, &inverse_key, forward_id, DeltaOp::Plus, owner, gennum, seqnum)?;
    }
    for removed in &delta.minus {
        let inverse_key = inverse_key_for(forward_key, removed).compose();
        propagate_one(store, &inverse_key, forward_id, DeltaOp::Minus, owner, gennum, seqnum)?;
    }
    Ok(())
}

fn inverse_key_for(forward_key: &Key, member: &[u8]) -> Key {
    Key::new(Namespace::Global, String::from_utf8_lossy(member).into_owned(), forward_key.core.clone())
        .with_dom(Domain::Layer)
}

fn propagate_one(
    store: &mut KvStore,
    inverse_key: &[u8],
    forward_id: &[u8],
    op: DeltaOp,
    owner: &str,
    gennum: u64,
    seqnum: u64,
) -> Result<(), DeltaError> {
    let old = match store.get(inverse_key) {
        Some(r) => r.as_vector().map(|v| v.to_vec()).unwrap_or_default(),
        None => Vec::new(),
    };
    let incoming = vec![forward_id.to_vec()];
    let delta = compute_delta(&old, &incoming, op)?;
    write_delta(store, inverse_key, owner, RecordFlags::empty(), gennum, seqnum, &delta)
}

/// Maintains the absolute "+"/"-" companion records: every
/// delta applied to `base_key` folds its `plus`/`minus` sets into two
/// dedicated companion keys (same fields, `op` slot set to `Op::Plus` /
/// `Op::Minus`) recording what has, cumulatively, ever been added/removed
/// here since the store's last persistent snapshot.
///
/// This is not a plain union merge: an element that was previously recorded
/// as added (held in the `+` companion) and is now being removed again by
/// this step's `minus` set is a *contradiction* — net, it was never durably
/// added, so it is dropped from both companions rather than appearing in
/// `-` as well. Symmetrically for an element held in `-` that now reappears
/// in this step's `plus`. The fix is a synchronized
/// sorted walk of `old_plus` against `new_minus` and `old_minus` against
/// `new_plus`, with matching positions dropped from the merged result; the
/// two-pointer [`split_common`] below is that walk.
pub fn apply_absolute_companions(
    store: &mut KvStore,
    base_key: &Key,
    delta: &DeltaResult,
    owner: &str,
    gennum: u64,
    seqnum: u64,
) -> Result<(), DeltaError> {
    let mut new_plus = delta.plus.clone();
    new_plus.sort();
    let mut new_minus = delta.minus.clone();
    new_minus.sort();
    if new_plus.is_empty() && new_minus.is_empty() {
        return Ok(());
    }

    let plus_key = base_key.clone().with_op(Op::Plus).compose();
    let minus_key = base_key.clone().with_op(Op::Minus).compose();
    let old_plus = store.get(&plus_key).and_then(|r| r.as_vector()).map(|v| v.to_vec()).unwrap_or_default();
    let old_minus = store.get(&minus_key).and_then(|r| r.as_vector()).map(|v| v.to_vec()).unwrap_or_default();

    let (old_plus_trimmed, contradictions_plus) = split_common(&old_plus, &new_minus);
    let (old_minus_trimmed, contradictions_minus) = split_common(&old_minus, &new_plus);
    let (new_plus_trimmed, _) = split_common(&new_plus, &contradictions_minus);
    let (new_minus_trimmed, _) = split_common(&new_minus, &contradictions_plus);

    let merged_plus = sorted_union(&old_plus_trimmed, &new_plus_trimmed);
    let merged_minus = sorted_union(&old_minus_trimmed, &new_minus_trimmed);

    if merged_plus != old_plus {
        let result = DeltaResult { final_vec: merged_plus, plus: Vec::new(), minus: Vec::new() };
        write_delta(store, &plus_key, owner, RecordFlags::empty(), gennum, seqnum, &result)?;
    }
    if merged_minus != old_minus {
        let result = DeltaResult { final_vec: merged_minus, plus: Vec::new(), minus: Vec::new() };
        write_delta(store, &minus_key, owner, RecordFlags::empty(), gennum, seqnum, &result)?;
    }
    Ok(())
}

/// Split `sorted_a` into the elements it does *not* share with `sorted_b`
/// and the elements it does, preserving order. Both inputs must already be
/// strictly ascending.
fn split_common(sorted_a: &[Vec<u8>], sorted_b: &[Vec<u8>]) -> (Vec<Vec<u8>>, Vec<Vec<u8>>) {
    let mut unique = Vec::new();
    let mut common = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < sorted_a.len() {
        match sorted_b.get(j) {
            Some(b) if sorted_a[i] == *b => {
                common.push(sorted_a[i].clone());
                i += 1;
                j += 1;
            }
            Some(b) if sorted_a[i] > *b => {
                j += 1;
            }
            _ => {
                unique.push(sorted_a[i].clone());
                i += 1;
            }
        }
    }
    (unique, common)
}

/// Merge two strictly-ascending, already-deduplicated vectors into one.
fn sorted_union(a: &[Vec<u8>], b: &[Vec<u8>]) -> Vec<Vec<u8>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        match (a.get(i), b.get(j)) {
            (Some(x), Some(y)) if x == y => {
                out.push(x.clone());
                i += 1;
                j += 1;
            }
            (Some(x), Some(y)) if x < y => {
                out.push(x.clone());
                i += 1;
            }
            (Some(_), Some(y)) => {
                out.push(y.clone());
                j += 1;
            }
            (Some(x), None) => {
                out.push(x.clone());
                i += 1;
            }
            (None, Some(y)) => {
                out.push(y.clone());
                j += 1;
            }
            (None, None) => unreachable!(),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<Vec<u8>> {
        items.iter().map(|s| s.as_bytes().to_vec()).collect()
    }

    #[test]
    fn plus_is_union() {
        let old = v(&["a", "c"]);
        let incoming = v(&["b", "c"]);
        let result = compute_delta(&old, &incoming, DeltaOp::Plus).unwrap();
        assert_eq!(result.final_vec, v(&["a", "b", "c"]));
        assert_eq!(result.plus, v(&["b"]));
        assert!(result.minus.is_empty());
    }

    #[test]
    fn minus_removes_matching() {
        let old = v(&["a", "b", "c"]);
        let incoming = v(&["b"]);
        let result = compute_delta(&old, &incoming, DeltaOp::Minus).unwrap();
        assert_eq!(result.final_vec, v(&["a", "c"]));
        assert_eq!(result.minus, v(&["b"]));
        assert!(result.plus.is_empty());
    }

    #[test]
    fn set_reports_symmetric_difference() {
        let old = v(&["a", "b"]);
        let incoming = v(&["b", "c"]);
        let result = compute_delta(&old, &incoming, DeltaOp::Set).unwrap();
        assert_eq!(result.final_vec, incoming);
        assert_eq!(result.plus, v(&["c"]));
        assert_eq!(result.minus, v(&["a"]));
    }

    #[test]
    fn plus_idempotent_on_repeat() {
        let old = v(&["a", "b"]);
        let result = compute_delta(&old, &v(&["b"]), DeltaOp::Plus).unwrap();
        assert_eq!(result.final_vec, old);
        assert!(result.plus.is_empty());
    }

    #[test]
    fn rejects_unsorted_input() {
        let old = v(&["b", "a"]);
        assert!(compute_delta(&old, &v(&["a"]), DeltaOp::Plus).is_err());
    }

    #[test]
    fn with_rel_propagates_one_level() {
        let mut store = KvStore::new();
        let forward = Key::device("8_0", "GMB");
        let delta = compute_delta(&[], &v(&["grpA"]), DeltaOp::Plus).unwrap();
        apply_with_rel(&mut store, &forward, b"8_0", &delta, "sid-dm", 1, 1).unwrap();
        let inverse_key = inverse_key_for(&forward, b"grpA").compose();
        let members = store.get(&inverse_key).unwrap().as_vector().unwrap();
        assert_eq!(members, &v(&["8_0"]));
    }

    #[test]
    fn absolute_companions_accumulate() {
        let mut store = KvStore::new();
        let base = Key::device("8_0", "GMB");
        let d1 = compute_delta(&[], &v(&["a"]), DeltaOp::Plus).unwrap();
        apply_absolute_companions(&mut store, &base, &d1, "m", 1, 1).unwrap();
        let d2 = compute_delta(&v(&["a"]), &v(&["a", "b"]), DeltaOp::Plus).unwrap();
        apply_absolute_companions(&mut store, &base, &d2, "m", 2, 1).unwrap();
        let plus_key = base.clone().with_op(Op::Plus).compose();
        let companion = store.get(&plus_key).unwrap().as_vector().unwrap();
        assert_eq!(companion, &v(&["a", "b"]));
    }

    /// An element recorded as added, then removed again in a later step,
    /// cancels out of both companions rather than accumulating in `-` as
    /// well: positions marked as contradictory are dropped from both.
    #[test]
    fn absolute_companions_cancel_contradictory_add_then_remove() {
        let mut store = KvStore::new();
        let base = Key::device("8_0", "GMB");

        let added = compute_delta(&[], &v(&["a", "b"]), DeltaOp::Plus).unwrap();
        apply_absolute_companions(&mut store, &base, &added, "m", 1, 1).unwrap();

        let removed = compute_delta(&v(&["a", "b"]), &v(&["a"]), DeltaOp::Set).unwrap();
        assert_eq!(removed.minus, v(&["b"]));
        apply_absolute_companions(&mut store, &base, &removed, "m", 2, 1).unwrap();

        let plus_key = base.clone().with_op(Op::Plus).compose();
        let minus_key = base.clone().with_op(Op::Minus).compose();
        let plus_companion = store.get(&plus_key).unwrap().as_vector().unwrap();
        assert_eq!(plus_companion, &v(&["a"]));
        // "b" cancels out entirely: it never appears in the `-` companion.
        assert!(store.get(&minus_key).is_none());
    }
}
