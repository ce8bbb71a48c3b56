use proptest::prelude::*;

use sid::keys::Key;
use sid::kv::{KvStore, MergeOp, PredicateDecision, RecordBody, RecordFlags};

fn always_accept(_: Option<&sid::kv::Record>, _: &RecordBody, _: RecordFlags) -> PredicateDecision {
    PredicateDecision::accept()
}

fn arb_key_suffix() -> impl Strategy<Value = String> {
    "[a-z0-9]{1,6}".prop_map(|s| s)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// A record carries the SYNC flag if and only if the store's alias
    /// range contains an entry resolving back to it.
    #[test]
    fn prop_sync_flag_iff_alias_exists(suffix in arb_key_suffix(), wants_sync in any::<bool>()) {
        let mut store = KvStore::new();
        let key = Key::device(suffix, "GMB").compose();
        let flags = if wants_sync { RecordFlags::SYNC } else { RecordFlags::empty() };
        store
            .set(&key, "m", flags, RecordBody::Blob(vec![1]), 1, 1, MergeOp::NoOp, always_accept)
            .unwrap();

        let alias_present = store.iter_sync().any(|(k, _)| k == key.as_slice());
        prop_assert_eq!(alias_present, wants_sync);
    }

    /// Once a record carries an ownership-protection flag, a write from a
    /// different owner is always rejected, regardless of the new value.
    #[test]
    fn prop_protected_record_rejects_foreign_owner(
        suffix in arb_key_suffix(),
        flag_idx in 0..3u8,
        new_value in prop::collection::vec(any::<u8>(), 0..8),
    ) {
        let mut store = KvStore::new();
        let key = Key::device(suffix, "PROT").compose();
        let flag = match flag_idx {
            0 => RecordFlags::MOD_PRIVATE,
            1 => RecordFlags::MOD_PROTECTED,
            _ => RecordFlags::MOD_RESERVED,
        };
        store.set(&key, "owner-a", flag, RecordBody::Blob(vec![0]), 1, 1, MergeOp::NoOp, always_accept).unwrap();

        let result = store.set(&key, "owner-b", flag, RecordBody::Blob(new_value), 2, 1, MergeOp::NoOp, always_accept);
        prop_assert!(result.is_err());
        // The stored value must be untouched by the rejected write.
        prop_assert_eq!(store.get(&key).unwrap().header.owner.as_str(), "owner-a");
    }

    /// An unprotected record may always be overwritten by a different
    /// owner, who then becomes the new owner of record.
    #[test]
    fn prop_unprotected_record_accepts_any_owner(suffix in arb_key_suffix()) {
        let mut store = KvStore::new();
        let key = Key::device(suffix, "FREE").compose();
        store.set(&key, "owner-a", RecordFlags::empty(), RecordBody::Blob(vec![0]), 1, 1, MergeOp::NoOp, always_accept).unwrap();
        store.set(&key, "owner-b", RecordFlags::empty(), RecordBody::Blob(vec![1]), 2, 1, MergeOp::NoOp, always_accept).unwrap();
        prop_assert_eq!(store.get(&key).unwrap().header.owner.as_str(), "owner-b");
    }

    /// A vector value whose elements are not strictly ascending is always
    /// rejected, never partially stored.
    #[test]
    fn prop_unsorted_vector_always_rejected(
        suffix in arb_key_suffix(),
        elems in prop::collection::vec(any::<u8>(), 2..8),
    ) {
        let mut store = KvStore::new();
        let key = Key::device(suffix, "VEC").compose();
        let body = RecordBody::Vector(elems.iter().map(|b| vec![*b]).collect());
        let was_sorted = body.is_sorted();
        let result = store.set(&key, "m", RecordFlags::empty(), body, 1, 1, MergeOp::NoOp, always_accept);
        if was_sorted {
            prop_assert!(result.is_ok());
        } else {
            prop_assert!(result.is_err());
            prop_assert!(store.get(&key).is_none());
        }
    }

    /// `add_alias` followed by `unset` of the primary leaves neither key
    /// reachable.
    #[test]
    fn prop_alias_then_unset_primary_leaves_both_unreachable(suffix in arb_key_suffix()) {
        let mut store = KvStore::new();
        let key = Key::device(suffix, "ALIAS").compose();
        store.set(&key, "m", RecordFlags::empty(), RecordBody::Blob(vec![1]), 1, 1, MergeOp::NoOp, always_accept).unwrap();
        let alias_key = sid::keys::to_alias(&key);
        store.add_alias(&alias_key, &key, true).unwrap();
        store.unset(&key, |_| true).unwrap();

        prop_assert!(store.get(&key).is_none());
        prop_assert!(!store.iter_sync().any(|(k, _)| k == key.as_slice()));
    }
}
