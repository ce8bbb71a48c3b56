use proptest::prelude::*;
use std::collections::BTreeSet;

use sid::delta::{compute_delta, DeltaOp};

/// A strategy producing a strictly-ascending `Vec<Vec<u8>>` drawn from a
/// small alphabet, so duplicate-collision cases show up often.
fn arb_sorted_vector() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::btree_set(0u8..12, 0..8).prop_map(|set: BTreeSet<u8>| {
        set.into_iter().map(|b| vec![b]).collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// SET's `final` always equals the incoming vector, regardless of the
    /// prior value.
    #[test]
    fn prop_set_final_is_incoming(old in arb_sorted_vector(), incoming in arb_sorted_vector()) {
        let result = compute_delta(&old, &incoming, DeltaOp::Set).unwrap();
        prop_assert_eq!(result.final_vec, incoming);
    }

    /// PLUS is idempotent: applying the same incoming set twice in a row
    /// yields the same final vector, and the second application reports no
    /// further additions.
    #[test]
    fn prop_plus_idempotent(old in arb_sorted_vector(), incoming in arb_sorted_vector()) {
        let first = compute_delta(&old, &incoming, DeltaOp::Plus).unwrap();
        let second = compute_delta(&first.final_vec, &incoming, DeltaOp::Plus).unwrap();
        prop_assert_eq!(second.final_vec, first.final_vec);
        prop_assert!(second.plus.is_empty());
    }

    /// PLUS followed by MINUS of the same incoming set returns to a
    /// superset-free subtraction: every element of `incoming` absent from
    /// the result.
    #[test]
    fn prop_plus_then_minus_removes_added_elements(old in arb_sorted_vector(), incoming in arb_sorted_vector()) {
        let plused = compute_delta(&old, &incoming, DeltaOp::Plus).unwrap();
        let minused = compute_delta(&plused.final_vec, &incoming, DeltaOp::Minus).unwrap();
        for elem in &incoming {
            prop_assert!(!minused.final_vec.contains(elem));
        }
    }

    /// The final vector from any operator is always itself strictly
    /// ascending (the engine never produces a value violating the KV
    /// record sortedness invariant).
    #[test]
    fn prop_result_is_always_sorted(old in arb_sorted_vector(), incoming in arb_sorted_vector(), op_idx in 0..3u8) {
        let op = match op_idx { 0 => DeltaOp::Set, 1 => DeltaOp::Plus, _ => DeltaOp::Minus };
        let result = compute_delta(&old, &incoming, op).unwrap();
        prop_assert!(result.final_vec.windows(2).all(|w| w[0] < w[1]));
    }

    /// `plus` and `minus` are always disjoint from each other.
    #[test]
    fn prop_plus_and_minus_are_disjoint(old in arb_sorted_vector(), incoming in arb_sorted_vector(), op_idx in 0..3u8) {
        let op = match op_idx { 0 => DeltaOp::Set, 1 => DeltaOp::Plus, _ => DeltaOp::Minus };
        let result = compute_delta(&old, &incoming, op).unwrap();
        for elem in &result.plus {
            prop_assert!(!result.minus.contains(elem));
        }
    }
}
