#![allow(missing_docs)]

use poda::BitVector;
use proptest::prelude::*;

fn from_indices(indices: &[u32]) -> BitVector {
    indices.iter().copied().collect()
}

proptest! {
    #[test]
    fn pickle_roundtrip(indices in proptest::collection::vec(0u32..4096, 0..64)) {
        let bv = from_indices(&indices);
        let mut buf = Vec::new();
        bv.write_to(&mut buf).unwrap();
        let back = BitVector::read_from(&mut buf.as_slice()).unwrap();
        prop_assert_eq!(back, bv);
    }

    #[test]
    fn roundtrip_ignores_trailing_resets(
        indices in proptest::collection::vec(0u32..512, 1..32),
        extra in 512u32..2048,
    ) {
        let mut bv = from_indices(&indices);
        bv.set(extra);
        bv.reset(extra);
        let mut buf = Vec::new();
        bv.write_to(&mut buf).unwrap();
        let back = BitVector::read_from(&mut buf.as_slice()).unwrap();
        prop_assert_eq!(&back, &from_indices(&indices));
    }

    #[test]
    fn idempotent_algebra(indices in proptest::collection::vec(0u32..2048, 0..64)) {
        let bv = from_indices(&indices);
        prop_assert_eq!(&bv.and(&bv), &bv);
        prop_assert_eq!(&bv.or(&bv), &bv);
        prop_assert!(bv.minus(&bv).is_empty());
    }

    #[test]
    fn difference_and_union_partition(
        a in proptest::collection::vec(0u32..2048, 0..64),
        b in proptest::collection::vec(0u32..2048, 0..64),
    ) {
        let a = from_indices(&a);
        let b = from_indices(&b);
        let only_a = a.minus(&b);
        let both = a.and(&b);
        prop_assert_eq!(&only_a.or(&both), &a);
        prop_assert_eq!(only_a.and(&b).cardinality(), 0);
    }

    #[test]
    fn disjoint_union_cardinality(
        a in proptest::collection::vec(0u32..1024, 0..64),
        b in proptest::collection::vec(1024u32..2048, 0..64),
    ) {
        let a = from_indices(&a);
        let b = from_indices(&b);
        prop_assert_eq!(a.or(&b).cardinality(), a.cardinality() + b.cardinality());
    }

    #[test]
    fn msb_none_iff_empty(indices in proptest::collection::vec(0u32..4096, 0..16)) {
        let bv = from_indices(&indices);
        prop_assert_eq!(bv.msb().is_none(), bv.is_empty());
        if let Some(msb) = bv.msb() {
            prop_assert_eq!(Some(&msb), indices.iter().max());
            prop_assert!(bv.size() >= msb + 1);
        }
    }

    #[test]
    fn interval_set_then_reset_is_empty(lo in 0u32..1000, width in 0u32..300) {
        let mut bv = BitVector::new();
        bv.set_interval(lo, lo + width);
        prop_assert_eq!(bv.cardinality(), width + 1);
        bv.reset_interval(lo, lo + width);
        prop_assert!(bv.is_empty());
    }

    #[test]
    fn iter_matches_reads(indices in proptest::collection::vec(0u32..2048, 0..64)) {
        let bv = from_indices(&indices);
        let mut seen: Vec<u32> = bv.iter().collect();
        seen.dedup();
        prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
        for &i in &seen {
            prop_assert!(bv.read(i));
        }
        prop_assert_eq!(seen.len() as u32, bv.cardinality());
    }
}

#[test]
fn randomized_ops_agree_with_a_model_set() {
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;
    use std::collections::BTreeSet;

    let mut rng = ChaCha8Rng::seed_from_u64(0x9e37_79b9);
    let mut bv = BitVector::new();
    let mut model = BTreeSet::new();
    for _ in 0..10_000 {
        let i = rng.gen_range(0u32..5000);
        if rng.gen_bool(0.6) {
            assert_eq!(bv.set(i), !model.insert(i));
        } else {
            assert_eq!(bv.reset(i), model.remove(&i));
        }
    }
    assert_eq!(bv.cardinality() as usize, model.len());
    assert_eq!(bv.msb(), model.last().copied());
    let seen: Vec<u32> = bv.iter().collect();
    let expect: Vec<u32> = model.into_iter().collect();
    assert_eq!(seen, expect);
}

#[test]
fn next_avail_fills_lowest_hole() {
    let mut bv = BitVector::new();
    bv.set_interval(0, 499);
    bv.reset(123);
    assert_eq!(bv.next_avail(true), 123);
    assert_eq!(bv.next_avail(true), 500);
    assert_eq!(bv.cardinality(), 501);
}
