//! Property-Based Tests for the Mojette Transform
//!
//! Uses proptest to verify the forward/inverse transform across layouts,
//! block contents, run lengths and projection subsets.
//!
//! # Test Properties
//!
//! 1. **Roundtrip Correctness**: inverse(any `inverse` projections of
//!    forward(run)) = run
//! 2. **Order Independence**: the order projections are supplied in does not
//!    matter
//! 3. **Sizing**: every projection has exactly `size(mp) * nblocks` bins and
//!    the forward pass never writes past them
//! 4. **Linearity**: forward(a ^ b) = forward(a) ^ forward(b)

#![cfg(test)]

use std::sync::Arc;

use proptest::prelude::*;

use super::distribution::{runs, DistributionBitmap};
use super::layout::{Layout, LayoutParams, BLOCK_SIZE};
use super::transform::MojetteCodec;

// =============================================================================
// Property Strategies
// =============================================================================

fn layout_strategy() -> impl Strategy<Value = Layout> {
    prop::sample::select(Layout::ALL.to_vec())
}

/// A layout together with a shuffled subset of `inverse` projection indices
fn layout_and_subset_strategy() -> impl Strategy<Value = (Layout, Vec<usize>)> {
    layout_strategy().prop_flat_map(|layout| {
        let (inverse, forward, _) = layout.counts();
        let subset = prop::sample::subsequence((0..forward).collect::<Vec<_>>(), inverse)
            .prop_shuffle();
        (Just(layout), subset)
    })
}

/// Whole-block data for a run of 1 to 3 blocks
fn run_strategy() -> impl Strategy<Value = Vec<u8>> {
    (1usize..=3).prop_flat_map(|nblocks| {
        prop::collection::vec(any::<u8>(), nblocks * BLOCK_SIZE)
    })
}

fn codec(layout: Layout) -> MojetteCodec {
    MojetteCodec::new(Arc::new(
        LayoutParams::new(layout).expect("preset layouts are valid"),
    ))
}

// =============================================================================
// Roundtrip Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: any `inverse` projections rebuild the run.
    #[test]
    fn prop_roundtrip_any_subset(
        (layout, subset) in layout_and_subset_strategy(),
        data in run_strategy(),
    ) {
        let codec = codec(layout);
        let nblocks = data.len() / BLOCK_SIZE;

        let mut set = codec.projection_set(nblocks);
        codec.forward(&data, &mut set)?;

        let mut out = vec![0u8; data.len()];
        codec.inverse(&mut set, &subset, &mut out)?;

        prop_assert_eq!(out, data, "{} subset {:?}", layout, subset);
    }

    /// Property: decoding through the wire image gives the same result.
    #[test]
    fn prop_roundtrip_through_wire_image(
        (layout, subset) in layout_and_subset_strategy(),
        data in run_strategy(),
    ) {
        let codec = codec(layout);
        let nblocks = data.len() / BLOCK_SIZE;

        let mut encoded = codec.projection_set(nblocks);
        codec.forward(&data, &mut encoded)?;

        let mut received = codec.projection_set(nblocks);
        received.reset(nblocks)?;
        for &mp in &subset {
            received.load_bytes(mp, &encoded.to_bytes(mp))?;
        }

        let mut out = vec![0u8; data.len()];
        codec.inverse(&mut received, &subset, &mut out)?;
        prop_assert_eq!(out, data);
    }
}

// =============================================================================
// Structural Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: projection lengths follow the size table.
    #[test]
    fn prop_projection_sizes(
        layout in layout_strategy(),
        data in run_strategy(),
    ) {
        let codec = codec(layout);
        let nblocks = data.len() / BLOCK_SIZE;
        let mut set = codec.projection_set(4);
        codec.forward(&data, &mut set)?;

        let params = codec.params();
        for mp in 0..params.forward {
            prop_assert_eq!(set.projection(mp).len(), params.sizes[mp] * nblocks);
            prop_assert_eq!(set.to_bytes(mp).len(), params.projection_bytes(mp, nblocks));
        }
    }

    /// Property: the transform is linear over XOR.
    #[test]
    fn prop_forward_is_xor_linear(
        layout in layout_strategy(),
        a in prop::collection::vec(any::<u8>(), BLOCK_SIZE),
        b in prop::collection::vec(any::<u8>(), BLOCK_SIZE),
    ) {
        let codec = codec(layout);
        let mixed: Vec<u8> = a.iter().zip(&b).map(|(x, y)| x ^ y).collect();

        let mut set_a = codec.projection_set(1);
        let mut set_b = codec.projection_set(1);
        let mut set_mixed = codec.projection_set(1);
        codec.forward(&a, &mut set_a)?;
        codec.forward(&b, &mut set_b)?;
        codec.forward(&mixed, &mut set_mixed)?;

        for mp in 0..codec.params().forward {
            let combined: Vec<u64> = set_a
                .projection(mp)
                .iter()
                .zip(set_b.projection(mp))
                .map(|(x, y)| x ^ y)
                .collect();
            prop_assert_eq!(combined.as_slice(), set_mixed.projection(mp));
        }
    }

    /// Property: runs cover the range in order without gaps.
    #[test]
    fn prop_runs_cover_range(
        bits in prop::collection::vec(0u64..4, 0..64),
    ) {
        let bitmaps: Vec<DistributionBitmap> =
            bits.into_iter().map(DistributionBitmap::from_bits).collect();
        let split = runs(&bitmaps);

        let mut next = 0;
        for (i, run) in split.iter().enumerate() {
            prop_assert_eq!(run.start, next);
            prop_assert!(run.len > 0);
            for bitmap in &bitmaps[run.start..run.start + run.len] {
                prop_assert_eq!(*bitmap, run.bitmap);
            }
            if i > 0 {
                prop_assert_ne!(split[i - 1].bitmap, run.bitmap);
            }
            next += run.len;
        }
        prop_assert_eq!(next, bitmaps.len());
    }
}
