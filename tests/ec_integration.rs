//! EC Integration Tests
//!
//! End-to-end tests for the Mojette codec through the public API.

use std::sync::Arc;

use mojettestor::ec::{DistributionBitmap, Layout, LayoutParams, MojetteCodec, BLOCK_SIZE};
use mojettestor::Error;

fn codec(layout: Layout) -> MojetteCodec {
    MojetteCodec::new(Arc::new(
        LayoutParams::new(layout).expect("Failed to build layout"),
    ))
}

fn random_block(seed: u64, nblocks: usize) -> Vec<u8> {
    let mut state = seed | 1;
    (0..nblocks * BLOCK_SIZE)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 32) as u8
        })
        .collect()
}

// =============================================================================
// Encode/Decode Integration Tests
// =============================================================================

#[test]
fn test_encode_decode_full_pipeline() {
    let codec = codec(Layout::Layout1);
    let data = random_block(42, 2);

    let mut set = codec.projection_set(2);
    codec.forward(&data, &mut set).expect("Failed to encode");
    assert_eq!(set.len(), 6);

    let mut out = vec![0u8; data.len()];
    codec
        .inverse(&mut set, &[0, 1, 2, 3], &mut out)
        .expect("Failed to decode");
    assert_eq!(out, data);
}

#[test]
fn test_decode_from_parity_only_fragments() {
    // 0xAB block, layout 0: the two outer projections rebuild it
    let codec = codec(Layout::Layout0);
    let data = vec![0xABu8; BLOCK_SIZE];

    let mut set = codec.projection_set(1);
    codec.forward(&data, &mut set).expect("Failed to encode");

    let mut out = vec![0u8; BLOCK_SIZE];
    codec
        .inverse(&mut set, &[2, 0], &mut out)
        .expect("Failed to decode");
    assert_eq!(out, data);
}

#[test]
fn test_decode_over_the_wire() {
    let codec = codec(Layout::Layout2);
    let data = random_block(7, 1);

    let mut sender = codec.projection_set(1);
    codec.forward(&data, &mut sender).expect("Failed to encode");

    // lose the four middle fragments
    let survivors = [0usize, 1, 2, 3, 8, 9, 10, 11];
    let mut receiver = codec.projection_set(1);
    receiver.reset(1).expect("Failed to reset");
    for &mp in &survivors {
        let wire = sender.to_bytes(mp);
        assert_eq!(wire.len(), codec.params().projection_bytes(mp, 1));
        receiver.load_bytes(mp, &wire).expect("Failed to load fragment");
    }

    let mut out = vec![0u8; BLOCK_SIZE];
    codec
        .inverse(&mut receiver, &survivors, &mut out)
        .expect("Failed to decode");
    assert_eq!(out, data);
}

#[test]
fn test_too_few_fragments_rejected() {
    let codec = codec(Layout::Layout0);
    let mut set = codec.projection_set(1);
    codec
        .forward(&vec![1u8; BLOCK_SIZE], &mut set)
        .expect("Failed to encode");

    let mut out = vec![0u8; BLOCK_SIZE];
    let result = codec.inverse(&mut set, &[1], &mut out);
    assert!(matches!(result, Err(Error::MalformedProjection(_))));
}

// =============================================================================
// Geometry Tests
// =============================================================================

#[test]
fn test_fragment_sizes_match_formula() {
    for layout in Layout::ALL {
        let params = LayoutParams::new(layout).expect("Failed to build layout");
        for (mp, angle) in params.angles.iter().enumerate() {
            let expected = angle.p.unsigned_abs() * (params.inverse - 1) + params.cols();
            assert_eq!(params.sizes[mp], expected, "{} mp {}", layout, mp);
        }
    }
}

#[test]
fn test_slot_mapping_for_degraded_write() {
    // slot 0 was down when the block was written
    let bitmap = DistributionBitmap::from_bits(0b1110);
    let pairs: Vec<(usize, usize)> = bitmap.fragment_slots().collect();
    assert_eq!(pairs, vec![(0, 1), (1, 2), (2, 3)]);
}
