//! Distribution Bitmap
//!
//! Per-block record of which storage slots of a file's placement hold a
//! valid projection. Slot `i` set means the storage at placement index `i`
//! holds a fragment for the block; an empty bitmap is a sparse block.
//!
//! The slot to fragment mapping is implicit: scanning slots low to high, the
//! `n`-th set slot holds fragment index `n`. Readers and writers both derive
//! it from the bitmap alone.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Bit vector over the storage slots of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistributionBitmap(u64);

impl DistributionBitmap {
    /// Largest slot count a bitmap can describe
    pub const MAX_SLOTS: usize = u64::BITS as usize;

    /// Bitmap with no slot set (sparse block)
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> u64 {
        self.0
    }

    /// Whether slot `slot` holds a fragment
    pub fn is_set(&self, slot: usize) -> bool {
        slot < Self::MAX_SLOTS && self.0 & (1 << slot) != 0
    }

    /// Set or clear slot `slot`; slots past [`Self::MAX_SLOTS`] are ignored
    pub fn set(&mut self, slot: usize, value: bool) {
        if slot >= Self::MAX_SLOTS {
            return;
        }
        if value {
            self.0 |= 1 << slot;
        } else {
            self.0 &= !(1 << slot);
        }
    }

    /// All slots clear: the block is unallocated and reads as zeros
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Number of slots holding a fragment
    pub fn count(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Set slots in increasing order
    pub fn set_slots(&self) -> impl Iterator<Item = usize> {
        let bits = self.0;
        (0..Self::MAX_SLOTS).filter(move |slot| bits & (1 << slot) != 0)
    }

    /// `(fragment index, slot)` pairs in scan order
    pub fn fragment_slots(&self) -> impl Iterator<Item = (usize, usize)> {
        self.set_slots().enumerate()
    }

    /// Slot holding fragment `mp`
    pub fn slot_of_fragment(&self, mp: usize) -> Option<usize> {
        self.set_slots().nth(mp)
    }

    /// Fragment index stored at `slot`, if the slot is set
    pub fn fragment_at_slot(&self, slot: usize) -> Option<usize> {
        if !self.is_set(slot) {
            return None;
        }
        let below = self.0 & ((1u64 << slot) - 1);
        Some(below.count_ones() as usize)
    }
}

impl fmt::Display for DistributionBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

// =============================================================================
// Runs
// =============================================================================

/// Maximal sequence of consecutive blocks sharing one bitmap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Index of the first block, relative to the start of the range
    pub start: usize,
    /// Number of blocks
    pub len: usize,
    pub bitmap: DistributionBitmap,
}

/// Split a block range into runs of identical bitmaps, in order
pub fn runs(bitmaps: &[DistributionBitmap]) -> Vec<Run> {
    let mut out: Vec<Run> = Vec::new();
    for (i, bitmap) in bitmaps.iter().enumerate() {
        match out.last_mut() {
            Some(run) if run.bitmap == *bitmap => run.len += 1,
            _ => out.push(Run {
                start: i,
                len: 1,
                bitmap: *bitmap,
            }),
        }
    }
    out
}

// =============================================================================
// Tests
// =============================================================================
