//! Layout Registry
//!
//! Derives the Mojette coding parameters from a layout preset: how many
//! storage slots a file reserves, how many projections are written per block
//! and how many are needed to rebuild it, plus the per-projection angle and
//! bin count.
//!
//! The resulting [`LayoutParams`] is built once at startup and shared by
//! reference (`Arc`) with the transform engine and the orchestrator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Size of a file block in bytes
pub const BLOCK_SIZE: usize = 8192;

/// Size of one transform element (bin) in bytes
pub const ELEMENT_SIZE: usize = std::mem::size_of::<u64>();

/// Number of elements in a block
pub const BLOCK_ELEMENTS: usize = BLOCK_SIZE / ELEMENT_SIZE;

// =============================================================================
// Layout Choice
// =============================================================================

/// Closed set of layout presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum Layout {
    /// 2 of 3 projections, 4 slots
    #[default]
    Layout0,
    /// 4 of 6 projections, 8 slots
    Layout1,
    /// 8 of 12 projections, 16 slots
    Layout2,
}

impl Layout {
    /// All presets
    pub const ALL: [Layout; 3] = [Layout::Layout0, Layout::Layout1, Layout::Layout2];

    /// `(inverse, forward, safe)` of the preset
    pub fn counts(self) -> (usize, usize, usize) {
        match self {
            Layout::Layout0 => (2, 3, 4),
            Layout::Layout1 => (4, 6, 8),
            Layout::Layout2 => (8, 12, 16),
        }
    }
}

impl TryFrom<u8> for Layout {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Layout::Layout0),
            1 => Ok(Layout::Layout1),
            2 => Ok(Layout::Layout2),
            other => Err(Error::InvalidLayout(format!("unknown layout {}", other))),
        }
    }
}

impl From<Layout> for u8 {
    fn from(layout: Layout) -> u8 {
        match layout {
            Layout::Layout0 => 0,
            Layout::Layout1 => 1,
            Layout::Layout2 => 2,
        }
    }
}

impl FromStr for Layout {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| Error::InvalidLayout(format!("not a layout number: {:?}", s)))?;
        Layout::try_from(value)
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "layout{}", u8::from(*self))
    }
}

// =============================================================================
// Angle
// =============================================================================

/// Discrete projection direction `(p, q)`
///
/// Only `q = 1` directions are produced by the presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Angle {
    pub p: isize,
    pub q: isize,
}

impl Angle {
    pub fn new(p: isize) -> Self {
        Self { p, q: 1 }
    }

    /// Bin shift keeping every addressed bin index non-negative
    pub fn offset(&self, rows: usize) -> isize {
        if self.p < 0 {
            (rows as isize - 1) * self.p
        } else {
            0
        }
    }
}

// =============================================================================
// Layout Parameters
// =============================================================================

/// Coding parameters derived from a [`Layout`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayoutParams {
    pub layout: Layout,
    /// Storage slots reserved per file
    pub safe: usize,
    /// Projections written per block
    pub forward: usize,
    /// Projections needed to rebuild a block (also the block's row count)
    pub inverse: usize,
    /// Projection angle per fragment index
    pub angles: Vec<Angle>,
    /// Projection bin count per fragment index, for one block
    pub sizes: Vec<usize>,
}

impl LayoutParams {
    /// Build the parameter tables for a preset
    pub fn new(layout: Layout) -> Result<Self> {
        let (inverse, forward, safe) = layout.counts();
        if !(inverse < forward && forward <= safe) {
            return Err(Error::InvalidLayout(format!(
                "{}: expected inverse < forward <= safe, got {}/{}/{}",
                layout, inverse, forward, safe
            )));
        }
        if BLOCK_ELEMENTS % inverse != 0 {
            return Err(Error::InvalidLayout(format!(
                "{}: {} elements cannot be split into {} rows",
                layout, BLOCK_ELEMENTS, inverse
            )));
        }

        let cols = BLOCK_ELEMENTS / inverse;
        let half = (forward / 2) as isize;
        let angles: Vec<Angle> = (0..forward as isize).map(|mp| Angle::new(mp - half)).collect();
        let sizes = angles
            .iter()
            .map(|a| a.p.unsigned_abs() * (inverse - 1) + (cols - 1) + 1)
            .collect();

        Ok(Self {
            layout,
            safe,
            forward,
            inverse,
            angles,
            sizes,
        })
    }

    /// Build the parameter tables from a raw layout number
    pub fn from_choice(choice: u8) -> Result<Self> {
        Self::new(Layout::try_from(choice)?)
    }

    /// Rows of the block matrix
    pub fn rows(&self) -> usize {
        self.inverse
    }

    /// Columns of the block matrix
    pub fn cols(&self) -> usize {
        BLOCK_ELEMENTS / self.inverse
    }

    /// Bin count of projection `mp` for a run of `nblocks` blocks
    pub fn projection_bins(&self, mp: usize, nblocks: usize) -> usize {
        self.sizes[mp] * nblocks
    }

    /// Byte length of projection `mp` for a run of `nblocks` blocks
    pub fn projection_bytes(&self, mp: usize, nblocks: usize) -> usize {
        self.projection_bins(mp, nblocks) * ELEMENT_SIZE
    }

    /// Bytes stored across all projections per block over the raw block size
    pub fn storage_overhead(&self) -> f64 {
        let stored: usize = self.sizes.iter().map(|s| s * ELEMENT_SIZE).sum();
        stored as f64 / BLOCK_SIZE as f64
    }
}

// =============================================================================
// Tests
// =============================================================================
