//! Mojette Transform Engine
//!
//! Forward and inverse discrete Mojette transform over one run of blocks.
//!
//! A block is viewed as a `rows x cols` matrix of `u64` pixels (row-major,
//! little-endian on the byte boundary). Projection `mp` with angle `(p, 1)`
//! XOR-accumulates pixel `(l, k)` into bin `l * p - offset + k`, where the
//! offset keeps bin indices non-negative for negative slopes.
//!
//! The inverse takes exactly `rows` projections with distinct slopes and
//! rebuilds the block column by column. Projections are sorted by slope
//! descending so that projection `i` resolves row `i`; each row lags the
//! rendez-vous row by a column offset chosen so that, when a pixel is read
//! from its bin, every other pixel on the same line has already been
//! resolved and XORed out of that bin.

use std::cmp::max;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use super::layout::{LayoutParams, BLOCK_ELEMENTS, BLOCK_SIZE, ELEMENT_SIZE};
use crate::error::{Error, Result};

// =============================================================================
// Projection Set
// =============================================================================

/// Reusable projection buffers for one layout
///
/// Holds one bin buffer per fragment index, pre-sized for `max_blocks`
/// blocks, plus a pixel scratch buffer. Only the first `nblocks` blocks of
/// each buffer are active after [`ProjectionSet::reset`]. The default set
/// holds no buffers.
#[derive(Debug, Clone, Default)]
pub struct ProjectionSet {
    bins: Vec<Vec<u64>>,
    sizes: Vec<usize>,
    pixels: Vec<u64>,
    max_blocks: usize,
    nblocks: usize,
}

impl ProjectionSet {
    /// Allocate buffers for runs of up to `max_blocks` blocks
    pub fn new(params: &LayoutParams, max_blocks: usize) -> Self {
        let max_blocks = max_blocks.max(1);
        Self {
            bins: params
                .sizes
                .iter()
                .map(|size| vec![0u64; size * max_blocks])
                .collect(),
            sizes: params.sizes.clone(),
            pixels: vec![0u64; BLOCK_ELEMENTS],
            max_blocks,
            nblocks: 0,
        }
    }

    /// Largest run the buffers can hold
    pub fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// Blocks in the active run
    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    /// Number of projections held
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    /// Start a new run of `nblocks` blocks, zeroing the active bins
    pub fn reset(&mut self, nblocks: usize) -> Result<()> {
        if nblocks == 0 || nblocks > self.max_blocks {
            return Err(Error::MalformedProjection(format!(
                "run of {} blocks does not fit buffers of {} blocks",
                nblocks, self.max_blocks
            )));
        }
        self.nblocks = nblocks;
        for (bins, size) in self.bins.iter_mut().zip(&self.sizes) {
            bins[..size * nblocks].fill(0);
        }
        Ok(())
    }

    /// Active bins of projection `mp`
    pub fn projection(&self, mp: usize) -> &[u64] {
        &self.bins[mp][..self.sizes[mp] * self.nblocks]
    }

    /// Little-endian wire image of projection `mp`
    pub fn to_bytes(&self, mp: usize) -> Bytes {
        let bins = self.projection(mp);
        let mut buf = BytesMut::with_capacity(bins.len() * ELEMENT_SIZE);
        for bin in bins {
            buf.put_u64_le(*bin);
        }
        buf.freeze()
    }

    /// Load projection `mp` of the active run from its wire image
    pub fn load_bytes(&mut self, mp: usize, bytes: &[u8]) -> Result<()> {
        let expected = self.sizes[mp] * self.nblocks;
        if bytes.len() != expected * ELEMENT_SIZE {
            return Err(Error::MalformedProjection(format!(
                "projection {} carries {} bytes, expected {}",
                mp,
                bytes.len(),
                expected * ELEMENT_SIZE
            )));
        }
        for (bin, chunk) in self.bins[mp][..expected]
            .iter_mut()
            .zip(bytes.chunks_exact(ELEMENT_SIZE))
        {
            *bin = load_element(chunk);
        }
        Ok(())
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Mojette codec bound to one layout
#[derive(Debug, Clone)]
pub struct MojetteCodec {
    params: Arc<LayoutParams>,
}

impl MojetteCodec {
    pub fn new(params: Arc<LayoutParams>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LayoutParams {
        &self.params
    }

    /// Allocate a projection set matching this codec's layout
    pub fn projection_set(&self, max_blocks: usize) -> ProjectionSet {
        ProjectionSet::new(&self.params, max_blocks)
    }

    /// Encode a run of whole blocks into all `forward` projections
    pub fn forward(&self, data: &[u8], set: &mut ProjectionSet) -> Result<()> {
        let nblocks = self.run_blocks(data.len())?;
        self.check_set(set)?;
        set.reset(nblocks)?;

        let rows = self.params.rows();
        let cols = self.params.cols();

        for (b, block) in data.chunks_exact(BLOCK_SIZE).enumerate() {
            for (pixel, chunk) in set.pixels.iter_mut().zip(block.chunks_exact(ELEMENT_SIZE)) {
                *pixel = load_element(chunk);
            }

            for (mp, angle) in self.params.angles.iter().enumerate() {
                let size = set.sizes[mp];
                let offset = angle.offset(rows);
                let bins = &mut set.bins[mp][b * size..(b + 1) * size];

                for l in 0..rows {
                    let base = (l as isize * angle.p - offset) as usize;
                    let row = &set.pixels[l * cols..(l + 1) * cols];
                    for (bin, pixel) in bins[base..base + cols].iter_mut().zip(row) {
                        *bin ^= *pixel;
                    }
                }
            }
        }

        Ok(())
    }

    /// Rebuild the active run from the projections named by `indices`
    ///
    /// The selected projections are consumed: their bins are cleared as
    /// pixels are resolved.
    pub fn inverse(&self, set: &mut ProjectionSet, indices: &[usize], out: &mut [u8]) -> Result<()> {
        self.inverse_at(set, indices, out, self.reconstruction_row())
    }

    /// Row where the two sweep directions meet
    ///
    /// Pinned to the last row; the sweep itself is valid for any row.
    pub fn reconstruction_row(&self) -> usize {
        self.params.rows() - 1
    }

    pub(crate) fn inverse_at(
        &self,
        set: &mut ProjectionSet,
        indices: &[usize],
        out: &mut [u8],
        rdv: usize,
    ) -> Result<()> {
        let rows = self.params.rows();
        let cols = self.params.cols();
        self.check_set(set)?;

        if indices.len() != rows {
            return Err(Error::MalformedProjection(format!(
                "inverse needs exactly {} projections, got {}",
                rows,
                indices.len()
            )));
        }
        if let Some(mp) = indices.iter().find(|mp| **mp >= self.params.forward) {
            return Err(Error::MalformedProjection(format!(
                "projection index {} out of range",
                mp
            )));
        }
        if set.nblocks == 0 || out.len() != set.nblocks * BLOCK_SIZE {
            return Err(Error::MalformedProjection(format!(
                "output of {} bytes does not match a run of {} blocks",
                out.len(),
                set.nblocks
            )));
        }
        if rdv >= rows {
            return Err(Error::MalformedProjection(format!(
                "rendez-vous row {} outside {} rows",
                rdv, rows
            )));
        }

        let mut order = indices.to_vec();
        order.sort_by(|a, b| self.params.angles[*b].p.cmp(&self.params.angles[*a].p));
        let slopes: Vec<isize> = order.iter().map(|mp| self.params.angles[*mp].p).collect();
        if slopes.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::MalformedProjection(format!(
                "projections {:?} do not have distinct slopes",
                indices
            )));
        }

        trace!(
            slopes = ?slopes,
            imbalance = slope_imbalance(&slopes),
            rdv,
            nblocks = set.nblocks,
            "inverse transform"
        );

        let k_offsets = column_offsets(&slopes, rdv);
        let nblocks = set.nblocks;

        let mut buffers: Vec<Option<&mut Vec<u64>>> = set.bins.iter_mut().map(Some).collect();
        let mut lines = Vec::with_capacity(rows);
        for (&mp, &p) in order.iter().zip(&slopes) {
            let bins = buffers[mp].take().ok_or_else(|| {
                Error::MalformedProjection(format!("projection {} selected twice", mp))
            })?;
            lines.push(Line {
                p,
                offset: self.params.angles[mp].offset(rows),
                size: set.sizes[mp],
                bins: bins.as_mut_slice(),
            });
        }

        for (b, block) in out.chunks_exact_mut(BLOCK_SIZE).enumerate().take(nblocks) {
            let mut sweep = Sweep {
                lines: lines.as_mut_slice(),
                block: b,
                cols,
                k_offsets: k_offsets.as_slice(),
                rdv,
                out: block,
            };
            sweep.run();
        }

        Ok(())
    }

    fn run_blocks(&self, len: usize) -> Result<usize> {
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(Error::MalformedProjection(format!(
                "run of {} bytes is not a whole number of {}-byte blocks",
                len, BLOCK_SIZE
            )));
        }
        Ok(len / BLOCK_SIZE)
    }

    fn check_set(&self, set: &ProjectionSet) -> Result<()> {
        if set.sizes != self.params.sizes {
            return Err(Error::MalformedProjection(
                "projection set was built for another layout".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Inverse Sweep
// =============================================================================

/// One selected projection during the inverse, in slope order
struct Line<'a> {
    p: isize,
    offset: isize,
    size: usize,
    bins: &'a mut [u64],
}

impl Line<'_> {
    #[inline]
    fn bin(&self, block: usize, l: usize, k: usize) -> usize {
        block * self.size + (l as isize * self.p - self.offset) as usize + k
    }
}

struct Sweep<'s, 'a> {
    lines: &'s mut [Line<'a>],
    block: usize,
    cols: usize,
    k_offsets: &'s [isize],
    rdv: usize,
    out: &'s mut [u8],
}

impl Sweep<'_, '_> {
    fn run(&mut self) {
        let cols = self.cols as isize;
        let first = self.k_offsets.iter().map(|ko| -ko).min().unwrap_or(0);
        let last = self.k_offsets.iter().map(|ko| cols - 1 - ko).max().unwrap_or(-1);
        let common_lo = self.k_offsets.iter().map(|ko| -ko).max().unwrap_or(0);
        let common_hi = self.k_offsets.iter().map(|ko| cols - 1 - ko).min().unwrap_or(-1);

        if common_lo <= common_hi {
            // ramp-up, common window, ramp-down
            for c in first..common_lo {
                self.column(c, true);
            }
            for c in common_lo..=common_hi {
                self.column(c, false);
            }
            for c in common_hi + 1..=last {
                self.column(c, true);
            }
        } else {
            for c in first..=last {
                self.column(c, true);
            }
        }
    }

    fn column(&mut self, c: isize, checked: bool) {
        let rows = self.lines.len();
        for l in 0..self.rdv {
            self.pixel(l, c + self.k_offsets[l], checked);
        }
        for l in (self.rdv..rows).rev() {
            self.pixel(l, c + self.k_offsets[l], checked);
        }
    }

    #[inline]
    fn pixel(&mut self, l: usize, k: isize, checked: bool) {
        if checked && (k < 0 || k >= self.cols as isize) {
            return;
        }
        let k = k as usize;

        let value = {
            let line = &self.lines[l];
            line.bins[line.bin(self.block, l, k)]
        };
        store_element(self.out, l * self.cols + k, value);

        if value != 0 {
            let block = self.block;
            for line in self.lines.iter_mut() {
                let idx = line.bin(block, l, k);
                line.bins[idx] ^= value;
            }
        }
    }
}

/// Per-row column offset relative to the sweep position
///
/// `slopes` must be sorted descending. Row `l` resolves column `c + k[l]`
/// at sweep position `c`.
fn column_offsets(slopes: &[isize], rdv: usize) -> Vec<isize> {
    let rows = slopes.len();
    let mut k_offsets = vec![0isize; rows];
    for i in (0..rdv).rev() {
        k_offsets[i] = k_offsets[i + 1] + slopes[i + 1];
    }
    for i in rdv + 1..rows {
        k_offsets[i] = k_offsets[i - 1] - slopes[i - 1];
    }
    k_offsets
}

/// Negative minus positive slope mass over the interior rows
pub fn slope_imbalance(slopes: &[isize]) -> isize {
    let interior = slopes.len().saturating_sub(1);
    let (s_minus, s_plus) = slopes
        .iter()
        .take(interior)
        .skip(1)
        .fold((0isize, 0isize), |(minus, plus), p| {
            (minus + max(0, -p), plus + max(0, *p))
        });
    s_minus - s_plus
}

#[inline]
fn load_element(chunk: &[u8]) -> u64 {
    let mut raw = [0u8; ELEMENT_SIZE];
    raw.copy_from_slice(&chunk[..ELEMENT_SIZE]);
    u64::from_le_bytes(raw)
}

#[inline]
fn store_element(out: &mut [u8], index: usize, value: u64) {
    let start = index * ELEMENT_SIZE;
    out[start..start + ELEMENT_SIZE].copy_from_slice(&value.to_le_bytes());
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ec::layout::Layout;
    use assert_matches::assert_matches;

    fn codec(layout: Layout) -> MojetteCodec {
        MojetteCodec::new(Arc::new(LayoutParams::new(layout).unwrap()))
    }

    /// xorshift64 pattern, good enough to exercise every bit position
    fn pattern(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
        fn walk(start: usize, n: usize, k: usize, cur: &mut Vec<usize>, out: &mut Vec<Vec<usize>>) {
            if cur.len() == k {
                out.push(cur.clone());
                return;
            }
            for i in start..n {
                cur.push(i);
                walk(i + 1, n, k, cur, out);
                cur.pop();
            }
        }
        let mut out = Vec::new();
        walk(0, n, k, &mut Vec::new(), &mut out);
        out
    }

    fn decode(codec: &MojetteCodec, encoded: &ProjectionSet, subset: &[usize]) -> Vec<u8> {
        let mut set = encoded.clone();
        let mut out = vec![0u8; encoded.nblocks() * BLOCK_SIZE];
        codec.inverse(&mut set, subset, &mut out).unwrap();
        out
    }

    #[test]
    fn test_forward_known_projections() {
        let codec = codec(Layout::Layout0);
        let mut block = vec![0u8; BLOCK_SIZE];
        // row 0 = 1, row 1 = 2
        for (i, chunk) in block.chunks_exact_mut(ELEMENT_SIZE).enumerate() {
            let v: u64 = if i < 512 { 1 } else { 2 };
            chunk.copy_from_slice(&v.to_le_bytes());
        }

        let mut set = codec.projection_set(1);
        codec.forward(&block, &mut set).unwrap();

        // p = -1
        let neg = set.projection(0);
        assert_eq!(neg.len(), 513);
        assert_eq!(neg[0], 2);
        assert!(neg[1..512].iter().all(|b| *b == 3));
        assert_eq!(neg[512], 1);

        // p = 0
        assert!(set.projection(1).iter().all(|b| *b == 3));

        // p = 1
        let pos = set.projection(2);
        assert_eq!(pos[0], 1);
        assert!(pos[1..512].iter().all(|b| *b == 3));
        assert_eq!(pos[512], 2);
    }

    #[test]
    fn test_zero_block_gives_zero_projections() {
        let codec = codec(Layout::Layout1);
        let mut set = codec.projection_set(2);
        codec.forward(&vec![0u8; 2 * BLOCK_SIZE], &mut set).unwrap();
        for mp in 0..set.len() {
            assert!(set.projection(mp).iter().all(|b| *b == 0));
        }
    }

    #[test]
    fn test_roundtrip_every_subset() {
        for layout in Layout::ALL {
            let codec = codec(layout);
            let data = pattern(BLOCK_SIZE, 0x5eed + u8::from(layout) as u64);
            let mut encoded = codec.projection_set(1);
            codec.forward(&data, &mut encoded).unwrap();

            let params = codec.params();
            for subset in combinations(params.forward, params.inverse) {
                assert_eq!(
                    decode(&codec, &encoded, &subset),
                    data,
                    "{} subset {:?}",
                    layout,
                    subset
                );
            }
        }
    }

    #[test]
    fn test_roundtrip_multi_block_run() {
        let codec = codec(Layout::Layout1);
        let data = pattern(5 * BLOCK_SIZE, 42);
        let mut encoded = codec.projection_set(8);
        codec.forward(&data, &mut encoded).unwrap();
        assert_eq!(encoded.nblocks(), 5);
        assert_eq!(encoded.projection(0).len(), codec.params().sizes[0] * 5);

        assert_eq!(decode(&codec, &encoded, &[5, 0, 3, 1]), data);
    }

    #[test]
    fn test_any_rendezvous_row_decodes() {
        for layout in [Layout::Layout1, Layout::Layout2] {
            let codec = codec(layout);
            let params = codec.params().clone();
            let data = pattern(BLOCK_SIZE, 7);
            let mut encoded = codec.projection_set(1);
            codec.forward(&data, &mut encoded).unwrap();

            let subset: Vec<usize> = (params.forward - params.inverse..params.forward).collect();
            for rdv in 0..params.rows() {
                let mut set = encoded.clone();
                let mut out = vec![0u8; BLOCK_SIZE];
                codec.inverse_at(&mut set, &subset, &mut out, rdv).unwrap();
                assert_eq!(out, data, "{} rdv {}", layout, rdv);
            }
        }
    }

    #[test]
    fn test_wire_image_roundtrip() {
        let codec = codec(Layout::Layout0);
        let data = pattern(2 * BLOCK_SIZE, 99);
        let mut encoded = codec.projection_set(2);
        codec.forward(&data, &mut encoded).unwrap();

        let wire: Vec<Bytes> = (0..3).map(|mp| encoded.to_bytes(mp)).collect();
        assert_eq!(wire[1].len(), 512 * 2 * ELEMENT_SIZE);

        let mut received = codec.projection_set(2);
        received.reset(2).unwrap();
        received.load_bytes(0, &wire[0]).unwrap();
        received.load_bytes(2, &wire[2]).unwrap();

        let mut out = vec![0u8; 2 * BLOCK_SIZE];
        codec.inverse(&mut received, &[2, 0], &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_forward_rejects_partial_blocks() {
        let codec = codec(Layout::Layout0);
        let mut set = codec.projection_set(1);
        assert_matches!(
            codec.forward(&[0u8; 100], &mut set),
            Err(Error::MalformedProjection(_))
        );
        assert_matches!(
            codec.forward(&[], &mut set),
            Err(Error::MalformedProjection(_))
        );
        // two blocks into a one-block set
        assert_matches!(
            codec.forward(&vec![0u8; 2 * BLOCK_SIZE], &mut set),
            Err(Error::MalformedProjection(_))
        );
    }

    #[test]
    fn test_inverse_rejects_bad_selection() {
        let codec = codec(Layout::Layout0);
        let mut set = codec.projection_set(1);
        codec.forward(&pattern(BLOCK_SIZE, 1), &mut set).unwrap();
        let mut out = vec![0u8; BLOCK_SIZE];

        assert_matches!(
            codec.inverse(&mut set.clone(), &[0], &mut out),
            Err(Error::MalformedProjection(_))
        );
        assert_matches!(
            codec.inverse(&mut set.clone(), &[0, 3], &mut out),
            Err(Error::MalformedProjection(_))
        );
        assert_matches!(
            codec.inverse(&mut set.clone(), &[1, 1], &mut out),
            Err(Error::MalformedProjection(_))
        );
        assert_matches!(
            codec.inverse(&mut set.clone(), &[0, 1], &mut out[..100]),
            Err(Error::MalformedProjection(_))
        );
    }

    #[test]
    fn test_load_bytes_length_check() {
        let codec = codec(Layout::Layout0);
        let mut set = codec.projection_set(1);
        set.reset(1).unwrap();
        assert_matches!(
            set.load_bytes(0, &[0u8; 16]),
            Err(Error::MalformedProjection(_))
        );
    }

    #[test]
    fn test_set_from_other_layout_rejected() {
        let codec0 = codec(Layout::Layout0);
        let codec1 = codec(Layout::Layout1);
        let mut set = codec1.projection_set(1);
        assert_matches!(
            codec0.forward(&vec![0u8; BLOCK_SIZE], &mut set),
            Err(Error::MalformedProjection(_))
        );
    }

    #[test]
    fn test_column_offsets() {
        // slopes sorted descending
        assert_eq!(column_offsets(&[1, -1], 1), vec![-1, 0]);
        assert_eq!(column_offsets(&[1, 0], 1), vec![0, 0]);
        assert_eq!(column_offsets(&[2, 1, 0, -1], 3), vec![0, -1, -1, 0]);
        assert_eq!(column_offsets(&[2, 1, 0, -1], 0), vec![0, -2, -3, -3]);
    }

    #[test]
    fn test_slope_imbalance() {
        assert_eq!(slope_imbalance(&[1, -1]), 0);
        // interior rows are -1 and 0 for these slopes
        assert_eq!(slope_imbalance(&[2, -1, 0, -3]), 1);
        assert_eq!(slope_imbalance(&[3, 2, 1, 0]), -3);
    }
}
