//! Block I/O Orchestrator
//!
//! Drives the Mojette codec over the storage targets of a file.
//!
//! Writes encode a run of blocks into `forward` fragments and hand them out
//! to the file's slots in increasing slot order, skipping slots whose
//! connection is down. Fragment `n` always lands on the `n`-th slot that
//! accepted one, so the per-block distribution bitmap alone tells readers
//! where each fragment lives.
//!
//! Reads split the requested range into runs of identical bitmaps, serve
//! empty-bitmap runs as zeros without touching the network, and decode the
//! others from the first `inverse` fragments that come back.
//!
//! Both paths reconnect and retry a bounded number of times before giving up
//! with [`Error::InsufficientFragments`].

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tracing::{debug, instrument, trace, warn};

use crate::config::ClientConfig;
use crate::domain::ports::{
    ConnectionPool, FileAttributes, FileId, FilePlacement, MetadataService, StorageRef,
};
use crate::ec::{runs, DistributionBitmap, LayoutParams, MojetteCodec, ProjectionSet, BLOCK_SIZE};
use crate::error::{Error, Result};
use crate::metrics::{self, OUTCOME_ERROR, OUTCOME_OK, OUTCOME_SKIPPED};

const BLOCK: u64 = BLOCK_SIZE as u64;

/// Projection sets kept for reuse once returned
const SCRATCH_RETAINED: usize = 4;

// =============================================================================
// Scratch Buffers
// =============================================================================

/// Pool of pre-sized projection sets for one layout
struct ScratchPool {
    codec: MojetteCodec,
    max_blocks: usize,
    free: Mutex<Vec<ProjectionSet>>,
}

impl ScratchPool {
    fn new(codec: MojetteCodec, max_blocks: usize) -> Self {
        Self {
            codec,
            max_blocks,
            free: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Scratch<'_> {
        let set = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| self.codec.projection_set(self.max_blocks));
        Scratch { pool: self, set }
    }
}

/// Borrowed projection set, handed back to the pool on drop
struct Scratch<'a> {
    pool: &'a ScratchPool,
    set: ProjectionSet,
}

impl Deref for Scratch<'_> {
    type Target = ProjectionSet;

    fn deref(&self) -> &ProjectionSet {
        &self.set
    }
}

impl DerefMut for Scratch<'_> {
    fn deref_mut(&mut self) -> &mut ProjectionSet {
        &mut self.set
    }
}

impl Drop for Scratch<'_> {
    fn drop(&mut self) {
        let mut free = self.pool.free.lock();
        if free.len() < SCRATCH_RETAINED {
            free.push(std::mem::take(&mut self.set));
        }
    }
}

/// End offset of a write of `len` bytes at `offset`
///
/// The block holding the last byte must itself end within `u64`.
pub(crate) fn write_end(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(len as u64)
        .filter(|end| end.div_ceil(BLOCK) <= u64::MAX / BLOCK)
        .ok_or_else(|| {
            Error::InvalidRange(format!("{} bytes at offset {} overflow", len, offset))
        })
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Run-level read and write of file blocks
pub struct BlockIo {
    codec: MojetteCodec,
    scratch: ScratchPool,
    metadata: Arc<dyn MetadataService>,
    pool: Arc<dyn ConnectionPool>,
    config: ClientConfig,
}

impl BlockIo {
    pub fn new(
        params: Arc<LayoutParams>,
        metadata: Arc<dyn MetadataService>,
        pool: Arc<dyn ConnectionPool>,
        config: ClientConfig,
    ) -> Self {
        let codec = MojetteCodec::new(params);
        let max_blocks = config.max_blocks_per_request.max(1);
        Self {
            scratch: ScratchPool::new(codec.clone(), max_blocks),
            codec,
            metadata,
            pool,
            config,
        }
    }

    pub fn params(&self) -> &LayoutParams {
        self.codec.params()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataService> {
        &self.metadata
    }

    /// Connect to every target of a placement concurrently
    ///
    /// Best effort; returns how many targets are reachable.
    pub async fn warm_up(&self, placement: &FilePlacement) -> usize {
        let results = join_all(
            placement
                .targets
                .iter()
                .map(|target| self.pool.get_or_connect(&target.host)),
        )
        .await;

        let reachable = results.iter().filter(|r| r.is_ok()).count();
        if reachable < placement.targets.len() {
            warn!(
                cluster = %placement.cluster,
                reachable,
                targets = placement.targets.len(),
                "some storage targets are unreachable"
            );
        }
        reachable
    }

    // =========================================================================
    // Byte Ranges
    // =========================================================================

    /// Read up to `len` bytes at `offset`, clamped at end of file
    #[instrument(skip(self, attrs), fields(fid = %attrs.fid))]
    pub async fn read(&self, attrs: &FileAttributes, offset: u64, len: usize) -> Result<Vec<u8>> {
        if len == 0 || offset >= attrs.size {
            return Ok(Vec::new());
        }
        let end = attrs.size.min(offset.saturating_add(len as u64));
        let first_block = offset / BLOCK;
        let nblocks = ((end - 1) / BLOCK - first_block + 1) as usize;

        let mut data = self.read_blocks(attrs, first_block, nblocks).await?;
        let start = (offset - first_block * BLOCK) as usize;
        data.truncate(start + (end - offset) as usize);
        data.drain(..start);
        Ok(data)
    }

    /// Write `data` at `offset`, returning the new file size
    ///
    /// Partial edge blocks are read, merged and rewritten whole. The new size
    /// is persisted when the file grows.
    #[instrument(skip(self, attrs, data), fields(fid = %attrs.fid, len = data.len()))]
    pub async fn write(&self, attrs: &FileAttributes, offset: u64, data: &[u8]) -> Result<u64> {
        if data.is_empty() {
            return Ok(attrs.size);
        }
        let end = write_end(offset, data.len())?;
        let first_block = offset / BLOCK;
        let last_block = (end - 1) / BLOCK;
        let nblocks = (last_block - first_block + 1) as usize;
        let head = (offset % BLOCK) as usize;
        let tail = (end % BLOCK) as usize;

        let mut buf = vec![0u8; nblocks * BLOCK_SIZE];
        if head != 0 && first_block * BLOCK < attrs.size {
            let block = self.read_blocks(attrs, first_block, 1).await?;
            buf[..BLOCK_SIZE].copy_from_slice(&block);
        }
        let tail_covered = last_block == first_block && head != 0;
        if tail != 0 && !tail_covered && last_block * BLOCK < attrs.size {
            let block = self.read_blocks(attrs, last_block, 1).await?;
            buf[(nblocks - 1) * BLOCK_SIZE..].copy_from_slice(&block);
        }
        buf[head..head + data.len()].copy_from_slice(data);

        self.write_blocks(attrs, first_block, &buf).await?;

        if end > attrs.size {
            self.metadata.set_size(&attrs.fid, end).await?;
            Ok(end)
        } else {
            Ok(attrs.size)
        }
    }

    /// Shrink or extend a file to `size` bytes
    ///
    /// Shrinking zeroes the tail of a partial last block and asks every
    /// target to drop fragments past the end; target failures are logged.
    #[instrument(skip(self, attrs), fields(fid = %attrs.fid))]
    pub async fn truncate(&self, attrs: &FileAttributes, size: u64) -> Result<()> {
        if size < attrs.size {
            let tail = (size % BLOCK) as usize;
            if tail != 0 {
                let block = size / BLOCK;
                let bitmaps = self.metadata.get_distribution(&attrs.fid, block, 1).await?;
                if bitmaps.first().is_some_and(|b| !b.is_empty()) {
                    let mut data = self.read_blocks(attrs, block, 1).await?;
                    data[tail..].fill(0);
                    self.write_blocks(attrs, block, &data).await?;
                }
            }

            let first_dropped = size.div_ceil(BLOCK);
            join_all(
                attrs
                    .placement
                    .targets
                    .iter()
                    .map(|target| self.truncate_target(&attrs.fid, target, first_dropped)),
            )
            .await;
        }

        self.metadata.set_size(&attrs.fid, size).await
    }

    /// Remove every fragment of a file, then its metadata
    ///
    /// All removals are attempted; the first failure is returned afterwards.
    #[instrument(skip(self, attrs), fields(fid = %attrs.fid))]
    pub async fn remove(&self, attrs: &FileAttributes) -> Result<()> {
        let results = join_all(
            attrs
                .placement
                .targets
                .iter()
                .map(|target| self.remove_from_target(&attrs.fid, target)),
        )
        .await;
        let first_error = results.into_iter().find_map(|r| r.err());

        let removed = self.metadata.remove(&attrs.fid).await;
        match first_error {
            Some(e) => Err(e),
            None => removed,
        }
    }

    async fn truncate_target(&self, fid: &FileId, target: &StorageRef, first_block: u64) {
        let node = match self.pool.get_or_connect(&target.host).await {
            Ok(node) => node,
            Err(e) => {
                warn!(%target, error = %e, "cannot truncate fragments, target unreachable");
                return;
            }
        };
        for mp in 0..self.params().forward {
            if let Err(e) = node.truncate_fragment(target.sid, fid, mp, first_block).await {
                warn!(%target, mp, error = %e, "fragment truncate failed");
                self.pool.discard(&target.host);
                return;
            }
        }
    }

    async fn remove_from_target(&self, fid: &FileId, target: &StorageRef) -> Result<()> {
        let node = self.pool.get_or_connect(&target.host).await?;
        let mut first_error = None;
        for mp in 0..self.params().forward {
            if let Err(e) = node.remove_fragment(target.sid, fid, mp).await {
                warn!(%target, mp, error = %e, "fragment remove failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => {
                self.pool.discard(&target.host);
                Err(e)
            }
            None => Ok(()),
        }
    }

    // =========================================================================
    // Whole Blocks
    // =========================================================================

    /// Read `nblocks` whole blocks from `first_block`
    ///
    /// Blocks with an empty bitmap come back as zeros.
    pub async fn read_blocks(
        &self,
        attrs: &FileAttributes,
        first_block: u64,
        nblocks: usize,
    ) -> Result<Vec<u8>> {
        let mut out = vec![0u8; nblocks * BLOCK_SIZE];
        let chunk_bytes = self.scratch.max_blocks * BLOCK_SIZE;

        for (i, chunk) in out.chunks_mut(chunk_bytes).enumerate() {
            let chunk_first = first_block + (i * self.scratch.max_blocks) as u64;
            let count = chunk.len() / BLOCK_SIZE;

            let bitmaps = self
                .metadata
                .get_distribution(&attrs.fid, chunk_first, count)
                .await?;
            if bitmaps.len() != count {
                return Err(Error::Internal(format!(
                    "metadata returned {} bitmaps for {} blocks",
                    bitmaps.len(),
                    count
                )));
            }

            for run in runs(&bitmaps) {
                let bytes = &mut chunk[run.start * BLOCK_SIZE..(run.start + run.len) * BLOCK_SIZE];
                let run_first = chunk_first + run.start as u64;
                if run.bitmap.is_empty() {
                    trace!(first_block = run_first, len = run.len, "sparse run");
                    bytes.fill(0);
                    metrics::SPARSE_BLOCKS.inc_by(run.len as u64);
                    continue;
                }
                self.read_run(attrs, run_first, run.bitmap, bytes).await?;
            }
        }

        Ok(out)
    }

    /// Write whole blocks from `first_block` and record their distribution
    pub async fn write_blocks(
        &self,
        attrs: &FileAttributes,
        first_block: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.len() % BLOCK_SIZE != 0 {
            return Err(Error::MalformedProjection(format!(
                "{} bytes is not a whole number of blocks",
                data.len()
            )));
        }
        let chunk_bytes = self.scratch.max_blocks * BLOCK_SIZE;

        for (i, chunk) in data.chunks(chunk_bytes).enumerate() {
            let chunk_first = first_block + (i * self.scratch.max_blocks) as u64;
            let count = chunk.len() / BLOCK_SIZE;

            let bitmap = self.write_run(attrs, chunk_first, chunk).await?;
            self.metadata
                .put_distribution(&attrs.fid, chunk_first, &vec![bitmap; count])
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Runs
    // =========================================================================

    /// Encode and store one run, returning its distribution bitmap
    async fn write_run(
        &self,
        attrs: &FileAttributes,
        first_block: u64,
        data: &[u8],
    ) -> Result<DistributionBitmap> {
        let forward = self.params().forward;
        let nblocks = data.len() / BLOCK_SIZE;

        let fragments: Vec<Bytes> = {
            let mut set = self.scratch.take();
            self.codec.forward(data, &mut set)?;
            (0..forward).map(|mp| set.to_bytes(mp)).collect()
        };

        let mut sent = 0;
        for attempt in 0..=self.config.write_retries {
            if attempt > 0 {
                metrics::RUN_RETRIES.with_label_values(&["write"]).inc();
                self.reconnect(attrs.placement.targets.iter()).await;
            }

            // nothing is sent unless every fragment has a connected slot
            let live = self.established_slots(&attrs.placement);
            sent = if live < forward {
                live
            } else {
                let (bitmap, count) = self
                    .send_fragments(attrs, first_block, nblocks, &fragments)
                    .await;
                if count == forward {
                    debug!(fid = %attrs.fid, first_block, nblocks, %bitmap, "run written");
                    return Ok(bitmap);
                }
                count
            };

            warn!(
                fid = %attrs.fid,
                first_block,
                live,
                sent,
                required = forward,
                attempt,
                "not enough reachable targets for run"
            );
        }

        Err(Error::InsufficientFragments {
            first_block,
            available: sent,
            required: forward,
        })
    }

    /// Slots of a placement with an established connection
    fn established_slots(&self, placement: &FilePlacement) -> usize {
        placement
            .targets
            .iter()
            .take(DistributionBitmap::MAX_SLOTS)
            .filter(|target| self.pool.established(&target.host).is_some())
            .count()
    }

    /// One pass over the slots in order, sending fragments to live targets
    async fn send_fragments(
        &self,
        attrs: &FileAttributes,
        first_block: u64,
        nblocks: usize,
        fragments: &[Bytes],
    ) -> (DistributionBitmap, usize) {
        let mut bitmap = DistributionBitmap::empty();
        let mut sent = 0;

        let slots = attrs
            .placement
            .targets
            .iter()
            .enumerate()
            .take(DistributionBitmap::MAX_SLOTS);
        for (slot, target) in slots {
            if sent == fragments.len() {
                break;
            }
            let Some(node) = self.pool.established(&target.host) else {
                metrics::FRAGMENT_WRITES
                    .with_label_values(&[OUTCOME_SKIPPED])
                    .inc();
                continue;
            };

            let result = node
                .write_fragment(
                    target.sid,
                    &attrs.fid,
                    sent,
                    first_block,
                    nblocks,
                    fragments[sent].clone(),
                )
                .await;
            match result {
                Ok(()) => {
                    metrics::FRAGMENT_WRITES.with_label_values(&[OUTCOME_OK]).inc();
                    bitmap.set(slot, true);
                    sent += 1;
                }
                Err(e) => {
                    metrics::FRAGMENT_WRITES
                        .with_label_values(&[OUTCOME_ERROR])
                        .inc();
                    warn!(%target, slot, mp = sent, error = %e, "fragment write failed, skipping slot");
                    self.pool.discard(&target.host);
                }
            }
        }

        (bitmap, sent)
    }

    /// Fetch and decode one run with a non-empty bitmap into `out`
    async fn read_run(
        &self,
        attrs: &FileAttributes,
        first_block: u64,
        bitmap: DistributionBitmap,
        out: &mut [u8],
    ) -> Result<()> {
        let inverse = self.params().inverse;
        let nblocks = out.len() / BLOCK_SIZE;

        if bitmap.count() < inverse {
            return Err(Error::InsufficientFragments {
                first_block,
                available: bitmap.count(),
                required: inverse,
            });
        }

        let mut set = self.scratch.take();
        set.reset(nblocks)?;
        let mut indices = Vec::with_capacity(inverse);

        for attempt in 0..=self.config.read_retries {
            if attempt > 0 {
                metrics::RUN_RETRIES.with_label_values(&["read"]).inc();
                let targets = &attrs.placement.targets;
                self.reconnect(bitmap.set_slots().filter_map(|slot| targets.get(slot)))
                    .await;
            }

            indices.clear();
            self.fetch_fragments(attrs, first_block, bitmap, &mut set, &mut indices)
                .await;
            if indices.len() == inverse {
                trace!(fid = %attrs.fid, first_block, nblocks, ?indices, "decoding run");
                return self.codec.inverse(&mut set, &indices, out);
            }

            warn!(
                fid = %attrs.fid,
                first_block,
                %bitmap,
                retrieved = indices.len(),
                required = inverse,
                attempt,
                "not enough fragments for run"
            );
        }

        Err(Error::InsufficientFragments {
            first_block,
            available: indices.len(),
            required: inverse,
        })
    }

    /// One pass over the set-bit slots in order, loading fragments into `set`
    async fn fetch_fragments(
        &self,
        attrs: &FileAttributes,
        first_block: u64,
        bitmap: DistributionBitmap,
        set: &mut ProjectionSet,
        indices: &mut Vec<usize>,
    ) {
        let inverse = self.params().inverse;
        let nblocks = set.nblocks();

        for (mp, slot) in bitmap.fragment_slots().take(self.params().forward) {
            if indices.len() == inverse {
                break;
            }
            let Some(target) = attrs.placement.targets.get(slot) else {
                warn!(fid = %attrs.fid, slot, "bitmap names a slot outside the placement");
                continue;
            };
            let Some(node) = self.pool.established(&target.host) else {
                metrics::FRAGMENT_READS
                    .with_label_values(&[OUTCOME_SKIPPED])
                    .inc();
                continue;
            };

            let loaded = match node
                .read_fragment(target.sid, &attrs.fid, mp, first_block, nblocks)
                .await
            {
                Ok(bytes) => set.load_bytes(mp, &bytes),
                Err(e) => Err(e),
            };
            match loaded {
                Ok(()) => {
                    metrics::FRAGMENT_READS.with_label_values(&[OUTCOME_OK]).inc();
                    indices.push(mp);
                }
                Err(e) => {
                    metrics::FRAGMENT_READS
                        .with_label_values(&[OUTCOME_ERROR])
                        .inc();
                    warn!(%target, slot, mp, error = %e, "fragment read failed, skipping slot");
                    self.pool.discard(&target.host);
                }
            }
        }
    }

    /// Try to re-establish connections to targets that are down
    async fn reconnect<'a>(&self, targets: impl Iterator<Item = &'a StorageRef>) {
        for target in targets {
            if self.pool.established(&target.host).is_some() {
                continue;
            }
            if let Err(e) = self.pool.get_or_connect(&target.host).await {
                debug!(%target, error = %e, "reconnect failed");
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
