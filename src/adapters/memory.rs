//! In-Memory Adapters
//!
//! Metadata service and storage nodes kept entirely in memory, with failure
//! injection. Used by the simulator and by tests.
//!
//! Storage nodes are grouped in an [`InMemoryCluster`], which also acts as
//! the [`Connector`]: connecting to a host that is offline fails, and a
//! connection to a node taken offline afterwards fails every call, like a
//! broken socket would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;

use crate::domain::ports::{
    Connector, FileAttributes, FileId, MetadataService, StorageId, StorageNode, StorageStat,
};
use crate::ec::{DistributionBitmap, BLOCK_SIZE};
use crate::error::{Error, Result};

// =============================================================================
// Metadata
// =============================================================================

#[derive(Debug, Clone)]
struct FileRecord {
    attrs: FileAttributes,
    distribution: BTreeMap<u64, DistributionBitmap>,
}

/// [`MetadataService`] adapter backed by a concurrent map
#[derive(Default)]
pub struct InMemoryMetadata {
    files: DashMap<FileId, FileRecord>,
    distribution_reads: AtomicU64,
}

impl InMemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of files known
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Number of `get_distribution` calls served
    pub fn distribution_reads(&self) -> u64 {
        self.distribution_reads.load(Ordering::Relaxed)
    }

    /// Highest block with a recorded bitmap, if any
    pub fn last_mapped_block(&self, fid: &FileId) -> Option<u64> {
        self.files
            .get(fid)
            .and_then(|record| record.distribution.keys().next_back().copied())
    }
}

fn not_found(fid: &FileId) -> Error {
    Error::NotFound(format!("file {}", fid))
}

#[async_trait]
impl MetadataService for InMemoryMetadata {
    async fn create(&self, attrs: FileAttributes) -> Result<()> {
        let fid = attrs.fid;
        if self.files.contains_key(&fid) {
            return Err(Error::Internal(format!("file {} already exists", fid)));
        }
        self.files.insert(
            fid,
            FileRecord {
                attrs,
                distribution: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn get_attributes(&self, fid: &FileId) -> Result<FileAttributes> {
        self.files
            .get(fid)
            .map(|record| record.attrs.clone())
            .ok_or_else(|| not_found(fid))
    }

    async fn get_distribution(
        &self,
        fid: &FileId,
        first_block: u64,
        count: usize,
    ) -> Result<Vec<DistributionBitmap>> {
        self.distribution_reads.fetch_add(1, Ordering::Relaxed);
        let record = self.files.get(fid).ok_or_else(|| not_found(fid))?;
        Ok((first_block..first_block + count as u64)
            .map(|block| {
                record
                    .distribution
                    .get(&block)
                    .copied()
                    .unwrap_or_default()
            })
            .collect())
    }

    async fn put_distribution(
        &self,
        fid: &FileId,
        first_block: u64,
        bitmaps: &[DistributionBitmap],
    ) -> Result<()> {
        let mut record = self.files.get_mut(fid).ok_or_else(|| not_found(fid))?;
        for (block, bitmap) in (first_block..).zip(bitmaps) {
            if bitmap.is_empty() {
                record.distribution.remove(&block);
            } else {
                record.distribution.insert(block, *bitmap);
            }
        }
        record.attrs.mtime = Utc::now();
        Ok(())
    }

    async fn set_size(&self, fid: &FileId, size: u64) -> Result<()> {
        let mut record = self.files.get_mut(fid).ok_or_else(|| not_found(fid))?;
        let first_dropped = size.div_ceil(BLOCK_SIZE as u64);
        record
            .distribution
            .retain(|block, _| *block < first_dropped);
        record.attrs.size = size;
        record.attrs.mtime = Utc::now();
        Ok(())
    }

    async fn remove(&self, fid: &FileId) -> Result<()> {
        self.files
            .remove(fid)
            .map(|_| ())
            .ok_or_else(|| not_found(fid))
    }
}

// =============================================================================
// Storage Node
// =============================================================================

type FragmentKey = (StorageId, FileId, usize);

/// Fragment store of one storage host
///
/// Each fragment keeps one byte image per block so runs of any length can be
/// written and read back.
pub struct InMemoryStorageNode {
    host: String,
    capacity: u64,
    online: AtomicBool,
    fragments: DashMap<FragmentKey, BTreeMap<u64, Bytes>>,
    used: AtomicU64,
    writes: AtomicU64,
    reads: AtomicU64,
}

impl InMemoryStorageNode {
    pub fn new(host: impl Into<String>, capacity: u64) -> Self {
        Self {
            host: host.into(),
            capacity,
            online: AtomicBool::new(true),
            fragments: DashMap::new(),
            used: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            reads: AtomicU64::new(0),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Successful `write_fragment` calls
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Successful `read_fragment` calls
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Bytes held across all fragments
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    /// Number of `(storage, file, fragment index)` entries held
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    /// Whether this node holds a fragment index of a file
    pub fn holds(&self, sid: StorageId, fid: &FileId, mp: usize) -> bool {
        self.fragments.contains_key(&(sid, *fid, mp))
    }

    fn check_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(Error::storage(&self.host, "connection reset"))
        }
    }

    fn release(&self, blocks: impl Iterator<Item = Bytes>) {
        let freed: u64 = blocks.map(|b| b.len() as u64).sum();
        self.used.fetch_sub(freed, Ordering::Relaxed);
    }
}

#[async_trait]
impl StorageNode for InMemoryStorageNode {
    async fn write_fragment(
        &self,
        sid: StorageId,
        fid: &FileId,
        mp: usize,
        first_block: u64,
        count: usize,
        data: Bytes,
    ) -> Result<()> {
        self.check_online()?;
        if count == 0 || data.len() % count != 0 {
            return Err(Error::storage(
                &self.host,
                format!("{} bytes do not split into {} blocks", data.len(), count),
            ));
        }

        let per_block = data.len() / count;
        let mut blocks = self.fragments.entry((sid, *fid, mp)).or_default();
        for (i, block) in (first_block..first_block + count as u64).enumerate() {
            let chunk = data.slice(i * per_block..(i + 1) * per_block);
            self.used.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            if let Some(old) = blocks.insert(block, chunk) {
                self.release(std::iter::once(old));
            }
        }

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_fragment(
        &self,
        sid: StorageId,
        fid: &FileId,
        mp: usize,
        first_block: u64,
        count: usize,
    ) -> Result<Bytes> {
        self.check_online()?;
        let blocks = self.fragments.get(&(sid, *fid, mp)).ok_or_else(|| {
            Error::storage(&self.host, format!("no fragment {} of {} on {}", mp, fid, sid))
        })?;

        let mut out = BytesMut::new();
        for block in first_block..first_block + count as u64 {
            let chunk = blocks.get(&block).ok_or_else(|| {
                Error::storage(
                    &self.host,
                    format!("fragment {} of {} has no block {}", mp, fid, block),
                )
            })?;
            out.extend_from_slice(chunk);
        }

        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(out.freeze())
    }

    async fn remove_fragment(&self, sid: StorageId, fid: &FileId, mp: usize) -> Result<()> {
        self.check_online()?;
        if let Some((_, blocks)) = self.fragments.remove(&(sid, *fid, mp)) {
            self.release(blocks.into_values());
        }
        Ok(())
    }

    async fn truncate_fragment(
        &self,
        sid: StorageId,
        fid: &FileId,
        mp: usize,
        first_block: u64,
    ) -> Result<()> {
        self.check_online()?;
        if let Some(mut blocks) = self.fragments.get_mut(&(sid, *fid, mp)) {
            let dropped = blocks.split_off(&first_block);
            self.release(dropped.into_values());
        }
        Ok(())
    }

    async fn stat(&self, _sid: StorageId) -> Result<StorageStat> {
        self.check_online()?;
        let used = self.used();
        Ok(StorageStat::new(
            self.capacity,
            self.capacity.saturating_sub(used),
        ))
    }
}

// =============================================================================
// Cluster / Connector
// =============================================================================

/// Set of in-memory storage hosts, reachable through [`Connector`]
#[derive(Default)]
pub struct InMemoryCluster {
    nodes: DashMap<String, Arc<InMemoryStorageNode>>,
    connects: DashMap<String, u64>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a host with `capacity` bytes
    pub fn add_node(&self, host: &str, capacity: u64) -> Arc<InMemoryStorageNode> {
        let node = Arc::new(InMemoryStorageNode::new(host, capacity));
        self.nodes.insert(host.to_string(), node.clone());
        node
    }

    pub fn node(&self, host: &str) -> Option<Arc<InMemoryStorageNode>> {
        self.nodes.get(host).map(|entry| entry.value().clone())
    }

    /// Take a host offline or bring it back
    pub fn set_online(&self, host: &str, online: bool) {
        if let Some(node) = self.nodes.get(host) {
            node.set_online(online);
        }
    }

    /// Successful connects to `host`
    pub fn connects(&self, host: &str) -> u64 {
        self.connects.get(host).map(|c| *c).unwrap_or(0)
    }

    /// Reads served by every host
    pub fn total_reads(&self) -> u64 {
        self.nodes.iter().map(|node| node.reads()).sum()
    }

    /// Writes served by every host
    pub fn total_writes(&self) -> u64 {
        self.nodes.iter().map(|node| node.writes()).sum()
    }
}

#[async_trait]
impl Connector for InMemoryCluster {
    async fn connect(&self, host: &str) -> Result<Arc<dyn StorageNode>> {
        let node = self
            .node(host)
            .ok_or_else(|| Error::storage(host, "unknown host"))?;
        if !node.is_online() {
            return Err(Error::storage(host, "connection refused"));
        }
        *self.connects.entry(host.to_string()).or_insert(0) += 1;
        Ok(node)
    }
}
