//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the value objects shared by the client and the
//! abstractions (ports) for the collaborators it talks to: the metadata
//! service, storage nodes and the connection layer. Infrastructure adapters
//! implement these traits.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Client Core                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │ MetadataService │ StorageNode │ ConnectionPool      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  NodePool │ InMemoryMetadata │ InMemoryStorageNode  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ec::DistributionBitmap;
use crate::error::Result;

// =============================================================================
// Value Objects
// =============================================================================

/// File identifier (value object).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Storage identifier, unique within a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(pub u8);

impl fmt::Display for StorageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sid{}", self.0)
    }
}

/// Cluster identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterId(pub u16);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cid{}", self.0)
    }
}

/// Volume identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VolumeId(pub u16);

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vid{}", self.0)
    }
}

/// Address of one storage target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageRef {
    pub sid: StorageId,
    pub host: String,
}

impl StorageRef {
    pub fn new(sid: u8, host: impl Into<String>) -> Self {
        Self {
            sid: StorageId(sid),
            host: host.into(),
        }
    }
}

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.sid, self.host)
    }
}

/// Storage targets of a file, fixed at creation.
///
/// The index in `targets` is the slot index used by distribution bitmaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePlacement {
    pub cluster: ClusterId,
    pub targets: Vec<StorageRef>,
}

impl FilePlacement {
    pub fn slots(&self) -> usize {
        self.targets.len()
    }
}

/// File attributes kept by the metadata service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttributes {
    pub fid: FileId,
    pub volume: VolumeId,
    pub size: u64,
    pub placement: FilePlacement,
    pub mtime: DateTime<Utc>,
}

impl FileAttributes {
    pub fn new(fid: FileId, volume: VolumeId, placement: FilePlacement) -> Self {
        Self {
            fid,
            volume,
            size: 0,
            placement,
            mtime: Utc::now(),
        }
    }
}

/// Capacity reported by a storage target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageStat {
    pub size: u64,
    pub free: u64,
}

impl StorageStat {
    pub fn new(size: u64, free: u64) -> Self {
        Self { size, free }
    }

    /// Stat recorded for a target that could not be reached
    pub fn unavailable() -> Self {
        Self::default()
    }
}

// =============================================================================
// Metadata Port
// =============================================================================

/// Port for the metadata/export service.
///
/// Must give read-your-writes consistency for a single file handle.
#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Register a newly placed file.
    async fn create(&self, attrs: FileAttributes) -> Result<()>;

    /// Get the attributes of a file.
    async fn get_attributes(&self, fid: &FileId) -> Result<FileAttributes>;

    /// Get the distribution bitmaps of `count` blocks from `first_block`.
    ///
    /// Blocks never written are reported with an empty bitmap.
    async fn get_distribution(
        &self,
        fid: &FileId,
        first_block: u64,
        count: usize,
    ) -> Result<Vec<DistributionBitmap>>;

    /// Store the distribution bitmaps of consecutive blocks from `first_block`.
    async fn put_distribution(
        &self,
        fid: &FileId,
        first_block: u64,
        bitmaps: &[DistributionBitmap],
    ) -> Result<()>;

    /// Set the file size, dropping distribution past the new end.
    async fn set_size(&self, fid: &FileId, size: u64) -> Result<()>;

    /// Forget a file.
    async fn remove(&self, fid: &FileId) -> Result<()>;
}

// =============================================================================
// Storage Node Port
// =============================================================================

/// Port for one storage node connection.
///
/// Fragments are addressed by `(storage id, file id, fragment index, block)`.
#[async_trait]
pub trait StorageNode: Send + Sync {
    /// Store the fragment of `count` consecutive blocks.
    async fn write_fragment(
        &self,
        sid: StorageId,
        fid: &FileId,
        mp: usize,
        first_block: u64,
        count: usize,
        data: Bytes,
    ) -> Result<()>;

    /// Read back the fragment of `count` consecutive blocks.
    async fn read_fragment(
        &self,
        sid: StorageId,
        fid: &FileId,
        mp: usize,
        first_block: u64,
        count: usize,
    ) -> Result<Bytes>;

    /// Drop every block of one fragment index.
    async fn remove_fragment(&self, sid: StorageId, fid: &FileId, mp: usize) -> Result<()>;

    /// Drop blocks `first_block..` of one fragment index.
    async fn truncate_fragment(
        &self,
        sid: StorageId,
        fid: &FileId,
        mp: usize,
        first_block: u64,
    ) -> Result<()>;

    /// Report the capacity of a storage.
    async fn stat(&self, sid: StorageId) -> Result<StorageStat>;
}

// =============================================================================
// Connection Ports
// =============================================================================

/// Port for opening a connection to a storage host.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn StorageNode>>;
}

/// Port for the pool of live storage connections.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    /// Connection to `host` if one is currently established.
    fn established(&self, host: &str) -> Option<Arc<dyn StorageNode>>;

    /// Connection to `host`, dialing a new one if needed.
    async fn get_or_connect(&self, host: &str) -> Result<Arc<dyn StorageNode>>;

    /// Drop a broken connection so the next attempt reconnects fresh.
    fn discard(&self, host: &str);
}

// =============================================================================
// Tests
// =============================================================================
