//! Storage Client
//!
//! Entry point for applications: creates, opens, inspects and removes files
//! on top of the placement service, the metadata service and the block I/O
//! orchestrator.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          StorageClient                             │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ┌────────────┐   ┌─────────────┐   ┌──────────────────────────┐  │
//! │  │ Placement  │   │ Attr Cache  │   │ OpenFile (one window)    │  │
//! │  │  Service   │   │  LRU + TTL  │   │ write-back / read-ahead  │  │
//! │  └────────────┘   └─────────────┘   └────────────┬─────────────┘  │
//! │                                                  ▼                │
//! │                                     ┌──────────────────────────┐  │
//! │                                     │ BlockIo (runs, retries)  │  │
//! │                                     └──────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────────┘
//! ```

mod attr_cache;
mod block_io;
mod buffer;

pub use attr_cache::AttrCache;
pub use block_io::BlockIo;
pub use buffer::OpenFile;

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::config::ClientConfig;
use crate::domain::ports::{ConnectionPool, FileAttributes, FileId, MetadataService, VolumeId};
use crate::ec::LayoutParams;
use crate::error::Result;
use crate::placement::PlacementService;

/// File-level client facade
pub struct StorageClient {
    io: Arc<BlockIo>,
    placement: Arc<PlacementService>,
    metadata: Arc<dyn MetadataService>,
    attrs: Arc<Mutex<AttrCache>>,
}

impl StorageClient {
    pub fn new(
        params: Arc<LayoutParams>,
        config: ClientConfig,
        placement: Arc<PlacementService>,
        metadata: Arc<dyn MetadataService>,
        pool: Arc<dyn ConnectionPool>,
    ) -> Self {
        let attrs = AttrCache::new(config.attr_cache_capacity, config.attr_cache_ttl());
        let io = BlockIo::new(params, metadata.clone(), pool, config);
        Self {
            io: Arc::new(io),
            placement,
            metadata,
            attrs: Arc::new(Mutex::new(attrs)),
        }
    }

    /// Orchestrator used by every handle of this client
    pub fn block_io(&self) -> &Arc<BlockIo> {
        &self.io
    }

    /// Place and register a new empty file in `volume`
    #[instrument(skip(self))]
    pub async fn create(&self, volume: VolumeId) -> Result<OpenFile> {
        let placement = self.placement.place_new_file(volume)?;
        let attrs = FileAttributes::new(FileId::new(), volume, placement);
        self.metadata.create(attrs.clone()).await?;
        info!(fid = %attrs.fid, cluster = %attrs.placement.cluster, "file created");

        self.io.warm_up(&attrs.placement).await;
        self.attrs.lock().insert(attrs.clone());
        Ok(self.handle(attrs))
    }

    /// Open an existing file
    #[instrument(skip(self))]
    pub async fn open(&self, fid: FileId) -> Result<OpenFile> {
        let attrs = self.getattr(fid).await?;
        self.io.warm_up(&attrs.placement).await;
        Ok(self.handle(attrs))
    }

    /// Attributes of `fid`, from cache when fresh
    pub async fn getattr(&self, fid: FileId) -> Result<FileAttributes> {
        let cached = self.attrs.lock().get(&fid);
        if let Some(attrs) = cached {
            return Ok(attrs);
        }
        let attrs = self.fetch(&fid).await?;
        self.attrs.lock().insert(attrs.clone());
        Ok(attrs)
    }

    /// Resize a file that is not open
    #[instrument(skip(self))]
    pub async fn truncate(&self, fid: FileId, size: u64) -> Result<()> {
        let attrs = self.fetch(&fid).await?;
        self.io.truncate(&attrs, size).await?;
        self.attrs.lock().set_size(&fid, size);
        Ok(())
    }

    /// Remove a file and its fragments
    #[instrument(skip(self))]
    pub async fn remove(&self, fid: FileId) -> Result<()> {
        let attrs = self.fetch(&fid).await?;
        self.attrs.lock().invalidate(&fid);
        self.io.remove(&attrs).await?;
        info!(%fid, "file removed");
        Ok(())
    }

    /// Attribute cache `(hits, misses)`
    pub fn cache_stats(&self) -> (u64, u64) {
        self.attrs.lock().stats()
    }

    /// Attributes straight from the metadata service, dropping the cached
    /// entry when the file is gone
    async fn fetch(&self, fid: &FileId) -> Result<FileAttributes> {
        match self.metadata.get_attributes(fid).await {
            Ok(attrs) => Ok(attrs),
            Err(e) => {
                if e.is_stale() {
                    self.attrs.lock().invalidate(fid);
                }
                Err(e)
            }
        }
    }

    fn handle(&self, attrs: FileAttributes) -> OpenFile {
        OpenFile::new(self.io.clone(), self.attrs.clone(), attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryMetadata, NodePool};
    use crate::config::{ClusterConfig, StorageConfig, VolumeConfig};
    use crate::domain::ports::StorageStat;
    use crate::ec::Layout;
    use crate::error::Error;
    use crate::placement::CapacityBalancer;
    use assert_matches::assert_matches;
    use std::time::Duration;

    async fn client() -> (StorageClient, Arc<InMemoryMetadata>) {
        let cluster = Arc::new(InMemoryCluster::new());
        let storages: Vec<StorageConfig> = (1..=4u8)
            .map(|sid| {
                let host = format!("node-{}", sid);
                cluster.add_node(&host, 1 << 30);
                StorageConfig { sid, host }
            })
            .collect();
        let volumes = vec![VolumeConfig {
            id: 1,
            clusters: vec![ClusterConfig { id: 1, storages }],
        }];

        let params = Arc::new(LayoutParams::new(Layout::Layout0).unwrap());
        let placement = Arc::new(PlacementService::new(&params, &volumes));
        let pool: Arc<dyn ConnectionPool> = Arc::new(NodePool::new(cluster));
        CapacityBalancer::new(placement.clone(), pool.clone(), Duration::from_secs(10))
            .balance_once()
            .await
            .unwrap();

        let metadata = Arc::new(InMemoryMetadata::new());
        let client = StorageClient::new(
            params,
            ClientConfig::default(),
            placement,
            metadata.clone(),
            pool,
        );
        (client, metadata)
    }

    #[tokio::test]
    async fn test_create_write_reopen() {
        let (client, _) = client().await;

        let mut file = client.create(VolumeId(1)).await.unwrap();
        assert_eq!(file.attributes().placement.targets.len(), 4);
        file.write(0, b"mojette").await.unwrap();
        let fid = file.close().await.unwrap().fid;

        // size reaches the cache through the handle
        assert_eq!(client.getattr(fid).await.unwrap().size, 7);

        let mut file = client.open(fid).await.unwrap();
        assert_eq!(file.read(0, 64).await.unwrap(), b"mojette");
    }

    #[tokio::test]
    async fn test_create_in_unknown_volume() {
        let (client, _) = client().await;
        assert_matches!(
            client.create(VolumeId(2)).await.err(),
            Some(Error::NotFound(_))
        );
    }

    #[tokio::test]
    async fn test_getattr_uses_cache() {
        let (client, _) = client().await;
        let fid = client.create(VolumeId(1)).await.unwrap().fid();

        client.getattr(fid).await.unwrap();
        client.getattr(fid).await.unwrap();
        assert_eq!(client.cache_stats(), (2, 0));
    }

    #[tokio::test]
    async fn test_remove_drops_everything() {
        let (client, metadata) = client().await;
        let mut file = client.create(VolumeId(1)).await.unwrap();
        file.write(0, &[5u8; 100]).await.unwrap();
        let fid = file.close().await.unwrap().fid;

        client.remove(fid).await.unwrap();
        assert!(metadata.is_empty());
        assert_matches!(client.getattr(fid).await, Err(Error::NotFound(_)));
        assert_matches!(client.open(fid).await.err(), Some(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_entry_dropped_on_not_found() {
        let (client, metadata) = client().await;
        let fid = client.create(VolumeId(1)).await.unwrap().fid();

        // removed behind the client's back
        metadata.remove(&fid).await.unwrap();
        assert_matches!(client.truncate(fid, 0).await, Err(Error::NotFound(_)));
        assert_matches!(client.getattr(fid).await, Err(Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_no_space_when_targets_full() {
        let (client, _) = client().await;
        let stats: Vec<_> = client
            .placement
            .stat_targets()
            .into_iter()
            .map(|t| (t, StorageStat::new(1 << 30, 0)))
            .collect();
        client.placement.apply_stats(&stats);

        assert_matches!(
            client.create(VolumeId(1)).await.err(),
            Some(Error::NoSpace { volume: 1 })
        );
    }
}
