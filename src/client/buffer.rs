//! Write-back / Read-ahead Buffer
//!
//! An [`OpenFile`] keeps a single window of file bytes in front of the
//! orchestrator. The window is either a pending write, flushed when the
//! next write is not contiguous, when it would overflow the buffer, or on
//! demand, or a read-ahead cache filled one buffer's worth at a time.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, instrument};

use super::attr_cache::AttrCache;
use super::block_io::{write_end, BlockIo};
use crate::domain::ports::{FileAttributes, FileId};
use crate::error::Result;

/// Contents of the single window
#[derive(Debug, Default)]
enum Window {
    #[default]
    Empty,
    /// Bytes written by the application, not yet stored
    PendingWrite { base: u64, data: Vec<u8> },
    /// Bytes read ahead from storage
    ReadCache { base: u64, data: Vec<u8> },
}

/// Handle on one open file
pub struct OpenFile {
    io: Arc<BlockIo>,
    attrs_cache: Arc<Mutex<AttrCache>>,
    attrs: FileAttributes,
    capacity: usize,
    window: Window,
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("fid", &self.attrs.fid)
            .field("size", &self.size())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl OpenFile {
    pub(crate) fn new(
        io: Arc<BlockIo>,
        attrs_cache: Arc<Mutex<AttrCache>>,
        attrs: FileAttributes,
    ) -> Self {
        let capacity = io.config().buffer_size.max(1);
        Self {
            io,
            attrs_cache,
            attrs,
            capacity,
            window: Window::Empty,
        }
    }

    pub fn fid(&self) -> FileId {
        self.attrs.fid
    }

    /// Attributes as last stored
    pub fn attributes(&self) -> &FileAttributes {
        &self.attrs
    }

    /// Logical size, including bytes still pending in the buffer
    pub fn size(&self) -> u64 {
        match &self.window {
            Window::PendingWrite { base, data } => self.attrs.size.max(base + data.len() as u64),
            _ => self.attrs.size,
        }
    }

    /// Whether the buffer holds unflushed bytes
    pub fn is_dirty(&self) -> bool {
        matches!(self.window, Window::PendingWrite { .. })
    }

    /// Buffer `data` at `offset`
    ///
    /// Contiguous writes accumulate until the buffer is full; anything else
    /// flushes the pending window first. Writes larger than the buffer go
    /// straight to storage.
    #[instrument(skip(self, data), fields(fid = %self.attrs.fid, len = data.len()))]
    pub async fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        write_end(offset, data.len())?;

        if let Window::PendingWrite { base, data: pending } = &mut self.window {
            let contiguous = *base + pending.len() as u64 == offset;
            if contiguous && pending.len() + data.len() <= self.capacity {
                pending.extend_from_slice(data);
                return Ok(());
            }
        }

        self.flush().await?;

        if data.len() >= self.capacity {
            self.store(offset, data).await
        } else {
            let mut buf = Vec::with_capacity(self.capacity);
            buf.extend_from_slice(data);
            self.window = Window::PendingWrite {
                base: offset,
                data: buf,
            };
            Ok(())
        }
    }

    /// Read up to `len` bytes at `offset`, clamped at end of file
    #[instrument(skip(self), fields(fid = %self.attrs.fid))]
    pub async fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if let Window::ReadCache { base, data } = &self.window {
            let end = offset.saturating_add(len as u64);
            if offset >= *base && end <= base + data.len() as u64 {
                let start = (offset - base) as usize;
                return Ok(data[start..start + len].to_vec());
            }
        }

        self.flush().await?;

        if len >= self.capacity {
            return self.io.read(&self.attrs, offset, len).await;
        }

        let data = self.io.read(&self.attrs, offset, self.capacity).await?;
        let served = data.len().min(len);
        let out = data[..served].to_vec();
        debug!(base = offset, cached = data.len(), "read-ahead window filled");
        self.window = Window::ReadCache { base: offset, data };
        Ok(out)
    }

    /// Store any pending write and drop the read cache
    #[instrument(skip(self), fields(fid = %self.attrs.fid))]
    pub async fn flush(&mut self) -> Result<()> {
        match std::mem::take(&mut self.window) {
            Window::PendingWrite { base, data } => {
                if let Err(e) = self.store(base, &data).await {
                    // keep the bytes so a later flush can retry
                    self.window = Window::PendingWrite { base, data };
                    return Err(e);
                }
                Ok(())
            }
            Window::ReadCache { .. } | Window::Empty => Ok(()),
        }
    }

    /// Flush and release the handle
    pub async fn close(mut self) -> Result<FileAttributes> {
        self.flush().await?;
        Ok(self.attrs)
    }

    /// Truncate through the handle, keeping the buffer consistent
    pub async fn truncate(&mut self, size: u64) -> Result<()> {
        self.flush().await?;
        self.io.truncate(&self.attrs, size).await?;
        self.update_size(size);
        Ok(())
    }

    async fn store(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let size = self.io.write(&self.attrs, offset, data).await?;
        self.update_size(size);
        Ok(())
    }

    fn update_size(&mut self, size: u64) {
        self.attrs.size = size;
        self.attrs_cache.lock().set_size(&self.attrs.fid, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryCluster, InMemoryMetadata, NodePool};
    use crate::config::ClientConfig;
    use crate::domain::ports::{ClusterId, FilePlacement, MetadataService, StorageRef, VolumeId};
    use crate::ec::{Layout, LayoutParams, BLOCK_SIZE};
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::time::Duration;

    struct Fixture {
        cluster: Arc<InMemoryCluster>,
        metadata: Arc<InMemoryMetadata>,
        file: OpenFile,
    }

    async fn fixture(buffer_size: usize) -> Fixture {
        let cluster = Arc::new(InMemoryCluster::new());
        let hosts = ["a", "b", "c", "d"];
        for host in hosts {
            cluster.add_node(host, 1 << 30);
        }
        let metadata = Arc::new(InMemoryMetadata::new());
        let pool = Arc::new(NodePool::new(cluster.clone()));
        let params = Arc::new(LayoutParams::new(Layout::Layout0).unwrap());
        let config = ClientConfig {
            buffer_size,
            ..Default::default()
        };
        let io = Arc::new(BlockIo::new(params, metadata.clone(), pool, config));

        let placement = FilePlacement {
            cluster: ClusterId(1),
            targets: hosts
                .iter()
                .enumerate()
                .map(|(i, host)| StorageRef::new(i as u8 + 1, *host))
                .collect(),
        };
        let attrs = FileAttributes::new(FileId::new(), VolumeId(1), placement);
        metadata.create(attrs.clone()).await.unwrap();
        io.warm_up(&attrs.placement).await;

        let cache = Arc::new(Mutex::new(AttrCache::new(16, Duration::from_secs(60))));
        Fixture {
            cluster,
            metadata,
            file: OpenFile::new(io, cache, attrs),
        }
    }

    #[tokio::test]
    async fn test_contiguous_writes_are_buffered() {
        let mut f = fixture(BLOCK_SIZE).await;

        f.file.write(0, &[1u8; 100]).await.unwrap();
        f.file.write(100, &[2u8; 100]).await.unwrap();
        assert!(f.file.is_dirty());
        assert_eq!(f.file.size(), 200);
        assert_eq!(f.cluster.total_writes(), 0);

        let attrs = f.file.close().await.unwrap();
        assert_eq!(attrs.size, 200);
        // one run, three fragments
        assert_eq!(f.cluster.total_writes(), 3);
        assert_eq!(
            f.metadata.get_attributes(&attrs.fid).await.unwrap().size,
            200
        );
    }

    #[tokio::test]
    async fn test_non_contiguous_write_flushes() {
        let mut f = fixture(BLOCK_SIZE).await;

        f.file.write(0, &[1u8; 100]).await.unwrap();
        f.file.write(500, &[2u8; 100]).await.unwrap();
        assert_eq!(f.cluster.total_writes(), 3);
        assert_eq!(f.file.attributes().size, 100);

        f.file.flush().await.unwrap();
        assert!(!f.file.is_dirty());
        assert_eq!(f.file.attributes().size, 600);

        let data = f.file.read(0, 600).await.unwrap();
        assert_eq!(&data[..100], &[1u8; 100][..]);
        assert!(data[100..500].iter().all(|b| *b == 0));
        assert_eq!(&data[500..], &[2u8; 100][..]);
    }

    #[tokio::test]
    async fn test_overflowing_write_flushes() {
        let mut f = fixture(256).await;

        f.file.write(0, &[1u8; 200]).await.unwrap();
        f.file.write(200, &[2u8; 100]).await.unwrap();
        // first window stored, second pending
        assert_eq!(f.file.attributes().size, 200);
        assert_eq!(f.file.size(), 300);
    }

    #[tokio::test]
    async fn test_read_ahead_serves_from_window() {
        let mut f = fixture(2 * BLOCK_SIZE).await;
        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        f.file.write(0, &data).await.unwrap();

        let first = f.file.read(10, 100).await.unwrap();
        assert_eq!(first, &data[10..110]);
        let reads = f.cluster.total_reads();

        let second = f.file.read(1000, 5000).await.unwrap();
        assert_eq!(second, &data[1000..6000]);
        assert_eq!(f.cluster.total_reads(), reads);

        // outside the window
        let third = f.file.read(2 * BLOCK_SIZE as u64 + 20, 10).await.unwrap();
        assert_eq!(third, &data[2 * BLOCK_SIZE + 20..2 * BLOCK_SIZE + 30]);
        assert!(f.cluster.total_reads() > reads);
    }

    #[tokio::test]
    async fn test_read_sees_pending_write() {
        let mut f = fixture(BLOCK_SIZE).await;
        f.file.write(0, b"hello").await.unwrap();

        assert_eq!(f.file.read(0, 5).await.unwrap(), b"hello");
        assert!(!f.file.is_dirty());
        assert!(f.file.read(5, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_through_handle() {
        let mut f = fixture(BLOCK_SIZE).await;
        f.file.write(0, &[9u8; 1000]).await.unwrap();

        f.file.truncate(10).await.unwrap();
        assert_eq!(f.file.size(), 10);
        assert_eq!(f.file.read(0, 100).await.unwrap(), vec![9u8; 10]);
    }

    #[tokio::test]
    async fn test_unbounded_read_length() {
        let mut f = fixture(BLOCK_SIZE).await;
        f.file.write(0, &[3u8; 300]).await.unwrap();

        // cached window first, then straight to storage
        assert_eq!(f.file.read(0, 10).await.unwrap(), vec![3u8; 10]);
        assert_eq!(f.file.read(5, usize::MAX).await.unwrap(), vec![3u8; 295]);
    }

    #[tokio::test]
    async fn test_write_past_max_offset_rejected() {
        let mut f = fixture(BLOCK_SIZE).await;

        let result = f.file.write(u64::MAX - 2, b"overflow").await;
        assert_matches!(result, Err(Error::InvalidRange(_)));
        assert!(!f.file.is_dirty());
        assert_eq!(f.file.size(), 0);
    }
}
