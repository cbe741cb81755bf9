//! Domain Layer
//!
//! Value objects and the ports the client core depends on.
//!
//! # Usage
//!
//! ```ignore
//! use mojettestor::domain::ports::{ConnectionPool, MetadataService};
//!
//! // Use traits for dependency injection
//! async fn file_size<M: MetadataService>(metadata: &M, fid: &FileId) -> Result<u64> {
//!     Ok(metadata.get_attributes(fid).await?.size)
//! }
//! ```

pub mod ports;

// Re-export commonly used types
pub use ports::{
    // Value objects
    ClusterId,
    // Port traits
    ConnectionPool,
    Connector,
    FileAttributes,
    FileId,
    FilePlacement,
    MetadataService,
    StorageId,
    StorageNode,
    StorageRef,
    StorageStat,
    VolumeId,
};
