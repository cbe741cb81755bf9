//! MojetteStor - Erasure-Coded Distributed File Storage Client
//!
//! Client-side core of a distributed file store that protects data with the
//! Mojette transform. Each 8 KiB file block is encoded into `forward`
//! projections spread over `safe` storage targets; any `inverse` of them
//! rebuild the block.
//!
//! # Architecture
//!
//! ```text
//! Placement Service → Block I/O Orchestrator → Storage Nodes
//!                            │
//!                     Mojette Transform
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Connection pool and in-memory adapters for the ports
//! - [`client`] - File handles, buffering and block I/O
//! - [`config`] - YAML configuration
//! - [`domain`] - Value objects and ports
//! - [`ec`] - Layouts, Mojette transform and distribution bitmaps
//! - [`error`] - Error types
//! - [`metrics`] - Prometheus counters
//! - [`placement`] - Target selection and capacity balancing

pub mod adapters;
pub mod client;
pub mod config;
pub mod domain;
pub mod ec;
pub mod error;
pub mod metrics;
pub mod placement;

// Re-export commonly used types
pub use client::{BlockIo, OpenFile, StorageClient};
pub use config::Config;
pub use ec::{Layout, LayoutParams, MojetteCodec};
pub use error::{Error, Result};
pub use placement::{CapacityBalancer, PlacementService};
