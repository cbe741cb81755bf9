//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │ MetadataService │ StorageNode │ ConnectionPool │ Connector │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ NodePool │ InMemoryMetadata │ InMemoryStorageNode          │ │
//! │  │ InMemoryCluster                                             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use mojettestor::adapters::{InMemoryCluster, NodePool};
//! use mojettestor::domain::ports::ConnectionPool;
//!
//! let cluster = Arc::new(InMemoryCluster::new());
//! cluster.add_node("node-1", 1 << 30);
//!
//! // Use it through the domain port trait
//! let pool = NodePool::new(cluster);
//! let node = pool.get_or_connect("node-1").await?;
//! ```

pub mod memory;
mod pool;

pub use memory::{InMemoryCluster, InMemoryMetadata, InMemoryStorageNode};
pub use pool::NodePool;
