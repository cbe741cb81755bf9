//! Placement
//!
//! Storage target selection for new files and the background pass that
//! keeps capacity statistics fresh.

mod balancer;
mod service;

pub use balancer::CapacityBalancer;
pub use service::{ClusterState, PlacementService, StatTarget, StorageState, VolumeState};
