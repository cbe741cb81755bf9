//! Placement Service
//!
//! Chooses the storage targets of new files. Volumes hold clusters, clusters
//! hold storage targets; the balancing pass keeps clusters sorted by
//! aggregate free capacity and the targets of each cluster by their own free
//! capacity, both descending. Placement walks that order.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::VolumeConfig;
use crate::domain::ports::{ClusterId, FilePlacement, StorageId, StorageRef, StorageStat, VolumeId};
use crate::ec::LayoutParams;
use crate::error::{Error, Result};

/// One storage target with its last-known statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageState {
    pub target: StorageRef,
    pub stat: StorageStat,
}

/// One cluster in balancing order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClusterState {
    pub id: ClusterId,
    pub storages: Vec<StorageState>,
}

impl ClusterState {
    /// Sum of the free capacity of every target
    pub fn free(&self) -> u64 {
        self.storages.iter().map(|s| s.stat.free).sum()
    }

    /// Targets with free capacity left, in current order
    fn available(&self) -> impl Iterator<Item = &StorageState> {
        self.storages.iter().filter(|s| s.stat.free > 0)
    }
}

/// One volume and its clusters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeState {
    pub id: VolumeId,
    pub clusters: Vec<ClusterState>,
}

/// Target of a statistics refresh: `(volume, cluster, storage)`
pub type StatTarget = (VolumeId, ClusterId, StorageRef);

/// Placement of new files over the configured volumes
pub struct PlacementService {
    safe: usize,
    volumes: RwLock<Vec<VolumeState>>,
}

impl PlacementService {
    /// Build from configuration; every target starts with no known capacity
    pub fn new(params: &LayoutParams, volumes: &[VolumeConfig]) -> Self {
        Self {
            safe: params.safe,
            volumes: RwLock::new(build_volumes(volumes, &HashMap::new())),
        }
    }

    /// Targets required per file
    pub fn safe(&self) -> usize {
        self.safe
    }

    /// Replace the topology, keeping statistics of surviving targets
    pub fn reload(&self, volumes: &[VolumeConfig]) {
        let mut guard = self.volumes.write();
        let known: HashMap<(ClusterId, StorageId), StorageState> = guard
            .iter()
            .flat_map(|v| v.clusters.iter())
            .flat_map(|c| c.storages.iter().map(move |s| ((c.id, s.target.sid), s.clone())))
            .collect();
        *guard = build_volumes(volumes, &known);
        info!(volumes = guard.len(), "placement topology reloaded");
    }

    /// Copy of the current volumes in balancing order
    pub fn snapshot(&self) -> Vec<VolumeState> {
        self.volumes.read().clone()
    }

    /// Every storage target, for a statistics refresh
    pub fn stat_targets(&self) -> Vec<StatTarget> {
        self.volumes
            .read()
            .iter()
            .flat_map(|v| {
                v.clusters.iter().flat_map(move |c| {
                    c.storages
                        .iter()
                        .map(move |s| (v.id, c.id, s.target.clone()))
                })
            })
            .collect()
    }

    /// Record fresh statistics and re-sort clusters and targets
    ///
    /// Targets missing from `stats` keep their previous values; stats for
    /// targets no longer configured are ignored.
    pub fn apply_stats(&self, stats: &[(StatTarget, StorageStat)]) {
        let fresh: HashMap<(VolumeId, ClusterId, StorageId), StorageStat> = stats
            .iter()
            .map(|((vid, cid, target), stat)| ((*vid, *cid, target.sid), *stat))
            .collect();

        let mut volumes = self.volumes.write();
        for volume in volumes.iter_mut() {
            for cluster in volume.clusters.iter_mut() {
                for storage in cluster.storages.iter_mut() {
                    if let Some(stat) = fresh.get(&(volume.id, cluster.id, storage.target.sid)) {
                        storage.stat = *stat;
                    }
                }
                cluster
                    .storages
                    .sort_by(|a, b| b.stat.free.cmp(&a.stat.free));
            }
            volume.clusters.sort_by_key(|c| std::cmp::Reverse(c.free()));
        }
        debug!(targets = fresh.len(), "capacity statistics applied");
    }

    /// Choose `safe` targets for a new file in `volume`
    ///
    /// Returns the first cluster, in balancing order, with at least `safe`
    /// targets holding free capacity; its targets are taken in order.
    pub fn place_new_file(&self, volume: VolumeId) -> Result<FilePlacement> {
        let volumes = self.volumes.read();
        let state = volumes
            .iter()
            .find(|v| v.id == volume)
            .ok_or_else(|| Error::NotFound(format!("volume {}", volume)))?;

        for cluster in &state.clusters {
            if cluster.available().count() < self.safe {
                continue;
            }
            let targets: Vec<StorageRef> = cluster
                .available()
                .take(self.safe)
                .map(|s| s.target.clone())
                .collect();
            debug!(%volume, cluster = %cluster.id, ?targets, "placed new file");
            return Ok(FilePlacement {
                cluster: cluster.id,
                targets,
            });
        }

        Err(Error::NoSpace { volume: volume.0 })
    }
}

fn build_volumes(
    volumes: &[VolumeConfig],
    known: &HashMap<(ClusterId, StorageId), StorageState>,
) -> Vec<VolumeState> {
    volumes
        .iter()
        .map(|v| VolumeState {
            id: VolumeId(v.id),
            clusters: v
                .clusters
                .iter()
                .map(|c| {
                    let cid = ClusterId(c.id);
                    ClusterState {
                        id: cid,
                        storages: c
                            .storages
                            .iter()
                            .map(|s| {
                                let target = StorageRef::new(s.sid, s.host.clone());
                                let stat = known
                                    .get(&(cid, target.sid))
                                    .filter(|old| old.target.host == target.host)
                                    .map(|old| old.stat)
                                    .unwrap_or_default();
                                StorageState { target, stat }
                            })
                            .collect(),
                    }
                })
                .collect(),
        })
        .collect()
}
