//! Client Configuration
//!
//! Loaded from a YAML file; every field has a default so an empty document
//! is a valid configuration.
//!
//! ```yaml
//! layout: 0
//! balance_interval: 10
//! client:
//!   buffer_size: 262144
//!   write_retries: 3
//! volumes:
//!   - id: 1
//!     clusters:
//!       - id: 1
//!         storages:
//!           - { sid: 1, host: node-1 }
//!           - { sid: 2, host: node-2 }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ec::{Layout, LayoutParams};
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Layout preset used for every file
    pub layout: Layout,

    /// Client-side I/O tuning
    pub client: ClientConfig,

    /// Seconds between capacity balancing passes
    pub balance_interval: u64,

    /// Volumes known to the placement service
    pub volumes: Vec<VolumeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            client: ClientConfig::default(),
            balance_interval: 10,
            volumes: Vec::new(),
        }
    }
}

/// Block I/O and caching parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Capacity of the per-file write-back/read-ahead window in bytes
    pub buffer_size: usize,
    /// Reconnect-and-retry rounds for a write run
    pub write_retries: u32,
    /// Reconnect-and-retry rounds for a read run
    pub read_retries: u32,
    /// Largest number of blocks sent in one request
    pub max_blocks_per_request: usize,
    /// Attribute cache capacity (entries)
    pub attr_cache_capacity: usize,
    /// Attribute cache entry lifetime in seconds
    pub attr_cache_ttl: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256 * 1024,
            write_retries: 3,
            read_retries: 3,
            max_blocks_per_request: 16,
            attr_cache_capacity: 1024,
            attr_cache_ttl: 10,
        }
    }
}

impl ClientConfig {
    pub fn attr_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.attr_cache_ttl)
    }
}

/// One volume and its clusters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub id: u16,
    #[serde(default)]
    pub clusters: Vec<ClusterConfig>,
}

/// One cluster of storage targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub id: u16,
    #[serde(default)]
    pub storages: Vec<StorageConfig>,
}

/// One storage target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub sid: u8,
    pub host: String,
}

impl Config {
    /// Read and validate a YAML configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_yaml(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn balance_interval(&self) -> Duration {
        Duration::from_secs(self.balance_interval)
    }

    /// Geometry of the configured layout
    pub fn layout_params(&self) -> Result<LayoutParams> {
        LayoutParams::new(self.layout)
    }

    /// Check value ranges and id uniqueness
    pub fn validate(&self) -> Result<()> {
        if self.client.buffer_size == 0 {
            return Err(Error::Config("client.buffer_size must be > 0".into()));
        }
        if self.client.max_blocks_per_request == 0 {
            return Err(Error::Config(
                "client.max_blocks_per_request must be > 0".into(),
            ));
        }
        if self.client.attr_cache_capacity == 0 {
            return Err(Error::Config(
                "client.attr_cache_capacity must be > 0".into(),
            ));
        }
        if self.balance_interval == 0 {
            return Err(Error::Config("balance_interval must be > 0".into()));
        }

        let (_, _, safe) = self.layout.counts();
        let mut volume_ids = HashSet::new();
        let mut cluster_ids = HashSet::new();

        for volume in &self.volumes {
            if !volume_ids.insert(volume.id) {
                return Err(Error::Config(format!("duplicate volume id {}", volume.id)));
            }
            for cluster in &volume.clusters {
                if !cluster_ids.insert(cluster.id) {
                    return Err(Error::Config(format!(
                        "duplicate cluster id {}",
                        cluster.id
                    )));
                }

                let mut sids = HashSet::new();
                for storage in &cluster.storages {
                    if !sids.insert(storage.sid) {
                        return Err(Error::Config(format!(
                            "duplicate storage id {} in cluster {}",
                            storage.sid, cluster.id
                        )));
                    }
                }

                if cluster.storages.len() < safe {
                    warn!(
                        volume = volume.id,
                        cluster = cluster.id,
                        storages = cluster.storages.len(),
                        safe,
                        "cluster has fewer storages than {} requires, it will never be placed on",
                        self.layout
                    );
                }
            }
        }

        Ok(())
    }
}
