//! Storage Connection Pool
//!
//! Keeps at most one live connection per storage host. A connection that
//! fails a call is discarded by the caller so the next attempt dials fresh.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::domain::ports::{ConnectionPool, Connector, StorageNode};
use crate::error::Result;

/// [`ConnectionPool`] adapter over a [`Connector`]
pub struct NodePool {
    connector: Arc<dyn Connector>,
    connections: DashMap<String, Arc<dyn StorageNode>>,
}

impl NodePool {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            connections: DashMap::new(),
        }
    }

    /// Number of established connections
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl ConnectionPool for NodePool {
    fn established(&self, host: &str) -> Option<Arc<dyn StorageNode>> {
        self.connections.get(host).map(|entry| entry.value().clone())
    }

    async fn get_or_connect(&self, host: &str) -> Result<Arc<dyn StorageNode>> {
        if let Some(node) = self.established(host) {
            return Ok(node);
        }

        // Dial without holding a shard lock; a concurrent dial to the same
        // host keeps whichever connection landed first.
        let node = self.connector.connect(host).await.map_err(|e| {
            warn!(host, error = %e, "connect failed");
            e
        })?;

        let node = self
            .connections
            .entry(host.to_string())
            .or_insert(node)
            .value()
            .clone();
        debug!(host, "connection established");
        Ok(node)
    }

    fn discard(&self, host: &str) {
        if self.connections.remove(host).is_some() {
            debug!(host, "connection discarded");
        }
    }
}
