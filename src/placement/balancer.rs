//! Capacity Balancer
//!
//! Background task that periodically re-stats every storage target and
//! re-sorts the placement order. Targets are contacted with no placement
//! lock held; only the final update takes the write lock.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::service::{PlacementService, StatTarget};
use crate::domain::ports::{ConnectionPool, StorageStat};
use crate::error::Result;
use crate::metrics;

/// Periodic capacity refresh for a [`PlacementService`]
pub struct CapacityBalancer {
    placement: Arc<PlacementService>,
    pool: Arc<dyn ConnectionPool>,
    interval: Duration,
}

impl CapacityBalancer {
    pub fn new(
        placement: Arc<PlacementService>,
        pool: Arc<dyn ConnectionPool>,
        interval: Duration,
    ) -> Self {
        Self {
            placement,
            pool,
            interval,
        }
    }

    /// Run balancing passes until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting capacity balancer every {:?}", self.interval);

        let mut tick = interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Capacity balancer shutting down");
                    break;
                }
                _ = tick.tick() => {
                    if let Err(e) = self.balance_once().await {
                        error!("Capacity balancing failed: {}", e);
                    }
                }
            }
        }
    }

    /// Stat every target concurrently and apply the results
    ///
    /// A target that cannot be reached is recorded with no free capacity.
    /// Returns the number of targets that answered.
    #[instrument(skip(self))]
    pub async fn balance_once(&self) -> Result<usize> {
        let targets = self.placement.stat_targets();
        let results = join_all(targets.into_iter().map(|target| self.stat_target(target))).await;

        let answered = results.iter().filter(|(_, stat)| stat.is_some()).count();
        let stats: Vec<(StatTarget, StorageStat)> = results
            .into_iter()
            .map(|(target, stat)| (target, stat.unwrap_or_else(StorageStat::unavailable)))
            .collect();
        self.placement.apply_stats(&stats);
        metrics::BALANCE_PASSES.inc();

        debug!(targets = stats.len(), answered, "balancing pass complete");
        Ok(answered)
    }

    async fn stat_target(&self, target: StatTarget) -> (StatTarget, Option<StorageStat>) {
        let host = target.2.host.clone();
        let sid = target.2.sid;

        let result = match self.pool.get_or_connect(&host).await {
            Ok(node) => node.stat(sid).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(stat) => (target, Some(stat)),
            Err(e) => {
                warn!(%host, %sid, error = %e, "stat failed, marking target full");
                self.pool.discard(&host);
                (target, None)
            }
        }
    }
}
