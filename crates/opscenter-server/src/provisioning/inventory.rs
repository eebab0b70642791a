//! Read-through projection of cluster inventory.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config_store::ConfigStore;
use crate::error::FleetResult;
use crate::ports::{ClusterTransport, Endpoint, TransportError};
use crate::storage::{ClusterStatus, FleetDatabase, InventoryFilter, InventoryRecord};

/// Outcome of a resync over every cluster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResyncSummary {
    pub synced: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Pulls inventory from clusters and answers filtered queries.
#[derive(Clone)]
pub struct InventoryAggregator {
    db: FleetDatabase,
    config: ConfigStore,
    transport: Arc<dyn ClusterTransport>,
}

impl InventoryAggregator {
    pub fn new(db: FleetDatabase, config: ConfigStore, transport: Arc<dyn ClusterTransport>) -> Self {
        Self {
            db,
            config,
            transport,
        }
    }

    /// Replace `cluster`'s projection with what the cluster reports now.
    ///
    /// Marks the cluster `Ready` on success and `Unknown` when it cannot be
    /// reached. Concurrent resyncs of one cluster are last-write-wins.
    pub async fn resync(&self, cluster: &str) -> FleetResult<usize> {
        let record = self.db.get_cluster(cluster).await?;
        let endpoint = Endpoint {
            name: record.name.clone(),
            connection_url: record.connection_url.clone(),
            certificate: record.certificate.clone(),
        };

        let timeout = Duration::from_secs(self.config.snapshot().transport_timeout_secs);
        let fetched = tokio::time::timeout(timeout, self.transport.fetch_inventory(&endpoint))
            .await
            .map_err(|_| TransportError::Timeout(timeout))
            .and_then(|r| r);
        let records = match fetched {
            Ok(records) => records,
            Err(e) => {
                warn!(cluster, error = %e, "Inventory fetch failed");
                self.db
                    .set_cluster_status(cluster, ClusterStatus::Unknown)
                    .await?;
                return Err(e.into());
            }
        };

        let count = self.db.replace_inventory(cluster, &records).await?;
        if record.status() != ClusterStatus::Ready {
            self.db
                .set_cluster_status(cluster, ClusterStatus::Ready)
                .await?;
        }
        debug!(cluster, records = count, "Inventory resynced");
        Ok(count)
    }

    /// Resync every cluster; one failure does not stop the others.
    pub async fn resync_all(&self, cancel: &CancellationToken) -> FleetResult<ResyncSummary> {
        let clusters = self.db.list_clusters(None).await?;
        let mut summary = ResyncSummary::default();

        for detail in clusters {
            let name = detail.cluster.name;
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                result = self.resync(&name) => match result {
                    Ok(_) => summary.synced += 1,
                    Err(_) => summary.failed += 1,
                },
            }
        }

        info!(synced = summary.synced, failed = summary.failed, "Inventory resync round complete");
        Ok(summary)
    }

    pub async fn query(&self, filter: &InventoryFilter) -> FleetResult<Vec<InventoryRecord>> {
        Ok(self.db.list_inventory(filter).await?)
    }
}
