//! The reconciliation jobs run by the scheduler.

use std::sync::Arc;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::task::Job;
use crate::provisioning::Fleet;

pub const UPDATE_REFRESH: &str = "update-refresh";
pub const PENDING_PROBE: &str = "pending-probe";
pub const READY_PROBE: &str = "ready-probe";
pub const INVENTORY_RESYNC: &str = "inventory-resync";

pub fn update_refresh(fleet: Fleet) -> Job {
    Arc::new(move |_cancel: CancellationToken| {
        let fleet = fleet.clone();
        async move {
            fleet.updates.refresh().await?;
            Ok(())
        }
        .boxed()
    })
}

pub fn pending_probe(fleet: Fleet) -> Job {
    Arc::new(move |cancel: CancellationToken| {
        let fleet = fleet.clone();
        async move {
            let summary = fleet.servers.probe_pending(&cancel).await?;
            if summary.probed > 0 {
                info!(
                    probed = summary.probed,
                    ready = summary.reachable,
                    cancelled = summary.cancelled,
                    "Pending servers probed"
                );
            }
            Ok(())
        }
        .boxed()
    })
}

pub fn ready_probe(fleet: Fleet) -> Job {
    Arc::new(move |cancel: CancellationToken| {
        let fleet = fleet.clone();
        async move {
            let summary = fleet.servers.probe_ready(&cancel).await?;
            info!(
                probed = summary.probed,
                reachable = summary.reachable,
                failed = summary.failed,
                pushed = summary.pushed,
                cancelled = summary.cancelled,
                "Ready servers probed"
            );
            Ok(())
        }
        .boxed()
    })
}

pub fn inventory_resync(fleet: Fleet) -> Job {
    Arc::new(move |cancel: CancellationToken| {
        let fleet = fleet.clone();
        async move {
            fleet.inventory.resync_all(&cancel).await?;
            Ok(())
        }
        .boxed()
    })
}
