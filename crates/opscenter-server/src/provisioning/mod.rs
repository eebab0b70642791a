//! Fleet lifecycle engine.
//!
//! Token, server and cluster lifecycles plus the inventory aggregator and
//! update catalog. Everything here talks to machines only through the
//! capability ports in [`crate::ports`].

pub mod clusters;
pub mod inventory;
pub mod servers;
pub mod tokens;
pub mod updates;
mod validate;

pub use clusters::{ClusterEdit, ClusterLifecycle, ClusterSpec, DeleteMode};
pub use inventory::{InventoryAggregator, ResyncSummary};
pub use servers::{ProbeSummary, Registration, SelfReport, ServerLifecycle};
pub use tokens::TokenLifecycle;
pub use updates::UpdateCatalog;

use std::sync::Arc;

use crate::config_store::ConfigStore;
use crate::ports::{ClusterTransport, Provisioner, ServerTransport, UpdateSource};
use crate::storage::FleetDatabase;
use crate::tls::CertificateStore;

/// Every lifecycle component, wired to one database and one set of ports.
#[derive(Clone)]
pub struct Fleet {
    pub tokens: TokenLifecycle,
    pub servers: ServerLifecycle,
    pub clusters: ClusterLifecycle,
    pub inventory: InventoryAggregator,
    pub updates: UpdateCatalog,
}

/// The external capabilities the lifecycle depends on.
#[derive(Clone)]
pub struct Ports {
    pub server_transport: Arc<dyn ServerTransport>,
    pub cluster_transport: Arc<dyn ClusterTransport>,
    pub provisioner: Arc<dyn Provisioner>,
    pub update_source: Option<Arc<dyn UpdateSource>>,
}

impl Fleet {
    pub fn new(
        db: FleetDatabase,
        config: ConfigStore,
        identity: CertificateStore,
        ports: Ports,
    ) -> Self {
        let updates = UpdateCatalog::new(ports.update_source);
        let tokens = TokenLifecycle::new(db.clone(), config.clone());
        let inventory = InventoryAggregator::new(
            db.clone(),
            config.clone(),
            Arc::clone(&ports.cluster_transport),
        );
        let servers = ServerLifecycle::new(
            db.clone(),
            config.clone(),
            identity,
            Arc::clone(&ports.server_transport),
            updates.clone(),
        );
        let clusters = ClusterLifecycle::new(
            db,
            config,
            ports.server_transport,
            ports.cluster_transport,
            ports.provisioner,
            tokens.clone(),
            inventory.clone(),
        );
        Self {
            tokens,
            servers,
            clusters,
            inventory,
            updates,
        }
    }
}
