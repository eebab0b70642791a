//! Capability ports consumed by the fleet lifecycle, plus reference adapters.
//!
//! The lifecycle code only ever sees the traits in this module; the HTTP and
//! Terraform adapters are the minimal implementations the binary wires in.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::storage::{ClusterDetail, NewArtifact, NewInventoryRecord, Server};

mod http;
mod http_cluster;
mod http_server;
mod http_update;
mod terraform;

pub use http_cluster::HttpClusterTransport;
pub use http_server::HttpServerTransport;
pub use http_update::HttpUpdateSource;
pub use terraform::TerraformProvisioner;

/// Failure talking to a remote machine or cluster.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established or was dropped.
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The remote end answered but refused or failed the request.
    #[error("rejected: {0}")]
    Rejected(String),
}

/// Failure rendering infrastructure-as-code artifacts.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionerError {
    #[error("render failed: {0}")]
    Render(String),
}

/// A remote endpoint and the certificate it must present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub connection_url: String,
    /// PEM certificate the peer is pinned to.
    pub certificate: String,
}

impl From<&Server> for Endpoint {
    fn from(server: &Server) -> Self {
        Self {
            name: server.name.clone(),
            connection_url: server.connection_url.clone(),
            certificate: server.certificate.clone(),
        }
    }
}

/// Opaque facts a machine reports about itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerFacts {
    #[serde(default)]
    pub hardware: serde_json::Value,
    #[serde(default)]
    pub os: serde_json::Value,
    #[serde(default)]
    pub version: serde_json::Value,
}

/// Provider configuration pushed to ready machines.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub operations_center_url: String,
    pub operations_center_certificate: String,
    pub update_channel: String,
    pub update_version: Option<String>,
}

impl ProviderConfig {
    /// Stable content hash, compared against the last pushed hash.
    pub fn content_hash(&self) -> String {
        crate::storage::etag::content_hash(&[
            &self.operations_center_url,
            &self.operations_center_certificate,
            &self.update_channel,
            self.update_version.as_deref().unwrap_or_default(),
        ])
    }
}

/// Input to a cluster bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub name: String,
    /// Requested cluster address; empty lets the transport choose.
    pub connection_url: String,
    /// Members in join order; the first one bootstraps the cluster.
    pub members: Vec<Endpoint>,
    pub services_config: String,
    pub application_seed_config: String,
}

/// Identity of a freshly bootstrapped cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub connection_url: String,
    pub certificate: String,
    pub fingerprint: String,
}

/// One release advertised by the update source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRelease {
    pub channel: String,
    pub version: String,
    /// Unix seconds.
    pub published_at: i64,
}

/// Authenticated actions against a single machine.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    /// Connectivity probe; returns the machine's current facts.
    async fn probe(&self, target: &Endpoint) -> Result<ServerFacts, TransportError>;

    async fn push_config(
        &self,
        target: &Endpoint,
        config: &ProviderConfig,
    ) -> Result<(), TransportError>;

    /// Wipe the machine. `token` lets it re-register afterwards.
    async fn factory_reset(
        &self,
        target: &Endpoint,
        token: Option<&str>,
    ) -> Result<(), TransportError>;
}

/// Cluster-level actions.
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn bootstrap(&self, request: &BootstrapRequest)
    -> Result<ClusterIdentity, TransportError>;

    async fn fetch_inventory(
        &self,
        cluster: &Endpoint,
    ) -> Result<Vec<NewInventoryRecord>, TransportError>;
}

/// Infrastructure-as-code rendering of a cluster.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn materialize(
        &self,
        cluster: &ClusterDetail,
    ) -> Result<Vec<NewArtifact>, ProvisionerError>;
}

/// Source of published releases.
#[async_trait]
pub trait UpdateSource: Send + Sync {
    async fn releases(&self) -> Result<Vec<UpdateRelease>, TransportError>;
}
