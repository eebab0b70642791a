//! Cluster lifecycle: creation, guarded edits, deletion modes and artifacts.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use tracing::{error, info, warn};

use super::inventory::InventoryAggregator;
use super::tokens::TokenLifecycle;
use super::validate::{normalize_json, validate_connection_url, validate_name};
use crate::config_store::ConfigStore;
use crate::error::{FleetError, FleetResult};
use crate::ports::{
    BootstrapRequest, ClusterTransport, Endpoint, Provisioner, ServerTransport, TransportError,
};
use crate::storage::{
    ArtifactDetail, ArtifactFile, ClusterDetail, ClusterStatus, ClusterUpdate, DatabaseError,
    FleetDatabase, NewCluster, Server, ServerStatus,
};

/// How a cluster is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
    /// Only an idle cluster without members.
    Normal,
    /// Remove the cluster and all its servers from the database.
    Force,
    /// Force, then wipe every former member machine.
    FactoryReset,
}

impl DeleteMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "normal" => Some(Self::Normal),
            "force" => Some(Self::Force),
            "factory-reset" => Some(Self::FactoryReset),
            _ => None,
        }
    }
}

/// Operator request to form a cluster.
#[derive(Debug, Clone, Default)]
pub struct ClusterSpec {
    pub name: String,
    /// Empty lets the transport pick the address.
    pub connection_url: String,
    pub members: Vec<String>,
    pub services_config: String,
    pub application_seed_config: String,
    /// Empty selects the configured default channel.
    pub channel: String,
}

/// Partial edit; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct ClusterEdit {
    pub connection_url: Option<String>,
    pub channel: Option<String>,
    pub services_config: Option<String>,
    pub application_seed_config: Option<String>,
}

/// Creates, edits and deletes clusters; owns artifact generation.
#[derive(Clone)]
pub struct ClusterLifecycle {
    db: FleetDatabase,
    config: ConfigStore,
    servers: Arc<dyn ServerTransport>,
    clusters: Arc<dyn ClusterTransport>,
    provisioner: Arc<dyn Provisioner>,
    tokens: TokenLifecycle,
    inventory: InventoryAggregator,
}

impl ClusterLifecycle {
    pub fn new(
        db: FleetDatabase,
        config: ConfigStore,
        servers: Arc<dyn ServerTransport>,
        clusters: Arc<dyn ClusterTransport>,
        provisioner: Arc<dyn Provisioner>,
        tokens: TokenLifecycle,
        inventory: InventoryAggregator,
    ) -> Self {
        Self {
            db,
            config,
            servers,
            clusters,
            provisioner,
            tokens,
            inventory,
        }
    }

    /// Bootstrap a cluster from `Ready` servers and persist it.
    ///
    /// Nothing is stored if the transport fails. Artifact generation runs
    /// afterwards and its failure does not undo the cluster.
    pub async fn create(&self, spec: &ClusterSpec) -> FleetResult<ClusterDetail> {
        validate_name("cluster", &spec.name)?;
        if !spec.connection_url.is_empty() {
            validate_connection_url(&spec.connection_url)?;
        }
        let services_config = normalize_json("services_config", &spec.services_config)?;
        let seed_config = normalize_json("application_seed_config", &spec.application_seed_config)?;
        let members = self.validate_members(&spec.members).await?;

        match self.db.get_cluster(&spec.name).await {
            Ok(_) => {
                return Err(FleetError::Conflict(format!(
                    "Cluster {} already exists",
                    spec.name
                )));
            }
            Err(DatabaseError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let config = self.config.snapshot();
        let channel = if spec.channel.is_empty() {
            config.default_channel.clone()
        } else {
            spec.channel.clone()
        };

        let request = BootstrapRequest {
            name: spec.name.clone(),
            connection_url: spec.connection_url.clone(),
            members: members.iter().map(Endpoint::from).collect(),
            services_config: services_config.clone(),
            application_seed_config: seed_config.clone(),
        };
        let timeout = Duration::from_secs(config.transport_timeout_secs);
        let identity = tokio::time::timeout(timeout, self.clusters.bootstrap(&request))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
            .inspect_err(|e| warn!(cluster = %spec.name, error = %e, "Cluster bootstrap failed"))?;

        let connection_url = if spec.connection_url.is_empty() {
            identity.connection_url.as_str()
        } else {
            spec.connection_url.as_str()
        };
        let new_cluster = NewCluster {
            name: &spec.name,
            connection_url,
            channel: &channel,
            certificate: &identity.certificate,
            fingerprint: &identity.fingerprint,
            services_config: &services_config,
            application_seed_config: &seed_config,
            status: ClusterStatus::Ready,
        };
        let detail = self.db.create_cluster(&new_cluster, &spec.members).await?;
        info!(cluster = %spec.name, members = detail.members.len(), "Cluster created");

        if let Err(e) = self.materialize(&detail).await {
            error!(cluster = %spec.name, error = %e, "Artifact generation failed; regenerate later");
        }
        Ok(detail)
    }

    async fn validate_members(&self, names: &[String]) -> FleetResult<Vec<Server>> {
        if names.is_empty() {
            return Err(FleetError::InvalidArgument(
                "a cluster needs at least one member".into(),
            ));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = names.iter().find(|n| !seen.insert(n.as_str())) {
            return Err(FleetError::InvalidArgument(format!(
                "server {dup} listed twice"
            )));
        }

        let mut members = Vec::with_capacity(names.len());
        for name in names {
            let server = self.db.get_server(name).await?;
            if server.status() != ServerStatus::Ready {
                return Err(FleetError::InvalidArgument(format!(
                    "server {name} is {}, not ready",
                    server.status
                )));
            }
            if let Some(cluster) = &server.cluster {
                return Err(FleetError::Conflict(format!(
                    "server {name} already belongs to cluster {cluster}"
                )));
            }
            members.push(server);
        }
        Ok(members)
    }

    pub async fn list(&self, status: Option<ClusterStatus>) -> FleetResult<Vec<ClusterDetail>> {
        Ok(self.db.list_clusters(status).await?)
    }

    pub async fn get(&self, name: &str) -> FleetResult<ClusterDetail> {
        Ok(self.db.get_cluster_detail(name).await?)
    }

    pub async fn update(
        &self,
        name: &str,
        edit: &ClusterEdit,
        if_match: Option<&str>,
    ) -> FleetResult<ClusterDetail> {
        if let Some(url) = &edit.connection_url {
            validate_connection_url(url)?;
        }
        if edit.channel.as_deref().is_some_and(str::is_empty) {
            return Err(FleetError::InvalidArgument("channel must not be empty".into()));
        }
        let services = edit
            .services_config
            .as_deref()
            .map(|s| normalize_json("services_config", s))
            .transpose()?;
        let seed = edit
            .application_seed_config
            .as_deref()
            .map(|s| normalize_json("application_seed_config", s))
            .transpose()?;

        let update = ClusterUpdate {
            connection_url: edit.connection_url.as_deref(),
            channel: edit.channel.as_deref(),
            services_config: services.as_deref(),
            application_seed_config: seed.as_deref(),
        };
        let detail = self.db.update_cluster(name, &update, if_match).await?;
        info!(cluster = %name, "Cluster updated");
        Ok(detail)
    }

    pub async fn update_certificate(
        &self,
        name: &str,
        certificate_pem: &str,
        if_match: Option<&str>,
    ) -> FleetResult<ClusterDetail> {
        let fingerprint = opscenter_crypto::certificate_fingerprint(certificate_pem)
            .map_err(|e| FleetError::InvalidArgument(e.to_string()))?;
        let detail = self
            .db
            .update_cluster_certificate(name, certificate_pem, &fingerprint, if_match)
            .await?;
        info!(cluster = %name, fingerprint = %fingerprint, "Cluster certificate updated");
        Ok(detail)
    }

    pub async fn rename(
        &self,
        name: &str,
        new_name: &str,
        if_match: Option<&str>,
    ) -> FleetResult<ClusterDetail> {
        validate_name("cluster", new_name)?;
        let detail = self.db.rename_cluster(name, new_name, if_match).await?;
        info!(cluster = %name, new_name, "Cluster renamed");
        Ok(detail)
    }

    /// Remove a cluster in the given mode, returning the removed servers.
    ///
    /// Factory reset is irreversible: records are gone before machines are
    /// contacted, and failed resets are reported but not rolled back.
    pub async fn delete(
        &self,
        name: &str,
        mode: DeleteMode,
        reseed_tokens: bool,
    ) -> FleetResult<Vec<String>> {
        match mode {
            DeleteMode::Normal => {
                self.db.delete_cluster_if_unused(name).await?;
                info!(cluster = %name, "Cluster deleted");
                Ok(Vec::new())
            }
            DeleteMode::Force => {
                let removed = self.db.delete_cluster_with_members(name).await?;
                info!(cluster = %name, servers = removed.len(), "Cluster force-deleted");
                Ok(removed.into_iter().map(|s| s.name).collect())
            }
            DeleteMode::FactoryReset => {
                let removed = self.db.delete_cluster_with_members(name).await?;
                info!(cluster = %name, servers = removed.len(), "Cluster removed for factory reset");
                self.factory_reset_all(name, &removed, reseed_tokens).await?;
                Ok(removed.into_iter().map(|s| s.name).collect())
            }
        }
    }

    async fn factory_reset_all(
        &self,
        cluster: &str,
        servers: &[Server],
        reseed_tokens: bool,
    ) -> FleetResult<()> {
        let config = self.config.snapshot();
        let timeout = Duration::from_secs(config.transport_timeout_secs);

        let failures: Vec<String> = stream::iter(servers.iter().cloned())
            .map(|server| async move {
                self.factory_reset_one(cluster, &server, reseed_tokens, timeout)
                    .await
                    .err()
                    .map(|e| format!("{}: {e}", server.name))
            })
            .buffer_unordered(config.probe.concurrency)
            .filter_map(|failure| async move { failure })
            .collect()
            .await;

        if failures.is_empty() {
            info!(cluster, servers = servers.len(), "Factory reset issued to all members");
            return Ok(());
        }
        warn!(cluster, failed = failures.len(), "Factory reset partially failed");
        Err(FleetError::Unavailable(format!(
            "factory reset failed for {}",
            failures.join("; ")
        )))
    }

    async fn factory_reset_one(
        &self,
        cluster: &str,
        server: &Server,
        reseed_token: bool,
        timeout: Duration,
    ) -> FleetResult<()> {
        let token = if reseed_token {
            let description = format!("Factory reset of {} from cluster {cluster}", server.name);
            Some(self.tokens.seed(&description).await?.uuid)
        } else {
            None
        };
        let endpoint = Endpoint::from(server);
        tokio::time::timeout(
            timeout,
            self.servers.factory_reset(&endpoint, token.as_deref()),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;
        info!(cluster, server = %server.name, "Factory reset issued");
        Ok(())
    }

    /// Refresh the cluster's aggregated inventory now.
    pub async fn resync_inventory(&self, name: &str) -> FleetResult<usize> {
        self.inventory.resync(name).await
    }

    // =========================================================================
    // Artifacts
    // =========================================================================

    pub async fn list_artifacts(&self, cluster: &str) -> FleetResult<Vec<ArtifactDetail>> {
        self.db.get_cluster(cluster).await?;
        Ok(self.db.list_artifacts(cluster).await?)
    }

    pub async fn get_artifact(&self, cluster: &str, name: &str) -> FleetResult<ArtifactDetail> {
        Ok(self.db.get_artifact(cluster, name).await?)
    }

    pub async fn open_artifact_file(
        &self,
        cluster: &str,
        artifact: &str,
        file: &str,
    ) -> FleetResult<ArtifactFile> {
        Ok(self.db.get_artifact_file(cluster, artifact, file).await?)
    }

    /// Re-run artifact generation for an existing cluster.
    pub async fn regenerate_artifacts(&self, cluster: &str) -> FleetResult<Vec<ArtifactDetail>> {
        let detail = self.db.get_cluster_detail(cluster).await?;
        self.materialize(&detail).await?;
        Ok(self.db.list_artifacts(cluster).await?)
    }

    async fn materialize(&self, detail: &ClusterDetail) -> FleetResult<usize> {
        let artifacts = self
            .provisioner
            .materialize(detail)
            .await
            .map_err(|e| FleetError::Internal(e.to_string()))?;
        for artifact in &artifacts {
            self.db
                .replace_artifact(&detail.cluster.name, artifact)
                .await?;
        }
        info!(cluster = %detail.cluster.name, artifacts = artifacts.len(), "Artifacts generated");
        Ok(artifacts.len())
    }
}
