//! Server lifecycle: bootstrap registration, self-update and reconciliation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::stream;
use opscenter_core::Config;
use opscenter_core::db::unix_timestamp;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::updates::UpdateCatalog;
use super::validate::{normalize_json, validate_connection_url, validate_name};
use crate::config_store::ConfigStore;
use crate::error::{FleetError, FleetResult};
use crate::ports::{Endpoint, ProviderConfig, ServerFacts, ServerTransport, TransportError};
use crate::storage::{
    DatabaseError, FleetDatabase, NewServer, ProbedFacts, SelfUpdate, Server, ServerFilter,
    ServerStatus, ServerType,
};
use crate::tls::CertificateStore;

const REGISTRATION_DENIED: &str = "Registration denied";

/// What a machine sends to join the fleet.
#[derive(Debug, Clone)]
pub struct Registration {
    pub name: String,
    pub connection_url: String,
    pub server_type: String,
    /// Token reference, a UUID.
    pub token: String,
}

/// Fields a machine may report about itself; `None` keeps the stored value.
#[derive(Debug, Clone, Default)]
pub struct SelfReport {
    /// When set, must equal the name bound to the caller's certificate.
    pub name: Option<String>,
    pub connection_url: Option<String>,
    pub hardware_data: Option<String>,
    pub os_data: Option<String>,
    pub version_data: Option<String>,
}

/// Tally of one probe round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeSummary {
    pub probed: usize,
    pub reachable: usize,
    pub failed: usize,
    pub pushed: usize,
    /// The round was cancelled before every probe finished.
    pub cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    Reachable { pushed: bool },
    Failed,
}

/// Registration, self-update, admin edits and probe rounds for servers.
#[derive(Clone)]
pub struct ServerLifecycle {
    db: FleetDatabase,
    config: ConfigStore,
    identity: CertificateStore,
    transport: Arc<dyn ServerTransport>,
    updates: UpdateCatalog,
}

impl ServerLifecycle {
    pub fn new(
        db: FleetDatabase,
        config: ConfigStore,
        identity: CertificateStore,
        transport: Arc<dyn ServerTransport>,
        updates: UpdateCatalog,
    ) -> Self {
        Self {
            db,
            config,
            identity,
            transport,
            updates,
        }
    }

    // =========================================================================
    // Bootstrap protocol
    // =========================================================================

    /// Register a machine presenting `peer_certificate_pem`.
    ///
    /// Returns the new server and the control plane certificate the machine
    /// should trust in return. Every token or uniqueness failure is reported
    /// as the same `Forbidden`.
    pub async fn register(
        &self,
        peer_certificate_pem: Option<&str>,
        request: &Registration,
    ) -> FleetResult<(Server, String)> {
        validate_name("server", &request.name)?;
        validate_connection_url(&request.connection_url)?;
        let server_type = ServerType::parse(&request.server_type).ok_or_else(|| {
            FleetError::InvalidArgument(format!("unknown server type {:?}", request.server_type))
        })?;

        let Some(certificate) = peer_certificate_pem else {
            warn!(server = %request.name, "Registration without client certificate");
            return Err(FleetError::Forbidden(REGISTRATION_DENIED.into()));
        };
        let fingerprint = opscenter_crypto::certificate_fingerprint(certificate).map_err(|e| {
            warn!(server = %request.name, error = %e, "Unparseable client certificate");
            FleetError::Forbidden(REGISTRATION_DENIED.into())
        })?;

        if uuid::Uuid::parse_str(&request.token).is_err() {
            warn!(server = %request.name, "Malformed registration token");
            return Err(FleetError::Forbidden(REGISTRATION_DENIED.into()));
        }

        let new_server = NewServer {
            name: &request.name,
            server_type,
            connection_url: &request.connection_url,
            certificate,
            certificate_fingerprint: &fingerprint,
        };
        let server = match self
            .db
            .register_server(&request.token, &new_server, unix_timestamp())
            .await
        {
            Ok(server) => server,
            Err(e @ (DatabaseError::NotFound(_) | DatabaseError::Conflict(_))) => {
                warn!(server = %request.name, error = %e, "Registration rejected");
                return Err(FleetError::Forbidden(REGISTRATION_DENIED.into()));
            }
            Err(e) => return Err(e.into()),
        };

        info!(server = %server.name, fingerprint = %fingerprint, "Server registered");
        Ok((server, self.identity.current().cert_pem.clone()))
    }

    /// Apply a machine's report about itself.
    ///
    /// The caller is identified only by its certificate fingerprint; nothing
    /// is looked up by name before that match succeeds.
    pub async fn self_update(
        &self,
        peer_fingerprint: Option<&str>,
        report: &SelfReport,
    ) -> FleetResult<Server> {
        let Some(fingerprint) = peer_fingerprint else {
            return Err(FleetError::Forbidden("Client certificate required".into()));
        };
        let Some(server) = self.db.get_server_by_fingerprint(fingerprint).await? else {
            debug!(fingerprint, "Self-update from unknown certificate");
            return Err(FleetError::Forbidden("Unknown certificate".into()));
        };
        if report.name.as_deref().is_some_and(|n| n != server.name) {
            warn!(server = %server.name, claimed = ?report.name, "Self-update name mismatch");
            return Err(FleetError::Forbidden("Unknown certificate".into()));
        }

        if let Some(url) = &report.connection_url {
            validate_connection_url(url)?;
        }
        let hardware = report
            .hardware_data
            .as_deref()
            .map(|s| normalize_json("hardware_data", s))
            .transpose()?;
        let os = report
            .os_data
            .as_deref()
            .map(|s| normalize_json("os_data", s))
            .transpose()?;
        let version = report
            .version_data
            .as_deref()
            .map(|s| normalize_json("version_data", s))
            .transpose()?;

        let update = SelfUpdate {
            connection_url: report.connection_url.as_deref(),
            hardware_data: hardware.as_deref(),
            os_data: os.as_deref(),
            version_data: version.as_deref(),
        };
        let updated = self.db.update_server_self(&server.name, &update).await?;
        debug!(server = %updated.name, "Server self-updated");
        Ok(updated)
    }

    // =========================================================================
    // Administrative operations
    // =========================================================================

    pub async fn list(&self, filter: &ServerFilter) -> FleetResult<Vec<Server>> {
        Ok(self.db.list_servers(filter).await?)
    }

    pub async fn get(&self, name: &str) -> FleetResult<Server> {
        Ok(self.db.get_server(name).await?)
    }

    pub async fn update(
        &self,
        name: &str,
        connection_url: &str,
        if_match: Option<&str>,
    ) -> FleetResult<Server> {
        validate_connection_url(connection_url)?;
        let server = self
            .db
            .update_server_connection_url(name, connection_url, if_match)
            .await?;
        info!(server = %name, connection_url, "Server updated");
        Ok(server)
    }

    pub async fn rename(
        &self,
        name: &str,
        new_name: &str,
        if_match: Option<&str>,
    ) -> FleetResult<Server> {
        validate_name("server", new_name)?;
        let server = self.db.rename_server(name, new_name, if_match).await?;
        info!(server = %name, new_name, "Server renamed");
        Ok(server)
    }

    /// Remove a server that belongs to no cluster.
    pub async fn delete(&self, name: &str) -> FleetResult<()> {
        self.db.delete_unclustered_server(name).await?;
        info!(server = %name, "Server deleted");
        Ok(())
    }

    /// Probe one server now and apply the result.
    pub async fn resync(&self, name: &str) -> FleetResult<Server> {
        let server = self.db.get_server(name).await?;
        let config = self.config.snapshot();
        let timeout = Duration::from_secs(config.probe.timeout_secs);
        match self.probe(&server, timeout).await {
            Ok(facts) => {
                self.record_success(&server, &facts).await?;
            }
            Err(e) => {
                self.record_failure(&server, &e).await?;
            }
        }
        Ok(self.db.get_server(name).await?)
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Probe every `Pending` server.
    pub async fn probe_pending(&self, cancel: &CancellationToken) -> FleetResult<ProbeSummary> {
        self.probe_round(&[ServerStatus::Pending], false, cancel)
            .await
    }

    /// Probe every `Ready`/`Unreachable` server and push outdated config.
    pub async fn probe_ready(&self, cancel: &CancellationToken) -> FleetResult<ProbeSummary> {
        self.probe_round(&[ServerStatus::Ready, ServerStatus::Unreachable], true, cancel)
            .await
    }

    async fn probe_round(
        &self,
        statuses: &[ServerStatus],
        push: bool,
        cancel: &CancellationToken,
    ) -> FleetResult<ProbeSummary> {
        let config = self.config.snapshot();
        let mut servers = Vec::new();
        for status in statuses {
            let filter = ServerFilter {
                status: Some(*status),
                ..ServerFilter::default()
            };
            servers.extend(self.db.list_servers(&filter).await?);
        }

        let channels = if push {
            self.cluster_channels().await?
        } else {
            HashMap::new()
        };
        let timeout = Duration::from_secs(config.probe.timeout_secs);

        let mut summary = ProbeSummary {
            probed: servers.len(),
            ..ProbeSummary::default()
        };
        let probes = stream::iter(servers)
            .map(|server| {
                let config = &config;
                let channels = &channels;
                async move {
                    self.probe_and_record(&server, timeout, push, config, channels)
                        .await
                }
            })
            .buffer_unordered(config.probe.concurrency);
        let mut probes = std::pin::pin!(probes);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                next = probes.next() => match next {
                    Some(ProbeOutcome::Reachable { pushed }) => {
                        summary.reachable += 1;
                        summary.pushed += usize::from(pushed);
                    }
                    Some(ProbeOutcome::Failed) => summary.failed += 1,
                    None => break,
                },
            }
        }

        Ok(summary)
    }

    async fn probe_and_record(
        &self,
        server: &Server,
        timeout: Duration,
        push: bool,
        config: &Config,
        channels: &HashMap<String, String>,
    ) -> ProbeOutcome {
        let facts = match self.probe(server, timeout).await {
            Ok(facts) => facts,
            Err(e) => {
                if let Err(db_err) = self.record_failure(server, &e).await {
                    warn!(server = %server.name, error = %db_err, "Failed to record probe failure");
                }
                return ProbeOutcome::Failed;
            }
        };

        if let Err(e) = self.record_success(server, &facts).await {
            warn!(server = %server.name, error = %e, "Failed to record probe result");
            return ProbeOutcome::Failed;
        }

        let pushed = push && self.push_config_if_due(server, config, channels).await;
        ProbeOutcome::Reachable { pushed }
    }

    async fn probe(&self, server: &Server, timeout: Duration) -> Result<ServerFacts, TransportError> {
        let endpoint = Endpoint::from(server);
        tokio::time::timeout(timeout, self.transport.probe(&endpoint))
            .await
            .map_err(|_| TransportError::Timeout(timeout))?
    }

    async fn record_success(&self, server: &Server, facts: &ServerFacts) -> FleetResult<()> {
        let hardware = facts.hardware.to_string();
        let os = facts.os.to_string();
        let version = facts.version.to_string();
        let probed = ProbedFacts {
            hardware_data: &hardware,
            os_data: &os,
            version_data: &version,
        };
        self.db
            .record_probe_success(&server.name, &probed, unix_timestamp())
            .await?;
        if server.status() != ServerStatus::Ready {
            info!(server = %server.name, from = server.status().as_str(), "Server is ready");
        }
        Ok(())
    }

    async fn record_failure(&self, server: &Server, error: &TransportError) -> FleetResult<()> {
        let demoted = self
            .db
            .record_probe_failure(&server.name, unix_timestamp())
            .await?;
        if demoted {
            warn!(server = %server.name, error = %error, "Server became unreachable");
        } else {
            debug!(server = %server.name, error = %error, "Probe failed");
        }
        Ok(())
    }

    async fn cluster_channels(&self) -> FleetResult<HashMap<String, String>> {
        Ok(self
            .db
            .list_clusters(None)
            .await?
            .into_iter()
            .map(|detail| (detail.cluster.name, detail.cluster.channel))
            .collect())
    }

    /// Configuration a server should currently run with.
    pub async fn desired_config(&self, config: &Config, channel: &str) -> ProviderConfig {
        ProviderConfig {
            operations_center_url: config.public_url.clone(),
            operations_center_certificate: self.identity.current().cert_pem.clone(),
            update_channel: channel.to_string(),
            update_version: self.updates.latest(channel).await.map(|r| r.version),
        }
    }

    /// Push config when it changed and the window is open; true if pushed.
    async fn push_config_if_due(
        &self,
        server: &Server,
        config: &Config,
        channels: &HashMap<String, String>,
    ) -> bool {
        let channel = server
            .cluster
            .as_ref()
            .and_then(|c| channels.get(c))
            .unwrap_or(&config.default_channel);
        let desired = self.desired_config(config, channel).await;
        let hash = desired.content_hash();

        if server.config_hash.as_deref() == Some(hash.as_str()) {
            return false;
        }
        if !config.config_push_window.contains(unix_timestamp()) {
            debug!(server = %server.name, "Config push deferred until window opens");
            return false;
        }

        let endpoint = Endpoint::from(server);
        let timeout = Duration::from_secs(config.transport_timeout_secs);
        let pushed = tokio::time::timeout(timeout, self.transport.push_config(&endpoint, &desired))
            .await
            .map_err(|_| TransportError::Timeout(timeout))
            .and_then(|r| r);
        match pushed {
            Ok(()) => {
                if let Err(e) = self.db.set_server_config_hash(&server.name, &hash).await {
                    warn!(server = %server.name, error = %e, "Failed to record config hash");
                }
                info!(server = %server.name, channel, "Configuration pushed");
                true
            }
            Err(e) => {
                warn!(server = %server.name, error = %e, "Configuration push failed");
                false
            }
        }
    }
}
