//! Cluster transport: bootstrap through the first member, join the rest.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::http::{PinnedClients, check_status, join_url, send_error};
use super::{BootstrapRequest, ClusterIdentity, ClusterTransport, Endpoint, TransportError};
use crate::storage::NewInventoryRecord;
use crate::tls::CertificateStore;

const BOOTSTRAP_PATH: &str = "/1.0/cluster/bootstrap";
const JOIN_PATH: &str = "/1.0/cluster/join";
const INVENTORY_PATH: &str = "/1.0/inventory";

#[derive(Serialize)]
struct BootstrapBody<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    connection_url: &'a str,
    services_config: serde_json::Value,
    application_seed_config: serde_json::Value,
}

#[derive(Deserialize)]
struct BootstrapResponse {
    connection_url: String,
    certificate: String,
}

#[derive(Serialize)]
struct JoinBody<'a> {
    name: &'a str,
    cluster_url: &'a str,
    cluster_certificate: &'a str,
}

/// [`ClusterTransport`] driving member agents over pinned mutual TLS.
#[derive(Clone)]
pub struct HttpClusterTransport {
    clients: PinnedClients,
}

impl HttpClusterTransport {
    pub fn new(identity: CertificateStore, timeout: Duration) -> Self {
        Self {
            clients: PinnedClients::new(identity, timeout),
        }
    }

    async fn post_json<T: Serialize + Sync>(
        &self,
        target: &Endpoint,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response, TransportError> {
        let client = self.clients.client_for(&target.certificate)?;
        let resp = client
            .post(join_url(&target.connection_url, path))
            .json(body)
            .send()
            .await
            .map_err(|e| send_error(&e, self.clients.timeout()))?;
        check_status(&resp)?;
        Ok(resp)
    }
}

fn config_value(raw: &str) -> Result<serde_json::Value, TransportError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| TransportError::Rejected(format!("config: {e}")))
}

#[async_trait]
impl ClusterTransport for HttpClusterTransport {
    async fn bootstrap(
        &self,
        request: &BootstrapRequest,
    ) -> Result<ClusterIdentity, TransportError> {
        let Some((leader, joiners)) = request.members.split_first() else {
            return Err(TransportError::Rejected("cluster has no members".into()));
        };

        let body = BootstrapBody {
            name: &request.name,
            connection_url: &request.connection_url,
            services_config: config_value(&request.services_config)?,
            application_seed_config: config_value(&request.application_seed_config)?,
        };
        let created: BootstrapResponse = self
            .post_json(leader, BOOTSTRAP_PATH, &body)
            .await?
            .json()
            .await
            .map_err(|e| TransportError::Rejected(format!("bootstrap response: {e}")))?;
        info!(cluster = %request.name, leader = %leader.name, "Cluster bootstrapped");

        let fingerprint = opscenter_crypto::certificate_fingerprint(&created.certificate)
            .map_err(|e| TransportError::Rejected(format!("cluster certificate: {e}")))?;

        for member in joiners {
            let join = JoinBody {
                name: &request.name,
                cluster_url: &created.connection_url,
                cluster_certificate: &created.certificate,
            };
            self.post_json(member, JOIN_PATH, &join).await?;
            debug!(cluster = %request.name, member = %member.name, "Member joined");
        }

        Ok(ClusterIdentity {
            connection_url: created.connection_url,
            certificate: created.certificate,
            fingerprint,
        })
    }

    async fn fetch_inventory(
        &self,
        cluster: &Endpoint,
    ) -> Result<Vec<NewInventoryRecord>, TransportError> {
        let client = self.clients.client_for(&cluster.certificate)?;
        let resp = client
            .get(join_url(&cluster.connection_url, INVENTORY_PATH))
            .send()
            .await
            .map_err(|e| send_error(&e, self.clients.timeout()))?;
        check_status(&resp)?;
        resp.json()
            .await
            .map_err(|e| TransportError::Rejected(format!("inventory: {e}")))
    }
}
