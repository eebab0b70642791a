//! Machine transport over the machine agent's HTTPS API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use super::http::{PinnedClients, check_status, join_url, send_error};
use super::{Endpoint, ProviderConfig, ServerFacts, ServerTransport, TransportError};
use crate::tls::CertificateStore;

const FACTS_PATH: &str = "/1.0/system/facts";
const PROVIDER_PATH: &str = "/1.0/system/provider";
const FACTORY_RESET_PATH: &str = "/1.0/system/factory-reset";

#[derive(Serialize)]
struct FactoryResetBody<'a> {
    /// Registration token the machine uses after the wipe.
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
    operations_center_url: &'a str,
}

/// [`ServerTransport`] speaking to a machine's agent with pinned mutual TLS.
#[derive(Clone)]
pub struct HttpServerTransport {
    clients: PinnedClients,
    public_url: String,
}

impl HttpServerTransport {
    pub fn new(identity: CertificateStore, timeout: Duration, public_url: String) -> Self {
        Self {
            clients: PinnedClients::new(identity, timeout),
            public_url,
        }
    }
}

#[async_trait]
impl ServerTransport for HttpServerTransport {
    async fn probe(&self, target: &Endpoint) -> Result<ServerFacts, TransportError> {
        let client = self.clients.client_for(&target.certificate)?;
        let resp = client
            .get(join_url(&target.connection_url, FACTS_PATH))
            .send()
            .await
            .map_err(|e| send_error(&e, self.clients.timeout()))?;
        check_status(&resp)?;
        resp.json()
            .await
            .map_err(|e| TransportError::Rejected(format!("facts: {e}")))
    }

    async fn push_config(
        &self,
        target: &Endpoint,
        config: &ProviderConfig,
    ) -> Result<(), TransportError> {
        let client = self.clients.client_for(&target.certificate)?;
        let resp = client
            .put(join_url(&target.connection_url, PROVIDER_PATH))
            .json(config)
            .send()
            .await
            .map_err(|e| send_error(&e, self.clients.timeout()))?;
        check_status(&resp)
    }

    async fn factory_reset(
        &self,
        target: &Endpoint,
        token: Option<&str>,
    ) -> Result<(), TransportError> {
        let client = self.clients.client_for(&target.certificate)?;
        let body = FactoryResetBody {
            token,
            operations_center_url: &self.public_url,
        };
        let resp = client
            .post(join_url(&target.connection_url, FACTORY_RESET_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(&e, self.clients.timeout()))?;
        check_status(&resp)
    }
}
