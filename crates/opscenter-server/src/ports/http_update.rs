//! Update source reading a static release index.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use super::http::{check_status, join_url, send_error};
use super::{TransportError, UpdateRelease, UpdateSource};

const INDEX_PATH: &str = "/index.json";

#[derive(Deserialize)]
struct ReleaseIndex {
    #[serde(default)]
    releases: Vec<UpdateRelease>,
}

/// [`UpdateSource`] fetching `{base_url}/index.json` over the system trust store.
#[derive(Debug, Clone)]
pub struct HttpUpdateSource {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpUpdateSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        // reqwest is built with rustls-no-provider; Err means already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Rejected(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }
}

#[async_trait]
impl UpdateSource for HttpUpdateSource {
    async fn releases(&self) -> Result<Vec<UpdateRelease>, TransportError> {
        let resp = self
            .http
            .get(join_url(&self.base_url, INDEX_PATH))
            .send()
            .await
            .map_err(|e| send_error(&e, self.timeout))?;
        check_status(&resp)?;
        let index: ReleaseIndex = resp
            .json()
            .await
            .map_err(|e| TransportError::Rejected(format!("release index: {e}")))?;
        Ok(index.releases)
    }
}
