//! In-memory catalog of the latest published releases.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::FleetResult;
use crate::ports::{UpdateRelease, UpdateSource};

/// Releases known from the last successful refresh.
#[derive(Clone)]
pub struct UpdateCatalog {
    source: Option<Arc<dyn UpdateSource>>,
    releases: Arc<RwLock<Vec<UpdateRelease>>>,
}

impl UpdateCatalog {
    /// `None` disables refresh; the catalog then stays empty.
    pub fn new(source: Option<Arc<dyn UpdateSource>>) -> Self {
        Self {
            source,
            releases: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Replace the catalog with the source's current list.
    ///
    /// A failed fetch keeps the previous catalog.
    pub async fn refresh(&self) -> FleetResult<usize> {
        let Some(source) = &self.source else {
            debug!("No update source configured");
            return Ok(0);
        };
        let releases = source.releases().await?;
        let count = releases.len();
        *self.releases.write().await = releases;
        info!(releases = count, "Update catalog refreshed");
        Ok(count)
    }

    /// Newest release on `channel` by publication time.
    pub async fn latest(&self, channel: &str) -> Option<UpdateRelease> {
        self.releases
            .read()
            .await
            .iter()
            .filter(|r| r.channel == channel)
            .max_by_key(|r| r.published_at)
            .cloned()
    }
}
