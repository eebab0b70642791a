//! Runtime configuration handle with atomic reload.

use std::path::PathBuf;
use std::sync::Arc;

use opscenter_core::Config;
use opscenter_core::config::{env_var, load_config_with, resolve};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] opscenter_core::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Shared, swappable configuration snapshot.
///
/// Readers take a cheap `Arc` snapshot per operation; a reload never leaves
/// them with a half-applied config.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    tx: Arc<watch::Sender<Arc<Config>>>,
    source: Source,
}

/// What `reload` rebuilds the snapshot from.
#[derive(Debug, Clone)]
enum Source {
    /// The given file, or the default location when `None`.
    File(Option<PathBuf>),
    /// A fixed base config; only environment overrides are re-read.
    Base(Arc<Config>),
}

impl ConfigStore {
    /// Load from `path` (or the default location) and wrap the result.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = load_config_with(path.as_deref(), env_var)?;
        Ok(Self::with_source(config, Source::File(path)))
    }

    /// A store with no backing file; `reload` re-applies environment
    /// overrides on top of `config`.
    pub fn new(config: Config) -> Self {
        let base = Arc::new(config.clone());
        Self::with_source(config, Source::Base(base))
    }

    fn with_source(config: Config, source: Source) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self {
            tx: Arc::new(tx),
            source,
        }
    }

    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Config>> {
        self.tx.subscribe()
    }

    /// Validate and publish `config`.
    pub fn replace(&self, config: Config) -> Result<(), ConfigError> {
        config
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.tx.send_replace(Arc::new(config));
        Ok(())
    }

    /// Rebuild from the source and the environment. On error the current
    /// snapshot is kept.
    pub fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        self.reload_with(&env_var)
    }

    fn reload_with(
        &self,
        lookup: &dyn Fn(&str) -> Option<String>,
    ) -> Result<Arc<Config>, ConfigError> {
        let loaded = match &self.source {
            Source::File(path) => load_config_with(path.as_deref(), lookup),
            Source::Base(base) => resolve(Config::clone(base), lookup),
        };
        match loaded {
            Ok(config) => {
                let config = Arc::new(config);
                self.tx.send_replace(Arc::clone(&config));
                info!("Configuration reloaded");
                Ok(config)
            }
            Err(e) => {
                warn!(error = %e, "Configuration reload failed, keeping previous");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn write(path: &std::path::Path, body: &str) {
        std::fs::write(path, body).unwrap();
    }

    #[test]
    fn reload_swaps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write(&path, r#"{"default_channel": "stable"}"#);

        let store = ConfigStore::load(Some(path.clone())).unwrap();
        let before = store.snapshot();
        let rx = store.subscribe();

        write(&path, r#"{"default_channel": "edge"}"#);
        store.reload().unwrap();

        assert_eq!(before.default_channel, "stable");
        assert_eq!(store.snapshot().default_channel, "edge");
        assert_eq!(rx.borrow().default_channel, "edge");
    }

    #[test]
    fn invalid_file_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        write(&path, r#"{"probe": {"concurrency": 4}}"#);
        let store = ConfigStore::load(Some(path.clone())).unwrap();

        write(&path, "{ not json");
        assert!(matches!(store.reload(), Err(ConfigError::Load(_))));
        assert_eq!(store.snapshot().probe.concurrency, 4);

        write(&path, r#"{"probe": {"concurrency": 0}}"#);
        assert!(store.reload().is_err());
        assert_eq!(store.snapshot().probe.concurrency, 4);
    }

    #[test]
    fn reload_without_file_keeps_base_and_reapplies_env() {
        let mut base = Config::default();
        base.default_channel = "edge".into();
        base.probe.concurrency = 3;
        let store = ConfigStore::new(base);

        let reloaded = store
            .reload_with(&|key: &str| {
                (key == "OPSCENTER_SHUTDOWN_GRACE_SECS").then(|| "1".to_string())
            })
            .unwrap();
        assert_eq!(reloaded.default_channel, "edge");
        assert_eq!(reloaded.probe.concurrency, 3);
        assert_eq!(reloaded.shutdown_grace_secs, 1);

        let reloaded = store.reload_with(&|_: &str| None).unwrap();
        assert_eq!(reloaded.shutdown_grace_secs, 10);
        assert_eq!(store.snapshot().default_channel, "edge");
    }

    #[test]
    fn replace_validates() {
        let store = ConfigStore::new(Config::default());
        let mut bad = Config::default();
        bad.probe.timeout_secs = 0;
        assert!(matches!(store.replace(bad), Err(ConfigError::Invalid(_))));

        let mut good = Config::default();
        good.public_url = "https://ops.example:7443".into();
        store.replace(good).unwrap();
        assert_eq!(store.snapshot().public_url, "https://ops.example:7443");
    }
}
