//! Configuration resolution for the operations center.
//!
//! Resolution order (lowest to highest priority):
//! 1. Built-in defaults
//! 2. Config file (`--config`, or `~/.opscenter/config.json`)
//! 3. Environment variables (`OPSCENTER_*`)

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Seconds in a day; bounds the config push window.
pub const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Complete control plane configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// URL machines use to reach the operations center.
    pub public_url: String,
    /// Base URL of the update index; `None` disables update refresh.
    pub update_source_url: Option<String>,
    /// Update channel used when a cluster does not name one.
    pub default_channel: String,
    pub probe: ProbeConfig,
    /// Deadline for cluster bootstrap, inventory and factory-reset calls.
    pub transport_timeout_secs: u64,
    /// Lifetime of tokens seeded by a factory reset.
    pub reset_token_lifetime_secs: i64,
    pub config_push_window: PushWindow,
    /// SHA-256 fingerprints of client certificates granted admin access.
    pub trusted_client_fingerprints: Vec<String>,
    pub tasks: TaskIntervals,
    /// Grace period for background tasks on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            public_url: "https://localhost:7443".to_string(),
            update_source_url: None,
            default_channel: "stable".to_string(),
            probe: ProbeConfig::default(),
            transport_timeout_secs: 120,
            reset_token_lifetime_secs: 7 * 24 * 60 * 60, // 7 days
            config_push_window: PushWindow::default(),
            trusted_client_fingerprints: Vec::new(),
            tasks: TaskIntervals::default(),
            shutdown_grace_secs: 10,
        }
    }
}

/// Connectivity probe settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Per-server probe deadline.
    pub timeout_secs: u64,
    /// Maximum probes in flight per round.
    pub concurrency: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            concurrency: 16,
        }
    }
}

/// Daily UTC window during which configuration may be pushed to servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PushWindow {
    /// Window start as seconds after midnight UTC.
    pub start_secs: u64,
    /// Window length in seconds; a full day means "always".
    pub length_secs: u64,
}

impl Default for PushWindow {
    fn default() -> Self {
        Self {
            start_secs: 0,
            length_secs: SECS_PER_DAY,
        }
    }
}

impl PushWindow {
    /// Whether the given Unix timestamp falls inside the window.
    ///
    /// Windows may wrap past midnight.
    pub fn contains(&self, unix_secs: i64) -> bool {
        if self.length_secs >= SECS_PER_DAY {
            return true;
        }
        if self.length_secs == 0 {
            return false;
        }
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_wrap)]
        let time_of_day = unix_secs.rem_euclid(SECS_PER_DAY as i64) as u64;
        let offset = (time_of_day + SECS_PER_DAY - self.start_secs) % SECS_PER_DAY;
        offset < self.length_secs
    }
}

/// Background task intervals in seconds; zero disables a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskIntervals {
    pub update_refresh_secs: u64,
    pub pending_probe_secs: u64,
    pub ready_probe_secs: u64,
    pub inventory_resync_secs: u64,
}

impl Default for TaskIntervals {
    fn default() -> Self {
        Self {
            update_refresh_secs: 6 * 60 * 60,
            pending_probe_secs: 60,
            ready_probe_secs: 5 * 60,
            inventory_resync_secs: 60 * 60,
        }
    }
}

impl Config {
    /// Reject settings the control plane cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.probe.concurrency == 0 {
            return Err(Error::Config("probe.concurrency must be > 0".into()));
        }
        if self.probe.timeout_secs == 0 || self.transport_timeout_secs == 0 {
            return Err(Error::Config("timeouts must be > 0".into()));
        }
        if self.config_push_window.start_secs >= SECS_PER_DAY {
            return Err(Error::Config(
                "config_push_window.start_secs must be < 86400".into(),
            ));
        }
        if self.reset_token_lifetime_secs <= 0 {
            return Err(Error::Config(
                "reset_token_lifetime_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// An explicit `path` must exist; the default path is optional.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    load_config_with(path, env_var)
}

/// [`load_config`] reading overrides through `lookup` instead of the
/// process environment.
pub fn load_config_with(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let config = match path {
        Some(p) => load_config_file(p)?,
        None => match global_config_path() {
            Some(p) if p.exists() => load_config_file(&p)?,
            _ => Config::default(),
        },
    };
    resolve(config, lookup)
}

/// Apply `OPSCENTER_*` overrides from `lookup` on top of `config`, then
/// validate the result.
pub fn resolve(mut config: Config, lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    apply_overrides(&mut config, &lookup)?;
    config.validate()?;
    Ok(config)
}

/// Process environment lookup used by [`load_config`].
pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Get the default config file path.
pub fn global_config_path() -> Option<PathBuf> {
    state_dir().map(|d| d.join("config.json"))
}

/// Directory holding the database, generated certificates and config.
pub fn state_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".opscenter"))
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn apply_overrides(config: &mut Config, lookup: &impl Fn(&str) -> Option<String>) -> Result<()> {
    override_with(lookup, "OPSCENTER_PUBLIC_URL", &mut config.public_url)?;
    if let Some(url) = lookup("OPSCENTER_UPDATE_SOURCE_URL") {
        // Empty disables update refresh.
        config.update_source_url = Some(url).filter(|u| !u.is_empty());
    }
    override_with(lookup, "OPSCENTER_DEFAULT_CHANNEL", &mut config.default_channel)?;
    override_with(lookup, "OPSCENTER_PROBE_TIMEOUT_SECS", &mut config.probe.timeout_secs)?;
    override_with(lookup, "OPSCENTER_PROBE_CONCURRENCY", &mut config.probe.concurrency)?;
    override_with(
        lookup,
        "OPSCENTER_TRANSPORT_TIMEOUT_SECS",
        &mut config.transport_timeout_secs,
    )?;
    override_with(
        lookup,
        "OPSCENTER_RESET_TOKEN_LIFETIME_SECS",
        &mut config.reset_token_lifetime_secs,
    )?;
    override_with(
        lookup,
        "OPSCENTER_PUSH_WINDOW_START_SECS",
        &mut config.config_push_window.start_secs,
    )?;
    override_with(
        lookup,
        "OPSCENTER_PUSH_WINDOW_LENGTH_SECS",
        &mut config.config_push_window.length_secs,
    )?;
    if let Some(list) = lookup("OPSCENTER_TRUSTED_CLIENT_FINGERPRINTS") {
        config.trusted_client_fingerprints = list
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
    }
    let tasks = &mut config.tasks;
    override_with(lookup, "OPSCENTER_UPDATE_REFRESH_SECS", &mut tasks.update_refresh_secs)?;
    override_with(lookup, "OPSCENTER_PENDING_PROBE_SECS", &mut tasks.pending_probe_secs)?;
    override_with(lookup, "OPSCENTER_READY_PROBE_SECS", &mut tasks.ready_probe_secs)?;
    override_with(
        lookup,
        "OPSCENTER_INVENTORY_RESYNC_SECS",
        &mut tasks.inventory_resync_secs,
    )?;
    override_with(lookup, "OPSCENTER_SHUTDOWN_GRACE_SECS", &mut config.shutdown_grace_secs)?;
    Ok(())
}

/// Replace `slot` with the parsed value of `key`, if set.
fn override_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{key}={raw:?}: {e}")))?;
    }
    Ok(())
}
