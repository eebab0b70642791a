//! Data models for fleet storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Computed state of a registration token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Active,
    Exhausted,
    Expired,
}

/// Lifecycle status of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    Pending,
    Ready,
    Unreachable,
}

impl ServerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Unreachable => "unreachable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "unreachable" => Some(Self::Unreachable),
            _ => None,
        }
    }
}

/// Role of a registered server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    /// A hypervisor host managed as part of the fleet.
    FleetMember,
    /// The host running the operations center itself.
    SelfHosted,
}

impl ServerType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FleetMember => "fleet-member",
            Self::SelfHosted => "self",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fleet-member" => Some(Self::FleetMember),
            "self" => Some(Self::SelfHosted),
            _ => None,
        }
    }
}

/// Lifecycle status of a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterStatus {
    Pending,
    Ready,
    Unknown,
}

impl ClusterStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "ready" => Some(Self::Ready),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    pub uuid: String,
    pub uses_remaining: i64,
    pub expire_at: i64,
    pub description: String,
    pub etag: String,
    pub created_at: i64,
}

impl Token {
    /// State at `now`; expiry takes precedence over exhaustion.
    pub const fn state_at(&self, now: i64) -> TokenState {
        if now >= self.expire_at {
            TokenState::Expired
        } else if self.uses_remaining <= 0 {
            TokenState::Exhausted
        } else {
            TokenState::Active
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Server {
    pub name: String,
    pub cluster: Option<String>,
    pub server_type: String,
    pub connection_url: String,
    pub certificate: String,
    pub certificate_fingerprint: String,
    pub hardware_data: String,
    pub os_data: String,
    pub version_data: String,
    pub status: String,
    pub config_hash: Option<String>,
    pub etag: String,
    pub last_seen: i64,
    pub last_updated: i64,
}

impl Server {
    pub fn status(&self) -> ServerStatus {
        ServerStatus::parse(&self.status).unwrap_or(ServerStatus::Pending)
    }

    pub fn server_type(&self) -> ServerType {
        ServerType::parse(&self.server_type).unwrap_or(ServerType::FleetMember)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Cluster {
    pub name: String,
    pub connection_url: String,
    pub channel: String,
    pub certificate: String,
    pub fingerprint: String,
    pub services_config: String,
    pub application_seed_config: String,
    pub status: String,
    pub etag: String,
    pub last_updated: i64,
}

impl Cluster {
    pub fn status(&self) -> ClusterStatus {
        ClusterStatus::parse(&self.status).unwrap_or(ClusterStatus::Unknown)
    }
}

/// A cluster together with the names of the servers referencing it.
#[derive(Debug, Clone)]
pub struct ClusterDetail {
    pub cluster: Cluster,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Artifact {
    pub cluster: String,
    pub name: String,
    pub description: String,
    /// JSON object of string properties.
    pub properties: String,
    pub last_updated: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArtifactFileInfo {
    pub name: String,
    pub mime_type: String,
    pub size: i64,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ArtifactFile {
    pub cluster: String,
    pub artifact: String,
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// An artifact with its file listing (without contents).
#[derive(Debug, Clone)]
pub struct ArtifactDetail {
    pub artifact: Artifact,
    pub files: Vec<ArtifactFileInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct InventoryRecord {
    pub id: i64,
    pub cluster: String,
    pub server: Option<String>,
    pub project: String,
    pub kind: String,
    pub name: String,
    pub object: String,
    pub last_updated: i64,
}

// =========================================================================
// Write parameters
// =========================================================================

/// Fields captured when a machine registers.
#[derive(Debug, Clone)]
pub struct NewServer<'a> {
    pub name: &'a str,
    pub server_type: ServerType,
    pub connection_url: &'a str,
    pub certificate: &'a str,
    pub certificate_fingerprint: &'a str,
}

/// Fields a machine may change about itself; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct SelfUpdate<'a> {
    pub connection_url: Option<&'a str>,
    pub hardware_data: Option<&'a str>,
    pub os_data: Option<&'a str>,
    pub version_data: Option<&'a str>,
}

/// Facts reported by a successful probe, stored as JSON text.
#[derive(Debug, Clone)]
pub struct ProbedFacts<'a> {
    pub hardware_data: &'a str,
    pub os_data: &'a str,
    pub version_data: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct ServerFilter {
    pub cluster: Option<String>,
    pub status: Option<ServerStatus>,
    pub server_type: Option<ServerType>,
}

#[derive(Debug, Clone)]
pub struct NewCluster<'a> {
    pub name: &'a str,
    pub connection_url: &'a str,
    pub channel: &'a str,
    pub certificate: &'a str,
    pub fingerprint: &'a str,
    pub services_config: &'a str,
    pub application_seed_config: &'a str,
    pub status: ClusterStatus,
}

/// Partial cluster edit; `None` leaves a field as is.
#[derive(Debug, Clone, Default)]
pub struct ClusterUpdate<'a> {
    pub connection_url: Option<&'a str>,
    pub channel: Option<&'a str>,
    pub services_config: Option<&'a str>,
    pub application_seed_config: Option<&'a str>,
}

/// A generated artifact bundle ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArtifact {
    pub name: String,
    pub description: String,
    pub properties: BTreeMap<String, String>,
    pub files: Vec<NewArtifactFile>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArtifactFile {
    pub name: String,
    pub mime_type: String,
    pub content: Vec<u8>,
}

/// One remote resource as reported by a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewInventoryRecord {
    #[serde(default)]
    pub server: Option<String>,
    #[serde(default = "default_project")]
    pub project: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub object: serde_json::Value,
}

fn default_project() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Default)]
pub struct InventoryFilter {
    pub cluster: Option<String>,
    pub server: Option<String>,
    pub project: Option<String>,
    pub kind: Option<String>,
    pub name_contains: Option<String>,
}
