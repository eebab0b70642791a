//! Conversions between storage models and the wire types.

use opscenter_core::db::unix_timestamp;
use opscenter_proto::prost_types::Timestamp;
use opscenter_proto::v1 as pb;

use crate::provisioning::DeleteMode;
use crate::storage::{
    ArtifactDetail, ClusterDetail, ClusterStatus, InventoryRecord, Server, ServerStatus,
    ServerType, Token, TokenState,
};

pub const fn timestamp(seconds: i64) -> Option<Timestamp> {
    Some(Timestamp { seconds, nanos: 0 })
}

/// Proto3 has no presence for strings; empty means "not given".
pub fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

// =========================================================================
// Enums
// =========================================================================

pub fn token_state_filter(raw: i32) -> Option<TokenState> {
    match pb::TokenState::try_from(raw) {
        Ok(pb::TokenState::Active) => Some(TokenState::Active),
        Ok(pb::TokenState::Exhausted) => Some(TokenState::Exhausted),
        Ok(pb::TokenState::Expired) => Some(TokenState::Expired),
        _ => None,
    }
}

pub fn server_status_filter(raw: i32) -> Option<ServerStatus> {
    match pb::ServerStatus::try_from(raw) {
        Ok(pb::ServerStatus::Pending) => Some(ServerStatus::Pending),
        Ok(pb::ServerStatus::Ready) => Some(ServerStatus::Ready),
        Ok(pb::ServerStatus::Unreachable) => Some(ServerStatus::Unreachable),
        _ => None,
    }
}

pub fn server_type_filter(raw: i32) -> Option<ServerType> {
    match pb::ServerType::try_from(raw) {
        Ok(pb::ServerType::FleetMember) => Some(ServerType::FleetMember),
        Ok(pb::ServerType::SelfHosted) => Some(ServerType::SelfHosted),
        _ => None,
    }
}

pub fn cluster_status_filter(raw: i32) -> Option<ClusterStatus> {
    match pb::ClusterStatus::try_from(raw) {
        Ok(pb::ClusterStatus::Pending) => Some(ClusterStatus::Pending),
        Ok(pb::ClusterStatus::Ready) => Some(ClusterStatus::Ready),
        Ok(pb::ClusterStatus::Unknown) => Some(ClusterStatus::Unknown),
        _ => None,
    }
}

/// Unknown values are rejected rather than read as `Normal`.
pub fn delete_mode(raw: i32) -> Option<DeleteMode> {
    match pb::DeleteMode::try_from(raw) {
        Ok(pb::DeleteMode::Normal) => Some(DeleteMode::Normal),
        Ok(pb::DeleteMode::Force) => Some(DeleteMode::Force),
        Ok(pb::DeleteMode::FactoryReset) => Some(DeleteMode::FactoryReset),
        Err(_) => None,
    }
}

const fn server_status_to_proto(status: ServerStatus) -> pb::ServerStatus {
    match status {
        ServerStatus::Pending => pb::ServerStatus::Pending,
        ServerStatus::Ready => pb::ServerStatus::Ready,
        ServerStatus::Unreachable => pb::ServerStatus::Unreachable,
    }
}

const fn server_type_to_proto(server_type: ServerType) -> pb::ServerType {
    match server_type {
        ServerType::FleetMember => pb::ServerType::FleetMember,
        ServerType::SelfHosted => pb::ServerType::SelfHosted,
    }
}

const fn cluster_status_to_proto(status: ClusterStatus) -> pb::ClusterStatus {
    match status {
        ClusterStatus::Pending => pb::ClusterStatus::Pending,
        ClusterStatus::Ready => pb::ClusterStatus::Ready,
        ClusterStatus::Unknown => pb::ClusterStatus::Unknown,
    }
}

const fn token_state_to_proto(state: TokenState) -> pb::TokenState {
    match state {
        TokenState::Active => pb::TokenState::Active,
        TokenState::Exhausted => pb::TokenState::Exhausted,
        TokenState::Expired => pb::TokenState::Expired,
    }
}

// =========================================================================
// Messages
// =========================================================================

pub fn token_to_proto(token: &Token) -> pb::Token {
    pb::Token {
        uuid: token.uuid.clone(),
        uses_remaining: token.uses_remaining,
        expire_at: timestamp(token.expire_at),
        description: token.description.clone(),
        state: token_state_to_proto(token.state_at(unix_timestamp())) as i32,
        etag: token.etag.clone(),
    }
}

pub fn server_to_proto(server: &Server) -> pb::Server {
    pb::Server {
        name: server.name.clone(),
        cluster: server.cluster.clone().unwrap_or_default(),
        connection_url: server.connection_url.clone(),
        server_type: server_type_to_proto(server.server_type()) as i32,
        status: server_status_to_proto(server.status()) as i32,
        hardware_data: server.hardware_data.clone(),
        os_data: server.os_data.clone(),
        version_data: server.version_data.clone(),
        certificate_fingerprint: server.certificate_fingerprint.clone(),
        last_updated: timestamp(server.last_updated),
        last_seen: timestamp(server.last_seen),
        etag: server.etag.clone(),
    }
}

pub fn cluster_to_proto(detail: &ClusterDetail) -> pb::Cluster {
    let cluster = &detail.cluster;
    pb::Cluster {
        name: cluster.name.clone(),
        connection_url: cluster.connection_url.clone(),
        channel: cluster.channel.clone(),
        fingerprint: cluster.fingerprint.clone(),
        status: cluster_status_to_proto(cluster.status()) as i32,
        members: detail.members.clone(),
        services_config: cluster.services_config.clone(),
        application_seed_config: cluster.application_seed_config.clone(),
        last_updated: timestamp(cluster.last_updated),
        etag: cluster.etag.clone(),
    }
}

pub fn artifact_to_proto(detail: &ArtifactDetail) -> pb::Artifact {
    let artifact = &detail.artifact;
    pb::Artifact {
        name: artifact.name.clone(),
        cluster: artifact.cluster.clone(),
        description: artifact.description.clone(),
        properties: serde_json::from_str(&artifact.properties).unwrap_or_default(),
        files: detail
            .files
            .iter()
            .map(|f| pb::ArtifactFile {
                name: f.name.clone(),
                mime_type: f.mime_type.clone(),
                size: u64::try_from(f.size).unwrap_or_default(),
            })
            .collect(),
        last_updated: timestamp(artifact.last_updated),
    }
}

pub fn inventory_to_proto(record: &InventoryRecord) -> pb::InventoryRecord {
    pb::InventoryRecord {
        cluster: record.cluster.clone(),
        server: record.server.clone().unwrap_or_default(),
        project: record.project.clone(),
        kind: record.kind.clone(),
        name: record.name.clone(),
        object: record.object.clone(),
        last_updated: timestamp(record.last_updated),
    }
}
