//! Content hashes used as optimistic-concurrency preconditions.
//!
//! Each entity's etag covers only its administratively meaningful fields,
//! so background writes (probe facts, status) never invalidate an operator's
//! precondition.

use sha2::{Digest, Sha256};

/// SHA-256 over length-prefixed fields, as lower-case hex.
pub fn content_hash(fields: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for field in fields {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    hex::encode(hasher.finalize())
}

pub fn token_etag(uses_remaining: i64, expire_at: i64, description: &str) -> String {
    content_hash(&[
        &uses_remaining.to_string(),
        &expire_at.to_string(),
        description,
    ])
}

pub fn server_etag(
    name: &str,
    cluster: Option<&str>,
    connection_url: &str,
    server_type: &str,
    certificate_fingerprint: &str,
) -> String {
    content_hash(&[
        name,
        cluster.unwrap_or_default(),
        connection_url,
        server_type,
        certificate_fingerprint,
    ])
}

pub fn cluster_etag(
    name: &str,
    connection_url: &str,
    channel: &str,
    fingerprint: &str,
    services_config: &str,
    application_seed_config: &str,
) -> String {
    content_hash(&[
        name,
        connection_url,
        channel,
        fingerprint,
        services_config,
        application_seed_config,
    ])
}
