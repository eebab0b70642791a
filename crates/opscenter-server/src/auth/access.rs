//! Authentication chain and authorizer for the administrative API.
//!
//! Authenticators are a closed set evaluated in a fixed order; the first one
//! that recognises the caller decides its [`Identity`].

use std::sync::Arc;

use tonic::metadata::MetadataMap;
use tracing::debug;

use super::claims::Role;
use super::jwt::JwtManager;
use crate::config_store::ConfigStore;
use crate::error::{FleetError, FleetResult};
use crate::tls::ConnectionInfo;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Came over the local Unix socket.
    Local,
    /// Presented a client certificate listed as trusted.
    Certificate { fingerprint: String },
    /// Presented a valid bearer access token.
    Bearer { subject: String, role: Role },
}

impl Identity {
    fn describe(&self) -> String {
        match self {
            Self::Local => "local".to_string(),
            Self::Certificate { fingerprint } => format!("certificate:{fingerprint}"),
            Self::Bearer { subject, .. } => format!("bearer:{subject}"),
        }
    }
}

/// What the caller wants to do with an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entitlement {
    CanView,
    CanEdit,
    CanDelete,
}

/// One link of the authentication chain.
#[derive(Clone)]
pub enum Authenticator {
    LocalChannel,
    CertificateFingerprint(ConfigStore),
    BearerToken(Arc<JwtManager>),
}

impl Authenticator {
    fn authenticate(
        &self,
        conn: Option<&ConnectionInfo>,
        metadata: &MetadataMap,
    ) -> Option<Identity> {
        match self {
            Self::LocalChannel => conn
                .filter(|c| c.local_channel)
                .map(|_| Identity::Local),
            Self::CertificateFingerprint(config) => {
                let fingerprint = conn?.peer_fingerprint()?;
                config
                    .snapshot()
                    .trusted_client_fingerprints
                    .iter()
                    .any(|trusted| opscenter_crypto::normalize_fingerprint(trusted) == fingerprint)
                    .then_some(Identity::Certificate { fingerprint })
            }
            Self::BearerToken(jwt) => {
                let token = metadata
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.strip_prefix("Bearer "))?;
                match jwt.validate(token) {
                    Ok(claims) if claims.is_access() => Some(Identity::Bearer {
                        subject: claims.sub,
                        role: claims.role,
                    }),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(error = %e, "Bearer token rejected");
                        None
                    }
                }
            }
        }
    }
}

/// The authentication chain plus the authorizer.
#[derive(Clone)]
pub struct AccessControl {
    chain: Vec<Authenticator>,
}

impl AccessControl {
    /// The standard chain: local channel, trusted certificate, bearer token.
    pub fn new(config: ConfigStore, jwt: Arc<JwtManager>) -> Self {
        Self {
            chain: vec![
                Authenticator::LocalChannel,
                Authenticator::CertificateFingerprint(config),
                Authenticator::BearerToken(jwt),
            ],
        }
    }

    /// First matching authenticator wins.
    pub fn authenticate(
        &self,
        conn: Option<&ConnectionInfo>,
        metadata: &MetadataMap,
    ) -> Option<Identity> {
        self.chain
            .iter()
            .find_map(|auth| auth.authenticate(conn, metadata))
    }
}

/// Decide whether `identity` may exercise `entitlement` on `object`.
pub fn check_permission(
    identity: &Identity,
    object: &str,
    entitlement: Entitlement,
) -> FleetResult<()> {
    let allowed = match identity {
        Identity::Local | Identity::Certificate { .. } => true,
        Identity::Bearer { role, .. } => {
            *role == Role::Admin || entitlement == Entitlement::CanView
        }
    };
    if allowed {
        Ok(())
    } else {
        debug!(identity = %identity.describe(), object, ?entitlement, "Permission denied");
        Err(FleetError::Forbidden(format!(
            "{entitlement:?} on {object} not permitted"
        )))
    }
}
