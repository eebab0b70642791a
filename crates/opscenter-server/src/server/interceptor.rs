//! Access control interceptor for the administrative services.

use tonic::{Request, Status};

use crate::auth::{AccessControl, Entitlement, Identity, check_permission};
use crate::tls::ConnectionInfo;

/// Authenticate the caller through the access chain and attach its
/// [`Identity`] to the request.
pub fn access_interceptor(
    access: AccessControl,
) -> impl Fn(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |mut req: Request<()>| {
        let identity = access
            .authenticate(req.extensions().get::<ConnectionInfo>(), req.metadata())
            .ok_or_else(|| Status::unauthenticated("No valid credentials presented"))?;
        req.extensions_mut().insert(identity);
        Ok(req)
    }
}

/// Identity attached by [`access_interceptor`].
#[allow(clippy::result_large_err)]
pub fn extract_identity<T>(req: &Request<T>) -> Result<&Identity, Status> {
    req.extensions()
        .get::<Identity>()
        .ok_or_else(|| Status::internal("Identity not found in request extensions"))
}

/// Fail with `PERMISSION_DENIED` unless the caller holds `entitlement` on
/// `object`.
#[allow(clippy::result_large_err)]
pub fn authorize<T>(req: &Request<T>, object: &str, entitlement: Entitlement) -> Result<(), Status> {
    let identity = extract_identity(req)?;
    check_permission(identity, object, entitlement).map_err(Status::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;

    use opscenter_core::Config;
    use tonic::metadata::MetadataValue;

    use super::*;
    use crate::auth::{JwtManager, Role};
    use crate::config_store::ConfigStore;

    fn setup() -> (AccessControl, Arc<JwtManager>) {
        let jwt = Arc::new(JwtManager::new(b"test-secret", 3600));
        (
            AccessControl::new(ConfigStore::new(Config::default()), Arc::clone(&jwt)),
            jwt,
        )
    }

    #[test]
    fn local_connection_passes() {
        let (access, _) = setup();
        let mut req = Request::new(());
        req.extensions_mut().insert(ConnectionInfo {
            local_channel: true,
            ..ConnectionInfo::default()
        });

        let req = access_interceptor(access)(req).unwrap();
        assert_eq!(extract_identity(&req).unwrap(), &Identity::Local);
        assert!(authorize(&req, "cluster:x", Entitlement::CanDelete).is_ok());
    }

    #[test]
    fn viewer_token_cannot_edit() {
        let (access, jwt) = setup();
        let (token, _) = jwt.issue_access_token("ops", Role::Viewer).unwrap();
        let mut req = Request::new(());
        req.metadata_mut().insert(
            "authorization",
            MetadataValue::try_from(format!("Bearer {token}")).unwrap(),
        );

        let req = access_interceptor(access)(req).unwrap();
        assert!(authorize(&req, "server:a", Entitlement::CanView).is_ok());
        let err = authorize(&req, "server:a", Entitlement::CanEdit).unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }

    #[test]
    fn anonymous_request_is_unauthenticated() {
        let (access, _) = setup();
        let err = access_interceptor(access)(Request::new(())).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Unauthenticated);
    }

    #[test]
    fn missing_identity_is_internal() {
        let req = Request::new(());
        let err = authorize(&req, "token:t", Entitlement::CanView).unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }
}
