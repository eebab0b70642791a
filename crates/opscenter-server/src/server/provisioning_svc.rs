//! `ProvisioningService` gRPC implementation.
//!
//! Served without the access interceptor: registration is authorized by the
//! token, self-update by the presented certificate.

use tonic::{Request, Response, Status};
use tracing::instrument;

use opscenter_proto::v1::provisioning_service_server::ProvisioningService;
use opscenter_proto::v1::{
    RegisterServerRequest, RegisterServerResponse, UpdateSelfRequest, UpdateSelfResponse,
};

use super::convert::{non_empty, server_type_filter};
use crate::provisioning::{Registration, SelfReport, ServerLifecycle};
use crate::storage::ServerType;
use crate::tls::ConnectionInfo;

pub struct ProvisioningServiceImpl {
    servers: ServerLifecycle,
}

impl ProvisioningServiceImpl {
    pub const fn new(servers: ServerLifecycle) -> Self {
        Self { servers }
    }
}

fn connection<T>(request: &Request<T>) -> Option<&ConnectionInfo> {
    request.extensions().get::<ConnectionInfo>()
}

/// Unspecified means a regular fleet member; unknown values stay unknown.
fn server_type_name(raw: i32) -> &'static str {
    match server_type_filter(raw) {
        Some(server_type) => server_type.as_str(),
        None if raw == 0 => ServerType::FleetMember.as_str(),
        None => "",
    }
}

#[tonic::async_trait]
impl ProvisioningService for ProvisioningServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "RegisterServer"))]
    async fn register_server(
        &self,
        request: Request<RegisterServerRequest>,
    ) -> Result<Response<RegisterServerResponse>, Status> {
        let peer_pem = connection(&request).and_then(ConnectionInfo::peer_certificate_pem);
        let req = request.into_inner();
        let registration = Registration {
            name: req.name,
            connection_url: req.connection_url,
            server_type: server_type_name(req.server_type).to_string(),
            token: req.token,
        };

        let (_, client_certificate) = self
            .servers
            .register(peer_pem.as_deref(), &registration)
            .await?;
        Ok(Response::new(RegisterServerResponse { client_certificate }))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateSelf"))]
    async fn update_self(
        &self,
        request: Request<UpdateSelfRequest>,
    ) -> Result<Response<UpdateSelfResponse>, Status> {
        let fingerprint = connection(&request).and_then(ConnectionInfo::peer_fingerprint);
        let req = request.into_inner();
        let report = SelfReport {
            name: non_empty(req.name),
            connection_url: non_empty(req.connection_url),
            hardware_data: non_empty(req.hardware_data),
            os_data: non_empty(req.os_data),
            version_data: non_empty(req.version_data),
        };

        self.servers
            .self_update(fingerprint.as_deref(), &report)
            .await?;
        Ok(Response::new(UpdateSelfResponse {}))
    }
}
