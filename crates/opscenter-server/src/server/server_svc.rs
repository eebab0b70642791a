//! `ServerService` gRPC implementation.

use tonic::{Request, Response, Status};
use tracing::instrument;

use opscenter_proto::v1::server_service_server::ServerService;
use opscenter_proto::v1::{
    DeleteServerRequest, DeleteServerResponse, GetServerRequest, ListServersRequest,
    ListServersResponse, RenameServerRequest, ResyncServerRequest, ServerResponse,
    UpdateServerRequest,
};

use super::convert::{non_empty, server_status_filter, server_to_proto, server_type_filter};
use super::interceptor::authorize;
use crate::auth::Entitlement;
use crate::provisioning::ServerLifecycle;
use crate::storage::{Server, ServerFilter};

pub struct ServerServiceImpl {
    servers: ServerLifecycle,
}

impl ServerServiceImpl {
    pub const fn new(servers: ServerLifecycle) -> Self {
        Self { servers }
    }
}

fn respond(server: &Server) -> Response<ServerResponse> {
    Response::new(ServerResponse {
        server: Some(server_to_proto(server)),
    })
}

#[tonic::async_trait]
impl ServerService for ServerServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "ListServers"))]
    async fn list_servers(
        &self,
        request: Request<ListServersRequest>,
    ) -> Result<Response<ListServersResponse>, Status> {
        authorize(&request, "server", Entitlement::CanView)?;
        let req = request.into_inner();
        let filter = ServerFilter {
            cluster: non_empty(req.cluster),
            status: server_status_filter(req.status_filter),
            server_type: server_type_filter(req.type_filter),
        };

        let servers = self.servers.list(&filter).await?;
        Ok(Response::new(ListServersResponse {
            servers: servers.iter().map(server_to_proto).collect(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "GetServer"))]
    async fn get_server(
        &self,
        request: Request<GetServerRequest>,
    ) -> Result<Response<ServerResponse>, Status> {
        let name = request.get_ref().name.clone();
        authorize(&request, &format!("server:{name}"), Entitlement::CanView)?;

        let server = self.servers.get(&name).await?;
        Ok(respond(&server))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateServer"))]
    async fn update_server(
        &self,
        request: Request<UpdateServerRequest>,
    ) -> Result<Response<ServerResponse>, Status> {
        authorize(
            &request,
            &format!("server:{}", request.get_ref().name),
            Entitlement::CanEdit,
        )?;
        let req = request.into_inner();
        let if_match = non_empty(req.if_match);

        let server = self
            .servers
            .update(&req.name, &req.connection_url, if_match.as_deref())
            .await?;
        Ok(respond(&server))
    }

    #[instrument(skip(self, request), fields(rpc = "RenameServer"))]
    async fn rename_server(
        &self,
        request: Request<RenameServerRequest>,
    ) -> Result<Response<ServerResponse>, Status> {
        authorize(
            &request,
            &format!("server:{}", request.get_ref().name),
            Entitlement::CanEdit,
        )?;
        let req = request.into_inner();
        let if_match = non_empty(req.if_match);

        let server = self
            .servers
            .rename(&req.name, &req.new_name, if_match.as_deref())
            .await?;
        Ok(respond(&server))
    }

    #[instrument(skip(self, request), fields(rpc = "DeleteServer"))]
    async fn delete_server(
        &self,
        request: Request<DeleteServerRequest>,
    ) -> Result<Response<DeleteServerResponse>, Status> {
        let name = request.get_ref().name.clone();
        authorize(&request, &format!("server:{name}"), Entitlement::CanDelete)?;

        self.servers.delete(&name).await?;
        Ok(Response::new(DeleteServerResponse { deleted: true }))
    }

    #[instrument(skip(self, request), fields(rpc = "ResyncServer"))]
    async fn resync_server(
        &self,
        request: Request<ResyncServerRequest>,
    ) -> Result<Response<ServerResponse>, Status> {
        let name = request.get_ref().name.clone();
        authorize(&request, &format!("server:{name}"), Entitlement::CanEdit)?;

        let server = self.servers.resync(&name).await?;
        Ok(respond(&server))
    }
}
