//! `ClusterService` gRPC implementation.

use tonic::{Request, Response, Status};
use tracing::instrument;

use opscenter_proto::v1::cluster_service_server::ClusterService;
use opscenter_proto::v1::{
    ArtifactResponse, ClusterResponse, CreateClusterRequest, DeleteClusterRequest,
    DeleteClusterResponse, GetArtifactFileRequest, GetArtifactFileResponse, GetArtifactRequest,
    GetClusterRequest, ListArtifactsRequest, ListArtifactsResponse, ListClustersRequest,
    ListClustersResponse, RegenerateArtifactsRequest, RenameClusterRequest,
    ResyncInventoryRequest, ResyncInventoryResponse, UpdateClusterCertificateRequest,
    UpdateClusterRequest,
};

use super::convert::{
    artifact_to_proto, cluster_status_filter, cluster_to_proto, delete_mode, non_empty,
};
use super::interceptor::authorize;
use crate::auth::Entitlement;
use crate::provisioning::{ClusterEdit, ClusterLifecycle, ClusterSpec};
use crate::storage::{ArtifactDetail, ClusterDetail};

pub struct ClusterServiceImpl {
    clusters: ClusterLifecycle,
}

impl ClusterServiceImpl {
    pub const fn new(clusters: ClusterLifecycle) -> Self {
        Self { clusters }
    }
}

fn respond(detail: &ClusterDetail) -> Response<ClusterResponse> {
    Response::new(ClusterResponse {
        cluster: Some(cluster_to_proto(detail)),
    })
}

fn artifact_list(artifacts: &[ArtifactDetail]) -> Response<ListArtifactsResponse> {
    Response::new(ListArtifactsResponse {
        artifacts: artifacts.iter().map(artifact_to_proto).collect(),
    })
}

#[tonic::async_trait]
impl ClusterService for ClusterServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "CreateCluster"))]
    async fn create_cluster(
        &self,
        request: Request<CreateClusterRequest>,
    ) -> Result<Response<ClusterResponse>, Status> {
        authorize(&request, "cluster", Entitlement::CanEdit)?;
        let req = request.into_inner();
        let spec = ClusterSpec {
            name: req.name,
            connection_url: req.connection_url,
            members: req.server_names,
            services_config: req.services_config,
            application_seed_config: req.application_seed_config,
            channel: req.channel,
        };

        let detail = self.clusters.create(&spec).await?;
        Ok(respond(&detail))
    }

    #[instrument(skip(self, request), fields(rpc = "ListClusters"))]
    async fn list_clusters(
        &self,
        request: Request<ListClustersRequest>,
    ) -> Result<Response<ListClustersResponse>, Status> {
        authorize(&request, "cluster", Entitlement::CanView)?;
        let status = cluster_status_filter(request.into_inner().status_filter);

        let clusters = self.clusters.list(status).await?;
        Ok(Response::new(ListClustersResponse {
            clusters: clusters.iter().map(cluster_to_proto).collect(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "GetCluster"))]
    async fn get_cluster(
        &self,
        request: Request<GetClusterRequest>,
    ) -> Result<Response<ClusterResponse>, Status> {
        let name = request.get_ref().name.clone();
        authorize(&request, &format!("cluster:{name}"), Entitlement::CanView)?;

        let detail = self.clusters.get(&name).await?;
        Ok(respond(&detail))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateCluster"))]
    async fn update_cluster(
        &self,
        request: Request<UpdateClusterRequest>,
    ) -> Result<Response<ClusterResponse>, Status> {
        authorize(
            &request,
            &format!("cluster:{}", request.get_ref().name),
            Entitlement::CanEdit,
        )?;
        let req = request.into_inner();
        let edit = ClusterEdit {
            connection_url: non_empty(req.connection_url),
            channel: non_empty(req.channel),
            services_config: non_empty(req.services_config),
            application_seed_config: non_empty(req.application_seed_config),
        };
        let if_match = non_empty(req.if_match);

        let detail = self
            .clusters
            .update(&req.name, &edit, if_match.as_deref())
            .await?;
        Ok(respond(&detail))
    }

    #[instrument(skip(self, request), fields(rpc = "RenameCluster"))]
    async fn rename_cluster(
        &self,
        request: Request<RenameClusterRequest>,
    ) -> Result<Response<ClusterResponse>, Status> {
        authorize(
            &request,
            &format!("cluster:{}", request.get_ref().name),
            Entitlement::CanEdit,
        )?;
        let req = request.into_inner();
        let if_match = non_empty(req.if_match);

        let detail = self
            .clusters
            .rename(&req.name, &req.new_name, if_match.as_deref())
            .await?;
        Ok(respond(&detail))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateClusterCertificate"))]
    async fn update_cluster_certificate(
        &self,
        request: Request<UpdateClusterCertificateRequest>,
    ) -> Result<Response<ClusterResponse>, Status> {
        authorize(
            &request,
            &format!("cluster:{}", request.get_ref().name),
            Entitlement::CanEdit,
        )?;
        let req = request.into_inner();
        let if_match = non_empty(req.if_match);

        let detail = self
            .clusters
            .update_certificate(&req.name, &req.certificate, if_match.as_deref())
            .await?;
        Ok(respond(&detail))
    }

    #[instrument(skip(self, request), fields(rpc = "DeleteCluster"))]
    async fn delete_cluster(
        &self,
        request: Request<DeleteClusterRequest>,
    ) -> Result<Response<DeleteClusterResponse>, Status> {
        authorize(
            &request,
            &format!("cluster:{}", request.get_ref().name),
            Entitlement::CanDelete,
        )?;
        let req = request.into_inner();
        let mode = delete_mode(req.mode)
            .ok_or_else(|| Status::invalid_argument(format!("unknown delete mode {}", req.mode)))?;

        let removed_servers = self
            .clusters
            .delete(&req.name, mode, req.reseed_tokens)
            .await?;
        Ok(Response::new(DeleteClusterResponse { removed_servers }))
    }

    #[instrument(skip(self, request), fields(rpc = "ResyncInventory"))]
    async fn resync_inventory(
        &self,
        request: Request<ResyncInventoryRequest>,
    ) -> Result<Response<ResyncInventoryResponse>, Status> {
        let name = request.get_ref().name.clone();
        authorize(&request, &format!("cluster:{name}"), Entitlement::CanEdit)?;

        let records = self.clusters.resync_inventory(&name).await?;
        Ok(Response::new(ResyncInventoryResponse {
            records: u32::try_from(records).unwrap_or(u32::MAX),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "ListArtifacts"))]
    async fn list_artifacts(
        &self,
        request: Request<ListArtifactsRequest>,
    ) -> Result<Response<ListArtifactsResponse>, Status> {
        let cluster = request.get_ref().cluster.clone();
        authorize(&request, &format!("cluster:{cluster}"), Entitlement::CanView)?;

        let artifacts = self.clusters.list_artifacts(&cluster).await?;
        Ok(artifact_list(&artifacts))
    }

    #[instrument(skip(self, request), fields(rpc = "GetArtifact"))]
    async fn get_artifact(
        &self,
        request: Request<GetArtifactRequest>,
    ) -> Result<Response<ArtifactResponse>, Status> {
        authorize(
            &request,
            &format!("cluster:{}", request.get_ref().cluster),
            Entitlement::CanView,
        )?;
        let req = request.into_inner();

        let artifact = self.clusters.get_artifact(&req.cluster, &req.name).await?;
        Ok(Response::new(ArtifactResponse {
            artifact: Some(artifact_to_proto(&artifact)),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "GetArtifactFile"))]
    async fn get_artifact_file(
        &self,
        request: Request<GetArtifactFileRequest>,
    ) -> Result<Response<GetArtifactFileResponse>, Status> {
        authorize(
            &request,
            &format!("cluster:{}", request.get_ref().cluster),
            Entitlement::CanView,
        )?;
        let req = request.into_inner();

        let file = self
            .clusters
            .open_artifact_file(&req.cluster, &req.artifact, &req.file)
            .await?;
        Ok(Response::new(GetArtifactFileResponse {
            mime_type: file.mime_type,
            content: file.content,
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "RegenerateArtifacts"))]
    async fn regenerate_artifacts(
        &self,
        request: Request<RegenerateArtifactsRequest>,
    ) -> Result<Response<ListArtifactsResponse>, Status> {
        let cluster = request.get_ref().cluster.clone();
        authorize(&request, &format!("cluster:{cluster}"), Entitlement::CanEdit)?;

        let artifacts = self.clusters.regenerate_artifacts(&cluster).await?;
        Ok(artifact_list(&artifacts))
    }
}
