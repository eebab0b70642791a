//! `InventoryService` gRPC implementation.

use tonic::{Request, Response, Status};
use tracing::instrument;

use opscenter_proto::v1::inventory_service_server::InventoryService;
use opscenter_proto::v1::{ListInventoryRequest, ListInventoryResponse};

use super::convert::{inventory_to_proto, non_empty};
use super::interceptor::authorize;
use crate::auth::Entitlement;
use crate::provisioning::InventoryAggregator;
use crate::storage::InventoryFilter;

pub struct InventoryServiceImpl {
    inventory: InventoryAggregator,
}

impl InventoryServiceImpl {
    pub const fn new(inventory: InventoryAggregator) -> Self {
        Self { inventory }
    }
}

#[tonic::async_trait]
impl InventoryService for InventoryServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "ListInventory"))]
    async fn list_inventory(
        &self,
        request: Request<ListInventoryRequest>,
    ) -> Result<Response<ListInventoryResponse>, Status> {
        authorize(&request, "inventory", Entitlement::CanView)?;
        let req = request.into_inner();
        let filter = InventoryFilter {
            cluster: non_empty(req.cluster),
            server: non_empty(req.server),
            project: non_empty(req.project),
            kind: non_empty(req.kind),
            name_contains: non_empty(req.name_contains),
        };

        let records = self.inventory.query(&filter).await?;
        Ok(Response::new(ListInventoryResponse {
            records: records.iter().map(inventory_to_proto).collect(),
        }))
    }
}
