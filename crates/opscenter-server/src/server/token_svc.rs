//! `TokenService` gRPC implementation.

use tonic::{Request, Response, Status};
use tracing::instrument;

use opscenter_proto::v1::token_service_server::TokenService;
use opscenter_proto::v1::{
    CreateTokenRequest, DeleteTokenRequest, DeleteTokenResponse, GetTokenRequest,
    ListTokensRequest, ListTokensResponse, TokenResponse, UpdateTokenRequest,
};

use super::convert::{non_empty, token_state_filter, token_to_proto};
use super::interceptor::authorize;
use crate::auth::Entitlement;
use crate::provisioning::TokenLifecycle;

pub struct TokenServiceImpl {
    tokens: TokenLifecycle,
}

impl TokenServiceImpl {
    pub const fn new(tokens: TokenLifecycle) -> Self {
        Self { tokens }
    }
}

#[allow(clippy::result_large_err)]
fn required_expiry(expire_at: Option<prost_types::Timestamp>) -> Result<i64, Status> {
    expire_at
        .map(|ts| ts.seconds)
        .ok_or_else(|| Status::invalid_argument("expire_at is required"))
}

#[tonic::async_trait]
impl TokenService for TokenServiceImpl {
    #[instrument(skip(self, request), fields(rpc = "CreateToken"))]
    async fn create_token(
        &self,
        request: Request<CreateTokenRequest>,
    ) -> Result<Response<TokenResponse>, Status> {
        authorize(&request, "token", Entitlement::CanEdit)?;
        let req = request.into_inner();
        let expire_at = required_expiry(req.expire_at)?;

        let token = self
            .tokens
            .create(req.uses_remaining, expire_at, &req.description)
            .await?;
        Ok(Response::new(TokenResponse {
            token: Some(token_to_proto(&token)),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "ListTokens"))]
    async fn list_tokens(
        &self,
        request: Request<ListTokensRequest>,
    ) -> Result<Response<ListTokensResponse>, Status> {
        authorize(&request, "token", Entitlement::CanView)?;
        let state = token_state_filter(request.into_inner().state_filter);

        let tokens = self.tokens.list(state).await?;
        Ok(Response::new(ListTokensResponse {
            tokens: tokens.iter().map(token_to_proto).collect(),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "GetToken"))]
    async fn get_token(
        &self,
        request: Request<GetTokenRequest>,
    ) -> Result<Response<TokenResponse>, Status> {
        let uuid = request.get_ref().uuid.clone();
        authorize(&request, &format!("token:{uuid}"), Entitlement::CanView)?;

        let token = self.tokens.get(&uuid).await?;
        Ok(Response::new(TokenResponse {
            token: Some(token_to_proto(&token)),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "UpdateToken"))]
    async fn update_token(
        &self,
        request: Request<UpdateTokenRequest>,
    ) -> Result<Response<TokenResponse>, Status> {
        authorize(
            &request,
            &format!("token:{}", request.get_ref().uuid),
            Entitlement::CanEdit,
        )?;
        let req = request.into_inner();
        let expire_at = required_expiry(req.expire_at)?;
        let if_match = non_empty(req.if_match);

        let token = self
            .tokens
            .update(
                &req.uuid,
                req.uses_remaining,
                expire_at,
                &req.description,
                if_match.as_deref(),
            )
            .await?;
        Ok(Response::new(TokenResponse {
            token: Some(token_to_proto(&token)),
        }))
    }

    #[instrument(skip(self, request), fields(rpc = "DeleteToken"))]
    async fn delete_token(
        &self,
        request: Request<DeleteTokenRequest>,
    ) -> Result<Response<DeleteTokenResponse>, Status> {
        let uuid = request.get_ref().uuid.clone();
        authorize(&request, &format!("token:{uuid}"), Entitlement::CanDelete)?;

        self.tokens.delete(&uuid).await?;
        Ok(Response::new(DeleteTokenResponse { deleted: true }))
    }
}
