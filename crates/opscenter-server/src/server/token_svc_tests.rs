//! Tests for `TokenService`.

use opscenter_core::db::unix_timestamp;
use opscenter_proto::prost_types::Timestamp;
use tonic::Code;

use opscenter_proto::v1::token_service_server::TokenService;
use opscenter_proto::v1::{
    CreateTokenRequest, DeleteTokenRequest, GetTokenRequest, ListTokensRequest,
    TokenState as PbTokenState, UpdateTokenRequest,
};

use super::test_helpers::{TestFleet, local_request, request_as};
use super::token_svc::TokenServiceImpl;
use crate::auth::{Identity, Role};

fn service(fixture: &TestFleet) -> TokenServiceImpl {
    TokenServiceImpl::new(fixture.fleet.tokens.clone())
}

fn in_secs(offset: i64) -> Option<Timestamp> {
    Some(Timestamp {
        seconds: unix_timestamp() + offset,
        nanos: 0,
    })
}

fn create_request(uses: i64, offset: i64) -> CreateTokenRequest {
    CreateTokenRequest {
        uses_remaining: uses,
        expire_at: in_secs(offset),
        description: "rack 7".into(),
    }
}

#[tokio::test]
async fn create_and_get() {
    let fixture = TestFleet::new().await;
    let svc = service(&fixture);

    let created = svc
        .create_token(local_request(create_request(2, 3600)))
        .await
        .unwrap()
        .into_inner()
        .token
        .unwrap();
    assert_eq!(created.uses_remaining, 2);
    assert_eq!(created.state, PbTokenState::Active as i32);
    assert!(uuid::Uuid::parse_str(&created.uuid).is_ok());

    let fetched = svc
        .get_token(local_request(GetTokenRequest {
            uuid: created.uuid.clone(),
        }))
        .await
        .unwrap()
        .into_inner()
        .token
        .unwrap();
    assert_eq!(fetched, created);
}

#[tokio::test]
async fn create_rejects_past_expiry_and_missing_fields() {
    let fixture = TestFleet::new().await;
    let svc = service(&fixture);

    let err = svc
        .create_token(local_request(create_request(1, -60)))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    let err = svc
        .create_token(local_request(CreateTokenRequest {
            uses_remaining: 1,
            expire_at: None,
            description: String::new(),
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn list_filters_by_computed_state() {
    let fixture = TestFleet::new().await;
    let svc = service(&fixture);
    svc.create_token(local_request(create_request(1, 3600)))
        .await
        .unwrap();
    let exhausted = svc
        .create_token(local_request(create_request(0, 3600)))
        .await
        .unwrap()
        .into_inner()
        .token
        .unwrap();

    let resp = svc
        .list_tokens(local_request(ListTokensRequest {
            state_filter: PbTokenState::Exhausted as i32,
        }))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(resp.tokens.len(), 1);
    assert_eq!(resp.tokens[0].uuid, exhausted.uuid);

    let all = svc
        .list_tokens(local_request(ListTokensRequest::default()))
        .await
        .unwrap()
        .into_inner();
    assert_eq!(all.tokens.len(), 2);
}

#[tokio::test]
async fn update_can_expire_early_but_needs_fresh_etag() {
    let fixture = TestFleet::new().await;
    let svc = service(&fixture);
    let token = svc
        .create_token(local_request(create_request(3, 3600)))
        .await
        .unwrap()
        .into_inner()
        .token
        .unwrap();

    let expired = svc
        .update_token(local_request(UpdateTokenRequest {
            uuid: token.uuid.clone(),
            uses_remaining: 3,
            expire_at: in_secs(-1),
            description: "revoked".into(),
            if_match: token.etag.clone(),
        }))
        .await
        .unwrap()
        .into_inner()
        .token
        .unwrap();
    assert_eq!(expired.state, PbTokenState::Expired as i32);

    let err = svc
        .update_token(local_request(UpdateTokenRequest {
            uuid: token.uuid,
            uses_remaining: 5,
            expire_at: in_secs(3600),
            description: String::new(),
            if_match: token.etag,
        }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn delete_unknown_is_not_found() {
    let fixture = TestFleet::new().await;
    let svc = service(&fixture);
    let token = svc
        .create_token(local_request(create_request(1, 3600)))
        .await
        .unwrap()
        .into_inner()
        .token
        .unwrap();

    let resp = svc
        .delete_token(local_request(DeleteTokenRequest {
            uuid: token.uuid.clone(),
        }))
        .await
        .unwrap()
        .into_inner();
    assert!(resp.deleted);

    let err = svc
        .delete_token(local_request(DeleteTokenRequest { uuid: token.uuid }))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::NotFound);
}

#[tokio::test]
async fn viewer_cannot_mint_tokens() {
    let fixture = TestFleet::new().await;
    let viewer = Identity::Bearer {
        subject: "auditor".into(),
        role: Role::Viewer,
    };

    let err = service(&fixture)
        .create_token(request_as(create_request(1, 3600), viewer.clone()))
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::PermissionDenied);

    service(&fixture)
        .list_tokens(request_as(ListTokensRequest::default(), viewer))
        .await
        .unwrap();
}
