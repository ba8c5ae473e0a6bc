//! Introspection tests
//!
//! Client authentication failures are the only errors; every token problem
//! answers `{"active": false}`.

mod common;

use pretty_assertions::assert_eq;
use serde_json::json;

use common::{Fixture, ISSUER, ORG, SECRET};
use tokenforge::config::ClientSeed;
use tokenforge::domain::GrantType;
use tokenforge::domain::scope;
use tokenforge::error::ErrorCode;

#[tokio::test]
async fn client_credentials_token_is_active_with_claims() {
    // GIVEN: a service token with profile and email scope
    let f = Fixture::new();
    let token = f.client_token("svc", "openid profile email").await;

    // WHEN: the issuing client introspects it
    let info = f.introspect(&token.access_token, "svc", SECRET).await.unwrap();

    // THEN: active, with protocol and userinfo claims
    assert!(info.active);
    assert_eq!(info.client_id.as_deref(), Some("svc"));
    assert_eq!(info.token_type.as_deref(), Some("Bearer"));
    assert_eq!(info.iss.as_deref(), Some(ISSUER));
    assert_eq!(info.scope.as_deref(), Some("openid profile email"));
    assert_eq!(info.aud, vec!["svc".to_string(), "proj-svc".to_string()]);
    assert!(info.exp.unwrap() > info.iat.unwrap());
    assert_eq!(info.extra["preferred_username"], json!("svc-user@acme.example"));
    assert_eq!(info.extra["email"], json!("svc-user@acme.example"));

    // AND: `sub` appears once, from the token
    assert!(!info.extra.contains_key("sub"));
    let body = serde_json::to_value(&info).unwrap();
    assert_eq!(body["sub"], json!("svc-user"));
}

#[tokio::test]
async fn resource_owner_scope_adds_org_claims() {
    let f = Fixture::new();
    let token = f
        .client_token("svc", &format!("openid {}", scope::RESOURCE_OWNER))
        .await;
    let info = f.introspect(&token.access_token, "svc", SECRET).await.unwrap();
    assert_eq!(info.extra[scope::CLAIM_RESOURCE_OWNER_ID], json!("org1"));
    assert_eq!(info.extra[scope::CLAIM_RESOURCE_OWNER_NAME], json!("Acme"));
    assert_eq!(
        info.extra[scope::CLAIM_RESOURCE_OWNER_PRIMARY_DOMAIN],
        json!("acme.example")
    );
}

#[tokio::test]
async fn token_for_another_audience_is_inactive() {
    // GIVEN: a token issued to svc
    let f = Fixture::new();
    let token = f.client_token("svc", "openid").await;

    // WHEN: a different, valid client introspects it
    let info = f.introspect(&token.access_token, "admin", SECRET).await.unwrap();

    // THEN: nothing but inactive
    assert_eq!(serde_json::to_value(&info).unwrap(), json!({ "active": false }));
}

#[tokio::test]
async fn garbage_token_is_inactive_for_valid_client() {
    let f = Fixture::new();
    for token in ["", "not-a-token", "a.b", "a.b.c"] {
        let info = f.introspect(token, "svc", SECRET).await.unwrap();
        assert!(!info.active, "{token:?} should be inactive");
    }
}

#[tokio::test]
async fn bad_client_credentials_are_an_error() {
    let f = Fixture::new();
    let token = f.client_token("svc", "openid").await;

    let err = f.introspect(&token.access_token, "svc", "wrong").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnauthorizedClient);

    // Even when the token is bad too
    let err = f.introspect("garbage", "nobody", SECRET).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UnauthorizedClient);
}

#[tokio::test]
async fn clients_without_project_cannot_read_each_others_tokens() {
    // GIVEN: two service clients registered without a project id
    let f = Fixture::new();
    for id in ["a", "b"] {
        f.add_client(ClientSeed {
            id: id.into(),
            resource_owner: ORG.into(),
            secret: Some(SECRET.into()),
            grant_types: vec![GrantType::ClientCredentials],
            service_user: Some("svc-user".into()),
            ..ClientSeed::default()
        });
    }
    let token = f.client_token("a", "openid").await;

    // WHEN: the other client introspects a's token
    let info = f.introspect(&token.access_token, "b", SECRET).await.unwrap();

    // THEN: inactive, while a still sees it with an audience of only itself
    assert!(!info.active);
    let own = f.introspect(&token.access_token, "a", SECRET).await.unwrap();
    assert!(own.active);
    assert_eq!(own.aud, vec!["a".to_string()]);
}
