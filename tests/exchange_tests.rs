//! Token exchange and impersonation tests
//!
//! - Audience and scope can only narrow
//! - Impersonation needs the tenant switch and the actor's permission
//! - Personal access tokens are never exchanged

mod common;

use chrono::Utc;
use pretty_assertions::assert_eq;

use common::{
    ACCESS_TOKEN_TYPE, Fixture, ID_TOKEN_TYPE, ISSUER, SECRET, TENANT, TOKEN_EXCHANGE, USER_ID_TYPE,
    user,
};
use tokenforge::domain::{AccessToken, TokenType};
use tokenforge::error::ErrorCode;
use tokenforge::exchange::TOKEN_TYPE_NOT_APPLICABLE;
use tokenforge::storage::TenantSettings;
use tokenforge::token::{OpaqueTokenCodec, TokenResponse};

#[tokio::test]
async fn self_exchange_narrows_audience_and_scope() {
    // GIVEN: a service token for audience [svc, proj-svc] and scope openid profile
    let f = Fixture::new();
    let subject = f.client_token("svc", "openid profile").await;

    // WHEN: it is exchanged for a narrower token
    let response = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "svc"),
            ("client_secret", SECRET),
            ("subject_token", subject.access_token.as_str()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
            ("audience", "svc"),
            ("scope", "openid"),
        ])
        .await
        .unwrap();

    // THEN: the new token carries exactly the requested subset, no actor
    assert_eq!(response.issued_token_type, Some(TokenType::AccessToken));
    assert_eq!(response.token_type, "Bearer");
    assert_eq!(response.scope.as_deref(), Some("openid"));
    assert!(response.id_token.is_some());

    let info = f.introspect(&response.access_token, "svc", SECRET).await.unwrap();
    assert!(info.active);
    assert_eq!(info.aud, vec!["svc".to_string()]);
    assert_eq!(info.sub.as_deref(), Some("svc-user"));
    assert!(info.act.is_none());
}

#[tokio::test]
async fn exchange_cannot_widen() {
    let f = Fixture::new();
    let subject = f.client_token("svc", "openid").await;
    let exchange = |extra: (&'static str, &'static str)| {
        vec![
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "svc"),
            ("client_secret", SECRET),
            ("subject_token", subject.access_token.as_str()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
            extra,
        ]
    };

    let err = f.token(&exchange(("audience", "someone-else"))).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTarget);

    let err = f.token(&exchange(("scope", "openid email"))).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidScope);

    let err = f
        .token(&exchange(("resource", "https://api.example")))
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidTarget);
}

#[tokio::test]
async fn id_token_can_be_requested() {
    let f = Fixture::new();
    let subject = f.client_token("svc", "openid").await;
    let response = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "svc"),
            ("client_secret", SECRET),
            ("subject_token", subject.access_token.as_str()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
            ("requested_token_type", ID_TOKEN_TYPE),
        ])
        .await
        .unwrap();
    assert_eq!(response.token_type, TOKEN_TYPE_NOT_APPLICABLE);
    assert_eq!(response.issued_token_type, Some(TokenType::IdToken));
    assert!(response.refresh_token.is_none());
    assert!(response.id_token.is_none());
}

#[tokio::test]
async fn exchange_disabled_for_tenant() {
    let f = Fixture::with_settings(TenantSettings::default());
    let subject = f.client_token("svc", "openid").await;
    let err = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "svc"),
            ("client_secret", SECRET),
            ("subject_token", subject.access_token.as_str()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn impersonation_puts_actor_into_act_chain() {
    // GIVEN: an admin service token whose user holds the impersonation permission
    let f = Fixture::new();
    let actor = f.client_token("admin", "openid").await;

    // WHEN: the admin asks for a token as alice
    let response = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "admin"),
            ("client_secret", SECRET),
            ("subject_token", "alice"),
            ("subject_token_type", USER_ID_TYPE),
            ("actor_token", actor.access_token.as_str()),
            ("actor_token_type", ACCESS_TOKEN_TYPE),
        ])
        .await
        .unwrap();

    // THEN: the token is alice's, acted on by the admin
    let info = f
        .introspect(&response.access_token, "admin", SECRET)
        .await
        .unwrap();
    assert!(info.active);
    assert_eq!(info.sub.as_deref(), Some("alice"));
    let act = info.act.unwrap();
    assert_eq!(act.user_id, "admin-user");
    assert_eq!(act.issuer, ISSUER);
    assert_eq!(act.depth(), 1);
}

/// `admin` client acting as user `subject` on behalf of `actor`.
async fn impersonate(f: &Fixture, subject: &str, actor: &str) -> TokenResponse {
    f.token(&[
        ("grant_type", TOKEN_EXCHANGE),
        ("client_id", "admin"),
        ("client_secret", SECRET),
        ("subject_token", subject),
        ("subject_token_type", USER_ID_TYPE),
        ("actor_token", actor),
        ("actor_token_type", ACCESS_TOKEN_TYPE),
    ])
    .await
    .unwrap()
}

#[tokio::test]
async fn impersonation_through_impersonated_actor_nests_the_chain() {
    // GIVEN: admin-user impersonating ops-user, who may impersonate as well
    let f = Fixture::new();
    f.store.insert_user(TENANT, user("ops-user", &["impersonation"]));
    let admin = f.client_token("admin", "openid").await;
    let ops = impersonate(&f, "ops-user", &admin.access_token).await;

    // WHEN: that token acts for alice
    let response = impersonate(&f, "alice", &ops.access_token).await;

    // THEN: the newest actor heads the chain, the earlier one is nested
    let info = f
        .introspect(&response.access_token, "admin", SECRET)
        .await
        .unwrap();
    assert_eq!(info.sub.as_deref(), Some("alice"));
    let act = info.act.unwrap();
    assert_eq!(act.depth(), 2);
    assert_eq!(act.user_id, "ops-user");
    let previous = act.actor.unwrap();
    assert_eq!(previous.user_id, "admin-user");
    assert_eq!(previous.issuer, ISSUER);
    assert!(previous.actor.is_none());
}

#[tokio::test]
async fn impersonation_requires_permission() {
    let f = Fixture::new();
    let actor = f.client_token("svc", "openid").await;
    let err = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "svc"),
            ("client_secret", SECRET),
            ("subject_token", "alice"),
            ("subject_token_type", USER_ID_TYPE),
            ("actor_token", actor.access_token.as_str()),
            ("actor_token_type", ACCESS_TOKEN_TYPE),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::AccessDenied);
}

#[tokio::test]
async fn impersonation_requires_tenant_switch() {
    let f = Fixture::with_settings(TenantSettings {
        token_exchange_enabled: true,
        impersonation_enabled: false,
        debug_parent_error: false,
    });
    let actor = f.client_token("admin", "openid").await;
    let err = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "admin"),
            ("client_secret", SECRET),
            ("subject_token", "alice"),
            ("subject_token_type", USER_ID_TYPE),
            ("actor_token", actor.access_token.as_str()),
            ("actor_token_type", ACCESS_TOKEN_TYPE),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn user_id_subject_needs_an_actor() {
    let f = Fixture::new();
    let err = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "admin"),
            ("client_secret", SECRET),
            ("subject_token", "alice"),
            ("subject_token_type", USER_ID_TYPE),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn personal_access_tokens_are_not_exchanged() {
    // GIVEN: a valid personal access token of alice
    let f = Fixture::new();
    let now = Utc::now();
    f.store.insert_personal_access_token(
        TENANT,
        AccessToken {
            token_id: "pat-1".into(),
            user_id: "alice".into(),
            subject: "alice".into(),
            resource_owner: common::ORG.into(),
            client_id: String::new(),
            audience: vec!["svc".into()],
            scope: vec!["openid".into()],
            auth_methods: Vec::new(),
            auth_time: now,
            creation: now,
            expiration: now + chrono::Duration::hours(1),
            actor: None,
            preferred_language: None,
            is_pat: true,
        },
    );
    let pat = OpaqueTokenCodec::new("integration-test-secret")
        .encode("pat-1", "alice")
        .unwrap();

    // THEN: the PAT introspects as active but cannot be exchanged
    assert!(f.introspect(&pat, "svc", SECRET).await.unwrap().active);
    let err = f
        .token(&[
            ("grant_type", TOKEN_EXCHANGE),
            ("client_id", "svc"),
            ("client_secret", SECRET),
            ("subject_token", pat.as_str()),
            ("subject_token_type", ACCESS_TOKEN_TYPE),
        ])
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}
