//! `authorization_code` grant.
//!
//! Two implementations coexist and are picked per code by its prefix:
//!
//! - [`LegacyGrant`] looks the request up, checks it, deletes it and then
//!   creates the session. Deletion is what makes the code single-use.
//! - [`V2Grant`] hands the compliance check to the session store, which runs
//!   it while consuming the request in one atomic step.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::{CodeRequest, not_found_as_invalid_grant};
use crate::context::RequestContext;
use crate::domain::{Client, GrantType, Session, SessionGrant, TokenReason, scope};
use crate::error::OAuthError;
use crate::storage::{AuthRequest, AuthRequestStore, CodeChallenge, CodeChallengeMethod, SessionStore};
use crate::Result;

/// Prefix of codes issued by the V2 authorization flow.
pub const V2_CODE_PREFIX: &str = "V2_";

/// Exchanges an authorization code for a session.
#[async_trait::async_trait]
pub trait AuthorizationGrant: Send + Sync {
    /// Redeem `request.code` for `client`.
    async fn exchange(
        &self,
        ctx: &RequestContext,
        client: &Client,
        request: &CodeRequest,
    ) -> Result<Session>;
}

/// Check that a code redemption matches its authorization request.
pub fn check_compliance(client: &Client, request: &CodeRequest, auth: &AuthRequest) -> Result<()> {
    if auth.client_id != client.id {
        return Err(OAuthError::invalid_grant()
            .with_description("code was issued to another client")
            .into());
    }
    if auth.redirect_uri != request.redirect_uri {
        return Err(OAuthError::invalid_grant()
            .with_description("redirect_uri does not match the authorization request")
            .into());
    }
    check_pkce(client, auth.code_challenge.as_ref(), request.code_verifier.as_deref())
}

fn check_pkce(client: &Client, challenge: Option<&CodeChallenge>, verifier: Option<&str>) -> Result<()> {
    let Some(challenge) = challenge else {
        if client.is_public() {
            return Err(OAuthError::invalid_grant()
                .with_description("public clients must use PKCE")
                .into());
        }
        return Ok(());
    };
    let verifier = verifier.ok_or_else(|| {
        OAuthError::invalid_grant().with_description("code_verifier is missing")
    })?;
    let computed = match challenge.method {
        CodeChallengeMethod::Plain => verifier.to_string(),
        CodeChallengeMethod::S256 => URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())),
    };
    if bool::from(computed.as_bytes().ct_eq(challenge.challenge.as_bytes())) {
        Ok(())
    } else {
        Err(OAuthError::invalid_grant()
            .with_description("code_verifier does not match the code_challenge")
            .into())
    }
}

/// Session inputs for a compliant authorization request.
#[must_use]
pub fn session_grant(tenant: &str, client: &Client, auth: &AuthRequest) -> SessionGrant {
    let refresh = auth.scope.iter().any(|s| s == scope::OFFLINE_ACCESS)
        && client.allows_grant(GrantType::RefreshToken);
    let audience = if auth.audience.is_empty() {
        client.default_audience(&auth.scope)
    } else {
        auth.audience.clone()
    };
    SessionGrant {
        tenant: tenant.to_string(),
        session_id: auth.session_id.clone(),
        user_id: auth.user_id.clone(),
        resource_owner: auth.resource_owner.clone(),
        client_id: client.id.clone(),
        audience,
        scope: auth.scope.clone(),
        auth_methods: auth.auth_methods.clone(),
        auth_time: auth.auth_time,
        nonce: auth.nonce.clone(),
        preferred_language: auth.preferred_language.clone(),
        reason: TokenReason::AuthRequest,
        actor: None,
        access_token_lifetime: client.access_token_lifetime,
        refresh_token_lifetime: refresh.then_some(client.refresh_token_lifetime),
    }
}

/// Lookup, check, delete, create.
pub struct LegacyGrant {
    requests: Arc<dyn AuthRequestStore>,
    sessions: Arc<dyn SessionStore>,
}

impl LegacyGrant {
    /// New legacy grant.
    #[must_use]
    pub fn new(requests: Arc<dyn AuthRequestStore>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { requests, sessions }
    }
}

#[async_trait::async_trait]
impl AuthorizationGrant for LegacyGrant {
    async fn exchange(
        &self,
        ctx: &RequestContext,
        client: &Client,
        request: &CodeRequest,
    ) -> Result<Session> {
        let auth = self
            .requests
            .auth_request_by_code(&ctx.tenant, &request.code)
            .await
            .map_err(not_found_as_invalid_grant)?;
        check_compliance(client, request, &auth)?;
        // Whoever deletes the request first owns the code.
        self.requests
            .delete_auth_request(&ctx.tenant, &auth.id)
            .await
            .map_err(not_found_as_invalid_grant)?;
        debug!(tenant = %ctx.tenant, request_id = %auth.id, "Authorization request consumed");
        self.sessions
            .create_session(session_grant(&ctx.tenant, client, &auth))
            .await
    }
}

/// Check and consume inside the session store.
pub struct V2Grant {
    sessions: Arc<dyn SessionStore>,
}

impl V2Grant {
    /// New V2 grant.
    #[must_use]
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait::async_trait]
impl AuthorizationGrant for V2Grant {
    async fn exchange(
        &self,
        ctx: &RequestContext,
        client: &Client,
        request: &CodeRequest,
    ) -> Result<Session> {
        let tenant = ctx.tenant.as_str();
        let check = |auth: &AuthRequest| -> Result<SessionGrant> {
            check_compliance(client, request, auth)?;
            Ok(session_grant(tenant, client, auth))
        };
        self.sessions
            .create_session_from_auth_request(tenant, &request.code, &check)
            .await
            .map_err(not_found_as_invalid_grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::client::tests::client;
    use crate::domain::{AuthMethodType, ClientAuthMethod};
    use crate::error::ErrorCode;
    use crate::storage::{InMemoryStore, TenantSettings};
    use chrono::Utc;

    const VERIFIER: &str = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

    fn auth_request(code: &str, challenge: Option<CodeChallenge>) -> AuthRequest {
        AuthRequest {
            id: format!("req-{code}"),
            code: code.into(),
            client_id: "app".into(),
            user_id: "u1".into(),
            resource_owner: "org1".into(),
            redirect_uri: "https://app.example/cb".into(),
            scope: vec!["openid".into(), "offline_access".into()],
            audience: Vec::new(),
            code_challenge: challenge,
            nonce: Some("n-1".into()),
            auth_methods: vec![AuthMethodType::Password],
            auth_time: Utc::now(),
            preferred_language: None,
            session_id: None,
        }
    }

    fn redeem(code: &str, verifier: Option<&str>) -> CodeRequest {
        CodeRequest {
            code: code.into(),
            redirect_uri: "https://app.example/cb".into(),
            code_verifier: verifier.map(str::to_string),
        }
    }

    fn s256() -> CodeChallenge {
        CodeChallenge {
            challenge: URL_SAFE_NO_PAD.encode(Sha256::digest(VERIFIER.as_bytes())),
            method: CodeChallengeMethod::S256,
        }
    }

    fn ctx() -> RequestContext {
        RequestContext::new("t1", "https://t1.tokenforge.test", TenantSettings::default())
    }

    #[test]
    fn pkce_s256_and_plain() {
        let c = client();
        let auth = auth_request("c1", Some(s256()));
        assert!(check_compliance(&c, &redeem("c1", Some(VERIFIER)), &auth).is_ok());
        assert!(check_compliance(&c, &redeem("c1", Some("wrong")), &auth).is_err());
        assert!(check_compliance(&c, &redeem("c1", None), &auth).is_err());

        let plain = CodeChallenge {
            challenge: "abc".into(),
            method: CodeChallengeMethod::Plain,
        };
        let auth = auth_request("c1", Some(plain));
        assert!(check_compliance(&c, &redeem("c1", Some("abc")), &auth).is_ok());
    }

    #[test]
    fn public_client_requires_pkce() {
        let mut c = client();
        c.auth_method = ClientAuthMethod::None;
        let err = check_compliance(&c, &redeem("c1", None), &auth_request("c1", None)).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidGrant);
    }

    #[test]
    fn redirect_uri_must_match_exactly() {
        let c = client();
        let mut req = redeem("c1", None);
        req.redirect_uri = "https://app.example/cb/".into();
        let err = check_compliance(&c, &req, &auth_request("c1", None)).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidGrant);
    }

    #[test]
    fn offline_access_issues_refresh_token_only_when_allowed() {
        let mut c = client();
        let auth = auth_request("c1", None);
        assert!(session_grant("t1", &c, &auth).refresh_token_lifetime.is_some());
        c.grant_types.retain(|g| *g != GrantType::RefreshToken);
        assert!(session_grant("t1", &c, &auth).refresh_token_lifetime.is_none());
        assert_eq!(session_grant("t1", &c, &auth).audience, vec!["app", "proj"]);
    }

    #[tokio::test]
    async fn legacy_code_is_single_use() {
        let store = Arc::new(InMemoryStore::default());
        store.insert_auth_request("t1", auth_request("c1", Some(s256())));
        let grant = LegacyGrant::new(store.clone(), store.clone());

        let session = grant
            .exchange(&ctx(), &client(), &redeem("c1", Some(VERIFIER)))
            .await
            .unwrap();
        assert_eq!(session.reason, TokenReason::AuthRequest);
        assert!(session.refresh_token.is_some());

        let err = grant
            .exchange(&ctx(), &client(), &redeem("c1", Some(VERIFIER)))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidGrant);
    }

    #[tokio::test]
    async fn v2_failed_check_keeps_the_request() {
        // GIVEN: a V2 code with a stored S256 challenge
        let store = Arc::new(InMemoryStore::default());
        store.insert_auth_request("t1", auth_request("V2_c1", Some(s256())));
        let grant = V2Grant::new(store.clone());

        // WHEN: the first redemption presents a wrong verifier
        let err = grant
            .exchange(&ctx(), &client(), &redeem("V2_c1", Some("wrong")))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidGrant);

        // THEN: the request survived and the correct verifier still works once
        assert!(
            grant
                .exchange(&ctx(), &client(), &redeem("V2_c1", Some(VERIFIER)))
                .await
                .is_ok()
        );
        assert!(
            grant
                .exchange(&ctx(), &client(), &redeem("V2_c1", Some(VERIFIER)))
                .await
                .is_err()
        );
    }
}
