//! JWT bearer grant (JWT profile): a user authenticates with an assertion
//! signed by one of its registered keys.
//!
//! Client credentials are optional. Without them the user acts as its own
//! client, with the instance default lifetimes.

use chrono::Utc;
use tracing::debug;

use super::{ClientCredentials, GrantHandlers, JwtBearerRequest};
use crate::context::RequestContext;
use crate::domain::{
    AccessTokenType, AuthMethodType, Client, ClientAuthMethod, GrantType, Session, SessionGrant,
    TokenReason, scope,
};
use crate::error::OAuthError;
use crate::keys::verifier::{self, AssertionClaims};
use crate::storage::User;
use crate::{Error, Result};

fn invalid_grant(description: &'static str) -> impl FnOnce(Error) -> Error {
    move |e| {
        OAuthError::invalid_grant()
            .with_description(description)
            .with_parent(e)
            .into()
    }
}

/// Client standing in for a user that presented no client credentials.
fn user_as_client(handlers: &GrantHandlers, user: &User) -> Client {
    Client {
        id: user.id.clone(),
        project_id: String::new(),
        resource_owner: user.resource_owner.clone(),
        auth_method: ClientAuthMethod::PrivateKeyJwt,
        secret_digest: None,
        keys: user.keys.clone(),
        grant_types: vec![GrantType::JwtBearer],
        redirect_uris: Vec::new(),
        access_token_type: AccessTokenType::Bearer,
        access_token_lifetime: handlers.settings.default_access_token_lifetime,
        id_token_lifetime: handlers.settings.default_id_token_lifetime,
        refresh_token_lifetime: handlers.settings.default_refresh_token_lifetime,
        clock_skew: std::time::Duration::ZERO,
        allowed_scopes: Vec::new(),
        access_token_role_assertion: false,
        id_token_role_assertion: false,
        id_token_userinfo_assertion: false,
        service_user: Some(user.id.clone()),
    }
}

pub(super) async fn exchange(
    handlers: &GrantHandlers,
    ctx: &RequestContext,
    credentials: &ClientCredentials,
    request: &JwtBearerRequest,
) -> Result<(Client, Session)> {
    let peeked: AssertionClaims =
        verifier::peek_claims(&request.assertion).map_err(invalid_grant("malformed assertion"))?;
    let user = handlers
        .users
        .user_by_id(&ctx.tenant, &peeked.iss)
        .await
        .map_err(|e| match e {
            Error::NotFound(_) => invalid_grant("assertion issuer is unknown")(e),
            other => other,
        })?;
    let kid = verifier::key_id(&request.assertion).map_err(invalid_grant("assertion has no key id"))?;
    let key = user
        .keys
        .iter()
        .find(|k| k.id == kid)
        .ok_or_else(|| OAuthError::invalid_grant().with_description("assertion key is unknown"))?;
    if key.expires_at.is_some_and(|exp| exp < Utc::now()) {
        return Err(OAuthError::invalid_grant()
            .with_description("assertion key expired")
            .into());
    }
    verifier::verify_assertion(
        &request.assertion,
        &key.public_key_pem,
        &handlers.settings.assertion_rules(ctx),
    )
    .map_err(invalid_grant("assertion is invalid"))?;
    debug!(tenant = %ctx.tenant, user_id = %user.id, kid = %kid, "Assertion verified");

    let client = if credentials.is_empty() {
        user_as_client(handlers, &user)
    } else {
        handlers.client(ctx, credentials, GrantType::JwtBearer).await?
    };
    GrantHandlers::check_scopes_allowed(&client, &request.scope)?;
    let scope = handlers
        .restrict_org_scopes(ctx, &user, request.scope.clone())
        .await?;
    let mut audience = vec![client.id.clone()];
    if !client.project_id.is_empty() {
        scope::append_unique(&mut audience, [client.project_id.clone()]);
    }
    scope::append_unique(&mut audience, scope::audience_from_scopes(&scope));

    let session = handlers
        .sessions
        .create_session(SessionGrant {
            tenant: ctx.tenant.clone(),
            session_id: None,
            user_id: user.id,
            resource_owner: user.resource_owner,
            client_id: client.id.clone(),
            audience,
            scope,
            auth_methods: vec![AuthMethodType::PrivateKey],
            auth_time: Utc::now(),
            nonce: None,
            preferred_language: user.preferred_language,
            reason: TokenReason::JwtProfile,
            actor: None,
            access_token_lifetime: client.access_token_lifetime,
            refresh_token_lifetime: None,
        })
        .await?;
    Ok((client, session))
}
