//! `client_credentials` grant: a confidential client acts as its service
//! user. No refresh token, no ID token.

use chrono::Utc;

use super::{ClientCredentialsRequest, GrantHandlers};
use crate::context::RequestContext;
use crate::domain::{Client, Session, SessionGrant, TokenReason};
use crate::error::OAuthError;
use crate::Result;

pub(super) async fn exchange(
    handlers: &GrantHandlers,
    ctx: &RequestContext,
    client: &Client,
    request: &ClientCredentialsRequest,
) -> Result<Session> {
    if client.is_public() {
        return Err(OAuthError::unauthorized_client()
            .with_description("public clients cannot use client_credentials")
            .into());
    }
    let service_user = client.service_user.as_deref().ok_or_else(|| {
        OAuthError::unauthorized_client().with_description("client has no service user")
    })?;
    GrantHandlers::check_scopes_allowed(client, &request.scope)?;
    let user = handlers
        .users
        .user_by_id(&ctx.tenant, service_user)
        .await
        .map_err(|e| OAuthError::unauthorized_client().with_parent(e))?;
    let scope = handlers
        .restrict_org_scopes(ctx, &user, request.scope.clone())
        .await?;

    handlers
        .sessions
        .create_session(SessionGrant {
            tenant: ctx.tenant.clone(),
            session_id: None,
            user_id: user.id,
            resource_owner: user.resource_owner,
            client_id: client.id.clone(),
            audience: client.default_audience(&scope),
            scope,
            auth_methods: Vec::new(),
            auth_time: Utc::now(),
            nonce: None,
            preferred_language: user.preferred_language,
            reason: TokenReason::ClientCredentials,
            actor: None,
            access_token_lifetime: client.access_token_lifetime,
            refresh_token_lifetime: None,
        })
        .await
}
