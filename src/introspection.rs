//! Token introspection (RFC 7662).
//!
//! Client authentication and token verification run concurrently under
//! [`join_cancel_on_error`]. Both results are read before anything is
//! decided. When a token failure cancelled client authentication, the
//! authentication is completed on its own before answering, so an invalid
//! token never turns into a client error.
//!
//! A failed client authentication is the only error surfaced;
//! every token problem, including a token issued for another audience, is
//! answered with `{"active": false}` so callers learn nothing about why.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::context::RequestContext;
use crate::domain::{AccessToken, Client, TokenActor, scope};
use crate::error::OAuthError;
use crate::grant::{ClientAuthenticator, ClientCredentials};
use crate::join::join_cancel_on_error;
use crate::storage::{Claims, UserLookup};
use crate::token::AccessTokenVerifier;
use crate::{Error, Result};

/// Introspection response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntrospectionResponse {
    /// Whether the token is active
    pub active: bool,
    /// Space-delimited scope
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client the token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Always `Bearer` for active tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issued at
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    /// Not before
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nbf: Option<i64>,
    /// Subject
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    /// Audience
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aud: Vec<String>,
    /// Issuer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    /// Token id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jti: Option<String>,
    /// Delegation chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<TokenActor>,
    /// Userinfo and resource-owner claims
    #[serde(flatten)]
    pub extra: Claims,
}

impl IntrospectionResponse {
    /// `{"active": false}`
    #[must_use]
    pub fn inactive() -> Self {
        Self::default()
    }
}

/// Answers introspection requests.
pub struct IntrospectionEngine {
    client_auth: ClientAuthenticator,
    verifier: AccessTokenVerifier,
    users: Arc<dyn UserLookup>,
}

impl IntrospectionEngine {
    /// New engine.
    #[must_use]
    pub fn new(
        client_auth: ClientAuthenticator,
        verifier: AccessTokenVerifier,
        users: Arc<dyn UserLookup>,
    ) -> Self {
        Self {
            client_auth,
            verifier,
            users,
        }
    }

    /// Introspect `token` on behalf of the client behind `credentials`.
    pub async fn introspect(
        &self,
        ctx: &RequestContext,
        token: &str,
        credentials: &ClientCredentials,
    ) -> Result<(IntrospectionResponse, Client)> {
        let (client, access) = join_cancel_on_error(
            &ctx.cancel,
            self.client_auth.authenticate(ctx, credentials),
            self.verifier.verify(ctx, token),
        )
        .await;

        let client = match client {
            Ok(client) => client,
            // The token check failed first and cut authentication short. The
            // answer depends on the client alone now, so finish it.
            Err(Error::Cancelled) if !ctx.cancel.is_cancelled() => {
                debug!(tenant = %ctx.tenant, "Client authentication cancelled by token failure");
                self.client_auth
                    .authenticate(ctx, credentials)
                    .await
                    .map_err(|e| OAuthError::unauthorized_client().with_parent(e))?
            }
            Err(e) => return Err(OAuthError::unauthorized_client().with_parent(e).into()),
        };
        let access = match access {
            Ok(access) => access,
            Err(e) => {
                debug!(tenant = %ctx.tenant, client_id = %client.id, error = %e, "Token inactive");
                return Ok((IntrospectionResponse::inactive(), client));
            }
        };
        if !client.in_audience(&access.audience) {
            debug!(tenant = %ctx.tenant, client_id = %client.id, "Token not issued for introspecting client");
            return Ok((IntrospectionResponse::inactive(), client));
        }
        match self.active_response(ctx, access).await {
            Ok(response) => Ok((response, client)),
            Err(e) => {
                debug!(tenant = %ctx.tenant, error = %e, "Claims lookup failed, reporting inactive");
                Ok((IntrospectionResponse::inactive(), client))
            }
        }
    }

    async fn active_response(
        &self,
        ctx: &RequestContext,
        access: AccessToken,
    ) -> Result<IntrospectionResponse> {
        let mut extra = self
            .users
            .userinfo(&ctx.tenant, &access.user_id, &access.scope, &access.audience)
            .await?;
        extra.remove("sub");
        if access.scope.iter().any(|s| s == scope::RESOURCE_OWNER) {
            let org = self.users.org_by_id(&ctx.tenant, &access.resource_owner).await?;
            extra.insert(scope::CLAIM_RESOURCE_OWNER_ID.into(), Value::String(org.id));
            extra.insert(scope::CLAIM_RESOURCE_OWNER_NAME.into(), Value::String(org.name));
            extra.insert(
                scope::CLAIM_RESOURCE_OWNER_PRIMARY_DOMAIN.into(),
                Value::String(org.primary_domain),
            );
        }
        Ok(IntrospectionResponse {
            active: true,
            scope: Some(scope::join(&access.scope)),
            client_id: Some(access.client_id),
            token_type: Some("Bearer".into()),
            exp: Some(access.expiration.timestamp()),
            iat: Some(access.creation.timestamp()),
            nbf: Some(access.creation.timestamp()),
            sub: Some(access.subject),
            aud: access.audience,
            iss: Some(ctx.issuer.clone()),
            jti: Some(access.token_id),
            act: access.actor,
            extra,
        })
    }
}
