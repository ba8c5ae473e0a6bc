//! `refresh_token` grant. The store rotates the token atomically; this
//! module only supplies the compliance check.

use super::{GrantHandlers, RefreshTokenRequest, not_found_as_invalid_grant};
use crate::context::RequestContext;
use crate::domain::{Client, Session, scope};
use crate::error::OAuthError;
use crate::storage::TokenLifetimes;
use crate::Result;

/// Scope granted on refresh: the original scope when none was requested,
/// otherwise the request, which must not widen the original.
pub fn refreshed_scope(session: &Session, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(session.scope.clone());
    }
    if !scope::is_subset(requested, &session.scope) {
        return Err(OAuthError::invalid_scope()
            .with_description("requested scope exceeds the original grant")
            .into());
    }
    Ok(requested.to_vec())
}

pub(super) async fn exchange(
    handlers: &GrantHandlers,
    ctx: &RequestContext,
    client: &Client,
    request: &RefreshTokenRequest,
) -> Result<Session> {
    let client_id = client.id.as_str();
    let check = |session: &Session, requested: &[String]| -> Result<Vec<String>> {
        if session.client_id != client_id {
            return Err(OAuthError::invalid_grant()
                .with_description("refresh token was issued to another client")
                .into());
        }
        refreshed_scope(session, requested)
    };
    let lifetimes = TokenLifetimes {
        access: client.access_token_lifetime,
        refresh: client.refresh_token_lifetime,
    };
    handlers
        .sessions
        .exchange_refresh_token(
            &ctx.tenant,
            &request.refresh_token,
            &request.scope,
            lifetimes,
            &check,
        )
        .await
        .map_err(not_found_as_invalid_grant)
}
