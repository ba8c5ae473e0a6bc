//! Device authorization grant (RFC 8628), polled by the device.

use chrono::Utc;
use tracing::debug;

use super::{DeviceCodeRequest, GrantHandlers, not_found_as_invalid_grant};
use crate::context::RequestContext;
use crate::domain::{Client, GrantType, Session, SessionGrant, TokenReason, scope};
use crate::error::{ErrorCode, OAuthError};
use crate::storage::DeviceAuthState;
use crate::{Error, Result};

pub(super) async fn exchange(
    handlers: &GrantHandlers,
    ctx: &RequestContext,
    client: &Client,
    request: &DeviceCodeRequest,
) -> Result<Session> {
    let auth = tokio::time::timeout(
        handlers.settings.device_poll_deadline,
        handlers.devices.device_auth(&ctx.tenant, &request.device_code),
    )
    .await
    .map_err(|_| OAuthError::new(ErrorCode::SlowDown))?
    .map_err(not_found_as_invalid_grant)?;
    if auth.client_id != client.id {
        return Err(OAuthError::invalid_grant()
            .with_description("device code was issued to another client")
            .into());
    }

    match auth.state {
        DeviceAuthState::Initiated => return Err(OAuthError::new(ErrorCode::AuthorizationPending).into()),
        DeviceAuthState::Denied => return Err(OAuthError::new(ErrorCode::AccessDenied).into()),
        DeviceAuthState::Expired => return Err(OAuthError::new(ErrorCode::ExpiredToken).into()),
        DeviceAuthState::Done => {
            return Err(OAuthError::invalid_grant()
                .with_description("device code was already used")
                .into());
        }
        DeviceAuthState::Approved => {}
    }

    let (Some(user_id), Some(resource_owner)) = (auth.user_id, auth.resource_owner) else {
        return Err(Error::internal("approved device authorization has no user"));
    };
    handlers
        .devices
        .consume_device_auth(&ctx.tenant, &request.device_code)
        .await
        .map_err(|e| match e {
            Error::PreconditionFailed(_) => OAuthError::invalid_grant()
                .with_description("device code was already used")
                .with_parent(e)
                .into(),
            other => not_found_as_invalid_grant(other),
        })?;
    debug!(tenant = %ctx.tenant, client_id = %client.id, "Device authorization consumed");

    let refresh = auth.scope.iter().any(|s| s == scope::OFFLINE_ACCESS)
        && client.allows_grant(GrantType::RefreshToken);
    let audience = if auth.audience.is_empty() {
        client.default_audience(&auth.scope)
    } else {
        auth.audience
    };
    handlers
        .sessions
        .create_session(SessionGrant {
            tenant: ctx.tenant.clone(),
            session_id: None,
            user_id,
            resource_owner,
            client_id: client.id.clone(),
            audience,
            scope: auth.scope,
            auth_methods: auth.auth_methods,
            auth_time: auth.auth_time.unwrap_or_else(Utc::now),
            nonce: None,
            preferred_language: auth.preferred_language,
            reason: TokenReason::DeviceCode,
            actor: None,
            access_token_lifetime: client.access_token_lifetime,
            refresh_token_lifetime: refresh.then_some(client.refresh_token_lifetime),
        })
        .await
}
