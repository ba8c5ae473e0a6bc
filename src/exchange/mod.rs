//! Token exchange (RFC 8693) and impersonation.
//!
//! A request ends in one of two outcomes:
//!
//! - **exchange**: the subject token is re-minted for the same user, possibly
//!   with a narrower audience or scope. The subject's delegation chain is
//!   carried over unchanged.
//! - **impersonation**: a distinct actor token authorizes acting as the
//!   subject. The actor needs the `impersonation` permission on the subject's
//!   organization and becomes the head of the `act` chain.
//!
//! Either way exactly one session is created before anything is minted.

mod validation;
mod verify;

pub use validation::{audience as narrow_audience, narrow, scopes as narrow_scopes};

use std::sync::Arc;

use tracing::{debug, info};

use crate::context::RequestContext;
use crate::domain::{
    AccessTokenType, Client, ExchangeToken, Session, SessionGrant, TokenReason, TokenType, scope,
};
use crate::error::OAuthError;
use crate::keys::verifier::{AssertionRules, JwtVerifier};
use crate::storage::{SessionStore, UserLookup};
use crate::token::{AccessTokenVerifier, Minter, TokenResponse};
use crate::{Error, Result};

/// Permission an actor needs on the subject's organization.
pub const IMPERSONATION_PERMISSION: &str = "impersonation";

/// `token_type` of an exchange response whose token is not an access token.
pub const TOKEN_TYPE_NOT_APPLICABLE: &str = "N_A";

/// Token exchange parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenExchangeRequest {
    /// Token representing the subject
    pub subject_token: String,
    /// Its type
    pub subject_token_type: TokenType,
    /// Token representing the acting party
    pub actor_token: Option<String>,
    /// Its type
    pub actor_token_type: Option<TokenType>,
    /// Requested token type, access token when absent
    pub requested_token_type: Option<TokenType>,
    /// Requested audience
    pub audience: Vec<String>,
    /// Requested scope
    pub scope: Vec<String>,
    /// `resource` indicators (unsupported)
    pub resource: Vec<String>,
}

/// Runs token exchange requests.
pub struct TokenExchangeEngine {
    access: AccessTokenVerifier,
    jwt: JwtVerifier,
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserLookup>,
    minter: Arc<Minter>,
    assertion_rules: AssertionRules,
}

impl TokenExchangeEngine {
    /// New engine. `assertion_rules.audience` is replaced by the request's
    /// issuer at verification time.
    #[must_use]
    pub fn new(
        access: AccessTokenVerifier,
        jwt: JwtVerifier,
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserLookup>,
        minter: Arc<Minter>,
        assertion_rules: AssertionRules,
    ) -> Self {
        Self {
            access,
            jwt,
            sessions,
            users,
            minter,
            assertion_rules,
        }
    }

    /// Exchange tokens for an authenticated `client`.
    pub async fn exchange(
        &self,
        ctx: &RequestContext,
        client: &Client,
        request: TokenExchangeRequest,
    ) -> Result<(TokenResponse, Session)> {
        if !request.resource.is_empty() {
            return Err(OAuthError::invalid_target()
                .with_description("resource parameter is not supported")
                .into());
        }
        if !ctx.settings.token_exchange_enabled {
            return Err(Error::precondition("token exchange is disabled for this tenant"));
        }
        let requested_type = request.requested_token_type.unwrap_or(TokenType::AccessToken);
        if !requested_type.is_issuable() {
            return Err(OAuthError::invalid_request()
                .with_description(format!("requested_token_type {requested_type} is not supported"))
                .into());
        }

        let subject = self
            .verify_subject(ctx, client, &request.subject_token, request.subject_token_type)
            .await?;

        let needs_actor = matches!(
            request.subject_token_type,
            TokenType::Jwt | TokenType::UserId
        ) || request.actor_token.is_some();
        let (ctx, actor) = if needs_actor {
            let (token, token_type) = match (&request.actor_token, request.actor_token_type) {
                (Some(token), Some(token_type)) => (token, token_type),
                (None, _) => {
                    return Err(OAuthError::invalid_request()
                        .with_description(format!(
                            "actor_token is required for {}",
                            request.subject_token_type
                        ))
                        .into());
                }
                (Some(_), None) => {
                    return Err(OAuthError::invalid_request()
                        .with_description("actor_token_type is missing")
                        .into());
                }
            };
            if !ctx.settings.impersonation_enabled {
                return Err(Error::precondition("impersonation is disabled for this tenant"));
            }
            let actor = self.verify_actor(ctx, token, token_type).await?;
            (ctx.with_principal(actor.user_id.clone()), Some(actor))
        } else {
            (ctx.clone(), None)
        };

        let (actor_audience, actor_scopes) = actor
            .as_ref()
            .map(|a| (a.audience.as_slice(), a.scopes.as_slice()))
            .unwrap_or_default();
        let audience = validation::audience(&request.audience, &subject.audience, actor_audience)?;
        let scopes = validation::scopes(&request.scope, &subject.scopes, actor_scopes)?;
        let scopes = client.restrict_scopes(&scopes);

        let is_self = actor.is_none()
            || request.actor_token.as_deref() == Some(request.subject_token.as_str());
        let (reason, chain) = if is_self {
            (TokenReason::Exchange, subject.actor.clone())
        } else {
            let actor = actor
                .as_ref()
                .ok_or_else(|| Error::internal("impersonation without actor"))?;
            let principal = ctx.principal.as_deref().unwrap_or(&actor.user_id);
            self.users
                .check_permission(
                    &ctx.tenant,
                    principal,
                    IMPERSONATION_PERMISSION,
                    &subject.resource_owner,
                )
                .await?;
            (TokenReason::Impersonation, Some(actor.as_actor()))
        };

        let refresh = requested_type == TokenType::AccessToken
            && scopes.iter().any(|s| s == scope::OFFLINE_ACCESS);
        let session = self
            .sessions
            .create_session(SessionGrant {
                tenant: ctx.tenant.clone(),
                session_id: None,
                user_id: subject.user_id.clone(),
                resource_owner: subject.resource_owner.clone(),
                client_id: client.id.clone(),
                audience,
                scope: scopes,
                auth_methods: subject.auth_methods.clone(),
                auth_time: subject.auth_time,
                nonce: None,
                preferred_language: subject.preferred_language.clone(),
                reason,
                actor: chain,
                access_token_lifetime: client.access_token_lifetime,
                refresh_token_lifetime: refresh.then_some(client.refresh_token_lifetime),
            })
            .await?;
        info!(
            tenant = %ctx.tenant,
            client_id = %client.id,
            subject = %subject.user_id,
            reason = ?reason,
            "Token exchanged"
        );

        let response = self.mint(&ctx, &session, client, requested_type).await?;
        Ok((response, session))
    }

    async fn mint(
        &self,
        ctx: &RequestContext,
        session: &Session,
        client: &Client,
        requested_type: TokenType,
    ) -> Result<TokenResponse> {
        let signer = self.minter.request_signer(ctx);
        let openid = session.scope.iter().any(|s| s == scope::OPENID);
        let (token, token_type, id_token) = match requested_type {
            TokenType::AccessToken | TokenType::Jwt => {
                let format = if requested_type == TokenType::Jwt {
                    AccessTokenType::Jwt
                } else {
                    client.access_token_type
                };
                let token = self
                    .minter
                    .access_token(ctx, &signer, session, client, format)
                    .await?;
                let id_token = if openid {
                    Some(
                        self.minter
                            .id_token(ctx, &signer, session, client, Some(&token))
                            .await?,
                    )
                } else {
                    None
                };
                (token, "Bearer", id_token)
            }
            TokenType::IdToken => {
                let token = self.minter.id_token(ctx, &signer, session, client, None).await?;
                (token, TOKEN_TYPE_NOT_APPLICABLE, None)
            }
            TokenType::RefreshToken | TokenType::UserId => {
                return Err(Error::internal(format!("{requested_type} is not issuable")));
            }
        };
        debug!(tenant = %ctx.tenant, token_id = %session.token_id, issued = %requested_type, "Exchange tokens minted");
        Ok(TokenResponse {
            access_token: token,
            token_type: token_type.into(),
            expires_in: session.expires_in(),
            refresh_token: session.refresh_token.clone(),
            id_token,
            scope: Some(scope::join(&session.scope)),
            issued_token_type: Some(requested_type),
        })
    }

    async fn verify_subject(
        &self,
        ctx: &RequestContext,
        client: &Client,
        token: &str,
        token_type: TokenType,
    ) -> Result<ExchangeToken> {
        let verified = match token_type {
            TokenType::AccessToken => self.verify_access_token(ctx, token, true).await,
            TokenType::IdToken => self.verify_id_token(ctx, token).await,
            TokenType::Jwt => self.verify_user_assertion(ctx, token).await,
            TokenType::RefreshToken => self.verify_refresh_token(ctx, client, token).await,
            TokenType::UserId => self.verify_user_id(ctx, token).await,
        };
        verified.map_err(|e| invalid_token("subject_token", e))
    }

    async fn verify_actor(
        &self,
        ctx: &RequestContext,
        token: &str,
        token_type: TokenType,
    ) -> Result<ExchangeToken> {
        let verified = match token_type {
            TokenType::AccessToken => self.verify_access_token(ctx, token, false).await,
            TokenType::IdToken => self.verify_id_token(ctx, token).await,
            TokenType::Jwt | TokenType::RefreshToken | TokenType::UserId => {
                return Err(OAuthError::invalid_request()
                    .with_description(format!("actor_token_type {token_type} is not supported"))
                    .into());
            }
        };
        verified.map_err(|e| invalid_token("actor_token", e))
    }
}

/// Verification failures are caller input errors; typed errors pass through.
fn invalid_token(parameter: &str, err: Error) -> Error {
    match err {
        Error::OAuth(_) => err,
        other => OAuthError::invalid_request()
            .with_description(format!("{parameter} is invalid"))
            .with_parent(other)
            .into(),
    }
}
