//! Normalizing subject and actor tokens into [`ExchangeToken`]s.

use chrono::{DateTime, Utc};

use super::TokenExchangeEngine;
use crate::context::RequestContext;
use crate::domain::{AuthMethodType, Client, ExchangeToken, TokenType};
use crate::keys::verifier::{self, AssertionClaims, AssertionRules, VerifyOptions};
use crate::token::IdTokenClaims;
use crate::{Error, Result};

impl TokenExchangeEngine {
    pub(super) async fn verify_access_token(
        &self,
        ctx: &RequestContext,
        token: &str,
        reject_pat: bool,
    ) -> Result<ExchangeToken> {
        let access = self.access.verify(ctx, token).await?;
        if reject_pat && access.is_pat {
            return Err(Error::invalid_argument(
                "personal access tokens cannot be exchanged",
            ));
        }
        Ok(ExchangeToken {
            token_type: TokenType::AccessToken,
            user_id: access.user_id,
            issuer: ctx.issuer.clone(),
            resource_owner: access.resource_owner,
            audience: access.audience,
            scopes: access.scope,
            auth_time: access.auth_time,
            auth_methods: access.auth_methods,
            actor: access.actor,
            preferred_language: access.preferred_language,
        })
    }

    pub(super) async fn verify_id_token(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<ExchangeToken> {
        let options = VerifyOptions {
            issuer: Some(ctx.issuer.clone()),
            ..VerifyOptions::default()
        };
        let claims: IdTokenClaims = self.jwt.verify(&ctx.tenant, token, &options).await?;
        let user = self.users.user_by_id(&ctx.tenant, &claims.sub).await?;
        Ok(ExchangeToken {
            token_type: TokenType::IdToken,
            user_id: user.id,
            issuer: claims.iss,
            resource_owner: user.resource_owner,
            audience: claims.aud,
            scopes: Vec::new(),
            auth_time: claims
                .auth_time
                .and_then(|t| DateTime::from_timestamp(t, 0))
                .unwrap_or_else(Utc::now),
            auth_methods: Vec::new(),
            actor: claims.act,
            preferred_language: user.preferred_language,
        })
    }

    /// JWT signed by one of the user's registered keys.
    pub(super) async fn verify_user_assertion(
        &self,
        ctx: &RequestContext,
        token: &str,
    ) -> Result<ExchangeToken> {
        let peeked: AssertionClaims = verifier::peek_claims(token)?;
        let user = self.users.user_by_id(&ctx.tenant, &peeked.iss).await?;
        let kid = verifier::key_id(token)?;
        let key = user
            .keys
            .iter()
            .find(|k| k.id == kid)
            .ok_or_else(|| Error::invalid_argument(format!("key {kid:?} is not registered")))?;
        if key.expires_at.is_some_and(|exp| exp < Utc::now()) {
            return Err(Error::invalid_argument(format!("key {kid:?} expired")));
        }
        let rules = AssertionRules {
            audience: ctx.issuer.clone(),
            ..self.assertion_rules.clone()
        };
        let claims = verifier::verify_assertion(token, &key.public_key_pem, &rules)?;
        Ok(ExchangeToken {
            token_type: TokenType::Jwt,
            user_id: user.id,
            issuer: claims.iss,
            resource_owner: user.resource_owner,
            audience: claims.aud,
            scopes: Vec::new(),
            auth_time: DateTime::from_timestamp(claims.iat, 0).unwrap_or_else(Utc::now),
            auth_methods: vec![AuthMethodType::PrivateKey],
            actor: None,
            preferred_language: user.preferred_language,
        })
    }

    /// Refresh tokens are only accepted from the client they were issued to.
    pub(super) async fn verify_refresh_token(
        &self,
        ctx: &RequestContext,
        client: &Client,
        token: &str,
    ) -> Result<ExchangeToken> {
        let session = self.sessions.session_by_refresh_token(&ctx.tenant, token).await?;
        if session.client_id != client.id {
            return Err(Error::invalid_argument(
                "refresh token was issued to another client",
            ));
        }
        Ok(ExchangeToken {
            token_type: TokenType::RefreshToken,
            user_id: session.user_id,
            issuer: ctx.issuer.clone(),
            resource_owner: session.resource_owner,
            audience: session.audience,
            scopes: session.scope,
            auth_time: session.auth_time,
            auth_methods: session.auth_methods,
            actor: session.actor,
            preferred_language: session.preferred_language,
        })
    }

    /// Bare user id; only meaningful together with an actor token.
    pub(super) async fn verify_user_id(
        &self,
        ctx: &RequestContext,
        user_id: &str,
    ) -> Result<ExchangeToken> {
        let user = self.users.user_by_id(&ctx.tenant, user_id).await?;
        Ok(ExchangeToken {
            token_type: TokenType::UserId,
            user_id: user.id,
            issuer: ctx.issuer.clone(),
            resource_owner: user.resource_owner,
            audience: Vec::new(),
            scopes: Vec::new(),
            auth_time: Utc::now(),
            auth_methods: Vec::new(),
            actor: None,
            preferred_language: user.preferred_language,
        })
    }
}
