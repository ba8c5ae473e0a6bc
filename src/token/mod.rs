//! Token minting.
//!
//! [`Minter`] turns a [`Session`] into signed tokens. Within one request the
//! signing key is resolved once and shared by every token minted for that
//! request ([`RequestSigner`]), so an ID token and its mirrored JWT access
//! token always carry the same `kid` and algorithm. Userinfo claims and the
//! signer are fetched concurrently.

pub mod access;
pub mod opaque;

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::context::RequestContext;
use crate::domain::{
    AccessTokenType, AmrPolicy, Client, GrantType, Session, TokenActor, TokenType, scope,
};
use crate::join::try_join_cancel_on_error;
use crate::keys::SigningKey;
use crate::keys::rotator::SignerRegistry;
use crate::keys::verifier::one_or_many;
use crate::storage::{Claims, UserLookup};
use crate::Result;

pub use access::AccessTokenVerifier;
pub use opaque::OpaqueTokenCodec;

/// Claims of a JWT access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject (user id)
    pub sub: String,
    /// Audience
    #[serde(deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    /// Expiry
    pub exp: i64,
    /// Issued at
    pub iat: i64,
    /// Not before
    pub nbf: i64,
    /// Token id
    pub jti: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Space-delimited scope
    #[serde(with = "scope::space_delimited")]
    pub scope: Vec<String>,
    /// Delegation chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<TokenActor>,
    /// Additional claims (roles)
    #[serde(flatten)]
    pub extra: Claims,
}

/// Claims of an ID token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer
    pub iss: String,
    /// Subject
    pub sub: String,
    /// Audience
    #[serde(deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    /// Authorized party
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
    /// Expiry
    pub exp: i64,
    /// Issued at
    pub iat: i64,
    /// Login time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_time: Option<i64>,
    /// Nonce
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Authentication methods
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub amr: Vec<String>,
    /// Session id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Access token hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub at_hash: Option<String>,
    /// Delegation chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub act: Option<TokenActor>,
    /// Userinfo and resource-owner claims
    #[serde(flatten)]
    pub extra: Claims,
}

/// Token endpoint success body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    /// The issued token (for exchange: of `issued_token_type`)
    pub access_token: String,
    /// `Bearer`, or `N_A` when the issued token is not an access token
    pub token_type: String,
    /// Lifetime in seconds
    pub expires_in: u64,
    /// Refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// ID token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Granted scope, space-delimited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Token exchange only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_token_type: Option<TokenType>,
}

/// `at_hash`: base64url of the left half of SHA-256 over the access token.
#[must_use]
pub fn access_token_hash(access_token: &str) -> String {
    let digest = Sha256::digest(access_token.as_bytes());
    URL_SAFE_NO_PAD.encode(&digest[..digest.len() / 2])
}

/// Signing key resolved at most once per request.
pub struct RequestSigner {
    registry: Arc<SignerRegistry>,
    tenant: String,
    key: OnceCell<SigningKey>,
}

impl RequestSigner {
    /// Lazily resolving signer for `tenant`.
    #[must_use]
    pub fn new(registry: Arc<SignerRegistry>, tenant: impl Into<String>) -> Self {
        Self {
            registry,
            tenant: tenant.into(),
            key: OnceCell::new(),
        }
    }

    /// The key, resolving it on first use.
    pub async fn key(&self) -> Result<&SigningKey> {
        self.key
            .get_or_try_init(|| self.registry.signer(&self.tenant))
            .await
    }
}

/// What a grant handler wants minted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MintOptions {
    /// Mint an ID token
    pub id_token: bool,
    /// Access token format
    pub access_token_type: AccessTokenType,
}

impl MintOptions {
    /// Standard grant response: the client's access token format, an ID
    /// token when `openid` was granted to an end-user flow. Machine grants
    /// never receive one.
    #[must_use]
    pub fn for_grant(session: &Session, client: &Client, grant_type: GrantType) -> Self {
        let machine = matches!(grant_type, GrantType::ClientCredentials | GrantType::JwtBearer);
        Self {
            id_token: !machine && session.scope.iter().any(|s| s == scope::OPENID),
            access_token_type: client.access_token_type,
        }
    }
}

/// Builds and signs tokens.
pub struct Minter {
    signers: Arc<SignerRegistry>,
    users: Arc<dyn UserLookup>,
    opaque: OpaqueTokenCodec,
    amr: AmrPolicy,
}

impl Minter {
    /// New minter.
    #[must_use]
    pub fn new(
        signers: Arc<SignerRegistry>,
        users: Arc<dyn UserLookup>,
        opaque: OpaqueTokenCodec,
        amr: AmrPolicy,
    ) -> Self {
        Self {
            signers,
            users,
            opaque,
            amr,
        }
    }

    /// Signer memoized for one request.
    #[must_use]
    pub fn request_signer(&self, ctx: &RequestContext) -> RequestSigner {
        RequestSigner::new(Arc::clone(&self.signers), ctx.tenant.clone())
    }

    /// Opaque access token for a session.
    pub fn opaque_access_token(&self, session: &Session) -> Result<String> {
        self.opaque.encode(&session.token_id, &session.user_id)
    }

    /// Signed JWT access token for a session.
    pub async fn jwt_access_token(
        &self,
        ctx: &RequestContext,
        signer: &RequestSigner,
        session: &Session,
        client: &Client,
    ) -> Result<String> {
        let extra = if client.access_token_role_assertion {
            self.role_claims(ctx, session).await?
        } else {
            Claims::new()
        };
        let claims = AccessTokenClaims {
            iss: ctx.issuer.clone(),
            sub: session.user_id.clone(),
            aud: session.audience.clone(),
            exp: session.expiration.timestamp(),
            iat: session.creation.timestamp(),
            nbf: session.creation.timestamp(),
            jti: session.token_id.clone(),
            client_id: session.client_id.clone(),
            scope: session.scope.clone(),
            act: session.actor.clone(),
            extra,
        };
        signer.key().await?.sign(&claims)
    }

    /// Access token in the requested format.
    pub async fn access_token(
        &self,
        ctx: &RequestContext,
        signer: &RequestSigner,
        session: &Session,
        client: &Client,
        format: AccessTokenType,
    ) -> Result<String> {
        match format {
            AccessTokenType::Bearer => self.opaque_access_token(session),
            AccessTokenType::Jwt => self.jwt_access_token(ctx, signer, session, client).await,
        }
    }

    async fn role_claims(&self, ctx: &RequestContext, session: &Session) -> Result<Claims> {
        let mut claims = self
            .users
            .userinfo(&ctx.tenant, &session.user_id, &[], &session.audience)
            .await?;
        claims.retain(|k, _| k == scope::CLAIM_PROJECT_ROLES);
        Ok(claims)
    }

    /// Claims added to an ID token beyond the protocol claims.
    pub async fn id_token_claims(
        &self,
        ctx: &RequestContext,
        session: &Session,
        client: &Client,
    ) -> Result<Claims> {
        let mut claims = Claims::new();
        if client.id_token_userinfo_assertion || client.id_token_role_assertion {
            let scopes: &[String] = if client.id_token_userinfo_assertion {
                &session.scope
            } else {
                &[]
            };
            let audience: &[String] = if client.id_token_role_assertion {
                &session.audience
            } else {
                &[]
            };
            let mut info = self
                .users
                .userinfo(&ctx.tenant, &session.user_id, scopes, audience)
                .await?;
            info.remove("sub");
            claims.extend(info);
        }
        if session.scope.iter().any(|s| s == scope::RESOURCE_OWNER) {
            let org = self
                .users
                .org_by_id(&ctx.tenant, &session.resource_owner)
                .await?;
            claims.insert(scope::CLAIM_RESOURCE_OWNER_ID.into(), Value::String(org.id));
            claims.insert(scope::CLAIM_RESOURCE_OWNER_NAME.into(), Value::String(org.name));
            claims.insert(
                scope::CLAIM_RESOURCE_OWNER_PRIMARY_DOMAIN.into(),
                Value::String(org.primary_domain),
            );
        }
        Ok(claims)
    }

    /// Sign an ID token.
    pub fn sign_id_token(
        &self,
        ctx: &RequestContext,
        key: &SigningKey,
        session: &Session,
        client: &Client,
        access_token: Option<&str>,
        extra: Claims,
    ) -> Result<String> {
        let mut aud = session.audience.clone();
        scope::append_unique(&mut aud, [client.id.clone()]);
        let skew = chrono::Duration::from_std(client.clock_skew).unwrap_or_default();
        let claims = IdTokenClaims {
            iss: ctx.issuer.clone(),
            sub: session.user_id.clone(),
            aud,
            azp: Some(client.id.clone()),
            exp: (session.expiration + skew).timestamp(),
            iat: Utc::now().timestamp(),
            auth_time: Some(session.auth_time.timestamp()),
            nonce: session.nonce.clone(),
            amr: self.amr.amr(&session.auth_methods),
            sid: Some(session.session_id.clone()),
            at_hash: access_token.map(access_token_hash),
            act: session.actor.clone(),
            extra,
        };
        key.sign(&claims)
    }

    /// ID token with userinfo and signer resolved concurrently.
    pub async fn id_token(
        &self,
        ctx: &RequestContext,
        signer: &RequestSigner,
        session: &Session,
        client: &Client,
        access_token: Option<&str>,
    ) -> Result<String> {
        let (extra, key) = try_join_cancel_on_error(
            &ctx.cancel,
            self.id_token_claims(ctx, session, client),
            signer.key(),
        )
        .await?;
        self.sign_id_token(ctx, key, session, client, access_token, extra)
    }

    /// Standard grant response for a freshly created session.
    pub async fn mint(
        &self,
        ctx: &RequestContext,
        session: &Session,
        client: &Client,
        options: MintOptions,
    ) -> Result<TokenResponse> {
        let signer = self.request_signer(ctx);
        let access_token = self
            .access_token(ctx, &signer, session, client, options.access_token_type)
            .await?;
        let id_token = if options.id_token {
            Some(
                self.id_token(ctx, &signer, session, client, Some(&access_token))
                    .await?,
            )
        } else {
            None
        };
        debug!(tenant = %ctx.tenant, token_id = %session.token_id, "Tokens minted");
        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".into(),
            expires_in: session.expires_in(),
            refresh_token: session.refresh_token.clone(),
            id_token,
            scope: Some(scope::join(&session.scope)),
            issued_token_type: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_hash_is_left_half_of_sha256() {
        // 16 bytes -> 22 base64url chars
        let hash = access_token_hash("token");
        assert_eq!(hash.len(), 22);
        assert_eq!(hash, access_token_hash("token"));
        assert_ne!(hash, access_token_hash("other"));
    }

    #[test]
    fn access_token_claims_accept_string_audience() {
        let json = serde_json::json!({
            "iss": "https://issuer", "sub": "u1", "aud": "app", "exp": 1, "iat": 0, "nbf": 0,
            "jti": "s.at_1", "client_id": "app", "scope": "openid profile"
        });
        let claims: AccessTokenClaims = serde_json::from_value(json).unwrap();
        assert_eq!(claims.aud, vec!["app"]);
        assert_eq!(claims.scope, vec!["openid", "profile"]);
        assert!(claims.extra.is_empty());
    }
}
