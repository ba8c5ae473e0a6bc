//! Registered OAuth2/OIDC clients.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::scope;
use crate::error::{Error, OAuthError};

/// How a client proves its identity at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientAuthMethod {
    /// Public client, no secret
    None,
    /// `client_secret_basic`
    #[default]
    Basic,
    /// `client_secret_post`
    Post,
    /// `private_key_jwt`
    PrivateKeyJwt,
}

/// Supported `grant_type` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantType {
    /// `authorization_code`
    AuthorizationCode,
    /// `client_credentials`
    ClientCredentials,
    /// `urn:ietf:params:oauth:grant-type:jwt-bearer`
    JwtBearer,
    /// `urn:ietf:params:oauth:grant-type:device_code`
    DeviceCode,
    /// `refresh_token`
    RefreshToken,
    /// `urn:ietf:params:oauth:grant-type:token-exchange`
    TokenExchange,
}

impl GrantType {
    /// Every grant type, in dispatch order.
    pub const ALL: [GrantType; 6] = [
        Self::AuthorizationCode,
        Self::ClientCredentials,
        Self::JwtBearer,
        Self::DeviceCode,
        Self::RefreshToken,
        Self::TokenExchange,
    ];

    /// Wire value of the `grant_type` parameter
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AuthorizationCode => "authorization_code",
            Self::ClientCredentials => "client_credentials",
            Self::JwtBearer => "urn:ietf:params:oauth:grant-type:jwt-bearer",
            Self::DeviceCode => "urn:ietf:params:oauth:grant-type:device_code",
            Self::RefreshToken => "refresh_token",
            Self::TokenExchange => "urn:ietf:params:oauth:grant-type:token-exchange",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| {
                OAuthError::new(crate::error::ErrorCode::UnsupportedGrantType)
                    .with_description(format!("grant_type {s:?} is not supported"))
                    .into()
            })
    }
}

/// Format of access tokens issued to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessTokenType {
    /// Opaque HMAC-protected bearer token resolved via the session store
    #[default]
    Bearer,
    /// Self-contained signed JWT
    Jwt,
}

/// A public key registered by a client or user for `private_key_jwt` and
/// JWT-profile assertions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredKey {
    /// Key id (`kid` header of the assertion)
    pub id: String,
    /// SPKI PEM of an EC P-256 public key
    pub public_key_pem: String,
    /// Optional expiry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A registered relying party. Read-only from the core's point of view.
#[derive(Debug, Clone)]
pub struct Client {
    /// Client id
    pub id: String,
    /// Project the application belongs to
    pub project_id: String,
    /// Organization owning the project
    pub resource_owner: String,
    /// Authentication method
    pub auth_method: ClientAuthMethod,
    /// SHA-256 digest of the client secret
    pub secret_digest: Option<[u8; 32]>,
    /// Keys accepted for `private_key_jwt`
    pub keys: Vec<RegisteredKey>,
    /// Grant types the client may use
    pub grant_types: Vec<GrantType>,
    /// Exact-match redirect URIs
    pub redirect_uris: Vec<String>,
    /// Access token format
    pub access_token_type: AccessTokenType,
    /// Access token lifetime
    pub access_token_lifetime: Duration,
    /// ID token lifetime
    pub id_token_lifetime: Duration,
    /// Refresh token lifetime
    pub refresh_token_lifetime: Duration,
    /// Added to the ID token expiry
    pub clock_skew: Duration,
    /// Custom scopes beyond the standard and reserved ones
    pub allowed_scopes: Vec<String>,
    /// Put project roles into access tokens
    pub access_token_role_assertion: bool,
    /// Put project roles into ID tokens
    pub id_token_role_assertion: bool,
    /// Put userinfo claims into ID tokens
    pub id_token_userinfo_assertion: bool,
    /// Service user the client-credentials grant acts as
    pub service_user: Option<String>,
}

impl Client {
    /// Public clients cannot keep a secret and must use PKCE.
    #[must_use]
    pub fn is_public(&self) -> bool {
        self.auth_method == ClientAuthMethod::None
    }

    /// Whether the client registered the grant type.
    #[must_use]
    pub fn allows_grant(&self, grant: GrantType) -> bool {
        self.grant_types.contains(&grant)
    }

    /// Standard OIDC scopes and reserved scopes are always allowed, anything
    /// else must be on the allow-list.
    #[must_use]
    pub fn is_scope_allowed(&self, scope: &str) -> bool {
        scope::is_standard(scope)
            || scope::is_reserved(scope)
            || self.allowed_scopes.iter().any(|s| s == scope)
    }

    /// Drop scopes the client may not request.
    #[must_use]
    pub fn restrict_scopes(&self, scopes: &[String]) -> Vec<String> {
        scopes
            .iter()
            .filter(|s| self.is_scope_allowed(s))
            .cloned()
            .collect()
    }

    /// Audience of tokens issued directly to the client: client id, project
    /// id and any projects requested through audience scopes.
    #[must_use]
    pub fn default_audience(&self, scopes: &[String]) -> Vec<String> {
        let mut audience = vec![self.id.clone()];
        if !self.project_id.is_empty() {
            scope::append_unique(&mut audience, [self.project_id.clone()]);
        }
        scope::append_unique(&mut audience, scope::audience_from_scopes(scopes));
        audience
    }

    /// Whether the audience names this client or its project.
    #[must_use]
    pub fn in_audience(&self, audience: &[String]) -> bool {
        audience
            .iter()
            .any(|a| *a == self.id || (!self.project_id.is_empty() && *a == self.project_id))
    }

    /// Find a registered key by id.
    #[must_use]
    pub fn key(&self, key_id: &str) -> Option<&RegisteredKey> {
        self.keys.iter().find(|k| k.id == key_id)
    }
}
