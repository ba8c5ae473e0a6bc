//! Sessions: one unit of issued tokens per successful grant.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::amr::AuthMethodType;
use super::token::TokenActor;

/// Why a session was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenReason {
    /// Authorization code flow
    AuthRequest,
    /// Refresh-token rotation
    Refresh,
    /// `client_credentials`
    ClientCredentials,
    /// JWT bearer assertion
    JwtProfile,
    /// Token exchange with the subject as its own actor
    Exchange,
    /// Token exchange acting on behalf of another user
    Impersonation,
    /// Device authorization
    DeviceCode,
}

/// Immutable record created by the session store for one grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session id (`sid`)
    pub session_id: String,
    /// Access token id: `<session_id>.at_<id>`
    pub token_id: String,
    /// Tenant (instance) the session lives in
    pub tenant: String,
    /// User (or service user) the tokens are issued for
    pub user_id: String,
    /// Organization owning the user
    pub resource_owner: String,
    /// Client the tokens were issued to
    pub client_id: String,
    /// Token audience
    pub audience: Vec<String>,
    /// Granted scope
    pub scope: Vec<String>,
    /// Authentication methods of the underlying login
    pub auth_methods: Vec<AuthMethodType>,
    /// Time of the underlying login
    pub auth_time: DateTime<Utc>,
    /// Nonce from the authorization request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Preferred language of the user
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
    /// Grant that created the session
    pub reason: TokenReason,
    /// Delegation chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<TokenActor>,
    /// Refresh token (`rt_...`), if issued
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Access token issue time
    pub creation: DateTime<Utc>,
    /// Access token expiry
    pub expiration: DateTime<Utc>,
}

impl Session {
    /// Seconds until the access token expires, zero when already expired.
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        (self.expiration - Utc::now())
            .to_std()
            .map_or(0, |d| d.as_secs())
    }
}

/// Inputs for [`crate::storage::SessionStore::create_session`].
#[derive(Debug, Clone)]
pub struct SessionGrant {
    /// Tenant
    pub tenant: String,
    /// Existing login session to attach to, or `None` for a fresh one
    pub session_id: Option<String>,
    /// User
    pub user_id: String,
    /// User's organization
    pub resource_owner: String,
    /// Client
    pub client_id: String,
    /// Audience
    pub audience: Vec<String>,
    /// Scope
    pub scope: Vec<String>,
    /// Authentication methods
    pub auth_methods: Vec<AuthMethodType>,
    /// Login time
    pub auth_time: DateTime<Utc>,
    /// Nonce
    pub nonce: Option<String>,
    /// Preferred language
    pub preferred_language: Option<String>,
    /// Reason
    pub reason: TokenReason,
    /// Delegation chain
    pub actor: Option<TokenActor>,
    /// Access token lifetime
    pub access_token_lifetime: Duration,
    /// Issue a refresh token valid for this long
    pub refresh_token_lifetime: Option<Duration>,
}
