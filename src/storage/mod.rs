//! External collaborators.
//!
//! The core never talks to a database directly. Everything persistent sits
//! behind the async traits in this module; [`memory`] provides the reference
//! implementation used by the binary and the tests.
//!
//! All implementations must be `Send + Sync` because they are shared across
//! request tasks and background loops.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::Algorithm;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;
use crate::domain::{
    AccessToken, AuthMethodType, Client, RegisteredKey, Session, SessionGrant,
};
use crate::keys::{PrivateKey, PublicKey};

pub use memory::{InMemoryLock, InMemoryStore};

/// Userinfo-style claims keyed by claim name.
pub type Claims = serde_json::Map<String, serde_json::Value>;

/// Compliance check run by the store while it holds the authorization
/// request, before consuming it. Returns the session to create.
pub type AuthRequestCheck<'a> = &'a (dyn Fn(&AuthRequest) -> Result<SessionGrant> + Send + Sync);

/// Compliance check run by the store on the session a refresh token belongs
/// to. Receives the requested scope and returns the scope to grant.
pub type RefreshCheck<'a> = &'a (dyn Fn(&Session, &[String]) -> Result<Vec<String>> + Send + Sync);

/// PKCE challenge method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeChallengeMethod {
    /// Verifier compared as-is
    #[serde(rename = "plain")]
    Plain,
    /// `BASE64URL(SHA256(verifier))`
    S256,
}

/// Stored PKCE challenge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeChallenge {
    /// Challenge value
    pub challenge: String,
    /// Method
    pub method: CodeChallengeMethod,
}

/// An authorization request that completed login and was issued a code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    /// Request id
    pub id: String,
    /// Code handed to the client
    pub code: String,
    /// Client that started the request
    pub client_id: String,
    /// Authenticated user
    pub user_id: String,
    /// User's organization
    pub resource_owner: String,
    /// `redirect_uri` of the authorization request
    pub redirect_uri: String,
    /// Requested scope
    pub scope: Vec<String>,
    /// Audience resolved at authorization time
    pub audience: Vec<String>,
    /// PKCE challenge, if any
    pub code_challenge: Option<CodeChallenge>,
    /// Nonce
    pub nonce: Option<String>,
    /// Authentication methods of the login
    pub auth_methods: Vec<AuthMethodType>,
    /// Login time
    pub auth_time: DateTime<Utc>,
    /// Preferred language
    pub preferred_language: Option<String>,
    /// Login session
    pub session_id: Option<String>,
}

/// Device authorization states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAuthState {
    /// Waiting for the user
    Initiated,
    /// User approved
    Approved,
    /// User denied
    Denied,
    /// Timed out
    Expired,
    /// Tokens were issued
    Done,
}

/// A device authorization (RFC 8628).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceAuthorization {
    /// Device code
    pub device_code: String,
    /// Client that started the flow
    pub client_id: String,
    /// Requested scope
    pub scope: Vec<String>,
    /// Audience
    pub audience: Vec<String>,
    /// Current state
    pub state: DeviceAuthState,
    /// Absolute expiry
    pub expires_at: DateTime<Utc>,
    /// Approving user, once approved
    pub user_id: Option<String>,
    /// Approving user's organization
    pub resource_owner: Option<String>,
    /// Authentication methods of the approving login
    pub auth_methods: Vec<AuthMethodType>,
    /// Login time of the approving user
    pub auth_time: Option<DateTime<Utc>>,
    /// Preferred language
    pub preferred_language: Option<String>,
}

/// Lifetimes applied when a store mints a renewed access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenLifetimes {
    /// Access token
    pub access: Duration,
    /// Refresh token
    pub refresh: Duration,
}

/// Project role granted to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRole {
    /// Project
    pub project_id: String,
    /// Role key
    pub role: String,
    /// Organization the grant belongs to
    pub org_id: String,
}

/// A human or machine user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: String,
    /// Organization owning the user
    pub resource_owner: String,
    /// Login name
    pub username: String,
    /// Display name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Whether the email was verified
    #[serde(default)]
    pub email_verified: bool,
    /// Preferred language
    #[serde(default)]
    pub preferred_language: Option<String>,
    /// Project roles
    #[serde(default)]
    pub roles: Vec<ProjectRole>,
    /// Permissions (e.g. `impersonation`) keyed by organization
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Keys for JWT-profile assertions
    #[serde(default)]
    pub keys: Vec<RegisteredKey>,
}

/// An organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Org {
    /// Org id
    pub id: String,
    /// Display name
    pub name: String,
    /// Primary domain
    pub primary_domain: String,
}

/// Per-tenant security settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSettings {
    /// Token exchange grant enabled
    pub token_exchange_enabled: bool,
    /// Impersonation allowed by the security policy
    pub impersonation_enabled: bool,
    /// Echo internal error causes to callers
    pub debug_parent_error: bool,
}

/// Active private keys plus the storage position they were read at.
#[derive(Debug, Clone, Default)]
pub struct PrivateKeys {
    /// Keys ordered by ascending sequence
    pub keys: Vec<PrivateKey>,
    /// Latest key sequence the query observed
    pub sequence: u64,
}

/// Read-only application registry.
#[async_trait::async_trait]
pub trait ClientRegistry: Send + Sync + 'static {
    /// Look up an active client. Inactive or unknown clients are `NotFound`.
    async fn active_client_by_id(&self, tenant: &str, client_id: &str) -> Result<Client>;
}

/// Session persistence.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Create a session for a completed grant.
    async fn create_session(&self, grant: SessionGrant) -> Result<Session>;

    /// Atomically consume the authorization request behind `code` and create
    /// its session. The request is only consumed if `check` succeeds; a
    /// second call for the same code fails with `NotFound`.
    async fn create_session_from_auth_request(
        &self,
        tenant: &str,
        code: &str,
        check: AuthRequestCheck<'_>,
    ) -> Result<Session>;

    /// Exchange a refresh token for a renewed session. The previous access
    /// token of the lineage is no longer active once this returns, and the
    /// refresh token is rotated to one valid for `lifetimes.refresh`. An
    /// expired refresh token is `NotFound`.
    async fn exchange_refresh_token(
        &self,
        tenant: &str,
        refresh_token: &str,
        requested_scope: &[String],
        lifetimes: TokenLifetimes,
        check: RefreshCheck<'_>,
    ) -> Result<Session>;

    /// Look up an active (issued, unexpired, not superseded) access token.
    async fn active_access_token_by_id(&self, tenant: &str, token_id: &str) -> Result<AccessToken>;

    /// Session currently holding `refresh_token`, unless it expired.
    async fn session_by_refresh_token(&self, tenant: &str, refresh_token: &str) -> Result<Session>;
}

/// Removal of expired sessions, refresh lineages, authorization requests
/// and device authorizations. Called periodically by the background reaper.
#[async_trait::async_trait]
pub trait ExpiryReaper: Send + Sync + 'static {
    /// Remove everything that can no longer be used. Returns the count.
    async fn reap_expired(&self) -> usize;
}

/// Spawn a background task that reaps expired entries every `interval`.
///
/// The task exits when the `shutdown` receiver fires.
pub fn spawn_reaper(
    store: Arc<dyn ExpiryReaper>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reaped = store.reap_expired().await;
                    if reaped > 0 {
                        debug!(count = reaped, "Reaped expired sessions and requests");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Session reaper shutting down");
                    break;
                }
            }
        }
    })
}

/// Legacy authorization requests, looked up by code and deleted on use.
#[async_trait::async_trait]
pub trait AuthRequestStore: Send + Sync + 'static {
    /// Authorization request that was issued `code`.
    async fn auth_request_by_code(&self, tenant: &str, code: &str) -> Result<AuthRequest>;

    /// Delete a request. `NotFound` when it was already deleted.
    async fn delete_auth_request(&self, tenant: &str, id: &str) -> Result<()>;
}

/// Device authorizations.
#[async_trait::async_trait]
pub trait DeviceAuthStore: Send + Sync + 'static {
    /// Look up by device code.
    async fn device_auth(&self, tenant: &str, device_code: &str) -> Result<DeviceAuthorization>;

    /// Move an approved authorization to `Done`. Fails with
    /// `PreconditionFailed` if it is no longer approved.
    async fn consume_device_auth(&self, tenant: &str, device_code: &str) -> Result<()>;
}

/// Persistent key storage.
#[async_trait::async_trait]
pub trait KeyStorage: Send + Sync + 'static {
    /// Private signing keys that do not expire within `grace`.
    async fn active_private_signing_keys(&self, tenant: &str, grace: Duration) -> Result<PrivateKeys>;

    /// Latest key sequence committed for the tenant.
    async fn latest_key_sequence(&self, tenant: &str) -> Result<u64>;

    /// Public keys not expired at `as_of`.
    async fn active_public_keys(&self, tenant: &str, as_of: DateTime<Utc>) -> Result<Vec<PublicKey>>;

    /// Public key by id, including expired keys.
    async fn public_key_by_id(&self, tenant: &str, key_id: &str) -> Result<PublicKey>;

    /// Generate and persist a new signing key pair.
    async fn generate_signing_key_pair(&self, tenant: &str, algorithm: Algorithm) -> Result<()>;
}

/// Fleet-wide lock, one per tenant.
#[async_trait::async_trait]
pub trait DistributedLock: Send + Sync + 'static {
    /// Try to take the tenant's lock for `duration`. Non-blocking: returns
    /// `Ok(false)` when another owner holds it.
    async fn lock(&self, tenant: &str, owner: &str, duration: Duration) -> Result<bool>;
}

/// Users, organizations and claims.
#[async_trait::async_trait]
pub trait UserLookup: Send + Sync + 'static {
    /// User by id.
    async fn user_by_id(&self, tenant: &str, user_id: &str) -> Result<User>;

    /// Organization by id.
    async fn org_by_id(&self, tenant: &str, org_id: &str) -> Result<Org>;

    /// Organization by primary domain.
    async fn org_by_primary_domain(&self, tenant: &str, domain: &str) -> Result<Org>;

    /// Userinfo claims for `scopes`. Roles are included for projects in
    /// `role_audience`.
    async fn userinfo(
        &self,
        tenant: &str,
        user_id: &str,
        scopes: &[String],
        role_audience: &[String],
    ) -> Result<Claims>;

    /// Check `permission` for `user_id` on `resource_owner`. `PermissionDenied`
    /// when missing.
    async fn check_permission(
        &self,
        tenant: &str,
        user_id: &str,
        permission: &str,
        resource_owner: &str,
    ) -> Result<()>;
}

/// Per-tenant security settings.
#[async_trait::async_trait]
pub trait TenantSettingsStore: Send + Sync + 'static {
    /// Settings for `tenant`.
    async fn tenant_settings(&self, tenant: &str) -> Result<TenantSettings>;
}
