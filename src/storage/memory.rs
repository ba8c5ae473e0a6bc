//! In-memory collaborators.
//!
//! [`InMemoryStore`] implements every storage trait on top of `DashMap`s and
//! `parking_lot` mutexes. Operations the traits declare atomic (consuming an
//! authorization request, rotating a refresh token) run entirely under one
//! mutex guard, so concurrent callers observe exactly one winner.
//!
//! [`InMemoryLock`] is a process-local [`DistributedLock`]: good enough for a
//! single instance and for exercising the rotator's single-writer behaviour.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use jsonwebtoken::Algorithm;
use parking_lot::Mutex;
use rand::RngExt;
use serde_json::{Value, json};
use tracing::debug;

use super::{
    AccessToken, AuthRequest, AuthRequestCheck, AuthRequestStore, Claims, ClientRegistry,
    DeviceAuthState, DeviceAuthStore, DeviceAuthorization, DistributedLock, ExpiryReaper,
    KeyStorage, Org,
    PrivateKeys, RefreshCheck, SessionStore, TenantSettings, TenantSettingsStore, TokenLifetimes,
    User, UserLookup,
};
use crate::domain::token::{ACCESS_TOKEN_PREFIX, REFRESH_TOKEN_PREFIX};
use crate::domain::{Client, Session, SessionGrant, TokenReason, scope};
use crate::keys::{self, PrivateKey, PublicKey};
use crate::{Error, Result};

type Key = (String, String);

/// Authorization requests not redeemed within this time after login are reaped.
const AUTH_REQUEST_MAX_AGE: chrono::Duration = chrono::Duration::minutes(10);

fn key(tenant: &str, id: &str) -> Key {
    (tenant.to_string(), id.to_string())
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Generate a refresh token: `rt_<43-char URL-safe base64>`.
fn new_refresh_token() -> String {
    let bytes: [u8; 32] = rand::rng().random();
    format!("{REFRESH_TOKEN_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

fn new_token_id(session_id: &str) -> String {
    format!("{session_id}.{ACCESS_TOKEN_PREFIX}{}", uuid::Uuid::new_v4())
}

/// Session a refresh token currently belongs to.
struct RefreshLineage {
    token_id: String,
    expiration: DateTime<Utc>,
}

#[derive(Default)]
struct SessionTables {
    by_token_id: HashMap<Key, Session>,
    by_refresh_token: HashMap<Key, RefreshLineage>,
}

impl SessionTables {
    /// Token id behind an unexpired refresh token.
    fn lineage(&self, rt_key: &Key, now: DateTime<Utc>) -> Result<String> {
        self.by_refresh_token
            .get(rt_key)
            .filter(|l| l.expiration > now)
            .map(|l| l.token_id.clone())
            .ok_or_else(|| Error::not_found("refresh token"))
    }
}

struct StoredKey {
    private: PrivateKey,
    public: PublicKey,
}

#[derive(Default)]
struct TenantKeys {
    keys: Vec<StoredKey>,
    sequence: u64,
}

/// In-memory implementation of every storage trait.
pub struct InMemoryStore {
    clients: DashMap<Key, Client>,
    users: DashMap<Key, User>,
    orgs: DashMap<Key, Org>,
    auth_requests: Mutex<HashMap<Key, AuthRequest>>,
    device_auths: Mutex<HashMap<Key, DeviceAuthorization>>,
    sessions: Mutex<SessionTables>,
    personal_tokens: DashMap<Key, AccessToken>,
    keys: Mutex<HashMap<String, TenantKeys>>,
    key_lifetime: Duration,
    default_settings: Mutex<TenantSettings>,
    tenant_settings: DashMap<String, TenantSettings>,
    generated_keys: AtomicUsize,
    public_key_lookups: AtomicUsize,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(6 * 3600))
    }
}

impl InMemoryStore {
    /// Empty store generating signing keys valid for `key_lifetime`.
    #[must_use]
    pub fn new(key_lifetime: Duration) -> Self {
        Self {
            clients: DashMap::new(),
            users: DashMap::new(),
            orgs: DashMap::new(),
            auth_requests: Mutex::new(HashMap::new()),
            device_auths: Mutex::new(HashMap::new()),
            sessions: Mutex::new(SessionTables::default()),
            personal_tokens: DashMap::new(),
            keys: Mutex::new(HashMap::new()),
            key_lifetime,
            default_settings: Mutex::new(TenantSettings::default()),
            tenant_settings: DashMap::new(),
            generated_keys: AtomicUsize::new(0),
            public_key_lookups: AtomicUsize::new(0),
        }
    }

    /// Register a client.
    pub fn insert_client(&self, tenant: &str, client: Client) {
        self.clients.insert(key(tenant, &client.id), client);
    }

    /// Register a user.
    pub fn insert_user(&self, tenant: &str, user: User) {
        self.users.insert(key(tenant, &user.id), user);
    }

    /// Register an organization.
    pub fn insert_org(&self, tenant: &str, org: Org) {
        self.orgs.insert(key(tenant, &org.id), org);
    }

    /// Store an authorization request that completed login.
    pub fn insert_auth_request(&self, tenant: &str, request: AuthRequest) {
        self.auth_requests
            .lock()
            .insert(key(tenant, &request.id), request);
    }

    /// Store a device authorization.
    pub fn insert_device_auth(&self, tenant: &str, auth: DeviceAuthorization) {
        self.device_auths
            .lock()
            .insert(key(tenant, &auth.device_code), auth);
    }

    /// Replace a device authorization's state, e.g. after user approval.
    pub fn set_device_auth_state(
        &self,
        tenant: &str,
        device_code: &str,
        state: DeviceAuthState,
    ) -> Result<()> {
        let mut auths = self.device_auths.lock();
        let auth = auths
            .get_mut(&key(tenant, device_code))
            .ok_or_else(|| Error::not_found("device authorization"))?;
        auth.state = state;
        Ok(())
    }

    /// Register a personal access token.
    pub fn insert_personal_access_token(&self, tenant: &str, token: AccessToken) {
        self.personal_tokens
            .insert(key(tenant, &token.token_id), token);
    }

    /// Settings for tenants without an override.
    pub fn set_default_settings(&self, settings: TenantSettings) {
        *self.default_settings.lock() = settings;
    }

    /// Override settings for one tenant.
    pub fn set_tenant_settings(&self, tenant: &str, settings: TenantSettings) {
        self.tenant_settings.insert(tenant.to_string(), settings);
    }

    /// Number of key pairs generated so far.
    #[must_use]
    pub fn generated_key_count(&self) -> usize {
        self.generated_keys.load(Ordering::SeqCst)
    }

    /// Number of public-key-by-id lookups served.
    #[must_use]
    pub fn public_key_lookup_count(&self) -> usize {
        self.public_key_lookups.load(Ordering::SeqCst)
    }

    /// Persist a key pair with an explicit expiry. Returns its id.
    pub fn insert_key_pair(&self, tenant: &str, expiry: DateTime<Utc>) -> Result<String> {
        let material = keys::generate_key_pair(Algorithm::ES256)?;
        let id = material.id.clone();
        let mut all = self.keys.lock();
        let tenant_keys = all.entry(tenant.to_string()).or_default();
        tenant_keys.sequence += 1;
        tenant_keys.keys.push(StoredKey {
            private: PrivateKey {
                id: material.id.clone(),
                algorithm: Algorithm::ES256,
                pem: material.pem,
                sequence: tenant_keys.sequence,
                expiry,
            },
            public: PublicKey {
                id: material.id,
                algorithm: Algorithm::ES256,
                x: material.x,
                y: material.y,
                expiry,
            },
        });
        Ok(id)
    }

    /// Private key by id, expired or not.
    #[cfg(test)]
    pub(crate) fn private_key(&self, tenant: &str, key_id: &str) -> Option<PrivateKey> {
        self.keys
            .lock()
            .get(tenant)?
            .keys
            .iter()
            .find(|k| k.private.id == key_id)
            .map(|k| k.private.clone())
    }

    /// New session plus the expiry of its refresh token, if one is issued.
    fn new_session(grant: SessionGrant) -> (Session, Option<DateTime<Utc>>) {
        let now = Utc::now();
        let refresh_expiration = grant.refresh_token_lifetime.map(|d| now + to_chrono(d));
        let session_id = grant
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let session = Session {
            token_id: new_token_id(&session_id),
            session_id,
            tenant: grant.tenant,
            user_id: grant.user_id,
            resource_owner: grant.resource_owner,
            client_id: grant.client_id,
            audience: grant.audience,
            scope: grant.scope,
            auth_methods: grant.auth_methods,
            auth_time: grant.auth_time,
            nonce: grant.nonce,
            preferred_language: grant.preferred_language,
            reason: grant.reason,
            actor: grant.actor,
            refresh_token: refresh_expiration.map(|_| new_refresh_token()),
            creation: now,
            expiration: now + to_chrono(grant.access_token_lifetime),
        };
        (session, refresh_expiration)
    }

    fn insert_session(
        tables: &mut SessionTables,
        session: &Session,
        refresh_expiration: Option<DateTime<Utc>>,
    ) {
        if let (Some(rt), Some(expiration)) = (&session.refresh_token, refresh_expiration) {
            tables.by_refresh_token.insert(
                key(&session.tenant, rt),
                RefreshLineage {
                    token_id: session.token_id.clone(),
                    expiration,
                },
            );
        }
        tables
            .by_token_id
            .insert(key(&session.tenant, &session.token_id), session.clone());
    }
}

#[async_trait::async_trait]
impl ClientRegistry for InMemoryStore {
    async fn active_client_by_id(&self, tenant: &str, client_id: &str) -> Result<Client> {
        self.clients
            .get(&key(tenant, client_id))
            .map(|c| c.clone())
            .ok_or_else(|| Error::not_found(format!("client {client_id}")))
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemoryStore {
    async fn create_session(&self, grant: SessionGrant) -> Result<Session> {
        let (session, refresh_expiration) = Self::new_session(grant);
        Self::insert_session(&mut self.sessions.lock(), &session, refresh_expiration);
        debug!(tenant = %session.tenant, token_id = %session.token_id, "Session created");
        Ok(session)
    }

    async fn create_session_from_auth_request(
        &self,
        tenant: &str,
        code: &str,
        check: AuthRequestCheck<'_>,
    ) -> Result<Session> {
        let mut requests = self.auth_requests.lock();
        let id = requests
            .iter()
            .find(|((t, _), r)| t == tenant && r.code == code)
            .map(|((_, id), _)| id.clone())
            .ok_or_else(|| Error::not_found("authorization request"))?;
        let grant = match requests.get(&key(tenant, &id)) {
            Some(request) => check(request)?,
            None => return Err(Error::not_found("authorization request")),
        };
        requests.remove(&key(tenant, &id));
        let (session, refresh_expiration) = Self::new_session(grant);
        Self::insert_session(&mut self.sessions.lock(), &session, refresh_expiration);
        Ok(session)
    }

    async fn exchange_refresh_token(
        &self,
        tenant: &str,
        refresh_token: &str,
        requested_scope: &[String],
        lifetimes: TokenLifetimes,
        check: RefreshCheck<'_>,
    ) -> Result<Session> {
        let now = Utc::now();
        let mut tables = self.sessions.lock();
        let rt_key = key(tenant, refresh_token);
        let token_id = tables.lineage(&rt_key, now)?;
        let previous = tables
            .by_token_id
            .get(&key(tenant, &token_id))
            .cloned()
            .ok_or_else(|| Error::not_found("refresh token"))?;
        let scope = check(&previous, requested_scope)?;

        tables.by_refresh_token.remove(&rt_key);
        tables.by_token_id.remove(&key(tenant, &token_id));

        let renewed = Session {
            token_id: new_token_id(&previous.session_id),
            scope,
            reason: TokenReason::Refresh,
            refresh_token: Some(new_refresh_token()),
            creation: now,
            expiration: now + to_chrono(lifetimes.access),
            ..previous
        };
        Self::insert_session(&mut tables, &renewed, Some(now + to_chrono(lifetimes.refresh)));
        Ok(renewed)
    }

    async fn active_access_token_by_id(&self, tenant: &str, token_id: &str) -> Result<AccessToken> {
        if let Some(pat) = self.personal_tokens.get(&key(tenant, token_id)) {
            if pat.expiration > Utc::now() {
                return Ok(pat.clone());
            }
            return Err(Error::not_found("access token"));
        }
        let tables = self.sessions.lock();
        let session = tables
            .by_token_id
            .get(&key(tenant, token_id))
            .filter(|s| s.expiration > Utc::now())
            .ok_or_else(|| Error::not_found("access token"))?;
        Ok(AccessToken {
            token_id: session.token_id.clone(),
            user_id: session.user_id.clone(),
            subject: session.user_id.clone(),
            resource_owner: session.resource_owner.clone(),
            client_id: session.client_id.clone(),
            audience: session.audience.clone(),
            scope: session.scope.clone(),
            auth_methods: session.auth_methods.clone(),
            auth_time: session.auth_time,
            creation: session.creation,
            expiration: session.expiration,
            actor: session.actor.clone(),
            preferred_language: session.preferred_language.clone(),
            is_pat: false,
        })
    }

    async fn session_by_refresh_token(&self, tenant: &str, refresh_token: &str) -> Result<Session> {
        let tables = self.sessions.lock();
        let token_id = tables.lineage(&key(tenant, refresh_token), Utc::now())?;
        tables
            .by_token_id
            .get(&key(tenant, &token_id))
            .cloned()
            .ok_or_else(|| Error::not_found("refresh token"))
    }
}

#[async_trait::async_trait]
impl AuthRequestStore for InMemoryStore {
    async fn auth_request_by_code(&self, tenant: &str, code: &str) -> Result<AuthRequest> {
        self.auth_requests
            .lock()
            .iter()
            .find(|((t, _), r)| t == tenant && r.code == code)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| Error::not_found("authorization request"))
    }

    async fn delete_auth_request(&self, tenant: &str, id: &str) -> Result<()> {
        self.auth_requests
            .lock()
            .remove(&key(tenant, id))
            .map(|_| ())
            .ok_or_else(|| Error::not_found("authorization request"))
    }
}

#[async_trait::async_trait]
impl DeviceAuthStore for InMemoryStore {
    async fn device_auth(&self, tenant: &str, device_code: &str) -> Result<DeviceAuthorization> {
        let mut auths = self.device_auths.lock();
        let auth = auths
            .get_mut(&key(tenant, device_code))
            .ok_or_else(|| Error::not_found("device authorization"))?;
        if auth.state == DeviceAuthState::Initiated && auth.expires_at <= Utc::now() {
            auth.state = DeviceAuthState::Expired;
        }
        Ok(auth.clone())
    }

    async fn consume_device_auth(&self, tenant: &str, device_code: &str) -> Result<()> {
        let mut auths = self.device_auths.lock();
        let auth = auths
            .get_mut(&key(tenant, device_code))
            .ok_or_else(|| Error::not_found("device authorization"))?;
        if auth.state != DeviceAuthState::Approved {
            return Err(Error::precondition("device authorization is not approved"));
        }
        auth.state = DeviceAuthState::Done;
        Ok(())
    }
}

#[async_trait::async_trait]
impl KeyStorage for InMemoryStore {
    async fn active_private_signing_keys(&self, tenant: &str, grace: Duration) -> Result<PrivateKeys> {
        let cutoff = Utc::now() + to_chrono(grace);
        let all = self.keys.lock();
        let Some(tenant_keys) = all.get(tenant) else {
            return Ok(PrivateKeys::default());
        };
        Ok(PrivateKeys {
            keys: tenant_keys
                .keys
                .iter()
                .filter(|k| k.private.expiry > cutoff)
                .map(|k| k.private.clone())
                .collect(),
            sequence: tenant_keys.sequence,
        })
    }

    async fn latest_key_sequence(&self, tenant: &str) -> Result<u64> {
        Ok(self.keys.lock().get(tenant).map_or(0, |k| k.sequence))
    }

    async fn active_public_keys(&self, tenant: &str, as_of: DateTime<Utc>) -> Result<Vec<PublicKey>> {
        let all = self.keys.lock();
        Ok(all
            .get(tenant)
            .map(|k| {
                k.keys
                    .iter()
                    .filter(|k| k.public.expiry > as_of)
                    .map(|k| k.public.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn public_key_by_id(&self, tenant: &str, key_id: &str) -> Result<PublicKey> {
        self.public_key_lookups.fetch_add(1, Ordering::SeqCst);
        let all = self.keys.lock();
        all.get(tenant)
            .and_then(|k| k.keys.iter().find(|k| k.public.id == key_id))
            .map(|k| k.public.clone())
            .ok_or_else(|| Error::not_found(format!("public key {key_id}")))
    }

    async fn generate_signing_key_pair(&self, tenant: &str, algorithm: Algorithm) -> Result<()> {
        if algorithm != Algorithm::ES256 {
            return Err(Error::invalid_argument(format!(
                "unsupported algorithm {algorithm:?}"
            )));
        }
        let id = self.insert_key_pair(tenant, Utc::now() + to_chrono(self.key_lifetime))?;
        self.generated_keys.fetch_add(1, Ordering::SeqCst);
        debug!(tenant, key_id = %id, "Signing key pair generated");
        Ok(())
    }
}

#[async_trait::async_trait]
impl UserLookup for InMemoryStore {
    async fn user_by_id(&self, tenant: &str, user_id: &str) -> Result<User> {
        self.users
            .get(&key(tenant, user_id))
            .map(|u| u.clone())
            .ok_or_else(|| Error::not_found(format!("user {user_id}")))
    }

    async fn org_by_id(&self, tenant: &str, org_id: &str) -> Result<Org> {
        self.orgs
            .get(&key(tenant, org_id))
            .map(|o| o.clone())
            .ok_or_else(|| Error::not_found(format!("organization {org_id}")))
    }

    async fn org_by_primary_domain(&self, tenant: &str, domain: &str) -> Result<Org> {
        self.orgs
            .iter()
            .find(|e| e.key().0 == tenant && e.value().primary_domain == domain)
            .map(|e| e.value().clone())
            .ok_or_else(|| Error::not_found(format!("organization with domain {domain}")))
    }

    async fn userinfo(
        &self,
        tenant: &str,
        user_id: &str,
        scopes: &[String],
        role_audience: &[String],
    ) -> Result<Claims> {
        let user = self.user_by_id(tenant, user_id).await?;
        let mut claims = Claims::new();
        claims.insert("sub".into(), Value::String(user.id.clone()));
        let has = |s: &str| scopes.iter().any(|x| x == s);
        if has(scope::PROFILE) {
            claims.insert("preferred_username".into(), json!(user.username));
            if let Some(name) = &user.display_name {
                claims.insert("name".into(), json!(name));
            }
            if let Some(locale) = &user.preferred_language {
                claims.insert("locale".into(), json!(locale));
            }
        }
        if has(scope::EMAIL) {
            if let Some(email) = &user.email {
                claims.insert("email".into(), json!(email));
                claims.insert("email_verified".into(), json!(user.email_verified));
            }
        }
        if has(scope::PROJECT_ROLES) || !role_audience.is_empty() {
            let mut roles = serde_json::Map::new();
            for grant in &user.roles {
                if !role_audience.is_empty() && !role_audience.contains(&grant.project_id) {
                    continue;
                }
                let domain = self
                    .orgs
                    .get(&key(tenant, &grant.org_id))
                    .map_or_else(|| grant.org_id.clone(), |o| o.primary_domain.clone());
                let entry = roles
                    .entry(grant.role.clone())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if let Value::Object(orgs) = entry {
                    orgs.insert(grant.org_id.clone(), Value::String(domain));
                }
            }
            if !roles.is_empty() {
                claims.insert(scope::CLAIM_PROJECT_ROLES.into(), Value::Object(roles));
            }
        }
        Ok(claims)
    }

    async fn check_permission(
        &self,
        tenant: &str,
        user_id: &str,
        permission: &str,
        resource_owner: &str,
    ) -> Result<()> {
        let user = self.user_by_id(tenant, user_id).await?;
        let scoped = format!("{permission}:{resource_owner}");
        if user
            .permissions
            .iter()
            .any(|p| p == permission || *p == scoped)
        {
            Ok(())
        } else {
            Err(Error::PermissionDenied(format!(
                "user {user_id} lacks {permission} on {resource_owner}"
            )))
        }
    }
}

#[async_trait::async_trait]
impl TenantSettingsStore for InMemoryStore {
    async fn tenant_settings(&self, tenant: &str) -> Result<TenantSettings> {
        Ok(self
            .tenant_settings
            .get(tenant)
            .map_or_else(|| *self.default_settings.lock(), |s| *s))
    }
}

#[async_trait::async_trait]
impl ExpiryReaper for InMemoryStore {
    async fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let mut reaped = 0;
        {
            let mut tables = self.sessions.lock();
            let before = tables.by_refresh_token.len();
            tables.by_refresh_token.retain(|_, l| l.expiration > now);
            reaped += before - tables.by_refresh_token.len();

            // Expired access tokens stay while their lineage can still be refreshed.
            let refreshable: HashSet<Key> = tables
                .by_refresh_token
                .iter()
                .map(|((tenant, _), l)| key(tenant, &l.token_id))
                .collect();
            let before = tables.by_token_id.len();
            tables
                .by_token_id
                .retain(|k, s| s.expiration > now || refreshable.contains(k));
            reaped += before - tables.by_token_id.len();
        }
        {
            let mut requests = self.auth_requests.lock();
            let before = requests.len();
            requests.retain(|_, r| r.auth_time + AUTH_REQUEST_MAX_AGE > now);
            reaped += before - requests.len();
        }
        {
            let mut auths = self.device_auths.lock();
            let before = auths.len();
            auths.retain(|_, a| a.state != DeviceAuthState::Done && a.expires_at > now);
            reaped += before - auths.len();
        }
        let before = self.personal_tokens.len();
        self.personal_tokens.retain(|_, t| t.expiration > now);
        reaped += before.saturating_sub(self.personal_tokens.len());
        reaped
    }
}

/// Process-local lock with expiry.
#[derive(Default)]
pub struct InMemoryLock {
    held: DashMap<String, (String, Instant)>,
    acquisitions: AtomicU64,
}

impl InMemoryLock {
    /// Empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful acquisitions so far.
    #[must_use]
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl DistributedLock for InMemoryLock {
    async fn lock(&self, tenant: &str, owner: &str, duration: Duration) -> Result<bool> {
        let now = Instant::now();
        let acquired = match self.held.entry(tenant.to_string()) {
            Entry::Occupied(mut e) => {
                let (holder, until) = e.get();
                if holder == owner || *until <= now {
                    e.insert((owner.to_string(), now + duration));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(e) => {
                e.insert((owner.to_string(), now + duration));
                true
            }
        };
        if acquired {
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
        }
        Ok(acquired)
    }
}
