//! Provider: central coordinator wiring every component.
//!
//! Holds the grant handlers, the introspection engine and the key
//! subsystems, and is the single place where crate errors are adapted to
//! the OAuth error vocabulary ([`OAuthError::from_error`]) and where audit
//! events are emitted. The HTTP surface in [`handler`] is a thin layer over
//! the three public operations: [`Provider::token`],
//! [`Provider::introspect`] and [`Provider::jwks`].
//!
//! # Architecture
//!
//! ```text
//! POST /oauth/v2/token
//!   -> TokenRequest::from_form
//!   -> GrantHandlers::handle   (authenticate, grant checks, create session)
//!   -> Minter / TokenExchangeEngine
//!   -> audit, adapt errors once
//! ```

pub mod handler;

use std::sync::Arc;

use chrono::Utc;
use jsonwebtoken::jwk::JwkSet;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::audit::{self, AuditEvent};
use crate::config::Config;
use crate::context::RequestContext;
use crate::domain::GrantType;
use crate::error::OAuthError;
use crate::exchange::TokenExchangeEngine;
use crate::grant::{ClientAuthenticator, ClientCredentials, GrantHandlers, TokenRequest};
use crate::introspection::{IntrospectionEngine, IntrospectionResponse};
use crate::keys::cache::{self, PublicKeyCache};
use crate::keys::jwk_set;
use crate::keys::rotator::SignerRegistry;
use crate::keys::verifier::{AssertionRules, JwtVerifier};
use crate::storage::{
    self, AuthRequestStore, ClientRegistry, DeviceAuthStore, DistributedLock, ExpiryReaper,
    InMemoryLock, InMemoryStore, KeyStorage, SessionStore, TenantSettingsStore, UserLookup,
};
use crate::token::{AccessTokenVerifier, Minter, OpaqueTokenCodec, TokenResponse};
use crate::Result;

/// External collaborators the provider is built from.
#[derive(Clone)]
pub struct Collaborators {
    /// Application registry
    pub clients: Arc<dyn ClientRegistry>,
    /// Session persistence
    pub sessions: Arc<dyn SessionStore>,
    /// Legacy authorization requests
    pub auth_requests: Arc<dyn AuthRequestStore>,
    /// Device authorizations
    pub devices: Arc<dyn DeviceAuthStore>,
    /// Signing key storage
    pub keys: Arc<dyn KeyStorage>,
    /// Fleet-wide lock for key generation
    pub lock: Arc<dyn DistributedLock>,
    /// Users, orgs and claims
    pub users: Arc<dyn UserLookup>,
    /// Tenant security settings
    pub settings: Arc<dyn TenantSettingsStore>,
    /// Removal of expired sessions and requests
    pub reaper: Arc<dyn ExpiryReaper>,
}

impl Collaborators {
    /// Every collaborator backed by one in-memory store.
    #[must_use]
    pub fn in_memory(store: Arc<InMemoryStore>, lock: Arc<InMemoryLock>) -> Self {
        Self {
            clients: store.clone(),
            sessions: store.clone(),
            auth_requests: store.clone(),
            devices: store.clone(),
            keys: store.clone(),
            lock,
            users: store.clone(),
            settings: store.clone(),
            reaper: store,
        }
    }
}

/// The token issuance core.
pub struct Provider {
    config: Config,
    settings: Arc<dyn TenantSettingsStore>,
    keys: Arc<dyn KeyStorage>,
    signers: Arc<SignerRegistry>,
    key_cache: Arc<PublicKeyCache>,
    grants: GrantHandlers,
    introspection: IntrospectionEngine,
}

impl Provider {
    /// Wire a provider without background loops. Keys are rotated inline
    /// when a request needs one.
    pub fn new(config: Config, collaborators: Collaborators) -> Result<Self> {
        Self::build(config, collaborators, None)
    }

    /// Wire a provider whose rotators and cache purge run in the background
    /// until `shutdown` fires.
    pub fn with_background(
        config: Config,
        collaborators: Collaborators,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Self> {
        Self::build(config, collaborators, Some(shutdown))
    }

    fn build(
        config: Config,
        c: Collaborators,
        shutdown: Option<&broadcast::Sender<()>>,
    ) -> Result<Self> {
        let mut registry = SignerRegistry::new(
            Arc::clone(&c.keys),
            Arc::clone(&c.lock),
            config.rotation_settings()?,
        );
        let key_cache = Arc::new(PublicKeyCache::new(
            Arc::clone(&c.keys),
            config.keys.cache_idle_ttl,
        ));
        if let Some(tx) = shutdown {
            registry = registry.with_background(tx.clone());
            cache::spawn_purge(
                Arc::clone(&key_cache),
                config.keys.cache_purge_interval,
                tx.subscribe(),
            );
            storage::spawn_reaper(
                Arc::clone(&c.reaper),
                config.oidc.reap_interval,
                tx.subscribe(),
            );
        }
        let signers = Arc::new(registry);

        let opaque = OpaqueTokenCodec::new(config.oidc.resolve_opaque_token_secret());
        let jwt = JwtVerifier::new(Arc::clone(&key_cache));
        let access = AccessTokenVerifier::new(jwt.clone(), opaque.clone(), Arc::clone(&c.sessions));
        let minter = Arc::new(Minter::new(
            Arc::clone(&signers),
            Arc::clone(&c.users),
            opaque,
            config.amr.policy(),
        ));
        let grant_settings = config.grant_settings();
        let client_auth = ClientAuthenticator::new(
            Arc::clone(&c.clients),
            grant_settings.assertion_max_lifetime,
            grant_settings.assertion_leeway,
        );
        let exchange = Arc::new(TokenExchangeEngine::new(
            access.clone(),
            jwt,
            Arc::clone(&c.sessions),
            Arc::clone(&c.users),
            Arc::clone(&minter),
            AssertionRules {
                audience: String::new(),
                max_lifetime: grant_settings.assertion_max_lifetime,
                leeway: grant_settings.assertion_leeway,
            },
        ));
        let introspection =
            IntrospectionEngine::new(client_auth.clone(), access, Arc::clone(&c.users));
        let grants = GrantHandlers::new(
            c.sessions,
            c.auth_requests,
            c.devices,
            c.users,
            client_auth,
            minter,
            exchange,
            grant_settings,
        );

        Ok(Self {
            config,
            settings: c.settings,
            keys: c.keys,
            signers,
            key_cache,
            grants,
            introspection,
        })
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Tenant used when a request names none.
    #[must_use]
    pub fn default_tenant(&self) -> &str {
        &self.config.oidc.default_tenant
    }

    /// Signing key rotators.
    #[must_use]
    pub fn signers(&self) -> &Arc<SignerRegistry> {
        &self.signers
    }

    /// Public key cache used for verification.
    #[must_use]
    pub fn key_cache(&self) -> &Arc<PublicKeyCache> {
        &self.key_cache
    }

    /// Request context for `tenant`.
    pub async fn context(&self, tenant: &str) -> Result<RequestContext> {
        let settings = self.settings.tenant_settings(tenant).await?;
        Ok(RequestContext::new(
            tenant,
            self.config.oidc.issuer_for(tenant),
            settings,
        ))
    }

    /// Token endpoint.
    pub async fn token(
        &self,
        tenant: &str,
        request: TokenRequest,
    ) -> std::result::Result<TokenResponse, OAuthError> {
        let grant_type = request.grant.grant_type();
        let ctx = match self.context(tenant).await {
            Ok(ctx) => ctx,
            Err(e) => {
                return Err(Self::deny(tenant, Some(grant_type), OAuthError::from_error(e, false)));
            }
        };
        match self.grants.handle(&ctx, request).await {
            Ok((response, session)) => {
                audit::emit(&AuditEvent::for_session(&session, grant_type));
                info!(
                    tenant = %tenant,
                    client_id = %session.client_id,
                    grant_type = %grant_type,
                    "Token issued"
                );
                Ok(response)
            }
            Err(e) => {
                let err = OAuthError::from_error(e, ctx.debug_errors());
                Err(Self::deny(tenant, Some(grant_type), err))
            }
        }
    }

    fn deny(tenant: &str, grant_type: Option<GrantType>, err: OAuthError) -> OAuthError {
        match &err.parent {
            Some(parent) => warn!(tenant = %tenant, error = %err.code, cause = %parent, "Token request denied"),
            None => warn!(tenant = %tenant, error = %err.code, "Token request denied"),
        }
        audit::emit(&AuditEvent::denied(tenant, grant_type, &err));
        err
    }

    /// Introspection endpoint.
    pub async fn introspect(
        &self,
        tenant: &str,
        token: &str,
        credentials: &ClientCredentials,
    ) -> std::result::Result<IntrospectionResponse, OAuthError> {
        let ctx = self
            .context(tenant)
            .await
            .map_err(|e| OAuthError::from_error(e, false))?;
        match self.introspection.introspect(&ctx, token, credentials).await {
            Ok((response, client)) => {
                audit::emit(&AuditEvent::introspected(
                    tenant,
                    Some(client.id),
                    response.active,
                ));
                Ok(response)
            }
            Err(e) => {
                let err = OAuthError::from_error(e, ctx.debug_errors());
                warn!(tenant = %tenant, error = %err.code, "Introspection rejected");
                audit::emit(&AuditEvent::introspected(
                    tenant,
                    credentials.client_id.clone(),
                    false,
                ));
                Err(err)
            }
        }
    }

    /// Public keys of `tenant` that have not expired.
    pub async fn jwks(&self, tenant: &str) -> std::result::Result<JwkSet, OAuthError> {
        let keys = self
            .keys
            .active_public_keys(tenant, Utc::now())
            .await
            .map_err(|e| OAuthError::from_error(e, false))?;
        debug!(tenant = %tenant, count = keys.len(), "Serving JWKS");
        Ok(jwk_set(&keys))
    }
}
