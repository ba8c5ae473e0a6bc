//! Grant handlers and token endpoint dispatch.
//!
//! A token request is parsed into a closed [`GrantRequest`] enum, one variant
//! per supported `grant_type`, and dispatched with an exhaustive `match`.
//! Every handler follows the same contract:
//!
//! 1. authenticate the client from the credential proof,
//! 2. run grant-specific checks,
//! 3. have the session store create exactly one session,
//! 4. hand the session to [`Minter`].
//!
//! Token exchange follows steps 1 and 3 as well but mints its own response
//! shape (see [`crate::exchange`]).

pub mod client_auth;
pub mod client_credentials;
pub mod code;
pub mod device;
pub mod jwt_profile;
pub mod refresh;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::context::RequestContext;
use crate::domain::{Client, GrantType, Session, TokenType, scope};
use crate::error::OAuthError;
use crate::exchange::{TokenExchangeEngine, TokenExchangeRequest};
use crate::keys::verifier::AssertionRules;
use crate::storage::{AuthRequestStore, DeviceAuthStore, SessionStore, User, UserLookup};
use crate::token::{MintOptions, Minter, TokenResponse};
use crate::{Error, Result};

pub use client_auth::{ClientAuthenticator, ClientCredentials};
pub use code::{AuthorizationGrant, LegacyGrant, V2Grant};

/// `authorization_code` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeRequest {
    /// Authorization code
    pub code: String,
    /// Must match the authorization request exactly
    pub redirect_uri: String,
    /// PKCE verifier
    pub code_verifier: Option<String>,
}

/// `client_credentials` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCredentialsRequest {
    /// Requested scope
    pub scope: Vec<String>,
}

/// JWT bearer (profile) parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JwtBearerRequest {
    /// Signed assertion
    pub assertion: String,
    /// Requested scope
    pub scope: Vec<String>,
}

/// Device code parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCodeRequest {
    /// Device code from the device authorization response
    pub device_code: String,
}

/// `refresh_token` parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshTokenRequest {
    /// Refresh token
    pub refresh_token: String,
    /// Narrowed scope, empty for the original scope
    pub scope: Vec<String>,
}

/// A parsed grant, one variant per `grant_type`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantRequest {
    /// `authorization_code`
    AuthorizationCode(CodeRequest),
    /// `client_credentials`
    ClientCredentials(ClientCredentialsRequest),
    /// `urn:ietf:params:oauth:grant-type:jwt-bearer`
    JwtBearer(JwtBearerRequest),
    /// `urn:ietf:params:oauth:grant-type:device_code`
    DeviceCode(DeviceCodeRequest),
    /// `refresh_token`
    RefreshToken(RefreshTokenRequest),
    /// `urn:ietf:params:oauth:grant-type:token-exchange`
    TokenExchange(TokenExchangeRequest),
}

impl GrantRequest {
    /// The grant type of this request.
    #[must_use]
    pub fn grant_type(&self) -> GrantType {
        match self {
            Self::AuthorizationCode(_) => GrantType::AuthorizationCode,
            Self::ClientCredentials(_) => GrantType::ClientCredentials,
            Self::JwtBearer(_) => GrantType::JwtBearer,
            Self::DeviceCode(_) => GrantType::DeviceCode,
            Self::RefreshToken(_) => GrantType::RefreshToken,
            Self::TokenExchange(_) => GrantType::TokenExchange,
        }
    }
}

/// A complete token endpoint request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRequest {
    /// Client credential proof
    pub credentials: ClientCredentials,
    /// Grant
    pub grant: GrantRequest,
}

/// Form parameters as received, repeated keys preserved.
struct Form<'a>(&'a [(String, String)]);

impl Form<'_> {
    fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, v)| k == name && !v.is_empty())
            .map(|(_, v)| v.as_str())
    }

    fn require(&self, name: &str) -> Result<String> {
        self.get(name).map(str::to_string).ok_or_else(|| {
            OAuthError::invalid_request()
                .with_description(format!("{name} is missing"))
                .into()
        })
    }

    fn opt(&self, name: &str) -> Option<String> {
        self.get(name).map(str::to_string)
    }

    fn scope(&self) -> Vec<String> {
        self.get("scope").map(scope::parse).unwrap_or_default()
    }

    /// All values of a repeatable parameter, each also split on whitespace.
    fn all(&self, name: &str) -> Vec<String> {
        self.0
            .iter()
            .filter(|(k, _)| k == name)
            .flat_map(|(_, v)| scope::parse(v))
            .collect()
    }

    fn token_type(&self, name: &str) -> Result<Option<TokenType>> {
        self.get(name).map(str::parse).transpose()
    }
}

impl TokenRequest {
    /// Parse a form-encoded token request.
    pub fn from_form(params: &[(String, String)]) -> Result<Self> {
        let form = Form(params);
        let grant_type: GrantType = form.require("grant_type")?.parse()?;
        let credentials = ClientCredentials {
            client_id: form.opt("client_id"),
            client_secret: form.opt("client_secret"),
            client_assertion: form.opt("client_assertion"),
            client_assertion_type: form.opt("client_assertion_type"),
        };
        let grant = match grant_type {
            GrantType::AuthorizationCode => GrantRequest::AuthorizationCode(CodeRequest {
                code: form.require("code")?,
                redirect_uri: form.require("redirect_uri")?,
                code_verifier: form.opt("code_verifier"),
            }),
            GrantType::ClientCredentials => {
                GrantRequest::ClientCredentials(ClientCredentialsRequest { scope: form.scope() })
            }
            GrantType::JwtBearer => GrantRequest::JwtBearer(JwtBearerRequest {
                assertion: form.require("assertion")?,
                scope: form.scope(),
            }),
            GrantType::DeviceCode => GrantRequest::DeviceCode(DeviceCodeRequest {
                device_code: form.require("device_code")?,
            }),
            GrantType::RefreshToken => GrantRequest::RefreshToken(RefreshTokenRequest {
                refresh_token: form.require("refresh_token")?,
                scope: form.scope(),
            }),
            GrantType::TokenExchange => GrantRequest::TokenExchange(TokenExchangeRequest {
                subject_token: form.require("subject_token")?,
                subject_token_type: form
                    .token_type("subject_token_type")?
                    .ok_or_else(|| {
                        Error::from(
                            OAuthError::invalid_request()
                                .with_description("subject_token_type is missing"),
                        )
                    })?,
                actor_token: form.opt("actor_token"),
                actor_token_type: form.token_type("actor_token_type")?,
                requested_token_type: form.token_type("requested_token_type")?,
                audience: form.all("audience"),
                scope: form.scope(),
                resource: form.all("resource"),
            }),
        };
        Ok(Self { credentials, grant })
    }
}

/// Tunables shared by the grant handlers.
#[derive(Debug, Clone)]
pub struct GrantSettings {
    /// Maximum assertion validity window
    pub assertion_max_lifetime: Duration,
    /// Allowed assertion clock skew
    pub assertion_leeway: Duration,
    /// Deadline for a device authorization lookup
    pub device_poll_deadline: Duration,
    /// Access token lifetime for clients synthesized from service users
    pub default_access_token_lifetime: Duration,
    /// ID token lifetime for clients synthesized from service users
    pub default_id_token_lifetime: Duration,
    /// Refresh token lifetime for clients synthesized from service users
    pub default_refresh_token_lifetime: Duration,
}

impl Default for GrantSettings {
    fn default() -> Self {
        Self {
            assertion_max_lifetime: Duration::from_secs(3600),
            assertion_leeway: Duration::from_secs(5),
            device_poll_deadline: Duration::from_secs(5),
            default_access_token_lifetime: Duration::from_secs(12 * 3600),
            default_id_token_lifetime: Duration::from_secs(12 * 3600),
            default_refresh_token_lifetime: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

impl GrantSettings {
    /// Assertion limits for `ctx`'s issuer.
    #[must_use]
    pub fn assertion_rules(&self, ctx: &RequestContext) -> AssertionRules {
        AssertionRules {
            audience: ctx.issuer.clone(),
            max_lifetime: self.assertion_max_lifetime,
            leeway: self.assertion_leeway,
        }
    }
}

/// Collaborators of the grant handlers.
pub struct GrantHandlers {
    pub(crate) sessions: Arc<dyn SessionStore>,
    pub(crate) devices: Arc<dyn DeviceAuthStore>,
    pub(crate) users: Arc<dyn UserLookup>,
    pub(crate) client_auth: ClientAuthenticator,
    pub(crate) minter: Arc<Minter>,
    pub(crate) exchange: Arc<TokenExchangeEngine>,
    pub(crate) settings: GrantSettings,
    legacy: LegacyGrant,
    v2: V2Grant,
}

impl GrantHandlers {
    /// Wire the handlers.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        auth_requests: Arc<dyn AuthRequestStore>,
        devices: Arc<dyn DeviceAuthStore>,
        users: Arc<dyn UserLookup>,
        client_auth: ClientAuthenticator,
        minter: Arc<Minter>,
        exchange: Arc<TokenExchangeEngine>,
        settings: GrantSettings,
    ) -> Self {
        Self {
            legacy: LegacyGrant::new(auth_requests, Arc::clone(&sessions)),
            v2: V2Grant::new(Arc::clone(&sessions)),
            sessions,
            devices,
            users,
            client_auth,
            minter,
            exchange,
            settings,
        }
    }

    /// Authorization grant implementation for `code`, by prefix.
    #[must_use]
    pub fn authorization_grant(&self, code: &str) -> &dyn AuthorizationGrant {
        if code.starts_with(code::V2_CODE_PREFIX) {
            &self.v2
        } else {
            &self.legacy
        }
    }

    /// Authenticate the client and check it registered `grant_type`.
    async fn client(
        &self,
        ctx: &RequestContext,
        credentials: &ClientCredentials,
        grant_type: GrantType,
    ) -> Result<Client> {
        let client = self
            .client_auth
            .authenticate(ctx, credentials)
            .await
            .map_err(|e| OAuthError::invalid_client().with_parent(e))?;
        if !client.allows_grant(grant_type) {
            return Err(OAuthError::unauthorized_client()
                .with_description(format!("client is not allowed to use {grant_type}"))
                .into());
        }
        Ok(client)
    }

    /// Serve a token request. Errors are still crate errors; the caller
    /// adapts them to the protocol vocabulary.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        request: TokenRequest,
    ) -> Result<(TokenResponse, Session)> {
        let TokenRequest { credentials, grant } = request;
        let grant_type = grant.grant_type();
        let (client, session) = match grant {
            GrantRequest::AuthorizationCode(r) => {
                let client = self.client(ctx, &credentials, grant_type).await?;
                let session = self
                    .authorization_grant(&r.code)
                    .exchange(ctx, &client, &r)
                    .await?;
                (client, session)
            }
            GrantRequest::ClientCredentials(r) => {
                let client = self.client(ctx, &credentials, grant_type).await?;
                let session = client_credentials::exchange(self, ctx, &client, &r).await?;
                (client, session)
            }
            GrantRequest::JwtBearer(r) => jwt_profile::exchange(self, ctx, &credentials, &r).await?,
            GrantRequest::DeviceCode(r) => {
                let client = self.client(ctx, &credentials, grant_type).await?;
                let session = device::exchange(self, ctx, &client, &r).await?;
                (client, session)
            }
            GrantRequest::RefreshToken(r) => {
                let client = self.client(ctx, &credentials, grant_type).await?;
                let session = refresh::exchange(self, ctx, &client, &r).await?;
                (client, session)
            }
            GrantRequest::TokenExchange(r) => {
                let client = self.client(ctx, &credentials, grant_type).await?;
                return self.exchange.exchange(ctx, &client, r).await;
            }
        };
        debug!(tenant = %ctx.tenant, %grant_type, token_id = %session.token_id, "Grant accepted");
        let options = MintOptions::for_grant(&session, &client, grant_type);
        let response = self.minter.mint(ctx, &session, &client, options).await?;
        Ok((response, session))
    }

    /// Drop org scopes that do not match `user`'s organization.
    pub(crate) async fn restrict_org_scopes(
        &self,
        ctx: &RequestContext,
        user: &User,
        scopes: Vec<String>,
    ) -> Result<Vec<String>> {
        let mut kept = Vec::with_capacity(scopes.len());
        for s in scopes {
            if let Some(org_id) = s.strip_prefix(scope::ORG_ID_PREFIX) {
                if org_id != user.resource_owner {
                    debug!(scope = %s, "Dropping org scope of foreign organization");
                    continue;
                }
            } else if let Some(domain) = s.strip_prefix(scope::ORG_DOMAIN_PRIMARY_PREFIX) {
                match self.users.org_by_primary_domain(&ctx.tenant, domain).await {
                    Ok(org) if org.id == user.resource_owner => {}
                    Ok(_) => continue,
                    Err(e) if e.is_not_found() => continue,
                    Err(e) => return Err(e),
                }
            }
            kept.push(s);
        }
        Ok(kept)
    }

    /// Reject scopes the client may not request.
    pub(crate) fn check_scopes_allowed(client: &Client, scopes: &[String]) -> Result<()> {
        match scopes.iter().find(|s| !client.is_scope_allowed(s)) {
            Some(s) => Err(OAuthError::invalid_scope()
                .with_description(format!("scope {s:?} is not allowed"))
                .into()),
            None => Ok(()),
        }
    }
}

/// Map a store `NotFound` to `invalid_grant`: the code, token or device
/// authorization is unknown, expired or already used.
pub(crate) fn not_found_as_invalid_grant(err: Error) -> Error {
    if err.is_not_found() {
        OAuthError::invalid_grant()
            .with_description("grant is invalid, expired or already used")
            .with_parent(err)
            .into()
    } else {
        err
    }
}
