//! Client authentication at the token and introspection endpoints.
//!
//! Supported methods: `none` (public clients), `client_secret_basic`,
//! `client_secret_post` and `private_key_jwt`. Secrets are stored as
//! SHA-256 digests and compared in constant time. Every failure is reported
//! as [`Error::Unauthenticated`]; callers decide which protocol error that
//! becomes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::context::RequestContext;
use crate::domain::{Client, ClientAuthMethod};
use crate::keys::verifier::{self, AssertionClaims, AssertionRules};
use crate::storage::ClientRegistry;
use crate::{Error, Result};

/// `client_assertion_type` for `private_key_jwt`.
pub const CLIENT_ASSERTION_TYPE_JWT_BEARER: &str =
    "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// Credential proof presented with a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientCredentials {
    /// Client id
    pub client_id: Option<String>,
    /// Client secret
    pub client_secret: Option<String>,
    /// Signed client assertion
    pub client_assertion: Option<String>,
    /// Assertion type
    pub client_assertion_type: Option<String>,
}

impl ClientCredentials {
    /// Whether any client-identifying material was presented.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.client_id.is_none() && self.client_assertion.is_none()
    }

    /// Merge `Authorization: Basic` credentials. Header values win.
    ///
    /// Secret clients may present the secret either way, whichever of
    /// `client_secret_basic` and `client_secret_post` they registered.
    #[must_use]
    pub fn with_basic(mut self, client_id: String, client_secret: String) -> Self {
        self.client_id = Some(client_id);
        self.client_secret = Some(client_secret);
        self
    }
}

/// SHA-256 digest a client secret is stored as.
#[must_use]
pub fn secret_digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Authenticates clients against the registry.
#[derive(Clone)]
pub struct ClientAuthenticator {
    clients: Arc<dyn ClientRegistry>,
    assertion_max_lifetime: Duration,
    assertion_leeway: Duration,
}

impl ClientAuthenticator {
    /// New authenticator.
    #[must_use]
    pub fn new(
        clients: Arc<dyn ClientRegistry>,
        assertion_max_lifetime: Duration,
        assertion_leeway: Duration,
    ) -> Self {
        Self {
            clients,
            assertion_max_lifetime,
            assertion_leeway,
        }
    }

    /// Authenticate the client behind `credentials`.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        credentials: &ClientCredentials,
    ) -> Result<Client> {
        if let Some(assertion) = &credentials.client_assertion {
            return self.authenticate_assertion(ctx, credentials, assertion).await;
        }
        let client_id = credentials
            .client_id
            .as_deref()
            .ok_or_else(|| Error::Unauthenticated("client_id is missing".into()))?;
        let client = self.lookup(ctx, client_id).await?;
        match client.auth_method {
            ClientAuthMethod::None => Ok(client),
            ClientAuthMethod::Basic | ClientAuthMethod::Post => {
                let secret = credentials
                    .client_secret
                    .as_deref()
                    .ok_or_else(|| Error::Unauthenticated("client_secret is missing".into()))?;
                check_secret(&client, secret)?;
                Ok(client)
            }
            ClientAuthMethod::PrivateKeyJwt => Err(Error::Unauthenticated(
                "client must authenticate with a client_assertion".into(),
            )),
        }
    }

    async fn lookup(&self, ctx: &RequestContext, client_id: &str) -> Result<Client> {
        self.clients
            .active_client_by_id(&ctx.tenant, client_id)
            .await
            .map_err(|e| match e {
                Error::NotFound(_) => Error::Unauthenticated(format!("client {client_id:?} not found")),
                other => other,
            })
    }

    async fn authenticate_assertion(
        &self,
        ctx: &RequestContext,
        credentials: &ClientCredentials,
        assertion: &str,
    ) -> Result<Client> {
        if credentials.client_assertion_type.as_deref() != Some(CLIENT_ASSERTION_TYPE_JWT_BEARER) {
            return Err(Error::Unauthenticated("unsupported client_assertion_type".into()));
        }
        let unauthenticated = |e: Error| Error::Unauthenticated(format!("invalid client assertion: {e}"));
        let peeked: AssertionClaims = verifier::peek_claims(assertion).map_err(unauthenticated)?;
        if let Some(client_id) = &credentials.client_id {
            if *client_id != peeked.iss {
                return Err(Error::Unauthenticated("client_id does not match the assertion".into()));
            }
        }
        let client = self.lookup(ctx, &peeked.iss).await?;
        if client.auth_method != ClientAuthMethod::PrivateKeyJwt {
            return Err(Error::Unauthenticated("client does not use private_key_jwt".into()));
        }
        let kid = verifier::key_id(assertion).map_err(unauthenticated)?;
        let key = client
            .key(&kid)
            .ok_or_else(|| Error::Unauthenticated(format!("client key {kid:?} not found")))?;
        if key.expires_at.is_some_and(|exp| exp < Utc::now()) {
            return Err(Error::Unauthenticated(format!("client key {kid:?} expired")));
        }
        let rules = AssertionRules {
            audience: ctx.issuer.clone(),
            max_lifetime: self.assertion_max_lifetime,
            leeway: self.assertion_leeway,
        };
        verifier::verify_assertion(assertion, &key.public_key_pem, &rules).map_err(unauthenticated)?;
        debug!(client_id = %client.id, kid = %kid, "Client authenticated by assertion");
        Ok(client)
    }
}

fn check_secret(client: &Client, secret: &str) -> Result<()> {
    let stored = client
        .secret_digest
        .ok_or_else(|| Error::Unauthenticated("client has no secret".into()))?;
    let presented = secret_digest(secret);
    if bool::from(stored.ct_eq(&presented)) {
        Ok(())
    } else {
        Err(Error::Unauthenticated("invalid client secret".into()))
    }
}
