//! Access token verification.
//!
//! Both token formats resolve to a token id, and the session store decides
//! whether that id is still active. A JWT access token whose signature is
//! valid but whose session was rotated away by a refresh is therefore
//! inactive, same as an opaque one.

use std::sync::Arc;

use super::AccessTokenClaims;
use super::opaque::OpaqueTokenCodec;
use crate::context::RequestContext;
use crate::domain::AccessToken;
use crate::keys::verifier::{JwtVerifier, VerifyOptions};
use crate::storage::SessionStore;
use crate::{Error, Result};

/// Resolves presented access tokens to their active session view.
#[derive(Clone)]
pub struct AccessTokenVerifier {
    jwt: JwtVerifier,
    opaque: OpaqueTokenCodec,
    sessions: Arc<dyn SessionStore>,
}

impl AccessTokenVerifier {
    /// New verifier.
    #[must_use]
    pub fn new(jwt: JwtVerifier, opaque: OpaqueTokenCodec, sessions: Arc<dyn SessionStore>) -> Self {
        Self {
            jwt,
            opaque,
            sessions,
        }
    }

    /// Verify `token` and load the active access token behind it.
    pub async fn verify(&self, ctx: &RequestContext, token: &str) -> Result<AccessToken> {
        let (token_id, subject) = if OpaqueTokenCodec::is_opaque(token) {
            self.opaque.decode(token)?
        } else {
            let options = VerifyOptions {
                issuer: Some(ctx.issuer.clone()),
                ..VerifyOptions::default()
            };
            let claims: AccessTokenClaims = self.jwt.verify(&ctx.tenant, token, &options).await?;
            (claims.jti, claims.sub)
        };
        let access = self
            .sessions
            .active_access_token_by_id(&ctx.tenant, &token_id)
            .await?;
        if access.subject != subject {
            return Err(Error::invalid_argument("token subject mismatch"));
        }
        Ok(access)
    }
}
