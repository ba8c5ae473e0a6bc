//! JWT verification.
//!
//! Two kinds of JWTs reach the core:
//!
//! - Tokens we issued (ID tokens, JWT access tokens). Their `kid` is resolved
//!   through the [`PublicKeyCache`]; stricter call sites can additionally
//!   reject tokens signed by a key that has itself expired.
//! - Assertions signed by a client or user key (`private_key_jwt`, JWT
//!   profile). They must be self-issued (`iss == sub`), name our issuer in
//!   `aud`, be valid for at most an hour and may only be skewed by a few
//!   seconds.
//!
//! Audience checks are done by hand (`validate_aud = false`): `aud` can be a
//! string or an array, and callers need "contains", not "equals".

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::cache::PublicKeyCache;
use crate::{Error, Result};

/// Deserialize a claim that may be a single string or an array of strings.
pub fn one_or_many<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Options for [`JwtVerifier::verify`].
#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Required `iss`
    pub issuer: Option<String>,
    /// Reject tokens whose signing key has expired
    pub reject_expired_key: bool,
    /// Accept tokens past `exp` (e.g. ID token hints)
    pub allow_expired: bool,
    /// Clock leeway
    pub leeway: Duration,
}

/// Verifies JWTs issued by this server.
#[derive(Clone)]
pub struct JwtVerifier {
    cache: Arc<PublicKeyCache>,
}

impl JwtVerifier {
    /// Verifier resolving keys through `cache`.
    #[must_use]
    pub fn new(cache: Arc<PublicKeyCache>) -> Self {
        Self { cache }
    }

    /// Verify signature and standard claims, then deserialize the claims.
    pub async fn verify<T: DeserializeOwned>(
        &self,
        tenant: &str,
        token: &str,
        options: &VerifyOptions,
    ) -> Result<T> {
        let header = jsonwebtoken::decode_header(token)?;
        let key_id = header
            .kid
            .ok_or_else(|| Error::invalid_argument("JWT is missing the kid header"))?;
        let key = self.cache.get_key(tenant, &key_id).await?;
        if header.alg != key.algorithm {
            return Err(Error::invalid_argument("JWT algorithm does not match its key"));
        }
        if options.reject_expired_key && key.is_expired_at(Utc::now()) {
            debug!(tenant, key_id = %key_id, "Rejected token signed by expired key");
            return Err(Error::invalid_argument("token signed by an expired key"));
        }

        let mut validation = Validation::new(key.algorithm);
        validation.validate_aud = false;
        validation.validate_exp = !options.allow_expired;
        validation.leeway = options.leeway.as_secs();
        if let Some(issuer) = &options.issuer {
            validation.set_issuer(&[issuer]);
        }
        let data = jsonwebtoken::decode::<T>(token, &key.decoding_key()?, &validation)?;
        Ok(data.claims)
    }
}

/// Read claims without verifying anything. Only for picking the key that
/// will verify the token.
pub fn peek_claims<T: DeserializeOwned>(token: &str) -> Result<T> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::invalid_argument("malformed JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|_| Error::invalid_argument("malformed JWT payload"))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// `kid` of a JWT.
pub fn key_id(token: &str) -> Result<String> {
    jsonwebtoken::decode_header(token)?
        .kid
        .ok_or_else(|| Error::invalid_argument("JWT is missing the kid header"))
}

/// Claims of a client or user assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    /// Issuer (client id or user id)
    pub iss: String,
    /// Subject, must equal `iss`
    pub sub: String,
    /// Audience, must contain our issuer
    #[serde(default, deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    /// Expiry
    pub exp: i64,
    /// Issued at
    pub iat: i64,
}

/// Limits for assertions.
#[derive(Debug, Clone)]
pub struct AssertionRules {
    /// Our issuer, expected in `aud`
    pub audience: String,
    /// Maximum `exp - iat`
    pub max_lifetime: Duration,
    /// Allowed clock skew
    pub leeway: Duration,
}

/// Verify an assertion against an EC P-256 public key in SPKI PEM form.
pub fn verify_assertion(token: &str, public_key_pem: &str, rules: &AssertionRules) -> Result<AssertionClaims> {
    let key = DecodingKey::from_ec_pem(public_key_pem.as_bytes())?;
    let mut validation = Validation::new(Algorithm::ES256);
    validation.validate_aud = false;
    validation.leeway = rules.leeway.as_secs();
    validation.set_required_spec_claims(&["exp", "iat", "iss", "sub"]);
    let claims = jsonwebtoken::decode::<AssertionClaims>(token, &key, &validation)?.claims;

    if claims.iss != claims.sub {
        return Err(Error::invalid_argument("assertion issuer must equal its subject"));
    }
    if !claims.aud.iter().any(|a| *a == rules.audience) {
        return Err(Error::invalid_argument("assertion audience does not contain the issuer"));
    }
    let leeway = i64::try_from(rules.leeway.as_secs()).unwrap_or(i64::MAX);
    let max_lifetime = i64::try_from(rules.max_lifetime.as_secs()).unwrap_or(i64::MAX);
    if claims.iat > Utc::now().timestamp() + leeway {
        return Err(Error::invalid_argument("assertion issued in the future"));
    }
    if claims.exp - claims.iat > max_lifetime {
        return Err(Error::invalid_argument("assertion validity window too long"));
    }
    Ok(claims)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::InMemoryStore;

    /// A user/client key pair for signing assertions in tests.
    pub(crate) struct TestKey {
        pub(crate) id: String,
        pub(crate) private_pem: String,
        pub(crate) public_pem: String,
    }

    impl TestKey {
        pub(crate) fn generate() -> Self {
            let pair = rcgen::KeyPair::generate().unwrap();
            Self {
                id: uuid::Uuid::new_v4().to_string(),
                private_pem: pair.serialize_pem(),
                public_pem: pair.public_key_pem(),
            }
        }

        pub(crate) fn sign(&self, claims: &serde_json::Value) -> String {
            let mut header = jsonwebtoken::Header::new(Algorithm::ES256);
            header.kid = Some(self.id.clone());
            let key = jsonwebtoken::EncodingKey::from_ec_pem(self.private_pem.as_bytes()).unwrap();
            jsonwebtoken::encode(&header, claims, &key).unwrap()
        }
    }

    fn rules() -> AssertionRules {
        AssertionRules {
            audience: "https://issuer.example".into(),
            max_lifetime: Duration::from_secs(3600),
            leeway: Duration::from_secs(5),
        }
    }

    fn assertion(iss: &str, sub: &str, lifetime: i64) -> serde_json::Value {
        let now = Utc::now().timestamp();
        serde_json::json!({
            "iss": iss, "sub": sub, "aud": ["https://issuer.example"],
            "iat": now, "exp": now + lifetime,
        })
    }

    #[test]
    fn valid_assertion_is_accepted() {
        let key = TestKey::generate();
        let jwt = key.sign(&assertion("u1", "u1", 600));
        let claims = verify_assertion(&jwt, &key.public_pem, &rules()).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(key_id(&jwt).unwrap(), key.id);
        let peeked: AssertionClaims = peek_claims(&jwt).unwrap();
        assert_eq!(peeked.iss, "u1");
    }

    #[test]
    fn assertion_rules_are_enforced() {
        let key = TestKey::generate();
        // iss != sub
        let jwt = key.sign(&assertion("u1", "u2", 600));
        assert!(verify_assertion(&jwt, &key.public_pem, &rules()).is_err());
        // longer than an hour
        let jwt = key.sign(&assertion("u1", "u1", 7200));
        assert!(verify_assertion(&jwt, &key.public_pem, &rules()).is_err());
        // wrong audience
        let mut claims = assertion("u1", "u1", 600);
        claims["aud"] = serde_json::json!("https://other.example");
        assert!(verify_assertion(&key.sign(&claims), &key.public_pem, &rules()).is_err());
        // issued in the future
        let mut claims = assertion("u1", "u1", 600);
        claims["iat"] = serde_json::json!(Utc::now().timestamp() + 60);
        assert!(verify_assertion(&key.sign(&claims), &key.public_pem, &rules()).is_err());
    }

    #[test]
    fn foreign_key_fails_signature() {
        let key = TestKey::generate();
        let other = TestKey::generate();
        let jwt = key.sign(&assertion("u1", "u1", 600));
        assert!(verify_assertion(&jwt, &other.public_pem, &rules()).is_err());
    }

    async fn signed_by_store_key(expiry: chrono::DateTime<Utc>) -> (Arc<InMemoryStore>, String) {
        let store = Arc::new(InMemoryStore::default());
        let key_id = store.insert_key_pair("t1", expiry).unwrap();
        let signer = store.private_key("t1", &key_id).unwrap().signing_key().unwrap();
        let jwt = signer
            .sign(&serde_json::json!({
                "iss": "https://issuer.example",
                "sub": "u1",
                "exp": Utc::now().timestamp() + 60,
            }))
            .unwrap();
        (store, jwt)
    }

    #[tokio::test]
    async fn verifies_tokens_through_cache() {
        let (store, jwt) = signed_by_store_key(Utc::now() + chrono::Duration::hours(1)).await;
        let verifier = JwtVerifier::new(Arc::new(PublicKeyCache::new(store, Duration::from_secs(60))));
        let options = VerifyOptions {
            issuer: Some("https://issuer.example".into()),
            ..VerifyOptions::default()
        };
        let claims: serde_json::Value = verifier.verify("t1", &jwt, &options).await.unwrap();
        assert_eq!(claims["sub"], "u1");

        let wrong_issuer = VerifyOptions {
            issuer: Some("https://other.example".into()),
            ..VerifyOptions::default()
        };
        assert!(verifier.verify::<serde_json::Value>("t1", &jwt, &wrong_issuer).await.is_err());
    }

    #[tokio::test]
    async fn expired_key_rejected_only_in_strict_mode() {
        // GIVEN: a token signed by a key that has already expired
        let (store, jwt) = signed_by_store_key(Utc::now() - chrono::Duration::minutes(1)).await;
        let verifier = JwtVerifier::new(Arc::new(PublicKeyCache::new(store, Duration::from_secs(60))));

        // WHEN / THEN: lenient mode accepts, strict mode rejects
        let lenient = VerifyOptions::default();
        assert!(verifier.verify::<serde_json::Value>("t1", &jwt, &lenient).await.is_ok());
        let strict = VerifyOptions {
            reject_expired_key: true,
            ..VerifyOptions::default()
        };
        assert!(verifier.verify::<serde_json::Value>("t1", &jwt, &strict).await.is_err());
    }
}
