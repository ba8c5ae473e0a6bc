//! Signing and verification key material.
//!
//! Keys are ECDSA P-256 (`ES256`). Private keys travel as PKCS#8 PEM (that is
//! what the key storage holds); public keys as the affine `x`/`y` coordinates,
//! base64url encoded, which is both what [`jsonwebtoken::DecodingKey`] needs
//! and what the JWKS endpoint renders.
//!
//! - [`cache`]: per-tenant public key cache with idle eviction
//! - [`rotator`]: per-tenant signing key rotation under a distributed lock
//! - [`verifier`]: JWT verification against cached public keys

pub mod cache;
pub mod rotator;
pub mod verifier;

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use jsonwebtoken::jwk::{
    AlgorithmParameters, CommonParameters, EllipticCurve, EllipticCurveKeyParameters,
    EllipticCurveKeyType, Jwk, JwkSet, KeyAlgorithm, PublicKeyUse,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header};
use serde::Serialize;

use crate::{Error, Result};

/// A private signing key as returned by key storage.
#[derive(Clone)]
pub struct PrivateKey {
    /// Key id (`kid`)
    pub id: String,
    /// Signature algorithm
    pub algorithm: Algorithm,
    /// PKCS#8 PEM
    pub pem: String,
    /// Monotonic per-tenant creation sequence
    pub sequence: u64,
    /// Expiry
    pub expiry: DateTime<Utc>,
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrivateKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("sequence", &self.sequence)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl PrivateKey {
    /// Parse the PEM into a ready-to-use signer.
    pub fn signing_key(&self) -> Result<SigningKey> {
        let encoding_key = EncodingKey::from_ec_pem(self.pem.as_bytes())?;
        Ok(SigningKey {
            id: self.id.clone(),
            algorithm: self.algorithm,
            sequence: self.sequence,
            expiry: self.expiry,
            encoding_key,
        })
    }
}

/// The key the minting component signs with.
#[derive(Clone)]
pub struct SigningKey {
    /// Key id
    pub id: String,
    /// Signature algorithm
    pub algorithm: Algorithm,
    /// Creation sequence, strictly increasing across pushes
    pub sequence: u64,
    /// Expiry
    pub expiry: DateTime<Utc>,
    encoding_key: EncodingKey,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("id", &self.id)
            .field("algorithm", &self.algorithm)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl SigningKey {
    /// Sign claims as a compact JWT with `kid` set.
    pub fn sign<T: Serialize>(&self, claims: &T) -> Result<String> {
        let mut header = Header::new(self.algorithm);
        header.kid = Some(self.id.clone());
        Ok(jsonwebtoken::encode(&header, claims, &self.encoding_key)?)
    }
}

/// A public verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    /// Key id
    pub id: String,
    /// Signature algorithm
    pub algorithm: Algorithm,
    /// Base64url affine x coordinate
    pub x: String,
    /// Base64url affine y coordinate
    pub y: String,
    /// Expiry
    pub expiry: DateTime<Utc>,
}

impl PublicKey {
    /// Verification key for `jsonwebtoken`.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        Ok(DecodingKey::from_ec_components(&self.x, &self.y)?)
    }

    /// Whether the key itself has expired at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }

    /// Render as a JWK.
    #[must_use]
    pub fn to_jwk(&self) -> Jwk {
        Jwk {
            common: CommonParameters {
                public_key_use: Some(PublicKeyUse::Signature),
                key_algorithm: Some(KeyAlgorithm::ES256),
                key_id: Some(self.id.clone()),
                ..CommonParameters::default()
            },
            algorithm: AlgorithmParameters::EllipticCurve(EllipticCurveKeyParameters {
                key_type: EllipticCurveKeyType::EC,
                curve: EllipticCurve::P256,
                x: self.x.clone(),
                y: self.y.clone(),
            }),
        }
    }
}

/// Render a set of public keys as a JWKS document.
#[must_use]
pub fn jwk_set(keys: &[PublicKey]) -> JwkSet {
    JwkSet {
        keys: keys.iter().map(PublicKey::to_jwk).collect(),
    }
}

/// Freshly generated key material, before storage assigns a sequence.
#[derive(Clone)]
pub struct KeyMaterial {
    /// New key id
    pub id: String,
    /// PKCS#8 PEM of the private key
    pub pem: String,
    /// Base64url x coordinate
    pub x: String,
    /// Base64url y coordinate
    pub y: String,
}

/// Parse a configured algorithm name. Only `ES256` is supported.
pub fn parse_algorithm(name: &str) -> Result<Algorithm> {
    match name {
        "ES256" => Ok(Algorithm::ES256),
        other => Err(Error::Config(format!(
            "unsupported signing algorithm {other:?} (supported: ES256)"
        ))),
    }
}

/// Generate a new key pair for `algorithm`.
pub fn generate_key_pair(algorithm: Algorithm) -> Result<KeyMaterial> {
    if algorithm != Algorithm::ES256 {
        return Err(Error::invalid_argument(format!(
            "cannot generate {algorithm:?} keys"
        )));
    }
    let pair = rcgen::KeyPair::generate()
        .map_err(|e| Error::internal(format!("key generation failed: {e}")))?;
    // Uncompressed SEC1 point: 0x04 || x || y
    let raw = pair.public_key_raw();
    if raw.len() != 65 || raw[0] != 0x04 {
        return Err(Error::internal("unexpected public key encoding"));
    }
    Ok(KeyMaterial {
        id: uuid::Uuid::new_v4().to_string(),
        pem: pair.serialize_pem(),
        x: URL_SAFE_NO_PAD.encode(&raw[1..33]),
        y: URL_SAFE_NO_PAD.encode(&raw[33..65]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jsonwebtoken::Validation;

    fn key_pair() -> (PrivateKey, PublicKey) {
        let material = generate_key_pair(Algorithm::ES256).unwrap();
        let expiry = Utc::now() + Duration::hours(1);
        (
            PrivateKey {
                id: material.id.clone(),
                algorithm: Algorithm::ES256,
                pem: material.pem,
                sequence: 1,
                expiry,
            },
            PublicKey {
                id: material.id,
                algorithm: Algorithm::ES256,
                x: material.x,
                y: material.y,
                expiry,
            },
        )
    }

    #[test]
    fn generated_pair_signs_and_verifies() {
        // GIVEN: a fresh ES256 key pair
        let (private, public) = key_pair();
        let signer = private.signing_key().unwrap();

        // WHEN: signing claims
        let claims = serde_json::json!({"sub": "u1", "exp": Utc::now().timestamp() + 60});
        let jwt = signer.sign(&claims).unwrap();

        // THEN: the header carries the kid and the public key verifies it
        let header = jsonwebtoken::decode_header(&jwt).unwrap();
        assert_eq!(header.kid.as_deref(), Some(public.id.as_str()));
        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_aud = false;
        let data = jsonwebtoken::decode::<serde_json::Value>(
            &jwt,
            &public.decoding_key().unwrap(),
            &validation,
        )
        .unwrap();
        assert_eq!(data.claims["sub"], "u1");
    }

    #[test]
    fn jwk_renders_ec_parameters() {
        let (_, public) = key_pair();
        let jwk = serde_json::to_value(public.to_jwk()).unwrap();
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
        assert_eq!(jwk["kid"], public.id.as_str());
        assert_eq!(jwk["use"], "sig");
    }

    #[test]
    fn only_es256_is_supported() {
        assert!(parse_algorithm("ES256").is_ok());
        assert!(parse_algorithm("RS256").is_err());
        assert!(generate_key_pair(Algorithm::HS256).is_err());
    }
}
