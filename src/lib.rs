//! tokenforge
//!
//! The token issuance core of an OAuth2 / OpenID Connect identity provider.
//!
//! # Features
//!
//! - **Grants**: authorization code (legacy and V2 requests, PKCE),
//!   client credentials, JWT profile, device code, refresh token rotation
//! - **Token exchange**: RFC 8693 exchange and impersonation with `act` chains
//! - **Introspection**: RFC 7662, client authentication and token checks run
//!   concurrently
//! - **Minting**: JWT or opaque access tokens, ID tokens with `at_hash`
//! - **Key management**: per-tenant signing key rotation behind a
//!   fleet-wide lock, public key cache with idle eviction
//!
//! Persistence, user lookup and permission checks are collaborators behind
//! traits in [`storage`]; [`storage::InMemoryStore`] backs all of them for
//! the bundled server and the tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod cli;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod grant;
pub mod introspection;
pub mod join;
pub mod keys;
pub mod provider;
pub mod storage;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    }
    .map_err(|e| Error::Config(format!("tracing already initialized: {e}")))
}
