//! Configuration management
//!
//! Layered with figment: an optional YAML file, then `TOKENFORGE_`-prefixed
//! environment variables (`__` separates nesting levels, e.g.
//! `TOKENFORGE_KEYS__CHECK_INTERVAL=5s`).

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::domain::{
    AccessTokenType, AmrPolicy, AmrRule, AuthMethodType, Client, ClientAuthMethod, GrantType,
    RegisteredKey,
};
use crate::grant::GrantSettings;
use crate::grant::client_auth::secret_digest;
use crate::keys::{self, rotator::RotationSettings};
use crate::storage::{InMemoryStore, Org, TenantSettings, User};
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server
    pub server: ServerConfig,
    /// Issuer, lifetimes and assertion limits
    pub oidc: OidcConfig,
    /// Signing keys and the public key cache
    pub keys: KeysConfig,
    /// Per-tenant feature switches
    pub features: FeaturesConfig,
    /// `amr` policy table overrides
    pub amr: AmrConfig,
    /// Entities loaded into the in-memory stores, keyed by tenant
    pub seed: HashMap<String, TenantSeed>,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed or
    /// fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("TOKENFORGE_").split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would only fail later at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.oidc.issuer.is_empty() {
            return Err(Error::Config("oidc.issuer must not be empty".into()));
        }
        if self.oidc.default_tenant.is_empty() {
            return Err(Error::Config("oidc.default_tenant must not be empty".into()));
        }
        keys::parse_algorithm(&self.keys.algorithm)?;
        if self.oidc.reap_interval.is_zero() {
            return Err(Error::Config("oidc.reap_interval must be positive".into()));
        }
        if self.keys.check_interval.is_zero() {
            return Err(Error::Config("keys.check_interval must be positive".into()));
        }
        if self.keys.graceful_window >= self.keys.key_lifetime {
            return Err(Error::Config(
                "keys.graceful_window must be shorter than keys.key_lifetime".into(),
            ));
        }
        if self.keys.max_check_interval < self.keys.check_interval {
            return Err(Error::Config(
                "keys.max_check_interval must not be shorter than keys.check_interval".into(),
            ));
        }
        for (tenant, seed) in &self.seed {
            for client in &seed.clients {
                client.to_client(&self.oidc).map_err(|e| {
                    Error::Config(format!("seed.{tenant}.clients.{}: {e}", client.id))
                })?;
            }
        }
        Ok(())
    }

    /// Rotation timing derived from the key settings.
    pub fn rotation_settings(&self) -> Result<RotationSettings> {
        Ok(RotationSettings {
            algorithm: keys::parse_algorithm(&self.keys.algorithm)?,
            graceful_window: self.keys.graceful_window,
            check_interval: self.keys.check_interval,
            max_check_interval: self.keys.max_check_interval,
            lock_duration: self.keys.check_interval * 2,
        })
    }

    /// Grant handler tunables.
    #[must_use]
    pub fn grant_settings(&self) -> GrantSettings {
        GrantSettings {
            assertion_max_lifetime: self.oidc.assertion_max_lifetime,
            assertion_leeway: self.oidc.assertion_leeway,
            device_poll_deadline: self.oidc.device_poll_deadline,
            default_access_token_lifetime: self.oidc.access_token_lifetime,
            default_id_token_lifetime: self.oidc.id_token_lifetime,
            default_refresh_token_lifetime: self.oidc.refresh_token_lifetime,
        }
    }

    /// Load the seed section and feature switches into `store`.
    pub fn apply_seed(&self, store: &InMemoryStore) -> Result<()> {
        store.set_default_settings(self.features.default_settings());
        for (tenant, settings) in &self.features.tenants {
            store.set_tenant_settings(tenant, *settings);
        }
        for (tenant, seed) in &self.seed {
            for org in &seed.orgs {
                store.insert_org(tenant, org.clone());
            }
            for user in &seed.users {
                store.insert_user(tenant, user.clone());
            }
            for client in &seed.clients {
                store.insert_client(tenant, client.to_client(&self.oidc)?);
            }
            tracing::info!(
                tenant = %tenant,
                clients = seed.clients.len(),
                users = seed.users.len(),
                orgs = seed.orgs.len(),
                "Seeded tenant"
            );
        }
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Issuer and token settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OidcConfig {
    /// Issuer URL; `{tenant}` is replaced by the request's tenant
    pub issuer: String,
    /// Tenant used when a request names none
    pub default_tenant: String,
    /// Default access token lifetime
    #[serde(with = "humantime_serde")]
    pub access_token_lifetime: Duration,
    /// Default ID token lifetime
    #[serde(with = "humantime_serde")]
    pub id_token_lifetime: Duration,
    /// Default refresh token lifetime
    #[serde(with = "humantime_serde")]
    pub refresh_token_lifetime: Duration,
    /// Deadline for one device authorization lookup
    #[serde(with = "humantime_serde")]
    pub device_poll_deadline: Duration,
    /// Maximum validity window of client and user assertions
    #[serde(with = "humantime_serde")]
    pub assertion_max_lifetime: Duration,
    /// Allowed assertion clock skew
    #[serde(with = "humantime_serde")]
    pub assertion_leeway: Duration,
    /// How often expired sessions and requests are removed
    #[serde(with = "humantime_serde")]
    pub reap_interval: Duration,
    /// HMAC key of opaque access tokens.
    /// Supports: literal value, `env:VAR_NAME`, or `auto` (random per process)
    pub opaque_token_secret: String,
}

impl Default for OidcConfig {
    fn default() -> Self {
        Self {
            issuer: "http://localhost:8080/{tenant}".to_string(),
            default_tenant: "default".to_string(),
            access_token_lifetime: Duration::from_secs(12 * 3600),
            id_token_lifetime: Duration::from_secs(12 * 3600),
            refresh_token_lifetime: Duration::from_secs(30 * 24 * 3600),
            device_poll_deadline: Duration::from_secs(5),
            assertion_max_lifetime: Duration::from_secs(3600),
            assertion_leeway: Duration::from_secs(5),
            reap_interval: Duration::from_secs(60),
            opaque_token_secret: "auto".to_string(),
        }
    }
}

impl OidcConfig {
    /// Issuer of `tenant`.
    #[must_use]
    pub fn issuer_for(&self, tenant: &str) -> String {
        self.issuer.replace("{tenant}", tenant)
    }

    /// Resolve the opaque token secret (expand `env:`, generate if `auto`)
    #[must_use]
    pub fn resolve_opaque_token_secret(&self) -> Vec<u8> {
        if self.opaque_token_secret == "auto" {
            use rand::RngExt;
            tracing::warn!("Opaque token secret is 'auto'; tokens will not survive a restart");
            let random_bytes: [u8; 32] = rand::rng().random();
            random_bytes.to_vec()
        } else {
            resolve_secret(&self.opaque_token_secret).into_bytes()
        }
    }
}

/// Expand `env:VAR_NAME` references; other values are literal.
fn resolve_secret(value: &str) -> String {
    match value.strip_prefix("env:") {
        Some(var_name) => env::var(var_name).unwrap_or_else(|_| value.to_string()),
        None => value.to_string(),
    }
}

/// Signing key and public key cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Signing algorithm of generated keys
    pub algorithm: String,
    /// Lifetime of generated keys
    #[serde(with = "humantime_serde")]
    pub key_lifetime: Duration,
    /// Rotation check interval
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Keys expiring within this window are retired from signing
    #[serde(with = "humantime_serde")]
    pub graceful_window: Duration,
    /// Upper bound of the rotation check interval
    #[serde(with = "humantime_serde")]
    pub max_check_interval: Duration,
    /// Idle time after which cached public keys are evicted
    #[serde(with = "humantime_serde")]
    pub cache_idle_ttl: Duration,
    /// How often the cache is purged
    #[serde(with = "humantime_serde")]
    pub cache_purge_interval: Duration,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            algorithm: "ES256".to_string(),
            key_lifetime: Duration::from_secs(6 * 3600),
            check_interval: Duration::from_secs(10),
            graceful_window: Duration::from_secs(600),
            max_check_interval: Duration::from_secs(300),
            cache_idle_ttl: Duration::from_secs(600),
            cache_purge_interval: Duration::from_secs(60),
        }
    }
}

/// Feature switches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Token exchange grant
    pub token_exchange: bool,
    /// Impersonation through token exchange
    pub impersonation: bool,
    /// Echo internal error causes in error descriptions
    pub debug_parent_error: bool,
    /// Per-tenant overrides
    pub tenants: HashMap<String, TenantSettings>,
}

impl FeaturesConfig {
    /// Settings of tenants without an override.
    #[must_use]
    pub fn default_settings(&self) -> TenantSettings {
        TenantSettings {
            token_exchange_enabled: self.token_exchange,
            impersonation_enabled: self.impersonation,
            debug_parent_error: self.debug_parent_error,
        }
    }
}

/// `amr` policy overrides
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AmrConfig {
    /// Factors needed for `mfa`
    pub mfa_threshold: u8,
    /// Rules replacing the stock ones, keyed by method
    pub rules: HashMap<AuthMethodType, AmrRule>,
}

impl Default for AmrConfig {
    fn default() -> Self {
        Self {
            mfa_threshold: 2,
            rules: HashMap::new(),
        }
    }
}

impl AmrConfig {
    /// The effective policy.
    #[must_use]
    pub fn policy(&self) -> AmrPolicy {
        AmrPolicy::with_overrides(self.rules.clone(), self.mfa_threshold)
    }
}

/// Entities of one tenant
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantSeed {
    /// Clients
    pub clients: Vec<ClientSeed>,
    /// Users
    pub users: Vec<User>,
    /// Organizations
    pub orgs: Vec<Org>,
}

/// A client as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSeed {
    /// Client id
    pub id: String,
    /// Project
    pub project_id: String,
    /// Owning organization
    pub resource_owner: String,
    /// Authentication method
    pub auth_method: ClientAuthMethod,
    /// Client secret (supports `env:VAR_NAME`); stored as a digest
    pub secret: Option<String>,
    /// Keys for `private_key_jwt`
    pub keys: Vec<RegisteredKey>,
    /// Allowed grant types
    pub grant_types: Vec<GrantType>,
    /// Redirect URIs
    pub redirect_uris: Vec<String>,
    /// Access token format
    pub access_token_type: AccessTokenType,
    /// Access token lifetime, instance default when absent
    #[serde(with = "humantime_serde::option")]
    pub access_token_lifetime: Option<Duration>,
    /// ID token lifetime, instance default when absent
    #[serde(with = "humantime_serde::option")]
    pub id_token_lifetime: Option<Duration>,
    /// Refresh token lifetime, instance default when absent
    #[serde(with = "humantime_serde::option")]
    pub refresh_token_lifetime: Option<Duration>,
    /// Added to ID token expiry
    #[serde(with = "humantime_serde")]
    pub clock_skew: Duration,
    /// Custom scopes
    pub allowed_scopes: Vec<String>,
    /// Roles in access tokens
    pub access_token_role_assertion: bool,
    /// Roles in ID tokens
    pub id_token_role_assertion: bool,
    /// Userinfo in ID tokens
    pub id_token_userinfo_assertion: bool,
    /// Service user for `client_credentials`
    pub service_user: Option<String>,
}

impl Default for ClientSeed {
    fn default() -> Self {
        Self {
            id: String::new(),
            project_id: String::new(),
            resource_owner: String::new(),
            auth_method: ClientAuthMethod::Basic,
            secret: None,
            keys: Vec::new(),
            grant_types: vec![GrantType::AuthorizationCode, GrantType::RefreshToken],
            redirect_uris: Vec::new(),
            access_token_type: AccessTokenType::Bearer,
            access_token_lifetime: None,
            id_token_lifetime: None,
            refresh_token_lifetime: None,
            clock_skew: Duration::ZERO,
            allowed_scopes: Vec::new(),
            access_token_role_assertion: false,
            id_token_role_assertion: false,
            id_token_userinfo_assertion: false,
            service_user: None,
        }
    }
}

impl ClientSeed {
    /// Registry entry for this client.
    pub fn to_client(&self, defaults: &OidcConfig) -> Result<Client> {
        if self.id.is_empty() {
            return Err(Error::Config("client id must not be empty".into()));
        }
        let secret_digest = self
            .secret
            .as_deref()
            .map(|s| secret_digest(&resolve_secret(s)));
        if matches!(self.auth_method, ClientAuthMethod::Basic | ClientAuthMethod::Post)
            && secret_digest.is_none()
        {
            return Err(Error::Config(format!(
                "client {} uses {:?} but has no secret",
                self.id, self.auth_method
            )));
        }
        Ok(Client {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            resource_owner: self.resource_owner.clone(),
            auth_method: self.auth_method,
            secret_digest,
            keys: self.keys.clone(),
            grant_types: self.grant_types.clone(),
            redirect_uris: self.redirect_uris.clone(),
            access_token_type: self.access_token_type,
            access_token_lifetime: self
                .access_token_lifetime
                .unwrap_or(defaults.access_token_lifetime),
            id_token_lifetime: self.id_token_lifetime.unwrap_or(defaults.id_token_lifetime),
            refresh_token_lifetime: self
                .refresh_token_lifetime
                .unwrap_or(defaults.refresh_token_lifetime),
            clock_skew: self.clock_skew,
            allowed_scopes: self.allowed_scopes.clone(),
            access_token_role_assertion: self.access_token_role_assertion,
            id_token_role_assertion: self.id_token_role_assertion,
            id_token_userinfo_assertion: self.id_token_userinfo_assertion,
            service_user: self.service_user.clone(),
        })
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Parse "100ms", "30s", "5m", "12h", "30d"; bare numbers are seconds.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
            Some(idx) => s.split_at(idx),
            None => (s, "s"),
        };
        let value: u64 = digits
            .parse()
            .map_err(|e| format!("invalid duration {s:?}: {e}"))?;
        let secs = match unit {
            "ms" => return Ok(Duration::from_millis(value)),
            "s" => value,
            "m" => value * 60,
            "h" => value * 3600,
            "d" => value * 86_400,
            other => return Err(format!("invalid duration unit {other:?} in {s:?}")),
        };
        Ok(Duration::from_secs(secs))
    }

    fn format(duration: &Duration) -> String {
        if duration.subsec_millis() != 0 {
            format!("{}ms", duration.as_millis())
        } else {
            format!("{}s", duration.as_secs())
        }
    }

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format(duration))
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    /// Same format for `Option<Duration>`.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        /// Serialize `Some` as a duration string, `None` as unit.
        ///
        /// # Errors
        ///
        /// Returns a serialization error if the serializer fails.
        pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match duration {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        /// Deserialize an optional duration string.
        ///
        /// # Errors
        ///
        /// Returns a deserialization error if the string cannot be parsed as a duration.
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<String>::deserialize(deserializer)?
                .map(|s| super::parse(&s).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_duration_units() {
        assert_eq!(humantime_serde::parse("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(humantime_serde::parse("30d").unwrap(), Duration::from_secs(2_592_000));
        assert_eq!(humantime_serde::parse("42").unwrap(), Duration::from_secs(42));
        assert!(humantime_serde::parse("5w").is_err());
        assert!(humantime_serde::parse("abc").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        let rotation = config.rotation_settings().unwrap();
        assert_eq!(rotation.lock_duration, Duration::from_secs(20));
        assert_eq!(config.oidc.issuer_for("acme"), "http://localhost:8080/acme");
    }

    #[test]
    fn test_load_from_yaml_file() {
        // GIVEN: a config file with keys, features and one seeded client
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenforge.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(
            f,
            r#"
server:
  port: 9090
oidc:
  issuer: "https://{{tenant}}.auth.example"
keys:
  check_interval: 5s
  graceful_window: 2m
features:
  token_exchange: true
  tenants:
    locked:
      token_exchange_enabled: false
amr:
  rules:
    idp:
      value: fed
      factors: 1
seed:
  acme:
    clients:
      - id: backend
        project_id: p1
        secret: s3cret
        grant_types: [client_credentials]
        access_token_lifetime: 5m
"#
        )
        .unwrap();
        drop(f);

        // WHEN: loaded
        let config = Config::load(Some(&path)).unwrap();

        // THEN: values are merged over the defaults
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.oidc.issuer_for("acme"), "https://acme.auth.example");
        assert_eq!(config.keys.check_interval, Duration::from_secs(5));
        assert!(config.features.default_settings().token_exchange_enabled);
        assert!(!config.features.tenants["locked"].token_exchange_enabled);
        assert_eq!(config.amr.policy().amr(&[AuthMethodType::Idp]), vec!["fed"]);
        let client = config.seed["acme"].clients[0].to_client(&config.oidc).unwrap();
        assert_eq!(client.access_token_lifetime, Duration::from_secs(300));
        assert_eq!(client.id_token_lifetime, config.oidc.id_token_lifetime);
        assert_eq!(client.secret_digest, Some(secret_digest("s3cret")));
    }

    #[test]
    fn test_auto_opaque_secret_is_random() {
        let oidc = OidcConfig::default();
        let first = oidc.resolve_opaque_token_secret();
        assert_eq!(first.len(), 32);
        assert_ne!(first, oidc.resolve_opaque_token_secret());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(Config::load(Some(Path::new("/nonexistent/tokenforge.yaml"))).is_err());
    }

    #[test]
    fn test_invalid_windows_are_rejected() {
        let mut config = Config::default();
        config.keys.graceful_window = config.keys.key_lifetime;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.keys.algorithm = "RS256".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.oidc.reap_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_confidential_seed_client_needs_secret() {
        let seed = ClientSeed {
            id: "app".into(),
            ..ClientSeed::default()
        };
        assert!(seed.to_client(&OidcConfig::default()).is_err());
        let seed = ClientSeed {
            id: "spa".into(),
            auth_method: ClientAuthMethod::None,
            ..ClientSeed::default()
        };
        assert!(seed.to_client(&OidcConfig::default()).unwrap().is_public());
    }
}
