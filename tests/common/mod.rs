//! Shared fixtures for the integration tests.
//!
//! One tenant (`acme`) with an organization, three users and a client per
//! grant flow, all held by an [`InMemoryStore`] behind a [`Provider`].

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::json;

use tokenforge::config::{ClientSeed, Config};
use tokenforge::domain::{AccessTokenType, AuthMethodType, ClientAuthMethod, GrantType, RegisteredKey};
use tokenforge::error::OAuthError;
use tokenforge::grant::{ClientCredentials, TokenRequest};
use tokenforge::introspection::IntrospectionResponse;
use tokenforge::provider::{Collaborators, Provider};
use tokenforge::storage::{
    AuthRequest, CodeChallenge, CodeChallengeMethod, InMemoryLock, InMemoryStore, Org, TenantSettings,
    User,
};
use tokenforge::token::TokenResponse;

pub const TENANT: &str = "acme";
pub const ORG: &str = "org1";
pub const SECRET: &str = "s3cret";
pub const REDIRECT: &str = "https://web.example/cb";
pub const ISSUER: &str = "http://localhost:8080/acme";

pub const TOKEN_EXCHANGE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
pub const ACCESS_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:access_token";
pub const ID_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";
pub const JWT_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
pub const USER_ID_TYPE: &str = "urn:tokenforge:params:oauth:token-type:user_id";

pub struct Fixture {
    pub config: Config,
    pub store: Arc<InMemoryStore>,
    pub lock: Arc<InMemoryLock>,
    pub provider: Provider,
}

impl Fixture {
    /// Token exchange and impersonation enabled.
    pub fn new() -> Self {
        Self::with_settings(TenantSettings {
            token_exchange_enabled: true,
            impersonation_enabled: true,
            debug_parent_error: false,
        })
    }

    pub fn with_settings(settings: TenantSettings) -> Self {
        let mut config = Config::default();
        config.oidc.opaque_token_secret = "integration-test-secret".into();
        let store = Arc::new(InMemoryStore::default());
        let lock = Arc::new(InMemoryLock::new());
        store.set_default_settings(settings);
        store.insert_org(
            TENANT,
            Org {
                id: ORG.into(),
                name: "Acme".into(),
                primary_domain: "acme.example".into(),
            },
        );
        store.insert_user(TENANT, user("alice", &[]));
        store.insert_user(TENANT, user("svc-user", &[]));
        store.insert_user(TENANT, user("admin-user", &["impersonation"]));

        let fixture = Self {
            provider: Provider::new(
                config.clone(),
                Collaborators::in_memory(Arc::clone(&store), Arc::clone(&lock)),
            )
            .unwrap(),
            config,
            store,
            lock,
        };
        fixture.add_client(ClientSeed {
            id: "web".into(),
            project_id: "proj-web".into(),
            resource_owner: ORG.into(),
            secret: Some(SECRET.into()),
            grant_types: vec![
                GrantType::AuthorizationCode,
                GrantType::RefreshToken,
                GrantType::TokenExchange,
            ],
            redirect_uris: vec![REDIRECT.into()],
            access_token_type: AccessTokenType::Jwt,
            ..ClientSeed::default()
        });
        fixture.add_client(ClientSeed {
            id: "spa".into(),
            project_id: "proj-web".into(),
            resource_owner: ORG.into(),
            auth_method: ClientAuthMethod::None,
            redirect_uris: vec![REDIRECT.into()],
            ..ClientSeed::default()
        });
        fixture.add_client(ClientSeed {
            id: "tv".into(),
            project_id: "proj-tv".into(),
            resource_owner: ORG.into(),
            auth_method: ClientAuthMethod::None,
            grant_types: vec![GrantType::DeviceCode, GrantType::RefreshToken],
            ..ClientSeed::default()
        });
        fixture.add_client(ClientSeed {
            id: "svc".into(),
            project_id: "proj-svc".into(),
            resource_owner: ORG.into(),
            secret: Some(SECRET.into()),
            grant_types: vec![GrantType::ClientCredentials, GrantType::TokenExchange],
            service_user: Some("svc-user".into()),
            ..ClientSeed::default()
        });
        fixture.add_client(ClientSeed {
            id: "admin".into(),
            project_id: "proj-admin".into(),
            resource_owner: ORG.into(),
            secret: Some(SECRET.into()),
            grant_types: vec![GrantType::ClientCredentials, GrantType::TokenExchange],
            service_user: Some("admin-user".into()),
            ..ClientSeed::default()
        });
        fixture
    }

    pub fn add_client(&self, seed: ClientSeed) {
        self.store
            .insert_client(TENANT, seed.to_client(&self.config.oidc).unwrap());
    }

    /// Run a token request with form parameters.
    pub async fn token(&self, params: &[(&str, &str)]) -> Result<TokenResponse, OAuthError> {
        let request = TokenRequest::from_form(&form(params))
            .map_err(|e| OAuthError::from_error(e, false))?;
        self.provider.token(TENANT, request).await
    }

    /// Client credentials token for `client_id` with `scope`.
    pub async fn client_token(&self, client_id: &str, scope: &str) -> TokenResponse {
        self.token(&[
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", SECRET),
            ("scope", scope),
        ])
        .await
        .unwrap()
    }

    pub async fn introspect(
        &self,
        token: &str,
        client_id: &str,
        secret: &str,
    ) -> Result<IntrospectionResponse, OAuthError> {
        let creds = ClientCredentials {
            client_id: Some(client_id.into()),
            client_secret: Some(secret.into()),
            ..ClientCredentials::default()
        };
        self.provider.introspect(TENANT, token, &creds).await
    }

    /// Store a completed authorization request for `client_id`.
    pub fn auth_request(&self, code: &str, client_id: &str, scope: &[&str], challenge: Option<CodeChallenge>) {
        self.store.insert_auth_request(
            TENANT,
            AuthRequest {
                id: format!("req-{code}"),
                code: code.into(),
                client_id: client_id.into(),
                user_id: "alice".into(),
                resource_owner: ORG.into(),
                redirect_uri: REDIRECT.into(),
                scope: scope.iter().map(ToString::to_string).collect(),
                audience: Vec::new(),
                code_challenge: challenge,
                nonce: Some("n-0S6".into()),
                auth_methods: vec![AuthMethodType::Password, AuthMethodType::Totp],
                auth_time: Utc::now(),
                preferred_language: Some("en".into()),
                session_id: Some("login-1".into()),
            },
        );
    }
}

pub fn form(params: &[(&str, &str)]) -> Vec<(String, String)> {
    params
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn user(id: &str, permissions: &[&str]) -> User {
    User {
        id: id.into(),
        resource_owner: ORG.into(),
        username: format!("{id}@acme.example"),
        display_name: Some(id.to_uppercase()),
        email: Some(format!("{id}@acme.example")),
        email_verified: true,
        preferred_language: Some("en".into()),
        roles: Vec::new(),
        permissions: permissions.iter().map(ToString::to_string).collect(),
        keys: Vec::new(),
    }
}

pub fn plain_challenge(verifier: &str) -> CodeChallenge {
    CodeChallenge {
        challenge: verifier.into(),
        method: CodeChallengeMethod::Plain,
    }
}

/// Key pair a user registers for JWT-profile assertions.
pub struct UserKey {
    pub id: String,
    pair: rcgen::KeyPair,
}

impl UserKey {
    pub fn generate() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pair: rcgen::KeyPair::generate().unwrap(),
        }
    }

    pub fn registered(&self) -> RegisteredKey {
        RegisteredKey {
            id: self.id.clone(),
            public_key_pem: self.pair.public_key_pem(),
            expires_at: None,
        }
    }

    /// Assertion `iss = sub = user_id`, audience the tenant issuer.
    pub fn assertion(&self, user_id: &str, lifetime: Duration) -> String {
        let now = Utc::now().timestamp();
        let lifetime = i64::try_from(lifetime.as_secs()).unwrap();
        let claims = json!({
            "iss": user_id,
            "sub": user_id,
            "aud": [ISSUER],
            "iat": now,
            "exp": now + lifetime,
        });
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.id.clone());
        let key = EncodingKey::from_ec_pem(self.pair.serialize_pem().as_bytes()).unwrap();
        jsonwebtoken::encode(&header, &claims, &key).unwrap()
    }
}
