//! HTTP handlers for the token endpoints.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/oauth/v2/token` | Every supported grant, including token exchange |
//! | `POST` | `/oauth/v2/introspect` | RFC 7662 introspection for authenticated clients |
//! | `GET` | `/oauth/v2/keys` | Public signing keys of the tenant (JWKS) |
//! | `GET` | `/healthz` | Liveness |
//!
//! Both `POST` endpoints take `application/x-www-form-urlencoded` bodies.
//! Client credentials are read from `Authorization: Basic` when present,
//! otherwise from the form (`client_id`, `client_secret`,
//! `client_assertion`, `client_assertion_type`).
//!
//! The tenant is taken from the `x-tenant-id` header and falls back to the
//! configured default tenant.

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use super::Provider;
use crate::error::{ErrorCode, OAuthError};
use crate::grant::{ClientCredentials, TokenRequest};
use crate::{Error, Result};

/// Header naming the tenant a request belongs to.
pub const TENANT_HEADER: &str = "x-tenant-id";

// ── Route builder ─────────────────────────────────────────────────────────

/// Build the token endpoint routes.
pub fn routes(provider: Arc<Provider>) -> Router {
    Router::new()
        .route("/oauth/v2/token", post(token))
        .route("/oauth/v2/introspect", post(introspect))
        .route("/oauth/v2/keys", get(keys))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(provider)
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /oauth/v2/token`
async fn token(
    State(provider): State<Arc<Provider>>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    let tenant = tenant(&headers, provider.default_tenant());
    let request = match parse_token_request(&headers, &params) {
        Ok(request) => request,
        Err(e) => return OAuthError::from_error(e, false).into_response(),
    };
    match provider.token(&tenant, request).await {
        Ok(body) => (no_store(), Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `POST /oauth/v2/introspect`
async fn introspect(
    State(provider): State<Arc<Provider>>,
    headers: HeaderMap,
    Form(params): Form<Vec<(String, String)>>,
) -> Response {
    let tenant = tenant(&headers, provider.default_tenant());
    let Some(token) = form_value(&params, "token") else {
        return OAuthError::invalid_request()
            .with_description("token is missing")
            .into_response();
    };
    let credentials = match credentials(&headers, &params) {
        Ok(credentials) => credentials,
        Err(e) => return OAuthError::from_error(e, false).into_response(),
    };
    match provider.introspect(&tenant, token, &credentials).await {
        Ok(body) => (no_store(), Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// `GET /oauth/v2/keys`
async fn keys(State(provider): State<Arc<Provider>>, headers: HeaderMap) -> Response {
    let tenant = tenant(&headers, provider.default_tenant());
    match provider.jwks(&tenant).await {
        Ok(set) => Json(set).into_response(),
        Err(e) => e.into_response(),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn tenant(headers: &HeaderMap, default: &str) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
        .to_string()
}

fn form_value<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, v)| k == key && !v.is_empty())
        .map(|(_, v)| v.as_str())
}

fn parse_token_request(headers: &HeaderMap, params: &[(String, String)]) -> Result<TokenRequest> {
    let mut request = TokenRequest::from_form(params)?;
    if let Some((id, secret)) = basic_auth(headers)? {
        request.credentials = request.credentials.with_basic(id, secret);
    }
    Ok(request)
}

fn credentials(headers: &HeaderMap, params: &[(String, String)]) -> Result<ClientCredentials> {
    let owned = |key| form_value(params, key).map(ToString::to_string);
    let creds = ClientCredentials {
        client_id: owned("client_id"),
        client_secret: owned("client_secret"),
        client_assertion: owned("client_assertion"),
        client_assertion_type: owned("client_assertion_type"),
    };
    Ok(match basic_auth(headers)? {
        Some((id, secret)) => creds.with_basic(id, secret),
        None => creds,
    })
}

/// `Authorization: Basic base64(client_id:client_secret)`, if present. Both
/// parts are form-urlencoded before they are joined (RFC 6749 section 2.3.1).
fn basic_auth(headers: &HeaderMap) -> Result<Option<(String, String)>> {
    let Some(value) = headers.get(header::AUTHORIZATION) else {
        return Ok(None);
    };
    let Some(encoded) = value.to_str().ok().and_then(|v| v.strip_prefix("Basic ")) else {
        return Ok(None);
    };
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| Error::Unauthenticated("malformed basic credentials".into()))?;
    let decoded = String::from_utf8(decoded)
        .map_err(|_| Error::Unauthenticated("malformed basic credentials".into()))?;
    let (id, secret) = decoded
        .split_once(':')
        .ok_or_else(|| Error::Unauthenticated("malformed basic credentials".into()))?;
    Ok(Some((form_decode(id)?, form_decode(secret)?)))
}

fn form_decode(raw: &str) -> Result<String> {
    let pairs: Vec<(String, String)> =
        serde_urlencoded::from_str(&format!("v={}", raw.replace('&', "%26")))
            .map_err(|_| Error::Unauthenticated("malformed basic credentials".into()))?;
    Ok(pairs.into_iter().next().map(|(_, v)| v).unwrap_or_default())
}

fn no_store() -> [(header::HeaderName, HeaderValue); 2] {
    [
        (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
        (header::PRAGMA, HeaderValue::from_static("no-cache")),
    ]
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self.to_response());
        if self.code == ErrorCode::InvalidClient {
            (
                status,
                [(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"))],
                body,
            )
                .into_response()
        } else {
            (status, body).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn basic(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Basic {}", STANDARD.encode(value))).unwrap(),
        );
        headers
    }

    #[test]
    fn tenant_header_overrides_default() {
        // GIVEN: a request naming a tenant
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme"));

        // THEN: the header wins, an empty map falls back
        assert_eq!(tenant(&headers, "default"), "acme");
        assert_eq!(tenant(&HeaderMap::new(), "default"), "default");
    }

    #[test]
    fn basic_auth_is_split_on_first_colon() {
        let parsed = basic_auth(&basic("app:s3:cret")).unwrap();
        assert_eq!(parsed, Some(("app".to_string(), "s3:cret".to_string())));
    }

    #[test]
    fn malformed_basic_auth_is_unauthenticated() {
        let err = basic_auth(&basic("no-colon")).unwrap_err();
        assert!(matches!(err, Error::Unauthenticated(_)));
    }

    #[test]
    fn basic_auth_overrides_form_credentials() {
        // GIVEN: credentials in both the header and the form
        let params = vec![
            ("client_id".to_string(), "form-app".to_string()),
            ("client_secret".to_string(), "form-secret".to_string()),
        ];

        // WHEN: resolving the caller
        let creds = credentials(&basic("app:secret"), &params).unwrap();

        // THEN: the header values are used
        assert_eq!(creds.client_id.as_deref(), Some("app"));
        assert_eq!(creds.client_secret.as_deref(), Some("secret"));
    }

    #[test]
    fn basic_auth_parts_are_form_decoded() {
        // GIVEN: an id and secret containing reserved characters, encoded first
        let headers = basic("my%3Aapp:p%40ss+w%2Brd");

        // THEN: both parts come back decoded
        let parsed = basic_auth(&headers).unwrap();
        assert_eq!(parsed, Some(("my:app".to_string(), "p@ss w+rd".to_string())));
    }

    #[test]
    fn token_request_takes_basic_credentials() {
        let params = vec![
            ("grant_type".to_string(), "client_credentials".to_string()),
            ("scope".to_string(), "openid".to_string()),
        ];
        let request = parse_token_request(&basic("svc:pw"), &params).unwrap();
        assert_eq!(request.credentials.client_id.as_deref(), Some("svc"));
    }

    #[test]
    fn invalid_client_carries_challenge() {
        // GIVEN: a failed client authentication
        let response = OAuthError::invalid_client().into_response();

        // THEN: 401 with a WWW-Authenticate challenge
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(response.headers().contains_key(header::WWW_AUTHENTICATE));
    }

    #[test]
    fn invalid_grant_is_bad_request() {
        let response = OAuthError::invalid_grant().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!response.headers().contains_key(header::WWW_AUTHENTICATE));
    }
}
