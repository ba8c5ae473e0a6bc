//! Error types for tokenforge
//!
//! Two layers:
//!
//! - [`Error`] is the crate-internal error. Storage collaborators, verifiers and
//!   grant handlers return it with a coarse class (`InvalidArgument`,
//!   `PreconditionFailed`, `PermissionDenied`, ...).
//! - [`OAuthError`] is what leaves the core. [`OAuthError::from_error`] is the
//!   only place a crate error is translated into the OAuth2/OIDC error
//!   vocabulary; the original error is kept as the parent for logging and is
//!   only echoed to the caller when the tenant enabled parent-error debugging.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for tokenforge
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-internal errors
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing caller input
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The request is well-formed but the current state forbids it
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// A looked-up entity does not exist (or is not active)
    #[error("Not found: {0}")]
    NotFound(String),

    /// The principal is not allowed to perform the operation
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Credentials are missing or invalid
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    /// The entity already exists (e.g. a lock held elsewhere)
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The operation was abandoned because a sibling task failed
    #[error("Operation cancelled")]
    Cancelled,

    /// An already-typed protocol error passing through
    #[error(transparent)]
    OAuth(#[from] OAuthError),

    /// JWT encode / decode / signature error
    #[error("JWT error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Shorthand for [`Error::InvalidArgument`]
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Shorthand for [`Error::PreconditionFailed`]
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::PreconditionFailed(msg.into())
    }

    /// Shorthand for [`Error::NotFound`]
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Shorthand for [`Error::Internal`]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Returns `true` for [`Error::NotFound`]
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// The protocol error code this error maps to at the boundary
    #[must_use]
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::OAuth(e) => e.code,
            Self::InvalidArgument(_)
            | Self::NotFound(_)
            | Self::PreconditionFailed(_)
            | Self::Jwt(_)
            | Self::Json(_) => ErrorCode::InvalidRequest,
            Self::PermissionDenied(_) => ErrorCode::AccessDenied,
            Self::Unauthenticated(_) => ErrorCode::UnauthorizedClient,
            Self::AlreadyExists(_)
            | Self::Cancelled
            | Self::Config(_)
            | Self::Io(_)
            | Self::Internal(_) => ErrorCode::ServerError,
        }
    }
}

impl From<figment::Error> for Error {
    fn from(e: figment::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// OAuth2 / OIDC error codes surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Missing or malformed parameter
    InvalidRequest,
    /// Client authentication failed
    InvalidClient,
    /// Grant (code, refresh token, assertion) invalid, expired or consumed
    InvalidGrant,
    /// Requested scope not allowed
    InvalidScope,
    /// Requested audience / resource not allowed
    InvalidTarget,
    /// Client not allowed to use this grant or endpoint
    UnauthorizedClient,
    /// `grant_type` not supported
    UnsupportedGrantType,
    /// The end user or policy denied the request
    AccessDenied,
    /// Device flow: user has not finished yet
    AuthorizationPending,
    /// Device flow: polling too fast / deadline exceeded
    SlowDown,
    /// Device flow: device code expired
    ExpiredToken,
    /// Unexpected internal failure
    ServerError,
}

impl ErrorCode {
    /// Wire representation
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidClient => "invalid_client",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidTarget => "invalid_target",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::AccessDenied => "access_denied",
            Self::AuthorizationPending => "authorization_pending",
            Self::SlowDown => "slow_down",
            Self::ExpiredToken => "expired_token",
            Self::ServerError => "server_error",
        }
    }

    /// HTTP status the error is rendered with
    #[must_use]
    pub fn http_status(self) -> u16 {
        match self {
            Self::InvalidClient => 401,
            Self::ServerError => 500,
            _ => 400,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol-level error with the original cause attached
#[derive(Debug)]
pub struct OAuthError {
    /// Machine-readable code
    pub code: ErrorCode,
    /// Human-readable description returned to the caller
    pub description: Option<String>,
    /// Original cause, for logs only unless `return_parent` is set
    pub parent: Option<Box<Error>>,
    /// Echo the parent error in the description
    pub return_parent: bool,
}

impl OAuthError {
    /// New error with a code only
    #[must_use]
    pub fn new(code: ErrorCode) -> Self {
        Self {
            code,
            description: None,
            parent: None,
            return_parent: false,
        }
    }

    /// `invalid_request`
    #[must_use]
    pub fn invalid_request() -> Self {
        Self::new(ErrorCode::InvalidRequest)
    }

    /// `invalid_client`
    #[must_use]
    pub fn invalid_client() -> Self {
        Self::new(ErrorCode::InvalidClient)
    }

    /// `invalid_grant`
    #[must_use]
    pub fn invalid_grant() -> Self {
        Self::new(ErrorCode::InvalidGrant)
    }

    /// `invalid_scope`
    #[must_use]
    pub fn invalid_scope() -> Self {
        Self::new(ErrorCode::InvalidScope)
    }

    /// `invalid_target`
    #[must_use]
    pub fn invalid_target() -> Self {
        Self::new(ErrorCode::InvalidTarget)
    }

    /// `unauthorized_client`
    #[must_use]
    pub fn unauthorized_client() -> Self {
        Self::new(ErrorCode::UnauthorizedClient)
    }

    /// `server_error`
    #[must_use]
    pub fn server_error() -> Self {
        Self::new(ErrorCode::ServerError)
    }

    /// Set the description
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Attach the original cause
    #[must_use]
    pub fn with_parent(mut self, parent: Error) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Echo the parent in the description returned to the caller
    #[must_use]
    pub fn with_return_parent(mut self, return_parent: bool) -> Self {
        self.return_parent = return_parent;
        self
    }

    /// Convert any crate error into a protocol error.
    ///
    /// Errors that already are [`OAuthError`]s pass through untouched (only
    /// the debug flag is applied), everything else is classified by
    /// [`Error::error_code`]. Internal errors never carry their message in the
    /// description unless `debug` is set.
    #[must_use]
    pub fn from_error(err: Error, debug: bool) -> Self {
        match err {
            Error::OAuth(mut e) => {
                e.return_parent |= debug;
                e
            }
            other => {
                let code = other.error_code();
                let description = match &other {
                    Error::InvalidArgument(m)
                    | Error::PreconditionFailed(m)
                    | Error::NotFound(m)
                    | Error::PermissionDenied(m)
                    | Error::Unauthenticated(m) => Some(m.clone()),
                    _ => None,
                };
                Self {
                    code,
                    description,
                    parent: Some(Box::new(other)),
                    return_parent: debug,
                }
            }
        }
    }

    /// JSON body returned to the caller
    #[must_use]
    pub fn to_response(&self) -> ErrorResponse {
        let mut description = self.description.clone();
        if self.return_parent {
            if let Some(parent) = &self.parent {
                description = Some(match description {
                    Some(d) => format!("{d}: {parent}"),
                    None => parent.to_string(),
                });
            }
        }
        ErrorResponse {
            error: self.code,
            error_description: description,
        }
    }
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(d) => write!(f, "{}: {d}", self.code),
            None => write!(f, "{}", self.code),
        }
    }
}

impl std::error::Error for OAuthError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.parent
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// Serialized error body (`{"error": "...", "error_description": "..."}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable code
    pub error: ErrorCode,
    /// Optional description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}
