//! Audit log for token and key lifecycle events.
//!
//! Every event is serialized to JSON and emitted through `tracing::info!` on
//! the `audit` target, so any log pipeline can index it.
//!
//! | Event | When |
//! |-------|------|
//! | `token.issued` | A grant produced tokens |
//! | `token.refreshed` | A refresh token was exchanged |
//! | `token.exchanged` | Token exchange with the subject acting for itself |
//! | `token.impersonated` | Token exchange with a distinct actor |
//! | `token.introspected` | An introspection request was answered |
//! | `token.denied` | A token request failed |
//! | `key.generated` | This instance generated a signing key |
//! | `key.rotated` | A rotator switched to a newer signing key |

use serde::Serialize;

use crate::domain::{GrantType, Session, TokenReason};
use crate::error::OAuthError;

/// Structured audit event.
#[derive(Debug, Serialize)]
pub struct AuditEvent {
    /// Event type (e.g. `"token.issued"`)
    pub event: &'static str,
    /// Tenant
    pub tenant: String,
    /// Client involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Subject of the issued token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Token id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Grant type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_type: Option<GrantType>,
    /// Acting user for impersonation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Introspection verdict
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active: Option<bool>,
    /// Signing key id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_id: Option<String>,
    /// Error code for denials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    fn new(event: &'static str, tenant: &str) -> Self {
        Self {
            event,
            tenant: tenant.to_string(),
            client_id: None,
            subject: None,
            token_id: None,
            grant_type: None,
            actor: None,
            active: None,
            key_id: None,
            error: None,
        }
    }

    /// Event for a session whose tokens were handed out.
    #[must_use]
    pub fn for_session(session: &Session, grant_type: GrantType) -> Self {
        let event = match session.reason {
            TokenReason::Refresh => "token.refreshed",
            TokenReason::Exchange => "token.exchanged",
            TokenReason::Impersonation => "token.impersonated",
            TokenReason::AuthRequest
            | TokenReason::ClientCredentials
            | TokenReason::JwtProfile
            | TokenReason::DeviceCode => "token.issued",
        };
        Self {
            client_id: Some(session.client_id.clone()),
            subject: Some(session.user_id.clone()),
            token_id: Some(session.token_id.clone()),
            grant_type: Some(grant_type),
            actor: session.actor.as_ref().map(|a| a.user_id.clone()),
            ..Self::new(event, &session.tenant)
        }
    }

    /// `token.denied`
    #[must_use]
    pub fn denied(tenant: &str, grant_type: Option<GrantType>, error: &OAuthError) -> Self {
        Self {
            grant_type,
            error: Some(error.code.to_string()),
            ..Self::new("token.denied", tenant)
        }
    }

    /// `token.introspected`
    #[must_use]
    pub fn introspected(tenant: &str, client_id: Option<String>, active: bool) -> Self {
        Self {
            client_id,
            active: Some(active),
            ..Self::new("token.introspected", tenant)
        }
    }

    /// `key.generated`
    #[must_use]
    pub fn key_generated(tenant: &str) -> Self {
        Self::new("key.generated", tenant)
    }

    /// `key.rotated`
    #[must_use]
    pub fn key_rotated(tenant: &str, key_id: &str) -> Self {
        Self {
            key_id: Some(key_id.to_string()),
            ..Self::new("key.rotated", tenant)
        }
    }
}

/// Emit an audit event on the `audit` target.
pub fn emit(event: &AuditEvent) {
    match serde_json::to_string(event) {
        Ok(ref json) => tracing::info!(target: "audit", audit = %json, "tokenforge audit"),
        Err(ref e) => tracing::warn!(error = %e, "Failed to serialize audit event"),
    }
}
