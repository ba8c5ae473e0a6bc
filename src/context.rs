//! Per-request context.

use tokio_util::sync::CancellationToken;

use crate::storage::TenantSettings;

/// Everything a component needs to know about the request it serves.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Tenant (instance) the request targets
    pub tenant: String,
    /// Issuer URL for the tenant
    pub issuer: String,
    /// Tenant security settings
    pub settings: TenantSettings,
    /// Authenticated principal acting in this request, if known
    pub principal: Option<String>,
    /// Cancelled when the request is abandoned
    pub cancel: CancellationToken,
}

impl RequestContext {
    /// New context with no principal.
    #[must_use]
    pub fn new(tenant: impl Into<String>, issuer: impl Into<String>, settings: TenantSettings) -> Self {
        Self {
            tenant: tenant.into(),
            issuer: issuer.into(),
            settings,
            principal: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Same request, acting as `principal`.
    #[must_use]
    pub fn with_principal(&self, principal: impl Into<String>) -> Self {
        Self {
            principal: Some(principal.into()),
            ..self.clone()
        }
    }

    /// Echo internal error causes to the caller.
    #[must_use]
    pub fn debug_errors(&self) -> bool {
        self.settings.debug_parent_error
    }
}
