//! Authentication Methods Reference (`amr`) policy.
//!
//! Sessions record the coarse authentication methods a user went through.
//! [`AmrPolicy`] turns that list into the `amr` claim: every method maps to an
//! optional reference value and a factor count, and a session with at least
//! `mfa_threshold` factors additionally gets `mfa`.
//!
//! The mapping is product policy, so it is configurable (see
//! [`crate::config::AmrConfig`]); [`AmrPolicy::default`] is the stock table.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A coarse authentication method recorded on a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethodType {
    /// Username + password
    Password,
    /// Passkey / passwordless (counts as possession + inherence)
    Passwordless,
    /// Second-factor security key
    U2f,
    /// Time-based one-time password
    Totp,
    /// One-time password via SMS
    OtpSms,
    /// One-time password via email
    OtpEmail,
    /// External identity provider
    Idp,
    /// Private key (JWT profile / machine key)
    PrivateKey,
}

/// How one [`AuthMethodType`] contributes to the `amr` claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmrRule {
    /// Reference value added to the claim, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Number of factors the method counts for
    #[serde(default)]
    pub factors: u8,
}

impl AmrRule {
    fn new(value: Option<&str>, factors: u8) -> Self {
        Self {
            value: value.map(str::to_string),
            factors,
        }
    }
}

/// Mapping table from authentication methods to `amr` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmrPolicy {
    rules: HashMap<AuthMethodType, AmrRule>,
    mfa_threshold: u8,
}

impl Default for AmrPolicy {
    fn default() -> Self {
        use AuthMethodType as M;
        let rules = HashMap::from([
            (M::Password, AmrRule::new(Some("pwd"), 1)),
            (M::Passwordless, AmrRule::new(Some("user"), 2)),
            (M::U2f, AmrRule::new(Some("user"), 1)),
            (M::Totp, AmrRule::new(Some("otp"), 1)),
            (M::OtpSms, AmrRule::new(Some("otp"), 1)),
            (M::OtpEmail, AmrRule::new(Some("otp"), 1)),
            (M::Idp, AmrRule::new(None, 1)),
            (M::PrivateKey, AmrRule::new(None, 1)),
        ]);
        Self {
            rules,
            mfa_threshold: 2,
        }
    }
}

impl AmrPolicy {
    /// Build a policy from the stock table with `overrides` applied on top.
    #[must_use]
    pub fn with_overrides(overrides: HashMap<AuthMethodType, AmrRule>, mfa_threshold: u8) -> Self {
        let mut policy = Self::default();
        policy.rules.extend(overrides);
        policy.mfa_threshold = mfa_threshold;
        policy
    }

    /// Compute the `amr` claim. Values are deduplicated, order follows the
    /// method list; `mfa` is appended last.
    #[must_use]
    pub fn amr(&self, methods: &[AuthMethodType]) -> Vec<String> {
        let mut values = Vec::new();
        let mut factors: u32 = 0;
        for method in methods {
            let Some(rule) = self.rules.get(method) else {
                continue;
            };
            factors += u32::from(rule.factors);
            if let Some(value) = &rule.value {
                if !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        if self.mfa_threshold > 0 && factors >= u32::from(self.mfa_threshold) {
            values.push("mfa".to_string());
        }
        values
    }
}
