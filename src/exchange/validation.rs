//! Audience and scope narrowing for token exchange.

use crate::domain::scope;
use crate::error::OAuthError;
use crate::Result;

/// Resolve a requested list against the subject's and actor's lists.
///
/// An empty request falls back to the subject, then the actor. A non-empty
/// request must equal one side, or be a subset of their union.
pub fn narrow(requested: &[String], subject: &[String], actor: &[String]) -> Option<Vec<String>> {
    if requested.is_empty() {
        let fallback = if subject.is_empty() { actor } else { subject };
        return Some(fallback.to_vec());
    }
    if scope::same_set(requested, subject) || scope::same_set(requested, actor) {
        return Some(requested.to_vec());
    }
    let mut union = subject.to_vec();
    scope::append_unique(&mut union, actor.iter().cloned());
    scope::is_subset(requested, &union).then(|| requested.to_vec())
}

/// Output audience; `invalid_target` when the request widens it.
pub fn audience(requested: &[String], subject: &[String], actor: &[String]) -> Result<Vec<String>> {
    narrow(requested, subject, actor).ok_or_else(|| {
        OAuthError::invalid_target()
            .with_description("requested audience is not covered by the presented tokens")
            .into()
    })
}

/// Output scope before the client allow-list; `invalid_scope` when the
/// request widens it.
pub fn scopes(requested: &[String], subject: &[String], actor: &[String]) -> Result<Vec<String>> {
    narrow(requested, subject, actor).ok_or_else(|| {
        OAuthError::invalid_scope()
            .with_description("requested scope is not covered by the presented tokens")
            .into()
    })
}
