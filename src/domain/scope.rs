//! Scope vocabulary and helpers.
//!
//! Besides the standard OIDC scopes, tokenforge reserves scopes under the
//! `urn:tokenforge:iam:` namespace. These are not granted permissions but
//! request modifiers: they restrict the session to an organization, add a
//! project to the audience, or ask for resource-owner claims.

/// `openid`
pub const OPENID: &str = "openid";
/// `profile`
pub const PROFILE: &str = "profile";
/// `email`
pub const EMAIL: &str = "email";
/// `phone`
pub const PHONE: &str = "phone";
/// `address`
pub const ADDRESS: &str = "address";
/// `offline_access` (issue a refresh token)
pub const OFFLINE_ACCESS: &str = "offline_access";

/// Namespace of reserved scopes
pub const RESERVED_PREFIX: &str = "urn:tokenforge:iam:";
/// Restrict to the organization with this id
pub const ORG_ID_PREFIX: &str = "urn:tokenforge:iam:org:id:";
/// Restrict to the organization with this primary domain
pub const ORG_DOMAIN_PRIMARY_PREFIX: &str = "urn:tokenforge:iam:org:domain:primary:";
/// `urn:tokenforge:iam:org:project:id:{id}:aud` adds a project to the audience
pub const PROJECT_ID_PREFIX: &str = "urn:tokenforge:iam:org:project:id:";
/// Suffix of project audience scopes
pub const AUDIENCE_SUFFIX: &str = ":aud";
/// Ask for project roles in the userinfo claims
pub const PROJECT_ROLES: &str = "urn:tokenforge:iam:org:project:roles";
/// Ask for resource-owner claims
pub const RESOURCE_OWNER: &str = "urn:tokenforge:iam:user:resourceowner";

/// Claim carrying the resource owner id
pub const CLAIM_RESOURCE_OWNER_ID: &str = "urn:tokenforge:iam:user:resourceowner:id";
/// Claim carrying the resource owner name
pub const CLAIM_RESOURCE_OWNER_NAME: &str = "urn:tokenforge:iam:user:resourceowner:name";
/// Claim carrying the resource owner primary domain
pub const CLAIM_RESOURCE_OWNER_PRIMARY_DOMAIN: &str =
    "urn:tokenforge:iam:user:resourceowner:primary_domain";
/// Claim carrying project roles
pub const CLAIM_PROJECT_ROLES: &str = "urn:tokenforge:iam:org:project:roles";

const STANDARD: &[&str] = &[OPENID, PROFILE, EMAIL, PHONE, ADDRESS, OFFLINE_ACCESS];

/// Split a space-delimited scope parameter.
#[must_use]
pub fn parse(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

/// Join scopes into the space-delimited wire form.
#[must_use]
pub fn join(scopes: &[String]) -> String {
    scopes.join(" ")
}

/// One of the standard OIDC scopes.
#[must_use]
pub fn is_standard(scope: &str) -> bool {
    STANDARD.contains(&scope)
}

/// A scope under the reserved namespace.
#[must_use]
pub fn is_reserved(scope: &str) -> bool {
    scope.starts_with(RESERVED_PREFIX)
}

/// `true` when every element of `subset` is contained in `set`.
#[must_use]
pub fn is_subset(subset: &[String], set: &[String]) -> bool {
    subset.iter().all(|s| set.contains(s))
}

/// `true` when both lists hold the same elements, ignoring order.
#[must_use]
pub fn same_set(a: &[String], b: &[String]) -> bool {
    is_subset(a, b) && is_subset(b, a)
}

/// Project ids requested through `...:project:id:{id}:aud` scopes.
#[must_use]
pub fn audience_from_scopes(scopes: &[String]) -> Vec<String> {
    scopes
        .iter()
        .filter_map(|s| {
            s.strip_prefix(PROJECT_ID_PREFIX)
                .and_then(|rest| rest.strip_suffix(AUDIENCE_SUFFIX))
        })
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .collect()
}

/// Append elements of `extra` missing from `list`.
pub fn append_unique(list: &mut Vec<String>, extra: impl IntoIterator<Item = String>) {
    for item in extra {
        if !list.contains(&item) {
            list.push(item);
        }
    }
}

/// Serde adapter for a `Vec<String>` carried as a space-delimited string.
pub mod space_delimited {
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize as `"a b c"`.
    pub fn serialize<S: Serializer>(value: &[String], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.join(" "))
    }

    /// Deserialize from `"a b c"`.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(super::parse(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn audience_scopes_yield_project_ids() {
        let scopes = v(&[
            "openid",
            "urn:tokenforge:iam:org:project:id:p1:aud",
            "urn:tokenforge:iam:org:project:id::aud",
            "urn:tokenforge:iam:org:project:id:p2",
        ]);
        assert_eq!(audience_from_scopes(&scopes), v(&["p1"]));
    }

    #[test]
    fn subset_and_equality() {
        assert!(is_subset(&v(&["a"]), &v(&["a", "b"])));
        assert!(!is_subset(&v(&["c"]), &v(&["a", "b"])));
        assert!(is_subset(&[], &v(&["a"])));
        assert!(same_set(&v(&["b", "a"]), &v(&["a", "b"])));
    }

    #[test]
    fn parse_ignores_extra_whitespace() {
        assert_eq!(parse("  openid   profile "), v(&["openid", "profile"]));
        assert!(parse("").is_empty());
    }
}
