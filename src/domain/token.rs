//! Parsed token views and token-exchange vocabulary.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::amr::AuthMethodType;
use crate::error::{Error, OAuthError};

/// Prefix of access token ids inside a session
pub const ACCESS_TOKEN_PREFIX: &str = "at_";
/// Prefix of refresh tokens
pub const REFRESH_TOKEN_PREFIX: &str = "rt_";

/// One link of a delegation chain (`act` claim).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenActor {
    /// Previous actor, for multi-hop delegation
    #[serde(rename = "act", default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<Box<TokenActor>>,
    /// Acting user
    #[serde(rename = "sub")]
    pub user_id: String,
    /// Issuer that authenticated the actor
    #[serde(rename = "iss")]
    pub issuer: String,
}

impl TokenActor {
    /// Number of links in the chain.
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.actor.as_ref().map_or(0, |a| a.depth())
    }
}

/// Runtime view of a verified access token, opaque or JWT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// `<session_id>.at_<id>`
    pub token_id: String,
    /// User the token was issued for
    pub user_id: String,
    /// `sub` claim
    pub subject: String,
    /// User's organization
    pub resource_owner: String,
    /// Client the token was issued to
    pub client_id: String,
    /// Audience
    pub audience: Vec<String>,
    /// Scope
    pub scope: Vec<String>,
    /// Authentication methods
    pub auth_methods: Vec<AuthMethodType>,
    /// Login time
    pub auth_time: DateTime<Utc>,
    /// Issued at
    pub creation: DateTime<Utc>,
    /// Expires at
    pub expiration: DateTime<Utc>,
    /// Delegation chain
    pub actor: Option<TokenActor>,
    /// Preferred language
    pub preferred_language: Option<String>,
    /// Personal access token
    pub is_pat: bool,
}

/// Token types of RFC 8693 plus the internal user-id type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenType {
    /// `urn:ietf:params:oauth:token-type:access_token`
    #[serde(rename = "urn:ietf:params:oauth:token-type:access_token")]
    AccessToken,
    /// `urn:ietf:params:oauth:token-type:refresh_token`
    #[serde(rename = "urn:ietf:params:oauth:token-type:refresh_token")]
    RefreshToken,
    /// `urn:ietf:params:oauth:token-type:id_token`
    #[serde(rename = "urn:ietf:params:oauth:token-type:id_token")]
    IdToken,
    /// `urn:ietf:params:oauth:token-type:jwt`
    #[serde(rename = "urn:ietf:params:oauth:token-type:jwt")]
    Jwt,
    /// A bare user id, only usable to start impersonation
    #[serde(rename = "urn:tokenforge:params:oauth:token-type:user_id")]
    UserId,
}

impl TokenType {
    /// Every token type.
    pub const ALL: [TokenType; 5] = [
        Self::AccessToken,
        Self::RefreshToken,
        Self::IdToken,
        Self::Jwt,
        Self::UserId,
    ];

    /// Wire value
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AccessToken => "urn:ietf:params:oauth:token-type:access_token",
            Self::RefreshToken => "urn:ietf:params:oauth:token-type:refresh_token",
            Self::IdToken => "urn:ietf:params:oauth:token-type:id_token",
            Self::Jwt => "urn:ietf:params:oauth:token-type:jwt",
            Self::UserId => "urn:tokenforge:params:oauth:token-type:user_id",
        }
    }

    /// Whether the exchange engine can mint this type.
    #[must_use]
    pub fn is_issuable(self) -> bool {
        matches!(self, Self::AccessToken | Self::IdToken | Self::Jwt)
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                OAuthError::invalid_request()
                    .with_description(format!("token type {s:?} is not supported"))
                    .into()
            })
    }
}

/// Subject or actor of a token exchange, normalized from any accepted type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeToken {
    /// Type the token was presented as
    pub token_type: TokenType,
    /// User the token represents
    pub user_id: String,
    /// Issuer of the token
    pub issuer: String,
    /// User's organization
    pub resource_owner: String,
    /// Audience
    pub audience: Vec<String>,
    /// Scopes
    pub scopes: Vec<String>,
    /// Login time
    pub auth_time: DateTime<Utc>,
    /// Authentication methods
    pub auth_methods: Vec<AuthMethodType>,
    /// Delegation chain already carried by the token
    pub actor: Option<TokenActor>,
    /// Preferred language
    pub preferred_language: Option<String>,
}

impl ExchangeToken {
    /// The token as one link of a delegation chain.
    #[must_use]
    pub fn as_actor(&self) -> TokenActor {
        TokenActor {
            actor: self.actor.clone().map(Box::new),
            user_id: self.user_id.clone(),
            issuer: self.issuer.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn actor_serializes_as_act_claim() {
        let actor = TokenActor {
            actor: Some(Box::new(TokenActor {
                actor: None,
                user_id: "root".into(),
                issuer: "https://idp".into(),
            })),
            user_id: "admin".into(),
            issuer: "https://idp".into(),
        };
        let json = serde_json::to_value(&actor).unwrap();
        assert_eq!(json["sub"], "admin");
        assert_eq!(json["act"]["sub"], "root");
        assert_eq!(actor.depth(), 2);
    }

    #[test]
    fn token_type_round_trips_through_wire_value() {
        for t in TokenType::ALL {
            assert_eq!(t.as_str().parse::<TokenType>().unwrap(), t);
        }
        assert!(!TokenType::RefreshToken.is_issuable());
        assert!(!TokenType::UserId.is_issuable());
    }
}
