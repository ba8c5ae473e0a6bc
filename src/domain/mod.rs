//! Data model shared by every component.

pub mod amr;
pub mod client;
pub mod scope;
pub mod session;
pub mod token;

pub use amr::{AmrPolicy, AmrRule, AuthMethodType};
pub use client::{AccessTokenType, Client, ClientAuthMethod, GrantType, RegisteredKey};
pub use session::{Session, SessionGrant, TokenReason};
pub use token::{AccessToken, ExchangeToken, TokenActor, TokenType};
