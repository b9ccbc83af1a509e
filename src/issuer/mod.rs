//! Token issuer abstraction.
//!
//! The lifecycle manager never talks HTTP itself. It awaits the
//! [`TokenGrant`] returned by a [`TokenIssuer`] and decides what to do with
//! the error class on failure.

mod oauth;

pub use oauth::OAuthIssuer;

use crate::credential::TokenGrant;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// External service that issues and refreshes OAuth tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    /// Runs the interactive authorization flow and returns the first grant.
    async fn initial_authorize(&self) -> Result<TokenGrant, IssuerError>;

    /// Exchanges a refresh token for a new access token.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, IssuerError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IssuerError {
    #[error("rate limited by issuer")]
    RateLimited { retry_after: Option<Duration> },

    #[error("transient issuer failure: {0}")]
    Transient(String),

    /// The refresh token is revoked, expired, or otherwise dead
    #[error("issuer rejected the grant: {0}")]
    InvalidGrant(String),

    /// Any other refusal (bad client credentials, malformed request).
    /// Retrying will not help.
    #[error("issuer rejected the request: {0}")]
    Rejected(String),
}

impl IssuerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IssuerError::RateLimited { .. } | IssuerError::Transient(_))
    }

    /// Delay the issuer asked for, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            IssuerError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
