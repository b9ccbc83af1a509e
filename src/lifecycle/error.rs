use crate::store::StoreError;
use std::sync::Arc;
use thiserror::Error;

/// Errors returned to token consumers.
///
/// `Clone` because one refresh outcome is shared by every waiting caller.
#[derive(Debug, Clone, Error)]
pub enum LifecycleError {
    #[error("not authenticated; run `tokenkeep authorize`")]
    NotAuthenticated,

    #[error("refresh token was revoked; re-authorization required")]
    ReauthorizationRequired,

    /// Transient failures exhausted the retry budget
    #[error("token refresh failed after retries: {0}")]
    RefreshRetryable(String),

    /// Issuer refused the refresh outright
    #[error("token refresh rejected: {0}")]
    RefreshTerminal(String),

    #[error("access token expired and no refresh succeeded")]
    TokenExpired,

    #[error("authorization failed: {0}")]
    Authorization(String),

    #[error(transparent)]
    Store(Arc<StoreError>),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LifecycleError {
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            LifecycleError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        LifecycleError::Store(Arc::new(e))
    }
}
