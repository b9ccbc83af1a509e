use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Authentication state of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// No credential loaded
    Unauthenticated,
    Authenticated,
    /// Refresh failed and the access token is past expiry
    TokenExpired,
    /// Refresh failed but the access token is still valid
    RefreshFailed,
    /// Issuer rejected the refresh token; only `authorize` leaves this state
    TokensRevoked,
}

impl LifecycleState {
    /// True while a usable access token exists.
    pub fn is_authenticated(self) -> bool {
        matches!(self, LifecycleState::Authenticated | LifecycleState::RefreshFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Unauthenticated => "unauthenticated",
            LifecycleState::Authenticated => "authenticated",
            LifecycleState::TokenExpired => "token_expired",
            LifecycleState::RefreshFailed => "refresh_failed",
            LifecycleState::TokensRevoked => "tokens_revoked",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateTransition {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Delay before retry number `attempt` (1-based): exponential from `base`,
/// capped at `max`, and never shorter than the issuer's hint.
pub(crate) fn backoff_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    hint: Option<Duration>,
) -> Duration {
    let exponent = attempt.saturating_sub(1).min(31);
    let computed = base.saturating_mul(1u32 << exponent).min(max);
    match hint {
        Some(hint) => computed.max(hint),
        None => computed,
    }
}
