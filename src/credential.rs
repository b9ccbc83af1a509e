//! OAuth credential payload.
//!
//! A [`Credential`] is always fully populated: the store never hands out a
//! value with a missing token. Refresh responses arrive as a [`TokenGrant`],
//! which may omit the refresh token and scope, and are merged into the
//! stored credential with [`Credential::merge_grant`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

/// Credentials for accessing the external API.
///
/// # Security
/// - Serialized form only ever exists inside an encrypted envelope
/// - `Debug` redacts both tokens
/// - Token strings are zeroized on drop
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    /// OAuth access token (used for API requests)
    pub access_token: String,

    /// OAuth refresh token (used to obtain new access tokens)
    pub refresh_token: String,

    /// When the access token expires (UTC)
    #[serde(rename = "expiryTimestamp")]
    #[zeroize(skip)]
    pub expires_at: DateTime<Utc>,

    /// Token type, normally "Bearer"
    pub token_type: String,

    /// Space-delimited scopes granted
    pub scope: String,
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Token endpoint response, normalized.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Absent when the issuer did not rotate the refresh token
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub token_type: Option<String>,
    pub scope: Option<String>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Initial authorization produced no refresh token.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("issuer did not return a refresh token; offline access is required")]
pub struct MissingRefreshToken;

impl Credential {
    /// Builds a credential from the first authorization. A refresh token is
    /// mandatory here: without one the process could never refresh.
    pub fn from_initial_grant(grant: &TokenGrant) -> Result<Self, MissingRefreshToken> {
        let refresh_token = grant
            .refresh_token
            .as_ref()
            .filter(|t| !t.is_empty())
            .ok_or(MissingRefreshToken)?;

        Ok(Self {
            access_token: grant.access_token.clone(),
            refresh_token: refresh_token.clone(),
            expires_at: grant.expires_at,
            token_type: grant.token_type.clone().unwrap_or_else(default_token_type),
            scope: grant.scope.clone().unwrap_or_default(),
        })
    }

    /// Applies a refresh result. Fields the issuer left out keep their stored
    /// values; dropping the refresh token here would lock the process out.
    pub fn merge_grant(&self, grant: &TokenGrant) -> Self {
        Self {
            access_token: grant.access_token.clone(),
            refresh_token: grant
                .refresh_token
                .clone()
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| self.refresh_token.clone()),
            expires_at: grant.expires_at,
            token_type: grant
                .token_type
                .clone()
                .unwrap_or_else(|| self.token_type.clone()),
            scope: grant.scope.clone().unwrap_or_else(|| self.scope.clone()),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True when the access token expires within `window` of `now` (or
    /// already has).
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at <= now + window
    }
}

pub(crate) fn default_token_type() -> String {
    "Bearer".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential() -> Credential {
        Credential {
            access_token: "access-1".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            token_type: "Bearer".to_string(),
            scope: "drive.readonly sheets".to_string(),
        }
    }

    fn grant(refresh_token: Option<&str>) -> TokenGrant {
        TokenGrant {
            access_token: "access-2".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at: Utc::now() + Duration::hours(2),
            token_type: None,
            scope: None,
        }
    }

    #[test]
    fn test_merge_preserves_refresh_token_when_absent() {
        let stored = credential();
        let merged = stored.merge_grant(&grant(None));

        assert_eq!(merged.access_token, "access-2");
        assert_eq!(merged.refresh_token, "refresh-1");
        assert_eq!(merged.token_type, "Bearer");
        assert_eq!(merged.scope, "drive.readonly sheets");
    }

    #[test]
    fn test_merge_treats_empty_refresh_token_as_absent() {
        let merged = credential().merge_grant(&grant(Some("")));
        assert_eq!(merged.refresh_token, "refresh-1");
    }

    #[test]
    fn test_merge_takes_rotated_refresh_token() {
        let merged = credential().merge_grant(&grant(Some("refresh-2")));
        assert_eq!(merged.refresh_token, "refresh-2");
    }

    #[test]
    fn test_initial_grant_requires_refresh_token() {
        assert_eq!(
            Credential::from_initial_grant(&grant(None)).unwrap_err(),
            MissingRefreshToken
        );

        let created = Credential::from_initial_grant(&grant(Some("refresh-9"))).unwrap();
        assert_eq!(created.refresh_token, "refresh-9");
        assert_eq!(created.token_type, "Bearer");
        assert_eq!(created.scope, "");
    }

    #[test]
    fn test_expiry_checks() {
        let now = Utc::now();
        let mut c = credential();
        c.expires_at = now + Duration::minutes(5);

        assert!(!c.is_expired_at(now));
        assert!(c.expires_within(Duration::minutes(10), now));
        assert!(!c.expires_within(Duration::minutes(1), now));
        assert!(c.is_expired_at(now + Duration::minutes(5)));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let debug = format!("{:?}", credential());
        assert!(!debug.contains("access-1"));
        assert!(!debug.contains("refresh-1"));
        assert!(debug.contains("drive.readonly"));
    }

    #[test]
    fn test_serialized_field_names() {
        let json = serde_json::to_string(&credential()).unwrap();
        assert!(json.contains("\"accessToken\""));
        assert!(json.contains("\"refreshToken\""));
        assert!(json.contains("\"expiryTimestamp\""));
        assert!(json.contains("\"tokenType\""));
    }
}
