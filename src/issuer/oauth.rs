//! OAuth 2.0 token endpoint client.

use super::{IssuerError, TokenIssuer};
use crate::config::OAuthConfig;
use crate::credential::TokenGrant;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

/// Lifetime assumed when the issuer omits `expires_in`
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;
/// Longest lifetime accepted from `expires_in`; larger values are clamped
const MAX_EXPIRES_IN_SECS: i64 = 366 * 24 * 3600;

/// OAuth token response (standard OAuth 2.0)
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    scope: Option<String>,
}

/// OAuth error response (RFC 6749 section 5.2)
#[derive(Deserialize, Debug, Default)]
struct ErrorResponse {
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// [`TokenIssuer`] backed by a standard authorization-code flow.
pub struct OAuthIssuer {
    config: OAuthConfig,
    client_secret: Option<Zeroizing<String>>,
    http_client: reqwest::Client,
}

impl OAuthIssuer {
    pub fn new(config: OAuthConfig, client_secret: Option<Zeroizing<String>>) -> Self {
        Self {
            config,
            client_secret,
            http_client: reqwest::Client::new(),
        }
    }

    /// Build authorization URL with state and redirect_uri
    pub fn build_auth_url(&self, state: &str) -> String {
        let scopes = self.config.scopes.join(" ");
        format!(
            "{}?client_id={}&redirect_uri={}&scope={}&state={}&response_type=code&access_type=offline&prompt=consent",
            self.config.auth_url,
            urlencoding::encode(&self.config.client_id),
            urlencoding::encode(&self.config.redirect_uri),
            urlencoding::encode(&scopes),
            urlencoding::encode(state)
        )
    }

    /// Exchange an authorization code for the first grant.
    pub async fn exchange_code(&self, code: &str) -> Result<TokenGrant, IssuerError> {
        let mut form = self.client_form();
        form.insert("grant_type", "authorization_code".to_string());
        form.insert("code", code.to_string());
        form.insert("redirect_uri", self.config.redirect_uri.clone());

        debug!(token_url = %self.config.token_url, "Exchanging authorization code for token");
        self.post_token(form).await
    }

    fn client_form(&self) -> HashMap<&'static str, String> {
        let mut form = HashMap::new();
        form.insert("client_id", self.config.client_id.clone());
        if let Some(secret) = &self.client_secret {
            form.insert("client_secret", secret.as_str().to_string());
        }
        form
    }

    async fn post_token(&self, mut form: HashMap<&'static str, String>) -> Result<TokenGrant, IssuerError> {
        let sent = self
            .http_client
            .post(&self.config.token_url)
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await;
        for value in form.values_mut() {
            zeroize::Zeroize::zeroize(value);
        }

        let response = sent.map_err(|e| IssuerError::Transient(format!("token request failed: {e}")))?;
        let status = response.status();

        if status.is_success() {
            let token: TokenResponse = response
                .json()
                .await
                .map_err(|e| IssuerError::Transient(format!("failed to parse token response: {e}")))?;
            return Ok(to_grant(token));
        }

        let retry_after = retry_after(response.headers());
        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, retry_after, &body))
    }
}

fn to_grant(token: TokenResponse) -> TokenGrant {
    let expires_in = token
        .expires_in
        .unwrap_or(DEFAULT_EXPIRES_IN_SECS)
        .clamp(0, MAX_EXPIRES_IN_SECS);
    debug!(
        has_refresh_token = token.refresh_token.is_some(),
        expires_in,
        "Token endpoint returned a grant"
    );

    TokenGrant {
        access_token: token.access_token,
        refresh_token: token.refresh_token,
        expires_at: Utc::now() + ChronoDuration::seconds(expires_in),
        token_type: token.token_type,
        scope: token.scope,
    }
}

/// Retry-After in delta-seconds form. HTTP-date values are ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn classify_failure(status: StatusCode, retry_after: Option<Duration>, body: &str) -> IssuerError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        warn!(retry_after = ?retry_after, "Token endpoint rate limited");
        return IssuerError::RateLimited { retry_after };
    }
    if status.is_server_error() {
        return IssuerError::Transient(format!("token endpoint returned {status}"));
    }

    let error: ErrorResponse = serde_json::from_str(body).unwrap_or_default();
    let detail = error
        .error_description
        .filter(|d| !d.is_empty())
        .unwrap_or_else(|| status.to_string());

    match error.error.as_str() {
        "invalid_grant" => IssuerError::InvalidGrant(detail),
        "temporarily_unavailable" => IssuerError::Transient(detail),
        "" => IssuerError::Rejected(format!("token endpoint returned {status}")),
        code => IssuerError::Rejected(format!("{code}: {detail}")),
    }
}

/// Pulls the code out of whatever the operator pasted: either the bare code
/// or the full redirect URL.
fn extract_code(input: &str, expected_state: &str) -> Result<String, IssuerError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(IssuerError::Rejected("no authorization code entered".to_string()));
    }

    let Some((_, query)) = input.split_once('?') else {
        return Ok(input.to_string());
    };

    let params: HashMap<String, String> = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| {
            let decoded = urlencoding::decode(v).map(|s| s.into_owned()).unwrap_or_else(|_| v.to_string());
            (k.to_string(), decoded)
        })
        .collect();

    if let Some(state) = params.get("state") {
        if state != expected_state {
            return Err(IssuerError::Rejected("authorization state mismatch".to_string()));
        }
    }
    if let Some(error) = params.get("error") {
        return Err(IssuerError::Rejected(format!("authorization denied: {error}")));
    }
    params
        .get("code")
        .cloned()
        .ok_or_else(|| IssuerError::Rejected("redirect URL has no code parameter".to_string()))
}

#[async_trait]
impl TokenIssuer for OAuthIssuer {
    async fn initial_authorize(&self) -> Result<TokenGrant, IssuerError> {
        let state = Uuid::new_v4().simple().to_string();
        let url = self.build_auth_url(&state);

        eprintln!("Open this URL in a browser and approve access:\n\n  {url}\n");
        eprintln!("Then paste the authorization code (or the full redirect URL):");

        let mut line = Zeroizing::new(String::new());
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| IssuerError::Rejected(format!("failed to read authorization code: {e}")))?;

        let code = Zeroizing::new(extract_code(&line, &state)?);
        let grant = self.exchange_code(&code).await?;
        info!("Authorization code exchanged");
        Ok(grant)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, IssuerError> {
        let mut form = self.client_form();
        form.insert("grant_type", "refresh_token".to_string());
        form.insert("refresh_token", refresh_token.to_string());

        debug!(token_url = %self.config.token_url, "Refreshing OAuth token");
        self.post_token(form).await
    }
}

impl std::fmt::Debug for OAuthIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthIssuer")
            .field("token_url", &self.config.token_url)
            .field("client_id", &self.config.client_id)
            .field("has_client_secret", &self.client_secret.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issuer(token_url: String) -> OAuthIssuer {
        OAuthIssuer::new(
            OAuthConfig {
                auth_url: "https://accounts.example.com/auth".to_string(),
                token_url,
                client_id: "client-123".to_string(),
                redirect_uri: "http://localhost:8765/callback".to_string(),
                scopes: vec!["drive.readonly".to_string(), "email".to_string()],
            },
            Some(Zeroizing::new("shh".to_string())),
        )
    }

    #[tokio::test]
    async fn test_refresh_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "my_refresh".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), "client-123".into()),
                mockito::Matcher::UrlEncoded("client_secret".into(), "shh".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"new_token","expires_in":3600,"token_type":"Bearer"}"#)
            .create_async()
            .await;

        let grant = issuer(format!("{}/token", server.url()))
            .refresh("my_refresh")
            .await
            .unwrap();

        assert_eq!(grant.access_token, "new_token");
        // Provider did not rotate; the lifecycle manager keeps the old one
        assert!(grant.refresh_token.is_none());
        assert!(grant.expires_at > Utc::now() + ChronoDuration::minutes(59));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_out_of_range_expires_in_is_clamped() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"long_lived","expires_in":9223372036854775807}"#)
            .create_async()
            .await;

        let grant = issuer(format!("{}/token", server.url()))
            .refresh("my_refresh")
            .await
            .unwrap();

        assert_eq!(grant.access_token, "long_lived");
        assert!(grant.expires_at > Utc::now() + ChronoDuration::days(365));
        assert!(grant.expires_at <= Utc::now() + ChronoDuration::seconds(MAX_EXPIRES_IN_SECS));
    }

    #[tokio::test]
    async fn test_refresh_negative_expires_in_is_already_expired() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"stale","expires_in":-9223372036854775808}"#)
            .create_async()
            .await;

        let grant = issuer(format!("{}/token", server.url()))
            .refresh("my_refresh")
            .await
            .unwrap();

        assert!(grant.expires_at <= Utc::now());
    }

    #[tokio::test]
    async fn test_refresh_invalid_grant() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
            .create_async()
            .await;

        let err = issuer(format!("{}/token", server.url()))
            .refresh("expired_refresh")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            IssuerError::InvalidGrant("Token has been expired or revoked.".to_string())
        );
        assert!(!err.is_retryable());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_rate_limited_with_retry_after() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(429)
            .with_header("retry-after", "2")
            .create_async()
            .await;

        let err = issuer(format!("{}/token", server.url()))
            .refresh("r")
            .await
            .unwrap_err();

        assert_eq!(
            err,
            IssuerError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_refresh_server_error_is_transient() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(503)
            .create_async()
            .await;

        let err = issuer(format!("{}/token", server.url()))
            .refresh("r")
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::Transient(_)));
    }

    #[tokio::test]
    async fn test_refresh_unreachable_is_transient() {
        let err = issuer("http://127.0.0.1:9/token".to_string())
            .refresh("r")
            .await
            .unwrap_err();
        assert!(matches!(err, IssuerError::Transient(_)));
    }

    #[tokio::test]
    async fn test_exchange_code() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "authorization_code".into()),
                mockito::Matcher::UrlEncoded("code".into(), "4/abc".into()),
                mockito::Matcher::UrlEncoded("redirect_uri".into(), "http://localhost:8765/callback".into()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"a","refresh_token":"r","expires_in":1800,"scope":"drive.readonly email"}"#)
            .create_async()
            .await;

        let grant = issuer(format!("{}/token", server.url()))
            .exchange_code("4/abc")
            .await
            .unwrap();
        assert_eq!(grant.refresh_token.as_deref(), Some("r"));
        assert_eq!(grant.scope.as_deref(), Some("drive.readonly email"));
        mock.assert_async().await;
    }

    #[test]
    fn test_unknown_client_error_is_rejected() {
        let err = classify_failure(
            StatusCode::UNAUTHORIZED,
            None,
            r#"{"error":"invalid_client"}"#,
        );
        assert!(matches!(err, IssuerError::Rejected(_)));
        assert!(!err.is_retryable());

        let err = classify_failure(StatusCode::BAD_REQUEST, None, "not json");
        assert!(matches!(err, IssuerError::Rejected(_)));
    }

    #[test]
    fn test_build_auth_url() {
        let url = issuer("https://oauth2.example.com/token".to_string()).build_auth_url("state-1");
        assert!(url.starts_with("https://accounts.example.com/auth?client_id=client-123"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8765%2Fcallback"));
        assert!(url.contains("scope=drive.readonly%20email"));
        assert!(url.contains("state=state-1"));
        assert!(url.contains("access_type=offline"));
    }

    #[test]
    fn test_extract_code() {
        assert_eq!(extract_code("  4/abc \n", "s").unwrap(), "4/abc");
        assert_eq!(
            extract_code("http://localhost:8765/callback?state=s&code=4%2Fabc", "s").unwrap(),
            "4/abc"
        );
        assert!(extract_code("http://localhost/cb?state=other&code=x", "s").is_err());
        assert!(extract_code("http://localhost/cb?error=access_denied", "s").is_err());
        assert!(extract_code("", "s").is_err());
    }

    #[test]
    fn test_debug_hides_secret() {
        let debug = format!("{:?}", issuer("u".to_string()));
        assert!(!debug.contains("shh"));
    }
}
