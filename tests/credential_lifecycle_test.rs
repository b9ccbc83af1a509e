// End-to-end tests: config -> context -> store -> lifecycle -> OAuth endpoint

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokenkeep::audit::AuditLog;
use tokenkeep::config::{TokenkeepConfig, ENV_CURRENT_KEY, ENV_NEXT_KEY};
use tokenkeep::issuer::{OAuthIssuer, TokenIssuer};
use tokenkeep::ops::{self, Outcome};
use tokenkeep::{Credential, CredentialContext, LifecycleError, LifecycleState, TokenSource};

const KEY_V1: [u8; 32] = [0x11; 32];
const KEY_V2: [u8; 32] = [0x22; 32];

fn config(dir: &TempDir, current_version: &str) -> TokenkeepConfig {
    let text = format!(
        r#"
[storage]
credential_path = "{dir}/credentials.json"
audit_log_path = "{dir}/audit.jsonl"

[lifecycle]
refresh_window_seconds = 600
max_retries = 1
base_delay_ms = 10

[keys]
current_version = "{current_version}"
next_version = "{next_version}"

[oauth]
client_id = "client-123"
"#,
        dir = dir.path().display(),
        next_version = if current_version == "v1" { "v2" } else { "v1" },
    );
    toml::from_str(&text).unwrap()
}

fn key_env(name: &str, current_version: &str) -> Option<String> {
    let (current, next) = if current_version == "v1" {
        (KEY_V1, KEY_V2)
    } else {
        (KEY_V2, KEY_V1)
    };
    match name {
        n if n == ENV_CURRENT_KEY => Some(BASE64.encode(current)),
        n if n == ENV_NEXT_KEY => Some(BASE64.encode(next)),
        _ => None,
    }
}

fn context(dir: &TempDir, current_version: &str) -> CredentialContext {
    let config = config(dir, current_version);
    let key_set = config
        .keys
        .resolve_with(|name: &str| key_env(name, current_version))
        .unwrap();
    let audit = AuditLog::file(&config.storage.audit_log_path);
    CredentialContext::with_key_set(config, key_set, audit).unwrap()
}

fn issuer(ctx: &CredentialContext, server: &mockito::Server) -> Arc<dyn TokenIssuer> {
    let mut oauth = ctx.config().oauth.clone();
    oauth.token_url = format!("{}/token", server.url());
    Arc::new(OAuthIssuer::new(oauth, None))
}

fn credential(expires_in: Duration) -> Credential {
    Credential {
        access_token: "stored-access-token".to_string(),
        refresh_token: "stored-refresh-token".to_string(),
        expires_at: Utc::now() + expires_in,
        token_type: "Bearer".to_string(),
        scope: "drive".to_string(),
    }
}

fn write_legacy(path: &Path, key: &[u8; 32]) {
    let payload = br#"{"access_token":"legacy-access-token","refresh_token":"legacy-refresh-token","expiry_date":1893456000000,"scope":"drive"}"#;
    let sealed = tokenkeep::crypto::cipher::seal(key, payload, &[]).unwrap();
    let text = format!(
        "{}:{}:{}",
        hex::encode(sealed.nonce),
        hex::encode(sealed.tag),
        hex::encode(&sealed.ciphertext)
    );
    std::fs::write(path, text).unwrap();
}

fn audit_lines(dir: &TempDir) -> Vec<serde_json::Value> {
    std::fs::read_to_string(dir.path().join("audit.jsonl"))
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

/// A stored token inside the refresh window is refreshed through the token
/// endpoint, persisted, then survives a key rotation and a restart.
#[tokio::test]
async fn test_refresh_rotate_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    let token_mock = server
        .mock("POST", "/token")
        .match_body(mockito::Matcher::AllOf(vec![
            mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
            mockito::Matcher::UrlEncoded("refresh_token".into(), "stored-refresh-token".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"access_token":"refreshed-access-token","expires_in":3600,"token_type":"Bearer"}"#)
        .expect(1)
        .create_async()
        .await;

    let ctx = context(&dir, "v1");
    ctx.store().save(&credential(Duration::minutes(2))).unwrap();

    let manager = ctx.start(issuer(&ctx, &server)).unwrap();
    let source: Arc<dyn TokenSource> = Arc::new(manager.clone());
    assert_eq!(source.bearer_token().await.unwrap(), "refreshed-access-token");
    assert_eq!(source.bearer_token().await.unwrap(), "refreshed-access-token");
    token_mock.assert_async().await;

    assert_eq!(ops::verify(&ctx).outcome, Outcome::Success);

    let rotation = ops::rotate_key(&ctx, "v2");
    assert_eq!(rotation.outcome, Outcome::Success);
    assert_eq!(rotation.details["reencrypted"], true);

    // Restart with v2 current and v1 kept as the next/old key
    let restarted = context(&dir, "v2");
    let manager = restarted.start(issuer(&restarted, &server)).unwrap();
    assert_eq!(manager.state(), LifecycleState::Authenticated);
    assert_eq!(manager.get_valid_token().await.unwrap(), "refreshed-access-token");

    let stored = restarted.store().load().unwrap().unwrap();
    assert_eq!(stored.refresh_token, "stored-refresh-token");

    let audit = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
    assert!(!audit.contains("refreshed-access-token"));
    assert!(!audit.contains("stored-refresh-token"));
    assert!(audit_lines(&dir)
        .iter()
        .any(|event| event["eventType"] == "rotate" && event["success"] == true));
}

/// A legacy file blocks startup until it is migrated.
#[tokio::test]
async fn test_legacy_file_blocks_start_until_migrated() {
    let dir = tempfile::tempdir().unwrap();
    let server = mockito::Server::new_async().await;
    let ctx = context(&dir, "v1");
    write_legacy(ctx.store().path(), &KEY_V1);

    let err = ctx.start(issuer(&ctx, &server)).unwrap_err();
    assert!(err.to_string().contains("tokenkeep migrate"));
    assert_eq!(ops::verify(&ctx).outcome, Outcome::Fatal);

    let migration = ops::migrate_legacy(&ctx);
    assert_eq!(migration.outcome, Outcome::Success);
    let backup = migration.details["backupPath"].as_str().unwrap().to_string();
    assert!(Path::new(&backup).exists());

    let manager = ctx.start(issuer(&ctx, &server)).unwrap();
    assert_eq!(manager.get_valid_token().await.unwrap(), "legacy-access-token");
    assert!(audit_lines(&dir)
        .iter()
        .any(|event| event["eventType"] == "migrate" && event["success"] == true));
}

/// `invalid_grant` revokes the session; later calls never reach the issuer.
#[tokio::test]
async fn test_revoked_refresh_token() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    let token_mock = server
        .mock("POST", "/token")
        .with_status(400)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":"invalid_grant","error_description":"Token has been expired or revoked."}"#)
        .expect(1)
        .create_async()
        .await;

    let ctx = context(&dir, "v1");
    ctx.store().save(&credential(Duration::minutes(1))).unwrap();
    let manager = ctx.start(issuer(&ctx, &server)).unwrap();

    assert!(matches!(
        manager.get_valid_token().await,
        Err(LifecycleError::RefreshTerminal(_))
    ));
    assert_eq!(manager.state(), LifecycleState::TokensRevoked);
    assert!(matches!(
        manager.get_valid_token().await,
        Err(LifecycleError::ReauthorizationRequired)
    ));
    token_mock.assert_async().await;
}

/// Server errors are retried; once retries run out a still-valid token is
/// served and the state records the failure.
#[tokio::test]
async fn test_server_errors_fall_back_to_valid_token() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = mockito::Server::new_async().await;
    let token_mock = server
        .mock("POST", "/token")
        .with_status(503)
        .expect(2)
        .create_async()
        .await;

    let ctx = context(&dir, "v1");
    ctx.store().save(&credential(Duration::minutes(5))).unwrap();
    let manager = ctx.start(issuer(&ctx, &server)).unwrap();

    assert_eq!(manager.get_valid_token().await.unwrap(), "stored-access-token");
    assert_eq!(manager.state(), LifecycleState::RefreshFailed);
    assert!(manager.is_authenticated());
    token_mock.assert_async().await;
}
