mod keys;

pub use keys::{
    ENV_CLIENT_SECRET, ENV_CURRENT_KEY, ENV_CURRENT_KEY_VERSION, ENV_CURRENT_PASSPHRASE,
    ENV_NEXT_KEY, ENV_NEXT_KEY_VERSION, ENV_NEXT_PASSPHRASE,
};

use crate::crypto::DEFAULT_ITERATIONS;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete tokenkeep configuration
///
/// Nothing secret lives here: key material and the OAuth client secret are
/// read from the environment (see [`KeysConfig::resolve`]).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenkeepConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub oauth: OAuthConfig,
}

/// Where the credential envelope and audit log live
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_credential_path")]
    pub credential_path: PathBuf,
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,
}

fn default_credential_path() -> PathBuf {
    PathBuf::from("credentials.json")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("credential-audit.jsonl")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            credential_path: default_credential_path(),
            audit_log_path: default_audit_log_path(),
        }
    }
}

/// Refresh scheduling and retry bounds
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LifecycleConfig {
    /// Refresh this long before the access token expires
    #[serde(default = "default_refresh_window")]
    pub refresh_window_seconds: u64,
    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_seconds: u64,
    /// Upper bound on a single issuer call
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_seconds: u64,
    /// After retries are exhausted, serve the old token this long before
    /// trying again
    #[serde(default = "default_failure_cooldown")]
    pub failure_cooldown_seconds: u64,
    /// Background refresh loop period
    #[serde(default = "default_check_interval")]
    pub check_interval_seconds: u64,
}

fn default_refresh_window() -> u64 {
    600
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    60
}

fn default_refresh_timeout() -> u64 {
    30
}

fn default_failure_cooldown() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    60
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            refresh_window_seconds: default_refresh_window(),
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_seconds: default_max_delay(),
            refresh_timeout_seconds: default_refresh_timeout(),
            failure_cooldown_seconds: default_failure_cooldown(),
            check_interval_seconds: default_check_interval(),
        }
    }
}

impl LifecycleConfig {
    pub fn refresh_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.refresh_window_seconds).unwrap_or(i64::MAX / 1000))
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_seconds)
    }

    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_secs(self.refresh_timeout_seconds)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_secs(self.failure_cooldown_seconds)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds.max(1))
    }
}

/// Key version ids and derivation parameters. Key bytes and passphrases come
/// from the environment only.
#[derive(Debug, Clone, Deserialize)]
pub struct KeysConfig {
    #[serde(default = "default_current_version")]
    pub current_version: String,
    /// Version to rotate to, when a next key is supplied
    #[serde(default)]
    pub next_version: Option<String>,
    /// PBKDF2 iterations for passphrase-derived keys
    #[serde(default = "default_iteration_count")]
    pub iteration_count: u32,
    /// Base64 salt for the current passphrase
    #[serde(default)]
    pub current_salt: Option<String>,
    /// Base64 salt for the next passphrase
    #[serde(default)]
    pub next_salt: Option<String>,
}

fn default_current_version() -> String {
    "v1".to_string()
}

fn default_iteration_count() -> u32 {
    DEFAULT_ITERATIONS
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            current_version: default_current_version(),
            next_version: None,
            iteration_count: default_iteration_count(),
            current_salt: None,
            next_salt: None,
        }
    }
}

/// OAuth 2.0 endpoints and client registration
#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    #[serde(default)]
    pub auth_url: String,
    #[serde(default)]
    pub token_url: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn default_redirect_uri() -> String {
    "http://localhost".to_string()
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            auth_url: String::new(),
            token_url: String::new(),
            client_id: String::new(),
            redirect_uri: default_redirect_uri(),
            scopes: Vec::new(),
        }
    }
}

impl TokenkeepConfig {
    /// Applies `TOKENKEEP_*_KEY_VERSION` overrides from the environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_with(|name| std::env::var(name).ok());
    }

    pub fn apply_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(ENV_CURRENT_KEY_VERSION).filter(|v| !v.trim().is_empty()) {
            self.keys.current_version = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_NEXT_KEY_VERSION).filter(|v| !v.trim().is_empty()) {
            self.keys.next_version = Some(v.trim().to_string());
        }
    }
}

/// Load configuration from a TOML file, then apply environment overrides.
pub fn load_config(path: &Path) -> Result<TokenkeepConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let mut config: TokenkeepConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    config.apply_env_overrides();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TokenkeepConfig::default();
        assert_eq!(config.storage.credential_path, PathBuf::from("credentials.json"));
        assert_eq!(config.lifecycle.refresh_window_seconds, 600);
        assert_eq!(config.lifecycle.max_retries, 3);
        assert_eq!(config.lifecycle.base_delay_ms, 1000);
        assert_eq!(config.lifecycle.refresh_timeout_seconds, 30);
        assert_eq!(config.keys.current_version, "v1");
        assert_eq!(config.keys.iteration_count, 600_000);
        assert!(config.keys.next_version.is_none());
    }

    #[test]
    fn test_config_deserialization() {
        let toml = r#"
            [storage]
            credential_path = "/var/lib/app/creds.json"
            audit_log_path = "/var/log/app/audit.jsonl"

            [lifecycle]
            refresh_window_seconds = 300
            max_retries = 5

            [keys]
            current_version = "2026-01"
            next_version = "2026-10"
            current_salt = "MDEyMzQ1Njc4OWFiY2RlZg=="

            [oauth]
            auth_url = "https://accounts.example.com/o/oauth2/auth"
            token_url = "https://oauth2.example.com/token"
            client_id = "client-123"
            scopes = ["drive.readonly", "sheets"]
        "#;

        let config: TokenkeepConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.credential_path, PathBuf::from("/var/lib/app/creds.json"));
        assert_eq!(config.lifecycle.refresh_window_seconds, 300);
        assert_eq!(config.lifecycle.max_retries, 5);
        // Unset fields keep their defaults
        assert_eq!(config.lifecycle.base_delay_ms, 1000);
        assert_eq!(config.keys.current_version, "2026-01");
        assert_eq!(config.keys.next_version.as_deref(), Some("2026-10"));
        assert_eq!(config.oauth.scopes, vec!["drive.readonly", "sheets"]);
        assert_eq!(config.oauth.redirect_uri, "http://localhost");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: TokenkeepConfig = toml::from_str("[keys]\ncurrent_version = \"k7\"\n").unwrap();
        assert_eq!(config.keys.current_version, "k7");
        assert_eq!(config.lifecycle, LifecycleConfig::default());
    }

    #[test]
    fn test_version_overrides() {
        let mut config = TokenkeepConfig::default();
        config.apply_overrides_with(|name| match name {
            ENV_CURRENT_KEY_VERSION => Some("2026-04".to_string()),
            ENV_NEXT_KEY_VERSION => Some(" ".to_string()),
            _ => None,
        });
        assert_eq!(config.keys.current_version, "2026-04");
        // Blank values are ignored
        assert!(config.keys.next_version.is_none());
    }

    #[test]
    fn test_load_config_reports_path() {
        let err = load_config(Path::new("/nonexistent/tokenkeep.toml")).unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/tokenkeep.toml"));
    }

    #[test]
    fn test_lifecycle_durations() {
        let lifecycle = LifecycleConfig::default();
        assert_eq!(lifecycle.refresh_window(), chrono::Duration::minutes(10));
        assert_eq!(lifecycle.base_delay(), Duration::from_secs(1));
        assert_eq!(lifecycle.max_delay(), Duration::from_secs(60));
    }
}
