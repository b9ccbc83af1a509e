//! Process-wide wiring for the credential subsystem.
//!
//! Everything is built once from a [`TokenkeepConfig`] and handed out by
//! reference. There are no globals: tests build as many contexts as they
//! like side by side.

use crate::audit::AuditLog;
use crate::config::{TokenkeepConfig, ENV_CLIENT_SECRET};
use crate::issuer::{OAuthIssuer, TokenIssuer};
use crate::keys::{KeyRegistry, KeySet};
use crate::lifecycle::{LifecycleError, LifecycleManager, LifecycleState};
use crate::store::{CredentialStore, StoreError};
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::{error, info};
use zeroize::Zeroizing;

pub struct CredentialContext {
    config: TokenkeepConfig,
    audit: AuditLog,
    registry: Arc<KeyRegistry>,
    store: Arc<CredentialStore>,
}

impl CredentialContext {
    /// Resolves key material from the environment and opens the store and
    /// audit log at the configured paths.
    pub fn from_config(config: TokenkeepConfig) -> Result<Self> {
        let key_set = config
            .keys
            .resolve()
            .context("Failed to resolve encryption keys")?;
        let audit = AuditLog::file(&config.storage.audit_log_path);
        Self::with_key_set(config, key_set, audit)
    }

    /// Builds a context from an explicit key set.
    pub fn with_key_set(config: TokenkeepConfig, key_set: KeySet, audit: AuditLog) -> Result<Self> {
        let registry = KeyRegistry::from_key_set(key_set, audit.clone())
            .context("Failed to register encryption keys")?;
        let registry = Arc::new(registry);

        let store = Arc::new(CredentialStore::new(
            &config.storage.credential_path,
            Arc::clone(&registry),
            audit.clone(),
        ));

        info!(
            credential_path = %config.storage.credential_path.display(),
            current_key_version = ?registry.current_version(),
            key_versions = registry.versions().len(),
            "Credential context ready"
        );

        Ok(Self {
            config,
            audit,
            registry,
            store,
        })
    }

    pub fn config(&self) -> &TokenkeepConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLog {
        &self.audit
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// OAuth issuer for the configured endpoints. The client secret comes
    /// from `TOKENKEEP_OAUTH_CLIENT_SECRET` when set.
    pub fn oauth_issuer(&self) -> OAuthIssuer {
        let secret = std::env::var(ENV_CLIENT_SECRET)
            .ok()
            .filter(|s| !s.is_empty())
            .map(Zeroizing::new);
        OAuthIssuer::new(self.config.oauth.clone(), secret)
    }

    /// Lifecycle manager over this context's store. Not initialized.
    pub fn lifecycle(&self, issuer: Arc<dyn TokenIssuer>) -> LifecycleManager {
        LifecycleManager::new(Arc::clone(&self.store), issuer, self.config.lifecycle.clone())
    }

    /// Builds and initializes the lifecycle manager.
    ///
    /// A legacy credential file is fatal: nothing may be served until
    /// `tokenkeep migrate` has converted it. A file that fails to decrypt is
    /// fatal too, since treating it as absent would discard the credential.
    pub fn start(&self, issuer: Arc<dyn TokenIssuer>) -> Result<LifecycleManager> {
        let manager = self.lifecycle(issuer);

        match manager.initialize() {
            Ok(state) => {
                if state == LifecycleState::Unauthenticated {
                    info!("No stored credentials; run `tokenkeep authorize`");
                }
                Ok(manager)
            }
            Err(LifecycleError::Store(e)) if matches!(*e, StoreError::LegacyFormatDetected) => {
                error!(
                    path = %self.store.path().display(),
                    "Legacy credential format detected; refusing to start"
                );
                bail!(
                    "credential file {} uses the legacy format; run `tokenkeep migrate` before starting",
                    self.store.path().display()
                )
            }
            Err(e) => Err(e).context("Failed to load stored credentials"),
        }
    }
}

impl std::fmt::Debug for CredentialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialContext")
            .field("credential_path", &self.config.storage.credential_path)
            .field("current_key_version", &self.registry.current_version())
            .finish_non_exhaustive()
    }
}
