//! Encrypted, single-file credential persistence.
//!
//! The store owns one file. It holds either a current [`CredentialEnvelope`]
//! or, before migration, a legacy string. Every write goes through
//! [`fs::atomic_write`] under one store-wide lock, so saves, migrations and
//! rotations never interleave and a crash leaves the previous file intact.

mod envelope;
mod error;
mod fs;


pub use envelope::{parse_stored, CredentialEnvelope, LegacyEnvelope, StoredEnvelope, FORMAT_VERSION};
pub use error::StoreError;

use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::credential::Credential;
use crate::crypto::timing_safe_compare;
use crate::keys::{KeyRegistry, KeyVersionRecord};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Re-reads attempted when the file cannot be parsed
const READ_RETRIES: u32 = 3;
const READ_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Envelope metadata, readable without any key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeSummary {
    Current {
        format_version: u32,
        algorithm: String,
        key_version_id: String,
        created_at: DateTime<Utc>,
    },
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// File already holds a current envelope; nothing written
    AlreadyCurrent { key_version: String },
    Migrated {
        backup_path: PathBuf,
        /// Registered version whose key opened the legacy file
        legacy_key_version: String,
        /// Version the new envelope is sealed with
        key_version: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationOutcome {
    pub from_version: String,
    pub to_version: String,
    /// False when the envelope was already sealed with `to_version`
    pub reencrypted: bool,
}

pub struct CredentialStore {
    path: PathBuf,
    registry: Arc<KeyRegistry>,
    audit: AuditLog,
    write_lock: Mutex<()>,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>, registry: Arc<KeyRegistry>, audit: AuditLog) -> Self {
        Self {
            path: path.into(),
            registry,
            audit,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// Encrypts `credential` under the current key and replaces the file.
    pub fn save(&self, credential: &Credential) -> Result<(), StoreError> {
        let _guard = self.lock_writes();

        let result = self
            .registry
            .get_current()
            .map_err(StoreError::from)
            .and_then(|key| self.seal_and_write(credential, &key).map(|_| key));

        let mut event = AuditEvent::new(AuditEventType::Encrypt, result.is_ok());
        match &result {
            Ok(key) => {
                debug!(key_version = %key.version(), path = %self.path.display(), "Credential saved");
                event = event.with("keyVersion", key.version());
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Failed to save credential");
                event = event.with("error", e.class());
            }
        }
        self.audit.record(event);

        result.map(|_| ())
    }

    /// Reads and decrypts the stored credential.
    ///
    /// `Ok(None)` means the file does not exist. Every other problem is an
    /// error, so a tampered or corrupted file is never mistaken for "not
    /// logged in yet".
    pub fn load(&self) -> Result<Option<Credential>, StoreError> {
        let stored = match self.read_stored() {
            Ok(None) => return Ok(None),
            Ok(Some((_, stored))) => Ok(stored),
            Err(e) => Err(e),
        };

        let result = stored.and_then(|stored| match stored {
            StoredEnvelope::Current(envelope) => self
                .open_envelope(&envelope)
                .map(|credential| (credential, envelope.key_version_id)),
            StoredEnvelope::Legacy(_) => Err(StoreError::LegacyFormatDetected),
        });

        let mut event = AuditEvent::new(AuditEventType::Decrypt, result.is_ok());
        match &result {
            Ok((_, key_version)) => {
                event = event.with("keyVersion", key_version.as_str());
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to load credential");
                event = event.with("error", e.class());
            }
        }
        self.audit.record(event);

        result.map(|(credential, _)| Some(credential))
    }

    /// Envelope metadata without decrypting. `None` when the file is absent.
    pub fn inspect(&self) -> Result<Option<EnvelopeSummary>, StoreError> {
        Ok(self.read_stored()?.map(|(_, stored)| match stored {
            StoredEnvelope::Current(envelope) => EnvelopeSummary::Current {
                format_version: envelope.format_version,
                algorithm: envelope.algorithm,
                key_version_id: envelope.key_version_id,
                created_at: envelope.created_at,
            },
            StoredEnvelope::Legacy(_) => EnvelopeSummary::Legacy,
        }))
    }

    /// Converts a legacy file to the current envelope format.
    ///
    /// Order: back up the raw bytes and verify the copy, decrypt with
    /// whichever registered key opens it, re-encrypt under the current key,
    /// and only then replace the original. Any failure after the backup
    /// leaves both files as they were.
    pub fn migrate_legacy(&self) -> Result<MigrationOutcome, StoreError> {
        let _guard = self.lock_writes();

        let result = self.migrate_locked();

        let mut event = AuditEvent::new(AuditEventType::Migrate, result.is_ok())
            .with("path", self.path.display().to_string());
        match &result {
            Ok(MigrationOutcome::AlreadyCurrent { key_version }) => {
                info!(key_version = %key_version, "Credential file already uses the current format");
                event = event
                    .with("alreadyCurrent", true)
                    .with("keyVersion", key_version.as_str());
            }
            Ok(MigrationOutcome::Migrated {
                backup_path,
                legacy_key_version,
                key_version,
            }) => {
                info!(
                    backup = %backup_path.display(),
                    legacy_key_version = %legacy_key_version,
                    key_version = %key_version,
                    "Legacy credential migrated"
                );
                event = event
                    .with("fromFormatVersion", 1)
                    .with("toFormatVersion", FORMAT_VERSION)
                    .with("keyVersion", key_version.as_str())
                    .with("backupPath", backup_path.display().to_string());
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Legacy migration failed");
                event = event.with("error", e.class());
            }
        }
        self.audit.record(event);

        result
    }

    fn migrate_locked(&self) -> Result<MigrationOutcome, StoreError> {
        let (raw, stored) = self
            .read_stored()?
            .ok_or_else(|| StoreError::NotFound(self.path.clone()))?;

        let legacy = match stored {
            StoredEnvelope::Current(envelope) => {
                return Ok(MigrationOutcome::AlreadyCurrent {
                    key_version: envelope.key_version_id,
                })
            }
            StoredEnvelope::Legacy(legacy) => legacy,
        };

        let backup_path = fs::backup_path(&self.path, Utc::now());
        fs::atomic_write(&backup_path, &raw).map_err(StoreError::storage(&backup_path))?;
        let copied = std::fs::read(&backup_path).map_err(StoreError::storage(&backup_path))?;
        if !timing_safe_compare(&copied, &raw) {
            return Err(StoreError::BackupMismatch(backup_path));
        }
        debug!(backup = %backup_path.display(), "Legacy credential backed up");

        let (credential, legacy_key_version) = self.open_legacy(&legacy)?;
        let current = self.registry.get_current()?;
        self.seal_and_write(&credential, &current)?;

        Ok(MigrationOutcome::Migrated {
            backup_path,
            legacy_key_version,
            key_version: current.version().to_string(),
        })
    }

    /// Re-encrypts the stored credential under `new_version`, then makes
    /// `new_version` current. On failure nothing on disk or in the registry
    /// changes.
    pub fn rotate(&self, new_version: &str) -> Result<RotationOutcome, StoreError> {
        let _guard = self.lock_writes();

        let result = self.rotate_locked(new_version);

        let mut event = AuditEvent::new(AuditEventType::Rotate, result.is_ok())
            .with("toVersion", new_version);
        match &result {
            Ok(outcome) => {
                info!(
                    from = %outcome.from_version,
                    to = %outcome.to_version,
                    reencrypted = outcome.reencrypted,
                    "Key rotation complete"
                );
                event = event.with("fromVersion", outcome.from_version.as_str());
            }
            Err(e) => {
                error!(to = %new_version, error = %e, "Key rotation failed");
                event = event.with("error", e.class());
            }
        }
        self.audit.record(event);

        result
    }

    fn rotate_locked(&self, new_version: &str) -> Result<RotationOutcome, StoreError> {
        let target = self.registry.get(new_version)?;

        let (_, stored) = self
            .read_stored()?
            .ok_or_else(|| StoreError::NotFound(self.path.clone()))?;
        let envelope = match stored {
            StoredEnvelope::Current(envelope) => envelope,
            StoredEnvelope::Legacy(_) => return Err(StoreError::LegacyFormatDetected),
        };

        let credential = self.open_envelope(&envelope)?;
        let reencrypted = envelope.key_version_id != new_version;
        if reencrypted {
            self.seal_and_write(&credential, &target)?;
        }
        self.registry.promote(new_version)?;

        Ok(RotationOutcome {
            from_version: envelope.key_version_id,
            to_version: new_version.to_string(),
            reencrypted,
        })
    }

    fn seal_and_write(&self, credential: &Credential, key: &KeyVersionRecord) -> Result<(), StoreError> {
        let envelope = CredentialEnvelope::seal(credential, key)?;
        let bytes = envelope.to_bytes()?;
        fs::atomic_write(&self.path, &bytes).map_err(StoreError::storage(&self.path))
    }

    fn open_envelope(&self, envelope: &CredentialEnvelope) -> Result<Credential, StoreError> {
        let key = self.registry.get(&envelope.key_version_id).map_err(|_| {
            StoreError::Decryption(format!(
                "key version '{}' is not registered",
                envelope.key_version_id
            ))
        })?;
        envelope.open(&key)
    }

    /// Tries the current key first, then every other registered version.
    fn open_legacy(&self, legacy: &LegacyEnvelope) -> Result<(Credential, String), StoreError> {
        for key in self.registry.candidates() {
            match legacy.open(&key) {
                Ok(credential) => return Ok((credential, key.version().to_string())),
                Err(StoreError::Decryption(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Decryption(
            "no registered key opens the legacy credential".to_string(),
        ))
    }

    /// Reads and classifies the file. Unparseable bytes are re-read a few
    /// times first: a reader can race a replace on some platforms.
    fn read_stored(&self) -> Result<Option<(Vec<u8>, StoredEnvelope)>, StoreError> {
        let mut attempt = 0;
        loop {
            let Some(bytes) = fs::read_if_exists(&self.path).map_err(StoreError::storage(&self.path))? else {
                return Ok(None);
            };

            match parse_stored(&bytes) {
                Ok(stored) => return Ok(Some((bytes, stored))),
                Err(e) if attempt < READ_RETRIES => {
                    attempt += 1;
                    debug!(attempt, error = %e, "Credential file unreadable, retrying");
                    // Blocks the caller, async ones included, for at most
                    // READ_RETRIES * READ_RETRY_DELAY and only on unparseable bytes
                    std::thread::sleep(READ_RETRY_DELAY);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn lock_writes(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("path", &self.path)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
