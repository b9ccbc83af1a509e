use super::{KeyError, KeyMetadata, KeyVersionRecord};
use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::crypto::{self, cipher::ALGORITHM, timing_safe_compare, KEY_LEN};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Where a key version's bytes come from.
pub enum KeyMaterial {
    /// 32 raw key bytes
    Raw(Zeroizing<Vec<u8>>),
    /// A passphrase stretched with PBKDF2 at registry construction
    Passphrase {
        secret: Zeroizing<String>,
        salt: Vec<u8>,
        iteration_count: u32,
    },
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMaterial::Raw(_) => f.write_str("Raw([REDACTED])"),
            KeyMaterial::Passphrase { iteration_count, .. } => f
                .debug_struct("Passphrase")
                .field("secret", &"[REDACTED]")
                .field("iteration_count", iteration_count)
                .finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
pub struct KeySetEntry {
    pub version: String,
    pub material: KeyMaterial,
}

/// Every key version the process should know about, built once at startup.
#[derive(Debug)]
pub struct KeySet {
    /// Version used for new encryptions
    pub current: String,
    pub entries: Vec<KeySetEntry>,
}

#[derive(Default)]
struct RegistryState {
    records: BTreeMap<String, Arc<KeyVersionRecord>>,
    current: Option<String>,
}

/// Thread-safe registry of key versions.
///
/// Lookups hand out `Arc<KeyVersionRecord>` so a caller holding a record is
/// unaffected by a concurrent promotion.
pub struct KeyRegistry {
    state: RwLock<RegistryState>,
    audit: AuditLog,
}

impl KeyRegistry {
    /// Creates an empty registry with no current version.
    pub fn new(audit: AuditLog) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            audit,
        }
    }

    /// Registers every entry of `key_set`, then promotes `key_set.current`.
    pub fn from_key_set(key_set: KeySet, audit: AuditLog) -> Result<Self, KeyError> {
        let registry = Self::new(audit);

        for entry in key_set.entries {
            match entry.material {
                KeyMaterial::Raw(bytes) => {
                    registry.register_key(&entry.version, &bytes, KeyMetadata::default())?;
                }
                KeyMaterial::Passphrase {
                    secret,
                    salt,
                    iteration_count,
                } => {
                    let derived = crypto::derive_key(secret.as_bytes(), &salt, iteration_count)?;
                    registry.register_key(
                        &entry.version,
                        &derived.key[..],
                        KeyMetadata {
                            algorithm: ALGORITHM.to_string(),
                            derivation: Some(derived.params()),
                        },
                    )?;
                }
            }
        }

        registry.promote(&key_set.current)?;
        Ok(registry)
    }

    /// Registers a key version.
    ///
    /// # Errors
    /// * `InvalidKeyLength` - `key_bytes` is not exactly 32 bytes
    /// * `UnsupportedAlgorithm` - `metadata.algorithm` is not `aes-256-gcm`
    /// * `ConflictingVersion` - `version` exists with different bytes
    ///
    /// Re-registering a version with identical bytes is a no-op.
    pub fn register_key(
        &self,
        version: &str,
        key_bytes: &[u8],
        metadata: KeyMetadata,
    ) -> Result<(), KeyError> {
        let result = self.insert(version, key_bytes, metadata);

        let mut event = AuditEvent::new(AuditEventType::KeyRegistered, result.is_ok())
            .with("keyVersion", version);
        if let Err(e) = &result {
            warn!(key_version = %version, error = %e, "Key registration rejected");
            event = event.with("error", e.to_string());
        }
        self.audit.record(event);

        result
    }

    fn insert(&self, version: &str, key_bytes: &[u8], metadata: KeyMetadata) -> Result<(), KeyError> {
        if version.trim().is_empty() {
            return Err(KeyError::InvalidKeyMaterial("key version id is empty".to_string()));
        }
        if key_bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidKeyLength {
                expected: KEY_LEN,
                got: key_bytes.len(),
            });
        }
        if metadata.algorithm != ALGORITHM {
            return Err(KeyError::UnsupportedAlgorithm(metadata.algorithm));
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = state.records.get(version) {
            if timing_safe_compare(&existing.key_bytes()[..], key_bytes) {
                debug!(key_version = %version, "Key version already registered");
                return Ok(());
            }
            return Err(KeyError::ConflictingVersion(version.to_string()));
        }

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(key_bytes);

        state.records.insert(
            version.to_string(),
            Arc::new(KeyVersionRecord {
                version: version.to_string(),
                key,
                derivation: metadata.derivation,
                created_at: Utc::now(),
            }),
        );

        info!(key_version = %version, "Key version registered");
        Ok(())
    }

    /// Returns the version used for new encryptions.
    pub fn get_current(&self) -> Result<Arc<KeyVersionRecord>, KeyError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let current = state.current.as_ref().ok_or(KeyError::NoCurrentKey)?;
        state
            .records
            .get(current)
            .cloned()
            .ok_or_else(|| KeyError::NotFound(current.clone()))
    }

    pub fn get(&self, version: &str) -> Result<Arc<KeyVersionRecord>, KeyError> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .records
            .get(version)
            .cloned()
            .ok_or_else(|| KeyError::NotFound(version.to_string()))
    }

    /// Makes `version` current. Every other version stays available for
    /// decryption.
    pub fn promote(&self, version: &str) -> Result<(), KeyError> {
        let result = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            if state.records.contains_key(version) {
                let previous = state.current.replace(version.to_string());
                Ok(previous)
            } else {
                Err(KeyError::NotFound(version.to_string()))
            }
        };

        let mut event = AuditEvent::new(AuditEventType::KeyPromoted, result.is_ok())
            .with("keyVersion", version);
        match &result {
            Ok(previous) => {
                if let Some(previous) = previous {
                    event = event.with("previousVersion", previous.as_str());
                }
                info!(
                    key_version = %version,
                    previous = ?previous,
                    "Key version promoted to current"
                );
            }
            Err(e) => {
                warn!(key_version = %version, error = %e, "Key promotion rejected");
                event = event.with("error", e.to_string());
            }
        }
        self.audit.record(event);

        result.map(|_| ())
    }

    pub fn current_version(&self) -> Option<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .current
            .clone()
    }

    /// All registered versions, sorted.
    pub fn versions(&self) -> Vec<String> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .keys()
            .cloned()
            .collect()
    }

    /// Current version first, then the rest. Used when the version that
    /// sealed some data is unknown.
    pub(crate) fn candidates(&self) -> Vec<Arc<KeyVersionRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<Arc<KeyVersionRecord>> = Vec::with_capacity(state.records.len());
        if let Some(current) = state.current.as_ref().and_then(|v| state.records.get(v)) {
            records.push(Arc::clone(current));
        }
        for (version, record) in &state.records {
            if state.current.as_deref() != Some(version.as_str()) {
                records.push(Arc::clone(record));
            }
        }
        records
    }
}

impl std::fmt::Debug for KeyRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRegistry")
            .field("versions", &self.versions())
            .field("current", &self.current_version())
            .finish()
    }
}
