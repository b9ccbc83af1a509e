//! Versioned key registry.
//!
//! Holds every key version the process knows about and a pointer to the
//! one used for new encryptions. Older versions stay registered so data
//! sealed before a rotation can still be opened.
//!
//! Keys are validated when they are registered (length and algorithm),
//! never at first use.

mod registry;


pub use crate::crypto::KeyError;
pub use registry::{KeyMaterial, KeyRegistry, KeySet, KeySetEntry};

use crate::crypto::{cipher::ALGORITHM, DerivationParams, KEY_LEN};
use chrono::{DateTime, Utc};
use zeroize::Zeroizing;

/// Metadata supplied alongside key bytes at registration.
#[derive(Clone, Debug)]
pub struct KeyMetadata {
    /// Must equal [`ALGORITHM`]
    pub algorithm: String,
    /// Present when the key was derived from a passphrase
    pub derivation: Option<DerivationParams>,
}

impl Default for KeyMetadata {
    fn default() -> Self {
        Self {
            algorithm: ALGORITHM.to_string(),
            derivation: None,
        }
    }
}

/// One registered key version.
pub struct KeyVersionRecord {
    version: String,
    key: Zeroizing<[u8; KEY_LEN]>,
    derivation: Option<DerivationParams>,
    created_at: DateTime<Utc>,
}

impl KeyVersionRecord {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn algorithm(&self) -> &'static str {
        ALGORITHM
    }

    pub fn derivation(&self) -> Option<&DerivationParams> {
        self.derivation.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn key_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for KeyVersionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyVersionRecord")
            .field("version", &self.version)
            .field("key", &"[REDACTED]")
            .field("algorithm", &ALGORITHM)
            .field("derivation", &self.derivation)
            .field("created_at", &self.created_at)
            .finish()
    }
}
