//! Key derivation and secret-handling primitives.
//!
//! Everything above this layer gets its key bytes from here:
//!
//! - [`derive_key`] turns a passphrase and a salt into a 32-byte key with
//!   PBKDF2-HMAC-SHA256. The iteration count has a hard floor of
//!   [`MIN_ITERATIONS`]; lowering it would weaken every key derived with it.
//! - [`clear_sensitive_data`] overwrites buffers with zeros.
//! - [`timing_safe_compare`] compares byte strings in constant time.
//!
//! The AEAD itself lives in [`cipher`].

pub mod cipher;
mod error;

pub use error::{CipherError, KeyError};

use pbkdf2::pbkdf2_hmac;
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, Zeroizing};

/// Size of every symmetric key in bytes (256 bits)
pub const KEY_LEN: usize = 32;

/// Minimum PBKDF2 iteration count accepted by [`derive_key`]
pub const MIN_ITERATIONS: u32 = 100_000;

/// Iteration count used when the configuration does not name one
pub const DEFAULT_ITERATIONS: u32 = 600_000;

/// Length of salts produced by [`generate_salt`], and the minimum accepted
pub const SALT_LEN: usize = 16;

/// Parameters needed to re-derive a key from its passphrase.
///
/// Non-secret; stored alongside envelopes so an operator can tell which
/// derivation produced the key that sealed them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivationParams {
    pub iteration_count: u32,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
}

/// Output of [`derive_key`]. The key is wiped when this value is dropped.
pub struct DerivedKey {
    pub key: Zeroizing<[u8; KEY_LEN]>,
    pub salt: Vec<u8>,
    pub iteration_count: u32,
}

impl DerivedKey {
    pub fn params(&self) -> DerivationParams {
        DerivationParams {
            iteration_count: self.iteration_count,
            salt: self.salt.clone(),
        }
    }
}

impl std::fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKey")
            .field("key", &"[REDACTED]")
            .field("salt_len", &self.salt.len())
            .field("iteration_count", &self.iteration_count)
            .finish()
    }
}

/// Derives a 32-byte key from `secret` and `salt` with PBKDF2-HMAC-SHA256.
///
/// # Errors
/// * `IterationsBelowMinimum` - `iteration_count < MIN_ITERATIONS`
/// * `SaltTooShort` - salt shorter than `SALT_LEN`
/// * `InvalidKeyMaterial` - empty secret
pub fn derive_key(secret: &[u8], salt: &[u8], iteration_count: u32) -> Result<DerivedKey, KeyError> {
    if iteration_count < MIN_ITERATIONS {
        return Err(KeyError::IterationsBelowMinimum {
            minimum: MIN_ITERATIONS,
            got: iteration_count,
        });
    }
    if salt.len() < SALT_LEN {
        return Err(KeyError::SaltTooShort {
            minimum: SALT_LEN,
            got: salt.len(),
        });
    }
    if secret.is_empty() {
        return Err(KeyError::InvalidKeyMaterial("secret is empty".to_string()));
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(secret, salt, iteration_count, &mut key[..]);

    Ok(DerivedKey {
        key,
        salt: salt.to_vec(),
        iteration_count,
    })
}

/// Returns `SALT_LEN` bytes from the OS random number generator.
pub fn generate_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Overwrites every byte of every buffer with zero.
pub fn clear_sensitive_data(buffers: &mut [&mut [u8]]) {
    for buffer in buffers.iter_mut() {
        buffer.zeroize();
    }
}

/// Constant-time equality. Length is not secret; contents are.
pub fn timing_safe_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

/// Serde adapter storing byte vectors as standard base64 strings.
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}
