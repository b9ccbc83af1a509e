use thiserror::Error;

/// Key validation failures. These are fatal at the point of registration or
/// derivation and are never deferred to first use.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("key must be {expected} bytes, got {got} bytes")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("unsupported algorithm '{0}' (only aes-256-gcm is accepted)")]
    UnsupportedAlgorithm(String),

    #[error("iteration count {got} is below the minimum of {minimum}")]
    IterationsBelowMinimum { minimum: u32, got: u32 },

    #[error("salt must be at least {minimum} bytes, got {got} bytes")]
    SaltTooShort { minimum: usize, got: usize },

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("key version '{0}' not found")]
    NotFound(String),

    #[error("key version '{0}' is already registered with different key bytes")]
    ConflictingVersion(String),

    #[error("no current key version has been promoted")]
    NoCurrentKey,
}

/// AEAD failures. `Authentication` covers both a wrong key and tampered data;
/// the cipher cannot tell them apart and neither can callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("encryption failed")]
    Encrypt,

    #[error("authentication failed (wrong key or tampered data)")]
    Authentication,

    #[error("invalid {field} length: expected {expected}, got {got}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        got: usize,
    },
}
