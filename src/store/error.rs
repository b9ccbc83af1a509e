use crate::crypto::KeyError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Key(#[from] KeyError),

    /// Tag mismatch, wrong key, or an envelope that cannot be parsed.
    /// Never treated as "no credentials".
    #[error("credential decryption failed: {0}")]
    Decryption(String),

    #[error("legacy credential format detected; run `tokenkeep migrate` before starting")]
    LegacyFormatDetected,

    #[error("unsupported envelope format version {0}")]
    UnsupportedFormatVersion(u32),

    #[error("stored credential is missing {0}")]
    IncompleteCredential(&'static str),

    #[error("storage error on {path}: {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize: {0}")]
    Serialization(String),

    #[error("no stored credentials at {0}")]
    NotFound(PathBuf),

    #[error("backup at {0} does not match the original")]
    BackupMismatch(PathBuf),
}

impl StoreError {
    /// Short, stable class name for audit metadata and reports.
    pub fn class(&self) -> &'static str {
        match self {
            StoreError::Key(_) => "key_validation",
            StoreError::Decryption(_) | StoreError::IncompleteCredential(_) => "decryption",
            StoreError::LegacyFormatDetected => "legacy_format_detected",
            StoreError::UnsupportedFormatVersion(_) => "unsupported_format_version",
            StoreError::Storage { .. } | StoreError::BackupMismatch(_) => "storage_io",
            StoreError::Serialization(_) => "serialization",
            StoreError::NotFound(_) => "not_found",
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| StoreError::Storage { path, source }
    }
}
