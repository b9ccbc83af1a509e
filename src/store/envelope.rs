//! On-disk credential formats.
//!
//! Current (version 2): a JSON envelope whose plaintext metadata is bound to
//! the ciphertext as associated data.
//!
//! Legacy (implicit version 1): `nonce:authTag:ciphertext`, hex, no AAD. Only
//! ever read, for migration.

use super::StoreError;
use crate::credential::{default_token_type, Credential};
use crate::crypto::{base64_bytes, cipher, DerivationParams};
use crate::keys::KeyVersionRecord;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Envelope format written by this crate
pub const FORMAT_VERSION: u32 = 2;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialEnvelope {
    pub format_version: u32,
    pub algorithm: String,
    pub key_version_id: String,
    pub derivation_params: Option<DerivationParams>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub ciphertext: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub authentication_tag: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl CredentialEnvelope {
    /// Encrypts `credential` under `key` with a fresh nonce.
    pub fn seal(credential: &Credential, key: &KeyVersionRecord) -> Result<Self, StoreError> {
        let mut plaintext = Zeroizing::new(
            serde_json::to_vec(credential).map_err(|e| StoreError::Serialization(e.to_string()))?,
        );

        let aad = associated_data(FORMAT_VERSION, cipher::ALGORITHM, key.version());
        let sealed = cipher::seal(key.key_bytes(), &plaintext, &aad)
            .map_err(|e| StoreError::Serialization(e.to_string()));
        crate::crypto::clear_sensitive_data(&mut [plaintext.as_mut_slice()]);
        let sealed = sealed?;

        Ok(Self {
            format_version: FORMAT_VERSION,
            algorithm: cipher::ALGORITHM.to_string(),
            key_version_id: key.version().to_string(),
            derivation_params: key.derivation().cloned(),
            nonce: sealed.nonce.to_vec(),
            ciphertext: sealed.ciphertext,
            authentication_tag: sealed.tag.to_vec(),
            created_at: Utc::now(),
        })
    }

    /// Decrypts with `key`, which must be the version named in the envelope.
    pub fn open(&self, key: &KeyVersionRecord) -> Result<Credential, StoreError> {
        if key.version() != self.key_version_id {
            return Err(StoreError::Decryption(format!(
                "envelope sealed with key version '{}', not '{}'",
                self.key_version_id,
                key.version()
            )));
        }

        let aad = associated_data(self.format_version, &self.algorithm, &self.key_version_id);
        let plaintext = cipher::open(
            key.key_bytes(),
            &self.nonce,
            &self.ciphertext,
            &self.authentication_tag,
            &aad,
        )
        .map_err(|e| StoreError::Decryption(e.to_string()))?;

        serde_json::from_slice(&plaintext)
            .map_err(|_| StoreError::Decryption("payload is not a valid credential".to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec_pretty(self).map_err(|e| StoreError::Serialization(e.to_string()))
    }
}

/// Metadata authenticated alongside the ciphertext.
fn associated_data(format_version: u32, algorithm: &str, key_version_id: &str) -> Vec<u8> {
    format!("tokenkeep:v{format_version}:{algorithm}:{key_version_id}").into_bytes()
}

/// A parsed legacy `nonce:authTag:ciphertext` string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LegacyEnvelope {
    iv: Vec<u8>,
    tag: Vec<u8>,
    ciphertext: Vec<u8>,
}

impl LegacyEnvelope {
    pub fn parse(text: &str) -> Result<Self, StoreError> {
        let parts: Vec<&str> = text.trim().split(':').collect();
        let [iv, tag, ciphertext] = parts.as_slice() else {
            return Err(StoreError::Decryption(
                "legacy envelope must have three parts".to_string(),
            ));
        };

        let malformed = |part: &str| StoreError::Decryption(format!("legacy {part} is not valid hex"));
        let iv = hex::decode(iv).map_err(|_| malformed("nonce"))?;
        let tag = hex::decode(tag).map_err(|_| malformed("authentication tag"))?;
        let ciphertext = hex::decode(ciphertext).map_err(|_| malformed("ciphertext"))?;

        if !cipher::is_legacy_iv_len(iv.len()) {
            return Err(StoreError::Decryption(format!(
                "legacy nonce has {} bytes",
                iv.len()
            )));
        }
        if tag.len() != cipher::TAG_LEN {
            return Err(StoreError::Decryption(format!(
                "legacy authentication tag has {} bytes",
                tag.len()
            )));
        }
        if ciphertext.is_empty() {
            return Err(StoreError::Decryption("legacy ciphertext is empty".to_string()));
        }

        Ok(Self { iv, tag, ciphertext })
    }

    pub fn open(&self, key: &KeyVersionRecord) -> Result<Credential, StoreError> {
        let plaintext = cipher::open_legacy(key.key_bytes(), &self.iv, &self.ciphertext, &self.tag)
            .map_err(|e| StoreError::Decryption(e.to_string()))?;

        let payload: LegacyTokenPayload = serde_json::from_slice(&plaintext).map_err(|_| {
            StoreError::Decryption("legacy payload is not a valid token object".to_string())
        })?;
        payload.to_credential()
    }
}

/// Token object written by the legacy writer (snake_case, expiry in ms).
#[derive(Deserialize, Zeroize, ZeroizeOnDrop)]
struct LegacyTokenPayload {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expiry_date: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

impl LegacyTokenPayload {
    fn to_credential(&self) -> Result<Credential, StoreError> {
        let access_token = non_empty(&self.access_token).ok_or(StoreError::IncompleteCredential("access_token"))?;
        let refresh_token = non_empty(&self.refresh_token).ok_or(StoreError::IncompleteCredential("refresh_token"))?;
        let expires_at = self
            .expiry_date
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or(StoreError::IncompleteCredential("expiry_date"))?;

        Ok(Credential {
            access_token: access_token.to_string(),
            refresh_token: refresh_token.to_string(),
            expires_at,
            token_type: non_empty(&self.token_type)
                .map(str::to_string)
                .unwrap_or_else(default_token_type),
            scope: self.scope.clone().unwrap_or_default(),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

/// Whatever the credential file currently holds.
#[derive(Clone, Debug)]
pub enum StoredEnvelope {
    Current(CredentialEnvelope),
    Legacy(LegacyEnvelope),
}

/// Classifies raw file bytes. Anything that is neither a well-formed current
/// envelope nor a well-formed legacy string is a decryption failure.
pub fn parse_stored(bytes: &[u8]) -> Result<StoredEnvelope, StoreError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| StoreError::Decryption("credential file is not UTF-8".to_string()))?;
    let trimmed = text.trim();

    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed)
            .map_err(|_| StoreError::Decryption("envelope is not valid JSON".to_string()))?;

        let format_version = value
            .get("formatVersion")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| StoreError::Decryption("envelope has no formatVersion".to_string()))?;
        if format_version != u64::from(FORMAT_VERSION) {
            return Err(StoreError::UnsupportedFormatVersion(
                u32::try_from(format_version).unwrap_or(u32::MAX),
            ));
        }

        let envelope: CredentialEnvelope = serde_json::from_value(value)
            .map_err(|e| StoreError::Decryption(format!("malformed envelope: {e}")))?;
        if envelope.algorithm != cipher::ALGORITHM {
            return Err(StoreError::Decryption(format!(
                "unsupported algorithm '{}'",
                envelope.algorithm
            )));
        }
        return Ok(StoredEnvelope::Current(envelope));
    }

    if trimmed.split(':').count() == 3 {
        return LegacyEnvelope::parse(trimmed).map(StoredEnvelope::Legacy);
    }

    Err(StoreError::Decryption("unrecognized credential format".to_string()))
}

#[cfg(test)]
pub(crate) fn legacy_string(iv: &[u8], tag: &[u8], ciphertext: &[u8]) -> String {
    format!("{}:{}:{}", hex::encode(iv), hex::encode(tag), hex::encode(ciphertext))
}
