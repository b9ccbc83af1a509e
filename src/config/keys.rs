//! Key material from the environment.

use super::KeysConfig;
use crate::keys::{KeyMaterial, KeySet, KeySetEntry};
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tracing::{debug, warn};
use zeroize::Zeroizing;

pub const ENV_CURRENT_KEY: &str = "TOKENKEEP_CURRENT_KEY";
pub const ENV_CURRENT_PASSPHRASE: &str = "TOKENKEEP_CURRENT_PASSPHRASE";
pub const ENV_NEXT_KEY: &str = "TOKENKEEP_NEXT_KEY";
pub const ENV_NEXT_PASSPHRASE: &str = "TOKENKEEP_NEXT_PASSPHRASE";
pub const ENV_CURRENT_KEY_VERSION: &str = "TOKENKEEP_CURRENT_KEY_VERSION";
pub const ENV_NEXT_KEY_VERSION: &str = "TOKENKEEP_NEXT_KEY_VERSION";
pub const ENV_CLIENT_SECRET: &str = "TOKENKEEP_OAUTH_CLIENT_SECRET";

struct Slot<'a> {
    label: &'static str,
    key_var: &'static str,
    passphrase_var: &'static str,
    salt: Option<&'a str>,
    salt_field: &'static str,
}

impl KeysConfig {
    /// Builds the key set from the process environment.
    pub fn resolve(&self) -> Result<KeySet> {
        self.resolve_with(|name| std::env::var(name).ok())
    }

    /// Builds the key set, reading secrets through `lookup`.
    ///
    /// The current version must have material. A next version is optional:
    /// when `next_version` is set but no next key is supplied it is skipped
    /// with a warning, since only `rotate` needs it.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<KeySet>
    where
        F: Fn(&str) -> Option<String>,
    {
        let current = Slot {
            label: "current",
            key_var: ENV_CURRENT_KEY,
            passphrase_var: ENV_CURRENT_PASSPHRASE,
            salt: self.current_salt.as_deref(),
            salt_field: "keys.current_salt",
        };
        let next = Slot {
            label: "next",
            key_var: ENV_NEXT_KEY,
            passphrase_var: ENV_NEXT_PASSPHRASE,
            salt: self.next_salt.as_deref(),
            salt_field: "keys.next_salt",
        };

        let mut entries = Vec::with_capacity(2);

        let Some(material) = self.material(&current, &lookup)? else {
            bail!(
                "no key material for current version '{}': set {} or {}",
                self.current_version,
                ENV_CURRENT_KEY,
                ENV_CURRENT_PASSPHRASE
            );
        };
        entries.push(KeySetEntry {
            version: self.current_version.clone(),
            material,
        });

        let next_material = self.material(&next, &lookup)?;
        match (&self.next_version, next_material) {
            (Some(version), Some(material)) => {
                if *version == self.current_version {
                    bail!("keys.next_version must differ from keys.current_version ('{version}')");
                }
                entries.push(KeySetEntry {
                    version: version.clone(),
                    material,
                });
            }
            (Some(version), None) => {
                warn!(next_version = %version, "Next key version configured without key material; skipping");
            }
            (None, Some(_)) => {
                bail!("{ENV_NEXT_KEY} or {ENV_NEXT_PASSPHRASE} is set but keys.next_version is not");
            }
            (None, None) => {}
        }

        debug!(
            current = %self.current_version,
            versions = entries.len(),
            "Resolved key set"
        );

        Ok(KeySet {
            current: self.current_version.clone(),
            entries,
        })
    }

    fn material<F>(&self, slot: &Slot<'_>, lookup: &F) -> Result<Option<KeyMaterial>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let raw = lookup(slot.key_var).map(Zeroizing::new).filter(|v| !v.trim().is_empty());
        let passphrase = lookup(slot.passphrase_var)
            .map(Zeroizing::new)
            .filter(|v| !v.is_empty());

        match (raw, passphrase) {
            (Some(_), Some(_)) => bail!(
                "both {} and {} are set for the {} key; set exactly one",
                slot.key_var,
                slot.passphrase_var,
                slot.label
            ),
            (Some(raw), None) => Ok(Some(KeyMaterial::Raw(decode_key(&raw, slot.key_var)?))),
            (None, Some(secret)) => {
                let salt = slot
                    .salt
                    .with_context(|| format!("{} requires {} in the config", slot.passphrase_var, slot.salt_field))?;
                let salt = BASE64
                    .decode(salt.trim())
                    .with_context(|| format!("{} is not valid base64", slot.salt_field))?;
                Ok(Some(KeyMaterial::Passphrase {
                    secret,
                    salt,
                    iteration_count: self.iteration_count,
                }))
            }
            (None, None) => Ok(None),
        }
    }
}

/// Decodes a base64 key. Length is checked by the registry at registration.
fn decode_key(encoded: &str, var: &str) -> Result<Zeroizing<Vec<u8>>> {
    let bytes = BASE64
        .decode(encoded.trim())
        .with_context(|| format!("Failed to decode base64 key from {var}"))?;
    Ok(Zeroizing::new(bytes))
}
