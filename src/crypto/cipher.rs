//! AES-256-GCM encryption for credential envelopes.
//!
//! Every seal draws a fresh 96-bit nonce from the OS RNG, so a nonce is never
//! reused under the same key. The tag is kept detached from the ciphertext
//! because the envelope stores them as separate fields.

use super::{CipherError, KEY_LEN};
use aes_gcm::{
    aead::{consts::U16, generic_array::GenericArray, AeadInPlace, KeyInit},
    aes::Aes256,
    Aes256Gcm, AesGcm,
};
use rand::{rngs::OsRng, RngCore};
use zeroize::Zeroizing;

/// The only algorithm identifier accepted anywhere in the crate
pub const ALGORITHM: &str = "aes-256-gcm";

/// Size of the nonce in bytes (96 bits, standard for GCM)
pub const NONCE_LEN: usize = 12;

/// Size of the authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// IV length some legacy writers used with GCM
const LEGACY_WIDE_IV_LEN: usize = 16;

/// GCM over AES-256 with a 128-bit IV, needed only to read legacy files.
type Aes256GcmWideIv = AesGcm<Aes256, U16>;

/// Output of [`seal`]
#[derive(Debug, Clone)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Encrypts `plaintext` under `key`, authenticating `aad` alongside it.
pub fn seal(key: &[u8; KEY_LEN], plaintext: &[u8], aad: &[u8]) -> Result<Sealed, CipherError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidLength {
        field: "key",
        expected: KEY_LEN,
        got: key.len(),
    })?;

    // Generate random nonce (never reuse!)
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let mut buffer = plaintext.to_vec();
    let tag = match cipher.encrypt_in_place_detached(GenericArray::from_slice(&nonce), aad, &mut buffer) {
        Ok(tag) => tag,
        Err(_) => {
            super::clear_sensitive_data(&mut [&mut buffer[..]]);
            return Err(CipherError::Encrypt);
        }
    };

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(Sealed {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypts and authenticates. Fails closed: no bytes are returned unless the
/// tag verifies over both the ciphertext and `aad`.
pub fn open(
    key: &[u8; KEY_LEN],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    check_len("nonce", nonce, NONCE_LEN)?;
    check_len("tag", tag, TAG_LEN)?;
    open_detached::<Aes256Gcm>(key, nonce, ciphertext, tag, aad)
}

/// Decrypts a legacy payload: no associated data, and a 12 or 16 byte IV.
pub fn open_legacy(
    key: &[u8; KEY_LEN],
    iv: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    check_len("tag", tag, TAG_LEN)?;
    match iv.len() {
        NONCE_LEN => open_detached::<Aes256Gcm>(key, iv, ciphertext, tag, &[]),
        LEGACY_WIDE_IV_LEN => open_detached::<Aes256GcmWideIv>(key, iv, ciphertext, tag, &[]),
        got => Err(CipherError::InvalidLength {
            field: "iv",
            expected: NONCE_LEN,
            got,
        }),
    }
}

/// True when `len` is an IV length the legacy format could have produced.
pub fn is_legacy_iv_len(len: usize) -> bool {
    len == NONCE_LEN || len == LEGACY_WIDE_IV_LEN
}

fn open_detached<C: AeadInPlace + KeyInit>(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    aad: &[u8],
) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let cipher = C::new_from_slice(key).map_err(|_| CipherError::InvalidLength {
        field: "key",
        expected: KEY_LEN,
        got: key.len(),
    })?;

    let mut buffer = Zeroizing::new(ciphertext.to_vec());
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(nonce),
            aad,
            buffer.as_mut_slice(),
            GenericArray::from_slice(tag),
        )
        .map_err(|_| CipherError::Authentication)?;

    Ok(buffer)
}

fn check_len(field: &'static str, bytes: &[u8], expected: usize) -> Result<(), CipherError> {
    if bytes.len() != expected {
        return Err(CipherError::InvalidLength {
            field,
            expected,
            got: bytes.len(),
        });
    }
    Ok(())
}

/// Encrypts with a 16-byte IV and no AAD, the way legacy writers did.
#[cfg(test)]
pub(crate) fn seal_legacy_wide_iv(
    key: &[u8; KEY_LEN],
    iv: &[u8; LEGACY_WIDE_IV_LEN],
    plaintext: &[u8],
) -> (Vec<u8>, [u8; TAG_LEN]) {
    let cipher = Aes256GcmWideIv::new_from_slice(key).unwrap();
    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(iv), &[], &mut buffer)
        .unwrap();
    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    (buffer, tag_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; KEY_LEN] = [7u8; KEY_LEN];

    #[test]
    fn test_seal_open_roundtrip() {
        let sealed = seal(&KEY, b"my-secret-access-token-12345", b"aad").expect("seal failed");
        assert_ne!(sealed.ciphertext, b"my-secret-access-token-12345");

        let opened = open(&KEY, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"aad")
            .expect("open failed");
        assert_eq!(opened.as_slice(), b"my-secret-access-token-12345");
    }

    #[test]
    fn test_different_nonces() {
        let first = seal(&KEY, b"same-plaintext", b"").unwrap();
        let second = seal(&KEY, b"same-plaintext", b"").unwrap();

        assert_ne!(first.nonce, second.nonce);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&KEY, b"secret", b"").unwrap();
        let other = [1u8; KEY_LEN];
        assert_eq!(
            open(&other, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"").unwrap_err(),
            CipherError::Authentication
        );
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let sealed = seal(&KEY, b"secret", b"v2|aes-256-gcm|key-a").unwrap();
        assert!(open(&KEY, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"v2|aes-256-gcm|key-b").is_err());
    }

    #[test]
    fn test_tampered_tag_fails() {
        let mut sealed = seal(&KEY, b"secret", b"").unwrap();
        sealed.tag[0] ^= 0x01;
        assert!(open(&KEY, &sealed.nonce, &sealed.ciphertext, &sealed.tag, b"").is_err());
    }

    #[test]
    fn test_bad_lengths_rejected_without_panic() {
        let sealed = seal(&KEY, b"secret", b"").unwrap();
        assert!(matches!(
            open(&KEY, &sealed.nonce[..8], &sealed.ciphertext, &sealed.tag, b""),
            Err(CipherError::InvalidLength { field: "nonce", .. })
        ));
        assert!(matches!(
            open(&KEY, &sealed.nonce, &sealed.ciphertext, &sealed.tag[..4], b""),
            Err(CipherError::InvalidLength { field: "tag", .. })
        ));
        assert!(matches!(
            open_legacy(&KEY, &[0u8; 5], &sealed.ciphertext, &sealed.tag),
            Err(CipherError::InvalidLength { field: "iv", .. })
        ));
    }

    #[test]
    fn test_legacy_open_accepts_both_iv_sizes() {
        let narrow = seal(&KEY, b"legacy-narrow", b"").unwrap();
        let opened = open_legacy(&KEY, &narrow.nonce, &narrow.ciphertext, &narrow.tag).unwrap();
        assert_eq!(opened.as_slice(), b"legacy-narrow");

        let iv = [9u8; 16];
        let (ciphertext, tag) = seal_legacy_wide_iv(&KEY, &iv, b"legacy-wide");
        let opened = open_legacy(&KEY, &iv, &ciphertext, &tag).unwrap();
        assert_eq!(opened.as_slice(), b"legacy-wide");
    }
}
