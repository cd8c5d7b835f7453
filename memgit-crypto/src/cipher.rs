//! AES-256-GCM sealing of payloads under a data key.
//!
//! Every call to [`seal`] draws a fresh 96-bit nonce from the OS CSPRNG.
//! Nonces are never derived from content or counters.

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;

use crate::error::{CryptoError, Result};
use crate::key::DataKey;

/// Nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// GCM authentication tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Ciphertext plus the nonce it was sealed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// Ciphertext with the GCM tag appended.
    pub ciphertext: Vec<u8>,
    /// The nonce used for this message.
    pub nonce: [u8; NONCE_LEN],
}

/// Generate a fresh random nonce.
#[must_use]
pub fn fresh_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext` under `key` with no associated data.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidKey`] if the cipher rejects the key.
pub fn seal(plaintext: &[u8], key: &DataKey) -> Result<Sealed> {
    let nonce = fresh_nonce();
    let ciphertext = seal_with_nonce(plaintext, key, &nonce)?;
    Ok(Sealed { ciphertext, nonce })
}

pub(crate) fn seal_with_nonce(
    plaintext: &[u8],
    key: &DataKey,
    nonce: &[u8; NONCE_LEN],
) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::InvalidKey("AES-GCM encryption failed".into()))
}

/// Decrypt and verify `ciphertext` sealed under `key` with `nonce`.
///
/// # Errors
///
/// Returns [`CryptoError::AuthenticationFailure`] if the tag does not
/// verify or the nonce has the wrong length. Never returns unverified
/// plaintext.
pub fn open(ciphertext: &[u8], nonce: &[u8], key: &DataKey) -> Result<Vec<u8>> {
    if nonce.len() != NONCE_LEN || ciphertext.len() < TAG_LEN {
        return Err(CryptoError::AuthenticationFailure);
    }
    let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| CryptoError::AuthenticationFailure)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open() {
        let key = DataKey::generate();
        let sealed = seal(b"remember the milk", &key).expect("seal");
        assert_eq!(sealed.ciphertext.len(), "remember the milk".len() + TAG_LEN);
        let plain = open(&sealed.ciphertext, &sealed.nonce, &key).expect("open");
        assert_eq!(plain, b"remember the milk");
    }

    #[test]
    fn nonces_are_fresh_per_call() {
        let key = DataKey::generate();
        let a = seal(b"same", &key).expect("seal");
        let b = seal(b"same", &key).expect("seal");
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn wrong_key_fails_authentication() {
        let sealed = seal(b"payload", &DataKey::generate()).expect("seal");
        let err = open(&sealed.ciphertext, &sealed.nonce, &DataKey::generate())
            .expect_err("wrong key must not open");
        assert!(matches!(err, CryptoError::AuthenticationFailure));
    }

    #[test]
    fn truncated_inputs_fail_authentication() {
        let key = DataKey::generate();
        let sealed = seal(b"payload", &key).expect("seal");
        assert!(matches!(
            open(&sealed.ciphertext, &sealed.nonce[..8], &key),
            Err(CryptoError::AuthenticationFailure)
        ));
        assert!(matches!(
            open(&sealed.ciphertext[..4], &sealed.nonce, &key),
            Err(CryptoError::AuthenticationFailure)
        ));
    }
}
