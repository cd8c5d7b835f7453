//! In-process master key backend.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::cipher::{self, NONCE_LEN};
use crate::error::{CryptoError, Result};
use crate::key::DataKey;
use crate::kms::KeyManagementClient;

/// Wraps data keys with AES-256-GCM under a master key held in memory.
///
/// Wrapped form: `nonce (12 bytes) || ciphertext+tag`.
pub struct LocalKms {
    master: DataKey,
}

impl LocalKms {
    /// Use an existing master key.
    #[must_use]
    pub fn new(master: DataKey) -> Self {
        Self { master }
    }

    /// Generate a throwaway master key. Wrapped keys die with the process.
    #[must_use]
    pub fn ephemeral() -> Self {
        Self::new(DataKey::generate())
    }

    /// Load the master key from a base64 string (32 bytes once decoded).
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] for bad base64 and
    /// [`CryptoError::InvalidKey`] for the wrong length.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = zeroize::Zeroizing::new(STANDARD.decode(encoded.trim())?);
        Ok(Self::new(DataKey::from_slice(&bytes)?))
    }
}

impl std::fmt::Debug for LocalKms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalKms").finish_non_exhaustive()
    }
}

impl KeyManagementClient for LocalKms {
    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = cipher::seal(plaintext, &self.master)?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.ciphertext.len());
        out.extend_from_slice(&sealed.nonce);
        out.extend_from_slice(&sealed.ciphertext);
        Ok(out)
    }

    fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < NONCE_LEN {
            return Err(CryptoError::AuthenticationFailure);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        cipher::open(body, nonce, &self.master)
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap() {
        let kms = LocalKms::ephemeral();
        let wrapped = kms.wrap(b"0123456789abcdef0123456789abcdef").expect("wrap");
        assert_ne!(&wrapped[NONCE_LEN..], b"0123456789abcdef0123456789abcdef");
        let unwrapped = kms.unwrap(&wrapped).expect("unwrap");
        assert_eq!(unwrapped, b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn other_master_key_cannot_unwrap() {
        let wrapped = LocalKms::ephemeral().wrap(b"secret").expect("wrap");
        assert!(matches!(
            LocalKms::ephemeral().unwrap(&wrapped),
            Err(CryptoError::AuthenticationFailure)
        ));
    }

    #[test]
    fn base64_master_key() {
        let encoded = STANDARD.encode([9u8; 32]);
        let a = LocalKms::from_base64(&encoded).expect("kms");
        let b = LocalKms::from_base64(&format!("  {encoded}\n")).expect("kms");
        let wrapped = a.wrap(b"k").expect("wrap");
        assert_eq!(b.unwrap(&wrapped).expect("unwrap"), b"k");

        assert!(matches!(
            LocalKms::from_base64("not base64!"),
            Err(CryptoError::Encoding(_))
        ));
        assert!(matches!(
            LocalKms::from_base64(&STANDARD.encode([1u8; 8])),
            Err(CryptoError::InvalidKey(_))
        ));
    }
}
