//! Key material and identifiers.
//!
//! Plaintext data keys only ever live in [`DataKey`], which zeroes its
//! buffer on drop and never prints its bytes.

use std::fmt;

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{CryptoError, Result};

/// Length of a data encryption key in bytes (AES-256).
pub const KEY_LEN: usize = 32;

/// Random bytes mixed into the key id so the id never reveals key material.
const KEY_ID_SALT_LEN: usize = 8;

/// Hex characters kept from the salted digest.
const KEY_ID_HEX_LEN: usize = 16;

/// A plaintext 256-bit data encryption key.
#[derive(Clone)]
pub struct DataKey(Zeroizing<[u8; KEY_LEN]>);

impl DataKey {
    /// Generate a fresh key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(bytes.as_mut());
        Self(bytes)
    }

    /// Build a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] unless `bytes` is exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != KEY_LEN {
            return Err(CryptoError::InvalidKey(format!(
                "expected {KEY_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    /// Borrow the raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey(<redacted>)")
    }
}

impl PartialEq for DataKey {
    fn eq(&self, other: &Self) -> bool {
        // Test-facing only; the cipher never compares keys.
        self.0.as_ref() == other.0.as_ref()
    }
}

impl Eq for DataKey {}

/// Identifier of a data key, safe to store next to every blob it encrypts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KeyId(pub String);

impl KeyId {
    /// Derive an id for `key`: SHA-256 over the key and fresh random salt,
    /// truncated to 16 hex characters.
    #[must_use]
    pub fn derive(key: &DataKey) -> Self {
        let mut salt = [0u8; KEY_ID_SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let mut hasher = Sha256::new();
        hasher.update(key.as_bytes());
        hasher.update(salt);
        let digest = hex::encode(hasher.finalize());
        Self(digest[..KEY_ID_HEX_LEN].to_string())
    }

    /// Borrow the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KeyId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A data key encrypted under the external master key.
///
/// This is the only form of a data key that is ever persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedKey(pub Vec<u8>);

impl WrappedKey {
    /// Borrow the wrapped bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for WrappedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WrappedKey({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for WrappedKey {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_keys_differ() {
        assert_ne!(DataKey::generate(), DataKey::generate());
    }

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(matches!(
            DataKey::from_slice(&[0u8; 16]),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(DataKey::from_slice(&[7u8; KEY_LEN]).is_ok());
    }

    #[test]
    fn key_id_is_salted_and_short() {
        let key = DataKey::generate();
        let a = KeyId::derive(&key);
        let b = KeyId::derive(&key);
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        // Same key, different salt.
        assert_ne!(a, b);
    }

    #[test]
    fn debug_output_is_redacted() {
        let key = DataKey::from_slice(&[0xAB; KEY_LEN]).expect("key");
        assert_eq!(format!("{key:?}"), "DataKey(<redacted>)");
        assert_eq!(format!("{:?}", WrappedKey(vec![1, 2, 3])), "WrappedKey(3 bytes)");
    }
}
