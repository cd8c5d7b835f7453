//! Encryption error types.

use thiserror::Error;

/// Errors that can occur while wrapping, caching, or using data keys.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The AEAD tag did not verify: tampered ciphertext, wrong key, wrong
    /// nonce, or a wrong backup passphrase.
    #[error("Authentication failure: ciphertext could not be verified")]
    AuthenticationFailure,

    /// The key-management backend could not be reached.
    #[error("Key management backend unavailable: {0}")]
    Unavailable(String),

    /// The key-management backend answered but refused the request.
    #[error("Key management request rejected: {0}")]
    KeyManagement(String),

    /// Key material of the wrong shape (length, encoding).
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Passphrase does not meet the backup policy.
    #[error("Invalid passphrase: {0}")]
    InvalidPassphrase(String),

    /// Base64/JSON/UTF-8 decoding of an envelope or backend response failed.
    #[error("Encoding error: {0}")]
    Encoding(String),
}

impl From<reqwest::Error> for CryptoError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            CryptoError::Unavailable(err.to_string())
        } else {
            CryptoError::KeyManagement(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(err: base64::DecodeError) -> Self {
        CryptoError::Encoding(err.to_string())
    }
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, CryptoError>;
