//! Error types for the memgit core library.

use memgit_crypto::CryptoError;
use thiserror::Error;

/// Top-level error type for all store operations.
///
/// Carries no transport concepts; callers map variants to whatever their
/// protocol needs.
#[derive(Error, Debug)]
pub enum MemgitError {
    /// Unknown branch, blob, commit, task, or data key.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// What was looked up ("branch", "blob", ...).
        kind: &'static str,
        /// The identifier that missed.
        id: String,
    },

    /// Duplicate branch or link, double claim, or a lost compare-and-swap.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Missing required field or malformed input.
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// A ciphertext or backup failed authentication. Never downgraded to
    /// empty or garbage plaintext.
    #[error("Authentication failure: stored ciphertext could not be verified")]
    AuthenticationFailure,

    /// Key-management or database backend unreachable or timed out.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// Stored data contradicts a structural invariant.
    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    /// The task queue is halted; no claims are accepted.
    #[error("Task queue halted: {0}")]
    Halted(String),

    /// SQLite persistence error.
    #[error("Database error: {0}")]
    Database(rusqlite::Error),

    /// Serialization or deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MemgitError {
    /// Shorthand for [`MemgitError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl std::fmt::Display) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

impl From<rusqlite::Error> for MemgitError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                MemgitError::Unavailable(format!("database busy: {err}"))
            }
            _ => MemgitError::Database(err),
        }
    }
}

impl From<CryptoError> for MemgitError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailure => MemgitError::AuthenticationFailure,
            CryptoError::Unavailable(msg) => MemgitError::Unavailable(msg),
            CryptoError::InvalidPassphrase(msg) => MemgitError::Invalid(msg),
            CryptoError::KeyManagement(msg) => {
                MemgitError::Unavailable(format!("key management: {msg}"))
            }
            CryptoError::InvalidKey(msg) | CryptoError::Encoding(msg) => {
                MemgitError::IntegrityViolation(msg)
            }
        }
    }
}

impl From<serde_json::Error> for MemgitError {
    fn from(err: serde_json::Error) -> Self {
        MemgitError::Serialization(err.to_string())
    }
}

/// True when `err` is a UNIQUE/PRIMARY KEY violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

/// Convenience Result type alias.
pub type Result<T> = std::result::Result<T, MemgitError>;
