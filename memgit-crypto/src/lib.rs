//! # memgit-crypto: Envelope Encryption for memgit
//!
//! Protects blob payloads at rest with per-tenant data encryption keys
//! (DEKs) that are themselves wrapped by a master key living behind a
//! key-management backend:
//!
//! ```text
//! payload ──AES-256-GCM(DEK, fresh nonce)──▶ ciphertext        (stored with blob)
//! DEK     ──KeyManagementClient::wrap────────▶ wrapped DEK      (stored per tenant)
//! wrapped ──PBKDF2(passphrase) + AES-GCM─────▶ offline backup   (operator keeps)
//! ```
//!
//! Unwrapped DEKs are cached in-process for a bounded TTL (default 300 s)
//! so that steady-state reads and writes do not call the backend.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backup;
pub mod cache;
pub mod cipher;
pub mod envelope;
pub mod error;
pub mod key;
pub mod kms;

pub use backup::{BackupArmor, export_dek_backup, import_dek_backup};
pub use cache::{CacheStats, DekCache};
pub use cipher::Sealed;
pub use envelope::{EnvelopeEncryption, GeneratedKey, SealedWithNewKey};
pub use error::CryptoError;
pub use key::{DataKey, KeyId, WrappedKey};
pub use kms::{CloudKms, CloudKmsSettings, KeyManagementClient, LocalKms};
