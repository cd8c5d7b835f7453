//! Key Management Client: wraps and unwraps data keys under a master key
//! that never leaves the backend.
//!
//! Backends:
//!   - [`LocalKms`] keeps a master key in process memory (development,
//!     tests, single-host deployments).
//!   - [`CloudKms`] calls Google Cloud KMS over its REST API.

mod gcp;
mod local;

pub use gcp::{CloudKms, CloudKmsSettings};
pub use local::LocalKms;

use crate::error::Result;

/// The only capability the envelope layer needs from key management.
///
/// Implementations must be safe to call from many request threads at once.
/// Calls may fail transiently; callers surface those failures rather than
/// falling back to plaintext.
pub trait KeyManagementClient: Send + Sync {
    /// Encrypt `plaintext` (a data key) under the master key.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when the backend cannot be reached.
    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt a previously wrapped data key.
    ///
    /// # Errors
    ///
    /// Returns `Unavailable` when the backend cannot be reached and
    /// `AuthenticationFailure`/`KeyManagement` when it refuses the input.
    fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// Human-readable backend description for logs.
    fn describe(&self) -> String;
}
