//! Passphrase-protected export of wrapped data keys for disaster recovery.
//!
//! Backup layout: `salt (16) || nonce (12) || AES-256-GCM(wrapped_dek)`,
//! where the AES key is PBKDF2-HMAC-SHA256(passphrase, salt, 600 000).
//! The *wrapped* key is exported, never the plaintext one, so a backup is
//! useless without both the passphrase and the master key.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::cipher::{self, NONCE_LEN, TAG_LEN};
use crate::error::{CryptoError, Result};
use crate::key::{DataKey, KEY_LEN, KeyId, WrappedKey};

/// PBKDF2 iteration count.
pub const PBKDF2_ITERATIONS: u32 = 600_000;

/// Salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Shortest accepted passphrase, in characters.
pub const MIN_PASSPHRASE_CHARS: usize = 12;

fn derive_key(passphrase: &str, salt: &[u8]) -> Result<DataKey> {
    let mut out = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, PBKDF2_ITERATIONS, out.as_mut());
    DataKey::from_slice(out.as_ref())
}

/// Encrypt `wrapped` under a key derived from `passphrase`.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPassphrase`] for passphrases shorter than
/// [`MIN_PASSPHRASE_CHARS`].
pub fn export_dek_backup(wrapped: &WrappedKey, passphrase: &str) -> Result<Vec<u8>> {
    if passphrase.chars().count() < MIN_PASSPHRASE_CHARS {
        return Err(CryptoError::InvalidPassphrase(format!(
            "must be at least {MIN_PASSPHRASE_CHARS} characters"
        )));
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let key = derive_key(passphrase, &salt)?;
    let nonce = cipher::fresh_nonce();
    let ciphertext = cipher::seal_with_nonce(wrapped.as_bytes(), &key, &nonce)?;

    let mut out = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Recover the wrapped key from a backup.
///
/// # Errors
///
/// Returns [`CryptoError::AuthenticationFailure`] for a wrong passphrase or
/// a truncated/corrupted backup.
pub fn import_dek_backup(backup: &[u8], passphrase: &str) -> Result<WrappedKey> {
    if backup.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
        return Err(CryptoError::AuthenticationFailure);
    }
    let (salt, rest) = backup.split_at(SALT_LEN);
    let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
    let key = derive_key(passphrase, salt)?;
    Ok(WrappedKey(cipher::open(ciphertext, nonce, &key)?))
}

/// Text armoring for backups kept offline: a few `#` comment lines then the
/// base64 body.
pub struct BackupArmor;

impl BackupArmor {
    /// Render `backup` for `key_id` as a text file.
    #[must_use]
    pub fn encode(key_id: &KeyId, backup: &[u8]) -> String {
        format!(
            "# memgit data key backup\n\
             # Key ID: {key_id}\n\
             # Store this file offline. The passphrase is required to restore.\n\
             \n\
             {}\n",
            STANDARD.encode(backup)
        )
    }

    /// Parse an armored backup, returning the key id (if present) and bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encoding`] if the body is not valid base64.
    pub fn decode(text: &str) -> Result<(Option<KeyId>, Vec<u8>)> {
        let mut key_id = None;
        let mut body = String::new();
        for line in text.lines().map(str::trim) {
            if let Some(comment) = line.strip_prefix('#') {
                if let Some(id) = comment.trim().strip_prefix("Key ID:") {
                    key_id = Some(KeyId(id.trim().to_string()));
                }
            } else {
                body.push_str(line);
            }
        }
        Ok((key_id, STANDARD.decode(body)?))
    }
}
