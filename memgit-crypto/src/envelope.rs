//! Envelope Encryption Service.
//!
//! Payloads are sealed with a per-tenant data encryption key (DEK); the DEK
//! is sealed ("wrapped") by the [`KeyManagementClient`] and only the wrapped
//! form is ever handed back for storage. Unwrapped DEKs are cached for the
//! configured TTL so steady-state encrypt/decrypt calls avoid a backend
//! round trip.
//!
//! Construct one service at startup and share it behind an `Arc`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::cache::{CacheStats, DekCache};
use crate::cipher::{self, Sealed};
use crate::error::{CryptoError, Result};
use crate::key::{DataKey, KeyId, WrappedKey};
use crate::kms::KeyManagementClient;

/// A freshly generated data key in both forms.
#[derive(Debug, Clone)]
pub struct GeneratedKey {
    /// Id to store alongside every blob sealed with this key.
    pub key_id: KeyId,
    /// The persisted form.
    pub wrapped: WrappedKey,
    /// The in-memory form, already cached.
    pub key: DataKey,
}

/// Output of [`EnvelopeEncryption::encrypt_with_new_dek`].
#[derive(Debug, Clone)]
pub struct SealedWithNewKey {
    /// The sealed payload.
    pub sealed: Sealed,
    /// Id of the key that sealed it.
    pub key_id: KeyId,
    /// Wrapped form of that key.
    pub wrapped: WrappedKey,
}

/// Envelope encryption over an injected key-management backend.
pub struct EnvelopeEncryption {
    kms: Arc<dyn KeyManagementClient>,
    cache: DekCache,
}

impl std::fmt::Debug for EnvelopeEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeEncryption")
            .field("kms", &self.kms.describe())
            .field("cache", &self.cache)
            .finish()
    }
}

impl EnvelopeEncryption {
    /// Create a service with a cache TTL.
    #[must_use]
    pub fn new(kms: Arc<dyn KeyManagementClient>, cache_ttl: Duration) -> Self {
        info!(
            backend = %kms.describe(),
            ttl_s = cache_ttl.as_secs(),
            "Envelope encryption service ready"
        );
        Self {
            kms,
            cache: DekCache::new(cache_ttl),
        }
    }

    /// Generate a random 256-bit DEK, wrap it, and cache the plaintext.
    ///
    /// # Errors
    ///
    /// Fails if the key-management backend cannot wrap the key.
    pub fn generate_dek(&self) -> Result<GeneratedKey> {
        let key = DataKey::generate();
        let key_id = KeyId::derive(&key);
        let wrapped = WrappedKey(self.kms.wrap(key.as_bytes())?);

        self.cache.insert(key_id.clone(), key.clone());
        info!(key_id = %key_id, "Generated data encryption key");

        Ok(GeneratedKey {
            key_id,
            wrapped,
            key,
        })
    }

    /// Return the plaintext DEK for `key_id`, from cache when fresh,
    /// otherwise by asking the backend to unwrap `wrapped`.
    ///
    /// # Errors
    ///
    /// Fails if the backend is unreachable or refuses the wrapped key, or
    /// if it returns key material of the wrong length.
    pub fn unwrap_dek(&self, key_id: &KeyId, wrapped: &WrappedKey) -> Result<DataKey> {
        self.cache.get_or_fill(key_id, || {
            let start = Instant::now();
            let bytes = zeroize::Zeroizing::new(self.kms.unwrap(wrapped.as_bytes())?);
            let key = DataKey::from_slice(&bytes)?;
            debug!(
                key_id = %key_id,
                elapsed_us = start.elapsed().as_micros(),
                "Unwrapped data key (cache miss)"
            );
            Ok(key)
        })
    }

    /// Ask the backend to unwrap `wrapped`, ignoring any cached key. The
    /// cache is neither read nor filled.
    ///
    /// # Errors
    ///
    /// As [`Self::unwrap_dek`].
    pub fn unwrap_dek_uncached(&self, wrapped: &WrappedKey) -> Result<DataKey> {
        let bytes = zeroize::Zeroizing::new(self.kms.unwrap(wrapped.as_bytes())?);
        DataKey::from_slice(&bytes)
    }

    /// Seal `plaintext` under `key` with a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKey`] if the cipher rejects the key.
    pub fn encrypt(&self, plaintext: &[u8], key: &DataKey) -> Result<Sealed> {
        cipher::seal(plaintext, key)
    }

    /// Open `ciphertext` sealed under `key` with `nonce`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::AuthenticationFailure`] on any tag mismatch.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &[u8], key: &DataKey) -> Result<Vec<u8>> {
        cipher::open(ciphertext, nonce, key)
    }

    /// Open and decode a UTF-8 payload.
    ///
    /// # Errors
    ///
    /// As [`Self::decrypt`], plus [`CryptoError::Encoding`] for invalid UTF-8.
    pub fn decrypt_to_string(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        key: &DataKey,
    ) -> Result<String> {
        let bytes = self.decrypt(ciphertext, nonce, key)?;
        String::from_utf8(bytes).map_err(|e| CryptoError::Encoding(e.to_string()))
    }

    /// Seal `plaintext` under a brand-new DEK.
    ///
    /// # Errors
    ///
    /// As [`Self::generate_dek`] and [`Self::encrypt`].
    pub fn encrypt_with_new_dek(&self, plaintext: &[u8]) -> Result<SealedWithNewKey> {
        let generated = self.generate_dek()?;
        let sealed = self.encrypt(plaintext, &generated.key)?;
        Ok(SealedWithNewKey {
            sealed,
            key_id: generated.key_id,
            wrapped: generated.wrapped,
        })
    }

    /// Unwrap the DEK (through the cache) and open `ciphertext`.
    ///
    /// # Errors
    ///
    /// As [`Self::unwrap_dek`] and [`Self::decrypt`].
    pub fn decrypt_with_wrapped_dek(
        &self,
        ciphertext: &[u8],
        nonce: &[u8],
        key_id: &KeyId,
        wrapped: &WrappedKey,
    ) -> Result<Vec<u8>> {
        let key = self.unwrap_dek(key_id, wrapped)?;
        self.decrypt(ciphertext, nonce, &key)
    }

    /// Cache occupancy.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Forget every cached plaintext key (e.g. after rotation).
    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Description of the key-management backend.
    #[must_use]
    pub fn backend(&self) -> String {
        self.kms.describe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kms::LocalKms;

    fn service() -> EnvelopeEncryption {
        EnvelopeEncryption::new(Arc::new(LocalKms::ephemeral()), Duration::from_secs(300))
    }

    #[test]
    fn generated_key_round_trips_through_unwrap() {
        let svc = service();
        let generated = svc.generate_dek().expect("generate");
        assert_ne!(generated.wrapped.as_bytes(), generated.key.as_bytes());

        svc.clear_cache();
        let unwrapped = svc
            .unwrap_dek(&generated.key_id, &generated.wrapped)
            .expect("unwrap");
        assert_eq!(unwrapped, generated.key);
    }

    #[test]
    fn uncached_unwrap_ignores_the_cache() {
        let svc = service();
        let generated = svc.generate_dek().expect("generate");
        let foreign = service().generate_dek().expect("foreign");

        // Cached by id: the wrapped bytes are never looked at.
        assert_eq!(
            svc.unwrap_dek(&generated.key_id, &foreign.wrapped).expect("cached"),
            generated.key
        );
        assert!(matches!(
            svc.unwrap_dek_uncached(&foreign.wrapped),
            Err(CryptoError::AuthenticationFailure)
        ));
        assert_eq!(svc.unwrap_dek_uncached(&generated.wrapped).expect("own"), generated.key);
        assert_eq!(svc.cache_stats().total_cached, 1);
    }

    #[test]
    fn generate_populates_cache() {
        let svc = service();
        svc.generate_dek().expect("generate");
        assert_eq!(svc.cache_stats().active, 1);
    }

    #[test]
    fn new_dek_envelope() {
        let svc = service();
        let out = svc.encrypt_with_new_dek(b"{\"x\": 1}").expect("seal");
        svc.clear_cache();
        let plain = svc
            .decrypt_with_wrapped_dek(&out.sealed.ciphertext, &out.sealed.nonce, &out.key_id, &out.wrapped)
            .expect("open");
        assert_eq!(plain, b"{\"x\": 1}");
    }

    #[test]
    fn non_utf8_payload_is_an_encoding_error() {
        let svc = service();
        let key = DataKey::generate();
        let sealed = svc.encrypt(&[0xff, 0xfe], &key).expect("seal");
        assert!(matches!(
            svc.decrypt_to_string(&sealed.ciphertext, &sealed.nonce, &key),
            Err(CryptoError::Encoding(_))
        ));
    }
}
