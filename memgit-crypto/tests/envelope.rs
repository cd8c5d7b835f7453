//! Envelope encryption laws and key-management interaction.
//!
//! Round trips hold for arbitrary payloads; any tampering with key, nonce,
//! or ciphertext is an authentication failure; the DEK cache shields the
//! key-management backend within its TTL window.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;

use memgit_crypto::error::Result;
use memgit_crypto::{
    CryptoError, DataKey, EnvelopeEncryption, KeyManagementClient, LocalKms, export_dek_backup,
    import_dek_backup,
};

/// Counts unwrap calls reaching the backend.
struct CountingKms {
    inner: LocalKms,
    unwraps: AtomicUsize,
}

impl CountingKms {
    fn new() -> Self {
        Self {
            inner: LocalKms::ephemeral(),
            unwraps: AtomicUsize::new(0),
        }
    }
}

impl KeyManagementClient for CountingKms {
    fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.inner.wrap(plaintext)
    }

    fn unwrap(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.unwraps.fetch_add(1, Ordering::SeqCst);
        self.inner.unwrap(ciphertext)
    }

    fn describe(&self) -> String {
        "counting".into()
    }
}

/// A backend that is never reachable.
struct DownKms;

impl KeyManagementClient for DownKms {
    fn wrap(&self, _: &[u8]) -> Result<Vec<u8>> {
        Err(CryptoError::Unavailable("connection refused".into()))
    }

    fn unwrap(&self, _: &[u8]) -> Result<Vec<u8>> {
        Err(CryptoError::Unavailable("connection refused".into()))
    }

    fn describe(&self) -> String {
        "down".into()
    }
}

fn service_with_ttl(ttl: Duration) -> (EnvelopeEncryption, Arc<CountingKms>) {
    let kms = Arc::new(CountingKms::new());
    let svc = EnvelopeEncryption::new(kms.clone(), ttl);
    (svc, kms)
}

// ---------------------------------------------------------------------------
// Round trip and tamper detection
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn decrypt_inverts_encrypt(plaintext in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let (svc, _) = service_with_ttl(Duration::from_secs(300));
        let key = DataKey::generate();
        let sealed = svc.encrypt(&plaintext, &key).expect("seal");
        let opened = svc.decrypt(&sealed.ciphertext, &sealed.nonce, &key).expect("open");
        prop_assert_eq!(opened, plaintext);
    }

    #[test]
    fn flipped_ciphertext_byte_is_rejected(
        plaintext in proptest::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let (svc, _) = service_with_ttl(Duration::from_secs(300));
        let key = DataKey::generate();
        let mut sealed = svc.encrypt(&plaintext, &key).expect("seal");
        let i = index.index(sealed.ciphertext.len());
        sealed.ciphertext[i] ^= 1 << bit;
        let result = svc.decrypt(&sealed.ciphertext, &sealed.nonce, &key);
        prop_assert!(matches!(result, Err(CryptoError::AuthenticationFailure)));
    }

    #[test]
    fn flipped_nonce_byte_is_rejected(
        plaintext in proptest::collection::vec(any::<u8>(), 0..256),
        i in 0usize..12,
    ) {
        let (svc, _) = service_with_ttl(Duration::from_secs(300));
        let key = DataKey::generate();
        let mut sealed = svc.encrypt(&plaintext, &key).expect("seal");
        sealed.nonce[i] ^= 0x80;
        let result = svc.decrypt(&sealed.ciphertext, &sealed.nonce, &key);
        prop_assert!(matches!(result, Err(CryptoError::AuthenticationFailure)));
    }
}

#[test]
fn different_key_is_rejected() {
    let (svc, _) = service_with_ttl(Duration::from_secs(300));
    let sealed = svc.encrypt(b"{\"x\": 1}", &DataKey::generate()).expect("seal");
    let result = svc.decrypt(&sealed.ciphertext, &sealed.nonce, &DataKey::generate());
    assert!(matches!(result, Err(CryptoError::AuthenticationFailure)));
}

// ---------------------------------------------------------------------------
// DEK cache vs. key-management calls
// ---------------------------------------------------------------------------

#[test]
fn unwrap_within_ttl_hits_cache() {
    let (svc, kms) = service_with_ttl(Duration::from_secs(300));
    let generated = svc.generate_dek().expect("generate");
    svc.clear_cache();

    svc.unwrap_dek(&generated.key_id, &generated.wrapped).expect("first");
    svc.unwrap_dek(&generated.key_id, &generated.wrapped).expect("second");
    assert_eq!(kms.unwraps.load(Ordering::SeqCst), 1);
}

#[test]
fn unwrap_after_ttl_calls_backend_again() {
    let (svc, kms) = service_with_ttl(Duration::from_millis(30));
    let generated = svc.generate_dek().expect("generate");
    svc.clear_cache();

    svc.unwrap_dek(&generated.key_id, &generated.wrapped).expect("first");
    thread::sleep(Duration::from_millis(60));
    let key = svc.unwrap_dek(&generated.key_id, &generated.wrapped).expect("second");
    assert_eq!(kms.unwraps.load(Ordering::SeqCst), 2);
    assert_eq!(key, generated.key);
}

#[test]
fn freshly_generated_key_needs_no_unwrap() {
    let (svc, kms) = service_with_ttl(Duration::from_secs(300));
    let generated = svc.generate_dek().expect("generate");
    svc.unwrap_dek(&generated.key_id, &generated.wrapped).expect("unwrap");
    assert_eq!(kms.unwraps.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_misses_unwrap_once() {
    let (svc, kms) = service_with_ttl(Duration::from_secs(300));
    let svc = Arc::new(svc);
    let generated = svc.generate_dek().expect("generate");
    svc.clear_cache();

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let svc = Arc::clone(&svc);
            let id = generated.key_id.clone();
            let wrapped = generated.wrapped.clone();
            thread::spawn(move || svc.unwrap_dek(&id, &wrapped).expect("unwrap"))
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().expect("join"), generated.key);
    }
    assert_eq!(kms.unwraps.load(Ordering::SeqCst), 1);
}

#[test]
fn unreachable_backend_fails_loudly() {
    let svc = EnvelopeEncryption::new(Arc::new(DownKms), Duration::from_secs(300));
    assert!(matches!(svc.generate_dek(), Err(CryptoError::Unavailable(_))));
    assert!(matches!(
        svc.unwrap_dek(&"abc".into(), &vec![0u8; 60].into()),
        Err(CryptoError::Unavailable(_))
    ));
    assert_eq!(svc.cache_stats().total_cached, 0);
}

// ---------------------------------------------------------------------------
// Backups
// ---------------------------------------------------------------------------

#[test]
fn backup_restores_wrapped_key_byte_for_byte() {
    let (svc, _) = service_with_ttl(Duration::from_secs(300));
    let generated = svc.generate_dek().expect("generate");

    let backup = export_dek_backup(&generated.wrapped, "a long recovery phrase").expect("export");
    let restored = import_dek_backup(&backup, "a long recovery phrase").expect("import");
    assert_eq!(restored.as_bytes(), generated.wrapped.as_bytes());

    // The restored wrapped key still unwraps to the same DEK.
    svc.clear_cache();
    assert_eq!(
        svc.unwrap_dek(&generated.key_id, &restored).expect("unwrap"),
        generated.key
    );

    assert!(matches!(
        import_dek_backup(&backup, "a wrong recovery phrase"),
        Err(CryptoError::AuthenticationFailure)
    ));
}
