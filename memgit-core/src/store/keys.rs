//! Data encryption key lifecycle: provisioning, rotation, migration of
//! plaintext blobs, and passphrase backups.
//!
//! Only wrapped keys ever reach the database.

use std::time::Instant;

use chrono::{DateTime, Utc};
use memgit_crypto::{KeyId, WrappedKey, export_dek_backup, import_dek_backup};
use rusqlite::params;
use serde::Serialize;
use tracing::info;

use super::{MemoryStore, OptionalExt};
use crate::error::{MemgitError, Result, is_unique_violation};
use crate::hashing::{format_ts, parse_ts};
use crate::types::TenantId;

/// Cipher recorded for every key.
const ALGORITHM: &str = "AES-256-GCM";

/// Outcome of a rotation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotatedKey {
    /// Key that was active before, now `rotated`.
    pub previous: Option<KeyId>,
    /// The new active key.
    pub current: KeyId,
}

/// A stored data key, without key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataKeyInfo {
    /// Key id.
    pub key_id: KeyId,
    /// `active` or `rotated`.
    pub status: String,
    /// Cipher.
    pub algorithm: String,
    /// When the key was stored.
    pub created_at: DateTime<Utc>,
    /// When the key stopped being active.
    pub rotated_at: Option<DateTime<Utc>>,
}

impl MemoryStore {
    /// Ensure the tenant has an active data key and return its id.
    ///
    /// # Errors
    ///
    /// `Unavailable` without an encryption service or when the
    /// key-management backend cannot wrap the new key.
    pub fn provision_data_key(&self, tenant: TenantId) -> Result<KeyId> {
        let service = self.require_encryption()?;
        let tx = self.write_txn()?;
        if let Some((key_id, _)) = self.active_key(&tx, tenant)? {
            return Ok(key_id);
        }

        let generated = service.generate_dek()?;
        tx.execute(
            "INSERT INTO data_encryption_keys (key_id, tenant_id, wrapped_key, algorithm, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            params![
                generated.key_id.as_str(),
                tenant.to_string(),
                generated.wrapped.as_bytes(),
                ALGORITHM,
                format_ts(Utc::now())
            ],
        )?;
        tx.commit()?;

        info!(%tenant, key_id = %generated.key_id, "Provisioned data encryption key");
        Ok(generated.key_id)
    }

    /// Retire the active key and make a fresh one active, atomically.
    /// Blobs written under the old key stay readable through their own
    /// `encryption_key_id`.
    ///
    /// # Errors
    ///
    /// As [`Self::provision_data_key`].
    pub fn rotate_data_key(&self, tenant: TenantId) -> Result<RotatedKey> {
        let service = self.require_encryption()?;
        let tx = self.write_txn()?;
        let previous = self.active_key(&tx, tenant)?.map(|(id, _)| id);
        let generated = service.generate_dek()?;
        let now = format_ts(Utc::now());
        let t = tenant.to_string();

        tx.execute(
            "UPDATE data_encryption_keys SET status = 'rotated', rotated_at = ?1
             WHERE tenant_id = ?2 AND status = 'active'",
            params![now, t],
        )?;
        tx.execute(
            "INSERT INTO data_encryption_keys (key_id, tenant_id, wrapped_key, algorithm, status, created_at)
             VALUES (?1, ?2, ?3, ?4, 'active', ?5)",
            params![generated.key_id.as_str(), t, generated.wrapped.as_bytes(), ALGORITHM, now],
        )?;
        tx.commit()?;

        info!(
            %tenant,
            previous = previous.as_ref().map(KeyId::as_str),
            current = %generated.key_id,
            "Rotated data encryption key"
        );
        Ok(RotatedKey {
            previous,
            current: generated.key_id,
        })
    }

    /// Keys of the tenant, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn list_data_keys(&self, tenant: TenantId) -> Result<Vec<DataKeyInfo>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT key_id, status, algorithm, created_at, rotated_at FROM data_encryption_keys
             WHERE tenant_id = ?1 ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt.query_map([tenant.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?;
        rows.map(|row| {
            let (key_id, status, algorithm, created_at, rotated_at) = row?;
            Ok(DataKeyInfo {
                key_id: KeyId(key_id),
                status,
                algorithm,
                created_at: parse_ts(&created_at)?,
                rotated_at: rotated_at.as_deref().map(parse_ts).transpose()?,
            })
        })
        .collect()
    }

    /// Encrypt every plaintext blob of the tenant under the active key, in
    /// transactions of `batch_size` blobs. `blob_hash` never changes.
    ///
    /// Returns the number of blobs encrypted.
    ///
    /// # Errors
    ///
    /// - `Invalid` if the tenant has no active key or `batch_size` is 0.
    /// - Any encryption error; blobs of the failing batch stay plaintext.
    pub fn encrypt_plaintext_blobs(&self, tenant: TenantId, batch_size: usize) -> Result<usize> {
        if batch_size == 0 {
            return Err(MemgitError::Invalid("batch_size must be positive".into()));
        }
        let service = self.require_encryption()?;
        let start = Instant::now();
        let t = tenant.to_string();
        let mut total = 0usize;

        loop {
            let tx = self.write_txn()?;
            let (key_id, wrapped) = self.active_key(&tx, tenant)?.ok_or_else(|| {
                MemgitError::Invalid(format!("tenant {tenant} has no active data encryption key"))
            })?;
            let key = service.unwrap_dek(&key_id, &wrapped)?;

            let batch: Vec<(String, String)> = {
                let mut stmt = tx.prepare_cached(
                    "SELECT blob_hash, content FROM blobs
                     WHERE tenant_id = ?1 AND content_encrypted IS NULL AND content IS NOT NULL
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![t, super::sql_limit(batch_size)], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
                rows.collect::<std::result::Result<_, _>>()?
            };
            if batch.is_empty() {
                break;
            }

            for (hash, content) in &batch {
                let sealed = service.encrypt(content.as_bytes(), &key)?;
                tx.execute(
                    "UPDATE blobs SET content = NULL, content_encrypted = ?1, nonce = ?2,
                                      encryption_key_id = ?3
                     WHERE tenant_id = ?4 AND blob_hash = ?5",
                    params![
                        sealed.ciphertext,
                        sealed.nonce.as_slice(),
                        key_id.as_str(),
                        t,
                        hash
                    ],
                )?;
            }
            tx.commit()?;
            total += batch.len();
            info!(%tenant, batch = batch.len(), total, "Encrypted plaintext blobs");
        }

        info!(
            %tenant,
            total,
            elapsed_ms = start.elapsed().as_millis(),
            "Plaintext migration complete"
        );
        Ok(total)
    }

    /// Passphrase-protected backup of a stored wrapped key.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown key.
    /// - `Invalid` for a passphrase shorter than 12 characters.
    pub fn export_data_key_backup(
        &self,
        tenant: TenantId,
        key_id: &KeyId,
        passphrase: &str,
    ) -> Result<Vec<u8>> {
        let wrapped: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT wrapped_key FROM data_encryption_keys WHERE tenant_id = ?1 AND key_id = ?2",
                params![tenant.to_string(), key_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        let wrapped = wrapped
            .map(WrappedKey)
            .ok_or_else(|| MemgitError::not_found("data key", key_id))?;

        let backup = export_dek_backup(&wrapped, passphrase)?;
        info!(%tenant, key_id = %key_id, "Exported data key backup");
        Ok(backup)
    }

    /// Re-insert a key from a backup. It becomes `active` if the tenant has
    /// no active key, `rotated` otherwise.
    ///
    /// When an encryption service is attached the restored key is unwrapped
    /// once by the backend, bypassing the key cache, so a backup the backend
    /// cannot open is refused up front.
    ///
    /// # Errors
    ///
    /// - `AuthenticationFailure` for a wrong passphrase or corrupt backup.
    /// - `Conflict` if `key_id` is already stored.
    pub fn restore_data_key(
        &self,
        tenant: TenantId,
        key_id: &KeyId,
        backup: &[u8],
        passphrase: &str,
    ) -> Result<DataKeyInfo> {
        let wrapped = import_dek_backup(backup, passphrase)?;
        if let Some(service) = &self.encryption {
            // A cached key for this id says nothing about the backup.
            service.unwrap_dek_uncached(&wrapped)?;
        }

        let tx = self.write_txn()?;
        let status = if self.active_key(&tx, tenant)?.is_some() {
            "rotated"
        } else {
            "active"
        };
        let created_at = parse_ts(&format_ts(Utc::now()))?;
        let inserted = tx.execute(
            "INSERT INTO data_encryption_keys (key_id, tenant_id, wrapped_key, algorithm, status, created_at, rotated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, CASE WHEN ?5 = 'rotated' THEN ?6 END)",
            params![
                key_id.as_str(),
                tenant.to_string(),
                wrapped.as_bytes(),
                ALGORITHM,
                status,
                format_ts(created_at)
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(MemgitError::Conflict(format!("data key {key_id} already exists")));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        info!(%tenant, key_id = %key_id, status, "Restored data key from backup");
        Ok(DataKeyInfo {
            key_id: key_id.clone(),
            status: status.to_string(),
            algorithm: ALGORITHM.to_string(),
            created_at,
            rotated_at: (status == "rotated").then_some(created_at),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use memgit_crypto::{EnvelopeEncryption, LocalKms};

    use super::*;
    use crate::config::MemgitConfig;

    fn encrypted_store() -> MemoryStore {
        let service = EnvelopeEncryption::new(Arc::new(LocalKms::ephemeral()), Duration::from_secs(300));
        let store = MemoryStore::open_in_memory(&MemgitConfig::default())
            .expect("open")
            .with_encryption(Arc::new(service));
        store.init_tenant(TenantId::DEFAULT).expect("init");
        store
    }

    #[test]
    fn provisioning_is_idempotent() {
        let store = encrypted_store();
        let a = store.provision_data_key(TenantId::DEFAULT).expect("first");
        let b = store.provision_data_key(TenantId::DEFAULT).expect("second");
        assert_eq!(a, b);
        assert_eq!(store.list_data_keys(TenantId::DEFAULT).expect("list").len(), 1);
    }

    #[test]
    fn rotation_keeps_one_active_key() {
        let store = encrypted_store();
        let first = store.provision_data_key(TenantId::DEFAULT).expect("provision");
        let rotated = store.rotate_data_key(TenantId::DEFAULT).expect("rotate");
        assert_eq!(rotated.previous, Some(first.clone()));

        let keys = store.list_data_keys(TenantId::DEFAULT).expect("list");
        let active: Vec<_> = keys.iter().filter(|k| k.status == "active").collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].key_id, rotated.current);
        let old = keys.iter().find(|k| k.key_id == first).expect("old key");
        assert!(old.rotated_at.is_some());
    }

    #[test]
    fn key_operations_need_a_service() {
        let store = MemoryStore::open_in_memory(&MemgitConfig::default()).expect("open");
        assert!(matches!(
            store.provision_data_key(TenantId::DEFAULT),
            Err(MemgitError::Unavailable(_))
        ));
    }

    #[test]
    fn export_unknown_key_is_not_found() {
        let store = encrypted_store();
        assert!(matches!(
            store.export_data_key_backup(TenantId::DEFAULT, &"missing".into(), "a long passphrase"),
            Err(MemgitError::NotFound { .. })
        ));
    }

    #[test]
    fn short_passphrase_is_invalid() {
        let store = encrypted_store();
        let key = store.provision_data_key(TenantId::DEFAULT).expect("provision");
        assert!(matches!(
            store.export_data_key_backup(TenantId::DEFAULT, &key, "short"),
            Err(MemgitError::Invalid(_))
        ));
    }

    #[test]
    fn restore_checks_the_backend_even_when_the_id_is_cached() {
        let store = encrypted_store();
        let t = TenantId::DEFAULT;
        let key_id = store.provision_data_key(t).expect("provision");
        store
            .conn
            .execute("DELETE FROM data_encryption_keys", [])
            .expect("lose key row");

        // Wrapped by a backend this store cannot reach.
        let other = EnvelopeEncryption::new(Arc::new(LocalKms::ephemeral()), Duration::from_secs(300));
        let foreign = other.generate_dek().expect("foreign");
        let backup =
            export_dek_backup(&foreign.wrapped, "correct horse battery staple").expect("export");

        assert!(matches!(
            store.restore_data_key(t, &key_id, &backup, "correct horse battery staple"),
            Err(MemgitError::AuthenticationFailure)
        ));
        assert!(store.list_data_keys(t).expect("list").is_empty());
    }

    #[test]
    fn same_key_id_restores_into_another_tenant() {
        let store = encrypted_store();
        let a = TenantId::DEFAULT;
        let b = TenantId(uuid::Uuid::from_u128(2));
        store.init_tenant(b).expect("init b");
        let key_id = store.provision_data_key(a).expect("provision");
        let backup = store
            .export_data_key_backup(a, &key_id, "correct horse battery staple")
            .expect("export");

        let restored = store
            .restore_data_key(b, &key_id, &backup, "correct horse battery staple")
            .expect("restore into b");
        assert_eq!(restored.status, "active");
        assert!(matches!(
            store.restore_data_key(b, &key_id, &backup, "correct horse battery staple"),
            Err(MemgitError::Conflict(_))
        ));
    }

    #[test]
    fn migration_requires_positive_batch() {
        let store = encrypted_store();
        assert!(matches!(
            store.encrypt_plaintext_blobs(TenantId::DEFAULT, 0),
            Err(MemgitError::Invalid(_))
        ));
    }
}
