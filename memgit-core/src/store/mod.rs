//! SQLite-backed memory store.
//!
//! [`MemoryStore`] owns one connection and borrows two shared services: the
//! envelope encryption service (optional) and the task-queue halt switch.
//! Several stores may point at the same database file; SQLite's write lock
//! serializes their writers.
//!
//! ```text
//!  Commit ──► blobs ◄── tree_entries ◄── commits ◄── branches.head_commit
//!               ▲  ▲                        │
//!          tags ┘  └ cross_references       └─ parent_hash ─► commits
//! ```
//!
//! Operations are split by concern across the submodules; they are all
//! inherent methods on [`MemoryStore`].

mod branches;
mod history;
mod keys;
mod links;
mod objects;
mod sessions;
mod tasks;
mod trails;

pub use history::History;
pub use keys::{DataKeyInfo, RotatedKey};
pub use links::{
    CrossBranchLink, CrossReference, GraphEdge, GraphNode, HubMemory, LinkFilter, MemoryGraph,
    NewLink, Reflection,
};
pub use objects::{
    Brief, CommitRequest, CommitResult, RecallKey, RecalledMemory, SearchHit, TypedContent,
    TypedMemory,
};
pub use sessions::{Session, SessionFilter, SessionSummary, SessionSync};
pub use tasks::{DEFAULT_PRIORITY, NewTask, Task, TaskFilter};
pub use trails::Trail;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use memgit_crypto::{EnvelopeEncryption, KeyId, WrappedKey};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OpenFlags, ToSql, Transaction, TransactionBehavior, params};
use serde::Serialize;
use tracing::{debug, info};

use crate::config::MemgitConfig;
use crate::error::{MemgitError, Result};
use crate::halt::HaltSwitch;
use crate::hashing::format_ts;
use crate::schema;
use crate::types::{BlobHash, LinkType, TaskStatus, TenantId};

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

/// Handle to an open memgit database.
///
/// # Usage
///
/// ```no_run
/// # use memgit_core::{MemgitConfig, MemoryStore, TenantId};
/// # use memgit_core::store::CommitRequest;
/// let config = MemgitConfig::default();
/// let store = MemoryStore::open("memgit.db", &config)?;
/// store.init_tenant(TenantId::DEFAULT)?;
/// let result = store.commit(
///     TenantId::DEFAULT,
///     CommitRequest::new("command-center", serde_json::json!({"x": 1}), "m1"),
/// )?;
/// let log = store.log(TenantId::DEFAULT, "command-center", Some(10))?;
/// assert_eq!(log[0].commit_hash, result.commit_hash);
/// # Ok::<(), memgit_core::MemgitError>(())
/// ```
pub struct MemoryStore {
    conn: Connection,
    config: MemgitConfig,
    db_path: PathBuf,
    encryption: Option<Arc<EnvelopeEncryption>>,
    halt: Arc<HaltSwitch>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("db_path", &self.db_path)
            .field("encryption", &self.encryption.as_ref().map(|e| e.backend()))
            .field("halted", &self.halt.is_halted())
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Open (or create) a database at `path` and apply the schema.
    ///
    /// No encryption service is attached; see [`Self::with_encryption`] or
    /// [`Self::from_config`].
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &MemgitConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.persistence.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        Self::configure(conn, config, db_path)
    }

    /// Open a private in-memory database (tests, benchmarks).
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn open_in_memory(config: &MemgitConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(conn, config, PathBuf::from(":memory:"))
    }

    /// Open `path` and attach the encryption service described by
    /// `config.encryption`.
    ///
    /// # Errors
    ///
    /// As [`Self::open`], plus `Config` if the key-management backend is
    /// misconfigured.
    pub fn from_config<P: AsRef<Path>>(path: P, config: &MemgitConfig) -> Result<Self> {
        let store = Self::open(path, config)?;
        Ok(match config.encryption.build_service()? {
            Some(service) => store.with_encryption(service),
            None => store,
        })
    }

    fn configure(conn: Connection, config: &MemgitConfig, db_path: PathBuf) -> Result<Self> {
        let persistence = &config.persistence;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        if persistence.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        conn.busy_timeout(persistence.busy_timeout())?;
        schema::apply(&conn)?;

        info!(
            path = %db_path.display(),
            wal = persistence.wal_mode,
            busy_timeout_ms = persistence.busy_timeout_ms,
            "memgit store opened"
        );

        Ok(Self {
            conn,
            config: config.clone(),
            db_path,
            encryption: None,
            halt: Arc::new(HaltSwitch::new()),
        })
    }

    /// Attach a shared encryption service. New blobs are encrypted for
    /// tenants that have an active data key.
    #[must_use]
    pub fn with_encryption(mut self, service: Arc<EnvelopeEncryption>) -> Self {
        self.encryption = Some(service);
        self
    }

    /// Share a halt switch with other stores.
    #[must_use]
    pub fn with_halt_switch(mut self, halt: Arc<HaltSwitch>) -> Self {
        self.halt = halt;
        self
    }

    /// The configuration this store was opened with.
    #[must_use]
    pub fn config(&self) -> &MemgitConfig {
        &self.config
    }

    /// The attached encryption service, if any.
    #[must_use]
    pub fn encryption(&self) -> Option<&Arc<EnvelopeEncryption>> {
        self.encryption.as_ref()
    }

    /// The halt switch this store observes.
    #[must_use]
    pub fn halt_switch(&self) -> &Arc<HaltSwitch> {
        &self.halt
    }

    /// Create the tenant's default branch at `GENESIS` if it is missing.
    ///
    /// Returns `true` if the branch was created.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn init_tenant(&self, tenant: TenantId) -> Result<bool> {
        let created = self.conn.execute(
            "INSERT OR IGNORE INTO branches (tenant_id, name, head_commit, created_at)
             VALUES (?1, ?2, 'GENESIS', ?3)",
            params![
                tenant.to_string(),
                self.config.general.default_branch,
                format_ts(Utc::now())
            ],
        )?;
        if created > 0 {
            info!(%tenant, branch = %self.config.general.default_branch, "Tenant initialised");
        }
        Ok(created > 0)
    }

    /// Row counts and encryption status for one tenant.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn stats(&self, tenant: TenantId) -> Result<StoreStats> {
        let t = tenant.to_string();
        let count = |sql: &str| -> Result<usize> {
            let n: i64 = self.conn.query_row(sql, [&t], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or(0))
        };

        let active_key = self.active_key(&self.conn, tenant)?.map(|(id, _)| id);
        let encryption = match (&self.encryption, &active_key) {
            (None, _) => EncryptionStatus::Disabled,
            (Some(_), None) => EncryptionStatus::Enabled,
            (Some(_), Some(_)) => EncryptionStatus::Active,
        };

        Ok(StoreStats {
            branches: count("SELECT COUNT(*) FROM branches WHERE tenant_id = ?1")?,
            commits: count("SELECT COUNT(*) FROM commits WHERE tenant_id = ?1")?,
            blobs: count("SELECT COUNT(*) FROM blobs WHERE tenant_id = ?1")?,
            encrypted_blobs: count(
                "SELECT COUNT(*) FROM blobs WHERE tenant_id = ?1 AND content_encrypted IS NOT NULL",
            )?,
            links: count("SELECT COUNT(*) FROM cross_references WHERE tenant_id = ?1")?,
            open_tasks: count("SELECT COUNT(*) FROM tasks WHERE tenant_id = ?1 AND status = 'open'")?,
            trails: count("SELECT COUNT(*) FROM trails WHERE tenant_id = ?1")?,
            encryption,
            active_key_id: active_key,
        })
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    /// Copy the whole database to `dest_path` with SQLite's online-backup
    /// API. Safe while other connections read and write.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest_path: P) -> Result<()> {
        let start = Instant::now();
        let mut dest = Connection::open(dest_path.as_ref())?;
        let backup = rusqlite::backup::Backup::new(&self.conn, &mut dest)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;

        info!(
            dest = %dest_path.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Database backup completed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Begin a write transaction that takes SQLite's write lock up front,
    /// so nothing read inside it can change before it commits.
    fn write_txn(&self) -> Result<Transaction<'_>> {
        Ok(Transaction::new_unchecked(
            &self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// The tenant's active data key, read through `conn` (the store
    /// connection or an open transaction).
    fn active_key(&self, conn: &Connection, tenant: TenantId) -> Result<Option<(KeyId, WrappedKey)>> {
        let row = conn
            .prepare_cached(
                "SELECT key_id, wrapped_key FROM data_encryption_keys
                 WHERE tenant_id = ?1 AND status = 'active'",
            )?
            .query_row([tenant.to_string()], |row| {
                Ok((KeyId(row.get(0)?), WrappedKey(row.get(1)?)))
            })
            .optional()?;
        Ok(row)
    }

    fn require_encryption(&self) -> Result<&Arc<EnvelopeEncryption>> {
        self.encryption.as_ref().ok_or_else(|| {
            MemgitError::Unavailable("no encryption service attached to this store".into())
        })
    }

    /// Plaintext of a stored blob, decrypting when it carries ciphertext.
    fn plaintext(&self, tenant: TenantId, blob: &StoredBlob) -> Result<String> {
        let (Some(ciphertext), Some(nonce), Some(key_id)) =
            (&blob.content_encrypted, &blob.nonce, &blob.encryption_key_id)
        else {
            return blob.content.clone().ok_or_else(|| {
                MemgitError::IntegrityViolation(format!(
                    "blob {} has neither plaintext nor ciphertext",
                    blob.blob_hash
                ))
            });
        };

        self.open_sealed(tenant, &format!("blob {}", blob.blob_hash), ciphertext, nonce, key_id)
    }

    /// Decrypt a column sealed under one of the tenant's data keys.
    /// `owner` names the row in errors and logs.
    fn open_sealed(
        &self,
        tenant: TenantId,
        owner: &str,
        ciphertext: &[u8],
        nonce: &[u8],
        key_id: &str,
    ) -> Result<String> {
        let service = self.require_encryption()?;
        let key_id = KeyId(key_id.to_string());
        let wrapped: Option<Vec<u8>> = self
            .conn
            .prepare_cached(
                "SELECT wrapped_key FROM data_encryption_keys WHERE tenant_id = ?1 AND key_id = ?2",
            )?
            .query_row(params![tenant.to_string(), key_id.as_str()], |row| row.get(0))
            .optional()?;
        let wrapped = wrapped.map(WrappedKey).ok_or_else(|| {
            MemgitError::IntegrityViolation(format!("{owner} references unknown data key {key_id}"))
        })?;

        let start = Instant::now();
        let key = service.unwrap_dek(&key_id, &wrapped)?;
        let text = service.decrypt_to_string(ciphertext, nonce, &key)?;
        debug!(
            owner,
            key_id = %key_id,
            elapsed_us = start.elapsed().as_micros(),
            "Decrypted column"
        );
        Ok(text)
    }

    fn load_blob(&self, tenant: TenantId, hash: &BlobHash) -> Result<Option<StoredBlob>> {
        let blob = self
            .conn
            .prepare_cached(&format!(
                "SELECT {BLOB_COLUMNS} FROM blobs WHERE tenant_id = ?1 AND blob_hash = ?2"
            ))?
            .query_row(params![tenant.to_string(), hash.as_str()], StoredBlob::from_row)
            .optional()?;
        Ok(blob)
    }

    fn blob_tags(&self, tenant: TenantId, hash: &BlobHash) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT tag FROM tags WHERE tenant_id = ?1 AND blob_hash = ?2 ORDER BY tag",
        )?;
        let rows = stmt.query_map(params![tenant.to_string(), hash.as_str()], |row| row.get(0))?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Plaintext preview of at most `chars` characters, `...` appended when
    /// cut.
    fn preview(&self, tenant: TenantId, blob: &StoredBlob, chars: usize) -> Result<String> {
        Ok(truncate_preview(&self.plaintext(tenant, blob)?, chars))
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Whether and how a tenant's new blobs are encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionStatus {
    /// No encryption service attached.
    Disabled,
    /// Service attached, but the tenant has no active data key.
    Enabled,
    /// New blobs are encrypted under the tenant's active data key.
    Active,
}

/// Row counts for one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Branches.
    pub branches: usize,
    /// Commits.
    pub commits: usize,
    /// Distinct blobs.
    pub blobs: usize,
    /// Blobs stored as ciphertext.
    pub encrypted_blobs: usize,
    /// Cross-references.
    pub links: usize,
    /// Tasks waiting to be claimed.
    pub open_tasks: usize,
    /// Recorded trails.
    pub trails: usize,
    /// Encryption status.
    pub encryption: EncryptionStatus,
    /// Active data key, if any.
    pub active_key_id: Option<KeyId>,
}

// ---------------------------------------------------------------------------
// Blob rows
// ---------------------------------------------------------------------------

const BLOB_COLUMNS: &str = "blob_hash, content, content_encrypted, nonce, encryption_key_id, \
                            content_type, byte_size, created_at";

/// A `blobs` row as stored.
#[derive(Debug, Clone)]
struct StoredBlob {
    blob_hash: BlobHash,
    content: Option<String>,
    content_encrypted: Option<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    encryption_key_id: Option<String>,
    content_type: String,
    byte_size: i64,
    created_at: String,
}

impl StoredBlob {
    /// Map a row selected with [`BLOB_COLUMNS`] (optionally prefixed).
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Self::from_row_at(row, 0)
    }

    /// Map [`BLOB_COLUMNS`] starting at column `at`.
    fn from_row_at(row: &rusqlite::Row<'_>, at: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            blob_hash: BlobHash(row.get(at)?),
            content: row.get(at + 1)?,
            content_encrypted: row.get(at + 2)?,
            nonce: row.get(at + 3)?,
            encryption_key_id: row.get(at + 4)?,
            content_type: row.get(at + 5)?,
            byte_size: row.get(at + 6)?,
            created_at: row.get(at + 7)?,
        })
    }

    fn is_encrypted(&self) -> bool {
        self.content_encrypted.is_some()
    }
}

/// Cut `text` to `chars` characters, appending `...` when anything was cut.
pub(crate) fn truncate_preview(text: &str, chars: usize) -> String {
    match text.char_indices().nth(chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Clamp a caller-supplied limit.
pub(crate) fn clamp_limit(requested: Option<usize>, default: usize, max: usize) -> usize {
    requested.unwrap_or(default).clamp(1, max.max(1))
}

/// SQLite wants signed integers for LIMIT.
pub(crate) fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Column conversions
// ---------------------------------------------------------------------------

/// Read a stored timestamp column.
pub(crate) fn ts_column(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Read an optional stored timestamp column.
pub(crate) fn opt_ts_column(
    row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get_ref(idx)? {
        ValueRef::Null => Ok(None),
        _ => ts_column(row, idx).map(Some),
    }
}

macro_rules! text_enum_sql {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: MemgitError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_enum_sql!(LinkType);
text_enum_sql!(TaskStatus);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extension trait to make `query_row` results optional.
trait OptionalExt<T> {
    /// Convert `QueryReturnedNoRows` into `Ok(None)`.
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
