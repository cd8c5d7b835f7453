//! Commit, recall, search and brief.

use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use memgit_crypto::{KeyId, Sealed};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::sessions::SessionSummary;
use super::{MemoryStore, OptionalExt, StoredBlob, clamp_limit, sql_limit, truncate_preview};
use crate::error::{MemgitError, Result};
use crate::hashing::{
    blob_hash, canonicalize, commit_hash, format_ts, next_commit_time, parse_ts, tree_hash,
};
use crate::types::{BlobHash, Commit, CommitHash, HeadRef, TenantId, TreeHash};

/// Tree entry names keep this many characters of the commit message.
const TREE_NAME_CHARS: usize = 100;

/// Commits returned by [`MemoryStore::brief`].
const BRIEF_RECENT_COMMITS: usize = 5;

/// Sessions returned by [`MemoryStore::brief`].
const BRIEF_RECENT_SESSIONS: usize = 5;

/// Search hits examined by [`MemoryStore::find_typed`] when callers give no limit.
const TYPED_LOOKUP_CANDIDATES: usize = 5;

// ---------------------------------------------------------------------------
// Request / result types
// ---------------------------------------------------------------------------

/// Everything needed to record one memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRequest {
    /// Target branch; must exist.
    pub branch: String,
    /// Payload. Strings are stored verbatim, anything else as JSON.
    pub content: Value,
    /// Commit message.
    pub message: String,
    /// Author; the configured default when `None`.
    pub author: Option<String>,
    /// Memory type, recorded as the blob's content type and tree mode.
    pub memory_type: String,
    /// Labels attached to the blob.
    pub tags: Vec<String>,
}

impl CommitRequest {
    /// A request with the default author, type `memory`, and no tags.
    pub fn new(branch: impl Into<String>, content: Value, message: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            content,
            message: message.into(),
            author: None,
            memory_type: "memory".to_string(),
            tags: Vec::new(),
        }
    }

    /// Set the author.
    #[must_use]
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set the memory type.
    #[must_use]
    pub fn memory_type(mut self, memory_type: impl Into<String>) -> Self {
        self.memory_type = memory_type.into();
        self
    }

    /// Set the tags.
    #[must_use]
    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }
}

/// Hashes produced by a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitResult {
    /// New branch head.
    pub commit_hash: CommitHash,
    /// Content address of the payload.
    pub blob_hash: BlobHash,
    /// Tree entry recorded by the commit.
    pub tree_hash: TreeHash,
    /// Branch that advanced.
    pub branch: String,
    /// Previous head, `None` when the branch was empty.
    pub parent_hash: Option<CommitHash>,
    /// Commit time.
    pub created_at: DateTime<Utc>,
    /// Whether the blob row already existed.
    pub deduplicated: bool,
    /// Whether the blob is stored encrypted.
    pub encrypted: bool,
}

/// How to find a memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecallKey {
    /// Directly by content address.
    Blob(BlobHash),
    /// Through commit → tree → blob.
    Commit(CommitHash),
}

/// A decrypted memory with its metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecalledMemory {
    /// Content address.
    pub blob_hash: BlobHash,
    /// Plaintext payload.
    pub content: String,
    /// Memory type.
    pub content_type: String,
    /// Payload size in bytes.
    pub byte_size: usize,
    /// When the blob was first stored.
    pub created_at: DateTime<Utc>,
    /// Whether the blob is stored encrypted.
    pub encrypted: bool,
    /// Labels on the blob.
    pub tags: Vec<String>,
    /// The commit used to find the blob, for [`RecallKey::Commit`].
    pub commit: Option<Commit>,
}

/// One search result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    /// Content address.
    pub blob_hash: BlobHash,
    /// Leading part of the plaintext.
    pub preview: String,
    /// Memory type.
    pub content_type: String,
    /// When the blob was first stored.
    pub created_at: DateTime<Utc>,
    /// Newest commit that recorded the blob.
    pub commit_hash: CommitHash,
    /// Its message.
    pub message: String,
    /// Its author.
    pub author: String,
}

/// A recalled memory whose payload is a JSON object of the wanted `type`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypedMemory {
    /// The memory as recalled.
    pub memory: RecalledMemory,
    /// Its parsed payload.
    pub value: Value,
}

/// How a payload relates to a wanted `type` field.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedContent {
    /// A JSON object whose `type` is the wanted one.
    Matched(Value),
    /// Valid JSON, but not an object with that `type`.
    OtherType,
    /// Not JSON at all.
    NotJson,
}

impl TypedContent {
    /// Classify `content` against `type_name`.
    #[must_use]
    pub fn classify(content: &str, type_name: &str) -> Self {
        match serde_json::from_str::<Value>(content) {
            Err(_) => Self::NotJson,
            Ok(value) if value.get("type").and_then(Value::as_str) == Some(type_name) => {
                Self::Matched(value)
            }
            Ok(_) => Self::OtherType,
        }
    }
}

/// Orientation summary for a branch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Brief {
    /// Branch the brief is for.
    pub branch: String,
    /// Its head.
    pub head: HeadRef,
    /// Most recent commits across the whole tenant.
    pub recent_commits: Vec<Commit>,
    /// All branch names.
    pub branches: Vec<String>,
    /// Most recently synced sessions across the whole tenant.
    pub pending_sessions: Vec<SessionSummary>,
    /// When the brief was generated.
    pub generated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl MemoryStore {
    /// Record a memory on a branch.
    ///
    /// Blob, tree entry, commit, head advance and tags are written in one
    /// immediate transaction; any failure (including the key-management
    /// backend) rolls all of it back.
    ///
    /// # Errors
    ///
    /// - `Invalid` for empty content, message or branch name.
    /// - `NotFound` if the branch does not exist.
    /// - `Invalid` if the store requires an active data key and the tenant
    ///   has none.
    /// - `Unavailable` / `AuthenticationFailure` from the encryption layer.
    /// - `Conflict` if the head moved under the transaction.
    pub fn commit(&self, tenant: TenantId, request: CommitRequest) -> Result<CommitResult> {
        let start = Instant::now();
        if request.branch.trim().is_empty() {
            return Err(MemgitError::Invalid("branch is required".into()));
        }
        if request.message.trim().is_empty() {
            return Err(MemgitError::Invalid("message is required".into()));
        }
        let canonical = canonicalize(&request.content)?;
        let blob = blob_hash(&canonical);
        let author = request
            .author
            .clone()
            .unwrap_or_else(|| self.config.general.default_author.clone());
        let t = tenant.to_string();

        let tx = self.write_txn()?;

        let head = read_head(&tx, tenant, &request.branch)?
            .ok_or_else(|| MemgitError::not_found("branch", &request.branch))?;
        let parent = head.commit().cloned();
        let parent_time = match &parent {
            Some(hash) => tx
                .query_row(
                    "SELECT created_at FROM commits WHERE tenant_id = ?1 AND commit_hash = ?2",
                    params![t, hash.as_str()],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .and_then(|raw| parse_ts(&raw).ok()),
            None => None,
        };
        let created_at = next_commit_time(Utc::now(), parent_time);
        let ts = format_ts(created_at);

        // Blob: at most one row per content address.
        let exists = tx
            .query_row(
                "SELECT 1 FROM blobs WHERE tenant_id = ?1 AND blob_hash = ?2",
                params![t, blob.as_str()],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        let encrypted = if exists {
            tx.query_row(
                "SELECT content_encrypted IS NOT NULL FROM blobs WHERE tenant_id = ?1 AND blob_hash = ?2",
                params![t, blob.as_str()],
                |row| row.get(0),
            )?
        } else {
            let sealed = self.seal_for_tenant(&tx, tenant, &canonical)?;
            let encrypted = sealed.is_some();
            insert_blob(&tx, tenant, &blob, &canonical, sealed, &request.memory_type, &ts)?;
            encrypted
        };

        let tree = tree_hash(&request.branch, &blob, &ts);
        let name: String = request.message.chars().take(TREE_NAME_CHARS).collect();
        tx.execute(
            "INSERT INTO tree_entries (tenant_id, tree_hash, name, blob_hash, mode)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![t, tree.as_str(), name, blob.as_str(), request.memory_type],
        )?;

        let commit = commit_hash(&tree, parent.as_ref(), &request.message, &ts);
        tx.execute(
            "INSERT INTO commits (tenant_id, commit_hash, tree_hash, parent_hash, author, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                t,
                commit.as_str(),
                tree.as_str(),
                parent.as_ref().map(CommitHash::as_str),
                author,
                request.message,
                ts
            ],
        )?;

        super::branches::advance_head(&tx, tenant, &request.branch, &head, &commit)?;

        for tag in &request.tags {
            tx.execute(
                "INSERT INTO tags (tenant_id, blob_hash, tag, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (tenant_id, blob_hash, tag) DO NOTHING",
                params![t, blob.as_str(), tag, ts],
            )?;
        }

        tx.commit()?;

        info!(
            %tenant,
            branch = %request.branch,
            commit = %commit,
            blob = %blob,
            deduplicated = exists,
            encrypted,
            elapsed_us = start.elapsed().as_micros(),
            "Committed memory"
        );

        Ok(CommitResult {
            commit_hash: commit,
            blob_hash: blob,
            tree_hash: tree,
            branch: request.branch,
            parent_hash: parent,
            created_at,
            deduplicated: exists,
            encrypted,
        })
    }

    /// Encrypt `canonical` for a new blob, or decide to store plaintext.
    pub(super) fn seal_for_tenant(
        &self,
        conn: &Connection,
        tenant: TenantId,
        canonical: &str,
    ) -> Result<Option<(Sealed, KeyId)>> {
        let Some(service) = &self.encryption else {
            return Ok(None);
        };
        match self.active_key(conn, tenant)? {
            Some((key_id, wrapped)) => {
                let key = service.unwrap_dek(&key_id, &wrapped)?;
                let sealed = service.encrypt(canonical.as_bytes(), &key)?;
                Ok(Some((sealed, key_id)))
            }
            None if self.config.encryption.require_active_key => Err(MemgitError::Invalid(
                format!("tenant {tenant} has no active data encryption key"),
            )),
            None => {
                warn!(%tenant, "No active data key for tenant; storing blob unencrypted");
                Ok(None)
            }
        }
    }

    /// Fetch and decrypt a memory.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown blob or commit.
    /// - `IntegrityViolation` if a commit's tree or blob is missing.
    /// - `AuthenticationFailure` / `Unavailable` from decryption; never
    ///   empty content.
    pub fn recall(&self, tenant: TenantId, key: &RecallKey) -> Result<RecalledMemory> {
        let (blob_hash, commit) = match key {
            RecallKey::Blob(hash) => (hash.clone(), None),
            RecallKey::Commit(hash) => {
                let commit = self
                    .load_commit(tenant, hash)?
                    .ok_or_else(|| MemgitError::not_found("commit", hash))?;
                let blob: Option<String> = self
                    .conn
                    .query_row(
                        "SELECT blob_hash FROM tree_entries WHERE tenant_id = ?1 AND tree_hash = ?2",
                        params![tenant.to_string(), commit.tree_hash.as_str()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let blob = blob.ok_or_else(|| {
                    MemgitError::IntegrityViolation(format!(
                        "commit {hash} points at missing tree {}",
                        commit.tree_hash
                    ))
                })?;
                (BlobHash(blob), Some(commit))
            }
        };

        let stored = match self.load_blob(tenant, &blob_hash)? {
            Some(stored) => stored,
            None if commit.is_some() => {
                return Err(MemgitError::IntegrityViolation(format!(
                    "tree entry points at missing blob {blob_hash}"
                )));
            }
            None => return Err(MemgitError::not_found("blob", &blob_hash)),
        };

        let content = self.plaintext(tenant, &stored)?;
        let tags = self.blob_tags(tenant, &blob_hash)?;
        debug!(%tenant, blob = %blob_hash, encrypted = stored.is_encrypted(), "Recalled memory");

        Ok(RecalledMemory {
            blob_hash,
            content,
            content_type: stored.content_type.clone(),
            byte_size: usize::try_from(stored.byte_size).unwrap_or(0),
            created_at: parse_ts(&stored.created_at)?,
            encrypted: stored.is_encrypted(),
            tags,
            commit,
        })
    }

    /// Newest-first substring search over committed memories.
    ///
    /// Encrypted blobs are decrypted to test the match. A decryption or
    /// key-management failure aborts the search; it never counts as a
    /// non-match.
    ///
    /// # Errors
    ///
    /// `Invalid` for an empty query, plus any decryption error.
    pub fn search(
        &self,
        tenant: TenantId,
        query: &str,
        content_type: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<SearchHit>> {
        if query.is_empty() {
            return Err(MemgitError::Invalid("search query is required".into()));
        }
        let start = Instant::now();
        let limit = clamp_limit(
            limit,
            self.config.search.default_limit,
            self.config.history.max_log_limit,
        );

        let mut stmt = self.conn.prepare_cached(
            "SELECT b.blob_hash, b.content, b.content_encrypted, b.nonce, b.encryption_key_id,
                    b.content_type, b.byte_size, b.created_at,
                    c.commit_hash, c.message, c.author
             FROM blobs b
             JOIN tree_entries t ON t.tenant_id = b.tenant_id AND t.blob_hash = b.blob_hash
             JOIN commits c ON c.tenant_id = t.tenant_id AND c.tree_hash = t.tree_hash
             WHERE b.tenant_id = ?1
               AND (b.content_encrypted IS NOT NULL OR instr(b.content, ?2) > 0)
               AND (?3 IS NULL OR b.content_type = ?3)
             ORDER BY b.created_at DESC, c.created_at DESC",
        )?;
        let mut rows = stmt.query(params![tenant.to_string(), query, content_type])?;

        let mut seen = HashSet::new();
        let mut scanned = 0usize;
        let mut hits = Vec::new();
        while let Some(row) = rows.next()? {
            let blob = StoredBlob::from_row(row)?;
            if seen.contains(&blob.blob_hash) {
                continue;
            }
            scanned += 1;
            let text = self.plaintext(tenant, &blob)?;
            seen.insert(blob.blob_hash.clone());
            if !text.contains(query) {
                continue;
            }
            hits.push(SearchHit {
                preview: truncate_preview(&text, self.config.search.preview_chars),
                content_type: blob.content_type,
                created_at: parse_ts(&blob.created_at)?,
                commit_hash: CommitHash(row.get(8)?),
                message: row.get(9)?,
                author: row.get(10)?,
                blob_hash: blob.blob_hash,
            });
            if hits.len() >= limit {
                break;
            }
        }

        debug!(
            %tenant,
            scanned,
            hits = hits.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Search complete"
        );
        Ok(hits)
    }

    /// First search hit for `query` whose payload is a JSON object with
    /// `"type": type_name`.
    ///
    /// Up to `limit` hits (default 5) are recalled newest first. A payload
    /// that is not JSON, or is JSON of another type, is skipped; every
    /// storage or decryption failure is returned.
    ///
    /// # Errors
    ///
    /// `Invalid` for an empty query or type name, plus anything
    /// [`Self::search`] or [`Self::recall`] returns.
    pub fn find_typed(
        &self,
        tenant: TenantId,
        query: &str,
        type_name: &str,
        limit: Option<usize>,
    ) -> Result<Option<TypedMemory>> {
        if type_name.is_empty() {
            return Err(MemgitError::Invalid("type name is required".into()));
        }
        let limit = limit.unwrap_or(TYPED_LOOKUP_CANDIDATES);
        for hit in self.search(tenant, query, None, Some(limit))? {
            let memory = self.recall(tenant, &RecallKey::Blob(hit.blob_hash))?;
            match TypedContent::classify(&memory.content, type_name) {
                TypedContent::Matched(value) => {
                    debug!(%tenant, blob = %memory.blob_hash, type_name, "Typed memory found");
                    return Ok(Some(TypedMemory { memory, value }));
                }
                TypedContent::OtherType | TypedContent::NotJson => {
                    debug!(%tenant, blob = %memory.blob_hash, type_name, "Skipping candidate");
                }
            }
        }
        Ok(None)
    }

    /// Branch head, the tenant's latest commits and sessions, and all
    /// branch names.
    ///
    /// # Errors
    ///
    /// `NotFound` if the branch does not exist.
    pub fn brief(&self, tenant: TenantId, branch: &str) -> Result<Brief> {
        let head = read_head(&self.conn, tenant, branch)?
            .ok_or_else(|| MemgitError::not_found("branch", branch))?;
        let recent_commits = self.recent_commits(tenant, BRIEF_RECENT_COMMITS)?;
        let branches = self
            .list_branches(tenant)?
            .into_iter()
            .map(|b| b.name)
            .collect();
        let pending_sessions = self.recent_sessions(tenant, BRIEF_RECENT_SESSIONS)?;

        Ok(Brief {
            branch: branch.to_string(),
            head,
            recent_commits,
            branches,
            pending_sessions,
            generated_at: Utc::now(),
        })
    }

    fn recent_commits(&self, tenant: TenantId, limit: usize) -> Result<Vec<Commit>> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {} FROM commits WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2",
            super::history::COMMIT_COLUMNS
        ))?;
        let rows = stmt.query_map(
            params![tenant.to_string(), sql_limit(limit)],
            super::history::raw_commit,
        )?;
        rows.map(|row| super::history::finish_commit(row?)).collect()
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Current head of `branch`, `None` if the branch does not exist.
pub(super) fn read_head(
    conn: &Connection,
    tenant: TenantId,
    branch: &str,
) -> Result<Option<HeadRef>> {
    let head: Option<String> = conn
        .prepare_cached("SELECT head_commit FROM branches WHERE tenant_id = ?1 AND name = ?2")?
        .query_row(params![tenant.to_string(), branch], |row| row.get(0))
        .optional()?;
    Ok(head.as_deref().map(HeadRef::from_column))
}

pub(super) fn insert_blob(
    conn: &Connection,
    tenant: TenantId,
    hash: &BlobHash,
    canonical: &str,
    sealed: Option<(Sealed, KeyId)>,
    content_type: &str,
    ts: &str,
) -> Result<()> {
    let byte_size = i64::try_from(canonical.len()).unwrap_or(i64::MAX);
    match sealed {
        Some((sealed, key_id)) => conn.execute(
            "INSERT INTO blobs (tenant_id, blob_hash, content, content_encrypted, nonce,
                                encryption_key_id, content_type, byte_size, created_at)
             VALUES (?1, ?2, NULL, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (tenant_id, blob_hash) DO NOTHING",
            params![
                tenant.to_string(),
                hash.as_str(),
                sealed.ciphertext,
                sealed.nonce.as_slice(),
                key_id.as_str(),
                content_type,
                byte_size,
                ts
            ],
        )?,
        None => conn.execute(
            "INSERT INTO blobs (tenant_id, blob_hash, content, content_type, byte_size, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (tenant_id, blob_hash) DO NOTHING",
            params![tenant.to_string(), hash.as_str(), canonical, content_type, byte_size, ts],
        )?,
    };
    Ok(())
}
