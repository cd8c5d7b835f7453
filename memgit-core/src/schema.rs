//! Relational schema.
//!
//! One database holds every tenant. Every table carries `tenant_id` and
//! every primary or unique key starts with it, so tenant isolation is a
//! property of the keys rather than of query discipline alone.

use rusqlite::Connection;

use crate::error::Result;

/// Idempotent DDL for the whole store.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS branches (
    tenant_id    TEXT NOT NULL,
    name         TEXT NOT NULL,
    head_commit  TEXT NOT NULL DEFAULT 'GENESIS',
    created_at   TEXT NOT NULL,
    PRIMARY KEY (tenant_id, name)
);

CREATE TABLE IF NOT EXISTS blobs (
    tenant_id          TEXT NOT NULL,
    blob_hash          TEXT NOT NULL,
    content            TEXT,
    content_encrypted  BLOB,
    nonce              BLOB,
    encryption_key_id  TEXT,
    content_type       TEXT NOT NULL DEFAULT 'memory',
    byte_size          INTEGER NOT NULL,
    created_at         TEXT NOT NULL,
    PRIMARY KEY (tenant_id, blob_hash),
    CHECK (content IS NOT NULL OR (content_encrypted IS NOT NULL AND nonce IS NOT NULL))
);

CREATE TABLE IF NOT EXISTS tree_entries (
    tenant_id  TEXT NOT NULL,
    tree_hash  TEXT NOT NULL,
    name       TEXT NOT NULL,
    blob_hash  TEXT NOT NULL,
    mode       TEXT NOT NULL,
    PRIMARY KEY (tenant_id, tree_hash),
    FOREIGN KEY (tenant_id, blob_hash) REFERENCES blobs (tenant_id, blob_hash)
);

CREATE TABLE IF NOT EXISTS commits (
    tenant_id    TEXT NOT NULL,
    commit_hash  TEXT NOT NULL,
    tree_hash    TEXT NOT NULL,
    parent_hash  TEXT,
    author       TEXT NOT NULL,
    message      TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    PRIMARY KEY (tenant_id, commit_hash),
    FOREIGN KEY (tenant_id, tree_hash) REFERENCES tree_entries (tenant_id, tree_hash)
);

CREATE INDEX IF NOT EXISTS idx_commits_created ON commits (tenant_id, created_at DESC);
CREATE INDEX IF NOT EXISTS idx_commits_tree ON commits (tenant_id, tree_hash);

CREATE TABLE IF NOT EXISTS tags (
    tenant_id   TEXT NOT NULL,
    blob_hash   TEXT NOT NULL,
    tag         TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE (tenant_id, blob_hash, tag)
);

CREATE TABLE IF NOT EXISTS cross_references (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id      TEXT NOT NULL,
    source_blob    TEXT NOT NULL,
    target_blob    TEXT NOT NULL,
    source_branch  TEXT NOT NULL,
    target_branch  TEXT NOT NULL,
    link_type      TEXT NOT NULL,
    weight         REAL NOT NULL DEFAULT 1.0,
    reasoning      TEXT,
    created_by     TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    UNIQUE (tenant_id, source_blob, target_blob, link_type)
);

CREATE INDEX IF NOT EXISTS idx_xref_source ON cross_references (tenant_id, source_blob);
CREATE INDEX IF NOT EXISTS idx_xref_target ON cross_references (tenant_id, target_blob);

CREATE TABLE IF NOT EXISTS data_encryption_keys (
    tenant_id    TEXT NOT NULL,
    key_id       TEXT NOT NULL,
    wrapped_key  BLOB NOT NULL,
    algorithm    TEXT NOT NULL DEFAULT 'AES-256-GCM',
    status       TEXT NOT NULL CHECK (status IN ('active', 'rotated')),
    created_at   TEXT NOT NULL,
    rotated_at   TEXT,
    PRIMARY KEY (tenant_id, key_id)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_dek_one_active
    ON data_encryption_keys (tenant_id) WHERE status = 'active';

CREATE TABLE IF NOT EXISTS tasks (
    tenant_id       TEXT NOT NULL,
    id              TEXT NOT NULL,
    description     TEXT NOT NULL,
    branch          TEXT NOT NULL,
    priority        INTEGER NOT NULL DEFAULT 5,
    status          TEXT NOT NULL DEFAULT 'open',
    assigned_to     TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    blocked_reason  TEXT,
    claimed_at      TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    PRIMARY KEY (tenant_id, id)
);

CREATE INDEX IF NOT EXISTS idx_tasks_queue ON tasks (tenant_id, status, priority, created_at);

CREATE TABLE IF NOT EXISTS sessions (
    tenant_id          TEXT NOT NULL,
    session_id         TEXT NOT NULL,
    branch             TEXT NOT NULL,
    content            TEXT,
    content_encrypted  BLOB,
    nonce              BLOB,
    encryption_key_id  TEXT,
    summary            TEXT NOT NULL DEFAULT '',
    status             TEXT NOT NULL DEFAULT 'synced',
    synced_at          TEXT NOT NULL,
    PRIMARY KEY (tenant_id, session_id),
    CHECK (content IS NOT NULL OR (content_encrypted IS NOT NULL AND nonce IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_sessions_synced ON sessions (tenant_id, synced_at DESC);

CREATE TABLE IF NOT EXISTS trails (
    tenant_id       TEXT NOT NULL,
    source_blob     TEXT NOT NULL,
    target_blob     TEXT NOT NULL,
    strength        INTEGER NOT NULL DEFAULT 1,
    last_traversed  TEXT NOT NULL,
    PRIMARY KEY (tenant_id, source_blob, target_blob)
);
";

/// Create every table and index that does not exist yet.
///
/// # Errors
/// Returns `MemgitError::Database` on SQLite failures.
pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent() {
        let conn = Connection::open_in_memory().expect("open");
        apply(&conn).expect("first");
        apply(&conn).expect("second");
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(tables, 10);
    }

    #[test]
    fn one_active_key_per_tenant() {
        let conn = Connection::open_in_memory().expect("open");
        apply(&conn).expect("schema");
        let insert = "INSERT INTO data_encryption_keys (key_id, tenant_id, wrapped_key, status, created_at)
                      VALUES (?1, 't', x'00', 'active', 'now')";
        conn.execute(insert, ["k1"]).expect("first active");
        let err = conn.execute(insert, ["k2"]).expect_err("second active");
        assert!(crate::error::is_unique_violation(&err));
    }

    #[test]
    fn key_ids_are_scoped_by_tenant() {
        let conn = Connection::open_in_memory().expect("open");
        apply(&conn).expect("schema");
        let insert = "INSERT INTO data_encryption_keys (key_id, tenant_id, wrapped_key, status, created_at)
                      VALUES ('shared', ?1, x'00', 'active', 'now')";
        conn.execute(insert, ["a"]).expect("tenant a");
        conn.execute(insert, ["b"]).expect("same id in tenant b");
        let err = conn.execute(insert, ["a"]).expect_err("same id twice in tenant a");
        assert!(crate::error::is_unique_violation(&err));
    }
}
