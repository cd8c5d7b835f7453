//! Working sessions synced from client instances.
//!
//! A session is keyed by its client-chosen id and routed to a branch by
//! project name when first synced. Later syncs replace its content, summary
//! and status; the branch stays where it was first routed. Content is
//! sealed under the tenant's active data key when there is one.

use chrono::{DateTime, Utc};
use rusqlite::{ToSql, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{MemoryStore, clamp_limit, sql_limit, ts_column};
use crate::error::{MemgitError, Result};
use crate::hashing::{encode, format_ts, parse_ts};
use crate::types::TenantId;

/// Status written when callers give none.
pub const SYNCED: &str = "synced";

/// One sync from a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSync {
    /// Client-chosen session id.
    pub session_id: String,
    /// Project the session worked on; routed through `sessions.project_branches`.
    pub project: Option<String>,
    /// Session payload. Strings are kept verbatim, anything else as JSON.
    pub content: Value,
    /// Short human summary.
    pub summary: String,
    /// Free-form status label.
    pub status: String,
}

impl SessionSync {
    /// A `synced` session with empty content and summary.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            project: None,
            content: Value::Object(serde_json::Map::new()),
            summary: String::new(),
            status: SYNCED.to_string(),
        }
    }

    /// Set the project.
    #[must_use]
    pub fn project(mut self, project: impl Into<String>) -> Self {
        self.project = Some(project.into());
        self
    }

    /// Set the content.
    #[must_use]
    pub fn content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }

    /// Set the summary.
    #[must_use]
    pub fn summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Set the status.
    #[must_use]
    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// A stored session with its decrypted content.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    /// Client-chosen id.
    pub session_id: String,
    /// Branch the session was routed to.
    pub branch: String,
    /// Plaintext payload.
    pub content: String,
    /// Short human summary.
    pub summary: String,
    /// Status label.
    pub status: String,
    /// Last sync.
    pub synced_at: DateTime<Utc>,
    /// Whether the content is stored encrypted.
    pub encrypted: bool,
}

/// A session without its content, as listed in a brief.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSummary {
    /// Client-chosen id.
    pub session_id: String,
    /// Branch the session was routed to.
    pub branch: String,
    /// Short human summary.
    pub summary: String,
    /// Last sync.
    pub synced_at: DateTime<Utc>,
}

/// Filter for [`MemoryStore::list_sessions`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Only sessions routed to this branch.
    pub branch: Option<String>,
    /// Only sessions with this status.
    pub status: Option<String>,
    /// Maximum results.
    pub limit: Option<usize>,
}

const SESSION_COLUMNS: &str = "session_id, branch, content, content_encrypted, nonce, \
                               encryption_key_id, summary, status, synced_at";

struct StoredSession {
    session_id: String,
    branch: String,
    content: Option<String>,
    content_encrypted: Option<Vec<u8>>,
    nonce: Option<Vec<u8>>,
    encryption_key_id: Option<String>,
    summary: String,
    status: String,
    synced_at: DateTime<Utc>,
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSession> {
    Ok(StoredSession {
        session_id: row.get(0)?,
        branch: row.get(1)?,
        content: row.get(2)?,
        content_encrypted: row.get(3)?,
        nonce: row.get(4)?,
        encryption_key_id: row.get(5)?,
        summary: row.get(6)?,
        status: row.get(7)?,
        synced_at: ts_column(row, 8)?,
    })
}

impl MemoryStore {
    /// Branch a project's sessions are routed to.
    ///
    /// An exact key of `sessions.project_branches` wins; otherwise the first
    /// key (in key order) contained in the lowercased project name; otherwise
    /// the default branch.
    #[must_use]
    pub fn branch_for_project(&self, project: &str) -> String {
        let routes = &self.config.sessions.project_branches;
        if let Some(branch) = routes.get(project) {
            return branch.clone();
        }
        let lowered = project.to_lowercase();
        routes
            .iter()
            .find(|(key, _)| lowered.contains(key.as_str()))
            .map_or_else(|| self.config.general.default_branch.clone(), |(_, b)| b.clone())
    }

    /// Insert or update a session.
    ///
    /// # Errors
    ///
    /// - `Invalid` for an empty session id or status, or when the store
    ///   requires an active data key and the tenant has none.
    /// - `Unavailable` / `AuthenticationFailure` from the encryption layer.
    pub fn sync_session(&self, tenant: TenantId, sync: SessionSync) -> Result<Session> {
        if sync.session_id.trim().is_empty() {
            return Err(MemgitError::Invalid("session id is required".into()));
        }
        if sync.status.trim().is_empty() {
            return Err(MemgitError::Invalid("session status is required".into()));
        }
        let routed = match &sync.project {
            Some(project) => self.branch_for_project(project),
            None => self.config.general.default_branch.clone(),
        };
        let content = encode(&sync.content)?;
        let synced_at = parse_ts(&format_ts(Utc::now()))?;

        let tx = self.write_txn()?;
        let sealed = self.seal_for_tenant(&tx, tenant, &content)?;
        let encrypted = sealed.is_some();
        let (plain, ciphertext, nonce, key_id) = match sealed {
            Some((sealed, key_id)) => (
                None,
                Some(sealed.ciphertext),
                Some(sealed.nonce.to_vec()),
                Some(key_id.as_str().to_string()),
            ),
            None => (Some(content.as_str()), None, None, None),
        };
        let branch: String = tx.query_row(
            "INSERT INTO sessions
                (tenant_id, session_id, branch, content, content_encrypted, nonce,
                 encryption_key_id, summary, status, synced_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT (tenant_id, session_id) DO UPDATE SET
                content = excluded.content,
                content_encrypted = excluded.content_encrypted,
                nonce = excluded.nonce,
                encryption_key_id = excluded.encryption_key_id,
                summary = excluded.summary,
                status = excluded.status,
                synced_at = excluded.synced_at
             RETURNING branch",
            params![
                tenant.to_string(),
                sync.session_id,
                routed,
                plain,
                ciphertext,
                nonce,
                key_id,
                sync.summary,
                sync.status,
                format_ts(synced_at)
            ],
            |row| row.get(0),
        )?;
        tx.commit()?;

        info!(%tenant, session = %sync.session_id, %branch, encrypted, "Session synced");
        Ok(Session {
            session_id: sync.session_id,
            branch,
            content,
            summary: sync.summary,
            status: sync.status,
            synced_at,
            encrypted,
        })
    }

    /// Sessions matching `filter`, most recently synced first, with
    /// decrypted content.
    ///
    /// # Errors
    ///
    /// Storage or decryption errors; a session that cannot be decrypted
    /// fails the whole listing.
    pub fn list_sessions(&self, tenant: TenantId, filter: &SessionFilter) -> Result<Vec<Session>> {
        let limit = clamp_limit(
            filter.limit,
            self.config.sessions.default_limit,
            self.config.history.max_log_limit,
        );
        let mut sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE tenant_id = ?");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(tenant.to_string())];
        if let Some(branch) = &filter.branch {
            sql.push_str(" AND branch = ?");
            args.push(Box::new(branch.clone()));
        }
        if let Some(status) = &filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.clone()));
        }
        sql.push_str(" ORDER BY synced_at DESC, rowid DESC LIMIT ?");
        args.push(Box::new(sql_limit(limit)));

        let stored: Vec<StoredSession> = {
            let mut stmt = self.conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params_from_iter(args.iter()), session_from_row)?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        stored
            .into_iter()
            .map(|session| -> Result<Session> {
                let content = match (&session.content_encrypted, &session.nonce, &session.encryption_key_id) {
                    (Some(ciphertext), Some(nonce), Some(key_id)) => self.open_sealed(
                        tenant,
                        &format!("session {}", session.session_id),
                        ciphertext,
                        nonce,
                        key_id,
                    )?,
                    _ => session.content.clone().ok_or_else(|| {
                        MemgitError::IntegrityViolation(format!(
                            "session {} has neither plaintext nor ciphertext",
                            session.session_id
                        ))
                    })?,
                };
                Ok(Session {
                    encrypted: session.content_encrypted.is_some(),
                    session_id: session.session_id,
                    branch: session.branch,
                    content,
                    summary: session.summary,
                    status: session.status,
                    synced_at: session.synced_at,
                })
            })
            .collect()
    }

    /// The tenant's most recently synced sessions, without content.
    pub(super) fn recent_sessions(&self, tenant: TenantId, limit: usize) -> Result<Vec<SessionSummary>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT session_id, branch, summary, synced_at FROM sessions
             WHERE tenant_id = ?1 ORDER BY synced_at DESC, rowid DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant.to_string(), sql_limit(limit)], |row| {
            Ok(SessionSummary {
                session_id: row.get(0)?,
                branch: row.get(1)?,
                summary: row.get(2)?,
                synced_at: ts_column(row, 3)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    use memgit_crypto::{EnvelopeEncryption, LocalKms};
    use serde_json::json;

    use super::*;
    use crate::config::MemgitConfig;

    fn config() -> MemgitConfig {
        let mut config = MemgitConfig::default();
        config.sessions.project_branches = BTreeMap::from([
            ("iris".to_string(), "iris".to_string()),
            ("tint-atlanta".to_string(), "tint-atlanta".to_string()),
        ]);
        config
    }

    fn store() -> MemoryStore {
        let store = MemoryStore::open_in_memory(&config()).expect("open");
        store.init_tenant(TenantId::DEFAULT).expect("init");
        store
    }

    #[test]
    fn projects_route_to_branches() {
        let store = store();
        assert_eq!(store.branch_for_project("iris"), "iris");
        assert_eq!(store.branch_for_project("Tint-Atlanta-Website"), "tint-atlanta");
        assert_eq!(store.branch_for_project("somewhere else"), "command-center");
    }

    #[test]
    fn resync_replaces_content_but_keeps_branch() {
        let store = store();
        let t = TenantId::DEFAULT;
        let first = store
            .sync_session(
                t,
                SessionSync::new("s1")
                    .project("iris")
                    .content(json!({"turns": 3}))
                    .summary("first pass"),
            )
            .expect("first");
        assert_eq!(first.branch, "iris");
        assert_eq!(first.content, r#"{"turns": 3}"#);
        assert_eq!(first.status, SYNCED);

        let second = store
            .sync_session(
                t,
                SessionSync::new("s1")
                    .project("tint-atlanta")
                    .content(json!("plain notes"))
                    .summary("second pass")
                    .status("archived"),
            )
            .expect("second");
        assert_eq!(second.branch, "iris");

        let all = store.list_sessions(t, &SessionFilter::default()).expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].content, "plain notes");
        assert_eq!(all[0].summary, "second pass");
        assert_eq!(all[0].status, "archived");
    }

    #[test]
    fn listing_filters_and_orders_newest_first() {
        let store = store();
        let t = TenantId::DEFAULT;
        store.sync_session(t, SessionSync::new("a").project("iris")).expect("a");
        store.sync_session(t, SessionSync::new("b")).expect("b");
        store
            .sync_session(t, SessionSync::new("c").project("iris").status("pending"))
            .expect("c");

        let ids = |sessions: Vec<Session>| -> Vec<String> {
            sessions.into_iter().map(|s| s.session_id).collect()
        };
        assert_eq!(ids(store.list_sessions(t, &SessionFilter::default()).expect("all")), ["c", "b", "a"]);

        let iris = SessionFilter { branch: Some("iris".into()), ..SessionFilter::default() };
        assert_eq!(ids(store.list_sessions(t, &iris).expect("iris")), ["c", "a"]);

        let pending = SessionFilter { status: Some("pending".into()), ..SessionFilter::default() };
        assert_eq!(ids(store.list_sessions(t, &pending).expect("pending")), ["c"]);

        let one = SessionFilter { limit: Some(1), ..SessionFilter::default() };
        assert_eq!(ids(store.list_sessions(t, &one).expect("one")), ["c"]);
    }

    #[test]
    fn sessions_are_tenant_scoped() {
        let store = store();
        let other = TenantId(uuid::Uuid::from_u128(7));
        store.sync_session(TenantId::DEFAULT, SessionSync::new("s")).expect("default");
        store.sync_session(other, SessionSync::new("s").summary("mine")).expect("other");

        let mine = store.list_sessions(other, &SessionFilter::default()).expect("list");
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].summary, "mine");
        let theirs = store.list_sessions(TenantId::DEFAULT, &SessionFilter::default()).expect("list");
        assert_eq!(theirs[0].summary, "");
    }

    #[test]
    fn empty_session_id_is_invalid() {
        let store = store();
        assert!(matches!(
            store.sync_session(TenantId::DEFAULT, SessionSync::new(" ")),
            Err(MemgitError::Invalid(_))
        ));
    }

    #[test]
    fn content_is_sealed_under_the_active_key() {
        let service = EnvelopeEncryption::new(Arc::new(LocalKms::ephemeral()), Duration::from_secs(300));
        let store = MemoryStore::open_in_memory(&config())
            .expect("open")
            .with_encryption(Arc::new(service));
        let t = TenantId::DEFAULT;
        store.init_tenant(t).expect("init");
        store.provision_data_key(t).expect("provision");

        let synced = store
            .sync_session(t, SessionSync::new("secret").content(json!({"plan": "quiet"})))
            .expect("sync");
        assert!(synced.encrypted);

        let plaintext: Option<String> = store
            .conn
            .query_row("SELECT content FROM sessions WHERE session_id = 'secret'", [], |row| row.get(0))
            .expect("row");
        assert!(plaintext.is_none());

        let listed = store.list_sessions(t, &SessionFilter::default()).expect("list");
        assert_eq!(listed[0].content, r#"{"plan": "quiet"}"#);
        assert!(listed[0].encrypted);
    }
}
