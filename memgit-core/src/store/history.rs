//! Commit lookup and the lazy parent-chain walk behind `log`.

use std::collections::HashSet;

use rusqlite::params;
use tracing::warn;

use super::objects::read_head;
use super::{MemoryStore, OptionalExt, clamp_limit};
use crate::error::{MemgitError, Result};
use crate::hashing::parse_ts;
use crate::types::{Commit, CommitHash, TenantId, TreeHash};

pub(super) const COMMIT_COLUMNS: &str =
    "commit_hash, tree_hash, parent_hash, author, message, created_at";

/// A commit row before its timestamp is parsed.
pub(super) struct RawCommit {
    commit_hash: String,
    tree_hash: String,
    parent_hash: Option<String>,
    author: String,
    message: String,
    created_at: String,
}

pub(super) fn raw_commit(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCommit> {
    Ok(RawCommit {
        commit_hash: row.get(0)?,
        tree_hash: row.get(1)?,
        parent_hash: row.get(2)?,
        author: row.get(3)?,
        message: row.get(4)?,
        created_at: row.get(5)?,
    })
}

pub(super) fn finish_commit(raw: RawCommit) -> Result<Commit> {
    Ok(Commit {
        created_at: parse_ts(&raw.created_at)?,
        commit_hash: CommitHash(raw.commit_hash),
        tree_hash: TreeHash(raw.tree_hash),
        parent_hash: raw.parent_hash.map(CommitHash),
        author: raw.author,
        message: raw.message,
    })
}

/// Newest-first walk over a branch's parent chain.
///
/// Yields commits until it reaches the first commit, a missing commit (the
/// chain is broken, so the walk is truncated with a warning), or a commit
/// it has already yielded. A storage error is yielded once and ends the
/// walk. The walk is finite and restartable: every call to
/// [`MemoryStore::history`] starts again from the current head.
#[derive(Debug)]
pub struct History<'a> {
    store: &'a MemoryStore,
    tenant: TenantId,
    next: Option<CommitHash>,
    seen: HashSet<CommitHash>,
}

impl Iterator for History<'_> {
    type Item = Result<Commit>;

    fn next(&mut self) -> Option<Self::Item> {
        let hash = self.next.take()?;
        if !self.seen.insert(hash.clone()) {
            warn!(tenant = %self.tenant, commit = %hash, "Parent chain loops; truncating history");
            return None;
        }
        match self.store.load_commit(self.tenant, &hash) {
            Ok(Some(commit)) => {
                self.next.clone_from(&commit.parent_hash);
                Some(Ok(commit))
            }
            Ok(None) => {
                let err = MemgitError::IntegrityViolation(format!("missing commit {hash}"));
                warn!(tenant = %self.tenant, error = %err, "Broken parent chain; truncating history");
                None
            }
            Err(e) => Some(Err(e)),
        }
    }
}

impl MemoryStore {
    /// Look up one commit.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn load_commit(&self, tenant: TenantId, hash: &CommitHash) -> Result<Option<Commit>> {
        let raw = self
            .conn
            .prepare_cached(&format!(
                "SELECT {COMMIT_COLUMNS} FROM commits WHERE tenant_id = ?1 AND commit_hash = ?2"
            ))?
            .query_row(params![tenant.to_string(), hash.as_str()], raw_commit)
            .optional()?;
        raw.map(finish_commit).transpose()
    }

    /// Lazy history of `branch`, starting at its current head.
    ///
    /// # Errors
    ///
    /// `NotFound` if the branch does not exist.
    pub fn history(&self, tenant: TenantId, branch: &str) -> Result<History<'_>> {
        let head = read_head(&self.conn, tenant, branch)?
            .ok_or_else(|| MemgitError::not_found("branch", branch))?;
        Ok(History {
            store: self,
            tenant,
            next: head.commit().cloned(),
            seen: HashSet::new(),
        })
    }

    /// At most `limit` commits of `branch`, newest first.
    ///
    /// `limit` defaults to `history.default_log_limit` and is capped at
    /// `history.max_log_limit`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the branch does not exist, or a storage error hit
    /// during the walk.
    pub fn log(&self, tenant: TenantId, branch: &str, limit: Option<usize>) -> Result<Vec<Commit>> {
        let limit = clamp_limit(
            limit,
            self.config.history.default_log_limit,
            self.config.history.max_log_limit,
        );
        self.history(tenant, branch)?.take(limit).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemgitConfig;
    use crate::store::CommitRequest;
    use serde_json::json;

    fn store_with_commits(n: usize) -> (MemoryStore, Vec<CommitHash>) {
        let store = MemoryStore::open_in_memory(&MemgitConfig::default()).expect("open");
        store.init_tenant(TenantId::DEFAULT).expect("init");
        let hashes = (0..n)
            .map(|i| {
                store
                    .commit(
                        TenantId::DEFAULT,
                        CommitRequest::new("command-center", json!(format!("memory {i}")), "m"),
                    )
                    .expect("commit")
                    .commit_hash
            })
            .collect();
        (store, hashes)
    }

    #[test]
    fn log_is_newest_first_and_bounded() {
        let (store, hashes) = store_with_commits(5);
        let log = store.log(TenantId::DEFAULT, "command-center", Some(3)).expect("log");
        let got: Vec<_> = log.iter().map(|c| c.commit_hash.clone()).collect();
        assert_eq!(got, vec![hashes[4].clone(), hashes[3].clone(), hashes[2].clone()]);
        assert_eq!(log[0].parent_hash.as_ref(), Some(&hashes[3]));
    }

    #[test]
    fn empty_branch_has_empty_history() {
        let (store, _) = store_with_commits(0);
        assert!(store.log(TenantId::DEFAULT, "command-center", None).expect("log").is_empty());
        assert!(matches!(
            store.log(TenantId::DEFAULT, "missing", None),
            Err(MemgitError::NotFound { .. })
        ));
    }

    #[test]
    fn broken_chain_truncates() {
        let (store, hashes) = store_with_commits(4);
        store
            .conn
            .execute("DELETE FROM commits WHERE commit_hash = ?1", [hashes[1].as_str()])
            .expect("delete");

        let log = store.log(TenantId::DEFAULT, "command-center", Some(10)).expect("log");
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].commit_hash, hashes[2]);
    }

    #[test]
    fn cyclic_chain_terminates() {
        let (store, hashes) = store_with_commits(3);
        // Point the first commit's parent at the head.
        store
            .conn
            .execute(
                "UPDATE commits SET parent_hash = ?1 WHERE commit_hash = ?2",
                [hashes[2].as_str(), hashes[0].as_str()],
            )
            .expect("update");
        let log = store.log(TenantId::DEFAULT, "command-center", Some(100)).expect("log");
        assert_eq!(log.len(), 3);
    }
}
