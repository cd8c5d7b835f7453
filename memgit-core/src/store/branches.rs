//! Branch pointers.

use chrono::Utc;
use rusqlite::{Connection, params};
use tracing::info;

use super::objects::read_head;
use super::{MemoryStore, OptionalExt};
use crate::error::{MemgitError, Result, is_unique_violation};
use crate::hashing::{format_ts, parse_ts};
use crate::types::{Branch, CommitHash, HeadInfo, HeadRef, TenantId};

impl MemoryStore {
    /// Create `name` at the current head of `from` (the default branch when
    /// `None`). A missing source branch starts the new branch at `GENESIS`.
    ///
    /// # Errors
    ///
    /// - `Invalid` for an empty name.
    /// - `Conflict` if `name` already exists.
    pub fn create_branch(&self, tenant: TenantId, name: &str, from: Option<&str>) -> Result<Branch> {
        if name.trim().is_empty() {
            return Err(MemgitError::Invalid("branch name is required".into()));
        }
        let from = from.unwrap_or(&self.config.general.default_branch);
        let created_at = Utc::now();

        let tx = self.write_txn()?;
        let head = read_head(&tx, tenant, from)?.unwrap_or(HeadRef::Genesis);
        let inserted = tx.execute(
            "INSERT INTO branches (tenant_id, name, head_commit, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![tenant.to_string(), name, head.as_column(), format_ts(created_at)],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(MemgitError::Conflict(format!("branch `{name}` already exists")));
            }
            Err(e) => return Err(e.into()),
        }
        tx.commit()?;

        info!(%tenant, branch = name, from, head = %head, "Branch created");
        Ok(Branch {
            name: name.to_string(),
            head,
            created_at,
        })
    }

    /// Head of `name` with its commit. A pure read: the store keeps no
    /// notion of a current branch.
    ///
    /// # Errors
    ///
    /// `NotFound` if the branch does not exist.
    pub fn checkout(&self, tenant: TenantId, name: &str) -> Result<HeadInfo> {
        let head = read_head(&self.conn, tenant, name)?
            .ok_or_else(|| MemgitError::not_found("branch", name))?;
        let commit = match head.commit() {
            Some(hash) => self.load_commit(tenant, hash)?,
            None => None,
        };
        Ok(HeadInfo {
            branch: name.to_string(),
            head,
            commit,
        })
    }

    /// Alias of [`Self::checkout`].
    ///
    /// # Errors
    ///
    /// `NotFound` if the branch does not exist.
    pub fn head(&self, tenant: TenantId, name: &str) -> Result<HeadInfo> {
        self.checkout(tenant, name)
    }

    /// One branch, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn branch(&self, tenant: TenantId, name: &str) -> Result<Option<Branch>> {
        let row: Option<(String, String, String)> = self
            .conn
            .prepare_cached(
                "SELECT name, head_commit, created_at FROM branches WHERE tenant_id = ?1 AND name = ?2",
            )?
            .query_row(params![tenant.to_string(), name], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .optional()?;
        row.map(branch_from_parts).transpose()
    }

    /// All branches of the tenant, by name.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn list_branches(&self, tenant: TenantId) -> Result<Vec<Branch>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT name, head_commit, created_at FROM branches WHERE tenant_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map([tenant.to_string()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })?;
        rows.map(|row| branch_from_parts(row?)).collect()
    }
}

fn branch_from_parts((name, head, created_at): (String, String, String)) -> Result<Branch> {
    Ok(Branch {
        name,
        head: HeadRef::from_column(&head),
        created_at: parse_ts(&created_at)?,
    })
}

/// Move `branch` from `expected` to `new`.
///
/// A compare-and-swap: if the stored head is no longer `expected` nothing is
/// written and the result is `Conflict`. Commits run this inside an
/// immediate transaction, so the swap only fails when something bypassed
/// the write lock.
pub(super) fn advance_head(
    conn: &Connection,
    tenant: TenantId,
    branch: &str,
    expected: &HeadRef,
    new: &CommitHash,
) -> Result<()> {
    let updated = conn.execute(
        "UPDATE branches SET head_commit = ?1
         WHERE tenant_id = ?2 AND name = ?3 AND head_commit = ?4",
        params![new.as_str(), tenant.to_string(), branch, expected.as_column()],
    )?;
    if updated == 1 {
        Ok(())
    } else {
        Err(MemgitError::Conflict(format!(
            "branch `{branch}` moved away from {expected} during commit"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemgitConfig;
    use crate::store::CommitRequest;
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::open_in_memory(&MemgitConfig::default()).expect("open");
        store.init_tenant(TenantId::DEFAULT).expect("init");
        store
    }

    #[test]
    fn new_branch_copies_source_head() {
        let store = store();
        let t = TenantId::DEFAULT;
        let c = store
            .commit(t, CommitRequest::new("command-center", json!("x"), "m"))
            .expect("commit");
        let b = store.create_branch(t, "b1", Some("command-center")).expect("branch");
        assert_eq!(b.head, HeadRef::Commit(c.commit_hash));
    }

    #[test]
    fn missing_source_starts_at_genesis() {
        let store = store();
        let b = store
            .create_branch(TenantId::DEFAULT, "b1", Some("nope"))
            .expect("branch");
        assert_eq!(b.head, HeadRef::Genesis);
    }

    #[test]
    fn duplicate_branch_conflicts() {
        let store = store();
        store.create_branch(TenantId::DEFAULT, "b1", None).expect("first");
        assert!(matches!(
            store.create_branch(TenantId::DEFAULT, "b1", None),
            Err(MemgitError::Conflict(_))
        ));
    }

    #[test]
    fn branches_are_tenant_scoped() {
        let store = store();
        let other = TenantId::new();
        store.create_branch(other, "b1", None).expect("other tenant");
        store.create_branch(TenantId::DEFAULT, "b1", None).expect("default tenant");
        assert_eq!(store.list_branches(other).expect("list").len(), 1);
        assert!(matches!(
            store.checkout(other, "command-center"),
            Err(MemgitError::NotFound { .. })
        ));
    }

    #[test]
    fn checkout_reports_head_commit() {
        let store = store();
        let t = TenantId::DEFAULT;
        let empty = store.checkout(t, "command-center").expect("checkout");
        assert_eq!(empty.head, HeadRef::Genesis);
        assert!(empty.commit.is_none());

        let c = store
            .commit(t, CommitRequest::new("command-center", json!("x"), "m"))
            .expect("commit");
        let info = store.head(t, "command-center").expect("head");
        assert_eq!(info.commit.map(|c| c.commit_hash), Some(c.commit_hash));
    }

    #[test]
    fn stale_compare_and_swap_is_rejected() {
        let store = store();
        let t = TenantId::DEFAULT;
        let first = store
            .commit(t, CommitRequest::new("command-center", json!("a"), "a"))
            .expect("first");
        let second = store
            .commit(t, CommitRequest::new("command-center", json!("b"), "b"))
            .expect("second");

        // A writer that read the head before `second` landed.
        let stale = HeadRef::Commit(first.commit_hash.clone());
        let err = advance_head(&store.conn, t, "command-center", &stale, &first.commit_hash)
            .expect_err("stale head");
        assert!(matches!(err, MemgitError::Conflict(_)));
        let head = store.checkout(t, "command-center").expect("checkout").head;
        assert_eq!(head, HeadRef::Commit(second.commit_hash));
    }

    #[test]
    fn unconditional_head_write_loses_a_commit() {
        // Two writers read the same parent; the second blindly overwrites
        // the head. This is the lost update the compare-and-swap prevents.
        let store = store();
        let t = TenantId::DEFAULT;
        let base = store
            .commit(t, CommitRequest::new("command-center", json!("base"), "base"))
            .expect("base");
        let a = store
            .commit(t, CommitRequest::new("command-center", json!("a"), "a"))
            .expect("a");
        store
            .conn
            .execute(
                "UPDATE branches SET head_commit = ?1 WHERE name = 'command-center'",
                [base.commit_hash.as_str()],
            )
            .expect("rewind");
        let b = store
            .commit(t, CommitRequest::new("command-center", json!("b"), "b"))
            .expect("b");

        assert_eq!(a.parent_hash, b.parent_hash);
        let log = store.log(t, "command-center", None).expect("log");
        assert!(log.iter().all(|c| c.commit_hash != a.commit_hash));
    }
}
