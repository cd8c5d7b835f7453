//! Task queue: claim, release, halt.
//!
//! ```text
//!   open ──claim──► claimed ──► done
//!    ▲  ◄─release──   │
//!    │                └──────► blocked ──► open
//!    └─ any state ──► deleted (invisible afterwards)
//! ```
//!
//! Claims are refused while the shared [`HaltSwitch`](crate::halt::HaltSwitch)
//! is set; halting also moves every claimed task to `blocked`, and resuming
//! reopens exactly those tasks.

use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ToSql, params, params_from_iter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{MemoryStore, OptionalExt, clamp_limit, opt_ts_column, sql_limit, ts_column};
use crate::error::{MemgitError, Result};
use crate::halt::HaltStatus;
use crate::hashing::{format_ts, parse_ts};
use crate::types::{ReleaseReason, TaskId, TaskStatus, TenantId};

/// `blocked_reason` written by [`MemoryStore::halt_tasks`].
const HALT_BLOCK_REASON: &str = "halt";

/// Priority given to tasks that do not specify one.
pub const DEFAULT_PRIORITY: i64 = 5;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A task to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTask {
    /// What needs doing.
    pub description: String,
    /// Branch the work belongs to.
    pub branch: String,
    /// 1 is most urgent.
    pub priority: i64,
    /// Free-form JSON object.
    pub metadata: Value,
}

impl NewTask {
    /// A task with default priority and empty metadata.
    pub fn new(description: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            branch: branch.into(),
            priority: DEFAULT_PRIORITY,
            metadata: Value::Object(serde_json::Map::new()),
        }
    }

    /// Set the priority.
    #[must_use]
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Set the metadata.
    #[must_use]
    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// A stored task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    /// Identifier.
    pub id: TaskId,
    /// What needs doing.
    pub description: String,
    /// Branch the work belongs to.
    pub branch: String,
    /// 1 is most urgent.
    pub priority: i64,
    /// Lifecycle state.
    pub status: TaskStatus,
    /// Instance holding (or last holding) the task.
    pub assigned_to: Option<String>,
    /// Free-form JSON object.
    pub metadata: Value,
    /// Why the task is blocked, when it is.
    pub blocked_reason: Option<String>,
    /// When the current claim was taken.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

/// Filter for [`MemoryStore::list_tasks`]. Empty fields match everything
/// except deleted tasks, which never match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only this status.
    pub status: Option<TaskStatus>,
    /// Only this branch.
    pub branch: Option<String>,
    /// Only tasks assigned to this instance.
    pub assigned_to: Option<String>,
    /// Maximum results.
    pub limit: Option<usize>,
}

const TASK_COLUMNS: &str = "id, description, branch, priority, status, assigned_to, metadata, \
                            blocked_reason, claimed_at, created_at, updated_at";

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let id = uuid::Uuid::parse_str(&id)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))?;
    let metadata: String = row.get(6)?;
    let metadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;
    Ok(Task {
        id: TaskId(id),
        description: row.get(1)?,
        branch: row.get(2)?,
        priority: row.get(3)?,
        status: row.get(4)?,
        assigned_to: row.get(5)?,
        metadata,
        blocked_reason: row.get(7)?,
        claimed_at: opt_ts_column(row, 8)?,
        created_at: ts_column(row, 9)?,
        updated_at: ts_column(row, 10)?,
    })
}

/// Load a task through `conn`; deleted tasks read as missing.
fn load_task(conn: &Connection, tenant: TenantId, id: TaskId) -> Result<Task> {
    conn.prepare_cached(&format!(
        "SELECT {TASK_COLUMNS} FROM tasks
         WHERE tenant_id = ?1 AND id = ?2 AND status != 'deleted'"
    ))?
    .query_row(params![tenant.to_string(), id.to_string()], task_from_row)
    .optional()?
    .ok_or_else(|| MemgitError::not_found("task", id))
}

fn now_ts() -> Result<DateTime<Utc>> {
    parse_ts(&format_ts(Utc::now()))
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl MemoryStore {
    /// Add an `open` task.
    ///
    /// # Errors
    ///
    /// `Invalid` for an empty description or branch, a priority below 1,
    /// or metadata that is not a JSON object.
    pub fn create_task(&self, tenant: TenantId, task: NewTask) -> Result<Task> {
        if task.description.trim().is_empty() {
            return Err(MemgitError::Invalid("task description is required".into()));
        }
        if task.branch.trim().is_empty() {
            return Err(MemgitError::Invalid("task branch is required".into()));
        }
        if task.priority < 1 {
            return Err(MemgitError::Invalid(format!(
                "priority must be at least 1, got {}",
                task.priority
            )));
        }
        if !task.metadata.is_object() {
            return Err(MemgitError::Invalid("task metadata must be a JSON object".into()));
        }

        let id = TaskId::new();
        let now = now_ts()?;
        self.conn.execute(
            "INSERT INTO tasks
                (tenant_id, id, description, branch, priority, status, metadata, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'open', ?6, ?7, ?7)",
            params![
                tenant.to_string(),
                id.to_string(),
                task.description,
                task.branch,
                task.priority,
                serde_json::to_string(&task.metadata)?,
                format_ts(now)
            ],
        )?;

        info!(%tenant, task_id = %id, branch = %task.branch, priority = task.priority, "Task created");
        Ok(Task {
            id,
            description: task.description,
            branch: task.branch,
            priority: task.priority,
            status: TaskStatus::Open,
            assigned_to: None,
            metadata: task.metadata,
            blocked_reason: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// One task.
    ///
    /// # Errors
    ///
    /// `NotFound` if the task does not exist or was deleted.
    pub fn get_task(&self, tenant: TenantId, id: TaskId) -> Result<Task> {
        load_task(&self.conn, tenant, id)
    }

    /// Tasks matching `filter`, most urgent first, oldest first within a
    /// priority.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn list_tasks(&self, tenant: TenantId, filter: &TaskFilter) -> Result<Vec<Task>> {
        let limit = clamp_limit(
            filter.limit,
            self.config.history.default_log_limit,
            self.config.history.max_log_limit,
        );
        let mut sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE tenant_id = ? AND status != 'deleted'"
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(tenant.to_string())];
        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status));
        }
        if let Some(branch) = &filter.branch {
            sql.push_str(" AND branch = ?");
            args.push(Box::new(branch.clone()));
        }
        if let Some(instance) = &filter.assigned_to {
            sql.push_str(" AND assigned_to = ?");
            args.push(Box::new(instance.clone()));
        }
        sql.push_str(" ORDER BY priority ASC, created_at ASC LIMIT ?");
        args.push(Box::new(sql_limit(limit)));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), task_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Claim an open task for `instance`.
    ///
    /// Claiming a task the same instance already holds returns it
    /// unchanged.
    ///
    /// # Errors
    ///
    /// - `Halted` while the queue is halted.
    /// - `NotFound` for an unknown or deleted task.
    /// - `Conflict` if another instance holds it, or it is not open.
    pub fn claim_task(&self, tenant: TenantId, id: TaskId, instance: &str) -> Result<Task> {
        if instance.trim().is_empty() {
            return Err(MemgitError::Invalid("instance id is required".into()));
        }
        let start = Instant::now();
        let tx = self.write_txn()?;

        // Checked under the write lock: a halt that lands after this point
        // waits for the lock and then blocks the claim we are about to make.
        if let Some(reason) = self.halt.reason() {
            return Err(MemgitError::Halted(reason));
        }

        let task = load_task(&tx, tenant, id)?;
        let holder = task.assigned_to.clone();
        match (task.status, holder.as_deref()) {
            (TaskStatus::Claimed, Some(holder)) if holder == instance => return Ok(task),
            (TaskStatus::Claimed, holder) => {
                return Err(MemgitError::Conflict(format!(
                    "task {id} is already claimed by {}",
                    holder.unwrap_or("an unknown instance")
                )));
            }
            (TaskStatus::Open, _) => {}
            (status, _) => {
                return Err(MemgitError::Conflict(format!("task {id} is {status}, not open")));
            }
        }

        let now = now_ts()?;
        tx.execute(
            "UPDATE tasks SET status = 'claimed', assigned_to = ?1, claimed_at = ?2, updated_at = ?2
             WHERE tenant_id = ?3 AND id = ?4",
            params![instance, format_ts(now), tenant.to_string(), id.to_string()],
        )?;
        tx.commit()?;

        info!(
            %tenant,
            task_id = %id,
            instance,
            elapsed_us = start.elapsed().as_micros(),
            "Task claimed"
        );
        Ok(Task {
            status: TaskStatus::Claimed,
            assigned_to: Some(instance.to_string()),
            claimed_at: Some(now),
            updated_at: now,
            ..task
        })
    }

    /// Give a claimed task back to the queue.
    ///
    /// A `Manual` release must come from the holder; a `Timeout` release
    /// may come from anyone.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown or deleted task.
    /// - `Conflict` if the task is not claimed, or a manual release comes
    ///   from another instance.
    pub fn release_task(
        &self,
        tenant: TenantId,
        id: TaskId,
        instance: &str,
        reason: ReleaseReason,
    ) -> Result<Task> {
        let tx = self.write_txn()?;
        let task = load_task(&tx, tenant, id)?;
        if task.status != TaskStatus::Claimed {
            return Err(MemgitError::Conflict(format!("task {id} is {}, not claimed", task.status)));
        }
        if reason == ReleaseReason::Manual && task.assigned_to.as_deref() != Some(instance) {
            return Err(MemgitError::Conflict(format!(
                "task {id} is held by {}, not {instance}",
                task.assigned_to.as_deref().unwrap_or("nobody")
            )));
        }

        let now = now_ts()?;
        tx.execute(
            "UPDATE tasks SET status = 'open', assigned_to = NULL, claimed_at = NULL, updated_at = ?1
             WHERE tenant_id = ?2 AND id = ?3",
            params![format_ts(now), tenant.to_string(), id.to_string()],
        )?;
        tx.commit()?;

        info!(%tenant, task_id = %id, instance, reason = %reason, "Task released");
        Ok(Task {
            status: TaskStatus::Open,
            assigned_to: None,
            claimed_at: None,
            updated_at: now,
            ..task
        })
    }

    /// Move a task to `status`.
    ///
    /// Allowed moves are those of [`TaskStatus::can_transition_to`]; claim
    /// and release have their own operations. `blocked_reason` is recorded
    /// when blocking and cleared otherwise.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown or deleted task.
    /// - `Invalid` for a transition the lifecycle does not allow.
    pub fn update_task_status(
        &self,
        tenant: TenantId,
        id: TaskId,
        status: TaskStatus,
        blocked_reason: Option<&str>,
    ) -> Result<Task> {
        let tx = self.write_txn()?;
        let task = load_task(&tx, tenant, id)?;
        if !task.status.can_transition_to(status) {
            return Err(MemgitError::Invalid(format!(
                "task {id} cannot move from {} to {status}",
                task.status
            )));
        }

        let blocked_reason = match status {
            TaskStatus::Blocked => blocked_reason.map(str::to_string),
            _ => None,
        };
        // Reopening drops the previous holder.
        let assigned_to = match status {
            TaskStatus::Open => None,
            _ => task.assigned_to.clone(),
        };
        let claimed_at = match status {
            TaskStatus::Claimed => task.claimed_at,
            _ => None,
        };
        let now = now_ts()?;
        tx.execute(
            "UPDATE tasks SET status = ?1, blocked_reason = ?2, assigned_to = ?3, claimed_at = ?4, updated_at = ?5
             WHERE tenant_id = ?6 AND id = ?7",
            params![
                status,
                blocked_reason,
                assigned_to,
                claimed_at.map(format_ts),
                format_ts(now),
                tenant.to_string(),
                id.to_string()
            ],
        )?;
        tx.commit()?;

        info!(%tenant, task_id = %id, from = %task.status, to = %status, "Task status updated");
        Ok(Task {
            status,
            blocked_reason,
            assigned_to,
            claimed_at,
            updated_at: now,
            ..task
        })
    }

    /// Soft-delete a task.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or already deleted task.
    pub fn delete_task(&self, tenant: TenantId, id: TaskId) -> Result<()> {
        self.update_task_status(tenant, id, TaskStatus::Deleted, None)?;
        Ok(())
    }

    /// Release, with reason `timeout`, every claim taken more than
    /// `tasks.claim_timeout_seconds` before `now`. Returns the released ids.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn release_expired_claims(&self, tenant: TenantId, now: DateTime<Utc>) -> Result<Vec<TaskId>> {
        let timeout = i64::try_from(self.config.tasks.claim_timeout_seconds).unwrap_or(i64::MAX);
        let Some(cutoff) = Duration::try_seconds(timeout).and_then(|d| now.checked_sub_signed(d))
        else {
            return Ok(Vec::new());
        };

        let tx = self.write_txn()?;
        let expired: Vec<String> = {
            let mut stmt = tx.prepare_cached(
                "SELECT id FROM tasks
                 WHERE tenant_id = ?1 AND status = 'claimed' AND claimed_at < ?2
                 ORDER BY claimed_at",
            )?;
            let rows = stmt.query_map(params![tenant.to_string(), format_ts(cutoff)], |row| row.get(0))?;
            rows.collect::<std::result::Result<_, _>>()?
        };
        tx.execute(
            "UPDATE tasks SET status = 'open', assigned_to = NULL, claimed_at = NULL, updated_at = ?1
             WHERE tenant_id = ?2 AND status = 'claimed' AND claimed_at < ?3",
            params![format_ts(now), tenant.to_string(), format_ts(cutoff)],
        )?;
        tx.commit()?;

        let mut released = Vec::with_capacity(expired.len());
        for id in expired {
            let uuid = uuid::Uuid::parse_str(&id)
                .map_err(|e| MemgitError::IntegrityViolation(format!("task id `{id}`: {e}")))?;
            released.push(TaskId(uuid));
        }
        if !released.is_empty() {
            warn!(
                %tenant,
                released = released.len(),
                reason = %ReleaseReason::Timeout,
                "Released expired task claims"
            );
        }
        Ok(released)
    }

    /// Halt the queue: refuse new claims and block every claimed task,
    /// across all tenants. Idempotent; a repeated halt keeps the first
    /// reason. Returns the number of tasks blocked by this call.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures. The switch
    /// stays set even then.
    pub fn halt_tasks(&self, reason: &str) -> Result<usize> {
        let changed = self.halt.halt(reason);
        let tx = self.write_txn()?;
        let blocked = tx.execute(
            "UPDATE tasks SET status = 'blocked', blocked_reason = ?1, updated_at = ?2
             WHERE status = 'claimed'",
            params![HALT_BLOCK_REASON, format_ts(Utc::now())],
        )?;
        tx.commit()?;

        if changed {
            warn!(reason, blocked, "Task queue halted");
        } else {
            debug!(blocked, "Task queue already halted");
        }
        Ok(blocked)
    }

    /// Clear the halt and reopen the tasks it blocked. Idempotent. Returns
    /// the number of tasks reopened.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn resume_tasks(&self) -> Result<usize> {
        let tx = self.write_txn()?;
        let reopened = tx.execute(
            "UPDATE tasks
             SET status = 'open', blocked_reason = NULL, assigned_to = NULL, claimed_at = NULL, updated_at = ?1
             WHERE status = 'blocked' AND blocked_reason = ?2",
            params![format_ts(Utc::now()), HALT_BLOCK_REASON],
        )?;
        tx.commit()?;
        let changed = self.halt.resume();

        if changed {
            info!(reopened, "Task queue resumed");
        }
        Ok(reopened)
    }

    /// Current halt state.
    #[must_use]
    pub fn halt_status(&self) -> HaltStatus {
        self.halt.status()
    }
}
