//! Traversal trails between recalled memories.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;
use tracing::debug;

use super::{MemoryStore, clamp_limit, sql_limit, ts_column};
use crate::error::{MemgitError, Result};
use crate::hashing::{format_ts, parse_ts};
use crate::types::{BlobHash, TenantId};

/// A directed edge that strengthens every time it is walked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Trail {
    /// Memory accessed first.
    pub source_blob: BlobHash,
    /// Memory accessed next.
    pub target_blob: BlobHash,
    /// Times the pair was recorded.
    pub strength: i64,
    /// Last time it was recorded.
    pub last_traversed: DateTime<Utc>,
}

fn trail_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Trail> {
    Ok(Trail {
        source_blob: BlobHash(row.get(0)?),
        target_blob: BlobHash(row.get(1)?),
        strength: row.get(2)?,
        last_traversed: ts_column(row, 3)?,
    })
}

impl MemoryStore {
    /// Record that `target` was accessed after `source`: creates the trail
    /// at strength 1 or adds 1 to it.
    ///
    /// # Errors
    ///
    /// `Invalid` for an empty endpoint or a self-trail.
    pub fn record_trail(&self, tenant: TenantId, source: &BlobHash, target: &BlobHash) -> Result<Trail> {
        if source.as_str().is_empty() || target.as_str().is_empty() {
            return Err(MemgitError::Invalid("trail endpoints are required".into()));
        }
        if source == target {
            return Err(MemgitError::Invalid(format!("trail from {source} to itself")));
        }

        let now = parse_ts(&format_ts(Utc::now()))?;
        let trail = self
            .conn
            .prepare_cached(
                "INSERT INTO trails (tenant_id, source_blob, target_blob, strength, last_traversed)
                 VALUES (?1, ?2, ?3, 1, ?4)
                 ON CONFLICT (tenant_id, source_blob, target_blob)
                 DO UPDATE SET strength = strength + 1, last_traversed = excluded.last_traversed
                 RETURNING source_blob, target_blob, strength, last_traversed",
            )?
            .query_row(
                params![tenant.to_string(), source.as_str(), target.as_str(), format_ts(now)],
                trail_from_row,
            )?;

        debug!(%tenant, %source, %target, strength = trail.strength, "Trail recorded");
        Ok(trail)
    }

    /// Strongest trails of the tenant.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn hot_trails(&self, tenant: TenantId, limit: Option<usize>) -> Result<Vec<Trail>> {
        let limit = clamp_limit(
            limit,
            self.config.search.default_limit,
            self.config.history.max_log_limit,
        );
        let mut stmt = self.conn.prepare_cached(
            "SELECT source_blob, target_blob, strength, last_traversed FROM trails
             WHERE tenant_id = ?1
             ORDER BY strength DESC, last_traversed DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![tenant.to_string(), sql_limit(limit)], trail_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Outgoing trails of `source`, strongest first.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn trails_from(
        &self,
        tenant: TenantId,
        source: &BlobHash,
        limit: Option<usize>,
    ) -> Result<Vec<Trail>> {
        let limit = clamp_limit(
            limit,
            self.config.search.default_limit,
            self.config.history.max_log_limit,
        );
        let mut stmt = self.conn.prepare_cached(
            "SELECT source_blob, target_blob, strength, last_traversed FROM trails
             WHERE tenant_id = ?1 AND source_blob = ?2
             ORDER BY strength DESC, last_traversed DESC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![tenant.to_string(), source.as_str(), sql_limit(limit)],
            trail_from_row,
        )?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }
}
