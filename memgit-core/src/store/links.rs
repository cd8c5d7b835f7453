//! Cross-reference graph: typed, weighted edges between memories.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{ToSql, params, params_from_iter};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{MemoryStore, OptionalExt, StoredBlob, clamp_limit, sql_limit, ts_column};
use crate::error::{MemgitError, Result, is_unique_violation};
use crate::hashing::{format_ts, parse_ts};
use crate::types::{BlobHash, LinkType, TenantId};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A link to create.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLink {
    /// Edge source.
    pub source_blob: BlobHash,
    /// Edge target.
    pub target_blob: BlobHash,
    /// Branch the source lives on.
    pub source_branch: String,
    /// Branch the target lives on.
    pub target_branch: String,
    /// Relationship.
    pub link_type: LinkType,
    /// Strength; must be finite.
    pub weight: f64,
    /// Free-text justification.
    pub reasoning: Option<String>,
    /// Creator; the configured default author when `None`.
    pub created_by: Option<String>,
}

impl NewLink {
    /// A `resonance` link of weight 1.0.
    pub fn new(
        source_blob: BlobHash,
        target_blob: BlobHash,
        source_branch: impl Into<String>,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            source_blob,
            target_blob,
            source_branch: source_branch.into(),
            target_branch: target_branch.into(),
            link_type: LinkType::default(),
            weight: 1.0,
            reasoning: None,
            created_by: None,
        }
    }

    /// Set the link type.
    #[must_use]
    pub fn link_type(mut self, link_type: LinkType) -> Self {
        self.link_type = link_type;
        self
    }

    /// Set the weight.
    #[must_use]
    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the reasoning.
    #[must_use]
    pub fn reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// A stored cross-reference.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossReference {
    /// Row id.
    pub id: i64,
    /// Edge source.
    pub source_blob: BlobHash,
    /// Edge target.
    pub target_blob: BlobHash,
    /// Branch of the source.
    pub source_branch: String,
    /// Branch of the target.
    pub target_branch: String,
    /// Relationship.
    pub link_type: LinkType,
    /// Strength.
    pub weight: f64,
    /// Justification.
    pub reasoning: Option<String>,
    /// Creator.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Filter for [`MemoryStore::list_links`]. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkFilter {
    /// Links touching this blob on either end.
    pub blob: Option<BlobHash>,
    /// Links touching this branch on either end.
    pub branch: Option<String>,
    /// Links of this type.
    pub link_type: Option<LinkType>,
    /// Maximum results.
    pub limit: Option<usize>,
}

/// A memory with many incident links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HubMemory {
    /// The memory.
    pub blob_hash: BlobHash,
    /// Links where it is source or target.
    pub link_count: usize,
    /// Memory type.
    pub content_type: String,
    /// Leading part of the plaintext.
    pub preview: String,
}

/// A link between memories on different branches, with previews.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrossBranchLink {
    /// The link.
    pub link: CrossReference,
    /// Preview of the source memory.
    pub source_preview: String,
    /// Preview of the target memory.
    pub target_preview: String,
}

/// Result of [`MemoryStore::reflect`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reflection {
    /// Memories meeting the link threshold, most connected first.
    pub hubs: Vec<HubMemory>,
    /// Links whose endpoints sit on different branches, heaviest then newest first.
    pub cross_branch: Vec<CrossBranchLink>,
    /// When the reflection was computed.
    pub generated_at: DateTime<Utc>,
}

/// Graph node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphNode {
    /// The memory.
    pub blob_hash: BlobHash,
    /// Memory type.
    pub content_type: String,
    /// When the blob was stored.
    pub created_at: DateTime<Utc>,
    /// Leading part of the plaintext.
    pub preview: String,
}

/// Graph edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    /// Source memory.
    pub source: BlobHash,
    /// Target memory.
    pub target: BlobHash,
    /// Relationship.
    pub link_type: LinkType,
    /// Strength.
    pub weight: f64,
    /// Justification.
    pub reasoning: Option<String>,
}

/// Nodes and edges for visualization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryGraph {
    /// Memories.
    pub nodes: Vec<GraphNode>,
    /// Links.
    pub edges: Vec<GraphEdge>,
}

const LINK_COLUMNS: &str = "id, source_blob, target_blob, source_branch, target_branch, \
                            link_type, weight, reasoning, created_by, created_at";

/// [`super::BLOB_COLUMNS`] qualified with a table alias.
fn prefixed_blob_columns(alias: &str) -> String {
    super::BLOB_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn link_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CrossReference> {
    Ok(CrossReference {
        id: row.get(0)?,
        source_blob: BlobHash(row.get(1)?),
        target_blob: BlobHash(row.get(2)?),
        source_branch: row.get(3)?,
        target_branch: row.get(4)?,
        link_type: row.get(5)?,
        weight: row.get(6)?,
        reasoning: row.get(7)?,
        created_by: row.get(8)?,
        created_at: ts_column(row, 9)?,
    })
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl MemoryStore {
    /// Record a directed link.
    ///
    /// # Errors
    ///
    /// - `Invalid` for empty endpoints or branches, or a non-finite weight.
    /// - `Conflict` if the same `(source, target, type)` link exists.
    pub fn create_link(&self, tenant: TenantId, link: NewLink) -> Result<CrossReference> {
        for (field, value) in [
            ("source_blob", link.source_blob.as_str()),
            ("target_blob", link.target_blob.as_str()),
            ("source_branch", link.source_branch.as_str()),
            ("target_branch", link.target_branch.as_str()),
        ] {
            if value.trim().is_empty() {
                return Err(MemgitError::Invalid(format!("{field} is required")));
            }
        }
        if !link.weight.is_finite() {
            return Err(MemgitError::Invalid("weight must be a finite number".into()));
        }

        let created_by = link
            .created_by
            .clone()
            .unwrap_or_else(|| self.config.general.default_author.clone());
        let created_at = parse_ts(&format_ts(Utc::now()))?;
        let inserted = self.conn.execute(
            "INSERT INTO cross_references
                (tenant_id, source_blob, target_blob, source_branch, target_branch,
                 link_type, weight, reasoning, created_by, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tenant.to_string(),
                link.source_blob.as_str(),
                link.target_blob.as_str(),
                link.source_branch,
                link.target_branch,
                link.link_type,
                link.weight,
                link.reasoning,
                created_by,
                format_ts(created_at)
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(MemgitError::Conflict(format!(
                    "{} link {} -> {} already exists",
                    link.link_type, link.source_blob, link.target_blob
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            %tenant,
            source = %link.source_blob,
            target = %link.target_blob,
            link_type = %link.link_type,
            "Link created"
        );
        Ok(CrossReference {
            id: self.conn.last_insert_rowid(),
            source_blob: link.source_blob,
            target_blob: link.target_blob,
            source_branch: link.source_branch,
            target_branch: link.target_branch,
            link_type: link.link_type,
            weight: link.weight,
            reasoning: link.reasoning,
            created_by,
            created_at,
        })
    }

    /// Links matching `filter`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`MemgitError::Database`] on SQLite failures.
    pub fn list_links(&self, tenant: TenantId, filter: &LinkFilter) -> Result<Vec<CrossReference>> {
        let limit = clamp_limit(
            filter.limit,
            self.config.graph.default_link_limit,
            self.config.history.max_log_limit,
        );
        let mut sql = format!("SELECT {LINK_COLUMNS} FROM cross_references WHERE tenant_id = ?");
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(tenant.to_string())];

        if let Some(blob) = &filter.blob {
            sql.push_str(" AND (source_blob = ? OR target_blob = ?)");
            args.push(Box::new(blob.0.clone()));
            args.push(Box::new(blob.0.clone()));
        }
        if let Some(branch) = &filter.branch {
            sql.push_str(" AND (source_branch = ? OR target_branch = ?)");
            args.push(Box::new(branch.clone()));
            args.push(Box::new(branch.clone()));
        }
        if let Some(link_type) = filter.link_type {
            sql.push_str(" AND link_type = ?");
            args.push(Box::new(link_type));
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?");
        args.push(Box::new(sql_limit(limit)));

        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), link_from_row)?;
        Ok(rows.collect::<std::result::Result<_, _>>()?)
    }

    /// Surface conceptual hubs and links that cross branches.
    ///
    /// `min_links` and `limit` default to `graph.reflect_min_links` and
    /// `graph.reflect_limit`. Previews are decrypted.
    ///
    /// # Errors
    ///
    /// Storage or decryption errors.
    pub fn reflect(
        &self,
        tenant: TenantId,
        min_links: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Reflection> {
        let graph = &self.config.graph;
        let min_links = min_links.unwrap_or(graph.reflect_min_links);
        let limit = clamp_limit(limit, graph.reflect_limit, self.config.history.max_log_limit);
        let t = tenant.to_string();

        let mut hubs = Vec::new();
        {
            let mut stmt = self.conn.prepare_cached(
                "SELECT * FROM (
                    SELECT b.blob_hash, b.content, b.content_encrypted, b.nonce,
                           b.encryption_key_id, b.content_type, b.byte_size, b.created_at,
                           (SELECT COUNT(*) FROM cross_references cr
                             WHERE cr.tenant_id = b.tenant_id
                               AND (cr.source_blob = b.blob_hash OR cr.target_blob = b.blob_hash)
                           ) AS link_count
                    FROM blobs b WHERE b.tenant_id = ?1
                 )
                 WHERE link_count >= ?2
                 ORDER BY link_count DESC, created_at DESC
                 LIMIT ?3",
            )?;
            let mut rows = stmt.query(params![t, sql_limit(min_links), sql_limit(limit)])?;
            while let Some(row) = rows.next()? {
                let blob = StoredBlob::from_row(row)?;
                let link_count: i64 = row.get(8)?;
                hubs.push(HubMemory {
                    preview: self.preview(tenant, &blob, graph.preview_chars)?,
                    link_count: usize::try_from(link_count).unwrap_or(0),
                    content_type: blob.content_type,
                    blob_hash: blob.blob_hash,
                });
            }
        }

        // Both endpoints must be stored blobs, so LIMIT only counts links
        // that can be previewed.
        let mut cross_branch = Vec::new();
        {
            let mut stmt = self.conn.prepare_cached(&format!(
                "SELECT cr.id, cr.source_blob, cr.target_blob, cr.source_branch, cr.target_branch,
                        cr.link_type, cr.weight, cr.reasoning, cr.created_by, cr.created_at,
                        {src}, {dst}
                 FROM cross_references cr
                 JOIN blobs b1 ON b1.tenant_id = cr.tenant_id AND b1.blob_hash = cr.source_blob
                 JOIN blobs b2 ON b2.tenant_id = cr.tenant_id AND b2.blob_hash = cr.target_blob
                 WHERE cr.tenant_id = ?1 AND cr.source_branch != cr.target_branch
                 ORDER BY cr.weight DESC, cr.created_at DESC, cr.id DESC
                 LIMIT ?2",
                src = prefixed_blob_columns("b1"),
                dst = prefixed_blob_columns("b2"),
            ))?;
            let mut rows = stmt.query(params![t, sql_limit(limit)])?;
            while let Some(row) = rows.next()? {
                let link = link_from_row(row)?;
                let source = StoredBlob::from_row_at(row, 10)?;
                let target = StoredBlob::from_row_at(row, 18)?;
                cross_branch.push(CrossBranchLink {
                    source_preview: self.preview(tenant, &source, graph.preview_chars)?,
                    target_preview: self.preview(tenant, &target, graph.preview_chars)?,
                    link,
                });
            }
        }

        debug!(%tenant, hubs = hubs.len(), cross_branch = cross_branch.len(), "Reflection computed");
        Ok(Reflection {
            hubs,
            cross_branch,
            generated_at: Utc::now(),
        })
    }

    /// Nodes and edges for a branch, or for the whole tenant.
    ///
    /// With a branch, nodes are the blobs its history commits (newest
    /// first) and edges are links touching the branch. Without one, nodes
    /// are the newest blobs and edges are any links.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown branch, plus storage or decryption errors.
    pub fn graph(
        &self,
        tenant: TenantId,
        branch: Option<&str>,
        limit: Option<usize>,
    ) -> Result<MemoryGraph> {
        let limit = clamp_limit(
            limit,
            self.config.graph.default_link_limit,
            self.config.history.max_log_limit,
        );
        let preview_chars = self.config.graph.preview_chars;
        let t = tenant.to_string();

        let blobs: Vec<StoredBlob> = match branch {
            Some(name) => {
                let mut seen = HashSet::new();
                let mut blobs = Vec::new();
                for commit in self.history(tenant, name)? {
                    let commit = commit?;
                    let blob: Option<String> = self
                        .conn
                        .prepare_cached(
                            "SELECT blob_hash FROM tree_entries WHERE tenant_id = ?1 AND tree_hash = ?2",
                        )?
                        .query_row(params![t, commit.tree_hash.as_str()], |row| row.get(0))
                        .optional()?;
                    let Some(hash) = blob.map(BlobHash) else { continue };
                    if !seen.insert(hash.clone()) {
                        continue;
                    }
                    if let Some(stored) = self.load_blob(tenant, &hash)? {
                        blobs.push(stored);
                    }
                    if blobs.len() >= limit {
                        break;
                    }
                }
                blobs
            }
            None => {
                let mut stmt = self.conn.prepare_cached(&format!(
                    "SELECT {} FROM blobs WHERE tenant_id = ?1 ORDER BY created_at DESC LIMIT ?2",
                    super::BLOB_COLUMNS
                ))?;
                let rows = stmt.query_map(params![t, sql_limit(limit)], StoredBlob::from_row)?;
                rows.collect::<std::result::Result<_, _>>()?
            }
        };

        let mut nodes = Vec::with_capacity(blobs.len());
        for blob in &blobs {
            nodes.push(GraphNode {
                blob_hash: blob.blob_hash.clone(),
                content_type: blob.content_type.clone(),
                created_at: parse_ts(&blob.created_at)?,
                preview: self.preview(tenant, blob, preview_chars)?,
            });
        }

        let filter = LinkFilter {
            branch: branch.map(str::to_string),
            limit: Some(limit),
            ..LinkFilter::default()
        };
        let edges = self
            .list_links(tenant, &filter)?
            .into_iter()
            .map(|link| GraphEdge {
                source: link.source_blob,
                target: link.target_blob,
                link_type: link.link_type,
                weight: link.weight,
                reasoning: link.reasoning,
            })
            .collect();

        Ok(MemoryGraph { nodes, edges })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemgitConfig;
    use crate::store::{CommitRequest, CommitResult};
    use serde_json::json;

    fn store() -> MemoryStore {
        let store = MemoryStore::open_in_memory(&MemgitConfig::default()).expect("open");
        store.init_tenant(TenantId::DEFAULT).expect("init");
        store.create_branch(TenantId::DEFAULT, "research", None).expect("branch");
        store
    }

    fn commit(store: &MemoryStore, branch: &str, content: &str) -> CommitResult {
        store
            .commit(TenantId::DEFAULT, CommitRequest::new(branch, json!(content), "m"))
            .expect("commit")
    }

    #[test]
    fn duplicate_link_conflicts_but_other_type_is_fine() {
        let store = store();
        let a = commit(&store, "command-center", "a");
        let b = commit(&store, "research", "b");
        let link = NewLink::new(a.blob_hash.clone(), b.blob_hash.clone(), "command-center", "research");

        let created = store.create_link(TenantId::DEFAULT, link.clone()).expect("first");
        assert_eq!(created.link_type, LinkType::Resonance);
        assert!((created.weight - 1.0).abs() < f64::EPSILON);
        assert!(matches!(
            store.create_link(TenantId::DEFAULT, link.clone()),
            Err(MemgitError::Conflict(_))
        ));
        store
            .create_link(TenantId::DEFAULT, link.link_type(LinkType::Causal))
            .expect("different type");
    }

    #[test]
    fn bad_links_are_invalid() {
        let store = store();
        let nan = NewLink::new("a".into(), "b".into(), "x", "y").weight(f64::NAN);
        assert!(matches!(store.create_link(TenantId::DEFAULT, nan), Err(MemgitError::Invalid(_))));
        let empty = NewLink::new("".into(), "b".into(), "x", "y");
        assert!(matches!(store.create_link(TenantId::DEFAULT, empty), Err(MemgitError::Invalid(_))));
    }

    #[test]
    fn list_links_filters() {
        let store = store();
        let t = TenantId::DEFAULT;
        let a = commit(&store, "command-center", "a");
        let b = commit(&store, "research", "b");
        let c = commit(&store, "research", "c");
        store
            .create_link(t, NewLink::new(a.blob_hash.clone(), b.blob_hash.clone(), "command-center", "research"))
            .expect("ab");
        store
            .create_link(
                t,
                NewLink::new(b.blob_hash.clone(), c.blob_hash.clone(), "research", "research")
                    .link_type(LinkType::Elaboration),
            )
            .expect("bc");

        let all = store.list_links(t, &LinkFilter::default()).expect("all");
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].target_blob, c.blob_hash);

        let touching_a = LinkFilter { blob: Some(a.blob_hash.clone()), ..LinkFilter::default() };
        assert_eq!(store.list_links(t, &touching_a).expect("blob").len(), 1);

        let elaborations = LinkFilter { link_type: Some(LinkType::Elaboration), ..LinkFilter::default() };
        assert_eq!(store.list_links(t, &elaborations).expect("type").len(), 1);

        let command = LinkFilter { branch: Some("command-center".into()), ..LinkFilter::default() };
        assert_eq!(store.list_links(t, &command).expect("branch").len(), 1);
    }

    #[test]
    fn reflect_finds_hubs_and_cross_branch_links() {
        let store = store();
        let t = TenantId::DEFAULT;
        let hub = commit(&store, "command-center", "the hub idea");
        let x = commit(&store, "research", "x");
        let y = commit(&store, "research", "y");
        let z = commit(&store, "command-center", "z");
        store
            .create_link(t, NewLink::new(hub.blob_hash.clone(), x.blob_hash.clone(), "command-center", "research").weight(0.5))
            .expect("hx");
        store
            .create_link(t, NewLink::new(y.blob_hash.clone(), hub.blob_hash.clone(), "research", "command-center").weight(2.0))
            .expect("yh");
        store
            .create_link(t, NewLink::new(hub.blob_hash.clone(), z.blob_hash.clone(), "command-center", "command-center"))
            .expect("hz");

        let reflection = store.reflect(t, Some(2), Some(10)).expect("reflect");
        assert_eq!(reflection.hubs.len(), 1);
        assert_eq!(reflection.hubs[0].blob_hash, hub.blob_hash);
        assert_eq!(reflection.hubs[0].link_count, 3);
        assert_eq!(reflection.hubs[0].preview, "the hub idea");

        assert_eq!(reflection.cross_branch.len(), 2);
        assert!((reflection.cross_branch[0].link.weight - 2.0).abs() < f64::EPSILON);
        assert_eq!(reflection.cross_branch[0].target_preview, "the hub idea");

        let strict = store.reflect(t, Some(4), None).expect("reflect");
        assert!(strict.hubs.is_empty());
    }

    #[test]
    fn reflect_limit_skips_links_to_missing_blobs() {
        let store = store();
        let t = TenantId::DEFAULT;
        let a = commit(&store, "command-center", "stored a");
        let b = commit(&store, "research", "stored b");
        store
            .create_link(t, NewLink::new("ghost1".into(), "ghost2".into(), "command-center", "research").weight(5.0))
            .expect("dangling");
        store
            .create_link(t, NewLink::new(a.blob_hash.clone(), b.blob_hash.clone(), "command-center", "research"))
            .expect("stored");

        let reflection = store.reflect(t, Some(1), Some(1)).expect("reflect");
        assert_eq!(reflection.cross_branch.len(), 1);
        let only = &reflection.cross_branch[0];
        assert_eq!(only.link.source_blob, a.blob_hash);
        assert_eq!(only.source_preview, "stored a");
        assert_eq!(only.target_preview, "stored b");
    }

    #[test]
    fn graph_by_branch_walks_history() {
        let store = store();
        let t = TenantId::DEFAULT;
        let a = commit(&store, "research", "a");
        let b = commit(&store, "research", "b");
        commit(&store, "research", "a");
        commit(&store, "command-center", "elsewhere");
        store
            .create_link(t, NewLink::new(a.blob_hash.clone(), b.blob_hash.clone(), "research", "research"))
            .expect("link");

        let graph = store.graph(t, Some("research"), None).expect("graph");
        let nodes: Vec<_> = graph.nodes.iter().map(|n| n.blob_hash.clone()).collect();
        assert_eq!(nodes, vec![a.blob_hash.clone(), b.blob_hash.clone()]);
        assert_eq!(graph.edges.len(), 1);

        let whole = store.graph(t, None, None).expect("graph");
        assert_eq!(whole.nodes.len(), 3);
        assert!(matches!(store.graph(t, Some("missing"), None), Err(MemgitError::NotFound { .. })));
    }
}
