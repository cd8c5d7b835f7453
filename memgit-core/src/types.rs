//! Core type definitions for the memgit object model.
//!
//! Identifiers are newtypes so a blob hash can never be passed where a
//! commit hash is expected.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MemgitError;

// ---------------------------------------------------------------------------
// Identity Types
// ---------------------------------------------------------------------------

/// Tenant scope. Every row and every lookup is keyed by one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub Uuid);

impl TenantId {
    /// The tenant used by single-tenant deployments.
    pub const DEFAULT: Self = Self(Uuid::from_u128(1));

    /// Create a new random tenant id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! hash_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Borrow the lowercase hex digest.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

hash_id!(
    /// SHA-256 of a blob's canonical plaintext.
    BlobHash
);
hash_id!(
    /// SHA-256 identifying a tree entry.
    TreeHash
);
hash_id!(
    /// SHA-256 identifying a commit.
    CommitHash
);

/// Unique identifier for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random task id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Branch heads
// ---------------------------------------------------------------------------

/// Sentinel stored in `branches.head_commit` for a branch with no commits.
pub const GENESIS: &str = "GENESIS";

/// What a branch head points at.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "commit", rename_all = "snake_case")]
pub enum HeadRef {
    /// Empty branch.
    Genesis,
    /// Newest commit of the branch.
    Commit(CommitHash),
}

impl HeadRef {
    /// Parse the stored column value.
    #[must_use]
    pub fn from_column(value: &str) -> Self {
        if value == GENESIS || value.is_empty() {
            Self::Genesis
        } else {
            Self::Commit(CommitHash(value.to_string()))
        }
    }

    /// The stored column value.
    #[must_use]
    pub fn as_column(&self) -> &str {
        match self {
            Self::Genesis => GENESIS,
            Self::Commit(hash) => hash.as_str(),
        }
    }

    /// The commit this head points at, if any.
    #[must_use]
    pub fn commit(&self) -> Option<&CommitHash> {
        match self {
            Self::Genesis => None,
            Self::Commit(hash) => Some(hash),
        }
    }
}

impl fmt::Display for HeadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_column())
    }
}

// ---------------------------------------------------------------------------
// Object records
// ---------------------------------------------------------------------------

/// A named, mutable pointer to the newest commit of one line of history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    /// Branch name, unique per tenant.
    pub name: String,
    /// Current head.
    pub head: HeadRef,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// An immutable, hash-identified history event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Hash of `(tree_hash, parent_hash, message, created_at)`.
    pub commit_hash: CommitHash,
    /// The tree entry this commit records.
    pub tree_hash: TreeHash,
    /// Previous commit on the branch; `None` for the first.
    pub parent_hash: Option<CommitHash>,
    /// Who committed.
    pub author: String,
    /// Commit message.
    pub message: String,
    /// Commit time (also a hash input).
    pub created_at: DateTime<Utc>,
}

/// A named pointer from a commit's tree to exactly one blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Hash of `(branch, blob_hash, timestamp)`.
    pub tree_hash: TreeHash,
    /// Display name (commit message prefix).
    pub name: String,
    /// The blob.
    pub blob_hash: BlobHash,
    /// Memory type of the blob.
    pub mode: String,
}

/// Branch head as returned by checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadInfo {
    /// Branch name.
    pub branch: String,
    /// Current head.
    pub head: HeadRef,
    /// The head commit, when the branch is not empty and the commit exists.
    pub commit: Option<Commit>,
}

// ---------------------------------------------------------------------------
// Enumerations stored as text
// ---------------------------------------------------------------------------

/// Relationship carried by a cross-reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Two memories echo the same idea.
    #[default]
    Resonance,
    /// Source led to target.
    Causal,
    /// Source and target disagree.
    Contradiction,
    /// Target expands on source.
    Elaboration,
    /// Target applies source.
    Application,
}

impl LinkType {
    /// All link types in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Resonance,
        Self::Causal,
        Self::Contradiction,
        Self::Elaboration,
        Self::Application,
    ];

    /// Stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resonance => "resonance",
            Self::Causal => "causal",
            Self::Contradiction => "contradiction",
            Self::Elaboration => "elaboration",
            Self::Application => "application",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkType {
    type Err = MemgitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                MemgitError::Invalid(format!(
                    "invalid link_type `{s}`; expected one of resonance, causal, contradiction, elaboration, application"
                ))
            })
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be claimed.
    Open,
    /// Held by one instance.
    Claimed,
    /// Cannot proceed (explicitly, or because the queue was halted).
    Blocked,
    /// Finished.
    Done,
    /// Soft-deleted; invisible to queries.
    Deleted,
}

impl TaskStatus {
    /// All statuses in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Open,
        Self::Claimed,
        Self::Blocked,
        Self::Done,
        Self::Deleted,
    ];

    /// Stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Claimed => "claimed",
            Self::Blocked => "blocked",
            Self::Done => "done",
            Self::Deleted => "deleted",
        }
    }

    /// Whether an explicit status update may move a task from `self` to `next`.
    ///
    /// `open -> claimed` and `claimed -> open` go through claim/release, not
    /// through updates.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use TaskStatus::{Blocked, Claimed, Deleted, Done, Open};
        match (self, next) {
            (Deleted, _) => false,
            (_, Deleted) => true,
            (Claimed, Done | Blocked) => true,
            (Blocked, Open) => true,
            (Open, Blocked) => true,
            (a, b) => a == b,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = MemgitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MemgitError::Invalid(format!("invalid task status `{s}`")))
    }
}

/// Why a claim was given up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// The holder released it.
    Manual,
    /// The claim outlived the claim timeout.
    Timeout,
}

impl ReleaseReason {
    /// Stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
