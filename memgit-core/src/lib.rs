//! # memgit Core Library
//!
//! Git-like, content-addressed memory store for agents.
//!
//! A memory is an arbitrary JSON or text payload. Committing one writes
//! three immutable, hash-identified objects and moves a branch pointer:
//!
//! - **Blob**: the canonical payload, stored once per tenant and
//!   optionally encrypted at rest ([`memgit_crypto`]).
//! - **Tree entry**: names the blob within one branch at one instant.
//! - **Commit**: records the tree, the previous head, author and message.
//! - **Branch**: a mutable pointer to the newest commit of one history.
//!
//! Around that object graph sit typed cross-references between memories,
//! a small task queue with claim/release/halt semantics, and traversal
//! trails that strengthen each time they are walked. Everything is scoped
//! by [`TenantId`] and persisted in one SQLite database.
//!
//! ## Concurrency Contract
//!
//! - A [`MemoryStore`] owns one connection; share work across threads by
//!   opening one store per thread on the same file.
//! - Commits hold SQLite's write lock from reading the head to moving it,
//!   so concurrent commits to one branch serialize and never lose an
//!   update.
//! - The encryption service and the halt switch are shared through `Arc`.

#![deny(clippy::unwrap_used)]
#![deny(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod halt;
pub mod hashing;
pub mod schema;
pub mod store;
pub mod telemetry;
pub mod types;

pub use config::MemgitConfig;
pub use error::{MemgitError, Result};
pub use halt::{HaltStatus, HaltSwitch};
pub use store::{EncryptionStatus, MemoryStore, StoreStats};
pub use telemetry::init_tracing;
pub use types::*;
