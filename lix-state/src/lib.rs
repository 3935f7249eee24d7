//! Embedded, change-tracked data store.
//!
//! This crate implements a version-control model — commits, change sets
//! and branch-like *versions* with inheritance — layered on top of an
//! otherwise ordinary key/entity store, so that every mutation to
//! application data is simultaneously a durable, queryable history event.
//! Applications get git-like branching, checkpoints, merging and audit
//! trails over structured records without adopting a full document
//! database.
//!
//! ## Summary of data types
//!
//! - [`Change`]: an immutable record of one entity mutation, the atomic
//!   unit of history. A change with no snapshot content is a deletion.
//! - [`ChangeSet`]: an immutable, content-addressed set of change
//!   references, typically expressed as its *leaves* (at most one element
//!   per entity key).
//! - [`Commit`] and [`CommitEdge`]: nodes and parent→child links of the
//!   history DAG. Merge commits have two parents.
//! - [`Version`]: a named pointer into the commit graph, optionally
//!   inheriting unshadowed state from an ancestor version. One
//!   distinguished *global* version records every mutation of the
//!   registry itself — commits, change sets and version pointers — as
//!   ordinary committed changes, through the same machinery it
//!   implements.
//!
//! ## Writing and reading
//!
//! Mutations are staged into a per-session transaction buffer
//! ([`Lix::stage`]) and drained by [`Lix::commit`] into one atomic,
//! self-describing commit: the engine materializes the entity changes,
//! synthesizes the registry changes describing the commit itself into the
//! same change set, persists everything, and propagates the version
//! pointer update into a single commit of the global version.
//!
//! Reads go through [`Lix::resolve`]: a six-tier ranked lookup across the
//! transaction buffer, the untracked store, the materialized cache and
//! the same three tiers of ancestor versions. A winning row without
//! content is a tombstone and hides inherited state without mutating the
//! ancestor.
//!
//! ## Example
//!
//! ```
//! use lix_state::{Lix, Mutation, StateKey};
//! use serde_json::json;
//!
//! let mut store = Lix::new();
//! store.stage(Mutation::insert("e1", "doc", "file-1", json!({"title": "hello"})))?;
//! store.commit()?;
//!
//! let key = StateKey::new("e1", "doc", "file-1");
//! let resolved = store.resolve(&key, store.active_version())?;
//! assert_eq!(resolved.value(), Some(&json!({"title": "hello"})));
//! # Ok::<(), lix_state::StateError>(())
//! ```

pub mod cache;
pub mod change;
pub mod engine;
pub mod graph;
pub mod ids;
pub mod merge;
pub mod resolve;
pub mod serial;
pub mod store;
pub mod transaction;
pub mod version;

pub use cache::{CacheRow, UntrackedRow};
pub use change::{Change, ChangeSet, ChangeSetElement};
pub use engine::{CheckpointError, CommitError, CommitOutcome};
pub use graph::{Commit, CommitEdge, CommitGraph, GraphError};
pub use ids::{
    ChangeId, ChangeSetId, CommitId, EntityId, FileId, SchemaKey, StateKey, Timestamp, VersionId,
};
pub use merge::MergeError;
pub use resolve::{Resolution, ResolvedState, Tier};
pub use serial::SerialState;
pub use store::{Lix, Mutation, ObserverId, StateError, StoreOptions};
pub use transaction::{PendingChange, StageError, TransactionBuffer};
pub use version::{GLOBAL_VERSION_ID, Version, VersionError, VersionRegistry};

#[cfg(test)]
mod tests;
