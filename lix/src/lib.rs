//! Embedded, change-tracked data store.
//!
//! Lix layers a version-control model — commits, change sets and
//! branch-like *versions* with inheritance — on top of an otherwise
//! ordinary key/entity store, so that every mutation to application data
//! is simultaneously a durable, queryable history event. Applications get
//! git-like branching, checkpoints, merging and audit trails over
//! structured records without adopting a full document database.
//!
//! This crate is a thin facade over [`lix_state`], which implements the
//! storage model: the change log, the commit graph, the version registry,
//! the commit engine and the six-tier state resolver.
//!
//! # Example
//!
//! ```
//! use lix::{Lix, Mutation, StateKey};
//! use serde_json::json;
//!
//! let mut store = Lix::new();
//!
//! // Stage a mutation and commit it to the active version.
//! store.stage(Mutation::insert("p1", "paragraph", "doc.md", json!({"text": "hello"})))?;
//! store.commit()?;
//!
//! // Branch off, shadow the entity there, and observe that the original
//! // version is untouched.
//! let main = store.active_version().clone();
//! let draft = store.create_version("draft", Some(&main))?;
//! store.stage(Mutation::delete("p1", "paragraph", "doc.md").in_version(draft.clone()))?;
//! store.commit()?;
//!
//! let key = StateKey::new("p1", "paragraph", "doc.md");
//! assert!(store.resolve(&key, &draft)?.is_not_visible());
//! assert!(store.resolve(&key, &main)?.value().is_some());
//! # Ok::<(), lix::StateError>(())
//! ```

pub use lix_state::{
    Change, ChangeId, ChangeSet, ChangeSetElement, ChangeSetId, CheckpointError, Commit,
    CommitEdge, CommitError, CommitId, CommitOutcome, EntityId, FileId, GLOBAL_VERSION_ID,
    GraphError, Lix, MergeError, Mutation, ObserverId, Resolution, ResolvedState, SchemaKey,
    SerialState, StageError, StateError, StateKey, Tier, Timestamp, Version, VersionError,
    VersionId,
};

/// The storage model: change log, commit graph, versions, commit engine
/// and state resolver.
pub mod state {
    pub use lix_state::*;
}
