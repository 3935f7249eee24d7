//! Serialized format for a store's persisted tables.
//!
//! [`SerialState`] captures every durable table with the stable field
//! names of the relational layout, so external tooling can query history
//! directly and an embedding host can persist/restore a store atomically.
//! The transaction buffer is ephemeral per write session and is not
//! captured; commit observers are not captured either.

use indexmap::IndexMap;
use smol_str::SmolStr;

use crate::cache::{CacheRow, UntrackedRow};
use crate::change::{Change, ChangeSet};
use crate::graph::{Commit, CommitEdge, CommitGraph};
use crate::ids::{ChangeSetId, CommitId, VersionId};
use crate::store::{Lix, StateError, StoreOptions};
use crate::version::{Version, VersionRegistry};

/// Serialized snapshot of all persisted tables of a store.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SerialState {
    /// The change log, in append order.
    pub changes: Vec<Change>,
    /// All change sets with their elements.
    pub change_sets: Vec<ChangeSet>,
    /// All commits, in creation order.
    pub commits: Vec<Commit>,
    /// All commit edges.
    pub commit_edges: Vec<CommitEdge>,
    /// Owning history commit per change set.
    pub change_set_owners: Vec<(ChangeSetId, CommitId)>,
    /// The version registry.
    pub versions: Vec<Version>,
    /// The untracked store.
    pub untracked: Vec<UntrackedRow>,
    /// The materialized cache.
    pub cache: Vec<CacheRow>,
    /// The active version register.
    pub active_version: VersionId,
    /// The root (empty) commit of the graph.
    pub root_commit: CommitId,
    /// Change id counter.
    pub next_change: u64,
    /// Commit id counter.
    pub next_commit: u64,
    /// Version id counter.
    pub next_version: u64,
    /// Logical clock.
    pub clock: u64,
    /// The configured author.
    pub author: SmolStr,
}

impl Lix {
    /// Capture the persisted tables of this store.
    pub fn to_serial(&self) -> SerialState {
        SerialState {
            changes: self.changes.values().cloned().collect(),
            change_sets: self.change_sets.values().cloned().collect(),
            commits: self.graph.all_commits().cloned().collect(),
            commit_edges: self.graph.all_edges().cloned().collect(),
            change_set_owners: self
                .change_set_owner
                .iter()
                .map(|(cs, c)| (cs.clone(), *c))
                .collect(),
            versions: self.versions.all_versions().cloned().collect(),
            untracked: self.untracked.all_rows().cloned().collect(),
            cache: self.cache.all_rows().cloned().collect(),
            active_version: self.active_version.clone(),
            root_commit: self.root_commit,
            next_change: self.next_change,
            next_commit: self.next_commit,
            next_version: self.next_version,
            clock: self.clock,
            author: self.options.author.clone(),
        }
    }

    /// Restore a store from a captured snapshot.
    ///
    /// The snapshot's active version and root commit must be present in
    /// the restored registry and graph. The transaction buffer starts
    /// empty; observers must be re-registered by the host.
    pub fn from_serial(state: SerialState) -> Result<Self, StateError> {
        let mut store = Lix::with_options(StoreOptions {
            author: state.author,
        });

        store.changes = state.changes.into_iter().map(|c| (c.id, c)).collect();
        store.change_sets = state
            .change_sets
            .into_iter()
            .map(|cs| (cs.id.clone(), cs))
            .collect();
        store.change_set_owner = state.change_set_owners.into_iter().collect();

        // Edges are append-only, so inserting commits in stored order with
        // their parent edges reconstructs the same graph.
        let mut parents: IndexMap<CommitId, Vec<CommitId>> = IndexMap::new();
        for edge in state.commit_edges {
            parents.entry(edge.child_id).or_default().push(edge.parent_id);
        }
        let mut graph = CommitGraph::new();
        for commit in state.commits {
            let commit_parents = parents.swap_remove(&commit.id).unwrap_or_default();
            graph.insert_commit(commit, commit_parents)?;
        }
        store.graph = graph;

        let mut versions = VersionRegistry::new();
        for version in state.versions {
            // Replaces the bootstrap registry wholesale, so duplicates of
            // the seeded global/main versions do not arise.
            versions.insert(version)?;
        }
        store.versions = versions;

        // The registers below are trusted by infallible accessors such as
        // `resolve_active`, so a snapshot pointing outside its own tables
        // is rejected here.
        store.versions.get(&state.active_version)?;
        store.graph.get(state.root_commit)?;

        store.untracked = crate::cache::UntrackedTable::new();
        for row in state.untracked {
            store.untracked.upsert(row);
        }
        store.cache = crate::cache::CacheTable::new();
        for row in state.cache {
            store.cache.upsert(row);
        }

        store.active_version = state.active_version;
        store.root_commit = state.root_commit;
        store.next_change = state.next_change;
        store.next_commit = state.next_commit;
        store.next_version = state.next_version;
        store.clock = state.clock;
        Ok(store)
    }
}
