//! The [`Lix`] store: the owning handle over all state tables.
//!
//! A store instance owns the change log, change-set store, commit graph,
//! version registry, transaction buffer, untracked store and materialized
//! cache, plus the active-version register and the commit observers.
//! Independent store instances share nothing.
//!
//! The store assumes a single in-process mutator at a time (embedded
//! database style); external writers must be serialized by the host.

use std::panic::{AssertUnwindSafe, catch_unwind};

use delegate::delegate;
use derive_more::Display;
use indexmap::IndexMap;
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;
use tracing::warn;

use crate::change::{Change, ChangeSet, ChangeSetElement, OWN_FILE_ID, OWN_PLUGIN_KEY, OWN_SCHEMA_VERSION, VERSION_SCHEMA};
use crate::cache::{CacheTable, UntrackedTable};
use crate::engine::{CheckpointError, CommitError};
use crate::graph::{Commit, CommitGraph, GraphError};
use crate::ids::{
    ChangeId, ChangeSetId, CommitId, EntityId, FileId, SchemaKey, StateKey, Timestamp, VersionId,
};
use crate::merge::MergeError;
use crate::transaction::{PendingChange, StageError, TransactionBuffer};
use crate::version::{GLOBAL_VERSION_ID, Version, VersionError, VersionRegistry};

/// Umbrella error for store operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StateError {
    /// Error staging a mutation.
    #[error(transparent)]
    Stage(#[from] StageError),
    /// Error referencing a version.
    #[error(transparent)]
    Version(#[from] VersionError),
    /// Error referencing the commit graph.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Error during a commit.
    #[error(transparent)]
    Commit(#[from] CommitError),
    /// Error during a merge.
    #[error(transparent)]
    Merge(#[from] MergeError),
    /// Error creating a checkpoint.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Options of a store instance.
#[derive(Clone, Debug)]
pub struct StoreOptions {
    /// Account the store attributes changes to (one `lix_change_author`
    /// record per entity change).
    pub author: SmolStr,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            author: "anonymous".into(),
        }
    }
}

/// Handle of a registered commit observer.
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq, Hash)]
#[display("observer-{_0}")]
pub struct ObserverId(u64);

type CommitHandler = Box<dyn FnMut(&[Change])>;

/// A mutation to be staged into the transaction buffer.
///
/// Build one with [`Mutation::insert`] or [`Mutation::delete`] and the
/// `with_*` builder methods, then pass it to [`Lix::stage`].
#[derive(Clone, Debug)]
pub struct Mutation {
    key: StateKey,
    plugin_key: SmolStr,
    snapshot_content: Option<Value>,
    schema_version: SmolStr,
    version_id: Option<VersionId>,
    untracked: bool,
    writer_key: Option<SmolStr>,
    metadata: Option<Value>,
}

impl Mutation {
    /// A mutation writing `snapshot_content` for the given key.
    pub fn insert(
        entity_id: impl Into<EntityId>,
        schema_key: impl Into<SchemaKey>,
        file_id: impl Into<FileId>,
        snapshot_content: Value,
    ) -> Self {
        Self {
            key: StateKey::new(entity_id, schema_key, file_id),
            plugin_key: "application".into(),
            snapshot_content: Some(snapshot_content),
            schema_version: "1.0".into(),
            version_id: None,
            untracked: false,
            writer_key: None,
            metadata: None,
        }
    }

    /// A mutation deleting the given key.
    pub fn delete(
        entity_id: impl Into<EntityId>,
        schema_key: impl Into<SchemaKey>,
        file_id: impl Into<FileId>,
    ) -> Self {
        Self {
            snapshot_content: None,
            ..Self::insert(entity_id, schema_key, file_id, Value::Null)
        }
    }

    /// Target a specific version instead of the active one.
    pub fn in_version(mut self, version_id: impl Into<VersionId>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    /// Exclude the mutation from history; it persists to the untracked
    /// store at commit time and never creates a [`Change`].
    pub fn untracked(mut self) -> Self {
        self.untracked = true;
        self
    }

    /// Set the producer identity.
    pub fn with_plugin_key(mut self, plugin_key: impl Into<SmolStr>) -> Self {
        self.plugin_key = plugin_key.into();
        self
    }

    /// Set the payload schema version.
    pub fn with_schema_version(mut self, schema_version: impl Into<SmolStr>) -> Self {
        self.schema_version = schema_version.into();
        self
    }

    /// Tag the mutation with a writer key.
    pub fn with_writer_key(mut self, writer_key: impl Into<SmolStr>) -> Self {
        self.writer_key = Some(writer_key.into());
        self
    }

    /// Attach opaque metadata.
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// An embedded, change-tracked data store.
///
/// Every mutation to application data is simultaneously a durable,
/// queryable history event: staging ([`Self::stage`]) buffers mutations,
/// committing ([`Lix::commit`]) turns them into an atomic, self-describing
/// commit, and resolution ([`Lix::resolve`]) ranks the buffered, untracked,
/// cached and inherited tiers to produce the single visible value of an
/// entity in a version.
pub struct Lix {
    pub(crate) changes: IndexMap<ChangeId, Change>,
    pub(crate) change_sets: IndexMap<ChangeSetId, ChangeSet>,
    /// Owning history commit per change set (working commits excluded).
    pub(crate) change_set_owner: IndexMap<ChangeSetId, CommitId>,
    pub(crate) graph: CommitGraph,
    pub(crate) versions: VersionRegistry,
    pub(crate) transaction: TransactionBuffer,
    pub(crate) untracked: UntrackedTable,
    pub(crate) cache: CacheTable,
    pub(crate) active_version: VersionId,
    pub(crate) root_commit: CommitId,
    observers: Vec<(ObserverId, CommitHandler)>,
    pub(crate) next_change: u64,
    pub(crate) next_commit: u64,
    pub(crate) next_version: u64,
    next_observer: u64,
    pub(crate) clock: u64,
    pub(crate) options: StoreOptions,
}

impl std::fmt::Debug for Lix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lix")
            .field("changes", &self.changes.len())
            .field("commits", &self.graph.num_commits())
            .field("versions", &self.versions.all_versions().count())
            .field("active_version", &self.active_version)
            .finish_non_exhaustive()
    }
}

impl Default for Lix {
    fn default() -> Self {
        Self::new()
    }
}

impl Lix {
    /// Create a store with default options.
    ///
    /// The new store contains the global version and a `main` version
    /// inheriting from it; `main` is active.
    pub fn new() -> Self {
        Self::with_options(StoreOptions::default())
    }

    /// Create a store with the given options.
    pub fn with_options(options: StoreOptions) -> Self {
        let mut store = Self {
            changes: IndexMap::new(),
            change_sets: IndexMap::new(),
            change_set_owner: IndexMap::new(),
            graph: CommitGraph::new(),
            versions: VersionRegistry::new(),
            transaction: TransactionBuffer::new(),
            untracked: UntrackedTable::new(),
            cache: CacheTable::new(),
            active_version: GLOBAL_VERSION_ID.into(),
            root_commit: CommitId(0),
            observers: Vec::new(),
            next_change: 0,
            next_commit: 0,
            next_version: 0,
            next_observer: 0,
            clock: 0,
            options,
        };
        store.bootstrap();
        store
    }

    /// Seed the root commit, the global version and the default `main`
    /// version. These rows predate history and are written directly.
    fn bootstrap(&mut self) {
        let empty = self.insert_change_set(ChangeSet::empty());
        let root = self.allocate_commit_id();
        self.graph
            .insert_commit(
                Commit {
                    id: root,
                    change_set_id: empty.clone(),
                },
                [],
            )
            .expect("graph is empty at bootstrap");
        self.root_commit = root;
        self.change_set_owner.insert(empty, root);

        let global: VersionId = GLOBAL_VERSION_ID.into();
        let global_working = self.new_working_commit();
        self.versions
            .insert(Version {
                id: global.clone(),
                name: GLOBAL_VERSION_ID.into(),
                commit_id: root,
                working_commit_id: global_working,
                inherits_from_version_id: None,
            })
            .expect("registry is empty at bootstrap");

        let main: VersionId = "main".into();
        let main_working = self.new_working_commit();
        self.versions
            .insert(Version {
                id: main.clone(),
                name: "main".into(),
                commit_id: root,
                working_commit_id: main_working,
                inherits_from_version_id: Some(global.clone()),
            })
            .expect("global exists at bootstrap");

        self.active_version = main;
    }

    /// Insert a commit owning an empty change set, to serve as a version's
    /// working commit. Working commits are not recorded as change-set
    /// owners; history commits take precedence for leaf computation.
    pub(crate) fn new_working_commit(&mut self) -> CommitId {
        let empty = self.insert_change_set(ChangeSet::empty());
        let id = self.allocate_commit_id();
        self.graph
            .insert_commit(
                Commit {
                    id,
                    change_set_id: empty,
                },
                [],
            )
            .expect("freshly allocated commit id is unused");
        id
    }

    /// Insert `set` into the change-set store, reusing an existing set with
    /// the same content address.
    pub(crate) fn insert_change_set(&mut self, set: ChangeSet) -> ChangeSetId {
        let id = set.id.clone();
        self.change_sets.entry(id.clone()).or_insert(set);
        id
    }

    pub(crate) fn allocate_change_id(&mut self) -> ChangeId {
        let id = ChangeId(self.next_change);
        self.next_change += 1;
        id
    }

    pub(crate) fn allocate_commit_id(&mut self) -> CommitId {
        let id = CommitId(self.next_commit);
        self.next_commit += 1;
        id
    }

    /// Advance the logical clock and return the new instant.
    pub(crate) fn tick(&mut self) -> Timestamp {
        self.clock += 1;
        Timestamp(self.clock)
    }

    /// Stage a mutation into the transaction buffer.
    ///
    /// The mutation targets its explicit version or, by default, the active
    /// version. The target version must exist. Returns the id the
    /// materialized change will carry once committed.
    pub fn stage(&mut self, mutation: Mutation) -> Result<ChangeId, StateError> {
        let version_id = mutation
            .version_id
            .unwrap_or_else(|| self.active_version.clone());
        self.versions.get(&version_id)?;

        let change_id = self.allocate_change_id();
        let staged_at = self.tick();
        self.transaction.stage(PendingChange {
            change_id,
            key: mutation.key,
            plugin_key: mutation.plugin_key,
            snapshot_content: mutation.snapshot_content,
            schema_version: mutation.schema_version,
            version_id,
            untracked: mutation.untracked,
            writer_key: mutation.writer_key,
            metadata: mutation.metadata,
            staged_at,
        })?;
        Ok(change_id)
    }

    /// Create a new version, optionally inheriting from an existing one.
    ///
    /// The version starts at its parent's committed tip (or at the root
    /// commit when it has no parent) with a fresh working change set. The
    /// registry mutation is staged against the global version, so the next
    /// commit records a `lix_version` change describing the creation.
    pub fn create_version(
        &mut self,
        name: &str,
        inherits_from: Option<&VersionId>,
    ) -> Result<VersionId, StateError> {
        let id = VersionId::new(format!("v{}", self.next_version));
        self.next_version += 1;
        self.create_version_with_id(id, name, inherits_from)
    }

    /// Create a new version with an explicit id.
    pub fn create_version_with_id(
        &mut self,
        id: VersionId,
        name: &str,
        inherits_from: Option<&VersionId>,
    ) -> Result<VersionId, StateError> {
        let commit_id = match inherits_from {
            Some(parent) => self.versions.get(parent)?.commit_id,
            None => self.root_commit,
        };
        let working_commit_id = self.new_working_commit();
        let version = Version {
            id: id.clone(),
            name: name.into(),
            commit_id,
            working_commit_id,
            inherits_from_version_id: inherits_from.cloned(),
        };
        self.versions.insert(version.clone())?;
        self.stage_version_pointer(&version)?;
        Ok(id)
    }

    /// Stage a `lix_version` registry mutation against the global version.
    pub(crate) fn stage_version_pointer(&mut self, version: &Version) -> Result<(), StateError> {
        let change_id = self.allocate_change_id();
        let staged_at = self.tick();
        self.transaction.stage(PendingChange {
            change_id,
            key: StateKey::new(version.id.as_str(), VERSION_SCHEMA, OWN_FILE_ID),
            plugin_key: OWN_PLUGIN_KEY.into(),
            snapshot_content: Some(
                serde_json::to_value(version).expect("version rows are serializable"),
            ),
            schema_version: OWN_SCHEMA_VERSION.into(),
            version_id: GLOBAL_VERSION_ID.into(),
            untracked: false,
            writer_key: None,
            metadata: None,
            staged_at,
        })?;
        Ok(())
    }

    /// The currently active version.
    pub fn active_version(&self) -> &VersionId {
        &self.active_version
    }

    /// Make `version_id` the active version for subsequent mutations.
    pub fn switch_version(&mut self, version_id: &VersionId) -> Result<(), VersionError> {
        self.versions.get(version_id)?;
        self.active_version = version_id.clone();
        Ok(())
    }

    delegate! {
        to self.versions {
            /// Get the version with id `version_id`.
            #[call(get)]
            pub fn version(&self, version_id: &VersionId) -> Result<&Version, VersionError>;
            /// Iterate over all versions in creation order.
            pub fn all_versions(&self) -> impl Iterator<Item = &Version> + '_;
        }
        to self.graph {
            /// Get the commit with id `commit_id`.
            #[call(get)]
            pub fn commit_by_id(&self, commit_id: CommitId) -> Result<&Commit, GraphError>;
            /// Iterate over all commits in creation order.
            pub fn all_commits(&self) -> impl Iterator<Item = &Commit> + '_;
            /// Iterate over all commit edges in creation order.
            pub fn all_edges(&self) -> impl Iterator<Item = &crate::graph::CommitEdge> + '_;
        }
    }

    /// Get the change with id `change_id` from the change log.
    pub fn change(&self, change_id: ChangeId) -> Option<&Change> {
        self.changes.get(&change_id)
    }

    /// Iterate over the change log in append order.
    pub fn all_changes(&self) -> impl Iterator<Item = &Change> + '_ {
        self.changes.values()
    }

    /// Get the change set with id `change_set_id`.
    pub fn change_set(&self, change_set_id: &ChangeSetId) -> Option<&ChangeSet> {
        self.change_sets.get(change_set_id)
    }

    /// Iterate over all change sets.
    pub fn all_change_sets(&self) -> impl Iterator<Item = &ChangeSet> + '_ {
        self.change_sets.values()
    }

    /// The changes referenced by the elements of `change_set_id`.
    pub fn changes_in(&self, change_set_id: &ChangeSetId) -> Option<Vec<&Change>> {
        let set = self.change_sets.get(change_set_id)?;
        Some(
            set.elements
                .iter()
                .filter_map(|e| self.changes.get(&e.change_id))
                .collect(),
        )
    }

    /// The elements of the working change set of `version_id`: the
    /// mutations committed since the last checkpoint.
    pub fn working_elements(
        &self,
        version_id: &VersionId,
    ) -> Result<&[ChangeSetElement], StateError> {
        let version = self.versions.get(version_id)?;
        let commit = self.graph.get(version.working_commit_id)?;
        let set = self
            .change_sets
            .get(&commit.change_set_id)
            .expect("working commit owns a stored change set");
        Ok(&set.elements)
    }

    /// Iterate over the untracked rows.
    pub fn all_untracked_rows(&self) -> impl Iterator<Item = &crate::cache::UntrackedRow> + '_ {
        self.untracked.all_rows()
    }

    /// Iterate over the materialized cache rows.
    pub fn all_cache_rows(&self) -> impl Iterator<Item = &crate::cache::CacheRow> + '_ {
        self.cache.all_rows()
    }

    /// Register a commit observer.
    ///
    /// The handler fires once per top-level commit, synchronously after
    /// persistence, with the list of newly materialized changes. A handler
    /// that panics is isolated: the panic is swallowed (and logged) so it
    /// cannot unwind into, or fail, the commit.
    pub fn on_commit(&mut self, handler: impl FnMut(&[Change]) + 'static) -> ObserverId {
        let id = ObserverId(self.next_observer);
        self.next_observer += 1;
        self.observers.push((id, Box::new(handler)));
        id
    }

    /// Remove a commit observer. Returns whether it was registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.observers.len();
        self.observers.retain(|(oid, _)| *oid != id);
        self.observers.len() != before
    }

    /// Deliver a commit notification to every observer.
    pub(crate) fn notify_observers(&mut self, changes: &[Change]) {
        for (id, handler) in &mut self.observers {
            if catch_unwind(AssertUnwindSafe(|| handler(changes))).is_err() {
                warn!(observer = %id, "commit observer panicked; ignoring");
            }
        }
    }
}
