//! The commit engine: draining the transaction buffer into history.
//!
//! A commit runs through four phases: *Draining* (read the buffered
//! mutations, grouped by version), *Closure* (materialize the entity
//! changes, then synthesize the registry changes describing the commit
//! itself into the same change set — a bounded two-pass loop, not
//! open-ended recursion), *Persisting* (change log, change-set store,
//! commit graph, version pointers and cache, all-or-nothing) and
//! *Propagating-Global* (a single follow-up commit against the global
//! version absorbing every non-global pointer update).
//!
//! The change-set id is content-addressed over all element change ids; the
//! registry pass allocates its change ids before the id is computed, so
//! synthesizing the registry changes cannot alter it, which is what bounds
//! the closure at two passes.

use serde_json::json;
use smol_str::SmolStr;
use thiserror::Error;
use tracing::{debug, trace};

use crate::cache::{CacheRow, UntrackedRow};
use crate::change::{
    Change, ChangeSet, ChangeSetElement, CHANGE_AUTHOR_SCHEMA, CHANGE_SET_SCHEMA,
    COMMIT_EDGE_SCHEMA, COMMIT_SCHEMA, OWN_FILE_ID, OWN_PLUGIN_KEY, OWN_SCHEMA_VERSION,
    VERSION_SCHEMA,
};
use crate::graph::{Commit, GraphError};
use crate::ids::{ChangeId, ChangeSetId, CommitId, StateKey, VersionId};
use crate::store::Lix;
use crate::transaction::PendingChange;
use crate::version::{GLOBAL_VERSION_ID, VersionError};

/// An error raised while committing.
///
/// A failed commit aborts as a whole: no partial change log, graph or
/// cache mutation remains observable and the transaction buffer is left
/// intact for an explicit retry by the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CommitError {
    /// A buffered mutation references a version missing from the registry.
    #[error(transparent)]
    Version(#[from] VersionError),
    /// The commit graph rejected a node or edge.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// An error raised while creating a checkpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CheckpointError {
    /// The version's working change set has no elements.
    #[error("nothing to checkpoint in version {0}")]
    EmptyWorkingChangeSet(VersionId),
    /// The version does not exist.
    #[error(transparent)]
    Version(#[from] VersionError),
    /// The commit graph rejected the checkpoint commit.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// The result of a top-level [`Lix::commit`].
#[derive(Clone, Debug, Default)]
pub struct CommitOutcome {
    /// The sub-commits performed, in order; the global propagation commit
    /// is last when one was needed.
    pub committed: Vec<(VersionId, CommitId)>,
    /// Every change materialized by this commit, entity and meta alike.
    pub changes: Vec<Change>,
}

impl CommitOutcome {
    /// Whether the commit was an idempotent no-op.
    pub fn is_noop(&self) -> bool {
        self.committed.is_empty()
    }
}

/// One committed version within a top-level commit.
struct SubCommit {
    version_id: VersionId,
    commit_id: CommitId,
    changes: Vec<Change>,
    /// The entity deletions of this sub-commit; their tombstone rows are
    /// settled once the whole transaction has persisted.
    deletions: Vec<Change>,
}

impl Lix {
    /// Drain the transaction buffer into an atomic, self-describing commit.
    ///
    /// Every version with pending tracked mutations is committed, then a
    /// single global commit absorbs all version-pointer updates (plus any
    /// mutations staged directly against the global version). Untracked
    /// entries persist to the untracked store without touching the change
    /// log. With an empty buffer this is an idempotent no-op: no `Change`,
    /// `ChangeSet` or `Commit` row is created and no notification fires.
    pub fn commit(&mut self) -> Result<CommitOutcome, CommitError> {
        if self.transaction.is_empty() {
            trace!("commit with empty transaction buffer: no-op");
            return Ok(CommitOutcome::default());
        }

        // Draining. Validate every referenced version before mutating
        // anything, so the phases below cannot fail halfway through.
        let tracked: Vec<(VersionId, Vec<PendingChange>)> = self
            .transaction
            .tracked_by_version()
            .into_iter()
            .map(|(v, entries)| (v, entries.into_iter().cloned().collect()))
            .collect();
        let untracked: Vec<PendingChange> =
            self.transaction.untracked_entries().cloned().collect();
        for (version_id, _) in &tracked {
            self.versions.get(version_id)?;
        }
        for entry in &untracked {
            self.versions.get(&entry.version_id)?;
        }

        let global: VersionId = GLOBAL_VERSION_ID.into();
        let mut outcome = CommitOutcome::default();
        let mut global_entries: Vec<PendingChange> = Vec::new();
        let mut deletions: Vec<(Change, CommitId)> = Vec::new();

        // Commit each non-global version; their pointer updates become
        // pending mutations against the global version.
        for (version_id, entries) in tracked {
            if version_id == global {
                global_entries.extend(entries);
                continue;
            }
            let sub = self.commit_version(&version_id, entries)?;
            global_entries.push(self.version_pointer_entry(&version_id)?);
            let commit_id = sub.commit_id;
            deletions.extend(sub.deletions.into_iter().map(|c| (c, commit_id)));
            outcome.committed.push((sub.version_id, commit_id));
            outcome.changes.extend(sub.changes);
        }

        // Propagating-Global: one commit absorbs every pointer update.
        // Committing the global version does not recurse further; its own
        // pointer update is synthesized inline by the closure.
        if !global_entries.is_empty() {
            let sub = self.commit_version(&global, global_entries)?;
            let commit_id = sub.commit_id;
            deletions.extend(sub.deletions.into_iter().map(|c| (c, commit_id)));
            outcome.committed.push((sub.version_id, commit_id));
            outcome.changes.extend(sub.changes);
        }

        // Untracked entries bypass the change/commit machinery entirely.
        // Inserts land before deletions so a deletion's shadowing decision
        // sees every value written by this transaction.
        let (deletes, inserts): (Vec<_>, Vec<_>) =
            untracked.into_iter().partition(|e| e.is_deletion());
        for entry in inserts.into_iter().chain(deletes) {
            self.persist_untracked(entry);
        }

        self.settle_tombstones(deletions);

        self.transaction.clear();

        debug!(
            sub_commits = outcome.committed.len(),
            changes = outcome.changes.len(),
            "commit complete"
        );
        if !outcome.changes.is_empty() {
            let changes = outcome.changes.clone();
            self.notify_observers(&changes);
        }
        Ok(outcome)
    }

    /// Commit the pending `entries` of a single version.
    fn commit_version(
        &mut self,
        version_id: &VersionId,
        entries: Vec<PendingChange>,
    ) -> Result<SubCommit, CommitError> {
        let version = self.versions.get(version_id)?.clone();
        let parent_commit = version.commit_id;

        // Closure pass 1: materialize the entity changes.
        let mut entity_changes: Vec<Change> = Vec::with_capacity(entries.len());
        for entry in entries {
            let created_at = self.tick();
            entity_changes.push(Change {
                id: entry.change_id,
                entity_id: entry.key.entity_id,
                schema_key: entry.key.schema_key,
                file_id: entry.key.file_id,
                plugin_key: entry.plugin_key,
                snapshot_content: entry.snapshot_content,
                schema_version: entry.schema_version,
                created_at,
                version_id: entry.version_id,
                writer_key: entry.writer_key,
                metadata: entry.metadata,
            });
        }

        // Closure pass 2: synthesize the registry changes describing this
        // very commit. Their ids are allocated before the change-set id is
        // computed, since the id is content-addressed over every element
        // and no element may be added once it is fixed.
        let meta_count = 3 + entity_changes.len() + usize::from(version.is_global());
        let meta_ids: Vec<ChangeId> = (0..meta_count).map(|_| self.allocate_change_id()).collect();
        let change_set_id = ChangeSetId::from_change_ids(
            entity_changes
                .iter()
                .map(|c| c.id)
                .chain(meta_ids.iter().copied()),
        );
        let commit_id = self.allocate_commit_id();

        // The registry changes carry `version_id = global` (registry
        // metadata is globally scoped) while being elements of this
        // commit's set.
        let mut meta_ids = meta_ids.into_iter();
        let mut meta_changes = Vec::with_capacity(meta_count);
        self.synthesize_meta(
            &mut meta_changes,
            meta_ids.next().expect("an id was allocated for every registry change"),
            CHANGE_SET_SCHEMA,
            change_set_id.as_str(),
            json!({ "id": change_set_id.as_str() }),
        );
        self.synthesize_meta(
            &mut meta_changes,
            meta_ids.next().expect("an id was allocated for every registry change"),
            COMMIT_SCHEMA,
            &commit_id.to_string(),
            json!({ "id": commit_id.to_string(), "change_set_id": change_set_id.as_str() }),
        );
        self.synthesize_meta(
            &mut meta_changes,
            meta_ids.next().expect("an id was allocated for every registry change"),
            COMMIT_EDGE_SCHEMA,
            &format!("{parent_commit}~{commit_id}"),
            json!({
                "parent_id": parent_commit.to_string(),
                "child_id": commit_id.to_string(),
            }),
        );
        let author = self.options.author.clone();
        for change in &entity_changes {
            let change_id = change.id;
            self.synthesize_meta(
                &mut meta_changes,
                meta_ids.next().expect("an id was allocated for every registry change"),
                CHANGE_AUTHOR_SCHEMA,
                &format!("{change_id}~{author}"),
                json!({ "change_id": change_id, "account_id": author }),
            );
        }
        if version.is_global() {
            // The global pointer update is described inline; this is what
            // terminates the propagation instead of recursing.
            let mut updated = version.clone();
            updated.commit_id = commit_id;
            self.synthesize_meta(
                &mut meta_changes,
                meta_ids.next().expect("an id was allocated for every registry change"),
                VERSION_SCHEMA,
                updated.id.as_str(),
                serde_json::to_value(&updated).expect("version rows are serializable"),
            );
        }

        // Persisting. All inputs are validated; from here on every write
        // lands.
        for change in entity_changes.iter().chain(&meta_changes) {
            self.changes.insert(change.id, change.clone());
        }
        let elements: Vec<ChangeSetElement> = entity_changes
            .iter()
            .chain(&meta_changes)
            .map(|c| ChangeSetElement {
                change_set_id: change_set_id.clone(),
                change_id: c.id,
                entity_id: c.entity_id.clone(),
                schema_key: c.schema_key.clone(),
                file_id: c.file_id.clone(),
            })
            .collect();
        self.insert_change_set(ChangeSet {
            id: change_set_id.clone(),
            elements: elements.clone(),
        });
        self.graph.insert_commit(
            Commit {
                id: commit_id,
                change_set_id: change_set_id.clone(),
            },
            [parent_commit],
        )?;
        self.change_set_owner
            .insert(change_set_id.clone(), commit_id);
        self.versions.set_commit(version_id, commit_id)?;

        let global: VersionId = GLOBAL_VERSION_ID.into();
        for change in &entity_changes {
            self.refresh_cache(version_id, change, commit_id);
        }
        for change in &meta_changes {
            self.refresh_cache(&global, change, commit_id);
        }

        // Accumulate the entity elements into the working change set.
        let entity_elements = &elements[..entity_changes.len()];
        self.extend_working_set(version.working_commit_id, entity_elements)?;

        trace!(version = %version_id, commit = %commit_id, "sub-commit persisted");

        let deletions: Vec<Change> = entity_changes
            .iter()
            .filter(|c| c.is_tombstone())
            .cloned()
            .collect();
        let mut changes = entity_changes;
        changes.extend(meta_changes);
        Ok(SubCommit {
            version_id: version_id.clone(),
            commit_id,
            changes,
            deletions,
        })
    }

    /// Materialize one synthesized registry change under a pre-allocated id.
    fn synthesize_meta(
        &mut self,
        out: &mut Vec<Change>,
        id: ChangeId,
        schema_key: &str,
        entity_id: &str,
        snapshot: serde_json::Value,
    ) {
        let created_at = self.tick();
        out.push(Change {
            id,
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: OWN_FILE_ID.into(),
            plugin_key: SmolStr::new(OWN_PLUGIN_KEY),
            snapshot_content: Some(snapshot),
            schema_version: OWN_SCHEMA_VERSION.into(),
            created_at,
            version_id: GLOBAL_VERSION_ID.into(),
            writer_key: None,
            metadata: None,
        });
    }

    /// The pending `lix_version` mutation recording the new committed tip
    /// of `version_id`, targeted at the global version.
    fn version_pointer_entry(&mut self, version_id: &VersionId) -> Result<PendingChange, CommitError> {
        let version = self.versions.get(version_id)?.clone();
        let change_id = self.allocate_change_id();
        let staged_at = self.tick();
        Ok(PendingChange {
            change_id,
            key: StateKey::new(version.id.as_str(), VERSION_SCHEMA, OWN_FILE_ID),
            plugin_key: OWN_PLUGIN_KEY.into(),
            snapshot_content: Some(
                serde_json::to_value(&version).expect("version rows are serializable"),
            ),
            schema_version: OWN_SCHEMA_VERSION.into(),
            version_id: GLOBAL_VERSION_ID.into(),
            untracked: false,
            writer_key: None,
            metadata: None,
            staged_at,
        })
    }

    /// Refresh the materialized cache for one committed change.
    ///
    /// Deletions only remove the own row here; whether a tombstone row must
    /// shadow an inherited value is settled once the whole transaction has
    /// persisted, in [`Self::settle_tombstones`].
    fn refresh_cache(&mut self, version_id: &VersionId, change: &Change, commit_id: CommitId) {
        let key = change.key();
        if change.is_tombstone() {
            self.cache.remove(version_id, &key);
        } else {
            self.cache.upsert(CacheRow {
                entity_id: key.entity_id,
                schema_key: key.schema_key,
                file_id: key.file_id,
                version_id: version_id.clone(),
                snapshot_content: change.snapshot_content.clone(),
                change_id: change.id,
                commit_id,
                inherited_from_version_id: None,
                is_tombstone: false,
                created_at: change.created_at,
            });
        }
    }

    /// Write tombstone rows for the transaction's deletions that still
    /// shadow an inherited value.
    ///
    /// Evaluated against the fully persisted state of the whole
    /// transaction: a deletion of an entity that another version inserted
    /// in the same transaction must shadow regardless of the order the two
    /// mutations were staged or their sub-commits ran.
    fn settle_tombstones(&mut self, deletions: Vec<(Change, CommitId)>) {
        for (change, commit_id) in deletions {
            let key = change.key();
            if self.inherited_value_visible(&change.version_id, &key) {
                self.cache.upsert(CacheRow {
                    entity_id: key.entity_id,
                    schema_key: key.schema_key,
                    file_id: key.file_id,
                    version_id: change.version_id.clone(),
                    snapshot_content: None,
                    change_id: change.id,
                    commit_id,
                    inherited_from_version_id: None,
                    is_tombstone: true,
                    created_at: change.created_at,
                });
            }
        }
    }

    /// Persist one untracked entry, with the same tombstone rule as the
    /// cache but no change lineage.
    fn persist_untracked(&mut self, entry: PendingChange) {
        let key = entry.key.clone();
        let version_id = entry.version_id.clone();
        if entry.is_deletion() {
            self.untracked.remove(&version_id, &key);
            let shadows = self.cache.get(&version_id, &key).is_some_and(|r| !r.is_tombstone)
                || self.inherited_value_visible(&version_id, &key);
            if shadows {
                self.untracked.upsert(UntrackedRow {
                    entity_id: key.entity_id,
                    schema_key: key.schema_key,
                    file_id: key.file_id,
                    version_id,
                    snapshot_content: None,
                    inherited_from_version_id: None,
                    inheritance_delete_marker: true,
                    created_at: entry.staged_at,
                });
            }
        } else {
            self.untracked.upsert(UntrackedRow {
                entity_id: key.entity_id,
                schema_key: key.schema_key,
                file_id: key.file_id,
                version_id,
                snapshot_content: entry.snapshot_content,
                inherited_from_version_id: None,
                inheritance_delete_marker: false,
                created_at: entry.staged_at,
            });
        }
    }

    /// Replace the working change set of `working_commit_id` with the leaf
    /// union of its current elements and `new_elements`.
    fn extend_working_set(
        &mut self,
        working_commit_id: CommitId,
        new_elements: &[ChangeSetElement],
    ) -> Result<(), CommitError> {
        if new_elements.is_empty() {
            return Ok(());
        }
        let current_id = self.graph.get(working_commit_id)?.change_set_id.clone();
        let current = self
            .change_sets
            .get(&current_id)
            .expect("working commit owns a stored change set");

        let mut by_key: indexmap::IndexMap<StateKey, ChangeSetElement> = current
            .elements
            .iter()
            .map(|e| (e.key(), e.clone()))
            .collect();
        for element in new_elements {
            by_key.insert(element.key(), element.clone());
        }
        let set = ChangeSet::from_elements(by_key.into_values());
        let set_id = self.insert_change_set(set);
        self.graph.set_change_set(working_commit_id, set_id)?;
        Ok(())
    }

    /// Seal the working change set of `version_id` into a checkpoint
    /// commit.
    ///
    /// The checkpoint commit owns the accumulated working change set, gets
    /// an edge from the version's committed tip and becomes the new tip;
    /// the working change set is reset to empty. The pointer update is
    /// recorded in the global version's history like any other commit.
    pub fn create_checkpoint(
        &mut self,
        version_id: &VersionId,
    ) -> Result<CommitId, CheckpointError> {
        let version = self.versions.get(version_id)?.clone();
        let working_set_id = self.graph.get(version.working_commit_id)?.change_set_id.clone();
        let working = self
            .change_sets
            .get(&working_set_id)
            .expect("working commit owns a stored change set");
        if working.is_empty() {
            return Err(CheckpointError::EmptyWorkingChangeSet(version_id.clone()));
        }

        let checkpoint_id = self.allocate_commit_id();
        self.graph.insert_commit(
            Commit {
                id: checkpoint_id,
                change_set_id: working_set_id.clone(),
            },
            [version.commit_id],
        )?;
        self.change_set_owner.insert(working_set_id, checkpoint_id);
        self.versions.set_commit(version_id, checkpoint_id)?;

        let empty = self.insert_change_set(ChangeSet::empty());
        self.graph.set_change_set(version.working_commit_id, empty)?;

        debug!(version = %version_id, commit = %checkpoint_id, "checkpoint created");

        // Describe the pointer move in the global history.
        let pointer = self
            .version_pointer_entry(version_id)
            .map_err(|err| match err {
                CommitError::Version(e) => CheckpointError::Version(e),
                CommitError::Graph(e) => CheckpointError::Graph(e),
            })?;
        let global: VersionId = GLOBAL_VERSION_ID.into();
        let sub = self
            .commit_version(&global, vec![pointer])
            .map_err(|err| match err {
                CommitError::Version(e) => CheckpointError::Version(e),
                CommitError::Graph(e) => CheckpointError::Graph(e),
            })?;
        let changes = sub.changes;
        self.notify_observers(&changes);

        Ok(checkpoint_id)
    }
}
