//! The merge engine: combining two change sets into a new one.
//!
//! A merge computes the *leaves* of both sets — the most-derived element
//! per `(entity, schema, file)` key reachable in each set's commit
//! ancestry — and unions them with the source winning unconditionally on
//! key collisions. No conflict object is produced. The resulting change
//! set is attached to a two-parent merge commit, making it a regular node
//! in the commit graph usable by the state resolver without
//! special-casing.

use indexmap::IndexMap;
use thiserror::Error;
use tracing::debug;

use crate::change::{ChangeSet, ChangeSetElement};
use crate::graph::{Commit, GraphError};
use crate::ids::{ChangeSetId, CommitId, StateKey, Timestamp};
use crate::store::Lix;

/// An error raised while merging change sets.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum MergeError {
    /// The change set is not in the store.
    #[error("unknown change set: {0}")]
    UnknownChangeSet(ChangeSetId),

    /// The change set is not owned by any history commit, so it has no
    /// ancestry to compute leaves over (e.g. a working change set).
    #[error("change set {0} is not owned by a history commit")]
    UnownedChangeSet(ChangeSetId),

    /// The commit graph rejected the merge commit.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

impl Lix {
    /// Merge `source` into `target`, producing a new change set.
    ///
    /// The result contains the union of the source's leaves with those
    /// target leaves whose keys the source does not cover: the source wins
    /// unconditionally on collision. The new set is attached to a merge
    /// commit with edges from both owning commits. Returns the id of the
    /// new change set.
    pub fn merge(
        &mut self,
        source: &ChangeSetId,
        target: &ChangeSetId,
    ) -> Result<ChangeSetId, MergeError> {
        let source_owner = self.owning_commit(source)?;
        let target_owner = self.owning_commit(target)?;

        let mut elements = self.leaf_map(source_owner)?;
        for (key, element) in self.leaf_map(target_owner)? {
            elements.entry(key).or_insert(element);
        }

        let set = ChangeSet::from_elements(elements.into_values());
        let set_id = self.insert_change_set(set);
        let merge_commit = self.allocate_commit_id();
        self.graph.insert_commit(
            Commit {
                id: merge_commit,
                change_set_id: set_id.clone(),
            },
            [source_owner, target_owner],
        )?;
        self.change_set_owner.insert(set_id.clone(), merge_commit);

        debug!(
            source = %source, target = %target, result = %set_id,
            commit = %merge_commit, "merged change sets"
        );
        Ok(set_id)
    }

    /// The leaf elements of `change_set_id`: the most-derived element per
    /// key reachable in its owning commit's ancestry.
    pub fn leaves_of(
        &self,
        change_set_id: &ChangeSetId,
    ) -> Result<Vec<ChangeSetElement>, MergeError> {
        let owner = self.owning_commit(change_set_id)?;
        Ok(self.leaf_map(owner)?.into_values().collect())
    }

    fn owning_commit(&self, change_set_id: &ChangeSetId) -> Result<CommitId, MergeError> {
        if !self.change_sets.contains_key(change_set_id) {
            return Err(MergeError::UnknownChangeSet(change_set_id.clone()));
        }
        self.change_set_owner
            .get(change_set_id)
            .copied()
            .ok_or_else(|| MergeError::UnownedChangeSet(change_set_id.clone()))
    }

    /// Walk the commit ancestry of `owner` nearest-first, keeping the
    /// first element seen per key. Within one change set the most recent
    /// change wins.
    fn leaf_map(&self, owner: CommitId) -> Result<IndexMap<StateKey, ChangeSetElement>, MergeError> {
        let mut leaves: IndexMap<StateKey, ChangeSetElement> = IndexMap::new();
        for commit_id in self.graph.ancestors(owner) {
            let commit = self.graph.get(commit_id)?;
            let Some(set) = self.change_sets.get(&commit.change_set_id) else {
                continue;
            };

            let mut local: IndexMap<StateKey, &ChangeSetElement> = IndexMap::new();
            for element in &set.elements {
                let key = element.key();
                match local.entry(key) {
                    indexmap::map::Entry::Vacant(slot) => {
                        slot.insert(element);
                    }
                    indexmap::map::Entry::Occupied(mut slot) => {
                        if self.change_recency(element) > self.change_recency(slot.get()) {
                            slot.insert(element);
                        }
                    }
                }
            }
            for (key, element) in local {
                leaves.entry(key).or_insert_with(|| element.clone());
            }
        }
        Ok(leaves)
    }

    /// Recency of an element's change: `created_at` first, change id as
    /// the tie-break.
    fn change_recency(&self, element: &ChangeSetElement) -> (Timestamp, crate::ids::ChangeId) {
        let created_at = self
            .changes
            .get(&element.change_id)
            .map(|c| c.created_at)
            .unwrap_or_default();
        (created_at, element.change_id)
    }
}
