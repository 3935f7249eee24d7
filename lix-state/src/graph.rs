//! The commit graph: [`Commit`] nodes linked by [`CommitEdge`]s.
//!
//! Commits form a DAG: a commit may have multiple parents (merge commits)
//! and multiple children (branches). The graph is append-only; edges may
//! only be added towards commits that already exist, which keeps it acyclic
//! by construction.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use thiserror::Error;

use crate::ids::{ChangeSetId, CommitId};

/// A node in the history DAG, owning exactly one change set.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    /// Unique id of the commit.
    pub id: CommitId,
    /// The change set this commit owns.
    pub change_set_id: ChangeSetId,
}

/// A directed parent → child link between two commits.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct CommitEdge {
    /// The parent commit.
    pub parent_id: CommitId,
    /// The child commit.
    pub child_id: CommitId,
}

/// An error raised when mutating the commit graph.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum GraphError {
    /// The referenced commit is not in the graph.
    #[error("unknown commit: {0}")]
    UnknownCommit(CommitId),

    /// A commit with this id already exists.
    #[error("duplicate commit: {0}")]
    DuplicateCommit(CommitId),
}

/// Append-only store of commits and the edges between them.
#[derive(Clone, Debug, Default)]
pub struct CommitGraph {
    commits: IndexMap<CommitId, Commit>,
    edges: Vec<CommitEdge>,
    parents: IndexMap<CommitId, Vec<CommitId>>,
    children: IndexMap<CommitId, Vec<CommitId>>,
}

impl CommitGraph {
    /// Create an empty commit graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of commits in the graph.
    pub fn num_commits(&self) -> usize {
        self.commits.len()
    }

    /// Check if `commit_id` is in the graph.
    pub fn contains(&self, commit_id: CommitId) -> bool {
        self.commits.contains_key(&commit_id)
    }

    /// Get the commit with id `commit_id`.
    pub fn get(&self, commit_id: CommitId) -> Result<&Commit, GraphError> {
        self.commits
            .get(&commit_id)
            .ok_or(GraphError::UnknownCommit(commit_id))
    }

    /// Insert a new commit with edges from each of `parent_ids`.
    ///
    /// All parents must already be in the graph. Since edges are only ever
    /// created from existing commits to the new one, the graph stays acyclic.
    pub fn insert_commit(
        &mut self,
        commit: Commit,
        parent_ids: impl IntoIterator<Item = CommitId>,
    ) -> Result<(), GraphError> {
        if self.commits.contains_key(&commit.id) {
            return Err(GraphError::DuplicateCommit(commit.id));
        }
        let parent_ids: Vec<CommitId> = parent_ids.into_iter().collect();
        for &parent in &parent_ids {
            if !self.commits.contains_key(&parent) {
                return Err(GraphError::UnknownCommit(parent));
            }
        }

        let id = commit.id;
        self.commits.insert(id, commit);
        for parent in parent_ids {
            self.edges.push(CommitEdge {
                parent_id: parent,
                child_id: id,
            });
            self.parents.entry(id).or_default().push(parent);
            self.children.entry(parent).or_default().push(id);
        }
        Ok(())
    }

    /// Replace the change set owned by `commit_id`.
    ///
    /// Only the working commit of a version is ever reassigned; history
    /// commits are immutable.
    pub(crate) fn set_change_set(
        &mut self,
        commit_id: CommitId,
        change_set_id: ChangeSetId,
    ) -> Result<(), GraphError> {
        let commit = self
            .commits
            .get_mut(&commit_id)
            .ok_or(GraphError::UnknownCommit(commit_id))?;
        commit.change_set_id = change_set_id;
        Ok(())
    }

    /// Get the parents of `commit_id`.
    pub fn parents(&self, commit_id: CommitId) -> impl Iterator<Item = CommitId> + '_ {
        self.parents
            .get(&commit_id)
            .into_iter()
            .flatten()
            .copied()
    }

    /// Get the children of `commit_id`.
    pub fn children(&self, commit_id: CommitId) -> impl Iterator<Item = CommitId> + '_ {
        self.children
            .get(&commit_id)
            .into_iter()
            .flatten()
            .copied()
    }

    /// Iterate over all commits in insertion order.
    pub fn all_commits(&self) -> impl Iterator<Item = &Commit> + '_ {
        self.commits.values()
    }

    /// Iterate over all edges in insertion order.
    pub fn all_edges(&self) -> impl Iterator<Item = &CommitEdge> + '_ {
        self.edges.iter()
    }

    /// Walk the ancestry of `commit_id` in breadth-first order, starting
    /// with (and including) the commit itself.
    ///
    /// Nearer ancestors are visited before farther ones; each commit is
    /// visited at most once even when reachable along multiple paths.
    pub fn ancestors(&self, commit_id: CommitId) -> impl Iterator<Item = CommitId> + '_ {
        let mut seen = BTreeSet::new();
        let mut queue = std::collections::VecDeque::new();
        if self.contains(commit_id) {
            seen.insert(commit_id);
            queue.push_back(commit_id);
        }
        std::iter::from_fn(move || {
            let next = queue.pop_front()?;
            for parent in self.parents(next) {
                if seen.insert(parent) {
                    queue.push_back(parent);
                }
            }
            Some(next)
        })
    }
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;

    fn commit(id: u64) -> Commit {
        Commit {
            id: CommitId(id),
            change_set_id: ChangeSetId::from_change_ids([crate::ids::ChangeId(id)]),
        }
    }

    fn diamond() -> CommitGraph {
        // 0 -> {1, 2} -> 3
        let mut graph = CommitGraph::new();
        graph.insert_commit(commit(0), []).unwrap();
        graph.insert_commit(commit(1), [CommitId(0)]).unwrap();
        graph.insert_commit(commit(2), [CommitId(0)]).unwrap();
        graph
            .insert_commit(commit(3), [CommitId(1), CommitId(2)])
            .unwrap();
        graph
    }

    #[test]
    fn ancestors_are_breadth_first_and_deduplicated() {
        let graph = diamond();
        let order = graph.ancestors(CommitId(3)).collect_vec();
        assert_eq!(order[0], CommitId(3));
        assert_eq!(order.last(), Some(&CommitId(0)));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn unknown_parent_is_rejected() {
        let mut graph = CommitGraph::new();
        let err = graph.insert_commit(commit(1), [CommitId(42)]).unwrap_err();
        assert_eq!(err, GraphError::UnknownCommit(CommitId(42)));
    }

    #[test]
    fn duplicate_commit_is_rejected() {
        let mut graph = diamond();
        let err = graph.insert_commit(commit(2), []).unwrap_err();
        assert_eq!(err, GraphError::DuplicateCommit(CommitId(2)));
    }

    #[test]
    fn merge_commit_has_two_parents() {
        let graph = diamond();
        let parents = graph.parents(CommitId(3)).collect_vec();
        assert_eq!(parents, vec![CommitId(1), CommitId(2)]);
        assert_eq!(graph.children(CommitId(0)).count(), 2);
    }
}
