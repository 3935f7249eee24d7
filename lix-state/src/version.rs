//! The version registry: named pointers into the commit graph.
//!
//! A [`Version`] is a branch-like pointer: `commit_id` is the committed tip
//! and `working_commit_id` points to the always-present working change set
//! accumulating mutations since the last checkpoint. Versions may inherit
//! from one another, forming a forest: a version without an own value for an
//! entity sees the nearest ancestor's value.
//!
//! One distinguished version, the *global* version, has no parent and
//! records every mutation to the registry itself (version pointers, commit
//! and change-set creation) as ordinary committed changes.

use indexmap::IndexMap;
use smol_str::SmolStr;
use thiserror::Error;

use crate::ids::{CommitId, VersionId};

/// Id of the global version, created when the store is initialized.
pub const GLOBAL_VERSION_ID: &str = "global";

/// A named, possibly-inheriting pointer into the commit graph.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Version {
    /// Unique id of the version.
    pub id: VersionId,
    /// Human-readable name.
    pub name: SmolStr,
    /// The current committed tip.
    pub commit_id: CommitId,
    /// The commit owning the working change set.
    pub working_commit_id: CommitId,
    /// The version this one inherits unshadowed state from, if any.
    pub inherits_from_version_id: Option<VersionId>,
}

impl Version {
    /// Whether this is the global version.
    pub fn is_global(&self) -> bool {
        self.id.as_str() == GLOBAL_VERSION_ID
    }
}

/// An error raised when mutating or querying the version registry.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum VersionError {
    /// The referenced version does not exist.
    #[error("unknown version: {0}")]
    UnknownVersion(VersionId),

    /// A version with this id already exists.
    #[error("duplicate version: {0}")]
    DuplicateVersion(VersionId),

    /// Inserting the version would create an inheritance cycle.
    #[error("version {0} would inherit from itself")]
    InheritanceCycle(VersionId),
}

/// The registry of all versions of a store.
#[derive(Clone, Debug, Default)]
pub struct VersionRegistry {
    versions: IndexMap<VersionId, Version>,
}

impl VersionRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if `version_id` exists.
    pub fn contains(&self, version_id: &VersionId) -> bool {
        self.versions.contains_key(version_id)
    }

    /// Get the version with id `version_id`.
    pub fn get(&self, version_id: &VersionId) -> Result<&Version, VersionError> {
        self.versions
            .get(version_id)
            .ok_or_else(|| VersionError::UnknownVersion(version_id.clone()))
    }

    /// Insert a new version.
    ///
    /// Rejects duplicate ids and inheritance cycles. Cycles are checked at
    /// creation time; `inherits_from_version_id` is never reassigned
    /// afterwards, so the forest stays acyclic for the lifetime of the
    /// registry.
    pub fn insert(&mut self, version: Version) -> Result<(), VersionError> {
        if self.versions.contains_key(&version.id) {
            return Err(VersionError::DuplicateVersion(version.id));
        }
        if let Some(parent) = &version.inherits_from_version_id {
            if *parent == version.id {
                return Err(VersionError::InheritanceCycle(version.id));
            }
            // The parent chain must exist and must not lead back to the new id.
            for ancestor in self.inheritance_chain(parent) {
                let ancestor = ancestor?;
                if ancestor.id == version.id {
                    return Err(VersionError::InheritanceCycle(version.id));
                }
            }
        }
        self.versions.insert(version.id.clone(), version);
        Ok(())
    }

    /// Move the committed tip of `version_id` to `commit_id`.
    pub fn set_commit(
        &mut self,
        version_id: &VersionId,
        commit_id: CommitId,
    ) -> Result<(), VersionError> {
        let version = self
            .versions
            .get_mut(version_id)
            .ok_or_else(|| VersionError::UnknownVersion(version_id.clone()))?;
        version.commit_id = commit_id;
        Ok(())
    }

    /// Iterate over the inheritance chain of `version_id`, starting at the
    /// version itself and walking towards the root of the forest.
    ///
    /// A registry corrupted into a cycle terminates the walk at the first
    /// revisited version instead of looping.
    pub fn inheritance_chain<'r>(
        &'r self,
        version_id: &VersionId,
    ) -> impl Iterator<Item = Result<&'r Version, VersionError>> + 'r {
        let mut next = Some(version_id.clone());
        let mut seen: Vec<VersionId> = Vec::new();
        std::iter::from_fn(move || {
            let id = next.take()?;
            if seen.contains(&id) {
                return None;
            }
            seen.push(id.clone());
            match self.get(&id) {
                Ok(version) => {
                    next = version.inherits_from_version_id.clone();
                    Some(Ok(version))
                }
                Err(err) => Some(Err(err)),
            }
        })
    }

    /// The ancestors of `version_id` in nearest-first order, excluding the
    /// version itself.
    pub fn ancestors<'r>(
        &'r self,
        version_id: &VersionId,
    ) -> impl Iterator<Item = Result<&'r Version, VersionError>> + 'r {
        self.inheritance_chain(version_id).skip(1)
    }

    /// Iterate over all versions in insertion order.
    pub fn all_versions(&self) -> impl Iterator<Item = &Version> + '_ {
        self.versions.values()
    }
}
