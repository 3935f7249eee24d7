//! The state resolver: six-tier ranked lookup of entity state.
//!
//! Given `(entity, schema, file, version)`, candidates are drawn from six
//! tiers and the numerically lowest tier with a matching row wins:
//!
//! | priority | tier                          | source                       |
//! |----------|-------------------------------|------------------------------|
//! | 1        | pending transaction (own)     | transaction buffer           |
//! | 2        | untracked (own)               | untracked store              |
//! | 3        | cache (own, committed)        | materialized cache           |
//! | 4        | inherited cache               | ancestor version's cache     |
//! | 5        | inherited untracked           | ancestor untracked store     |
//! | 6        | inherited pending transaction | ancestor transaction buffer  |
//!
//! Inheritance is resolved transitively, one ancestor at a time: the
//! nearest ancestor's tiers are consulted before walking further up. A
//! winning row without snapshot content is a tombstone: it still wins the
//! ranking and yields "entity not visible", which is how a child version
//! hides an ancestor's entity without mutating the ancestor.

use serde_json::Value;

use crate::ids::{ChangeId, CommitId, StateKey, Timestamp, VersionId};
use crate::store::Lix;
use crate::version::VersionError;

/// The ranked sources a resolved value can come from.
///
/// The numeric priorities are a stable contract consumed by query layers
/// compiling declarative reads into physical tier lookups.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    /// Pending transaction entry of the queried version.
    Pending,
    /// Untracked row of the queried version.
    Untracked,
    /// Committed cache row of the queried version.
    Cache,
    /// Cache row of an ancestor version.
    InheritedCache,
    /// Untracked row of an ancestor version.
    InheritedUntracked,
    /// Pending transaction entry of an ancestor version.
    InheritedPending,
}

impl Tier {
    /// The priority number of the tier; lower wins.
    pub fn priority(self) -> u8 {
        match self {
            Tier::Pending => 1,
            Tier::Untracked => 2,
            Tier::Cache => 3,
            Tier::InheritedCache => 4,
            Tier::InheritedUntracked => 5,
            Tier::InheritedPending => 6,
        }
    }
}

/// A resolved, visible entity state.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedState {
    /// The resolved key.
    pub key: StateKey,
    /// The version the lookup was made against.
    pub version_id: VersionId,
    /// The visible payload.
    pub snapshot_content: Value,
    /// The tier the winning row came from.
    pub tier: Tier,
    /// The ancestor the value was inherited from, for tiers 4–6.
    pub inherited_from_version_id: Option<VersionId>,
    /// Lineage of the winning row, absent for untracked rows.
    pub change_id: Option<ChangeId>,
    /// The commit of the winning row, absent outside the cache tiers.
    pub commit_id: Option<CommitId>,
    /// Logical creation time of the winning row.
    pub created_at: Timestamp,
}

/// The outcome of a [`Lix::resolve`] lookup.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// A visible value.
    Value(ResolvedState),
    /// The entity was explicitly deleted or shadowed.
    Tombstone {
        /// The version whose row produced the tombstone.
        source_version_id: VersionId,
        /// The tier the tombstone row came from.
        tier: Tier,
    },
    /// No tier holds a row for the key.
    Absent,
}

impl Resolution {
    /// The visible payload, if any.
    pub fn value(&self) -> Option<&Value> {
        match self {
            Resolution::Value(state) => Some(&state.snapshot_content),
            _ => None,
        }
    }

    /// Whether the entity is not visible (tombstoned or absent).
    pub fn is_not_visible(&self) -> bool {
        !matches!(self, Resolution::Value(_))
    }

    /// Whether the lookup hit a tombstone.
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Resolution::Tombstone { .. })
    }

    /// Whether no row matched at all.
    pub fn is_absent(&self) -> bool {
        matches!(self, Resolution::Absent)
    }
}

impl Lix {
    /// Resolve the visible state of `key` in `version_id`.
    ///
    /// Consults the six tiers in priority order and returns the first
    /// match; a matching row without snapshot content yields
    /// [`Resolution::Tombstone`]. Returns an error if the version does not
    /// exist.
    pub fn resolve(
        &self,
        key: &StateKey,
        version_id: &VersionId,
    ) -> Result<Resolution, VersionError> {
        self.versions.get(version_id)?;

        if let Some(resolution) = self.resolve_own(key, version_id, version_id) {
            return Ok(resolution);
        }

        // Walk the inheritance chain, nearest ancestor first; within each
        // ancestor the committed cache outranks untracked state, which
        // outranks its pending transaction entries.
        for ancestor in self.versions.ancestors(version_id) {
            let ancestor = ancestor?;
            if let Some(resolution) = self.resolve_inherited(key, version_id, &ancestor.id) {
                return Ok(resolution);
            }
        }
        Ok(Resolution::Absent)
    }

    /// Resolve `key` against the active version.
    pub fn resolve_active(&self, key: &StateKey) -> Resolution {
        self.resolve(key, &self.active_version)
            .expect("active version exists")
    }

    /// Tiers 1–3: the queried version's own rows.
    fn resolve_own(
        &self,
        key: &StateKey,
        queried: &VersionId,
        version_id: &VersionId,
    ) -> Option<Resolution> {
        if let Some(pending) = self.transaction.pending_for(version_id, key) {
            return Some(self.from_snapshot(
                key,
                queried,
                version_id,
                Tier::Pending,
                pending.snapshot_content.clone(),
                Some(pending.change_id),
                None,
                pending.staged_at,
            ));
        }
        if let Some(row) = self.untracked.get(version_id, key) {
            let snapshot = (!row.is_tombstone()).then(|| row.snapshot_content.clone()).flatten();
            return Some(self.from_snapshot(
                key,
                queried,
                version_id,
                Tier::Untracked,
                snapshot,
                None,
                None,
                row.created_at,
            ));
        }
        if let Some(row) = self.cache.get(version_id, key) {
            let snapshot = (!row.is_tombstone)
                .then(|| row.snapshot_content.clone())
                .flatten();
            return Some(self.from_snapshot(
                key,
                queried,
                version_id,
                Tier::Cache,
                snapshot,
                Some(row.change_id),
                Some(row.commit_id),
                row.created_at,
            ));
        }
        None
    }

    /// Tiers 4–6: one ancestor's rows, remapped to the queried version.
    fn resolve_inherited(
        &self,
        key: &StateKey,
        queried: &VersionId,
        ancestor: &VersionId,
    ) -> Option<Resolution> {
        if let Some(row) = self.cache.get(ancestor, key) {
            let snapshot = (!row.is_tombstone)
                .then(|| row.snapshot_content.clone())
                .flatten();
            return Some(self.from_snapshot(
                key,
                queried,
                ancestor,
                Tier::InheritedCache,
                snapshot,
                Some(row.change_id),
                Some(row.commit_id),
                row.created_at,
            ));
        }
        if let Some(row) = self.untracked.get(ancestor, key) {
            let snapshot = (!row.is_tombstone()).then(|| row.snapshot_content.clone()).flatten();
            return Some(self.from_snapshot(
                key,
                queried,
                ancestor,
                Tier::InheritedUntracked,
                snapshot,
                None,
                None,
                row.created_at,
            ));
        }
        if let Some(pending) = self.transaction.pending_for(ancestor, key) {
            return Some(self.from_snapshot(
                key,
                queried,
                ancestor,
                Tier::InheritedPending,
                pending.snapshot_content.clone(),
                Some(pending.change_id),
                None,
                pending.staged_at,
            ));
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn from_snapshot(
        &self,
        key: &StateKey,
        queried: &VersionId,
        source: &VersionId,
        tier: Tier,
        snapshot: Option<Value>,
        change_id: Option<ChangeId>,
        commit_id: Option<CommitId>,
        created_at: Timestamp,
    ) -> Resolution {
        match snapshot {
            Some(snapshot_content) => Resolution::Value(ResolvedState {
                key: key.clone(),
                version_id: queried.clone(),
                snapshot_content,
                tier,
                inherited_from_version_id: (source != queried).then(|| source.clone()),
                change_id,
                commit_id,
                created_at,
            }),
            None => Resolution::Tombstone {
                source_version_id: source.clone(),
                tier,
            },
        }
    }

    /// Whether `key` would be visible in `version_id` through committed or
    /// untracked state of its ancestors.
    ///
    /// Used by the commit engine to decide between a physical deletion and
    /// a tombstone row: a deletion of an entity that is still visible
    /// through inheritance must shadow, not remove.
    pub(crate) fn inherited_value_visible(&self, version_id: &VersionId, key: &StateKey) -> bool {
        for ancestor in self.versions.ancestors(version_id) {
            let Ok(ancestor) = ancestor else { return false };
            if let Some(row) = self.cache.get(&ancestor.id, key) {
                return !row.is_tombstone;
            }
            if let Some(row) = self.untracked.get(&ancestor.id, key) {
                return !row.is_tombstone();
            }
        }
        false
    }
}
