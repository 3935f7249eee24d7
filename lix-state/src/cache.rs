//! Materialized cache and untracked store tables.
//!
//! The cache holds the resolved, committed snapshot of every
//! `(entity, schema, file, version)`, refreshed by the commit engine. The
//! untracked table holds current values for entities excluded from history;
//! its rows carry no change lineage but are still versioned, inheritable
//! and tombstoned the same way.

use indexmap::IndexMap;
use serde_json::Value;

use crate::ids::{ChangeId, CommitId, EntityId, FileId, SchemaKey, StateKey, Timestamp, VersionId};

/// A row of the materialized cache: the latest committed state of one
/// entity in one version.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct CacheRow {
    /// The entity.
    pub entity_id: EntityId,
    /// The record type.
    pub schema_key: SchemaKey,
    /// The container.
    pub file_id: FileId,
    /// The version this row belongs to.
    pub version_id: VersionId,
    /// The committed payload; `None` for a tombstone.
    pub snapshot_content: Option<Value>,
    /// The change that produced this state.
    pub change_id: ChangeId,
    /// The commit that produced this state.
    pub commit_id: CommitId,
    /// Set when the row was materialized from an ancestor version.
    pub inherited_from_version_id: Option<VersionId>,
    /// Whether the row shadows an inherited value without carrying one.
    pub is_tombstone: bool,
    /// Logical time the row was written.
    pub created_at: Timestamp,
}

/// A row of the untracked store: a current value outside the change log.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct UntrackedRow {
    /// The entity.
    pub entity_id: EntityId,
    /// The record type.
    pub schema_key: SchemaKey,
    /// The container.
    pub file_id: FileId,
    /// The version this row belongs to.
    pub version_id: VersionId,
    /// The current payload; `None` when the row only shadows.
    pub snapshot_content: Option<Value>,
    /// Set when the row was materialized from an ancestor version.
    pub inherited_from_version_id: Option<VersionId>,
    /// Whether the row hides an inherited value.
    pub inheritance_delete_marker: bool,
    /// Logical time the row was written.
    pub created_at: Timestamp,
}

impl UntrackedRow {
    /// Whether this row makes the entity invisible.
    pub fn is_tombstone(&self) -> bool {
        self.inheritance_delete_marker || self.snapshot_content.is_none()
    }
}

/// One row per `(version, entity, schema, file)`, upserted by the commit
/// engine.
#[derive(Clone, Debug, Default)]
pub struct CacheTable {
    rows: IndexMap<(VersionId, StateKey), CacheRow>,
}

impl CacheTable {
    /// Create an empty cache table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the row for `key` in `version_id`.
    pub fn get(&self, version_id: &VersionId, key: &StateKey) -> Option<&CacheRow> {
        self.rows.get(&(version_id.clone(), key.clone()))
    }

    /// Insert or replace the row for its `(version, key)`.
    pub fn upsert(&mut self, row: CacheRow) {
        let key = StateKey {
            entity_id: row.entity_id.clone(),
            schema_key: row.schema_key.clone(),
            file_id: row.file_id.clone(),
        };
        self.rows.insert((row.version_id.clone(), key), row);
    }

    /// Remove the row for `key` in `version_id`, if any.
    pub fn remove(&mut self, version_id: &VersionId, key: &StateKey) -> Option<CacheRow> {
        self.rows.shift_remove(&(version_id.clone(), key.clone()))
    }

    /// Iterate over all rows.
    pub fn all_rows(&self) -> impl Iterator<Item = &CacheRow> + '_ {
        self.rows.values()
    }
}

/// One row per `(version, entity, schema, file)` of untracked state.
#[derive(Clone, Debug, Default)]
pub struct UntrackedTable {
    rows: IndexMap<(VersionId, StateKey), UntrackedRow>,
}

impl UntrackedTable {
    /// Create an empty untracked table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the row for `key` in `version_id`.
    pub fn get(&self, version_id: &VersionId, key: &StateKey) -> Option<&UntrackedRow> {
        self.rows.get(&(version_id.clone(), key.clone()))
    }

    /// Insert or replace the row for its `(version, key)`.
    pub fn upsert(&mut self, row: UntrackedRow) {
        let key = StateKey {
            entity_id: row.entity_id.clone(),
            schema_key: row.schema_key.clone(),
            file_id: row.file_id.clone(),
        };
        self.rows.insert((row.version_id.clone(), key), row);
    }

    /// Remove the row for `key` in `version_id`, if any.
    pub fn remove(&mut self, version_id: &VersionId, key: &StateKey) -> Option<UntrackedRow> {
        self.rows.shift_remove(&(version_id.clone(), key.clone()))
    }

    /// Iterate over all rows.
    pub fn all_rows(&self) -> impl Iterator<Item = &UntrackedRow> + '_ {
        self.rows.values()
    }
}
