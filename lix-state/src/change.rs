//! [`Change`] records, [`ChangeSet`]s and their elements.
//!
//! A [`Change`] is the atomic unit of history: one immutable record of one
//! entity mutation, including deletions (`snapshot_content: None`). Changes
//! are appended to the change log by the commit engine and never mutated or
//! deleted afterwards.
//!
//! A [`ChangeSet`] is an immutable collection of references to changes,
//! typically expressed as its *leaves*: at most one element per
//! `(entity, schema, file)` key. The elements of the change set that a
//! commit owns describe the full entity state visible at that commit.

use serde_json::Value;
use smol_str::SmolStr;

use crate::ids::{ChangeId, ChangeSetId, EntityId, FileId, SchemaKey, StateKey, Timestamp, VersionId};

/// Schema key of the meta-changes describing change-set creation.
pub const CHANGE_SET_SCHEMA: &str = "lix_change_set";
/// Schema key of the meta-changes describing commit creation.
pub const COMMIT_SCHEMA: &str = "lix_commit";
/// Schema key of the meta-changes describing commit-edge creation.
pub const COMMIT_EDGE_SCHEMA: &str = "lix_commit_edge";
/// Schema key of the meta-changes describing version pointer updates.
pub const VERSION_SCHEMA: &str = "lix_version";
/// Schema key of the per-change attribution records.
pub const CHANGE_AUTHOR_SCHEMA: &str = "lix_change_author";

/// Plugin key under which the engine's own meta-changes are recorded.
pub const OWN_PLUGIN_KEY: &str = "lix_own_change_control";
/// File id under which registry metadata lives.
pub const OWN_FILE_ID: &str = "lix";
/// Schema version of the engine's own meta-change payloads.
pub const OWN_SCHEMA_VERSION: &str = "1.0";

/// An immutable record of one entity mutation.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Change {
    /// Unique, monotonically assigned id.
    pub id: ChangeId,
    /// The entity the mutation applies to.
    pub entity_id: EntityId,
    /// The logical record type of the entity.
    pub schema_key: SchemaKey,
    /// The logical container of the entity.
    pub file_id: FileId,
    /// Identity of the producer of this change.
    pub plugin_key: SmolStr,
    /// The new payload, or `None` for a deletion/tombstone.
    ///
    /// The payload is opaque to the engine; it is tagged by `schema_key` and
    /// `schema_version` for out-of-core validation.
    pub snapshot_content: Option<Value>,
    /// Version of the payload schema.
    pub schema_version: SmolStr,
    /// Logical creation time.
    pub created_at: Timestamp,
    /// The version the mutation was made against.
    pub version_id: VersionId,
    /// Optional provenance tag.
    pub writer_key: Option<SmolStr>,
    /// Optional opaque metadata attached by the producer.
    pub metadata: Option<Value>,
}

impl Change {
    /// The logical state key of this change.
    pub fn key(&self) -> StateKey {
        StateKey {
            entity_id: self.entity_id.clone(),
            schema_key: self.schema_key.clone(),
            file_id: self.file_id.clone(),
        }
    }

    /// Whether this change records a deletion.
    pub fn is_tombstone(&self) -> bool {
        self.snapshot_content.is_none()
    }
}

/// A reference from a change set to one of its changes.
///
/// Elements carry the state key alongside the change id so that external
/// tooling can filter a change set by entity without joining the change log.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeSetElement {
    /// The owning change set.
    pub change_set_id: ChangeSetId,
    /// The referenced change.
    pub change_id: ChangeId,
    /// Entity of the referenced change.
    pub entity_id: EntityId,
    /// Record type of the referenced change.
    pub schema_key: SchemaKey,
    /// Container of the referenced change.
    pub file_id: FileId,
}

impl ChangeSetElement {
    /// The logical state key of this element.
    pub fn key(&self) -> StateKey {
        StateKey {
            entity_id: self.entity_id.clone(),
            schema_key: self.schema_key.clone(),
            file_id: self.file_id.clone(),
        }
    }
}

/// An immutable, content-addressed set of change references.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeSet {
    /// Content-addressed id of the set.
    pub id: ChangeSetId,
    /// The elements of the set.
    pub elements: Vec<ChangeSetElement>,
}

impl ChangeSet {
    /// Build a change set from the given changes.
    ///
    /// The id is content-addressed over the change ids, so building the same
    /// set twice yields the same [`ChangeSetId`].
    pub fn from_changes<'c>(changes: impl IntoIterator<Item = &'c Change>) -> Self {
        let changes: Vec<&Change> = changes.into_iter().collect();
        let id = ChangeSetId::from_change_ids(changes.iter().map(|c| c.id));
        let elements = changes
            .into_iter()
            .map(|c| ChangeSetElement {
                change_set_id: id.clone(),
                change_id: c.id,
                entity_id: c.entity_id.clone(),
                schema_key: c.schema_key.clone(),
                file_id: c.file_id.clone(),
            })
            .collect();
        Self { id, elements }
    }

    /// Build a change set from existing elements, re-binding them to the
    /// content-addressed id of the new set.
    pub fn from_elements(elements: impl IntoIterator<Item = ChangeSetElement>) -> Self {
        let mut elements: Vec<ChangeSetElement> = elements.into_iter().collect();
        let id = ChangeSetId::from_change_ids(elements.iter().map(|e| e.change_id));
        for element in &mut elements {
            element.change_set_id = id.clone();
        }
        Self { id, elements }
    }

    /// An empty change set.
    pub fn empty() -> Self {
        Self::from_elements([])
    }

    /// Whether the set has no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Whether the set contains an element for `change_id`.
    pub fn contains_change(&self, change_id: ChangeId) -> bool {
        self.elements.iter().any(|e| e.change_id == change_id)
    }
}
