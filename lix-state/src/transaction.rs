//! The transaction buffer: pending mutations awaiting a commit.
//!
//! Staged mutations are keyed by `(version, entity, schema, file)`; staging
//! the same key twice within one uncommitted window overwrites the earlier
//! entry. Entries tagged `untracked` bypass the change log at drain time and
//! persist straight to the untracked store.

use indexmap::IndexMap;
use serde_json::Value;
use smol_str::SmolStr;
use thiserror::Error;

use crate::ids::{ChangeId, StateKey, Timestamp, VersionId};

/// An error raised when staging a malformed mutation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum StageError {
    /// A component of the mutation key is empty.
    #[error("malformed mutation key: {0} is empty")]
    MalformedKey(&'static str),
}

/// A pending mutation in the transaction buffer.
///
/// The change id is assigned at staging time; the [`Change`](crate::Change)
/// itself is materialized by the commit engine.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PendingChange {
    /// The id the materialized change will carry.
    pub change_id: ChangeId,
    /// The logical state key being mutated.
    pub key: StateKey,
    /// Identity of the producer.
    pub plugin_key: SmolStr,
    /// The new payload, or `None` to stage a deletion.
    pub snapshot_content: Option<Value>,
    /// Version of the payload schema.
    pub schema_version: SmolStr,
    /// The version the mutation targets.
    pub version_id: VersionId,
    /// Whether the mutation bypasses the change log.
    pub untracked: bool,
    /// Optional provenance tag.
    pub writer_key: Option<SmolStr>,
    /// Optional opaque metadata.
    pub metadata: Option<Value>,
    /// Logical time the entry was staged.
    pub staged_at: Timestamp,
}

impl PendingChange {
    /// Whether this entry stages a deletion.
    pub fn is_deletion(&self) -> bool {
        self.snapshot_content.is_none()
    }
}

/// Per-write-session buffer of pending mutations.
///
/// Not visible outside the owning store; consumed and cleared by the commit
/// engine.
#[derive(Clone, Debug, Default)]
pub struct TransactionBuffer {
    entries: IndexMap<(VersionId, StateKey), PendingChange>,
}

impl TransactionBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append or replace a pending entry.
    ///
    /// Later stages for the same `(version, key)` overwrite earlier ones
    /// within the same uncommitted window.
    pub fn stage(&mut self, entry: PendingChange) -> Result<(), StageError> {
        if entry.key.entity_id.is_empty() {
            return Err(StageError::MalformedKey("entity_id"));
        }
        if entry.key.schema_key.is_empty() {
            return Err(StageError::MalformedKey("schema_key"));
        }
        if entry.key.file_id.is_empty() {
            return Err(StageError::MalformedKey("file_id"));
        }
        self.entries
            .insert((entry.version_id.clone(), entry.key.clone()), entry);
        Ok(())
    }

    /// Whether the buffer holds no entries at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the pending entry for `key` in `version_id`.
    pub fn pending_for(&self, version_id: &VersionId, key: &StateKey) -> Option<&PendingChange> {
        self.entries.get(&(version_id.clone(), key.clone()))
    }

    /// Iterate over the tracked entries, grouped by version in staging
    /// order, without consuming them.
    pub fn tracked_by_version(&self) -> IndexMap<VersionId, Vec<&PendingChange>> {
        let mut grouped: IndexMap<VersionId, Vec<&PendingChange>> = IndexMap::new();
        for entry in self.entries.values().filter(|e| !e.untracked) {
            grouped
                .entry(entry.version_id.clone())
                .or_default()
                .push(entry);
        }
        grouped
    }

    /// Iterate over the untracked entries without consuming them.
    pub fn untracked_entries(&self) -> impl Iterator<Item = &PendingChange> + '_ {
        self.entries.values().filter(|e| e.untracked)
    }

    /// Remove every entry from the buffer.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate over all entries in staging order.
    pub fn all_entries(&self) -> impl Iterator<Item = &PendingChange> + '_ {
        self.entries.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(version: &str, entity: &str, change_id: u64) -> PendingChange {
        PendingChange {
            change_id: ChangeId(change_id),
            key: StateKey::new(entity, "doc", "f"),
            plugin_key: "test".into(),
            snapshot_content: Some(serde_json::json!({ "n": change_id })),
            schema_version: "1.0".into(),
            version_id: version.into(),
            untracked: false,
            writer_key: None,
            metadata: None,
            staged_at: Timestamp(change_id),
        }
    }

    #[test]
    fn later_stage_overwrites_earlier() {
        let mut buffer = TransactionBuffer::new();
        buffer.stage(entry("main", "e1", 1)).unwrap();
        buffer.stage(entry("main", "e1", 2)).unwrap();

        let grouped = buffer.tracked_by_version();
        let pending = &grouped[&VersionId::from("main")];
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].change_id, ChangeId(2));
    }

    #[test]
    fn same_key_in_different_versions_is_kept() {
        let mut buffer = TransactionBuffer::new();
        buffer.stage(entry("a", "e1", 1)).unwrap();
        buffer.stage(entry("b", "e1", 2)).unwrap();
        assert_eq!(buffer.tracked_by_version().len(), 2);
    }

    #[test]
    fn empty_key_component_is_rejected() {
        let mut buffer = TransactionBuffer::new();
        let mut bad = entry("main", "", 1);
        bad.key = StateKey::new("", "doc", "f");
        assert_eq!(
            buffer.stage(bad).unwrap_err(),
            StageError::MalformedKey("entity_id")
        );
        assert!(buffer.is_empty());
    }
}
