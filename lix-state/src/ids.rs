//! Identifier newtypes for the rows of the store.
//!
//! Every persisted row type in this crate is keyed by one of the ids defined
//! here. [`ChangeId`] and [`CommitId`] are monotonic per-store counters;
//! [`ChangeSetId`] is content-addressed over the element change ids, so two
//! change sets with identical elements share an id (they are semantically
//! identical). [`VersionId`] and the key components are cheap interned
//! strings.

use derive_more::{Display, From};
use smol_str::SmolStr;

/// Identifier of a [`Change`](crate::Change) in the change log.
#[derive(
    Copy, Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
#[display("change-{_0}")]
#[serde(transparent)]
pub struct ChangeId(pub(crate) u64);

impl ChangeId {
    /// The raw counter value of this id.
    pub fn index(self) -> u64 {
        self.0
    }
}

/// Identifier of a [`Commit`](crate::Commit) in the commit graph.
#[derive(
    Copy, Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
#[display("commit-{_0}")]
#[serde(transparent)]
pub struct CommitId(pub(crate) u64);

impl CommitId {
    /// The raw counter value of this id.
    pub fn index(self) -> u64 {
        self.0
    }
}

/// Content-addressed identifier of a [`ChangeSet`](crate::ChangeSet).
///
/// Derived by hashing the sorted element change ids, so the id is a pure
/// function of the set's contents.
#[derive(
    Clone, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct ChangeSetId(SmolStr);

impl ChangeSetId {
    /// Compute the id for a set with the given element change ids.
    ///
    /// The ids are sorted and deduplicated before hashing, so element order
    /// does not affect the result.
    pub fn from_change_ids(ids: impl IntoIterator<Item = ChangeId>) -> Self {
        let mut raw: Vec<u64> = ids.into_iter().map(ChangeId::index).collect();
        raw.sort_unstable();
        raw.dedup();
        let bytes = serde_json::to_vec(&raw).expect("u64 slice is serializable");
        const SEED: u64 = 0;
        let digest = wyhash::wyhash(&bytes, SEED);
        Self(SmolStr::new(format!("cs-{digest:016x}")))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

/// Identifier of a [`Version`](crate::Version) in the version registry.
#[derive(
    Clone, Debug, Display, From, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct VersionId(SmolStr);

impl VersionId {
    /// Create a version id from a string.
    pub fn new(id: impl Into<SmolStr>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl From<&str> for VersionId {
    fn from(id: &str) -> Self {
        Self(SmolStr::new(id))
    }
}

macro_rules! key_component {
    ($(#[$docs:meta])* $name:ident) => {
        $(#[$docs])*
        #[derive(
            Clone, Debug, Display, From, PartialEq, Eq, PartialOrd, Ord, Hash,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(SmolStr);

        impl $name {
            /// Create a new id from a string.
            pub fn new(id: impl Into<SmolStr>) -> Self {
                Self(id.into())
            }

            /// The id as a string slice.
            pub fn as_str(&self) -> &str {
                self.0.as_str()
            }

            /// Whether the id is the empty string.
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(SmolStr::new(id))
            }
        }
    };
}

key_component! {
    /// Identifier of a logical entity (a record tracked by the store).
    EntityId
}

key_component! {
    /// The logical record type of an entity.
    SchemaKey
}

key_component! {
    /// The logical container (file) an entity belongs to.
    FileId
}

/// The logical key under which entity state is resolved: one value is
/// visible per `(entity, schema, file)` triple and version.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct StateKey {
    /// The entity identifier.
    pub entity_id: EntityId,
    /// The logical record type.
    pub schema_key: SchemaKey,
    /// The logical container.
    pub file_id: FileId,
}

impl StateKey {
    /// Create a new state key.
    pub fn new(
        entity_id: impl Into<EntityId>,
        schema_key: impl Into<SchemaKey>,
        file_id: impl Into<FileId>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: file_id.into(),
        }
    }
}

impl std::fmt::Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.file_id, self.schema_key, self.entity_id)
    }
}

/// Logical creation timestamp of a row.
///
/// A per-store monotonic counter rather than wall-clock time: ranking
/// tie-breaks in the resolver compare these and must be deterministic.
#[derive(
    Copy, Clone, Debug, Default, Display, PartialEq, Eq, PartialOrd, Ord, Hash,
    serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub(crate) u64);

impl Timestamp {
    /// The raw tick value.
    pub fn tick(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_set_id_is_order_independent() {
        let a = ChangeSetId::from_change_ids([ChangeId(1), ChangeId(2), ChangeId(3)]);
        let b = ChangeSetId::from_change_ids([ChangeId(3), ChangeId(1), ChangeId(2)]);
        assert_eq!(a, b);
    }

    #[test]
    fn change_set_id_distinguishes_contents() {
        let a = ChangeSetId::from_change_ids([ChangeId(1), ChangeId(2)]);
        let b = ChangeSetId::from_change_ids([ChangeId(1), ChangeId(4)]);
        assert_ne!(a, b);
    }

    #[test]
    fn empty_change_sets_share_an_id() {
        let a = ChangeSetId::from_change_ids([]);
        let b = ChangeSetId::from_change_ids([]);
        assert_eq!(a, b);
    }
}
