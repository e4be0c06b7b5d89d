use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A set of field or relation names, used for creator/getter groups and
/// unique constraints.
pub type KeySet = BTreeSet<String>;

/// Builds a [`KeySet`] from string slices.
pub fn key_set<I, S>(keys: I) -> KeySet
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    keys.into_iter().map(Into::into).collect()
}

/// Stable handle of an entity inside a [`Graph`](crate::graph::Graph) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityId(pub(crate) u64);

/// Stable handle of a collection inside a [`Graph`](crate::graph::Graph) arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(pub(crate) u64);

/// Index of an entity type in a [`TypeRegistry`](crate::schema::TypeRegistry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub(crate) usize);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection#{}", self.0)
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

/// Either end of a graph operation: a single entity or a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Entity(EntityId),
    Collection(CollectionId),
}

impl From<EntityId> for Target {
    fn from(id: EntityId) -> Self {
        Self::Entity(id)
    }
}

impl From<CollectionId> for Target {
    fn from(id: CollectionId) -> Self {
        Self::Collection(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationKind {
    /// True when this side of the relation holds a collection.
    pub fn is_x_to_many(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    /// True when this side of the relation holds a single entity.
    pub fn is_x_to_one(self) -> bool {
        !self.is_x_to_many()
    }

    /// The kind seen from the other end.
    pub fn reverse(self) -> Self {
        match self {
            Self::OneToOne => Self::OneToOne,
            Self::OneToMany => Self::ManyToOne,
            Self::ManyToOne => Self::OneToMany,
            Self::ManyToMany => Self::ManyToMany,
        }
    }
}

impl fmt::Display for RelationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::OneToOne => "one-to-one",
            Self::OneToMany => "one-to-many",
            Self::ManyToOne => "many-to-one",
            Self::ManyToMany => "many-to-many",
        };
        f.write_str(name)
    }
}

/// A record stored in a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordRef {
    pub model: String,
    pub key: i64,
}

impl RecordRef {
    pub fn new(model: impl Into<String>, key: i64) -> Self {
        Self {
            model: model.into(),
            key,
        }
    }
}

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.model, self.key)
    }
}
