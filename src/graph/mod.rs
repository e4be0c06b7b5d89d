// ============================================================================
// Entity Graph
// ============================================================================
//
// Entities and collections live in one arena and refer to each other by id.
// Every relation edit goes through the mapper so declared reverse relations
// stay mirrored. Ownership is explicit: nothing is reclaimed until it is
// released or dropped by `retain_reachable`.
//
// ============================================================================

pub mod clone;
pub mod collection;
pub mod dump;
pub mod mapper;
pub mod merge;
pub mod path;
pub mod process;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::rc::{Rc, Weak};

use crate::core::{CollectionId, EngineError, EntityId, Result, Target, TypeId, Value};
use crate::schema::{EntityType, KeyKind, TypeRegistry};

pub use mapper::Holder;
pub use path::EntityProxy;

use mapper::Mapper;

/// Stored value of a relation key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Slot {
    Null,
    Entity(EntityId),
    Collection(CollectionId),
}

/// A value read from the graph.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Value(Value),
    Entity(EntityId),
    Collection(CollectionId),
}

impl Node {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<EntityId> {
        match self {
            Self::Entity(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<CollectionId> {
        match self {
            Self::Collection(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Value(Value::Null))
    }
}

impl From<Slot> for Node {
    fn from(slot: Slot) -> Self {
        match slot {
            Slot::Null => Node::Value(Value::Null),
            Slot::Entity(id) => Node::Entity(id),
            Slot::Collection(id) => Node::Collection(id),
        }
    }
}

/// A value written into the graph.
///
/// `Entities` on an x-to-many relation adds every entity to the relation's
/// collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Assign {
    Value(Value),
    Entity(EntityId),
    Collection(CollectionId),
    Entities(Vec<EntityId>),
}

impl From<Node> for Assign {
    fn from(node: Node) -> Self {
        match node {
            Node::Value(value) => Assign::Value(value),
            Node::Entity(id) => Assign::Entity(id),
            Node::Collection(id) => Assign::Collection(id),
        }
    }
}

impl From<EntityId> for Assign {
    fn from(id: EntityId) -> Self {
        Assign::Entity(id)
    }
}

impl From<CollectionId> for Assign {
    fn from(id: CollectionId) -> Self {
        Assign::Collection(id)
    }
}

impl From<Vec<EntityId>> for Assign {
    fn from(ids: Vec<EntityId>) -> Self {
        Assign::Entities(ids)
    }
}

macro_rules! assign_from_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Assign {
                fn from(value: $ty) -> Self {
                    Assign::Value(Value::from(value))
                }
            }
        )*
    };
}

assign_from_value!(Value, i64, i32, f64, bool, &str, String, Vec<u8>, Decimal, NaiveDate, NaiveTime, NaiveDateTime);

#[derive(Debug, Clone)]
pub(crate) struct EntityData {
    pub(crate) type_id: TypeId,
    pub(crate) fields: BTreeMap<String, Value>,
    pub(crate) relations: BTreeMap<String, Slot>,
    pub(crate) update_only: Option<bool>,
    pub(crate) get_only: Option<bool>,
}

impl EntityData {
    fn new(type_id: TypeId) -> Self {
        Self {
            type_id,
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
            update_only: None,
            get_only: None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct CollectionData {
    pub(crate) type_id: TypeId,
    pub(crate) members: Vec<EntityId>,
    pub(crate) defaults: BTreeMap<String, Node>,
    pub(crate) owner: Option<(EntityId, String)>,
}

impl CollectionData {
    fn new(type_id: TypeId) -> Self {
        Self {
            type_id,
            members: Vec::new(),
            defaults: BTreeMap::new(),
            owner: None,
        }
    }
}

/// Arena of entities and collections with mirrored relations.
#[derive(Debug)]
pub struct Graph {
    registry: TypeRegistry,
    pub(crate) entities: HashMap<EntityId, EntityData>,
    pub(crate) collections: HashMap<CollectionId, CollectionData>,
    pub(crate) mapper: Mapper,
    next_id: u64,
    pub(crate) proxies: RefCell<HashMap<EntityId, Weak<EntityProxy>>>,
}

impl Graph {
    pub fn new(registry: &TypeRegistry) -> Self {
        Self {
            registry: registry.clone(),
            entities: HashMap::new(),
            collections: HashMap::new(),
            mapper: Mapper::default(),
            next_id: 1,
            proxies: RefCell::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    // ========================================================================
    // Creation
    // ========================================================================

    pub fn create(&mut self, type_id: TypeId) -> Result<EntityId> {
        self.registry.get(type_id)?;
        let id = EntityId(self.allocate_id());
        self.entities.insert(id, EntityData::new(type_id));
        Ok(id)
    }

    /// Creates an entity and assigns `values` in order, keys being paths.
    pub fn create_with<I, K, V>(&mut self, type_id: TypeId, values: I) -> Result<EntityId>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Assign>,
    {
        let id = self.create(type_id)?;
        for (key, value) in values {
            self.set(id, key.as_ref(), value)?;
        }
        Ok(id)
    }

    pub fn create_collection(&mut self, type_id: TypeId) -> Result<CollectionId> {
        self.registry.get(type_id)?;
        Ok(self.alloc_collection(type_id))
    }

    pub(crate) fn alloc_collection(&mut self, type_id: TypeId) -> CollectionId {
        let id = CollectionId(self.allocate_id());
        self.collections.insert(id, CollectionData::new(type_id));
        id
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub(crate) fn entity(&self, id: EntityId) -> Result<&EntityData> {
        self.entities.get(&id).ok_or(EngineError::EntityNotFound(id))
    }

    pub(crate) fn entity_mut(&mut self, id: EntityId) -> Result<&mut EntityData> {
        self.entities.get_mut(&id).ok_or(EngineError::EntityNotFound(id))
    }

    pub(crate) fn collection(&self, id: CollectionId) -> Result<&CollectionData> {
        self.collections.get(&id).ok_or(EngineError::CollectionNotFound(id))
    }

    pub(crate) fn collection_mut(&mut self, id: CollectionId) -> Result<&mut CollectionData> {
        self.collections
            .get_mut(&id)
            .ok_or(EngineError::CollectionNotFound(id))
    }

    pub fn exists(&self, target: impl Into<Target>) -> bool {
        match target.into() {
            Target::Entity(id) => self.entities.contains_key(&id),
            Target::Collection(id) => self.collections.contains_key(&id),
        }
    }

    pub fn type_of(&self, target: impl Into<Target>) -> Result<TypeId> {
        match target.into() {
            Target::Entity(id) => Ok(self.entity(id)?.type_id),
            Target::Collection(id) => Ok(self.collection(id)?.type_id),
        }
    }

    pub(crate) fn entity_type(&self, id: EntityId) -> Result<Rc<EntityType>> {
        self.registry.get(self.entity(id)?.type_id)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    /// Keys currently present on an entity, fields first.
    pub fn keys(&self, id: EntityId) -> Result<Vec<String>> {
        let data = self.entity(id)?;
        Ok(data
            .fields
            .keys()
            .chain(data.relations.keys())
            .cloned()
            .collect())
    }

    pub fn has_key(&self, id: EntityId, key: &str) -> Result<bool> {
        let data = self.entity(id)?;
        Ok(data.fields.contains_key(key) || data.relations.contains_key(key))
    }

    /// Reads one key without autovivifying.
    pub fn peek(&self, id: EntityId, key: &str) -> Result<Option<Node>> {
        let data = self.entity(id)?;
        if let Some(value) = data.fields.get(key) {
            return Ok(Some(Node::Value(value.clone())));
        }
        Ok(data.relations.get(key).map(|slot| Node::from(*slot)))
    }

    pub(crate) fn slot(&self, id: EntityId, relation: &str) -> Option<Slot> {
        self.entities
            .get(&id)
            .and_then(|data| data.relations.get(relation).copied())
    }

    /// Every entity or collection holding a reference to `id`.
    pub fn referrers(&self, id: EntityId) -> Vec<Holder> {
        self.mapper.entity_holders(id)
    }

    // ========================================================================
    // Single key edits
    // ========================================================================

    /// Assigns one key of an entity, mirroring relations.
    pub(crate) fn assign_key(&mut self, id: EntityId, key: &str, value: Assign) -> Result<()> {
        let ty = self.entity_type(id)?;
        match ty.check_key(key)? {
            KeyKind::Field(_) => match value {
                Assign::Value(value) => {
                    self.entity_mut(id)?.fields.insert(key.to_string(), value);
                    Ok(())
                }
                other => Err(EngineError::mismatch("scalar value", describe(&other))),
            },
            KeyKind::Relation(_) => self.assign_relation(id, key, value),
        }
    }

    /// Removes one key of an entity, clearing mirrored references.
    pub(crate) fn remove_key(&mut self, id: EntityId, key: &str) -> Result<bool> {
        if self.entity_mut(id)?.fields.remove(key).is_some() {
            return Ok(true);
        }
        if self.slot(id, key).is_some() {
            self.clear_relation(id, key)?;
            return Ok(true);
        }
        Ok(false)
    }

    // ========================================================================
    // Modes
    // ========================================================================

    pub fn set_update_only(&mut self, id: EntityId, value: Option<bool>) -> Result<()> {
        self.entity_mut(id)?.update_only = value;
        Ok(())
    }

    pub fn set_get_only(&mut self, id: EntityId, value: Option<bool>) -> Result<()> {
        self.entity_mut(id)?.get_only = value;
        Ok(())
    }

    /// Effective update-only mode: the entity override or the type config.
    pub fn is_update_only(&self, id: EntityId) -> Result<bool> {
        let data = self.entity(id)?;
        match data.update_only {
            Some(value) => Ok(value),
            None => Ok(self.registry.get(data.type_id)?.config.update_only),
        }
    }

    pub fn is_get_only(&self, id: EntityId) -> Result<bool> {
        let data = self.entity(id)?;
        match data.get_only {
            Some(value) => Ok(value),
            None => Ok(self.registry.get(data.type_id)?.config.get_only),
        }
    }

    // ========================================================================
    // Deletion and reclamation
    // ========================================================================

    /// Empties an entity or a collection and unhooks it from the graph.
    /// Related entities and collections survive.
    pub fn delete(&mut self, target: impl Into<Target>) -> Result<()> {
        match target.into() {
            Target::Entity(id) => self.delete_entity(id),
            Target::Collection(id) => self.delete_collection(id),
        }
    }

    /// Deletes an entity and frees its arena slot.
    pub fn release_entity(&mut self, id: EntityId) -> Result<()> {
        self.delete_entity(id)?;
        self.entities.remove(&id);
        self.mapper.forget_entity(id);
        self.proxies.borrow_mut().remove(&id);
        Ok(())
    }

    /// Deletes a collection and frees its arena slot.
    pub fn release_collection(&mut self, id: CollectionId) -> Result<()> {
        self.delete_collection(id)?;
        self.collections.remove(&id);
        self.mapper.forget_collection(id);
        Ok(())
    }

    /// Frees every entity and collection not reachable from `roots`.
    /// Returns the number of freed slots.
    pub fn retain_reachable(&mut self, roots: &[Target]) -> Result<usize> {
        let (entities, collections) = self.reachable(roots, true)?;
        let dead_entities: Vec<EntityId> = self
            .entities
            .keys()
            .filter(|id| !entities.contains(id))
            .copied()
            .collect();
        let dead_collections: Vec<CollectionId> = self
            .collections
            .keys()
            .filter(|id| !collections.contains(id))
            .copied()
            .collect();
        let freed = dead_entities.len() + dead_collections.len();
        for id in dead_entities {
            self.release_entity(id)?;
        }
        for id in dead_collections {
            self.release_collection(id)?;
        }
        Ok(freed)
    }

    /// Entities and collections reachable from `roots` through relations and
    /// members, and through collection defaults when `with_defaults` is set.
    pub(crate) fn reachable(
        &self,
        roots: &[Target],
        with_defaults: bool,
    ) -> Result<(HashSet<EntityId>, HashSet<CollectionId>)> {
        let mut entities = HashSet::new();
        let mut collections = HashSet::new();
        let mut pending: Vec<Target> = roots.to_vec();
        while let Some(target) = pending.pop() {
            match target {
                Target::Entity(id) => {
                    if !entities.insert(id) {
                        continue;
                    }
                    for slot in self.entity(id)?.relations.values() {
                        match slot {
                            Slot::Entity(other) => pending.push(Target::Entity(*other)),
                            Slot::Collection(other) => pending.push(Target::Collection(*other)),
                            Slot::Null => {}
                        }
                    }
                }
                Target::Collection(id) => {
                    if !collections.insert(id) {
                        continue;
                    }
                    let data = self.collection(id)?;
                    pending.extend(data.members.iter().map(|m| Target::Entity(*m)));
                    if with_defaults {
                        for node in data.defaults.values() {
                            match node {
                                Node::Entity(other) => pending.push(Target::Entity(*other)),
                                Node::Collection(other) => pending.push(Target::Collection(*other)),
                                Node::Value(_) => {}
                            }
                        }
                    }
                }
            }
        }
        Ok((entities, collections))
    }
}

pub(crate) fn describe(value: &Assign) -> String {
    match value {
        Assign::Value(value) => value.type_name().to_string(),
        Assign::Entity(id) => id.to_string(),
        Assign::Collection(id) => id.to_string(),
        Assign::Entities(ids) => format!("{} entities", ids.len()),
    }
}
