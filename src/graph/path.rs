//! Path access over the graph.
//!
//! Paths join keys with `__` or `.`, e.g. `author__address__city`. Reading
//! with [`Graph::get`] autovivifies missing relations; [`Graph::select`],
//! [`Graph::contains`] and friends never modify the graph and fan out
//! across collection members.

use std::collections::HashSet;
use std::rc::{Rc, Weak};

use crate::core::{CollectionId, EngineError, EntityId, Result, Target, TypeId, Value};
use crate::schema::KeyKind;

use super::{Assign, Graph, Node, Slot};

pub(crate) fn split_path(path: &str) -> Vec<&str> {
    path.split("__")
        .flat_map(|part| part.split('.'))
        .filter(|part| !part.is_empty())
        .collect()
}

fn node_of(target: Target) -> Node {
    match target {
        Target::Entity(id) => Node::Entity(id),
        Target::Collection(id) => Node::Collection(id),
    }
}

impl Graph {
    /// Checks that every segment of `path` exists, starting at `type_id`.
    pub(crate) fn check_path(&self, type_id: TypeId, path: &str) -> Result<()> {
        self.walk_types(type_id, path).map(|_| ())
    }

    /// Type an x-to-many (or x-to-one) path ends at.
    pub(crate) fn path_target_type(&self, type_id: TypeId, path: &str) -> Result<TypeId> {
        match self.walk_types(type_id, path)? {
            (owner, Some(relation)) => Ok(self.registry().target_of(owner, &relation)?.id()),
            (owner, None) => {
                let ty = self.registry().get(owner)?;
                Err(EngineError::mismatch("relation", format!("field of {}", ty.name())))
            }
        }
    }

    /// Walks the type graph along `path`. Returns the type holding the last
    /// key and, when that key is a relation, its name.
    fn walk_types(&self, type_id: TypeId, path: &str) -> Result<(TypeId, Option<String>)> {
        let segments = split_path(path);
        let mut current = self.registry().get(type_id)?;
        if segments.is_empty() {
            return Err(EngineError::unknown_key(current.name(), path));
        }
        for (index, segment) in segments.iter().enumerate() {
            let last = index + 1 == segments.len();
            match current.check_key(segment)? {
                KeyKind::Field(_) if last => return Ok((current.id(), None)),
                KeyKind::Field(_) => {
                    return Err(EngineError::unknown_key(current.name(), &segments[index..].join("__")));
                }
                KeyKind::Relation(def) if last => return Ok((current.id(), Some(def.name.clone()))),
                KeyKind::Relation(def) => {
                    let next = self.registry().by_name(&def.target)?;
                    current = next;
                }
            }
        }
        Ok((current.id(), None))
    }

    fn autovivify(&mut self, owner: EntityId, relation: &str, many: bool) -> Result<Slot> {
        if many {
            return Ok(Slot::Collection(self.ensure_collection(owner, relation)?));
        }
        let target = self.registry().target_of(self.entity(owner)?.type_id, relation)?;
        let created = self.create(target.id())?;
        self.link(owner, relation, created)?;
        Ok(Slot::Entity(created))
    }

    /// Follows one relation step, autovivifying it when unset.
    fn step(&mut self, owner: EntityId, relation: &str, many: bool) -> Result<Slot> {
        match self.slot(owner, relation) {
            Some(Slot::Null) | None => self.autovivify(owner, relation, many),
            Some(slot) => Ok(slot),
        }
    }

    /// Reads `path`, creating missing related entities and collections on
    /// the way. A path continuing past a collection addresses the
    /// collection's defaults. Unknown keys read as `None`, relations set to
    /// null read as null.
    pub fn get(&mut self, target: impl Into<Target>, path: &str) -> Result<Option<Node>> {
        let segments = split_path(path);
        let mut current = target.into();
        for (index, segment) in segments.iter().enumerate() {
            let last = index + 1 == segments.len();
            let entity = match current {
                Target::Collection(collection) => {
                    let key = segments[index..].join("__");
                    return Ok(self.collection(collection)?.defaults.get(&key).cloned());
                }
                Target::Entity(entity) => entity,
            };
            let ty = self.entity_type(entity)?;
            let many = match ty.key_kind(segment) {
                None => return Ok(None),
                Some(KeyKind::Field(_)) if last => {
                    return Ok(self.entity(entity)?.fields.get(*segment).cloned().map(Node::Value));
                }
                Some(KeyKind::Field(_)) => return Ok(None),
                Some(KeyKind::Relation(def)) => def.kind.is_x_to_many(),
            };
            // A relation set to null reads as null and is not replaced.
            if self.slot(entity, segment) == Some(Slot::Null) {
                return Ok(Some(Node::Value(Value::Null)));
            }
            current = match self.step(entity, segment, many)? {
                Slot::Entity(next) => Target::Entity(next),
                Slot::Collection(next) => Target::Collection(next),
                Slot::Null => return Ok(Some(Node::Value(Value::Null))),
            };
            if last {
                return Ok(Some(node_of(current)));
            }
        }
        Ok(None)
    }

    /// Writes `path`, creating missing related entities on the way. A path
    /// continuing past a collection sets one of its defaults.
    pub fn set(&mut self, target: impl Into<Target>, path: &str, value: impl Into<Assign>) -> Result<()> {
        let segments = split_path(path);
        let Some((last, parents)) = segments.split_last() else {
            let type_id = self.type_of(target)?;
            let ty = self.registry().get(type_id)?;
            return Err(EngineError::unknown_key(ty.name(), path));
        };
        let mut current = target.into();
        for (index, segment) in parents.iter().enumerate() {
            let entity = match current {
                Target::Collection(collection) => {
                    return self.set_default(collection, &segments[index..].join("__"), value);
                }
                Target::Entity(entity) => entity,
            };
            let ty = self.entity_type(entity)?;
            let many = match ty.check_key(segment)? {
                KeyKind::Field(_) => {
                    return Err(EngineError::unknown_key(ty.name(), &segments[index..].join("__")));
                }
                KeyKind::Relation(def) => def.kind.is_x_to_many(),
            };
            current = match self.step(entity, segment, many)? {
                Slot::Entity(next) => Target::Entity(next),
                Slot::Collection(next) => Target::Collection(next),
                Slot::Null => return Err(EngineError::mismatch("relation", "null")),
            };
        }
        match current {
            Target::Collection(collection) => self.set_default(collection, last, value),
            Target::Entity(entity) => self.assign_key(entity, last, value.into()),
        }
    }

    /// Values found at `path`, fanning out across collection members in
    /// member order. A missing path yields an empty list.
    pub fn select(&self, target: impl Into<Target>, path: &str) -> Vec<Node> {
        let segments = split_path(path);
        let mut found = Vec::new();
        if !segments.is_empty() {
            self.select_into(target.into(), &segments, &mut found);
        }
        found
    }

    fn select_into(&self, target: Target, segments: &[&str], found: &mut Vec<Node>) {
        let entity = match target {
            Target::Collection(collection) => {
                if let Some(data) = self.collections.get(&collection) {
                    for member in &data.members {
                        self.select_into(Target::Entity(*member), segments, found);
                    }
                }
                return;
            }
            Target::Entity(entity) => entity,
        };
        let Some(data) = self.entities.get(&entity) else {
            return;
        };
        let (head, rest) = (segments[0], &segments[1..]);
        if let Some(value) = data.fields.get(head) {
            if rest.is_empty() {
                found.push(Node::Value(value.clone()));
            }
            return;
        }
        match data.relations.get(head) {
            Some(slot) if rest.is_empty() => found.push(Node::from(*slot)),
            Some(Slot::Entity(next)) => self.select_into(Target::Entity(*next), rest, found),
            Some(Slot::Collection(next)) => self.select_into(Target::Collection(*next), rest, found),
            _ => {}
        }
    }

    /// Whether `path` is present anywhere below `target`. On a collection
    /// the defaults count as well as the members.
    pub fn contains(&self, target: impl Into<Target>, path: &str) -> bool {
        let segments = split_path(path);
        !segments.is_empty() && self.contains_at(target.into(), &segments)
    }

    fn contains_at(&self, target: Target, segments: &[&str]) -> bool {
        match target {
            Target::Collection(collection) => match self.collections.get(&collection) {
                Some(data) => {
                    data.defaults.contains_key(&segments.join("__"))
                        || data
                            .members
                            .iter()
                            .any(|member| self.contains_at(Target::Entity(*member), segments))
                }
                None => false,
            },
            Target::Entity(entity) => {
                let Some(data) = self.entities.get(&entity) else {
                    return false;
                };
                let (head, rest) = (segments[0], &segments[1..]);
                if rest.is_empty() {
                    return data.fields.contains_key(head) || data.relations.contains_key(head);
                }
                match data.relations.get(head) {
                    Some(Slot::Entity(next)) => self.contains_at(Target::Entity(*next), rest),
                    Some(Slot::Collection(next)) => self.contains_at(Target::Collection(*next), rest),
                    _ => false,
                }
            }
        }
    }

    /// Number of values at `path`; a collection counts its members.
    pub fn len_path(&self, target: impl Into<Target>, path: &str) -> usize {
        self.select(target, path)
            .iter()
            .map(|node| match node {
                Node::Collection(collection) => self
                    .collections
                    .get(collection)
                    .map_or(0, |data| data.members.len()),
                Node::Value(Value::Null) => 0,
                _ => 1,
            })
            .sum()
    }

    /// Removes the last key of `path` from every entity the rest of the path
    /// reaches. Returns how many keys were removed.
    pub fn delete_path(&mut self, target: impl Into<Target>, path: &str) -> Result<usize> {
        let segments = split_path(path);
        let Some((last, parents)) = segments.split_last() else {
            return Ok(0);
        };
        let holders: Vec<Node> = if parents.is_empty() {
            vec![node_of(target.into())]
        } else {
            self.select(target, &parents.join("__"))
        };

        let mut seen = HashSet::new();
        let mut entities = Vec::new();
        for holder in holders {
            match holder {
                Node::Entity(id) => entities.push(id),
                Node::Collection(collection) => entities.extend(self.members(collection)?.iter().copied()),
                Node::Value(_) => {}
            }
        }
        entities.retain(|id| seen.insert(*id));

        let mut removed = 0;
        for id in entities {
            if self.remove_key(id, last)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// The proxy of an entity. While a strong handle is alive, every call
    /// returns the same instance.
    pub fn proxy(&self, id: EntityId) -> Result<Rc<EntityProxy>> {
        self.entity(id)?;
        let mut cache = self.proxies.borrow_mut();
        if let Some(proxy) = cache.get(&id).and_then(Weak::upgrade) {
            return Ok(proxy);
        }
        cache.retain(|_, proxy| proxy.strong_count() > 0);
        let proxy = Rc::new(EntityProxy { id });
        cache.insert(id, Rc::downgrade(&proxy));
        Ok(proxy)
    }
}

/// Handle giving path access to one entity.
#[derive(Debug, PartialEq, Eq)]
pub struct EntityProxy {
    id: EntityId,
}

impl EntityProxy {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn get(&self, graph: &mut Graph, path: &str) -> Result<Option<Node>> {
        graph.get(self.id, path)
    }

    pub fn set(&self, graph: &mut Graph, path: &str, value: impl Into<Assign>) -> Result<()> {
        graph.set(self.id, path, value)
    }

    pub fn select(&self, graph: &Graph, path: &str) -> Vec<Node> {
        graph.select(self.id, path)
    }

    pub fn contains(&self, graph: &Graph, path: &str) -> bool {
        graph.contains(self.id, path)
    }

    pub fn len(&self, graph: &Graph, path: &str) -> usize {
        graph.len_path(self.id, path)
    }

    pub fn delete(&self, graph: &mut Graph, path: &str) -> Result<usize> {
        graph.delete_path(self.id, path)
    }

    /// The proxy of the entity at `path`, autovivifying it.
    pub fn related(&self, graph: &mut Graph, path: &str) -> Result<Option<Rc<EntityProxy>>> {
        match graph.get(self.id, path)? {
            Some(Node::Entity(id)) => graph.proxy(id).map(Some),
            _ => Ok(None),
        }
    }

    /// Collection at `path`, autovivifying it.
    pub fn collection(&self, graph: &mut Graph, path: &str) -> Result<Option<CollectionId>> {
        Ok(graph.get(self.id, path)?.and_then(|node| node.as_collection()))
    }
}
