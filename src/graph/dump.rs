//! Flat JSON representation of an entity graph.
//!
//! ```text
//! entity:     {"item": {"title": "Dune", "author": {...}}, "get_only": true}
//! collection: {"bulk": [{...}, {...}], "defaults": {"rank": 1}}
//! shared:     {"id": 1, "item": {...}} first, then {"id": 1}
//! ```

use serde_json::{Map, Value as Json, json};
use std::collections::{HashMap, HashSet};

use crate::core::{CollectionId, Conversions, EngineError, Result, Target, TypeId, Value};
use crate::schema::KeyKind;

use super::{Assign, Graph, Node, Slot};

impl Graph {
    /// Serializes everything reachable from `target`. Nodes reached more
    /// than once carry an `"id"`, numbered in first-visit order.
    pub fn to_flat(&self, target: impl Into<Target>) -> Result<Json> {
        let target = target.into();
        let mut visits = HashMap::new();
        let mut order = Vec::new();
        self.count_visits(target, &mut visits, &mut order)?;

        let mut ids = HashMap::new();
        for node in order {
            if visits.get(&node).copied().unwrap_or(0) > 1 {
                let next = ids.len() as i64 + 1;
                ids.insert(node, next);
            }
        }
        self.emit(target, &ids, &mut HashSet::new())
    }

    fn count_visits(
        &self,
        target: Target,
        visits: &mut HashMap<Target, usize>,
        order: &mut Vec<Target>,
    ) -> Result<()> {
        let count = visits.entry(target).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Ok(());
        }
        order.push(target);
        for child in self.children(target)? {
            self.count_visits(child, visits, order)?;
        }
        Ok(())
    }

    /// Direct children in emission order: relations by key for an entity,
    /// members then defaults by key for a collection.
    fn children(&self, target: Target) -> Result<Vec<Target>> {
        let mut children = Vec::new();
        match target {
            Target::Entity(id) => {
                for slot in self.entity(id)?.relations.values() {
                    match slot {
                        Slot::Entity(child) => children.push(Target::Entity(*child)),
                        Slot::Collection(child) => children.push(Target::Collection(*child)),
                        Slot::Null => {}
                    }
                }
            }
            Target::Collection(id) => {
                let data = self.collection(id)?;
                children.extend(data.members.iter().map(|m| Target::Entity(*m)));
                for node in data.defaults.values() {
                    match node {
                        Node::Entity(child) => children.push(Target::Entity(*child)),
                        Node::Collection(child) => children.push(Target::Collection(*child)),
                        Node::Value(_) => {}
                    }
                }
            }
        }
        Ok(children)
    }

    fn emit(&self, target: Target, ids: &HashMap<Target, i64>, emitted: &mut HashSet<Target>) -> Result<Json> {
        let id = ids.get(&target).copied();
        if let Some(id) = id
            && !emitted.insert(target)
        {
            return Ok(json!({ "id": id }));
        }

        let mut object = Map::new();
        match target {
            Target::Entity(entity) => {
                let data = self.entity(entity)?;
                let mut item = Map::new();
                for (key, value) in &data.fields {
                    item.insert(key.clone(), value.to_json());
                }
                for (key, slot) in &data.relations {
                    let value = match slot {
                        Slot::Null => Json::Null,
                        Slot::Entity(child) => self.emit(Target::Entity(*child), ids, emitted)?,
                        Slot::Collection(child) => self.emit(Target::Collection(*child), ids, emitted)?,
                    };
                    item.insert(key.clone(), value);
                }
                object.insert("item".to_string(), Json::Object(item));
                if let Some(update_only) = data.update_only {
                    object.insert("update_only".to_string(), Json::Bool(update_only));
                }
                if let Some(get_only) = data.get_only {
                    object.insert("get_only".to_string(), Json::Bool(get_only));
                }
            }
            Target::Collection(collection) => {
                let data = self.collection(collection)?;
                let mut bulk = Vec::with_capacity(data.members.len());
                for member in &data.members {
                    bulk.push(self.emit(Target::Entity(*member), ids, emitted)?);
                }
                let mut defaults = Map::new();
                for (key, node) in &data.defaults {
                    let value = match node {
                        Node::Value(value) => value.to_json(),
                        Node::Entity(child) => self.emit(Target::Entity(*child), ids, emitted)?,
                        Node::Collection(child) => self.emit(Target::Collection(*child), ids, emitted)?,
                    };
                    defaults.insert(key.clone(), value);
                }
                object.insert("bulk".to_string(), Json::Array(bulk));
                object.insert("defaults".to_string(), Json::Object(defaults));
            }
        }
        if let Some(id) = id {
            object.insert("id".to_string(), json!(id));
        }
        Ok(Json::Object(object))
    }

    /// Rebuilds a graph written by [`Graph::to_flat`] as nodes of `type_id`.
    pub fn load_flat(&mut self, type_id: TypeId, json: &Json) -> Result<Target> {
        let first_id = self.next_id;
        let mut ids = HashMap::new();
        let root = self.load_node(type_id, json, &mut ids)?;

        // Mirroring creates scratch collections while partners are loading.
        let (_, reachable) = self.reachable(&[root], true)?;
        let scratch: Vec<CollectionId> = self
            .collections
            .keys()
            .filter(|id| id.0 >= first_id && !reachable.contains(id))
            .copied()
            .collect();
        for collection in scratch {
            self.release_collection(collection)?;
        }
        Ok(root)
    }

    fn load_node(
        &mut self,
        type_id: TypeId,
        json: &Json,
        ids: &mut HashMap<i64, Target>,
    ) -> Result<Target> {
        let object = json
            .as_object()
            .ok_or_else(|| EngineError::mismatch("flat node object", json.to_string()))?;
        let id = object.get("id").and_then(Json::as_i64);
        if let Some(existing) = id.and_then(|id| ids.get(&id)) {
            return Ok(*existing);
        }

        if let Some(bulk) = object.get("bulk") {
            let collection = self.create_collection(type_id)?;
            if let Some(id) = id {
                ids.insert(id, Target::Collection(collection));
            }
            for member in bulk.as_array().into_iter().flatten() {
                if let Target::Entity(member) = self.load_node(type_id, member, ids)? {
                    self.add(collection, member)?;
                }
            }
            if let Some(defaults) = object.get("defaults").and_then(Json::as_object) {
                for (key, value) in defaults {
                    let assign = if value.is_object() {
                        let target_type = self.path_target_type(type_id, key)?;
                        Assign::from(self.load_node(target_type, value, ids)?)
                    } else {
                        Assign::Value(Value::from_json(value).map_err(|reason| EngineError::ItemProcess {
                            type_name: self.type_name(type_id),
                            key: key.clone(),
                            reason,
                        })?)
                    };
                    self.set_default(collection, key, assign)?;
                }
            }
            return Ok(Target::Collection(collection));
        }

        let item = object
            .get("item")
            .and_then(Json::as_object)
            .ok_or_else(|| EngineError::mismatch("\"item\" or \"bulk\"", json.to_string()))?;
        let entity = self.create(type_id)?;
        if let Some(id) = id {
            ids.insert(id, Target::Entity(entity));
        }
        let update_only = object.get("update_only").and_then(Json::as_bool);
        let get_only = object.get("get_only").and_then(Json::as_bool);
        self.set_update_only(entity, update_only)?;
        self.set_get_only(entity, get_only)?;

        let ty = self.registry().get(type_id)?;
        let conversions = Conversions::default();
        for (key, value) in item {
            match ty.check_key(key)? {
                KeyKind::Field(column) => {
                    let process_error = |reason| EngineError::ItemProcess {
                        type_name: ty.name().to_string(),
                        key: key.clone(),
                        reason,
                    };
                    let raw = Value::from_json(value).map_err(process_error)?;
                    let converted = column.coerce(raw, &conversions).map_err(process_error)?;
                    self.entity_mut(entity)?.fields.insert(key.clone(), converted);
                }
                KeyKind::Relation(def) => {
                    let assign = if value.is_null() {
                        Assign::Value(Value::Null)
                    } else {
                        let target_type = self.registry().find(&def.target)?;
                        Assign::from(self.load_node(target_type, value, ids)?)
                    };
                    self.assign_key(entity, key, assign)?;
                }
            }
        }
        Ok(Target::Entity(entity))
    }

    fn type_name(&self, type_id: TypeId) -> String {
        self.registry()
            .get(type_id)
            .map(|ty| ty.name().to_string())
            .unwrap_or_else(|_| type_id.to_string())
    }
}

impl From<Target> for Assign {
    fn from(target: Target) -> Self {
        match target {
            Target::Entity(id) => Assign::Entity(id),
            Target::Collection(id) => Assign::Collection(id),
        }
    }
}
