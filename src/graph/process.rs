use std::collections::HashSet;

use crate::core::{EngineError, EntityId, Result, Target, Value};
use crate::schema::KeyKind;

use super::path::split_path;
use super::{Graph, Node, Slot};

impl Graph {
    /// Entities reachable from `root` through relations and collection
    /// members, in depth-first pre-order. Relations are followed by key.
    pub fn walk(&self, root: impl Into<Target>) -> Result<Vec<EntityId>> {
        let mut order = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![root.into()];
        while let Some(target) = stack.pop() {
            match target {
                Target::Entity(id) => {
                    if !seen.insert(id) {
                        continue;
                    }
                    order.push(id);
                    let data = self.entity(id)?;
                    for slot in data.relations.values().rev() {
                        match slot {
                            Slot::Entity(next) => stack.push(Target::Entity(*next)),
                            Slot::Collection(next) => stack.push(Target::Collection(*next)),
                            Slot::Null => {}
                        }
                    }
                }
                Target::Collection(id) => {
                    let data = self.collection(id)?;
                    stack.extend(data.members.iter().rev().map(|m| Target::Entity(*m)));
                }
            }
        }
        Ok(order)
    }

    /// Prepares everything reachable from `root` for persisting: type
    /// defaults for missing keys, nullables, null removal and value
    /// conversions. Entities created by defaults are processed too. Last,
    /// entities of merging types that share getter values are merged.
    pub fn process(&mut self, root: impl Into<Target>) -> Result<()> {
        let root = root.into();
        let mut seen = HashSet::new();
        let mut stack = vec![root];
        while let Some(target) = stack.pop() {
            match target {
                Target::Entity(id) => {
                    if !seen.insert(id) {
                        continue;
                    }
                    self.process_entity(id)?;
                    for slot in self.entity(id)?.relations.values().rev() {
                        match slot {
                            Slot::Entity(next) => stack.push(Target::Entity(*next)),
                            Slot::Collection(next) => stack.push(Target::Collection(*next)),
                            Slot::Null => {}
                        }
                    }
                }
                Target::Collection(id) => {
                    let members = self.members(id)?;
                    stack.extend(members.iter().rev().map(|m| Target::Entity(*m)));
                }
            }
        }
        self.merge_items(root)
    }

    fn process_entity(&mut self, id: EntityId) -> Result<()> {
        let ty = self.entity_type(id)?;
        let config = &ty.config;

        let mut defaults: Vec<(&String, &Value)> = config.defaults.iter().collect();
        defaults.sort_by_key(|(path, _)| split_path(path).len());
        for (path, value) in defaults {
            if !self.contains(id, path) {
                self.set(id, path, value.clone())?;
            }
        }

        for key in &config.nullables {
            if self.has_key(id, key)? {
                continue;
            }
            match ty.check_key(key)? {
                KeyKind::Field(_) => {
                    self.entity_mut(id)?.fields.insert(key.clone(), Value::Null);
                }
                KeyKind::Relation(def) if def.kind.is_x_to_many() => {
                    self.ensure_collection(id, key)?;
                }
                KeyKind::Relation(_) => self.raw_set_slot(id, key, Slot::Null)?,
            }
        }

        for key in &config.remove_null_fields {
            if config.nullables.contains(key) {
                continue;
            }
            let empty = match self.peek(id, key)? {
                Some(Node::Value(Value::Null)) => true,
                Some(Node::Collection(collection)) => self.collection_len(collection)? == 0,
                _ => false,
            };
            if empty {
                self.remove_key(id, key)?;
            }
        }

        let fields: Vec<(String, Value)> = self
            .entity(id)?
            .fields
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in fields {
            let Some(column) = ty.field(&key) else {
                continue;
            };
            if column.accepts(&value) {
                continue;
            }
            let converted = column
                .coerce(value, &config.conversions)
                .map_err(|reason| EngineError::ItemProcess {
                    type_name: ty.name().to_string(),
                    key: key.clone(),
                    reason,
                })?;
            self.entity_mut(id)?.fields.insert(key, converted);
        }
        Ok(())
    }
}
