use std::collections::HashMap;

use crate::core::{CollectionId, EngineError, EntityId, Result, Target};

use super::mapper::Holder;
use super::{Graph, Node, Slot};

impl Graph {
    /// Copies everything reachable from `target` (relations, members and
    /// collection defaults) and remaps the edges between the copies. The
    /// copy is mirrored independently of the original.
    pub fn deep_clone(&mut self, target: impl Into<Target>) -> Result<Target> {
        let target = target.into();
        let (entities, collections) = self.reachable(&[target], true)?;

        let mut entities: Vec<EntityId> = entities.into_iter().collect();
        let mut collections: Vec<CollectionId> = collections.into_iter().collect();
        entities.sort();
        collections.sort();

        let mut entity_map = HashMap::new();
        for old in &entities {
            let data = self.entity(*old)?.clone();
            let new = self.create(data.type_id)?;
            entity_map.insert(*old, new);
        }
        let mut collection_map = HashMap::new();
        for old in &collections {
            let type_id = self.collection(*old)?.type_id;
            collection_map.insert(*old, self.alloc_collection(type_id));
        }

        let remap_slot = |slot: Slot| match slot {
            Slot::Entity(id) => Slot::Entity(entity_map.get(&id).copied().unwrap_or(id)),
            Slot::Collection(id) => Slot::Collection(collection_map.get(&id).copied().unwrap_or(id)),
            Slot::Null => Slot::Null,
        };
        let remap_node = |node: &Node| match node {
            Node::Entity(id) => Node::Entity(entity_map.get(id).copied().unwrap_or(*id)),
            Node::Collection(id) => Node::Collection(collection_map.get(id).copied().unwrap_or(*id)),
            Node::Value(value) => Node::Value(value.clone()),
        };

        let mut copies = Vec::with_capacity(entities.len());
        for old in &entities {
            let mut data = self.entity(*old)?.clone();
            for slot in data.relations.values_mut() {
                *slot = remap_slot(*slot);
            }
            copies.push((entity_map[old], data));
        }
        let mut collection_copies = Vec::with_capacity(collections.len());
        for old in &collections {
            let mut data = self.collection(*old)?.clone();
            data.members = data
                .members
                .iter()
                .map(|id| entity_map.get(id).copied().unwrap_or(*id))
                .collect();
            data.defaults = data
                .defaults
                .iter()
                .map(|(key, node)| (key.clone(), remap_node(node)))
                .collect();
            data.owner = data
                .owner
                .and_then(|(owner, relation)| entity_map.get(&owner).map(|new| (*new, relation)));
            collection_copies.push((collection_map[old], data));
        }

        for (id, data) in copies {
            for (relation, slot) in &data.relations {
                let holder = Holder::Relation {
                    owner: id,
                    relation: relation.clone(),
                };
                match slot {
                    Slot::Entity(target) => self.mapper.register_entity(*target, holder),
                    Slot::Collection(target) => self.mapper.register_collection(*target, holder),
                    Slot::Null => {}
                }
            }
            self.entities.insert(id, data);
        }
        for (id, data) in collection_copies {
            for member in &data.members {
                self.mapper.register_entity(*member, Holder::Member(id));
            }
            for (key, node) in &data.defaults {
                let holder = Holder::Default {
                    collection: id,
                    key: key.clone(),
                };
                match node {
                    Node::Entity(target) => self.mapper.register_entity(*target, holder),
                    Node::Collection(target) => self.mapper.register_collection(*target, holder),
                    Node::Value(_) => {}
                }
            }
            self.collections.insert(id, data);
        }

        Ok(match target {
            Target::Entity(id) => Target::Entity(entity_map[&id]),
            Target::Collection(id) => Target::Collection(collection_map[&id]),
        })
    }

    /// Shallow copies would share relation state with the original, so they
    /// are refused.
    pub fn shallow_copy(&self, _target: impl Into<Target>) -> Result<Target> {
        Err(EngineError::ShallowCopyUnsupported)
    }

    /// A new, empty instance of the same shape: an entity of the same type
    /// with the same modes, or a collection with the same defaults.
    pub fn clone_empty(&mut self, target: impl Into<Target>) -> Result<Target> {
        match target.into() {
            Target::Entity(id) => {
                let data = self.entity(id)?;
                let (type_id, update_only, get_only) = (data.type_id, data.update_only, data.get_only);
                let copy = self.create(type_id)?;
                let copy_data = self.entity_mut(copy)?;
                copy_data.update_only = update_only;
                copy_data.get_only = get_only;
                Ok(Target::Entity(copy))
            }
            Target::Collection(id) => {
                let data = self.collection(id)?;
                let type_id = data.type_id;
                let defaults: Vec<(String, Node)> = data
                    .defaults
                    .iter()
                    .map(|(key, node)| (key.clone(), node.clone()))
                    .collect();
                let copy = self.alloc_collection(type_id);
                for (key, node) in defaults {
                    self.raw_set_default(copy, &key, node)?;
                }
                Ok(Target::Collection(copy))
            }
        }
    }
}
