use std::collections::BTreeMap;

use crate::core::{CollectionId, EngineError, EntityId, Result};

use super::path::split_path;
use super::{Assign, Graph, Node};

impl Graph {
    pub fn members(&self, collection: CollectionId) -> Result<&[EntityId]> {
        Ok(&self.collection(collection)?.members)
    }

    pub fn collection_len(&self, collection: CollectionId) -> Result<usize> {
        Ok(self.collection(collection)?.members.len())
    }

    pub fn collection_contains(&self, collection: CollectionId, id: EntityId) -> Result<bool> {
        Ok(self.collection(collection)?.members.contains(&id))
    }

    /// Entity and relation holding the collection, if any.
    pub fn collection_owner(&self, collection: CollectionId) -> Result<Option<(EntityId, String)>> {
        Ok(self.collection(collection)?.owner.clone())
    }

    /// Adds an existing entity. On an owned collection this links the owner
    /// and mirrors the reverse relation. Adding a member twice is a no-op.
    pub fn add(&mut self, collection: CollectionId, id: EntityId) -> Result<()> {
        let data = self.collection(collection)?;
        let owner = data.owner.clone();
        let entity_type = self.entity(id)?.type_id;
        if entity_type != data.type_id {
            let expected = self.registry().get(data.type_id)?;
            let found = self.registry().get(entity_type)?;
            return Err(EngineError::mismatch(expected.name(), found.name()));
        }
        match owner {
            Some((owner, relation)) => self.link(owner, &relation, id),
            None => self.raw_push_member(collection, id).map(|_| ()),
        }
    }

    pub fn add_all(&mut self, collection: CollectionId, ids: &[EntityId]) -> Result<()> {
        for id in ids {
            self.add(collection, *id)?;
        }
        Ok(())
    }

    /// Removes a member; the entity itself survives.
    pub fn remove(&mut self, collection: CollectionId, id: EntityId) -> Result<bool> {
        let data = self.collection(collection)?;
        if !data.members.contains(&id) {
            return Ok(false);
        }
        match data.owner.clone() {
            Some((owner, relation)) => self.unlink(owner, &relation, id)?,
            None => {
                self.raw_remove_member(collection, id)?;
            }
        }
        Ok(true)
    }

    /// Creates a member from the collection defaults (shorter paths first)
    /// and `overrides`, then adds it.
    pub fn generate<I, K, V>(&mut self, collection: CollectionId, overrides: I) -> Result<EntityId>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<Assign>,
    {
        let data = self.collection(collection)?;
        let type_id = data.type_id;
        let mut defaults: Vec<(String, Node)> = data
            .defaults
            .iter()
            .map(|(key, node)| (key.clone(), node.clone()))
            .collect();
        defaults.sort_by_key(|(key, _)| split_path(key).len());

        let id = self.create(type_id)?;
        for (key, node) in defaults {
            let value = match node {
                Node::Collection(source) => Assign::Entities(self.collection(source)?.members.clone()),
                other => Assign::from(other),
            };
            self.set(id, &key, value)?;
        }
        for (key, value) in overrides {
            self.set(id, key.as_ref(), value)?;
        }
        self.add(collection, id)?;
        Ok(id)
    }

    pub fn defaults(&self, collection: CollectionId) -> Result<&BTreeMap<String, Node>> {
        Ok(&self.collection(collection)?.defaults)
    }

    pub fn collection_default(&self, collection: CollectionId, path: &str) -> Result<Option<&Node>> {
        Ok(self.collection(collection)?.defaults.get(path))
    }

    /// Sets a default applied by `generate`. The path is checked against
    /// the collection's type.
    pub fn set_default(&mut self, collection: CollectionId, path: &str, value: impl Into<Assign>) -> Result<()> {
        let type_id = self.collection(collection)?.type_id;
        self.check_path(type_id, path)?;
        let node = match value.into() {
            Assign::Value(value) => Node::Value(value),
            Assign::Entity(id) => Node::Entity(id),
            Assign::Collection(id) => Node::Collection(id),
            Assign::Entities(ids) => {
                let target = self.path_target_type(type_id, path)?;
                let holder = self.alloc_collection(target);
                for id in ids {
                    self.add(holder, id)?;
                }
                Node::Collection(holder)
            }
        };
        let key = split_path(path).join("__");
        self.raw_set_default(collection, &key, node)
    }

    pub fn remove_default(&mut self, collection: CollectionId, path: &str) -> Result<bool> {
        let key = split_path(path).join("__");
        self.raw_remove_default(collection, &key)
    }

    /// Unlinks every member from the owner (members survive), removes the
    /// owner's key and drops all defaults, including references to this
    /// collection held as defaults elsewhere.
    pub(crate) fn delete_collection(&mut self, collection: CollectionId) -> Result<()> {
        let data = self.collection(collection)?;
        let members = data.members.clone();
        let keys: Vec<String> = data.defaults.keys().cloned().collect();
        match data.owner.clone() {
            Some((owner, relation)) => {
                for member in members {
                    self.unlink(owner, &relation, member)?;
                }
                self.raw_clear_slot(owner, &relation)?;
            }
            None => {
                for member in members {
                    self.raw_remove_member(collection, member)?;
                }
            }
        }
        for key in keys {
            self.raw_remove_default(collection, &key)?;
        }
        for holder in self.mapper.collection_holders(collection) {
            if let super::Holder::Default { collection: other, key } = holder {
                self.raw_remove_default(other, &key)?;
            }
        }
        Ok(())
    }
}
