//! Merging of input entities that stand for the same record.
//!
//! Entities of a type with `allow_merge_items` that agree on every key of
//! one getter group are folded into the first of them in walk order. The
//! survivor takes the union of their keys and every reference to an
//! absorbed entity is pointed at the survivor.

use crate::core::{EngineError, EntityId, KeySet, Result, Target, TypeId, Value};
use crate::schema::{EntityType, KeyKind};

use super::mapper::Holder;
use super::{Graph, Node, Slot};

/// Values of one getter group, in key order.
type MergeKey = Vec<Node>;

impl Graph {
    /// Folds mergeable entities reachable from `root` until none are left.
    pub fn merge_items(&mut self, root: impl Into<Target>) -> Result<()> {
        let root = root.into();
        while let Some((survivor, absorbed)) = self.next_merge(root)? {
            self.absorb(survivor, absorbed)?;
        }
        Ok(())
    }

    /// First entity in walk order that matches an earlier one.
    fn next_merge(&self, root: Target) -> Result<Option<(EntityId, EntityId)>> {
        let mut seen: Vec<(TypeId, usize, MergeKey, EntityId)> = Vec::new();
        for id in self.walk(root)? {
            let ty = self.entity_type(id)?;
            if !ty.config.allow_merge_items {
                continue;
            }
            let mut matches: Vec<EntityId> = Vec::new();
            let mut keys = Vec::new();
            for (position, group) in ty.config.getters.iter().enumerate() {
                let Some(key) = self.merge_key(id, &ty, group)? else {
                    continue;
                };
                let earlier = seen
                    .iter()
                    .find(|(t, p, k, _)| *t == ty.id() && *p == position && *k == key)
                    .map(|(_, _, _, other)| *other);
                match earlier {
                    Some(other) if !matches.contains(&other) => matches.push(other),
                    Some(_) => {}
                    None => keys.push((position, key)),
                }
            }
            match matches.as_slice() {
                [] => seen.extend(keys.into_iter().map(|(p, k)| (ty.id(), p, k, id))),
                [survivor] => return Ok(Some((*survivor, id))),
                _ => {
                    return Err(EngineError::MergeMultipleItemsMatch {
                        type_name: ty.name().to_string(),
                        item: id,
                    });
                }
            }
        }
        Ok(None)
    }

    /// Values of `group` on an entity, or `None` when a key is unset, null
    /// or an x-to-many relation.
    fn merge_key(&self, id: EntityId, ty: &EntityType, group: &KeySet) -> Result<Option<MergeKey>> {
        let data = self.entity(id)?;
        let mut key = Vec::with_capacity(group.len());
        for name in group {
            let node = match ty.key_kind(name) {
                Some(KeyKind::Field(_)) => match data.fields.get(name) {
                    Some(value) if !value.is_null() => Node::Value(value.clone()),
                    _ => return Ok(None),
                },
                Some(KeyKind::Relation(def)) if def.kind.is_x_to_one() => match data.relations.get(name) {
                    Some(Slot::Entity(target)) => Node::Entity(*target),
                    _ => return Ok(None),
                },
                _ => return Ok(None),
            };
            key.push(node);
        }
        Ok(Some(key))
    }

    /// Whether two entities are bound to be merged with each other.
    fn same_item(&self, a: EntityId, b: EntityId) -> Result<bool> {
        if a == b {
            return Ok(true);
        }
        let ty = self.entity_type(a)?;
        if self.entity(b)?.type_id != ty.id() || !ty.config.allow_merge_items {
            return Ok(false);
        }
        for group in &ty.config.getters {
            let left = self.merge_key(a, &ty, group)?;
            if left.is_some() && left == self.merge_key(b, &ty, group)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Moves every key and reference of `absorbed` onto `survivor`, then
    /// deletes `absorbed`.
    fn absorb(&mut self, survivor: EntityId, absorbed: EntityId) -> Result<()> {
        let ty = self.entity_type(survivor)?;
        let redirect = |id: EntityId| if id == absorbed { survivor } else { id };

        // Nothing is touched before both entities are known to agree.
        let fields: Vec<(String, Value)> = self
            .entity(absorbed)?
            .fields
            .iter()
            .filter(|(_, value)| !value.is_null())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for (key, value) in &fields {
            match self.entity(survivor)?.fields.get(key) {
                Some(current) if !current.is_null() && current != value => {
                    return Err(not_the_same(&ty, key));
                }
                _ => {}
            }
        }
        for (key, slot) in &self.entity(absorbed)?.relations {
            let (Slot::Entity(theirs), Some(Slot::Entity(ours))) = (slot, self.slot(survivor, key)) else {
                continue;
            };
            if !self.same_item(redirect(*theirs), redirect(ours))? {
                return Err(not_the_same(&ty, key));
            }
        }

        for (key, value) in fields {
            self.entity_mut(survivor)?.fields.insert(key, value);
        }

        for holder in self.mapper.entity_holders(absorbed) {
            match holder {
                Holder::Relation { owner, .. } if owner == absorbed => {}
                Holder::Relation { owner, relation } => self.link(owner, &relation, survivor)?,
                Holder::Member(collection) => self.replace_member(collection, absorbed, survivor)?,
                Holder::Default { collection, key } => {
                    self.raw_set_default(collection, &key, Node::Entity(survivor))?;
                }
            }
        }

        let mut links = Vec::new();
        for (key, slot) in self.entity(absorbed)?.relations.clone() {
            match slot {
                Slot::Entity(target) => links.push((key, redirect(target))),
                Slot::Collection(collection) => {
                    let members = self.members(collection)?;
                    links.extend(members.iter().map(|m| (key.clone(), redirect(*m))));
                }
                Slot::Null => {}
            }
        }
        self.release_entity(absorbed)?;

        for (key, target) in links {
            if !matches!(self.slot(survivor, &key), Some(Slot::Entity(_))) {
                self.link(survivor, &key, target)?;
            }
        }
        Ok(())
    }
}

fn not_the_same(ty: &EntityType, key: &str) -> EngineError {
    EngineError::MergeItemsNotTheSame {
        type_name: ty.name().to_string(),
        key: key.to_string(),
    }
}
