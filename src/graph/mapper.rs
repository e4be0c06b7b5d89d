//! Back-reference index and relation mirroring.
//!
//! For a relation `a.rel -> b` with a reverse `R` declared on `b`'s type,
//! every edit keeps `b.R` equal to (or containing) `a`. The index records,
//! for each entity and collection, every place that refers to it so that
//! deletion can unhook it without scanning the arena.

use std::collections::{BTreeSet, HashMap};

use crate::core::{CollectionId, EngineError, EntityId, Result};

use super::{Assign, Graph, Node, Slot, describe};

/// A place holding a reference to an entity or a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Holder {
    /// The relation `relation` of `owner`.
    Relation { owner: EntityId, relation: String },
    /// Membership in a collection.
    Member(CollectionId),
    /// A default value of a collection.
    Default { collection: CollectionId, key: String },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Mapper {
    entities: HashMap<EntityId, BTreeSet<Holder>>,
    collections: HashMap<CollectionId, BTreeSet<Holder>>,
}

impl Mapper {
    pub(crate) fn register_entity(&mut self, id: EntityId, holder: Holder) {
        self.entities.entry(id).or_default().insert(holder);
    }

    pub(crate) fn unregister_entity(&mut self, id: EntityId, holder: &Holder) {
        if let Some(holders) = self.entities.get_mut(&id) {
            holders.remove(holder);
            if holders.is_empty() {
                self.entities.remove(&id);
            }
        }
    }

    pub(crate) fn register_collection(&mut self, id: CollectionId, holder: Holder) {
        self.collections.entry(id).or_default().insert(holder);
    }

    pub(crate) fn unregister_collection(&mut self, id: CollectionId, holder: &Holder) {
        if let Some(holders) = self.collections.get_mut(&id) {
            holders.remove(holder);
            if holders.is_empty() {
                self.collections.remove(&id);
            }
        }
    }

    pub(crate) fn entity_holders(&self, id: EntityId) -> Vec<Holder> {
        self.entities
            .get(&id)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn collection_holders(&self, id: CollectionId) -> Vec<Holder> {
        self.collections
            .get(&id)
            .map(|holders| holders.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn forget_entity(&mut self, id: EntityId) {
        self.entities.remove(&id);
    }

    pub(crate) fn forget_collection(&mut self, id: CollectionId) {
        self.collections.remove(&id);
    }
}

impl Graph {
    // ========================================================================
    // Raw slot and membership edits (index only, no mirroring)
    // ========================================================================

    pub(crate) fn raw_set_slot(&mut self, owner: EntityId, relation: &str, slot: Slot) -> Result<()> {
        let previous = self
            .entity_mut(owner)?
            .relations
            .insert(relation.to_string(), slot);
        if let Some(previous) = previous {
            self.release_slot(owner, relation, previous);
        }
        self.claim_slot(owner, relation, slot);
        Ok(())
    }

    pub(crate) fn raw_clear_slot(&mut self, owner: EntityId, relation: &str) -> Result<()> {
        if let Some(previous) = self.entity_mut(owner)?.relations.remove(relation) {
            self.release_slot(owner, relation, previous);
        }
        Ok(())
    }

    fn claim_slot(&mut self, owner: EntityId, relation: &str, slot: Slot) {
        let holder = Holder::Relation {
            owner,
            relation: relation.to_string(),
        };
        match slot {
            Slot::Entity(id) => self.mapper.register_entity(id, holder),
            Slot::Collection(id) => {
                self.mapper.register_collection(id, holder);
                if let Some(data) = self.collections.get_mut(&id) {
                    data.owner = Some((owner, relation.to_string()));
                }
            }
            Slot::Null => {}
        }
    }

    fn release_slot(&mut self, owner: EntityId, relation: &str, slot: Slot) {
        let holder = Holder::Relation {
            owner,
            relation: relation.to_string(),
        };
        match slot {
            Slot::Entity(id) => self.mapper.unregister_entity(id, &holder),
            Slot::Collection(id) => {
                self.mapper.unregister_collection(id, &holder);
                if let Some(data) = self.collections.get_mut(&id)
                    && data.owner.as_ref().is_some_and(|(o, r)| *o == owner && r == relation)
                {
                    data.owner = None;
                }
            }
            Slot::Null => {}
        }
    }

    pub(crate) fn raw_push_member(&mut self, collection: CollectionId, id: EntityId) -> Result<bool> {
        let data = self.collection_mut(collection)?;
        if data.members.contains(&id) {
            return Ok(false);
        }
        data.members.push(id);
        self.mapper.register_entity(id, Holder::Member(collection));
        Ok(true)
    }

    pub(crate) fn raw_remove_member(&mut self, collection: CollectionId, id: EntityId) -> Result<bool> {
        let data = self.collection_mut(collection)?;
        let Some(position) = data.members.iter().position(|m| *m == id) else {
            return Ok(false);
        };
        data.members.remove(position);
        self.mapper.unregister_entity(id, &Holder::Member(collection));
        Ok(true)
    }

    pub(crate) fn raw_set_default(&mut self, collection: CollectionId, key: &str, node: Node) -> Result<()> {
        self.raw_remove_default(collection, key)?;
        let holder = Holder::Default {
            collection,
            key: key.to_string(),
        };
        match &node {
            Node::Entity(id) => self.mapper.register_entity(*id, holder),
            Node::Collection(id) => self.mapper.register_collection(*id, holder),
            Node::Value(_) => {}
        }
        self.collection_mut(collection)?
            .defaults
            .insert(key.to_string(), node);
        Ok(())
    }

    pub(crate) fn raw_remove_default(&mut self, collection: CollectionId, key: &str) -> Result<bool> {
        let Some(previous) = self.collection_mut(collection)?.defaults.remove(key) else {
            return Ok(false);
        };
        let holder = Holder::Default {
            collection,
            key: key.to_string(),
        };
        match previous {
            Node::Entity(id) => self.mapper.unregister_entity(id, &holder),
            Node::Collection(id) => self.mapper.unregister_collection(id, &holder),
            Node::Value(_) => {}
        }
        Ok(true)
    }

    // ========================================================================
    // Mirroring
    // ========================================================================

    fn reverse_of(&self, owner: EntityId, relation: &str) -> Result<Option<String>> {
        let type_id = self.entity(owner)?.type_id;
        Ok(self.registry().reverse_of(type_id, relation))
    }

    fn is_x_to_many(&self, owner: EntityId, relation: &str) -> Result<bool> {
        let ty = self.entity_type(owner)?;
        let def = ty
            .relation(relation)
            .ok_or_else(|| EngineError::unknown_key(ty.name(), relation))?;
        Ok(def.kind.is_x_to_many())
    }

    /// Collection held by an x-to-many relation, created on first use.
    pub(crate) fn ensure_collection(&mut self, owner: EntityId, relation: &str) -> Result<CollectionId> {
        if let Some(Slot::Collection(id)) = self.slot(owner, relation) {
            return Ok(id);
        }
        let target = self.registry().target_of(self.entity(owner)?.type_id, relation)?;
        let id = self.alloc_collection(target.id());
        self.raw_set_slot(owner, relation, Slot::Collection(id))?;
        Ok(id)
    }

    /// One direction of a link: puts `target` into `owner.relation`.
    fn attach_half(&mut self, owner: EntityId, relation: &str, target: EntityId) -> Result<()> {
        if self.is_x_to_many(owner, relation)? {
            let collection = self.ensure_collection(owner, relation)?;
            self.raw_push_member(collection, target)?;
            return Ok(());
        }
        match self.slot(owner, relation) {
            Some(Slot::Entity(current)) if current == target => return Ok(()),
            Some(Slot::Entity(current)) => self.unlink(owner, relation, current)?,
            _ => {}
        }
        self.raw_set_slot(owner, relation, Slot::Entity(target))
    }

    /// One direction of an unlink: takes `target` out of `owner.relation`.
    fn detach_half(&mut self, owner: EntityId, relation: &str, target: EntityId) -> Result<()> {
        match self.slot(owner, relation) {
            Some(Slot::Collection(collection)) => {
                self.raw_remove_member(collection, target)?;
            }
            Some(Slot::Entity(current)) if current == target => {
                self.raw_clear_slot(owner, relation)?;
            }
            _ => {}
        }
        Ok(())
    }

    /// Links `owner.relation` to `target` and mirrors the reverse. A
    /// single-valued side drops its previous partner first.
    pub(crate) fn link(&mut self, owner: EntityId, relation: &str, target: EntityId) -> Result<()> {
        self.attach_half(owner, relation, target)?;
        if let Some(reverse) = self.reverse_of(owner, relation)? {
            self.attach_half(target, &reverse, owner)?;
        }
        Ok(())
    }

    pub(crate) fn unlink(&mut self, owner: EntityId, relation: &str, target: EntityId) -> Result<()> {
        self.detach_half(owner, relation, target)?;
        if let Some(reverse) = self.reverse_of(owner, relation)? {
            self.detach_half(target, &reverse, owner)?;
        }
        Ok(())
    }

    /// Removes `owner.relation` entirely. A held collection keeps its
    /// members but they lose their reverse reference to `owner`.
    pub(crate) fn clear_relation(&mut self, owner: EntityId, relation: &str) -> Result<()> {
        let reverse = self.reverse_of(owner, relation)?;
        match (self.slot(owner, relation), reverse) {
            (None, _) => return Ok(()),
            (Some(Slot::Entity(target)), Some(reverse)) => {
                self.detach_half(target, &reverse, owner)?;
            }
            (Some(Slot::Collection(collection)), Some(reverse)) => {
                for member in self.collection(collection)?.members.clone() {
                    self.detach_half(member, &reverse, owner)?;
                }
            }
            _ => {}
        }
        self.raw_clear_slot(owner, relation)
    }

    fn check_target(&self, owner: EntityId, relation: &str, target: EntityId) -> Result<()> {
        let expected = self.registry().target_of(self.entity(owner)?.type_id, relation)?;
        let found = self.entity_type(target)?;
        if expected.id() != found.id() {
            return Err(EngineError::mismatch(expected.name(), found.name()));
        }
        Ok(())
    }

    /// Makes `collection` the value of `owner.relation`, taking it away from
    /// its previous owner.
    fn adopt_collection(&mut self, owner: EntityId, relation: &str, collection: CollectionId) -> Result<()> {
        if self.slot(owner, relation) == Some(Slot::Collection(collection)) {
            return Ok(());
        }
        let expected = self.registry().target_of(self.entity(owner)?.type_id, relation)?;
        let data = self.collection(collection)?;
        if data.type_id != expected.id() {
            let found = self.registry().get(data.type_id)?;
            return Err(EngineError::mismatch(expected.name(), found.name()));
        }
        let previous_owner = data.owner.clone();

        self.clear_relation(owner, relation)?;
        if let Some((previous, previous_relation)) = previous_owner {
            self.clear_relation(previous, &previous_relation)?;
        }
        self.raw_set_slot(owner, relation, Slot::Collection(collection))?;
        if let Some(reverse) = self.reverse_of(owner, relation)? {
            for member in self.collection(collection)?.members.clone() {
                self.attach_half(member, &reverse, owner)?;
            }
        }
        Ok(())
    }

    /// Puts `replacement` where `id` sits in `collection`, keeping the
    /// position and mirroring the owner's reverse relation. When
    /// `replacement` is already a member, `id` is just taken out.
    pub(crate) fn replace_member(&mut self, collection: CollectionId, id: EntityId, replacement: EntityId) -> Result<()> {
        let data = self.collection(collection)?;
        let owner = data.owner.clone();
        let present = data.members.contains(&replacement);
        let position = data.members.iter().position(|m| *m == id);
        if present {
            return match owner {
                Some((owner, relation)) => self.unlink(owner, &relation, id),
                None => self.raw_remove_member(collection, id).map(|_| ()),
            };
        }
        let Some(position) = position else {
            return Ok(());
        };

        if let Some((owner, relation)) = &owner
            && let Some(reverse) = self.reverse_of(*owner, relation)?
        {
            self.detach_half(id, &reverse, *owner)?;
            self.attach_half(replacement, &reverse, *owner)?;
        }
        self.collection_mut(collection)?.members[position] = replacement;
        self.mapper.unregister_entity(id, &Holder::Member(collection));
        self.mapper.register_entity(replacement, Holder::Member(collection));
        Ok(())
    }

    pub(crate) fn assign_relation(&mut self, owner: EntityId, relation: &str, value: Assign) -> Result<()> {
        let many = self.is_x_to_many(owner, relation)?;
        match value {
            Assign::Value(value) if value.is_null() => {
                self.clear_relation(owner, relation)?;
                self.raw_set_slot(owner, relation, Slot::Null)
            }
            Assign::Entity(target) if !many => {
                self.check_target(owner, relation, target)?;
                self.link(owner, relation, target)
            }
            Assign::Collection(collection) if many => self.adopt_collection(owner, relation, collection),
            Assign::Entities(targets) if many => {
                for target in &targets {
                    self.check_target(owner, relation, *target)?;
                }
                self.ensure_collection(owner, relation)?;
                for target in targets {
                    self.link(owner, relation, target)?;
                }
                Ok(())
            }
            other => {
                let expected = if many { "collection" } else { "entity" };
                Err(EngineError::mismatch(expected, describe(&other)))
            }
        }
    }

    // ========================================================================
    // Entity deletion
    // ========================================================================

    pub(crate) fn delete_entity(&mut self, id: EntityId) -> Result<()> {
        let relations: Vec<String> = self.entity(id)?.relations.keys().cloned().collect();
        for relation in relations {
            self.clear_relation(id, &relation)?;
        }
        {
            let data = self.entity_mut(id)?;
            data.fields.clear();
            data.update_only = None;
            data.get_only = None;
        }

        for holder in self.mapper.entity_holders(id) {
            match holder {
                Holder::Relation { owner, relation } => {
                    if self.slot(owner, &relation) == Some(Slot::Entity(id)) {
                        self.raw_clear_slot(owner, &relation)?;
                    }
                }
                Holder::Member(collection) => match self.collection(collection)?.owner.clone() {
                    Some((owner, relation)) => self.unlink(owner, &relation, id)?,
                    None => {
                        self.raw_remove_member(collection, id)?;
                    }
                },
                Holder::Default { collection, key } => {
                    self.raw_remove_default(collection, &key)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ColumnType, RelationKind, TypeId};
    use crate::schema::{EntityTypeBuilder, TypeRegistry};

    fn setup() -> (Graph, TypeId, TypeId) {
        let registry = TypeRegistry::new();
        let one = registry
            .register(
                EntityTypeBuilder::new("one")
                    .field("count", ColumnType::Integer)
                    .relation("two_1_1", "two", RelationKind::OneToOne, Some("one_1_1"))
                    .relation("two_1_x", "two", RelationKind::OneToMany, Some("one_x_1"))
                    .relation("two_x_x", "two", RelationKind::ManyToMany, Some("one_x_x")),
            )
            .unwrap();
        let two = registry
            .register(
                EntityTypeBuilder::new("two")
                    .field("count", ColumnType::Integer)
                    .relation("one_1_1", "one", RelationKind::OneToOne, Some("two_1_1"))
                    .relation("one_x_1", "one", RelationKind::ManyToOne, Some("two_1_x"))
                    .relation("one_x_x", "one", RelationKind::ManyToMany, Some("two_x_x")),
            )
            .unwrap();
        (Graph::new(&registry), one, two)
    }

    #[test]
    fn test_one_to_one_overwrite_clears_stale_partner() {
        let (mut graph, one, two) = setup();
        let a1 = graph.create(one).unwrap();
        let a2 = graph.create(one).unwrap();
        let b = graph.create(two).unwrap();

        graph.link(a1, "two_1_1", b).unwrap();
        assert_eq!(graph.slot(b, "one_1_1"), Some(Slot::Entity(a1)));

        graph.link(a2, "two_1_1", b).unwrap();
        assert_eq!(graph.slot(b, "one_1_1"), Some(Slot::Entity(a2)));
        assert_eq!(graph.slot(a1, "two_1_1"), None);
    }

    #[test]
    fn test_holders_follow_edits() {
        let (mut graph, one, two) = setup();
        let a = graph.create(one).unwrap();
        let b = graph.create(two).unwrap();

        graph.link(a, "two_1_x", b).unwrap();
        let collection = graph.ensure_collection(a, "two_1_x").unwrap();
        let holders = graph.referrers(b);
        assert!(holders.contains(&Holder::Member(collection)));
        assert_eq!(
            graph.referrers(a),
            vec![Holder::Relation { owner: b, relation: "one_x_1".to_string() }]
        );

        graph.unlink(a, "two_1_x", b).unwrap();
        assert!(graph.referrers(b).is_empty());
        assert!(graph.referrers(a).is_empty());
    }

    #[test]
    fn test_clear_relation_keeps_collection_members() {
        let (mut graph, one, two) = setup();
        let a = graph.create(one).unwrap();
        let b = graph.create(two).unwrap();
        graph.link(a, "two_x_x", b).unwrap();
        let collection = graph.ensure_collection(a, "two_x_x").unwrap();

        graph.clear_relation(a, "two_x_x").unwrap();
        assert_eq!(graph.slot(a, "two_x_x"), None);
        assert_eq!(graph.collection(collection).unwrap().members, vec![b]);
        assert_eq!(graph.collection(collection).unwrap().owner, None);
        let reverse = graph.ensure_collection(b, "one_x_x").unwrap();
        assert!(graph.collection(reverse).unwrap().members.is_empty());
    }

    #[test]
    fn test_wrong_target_type_is_rejected() {
        let (mut graph, one, _) = setup();
        let a = graph.create(one).unwrap();
        let other = graph.create(one).unwrap();
        let err = graph
            .assign_relation(a, "two_1_1", Assign::Entity(other))
            .unwrap_err();
        assert!(matches!(err, EngineError::TypeMismatch { .. }));
    }
}
