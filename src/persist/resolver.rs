use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{Level, event};

use crate::core::{EntityId, KeySet, RecordRef, Result};
use crate::graph::{Graph, Slot};
use crate::schema::{EntityType, KeyKind};
use crate::storage::{Backend, FieldValues, StoredValue};

use super::{DropReason, DroppedItem, ResolutionFailure};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeState {
    Pending,
    Resolved(Vec<RecordRef>),
    Dropped(DropReason),
}

/// Outcome of evaluating one key group against an entity.
enum Group {
    Ready(FieldValues),
    /// A relation in the group points at a pending entity.
    Wait,
    Missing,
}

enum Step {
    Resolved(Vec<RecordRef>),
    Dropped(DropReason),
    Wait,
}

/// What a getter or creator group is evaluated for.
#[derive(Clone, Copy, PartialEq)]
enum Purpose {
    Lookup,
    Create,
}

pub(crate) struct Resolution {
    pub(crate) states: HashMap<EntityId, NodeState>,
    pub(crate) resolved_order: Vec<EntityId>,
    pub(crate) dropped: Vec<DroppedItem>,
    pub(crate) failures: Vec<ResolutionFailure>,
}

pub(crate) struct Resolver<'a, B: Backend + ?Sized> {
    graph: &'a Graph,
    backend: &'a mut B,
    order: Vec<EntityId>,
    types: HashMap<EntityId, Rc<EntityType>>,
    states: HashMap<EntityId, NodeState>,
    claims: HashMap<RecordRef, EntityId>,
    /// Records created during this run.
    created: HashSet<RecordRef>,
    resolved_order: Vec<EntityId>,
    dropped: Vec<DroppedItem>,
    failures: Vec<ResolutionFailure>,
}

impl<'a, B: Backend + ?Sized> Resolver<'a, B> {
    pub(crate) fn new(graph: &'a Graph, backend: &'a mut B, order: Vec<EntityId>) -> Result<Self> {
        let mut types = HashMap::new();
        let mut states = HashMap::new();
        for id in &order {
            types.insert(*id, graph.entity_type(*id)?);
            states.insert(*id, NodeState::Pending);
        }
        Ok(Self {
            graph,
            backend,
            order,
            types,
            states,
            claims: HashMap::new(),
            created: HashSet::new(),
            resolved_order: Vec::new(),
            dropped: Vec::new(),
            failures: Vec::new(),
        })
    }

    pub(crate) fn run(mut self) -> Result<Resolution> {
        self.resolve_all()?;
        self.write_all()?;
        Ok(Resolution {
            states: self.states,
            resolved_order: self.resolved_order,
            dropped: self.dropped,
            failures: self.failures,
        })
    }

    /// Passes over the pending entities until none is left. A pass without
    /// progress forces the first pending entity.
    fn resolve_all(&mut self) -> Result<()> {
        loop {
            let pending: Vec<EntityId> = self
                .order
                .iter()
                .copied()
                .filter(|id| self.states.get(id) == Some(&NodeState::Pending))
                .collect();
            let Some(first) = pending.first().copied() else {
                return Ok(());
            };

            let mut progress = false;
            for id in pending {
                progress |= self.try_resolve(id, false)?;
            }
            if !progress {
                event!(Level::WARN, entity = %first, "no progress, forcing resolution");
                self.try_resolve(first, true)?;
            }
        }
    }

    /// Returns whether the entity left the pending state.
    fn try_resolve(&mut self, id: EntityId, force: bool) -> Result<bool> {
        let ty = self.type_of(id)?;
        match self.attempt(id, &ty, force)? {
            Step::Wait => Ok(false),
            Step::Dropped(reason) => {
                self.drop_node(id, &ty, reason);
                Ok(true)
            }
            Step::Resolved(records) => {
                self.settle(id, &ty, records);
                Ok(true)
            }
        }
    }

    fn attempt(&mut self, id: EntityId, ty: &EntityType, force: bool) -> Result<Step> {
        let config = ty.config();
        let get_only = self.graph.is_get_only(id)?;
        let update_only = self.graph.is_update_only(id)?;

        if !config.fast_insert || get_only || update_only {
            for group in &config.getters {
                let criteria = match self.group(id, ty, group, Purpose::Lookup, force)? {
                    Group::Missing => continue,
                    Group::Wait => return Ok(Step::Wait),
                    Group::Ready(criteria) => criteria,
                };
                let found = self.backend.find(ty.model(), &criteria)?;
                match found.len() {
                    0 => continue,
                    1 => return Ok(Step::Resolved(found)),
                    _ if config.allow_merge_items => {
                        event!(Level::DEBUG, entity = %id, matches = found.len(), "merging matches");
                        return Ok(Step::Resolved(found));
                    }
                    _ => {
                        event!(Level::WARN, entity = %id, matches = found.len(), "ambiguous match");
                        self.failures.push(ResolutionFailure {
                            item: id,
                            type_name: ty.name().to_string(),
                            message: format!(
                                "{} records of '{}' match {}",
                                found.len(),
                                ty.model(),
                                describe_group(group)
                            ),
                            records: found,
                        });
                        return Ok(Step::Dropped(DropReason::AmbiguousMatchNotAllowed));
                    }
                }
            }
        }

        if get_only {
            return Ok(Step::Dropped(DropReason::GetOnlyMode));
        }
        if update_only {
            return Ok(Step::Dropped(DropReason::UpdateOnlyMode));
        }

        let mut can_create = config.creators.is_empty();
        for group in &config.creators {
            match self.group(id, ty, group, Purpose::Create, force)? {
                Group::Missing => continue,
                Group::Wait => return Ok(Step::Wait),
                Group::Ready(_) => {
                    can_create = true;
                    break;
                }
            }
        }
        if !can_create {
            return Ok(Step::Dropped(DropReason::NotEnoughData));
        }
        if !force && self.links_pending(id, ty)? {
            return Ok(Step::Wait);
        }

        let values = self.write_values(id, ty)?;
        let record = self.backend.create(ty.model(), &values)?;
        event!(Level::DEBUG, entity = %id, record = %record, "created");
        self.created.insert(record.clone());
        Ok(Step::Resolved(vec![record]))
    }

    /// Whether an x-to-one relation still points at a pending entity. The
    /// record is created only once its single links can be written with it.
    fn links_pending(&self, id: EntityId, ty: &EntityType) -> Result<bool> {
        for (key, slot) in &self.graph.entity(id)?.relations {
            let Slot::Entity(target) = slot else {
                continue;
            };
            let single = ty.relation(key).is_some_and(|def| def.kind.is_x_to_one());
            if single && self.states.get(target) == Some(&NodeState::Pending) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Evaluates a key group. Missing wins over waiting since a group with
    /// an absent key can never become ready.
    fn group(&self, id: EntityId, ty: &EntityType, keys: &KeySet, purpose: Purpose, force: bool) -> Result<Group> {
        let data = self.graph.entity(id)?;
        let mut values = FieldValues::new();
        let mut wait = false;
        for key in keys {
            match ty.key_kind(key) {
                Some(KeyKind::Field(_)) => match data.fields.get(key) {
                    // Looking records up by null is never meant.
                    Some(value) if value.is_null() && purpose == Purpose::Lookup => {
                        return Ok(Group::Missing);
                    }
                    Some(value) if value.is_null() => {
                        values.insert(key.clone(), StoredValue::Null);
                    }
                    Some(value) => {
                        values.insert(key.clone(), StoredValue::Scalar(value.clone()));
                    }
                    None => return Ok(Group::Missing),
                },
                Some(KeyKind::Relation(def)) => {
                    match self.relation_value(id, key, def.kind.is_x_to_many(), purpose, force)? {
                        Group::Ready(mut value) => values.append(&mut value),
                        Group::Wait => wait = true,
                        Group::Missing => return Ok(Group::Missing),
                    }
                }
                None => return Ok(Group::Missing),
            }
        }
        Ok(if wait { Group::Wait } else { Group::Ready(values) })
    }

    /// The stored value of one relation key, as a single-entry group.
    fn relation_value(
        &self,
        id: EntityId,
        key: &str,
        to_many: bool,
        purpose: Purpose,
        force: bool,
    ) -> Result<Group> {
        let targets: Vec<EntityId> = match self.graph.slot(id, key) {
            None | Some(Slot::Null) => return Ok(Group::Missing),
            Some(Slot::Entity(target)) => vec![target],
            Some(Slot::Collection(collection)) => self.graph.members(collection)?.to_vec(),
        };

        let mut records = Vec::new();
        for target in targets {
            match self.states.get(&target) {
                Some(NodeState::Pending) if !force => return Ok(Group::Wait),
                Some(NodeState::Resolved(found)) => {
                    if purpose == Purpose::Create && self.graph.is_get_only(target)? {
                        continue;
                    }
                    records.extend(found.iter().cloned());
                }
                _ => {}
            }
        }
        if records.is_empty() {
            return Ok(Group::Missing);
        }
        let value = if to_many {
            StoredValue::Refs(records)
        } else {
            StoredValue::Ref(records.swap_remove(0))
        };
        Ok(Group::Ready(FieldValues::from([(key.to_string(), value)])))
    }

    /// Field values and relation links of an entity. Links to dropped,
    /// pending or get-only entities are left out.
    fn write_values(&self, id: EntityId, ty: &EntityType) -> Result<FieldValues> {
        let data = self.graph.entity(id)?;
        let mut values = FieldValues::new();
        for (key, value) in &data.fields {
            let stored = if value.is_null() {
                StoredValue::Null
            } else {
                StoredValue::Scalar(value.clone())
            };
            values.insert(key.clone(), stored);
        }

        for (key, slot) in &data.relations {
            let Some(def) = ty.relation(key) else {
                continue;
            };
            let stored = match slot {
                Slot::Null if def.kind.is_x_to_one() || def.replace_x_to_many => StoredValue::Null,
                Slot::Null => continue,
                Slot::Entity(target) => match self.writable(*target)? {
                    Some(records) if def.kind.is_x_to_many() => StoredValue::Refs(records.to_vec()),
                    Some(records) => match records.first() {
                        Some(record) => StoredValue::Ref(record.clone()),
                        None => continue,
                    },
                    None => continue,
                },
                Slot::Collection(collection) => {
                    let mut records = Vec::new();
                    for member in self.graph.members(*collection)? {
                        if let Some(found) = self.writable(*member)? {
                            records.extend(found.iter().cloned());
                        }
                    }
                    if def.replace_x_to_many {
                        StoredValue::ReplaceRefs(records)
                    } else if records.is_empty() {
                        continue;
                    } else {
                        StoredValue::Refs(records)
                    }
                }
            };
            values.insert(key.clone(), stored);
        }
        Ok(values)
    }

    fn writable(&self, target: EntityId) -> Result<Option<&[RecordRef]>> {
        match self.states.get(&target) {
            Some(NodeState::Resolved(records)) if !self.graph.is_get_only(target)? => Ok(Some(records)),
            _ => Ok(None),
        }
    }

    /// Marks the entity resolved unless one of its records is claimed by
    /// another entity and the type does not allow shared updates.
    fn settle(&mut self, id: EntityId, ty: &EntityType, records: Vec<RecordRef>) {
        if !ty.config().allow_multi_update {
            let taken = records
                .iter()
                .find_map(|r| self.claims.get(r).filter(|owner| **owner != id).map(|owner| (r, *owner)));
            if let Some((record, owner)) = taken {
                event!(Level::WARN, entity = %id, record = %record, "record already claimed");
                self.failures.push(ResolutionFailure {
                    item: id,
                    type_name: ty.name().to_string(),
                    records: records.clone(),
                    message: format!("{} is already resolved by {}", record, owner),
                });
                self.drop_node(id, ty, DropReason::AmbiguousMatchNotAllowed);
                return;
            }
        }

        for record in &records {
            self.claims.entry(record.clone()).or_insert(id);
        }
        event!(Level::DEBUG, entity = %id, records = records.len(), "resolved");
        self.states.insert(id, NodeState::Resolved(records));
        self.resolved_order.push(id);
    }

    fn drop_node(&mut self, id: EntityId, ty: &EntityType, reason: DropReason) {
        event!(Level::DEBUG, entity = %id, reason = %reason, "dropped");
        self.states.insert(id, NodeState::Dropped(reason));
        self.dropped.push(DroppedItem {
            item: id,
            type_name: ty.name().to_string(),
            reason,
        });
    }

    /// Writes fields and links of every resolved entity, in resolution order.
    fn write_all(&mut self) -> Result<()> {
        let order = self.resolved_order.clone();
        for id in order {
            if self.graph.is_get_only(id)? {
                continue;
            }
            let ty = self.type_of(id)?;
            let values = self.write_values(id, &ty)?;
            if values.is_empty() {
                continue;
            }
            let records = match self.states.get(&id) {
                Some(NodeState::Resolved(records)) => records.clone(),
                _ => continue,
            };
            for record in &records {
                let values = self.rewritable(record, &ty, &values)?;
                if !values.is_empty() {
                    self.backend.update(record, &values)?;
                }
            }
        }
        Ok(())
    }

    /// Drops the protected keys of a found record from `values`: keys that
    /// may not be rewritten at all, and keys that may only fill a null the
    /// record still has set.
    fn rewritable(&self, record: &RecordRef, ty: &EntityType, values: &FieldValues) -> Result<FieldValues> {
        let protected = &ty.config().norewrite_fields;
        if protected.is_empty() || self.created.contains(record) {
            return Ok(values.clone());
        }
        let mut kept = FieldValues::new();
        for (key, value) in values {
            let allowed = match protected.get(key) {
                None | Some(None) => true,
                Some(Some(false)) => false,
                Some(Some(true)) => self.backend.is_unset(record, key)?,
            };
            if allowed {
                kept.insert(key.clone(), value.clone());
            } else {
                event!(Level::TRACE, record = %record, key = %key, "kept stored value");
            }
        }
        Ok(kept)
    }

    fn type_of(&self, id: EntityId) -> Result<Rc<EntityType>> {
        match self.types.get(&id) {
            Some(ty) => Ok(ty.clone()),
            None => self.graph.entity_type(id),
        }
    }
}

fn describe_group(keys: &KeySet) -> String {
    let keys: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
    format!("({})", keys.join(", "))
}
