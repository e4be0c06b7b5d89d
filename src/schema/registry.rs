use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::core::{EngineError, Result, TypeId};
use crate::storage::Backend;

use super::entity_type::{EntityType, EntityTypeBuilder};
use super::scope::ScopeState;

#[derive(Debug, Default)]
pub(crate) struct RegistryState {
    pub(crate) types: Vec<Rc<EntityType>>,
    pub(crate) by_name: HashMap<String, TypeId>,
    pub(crate) scopes: HashMap<String, ScopeState>,
}

impl RegistryState {
    pub(crate) fn type_at(&self, id: TypeId) -> Result<&Rc<EntityType>> {
        self.types
            .get(id.0)
            .ok_or_else(|| EngineError::UnknownType(id.to_string()))
    }

    pub(crate) fn id_of(&self, name: &str) -> Result<TypeId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| EngineError::UnknownType(name.to_string()))
    }
}

/// Registry of entity types and the scopes deriving from them.
///
/// Cloning yields another handle to the same registry. The registry is
/// single-threaded; callers on several threads must serialize access.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    pub(crate) inner: Rc<RefCell<RegistryState>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, builder: EntityTypeBuilder) -> Result<TypeId> {
        let mut state = self.inner.borrow_mut();
        if state.by_name.contains_key(builder.type_name()) {
            return Err(EngineError::DuplicateType(builder.type_name().to_string()));
        }
        let id = TypeId(state.types.len());
        let ty = builder.build(id)?;
        state.by_name.insert(ty.name.clone(), id);
        state.types.push(Rc::new(ty));
        Ok(id)
    }

    /// Registers one type per backend model, named after the model and
    /// configured from the backend's constraints.
    pub fn register_models<B: Backend + ?Sized>(&self, backend: &B, models: &[&str]) -> Result<Vec<TypeId>> {
        models
            .iter()
            .map(|model| self.register(EntityTypeBuilder::from_backend(backend, model)?))
            .collect()
    }

    pub fn get(&self, id: TypeId) -> Result<Rc<EntityType>> {
        self.inner.borrow().type_at(id).cloned()
    }

    pub fn find(&self, name: &str) -> Result<TypeId> {
        self.inner.borrow().id_of(name)
    }

    pub fn by_name(&self, name: &str) -> Result<Rc<EntityType>> {
        let state = self.inner.borrow();
        let id = state.id_of(name)?;
        state.type_at(id).cloned()
    }

    /// Type a relation of `owner` points to.
    pub fn target_of(&self, owner: TypeId, relation: &str) -> Result<Rc<EntityType>> {
        let state = self.inner.borrow();
        let ty = state.type_at(owner)?;
        let def = ty
            .relation(relation)
            .ok_or_else(|| EngineError::unknown_key(&ty.name, relation))?;
        let target = state.id_of(&def.target)?;
        state.type_at(target).cloned()
    }

    /// Name of the relation mirroring `relation` on its target type.
    ///
    /// `None` when no reverse is declared or the target type lacks it.
    pub fn reverse_of(&self, owner: TypeId, relation: &str) -> Option<String> {
        let state = self.inner.borrow();
        let def = state.type_at(owner).ok()?.relation(relation)?;
        let reverse = def.reverse.as_ref()?;
        let target = state.type_at(state.id_of(&def.target).ok()?).ok()?;
        target.relation(reverse).map(|r| r.name.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every type, scope and derivation.
    pub fn clear(&self) {
        let mut state = self.inner.borrow_mut();
        state.types.clear();
        state.by_name.clear();
        state.scopes.clear();
    }
}
