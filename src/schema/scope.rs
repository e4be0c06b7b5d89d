use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use crate::core::{ConfigFix, EngineError, Result, TypeId};

use super::registry::TypeRegistry;

/// What a scope fix applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixTarget {
    /// One specific type.
    Type(TypeId),
    /// Every type, under any specific fix.
    AnyType,
    /// Types without a specific fix.
    DefaultOnly,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ScopeFixes {
    specific: HashMap<TypeId, ConfigFix>,
    any: Option<ConfigFix>,
    default_only: Option<ConfigFix>,
}

impl ScopeFixes {
    /// Effective fix for a base type: specific (or default-only) over any.
    fn for_type(&self, base: TypeId) -> ConfigFix {
        let upper = self.specific.get(&base).or(self.default_only.as_ref());
        match (upper, &self.any) {
            (Some(upper), Some(any)) => upper.over(any),
            (Some(upper), None) => upper.clone(),
            (None, Some(any)) => any.clone(),
            (None, None) => ConfigFix::default(),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct ScopeState {
    fixes: ScopeFixes,
    derived: HashMap<TypeId, TypeId>,
}

/// A named configuration context deriving isolated copies of types.
///
/// Deriving a type also derives every type reachable through its relations,
/// and the derived relations point at the derived targets. Derivations are
/// cached, so resolving a base type twice yields the same derived type.
#[derive(Debug, Clone)]
pub struct Scope {
    id: String,
    registry: TypeRegistry,
}

impl Scope {
    pub fn new<I>(registry: &TypeRegistry, scope_id: Option<&str>, fixes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (FixTarget, ConfigFix)>,
    {
        let id = scope_id.ok_or(EngineError::MissingScopeId)?.to_string();

        let mut scope_fixes = ScopeFixes::default();
        {
            let state = registry.inner.borrow();
            if state.scopes.contains_key(&id) {
                return Err(EngineError::DuplicateScopeId(id));
            }
            for (target, fix) in fixes {
                match target {
                    FixTarget::Type(type_id) => {
                        let ty = state.type_at(type_id)?;
                        if let Some(other) = &ty.scope {
                            return Err(EngineError::AlreadyScoped {
                                type_name: ty.name.clone(),
                                scope: other.clone(),
                            });
                        }
                        scope_fixes.specific.insert(type_id, fix);
                    }
                    FixTarget::AnyType => scope_fixes.any = Some(fix),
                    FixTarget::DefaultOnly => scope_fixes.default_only = Some(fix),
                }
            }
        }

        let eager: Vec<TypeId> = scope_fixes.specific.keys().copied().collect();
        registry.inner.borrow_mut().scopes.insert(
            id.clone(),
            ScopeState {
                fixes: scope_fixes,
                derived: HashMap::new(),
            },
        );

        let scope = Self {
            id,
            registry: registry.clone(),
        };
        for base in eager {
            scope.get(base)?;
        }
        Ok(scope)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    /// Derived counterpart of `base`. A type already derived by this scope
    /// resolves to itself.
    pub fn get(&self, base: TypeId) -> Result<TypeId> {
        derive(&self.registry, &self.id, base)
    }

    pub fn get_all(&self, bases: &[TypeId]) -> Result<Vec<TypeId>> {
        bases.iter().map(|base| self.get(*base)).collect()
    }

    pub fn get_by_name(&self, name: &str) -> Result<TypeId> {
        let base = self.registry.find(name)?;
        self.get(base)
    }
}

fn derive(registry: &TypeRegistry, scope_id: &str, base: TypeId) -> Result<TypeId> {
    let mut state = registry.inner.borrow_mut();

    let ty = Rc::clone(state.type_at(base)?);
    if let Some(owner) = &ty.scope {
        if owner == scope_id {
            return Ok(base);
        }
        return Err(EngineError::AlreadyScoped {
            type_name: ty.name.clone(),
            scope: owner.clone(),
        });
    }

    let scope = state
        .scopes
        .get(scope_id)
        .ok_or_else(|| EngineError::UnknownScope(scope_id.to_string()))?;
    if let Some(derived) = scope.derived.get(&base) {
        return Ok(*derived);
    }

    // Closure over relations of the types not derived yet.
    let mut closure = Vec::new();
    let mut seen = HashSet::new();
    let mut pending = vec![base];
    while let Some(current) = pending.pop() {
        if !seen.insert(current) || scope.derived.contains_key(&current) {
            continue;
        }
        closure.push(current);
        for def in state.type_at(current)?.relations.values() {
            pending.push(state.id_of(&def.target)?);
        }
    }

    let first = state.types.len();
    let mut names: HashMap<String, String> = scope
        .derived
        .iter()
        .map(|(base, derived)| {
            (
                state.types[base.0].name.clone(),
                state.types[derived.0].name.clone(),
            )
        })
        .collect();
    for current in &closure {
        let name = &state.types[current.0].name;
        names.insert(name.clone(), format!("{}@{}", name, scope_id));
    }

    let mut built = Vec::with_capacity(closure.len());
    for (offset, current) in closure.iter().enumerate() {
        let mut derived = (*state.types[current.0]).clone();
        derived.id = TypeId(first + offset);
        derived.name = names[&derived.name].clone();
        derived.scope = Some(scope_id.to_string());
        derived.base = Some(*current);
        for def in derived.relations.values_mut() {
            if let Some(target) = names.get(&def.target) {
                def.target = target.clone();
            }
        }
        derived.configure(&scope.fixes.for_type(*current));
        built.push(derived);
    }

    let result = TypeId(first);
    for derived in built {
        let base_id = derived.base;
        let derived_id = derived.id;
        state.by_name.insert(derived.name.clone(), derived_id);
        state.types.push(Rc::new(derived));
        if let (Some(base_id), Some(scope)) = (base_id, state.scopes.get_mut(scope_id)) {
            scope.derived.insert(base_id, derived_id);
        }
    }
    Ok(result)
}
