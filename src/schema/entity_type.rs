use std::collections::BTreeMap;

use crate::core::{
    ColumnType, ConfigFix, EngineError, KeySet, RelationKind, Result, TypeConfig, TypeId,
};
use crate::storage::Backend;

/// A relation declared on an entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationDef {
    pub name: String,
    /// Name of the related entity type.
    pub target: String,
    pub kind: RelationKind,
    /// Relation on the target type that mirrors this one.
    pub reverse: Option<String>,
    /// Replace backend links on persist instead of adding to them.
    pub replace_x_to_many: bool,
}

/// What a key of an entity type refers to.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyKind<'a> {
    Field(ColumnType),
    Relation(&'a RelationDef),
}

/// A registered entity type with its effective configuration.
#[derive(Debug, Clone)]
pub struct EntityType {
    pub(crate) id: TypeId,
    pub(crate) name: String,
    pub(crate) model: String,
    pub(crate) fields: BTreeMap<String, ColumnType>,
    pub(crate) relations: BTreeMap<String, RelationDef>,
    pub(crate) required: KeySet,
    pub(crate) unique: Vec<KeySet>,
    pub(crate) config: TypeConfig,
    pub(crate) scope: Option<String>,
    pub(crate) base: Option<TypeId>,
}

impl EntityType {
    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Backend model the type persists to.
    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn fields(&self) -> &BTreeMap<String, ColumnType> {
        &self.fields
    }

    pub fn relations(&self) -> &BTreeMap<String, RelationDef> {
        &self.relations
    }

    pub fn required(&self) -> &KeySet {
        &self.required
    }

    pub fn unique(&self) -> &[KeySet] {
        &self.unique
    }

    pub fn config(&self) -> &TypeConfig {
        &self.config
    }

    /// Scope that derived this type, if any.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Type this one was derived from, if any.
    pub fn base(&self) -> Option<TypeId> {
        self.base
    }

    pub fn field(&self, name: &str) -> Option<ColumnType> {
        self.fields.get(name).copied()
    }

    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.get(name)
    }

    pub fn key_kind(&self, key: &str) -> Option<KeyKind<'_>> {
        if let Some(column) = self.fields.get(key) {
            return Some(KeyKind::Field(*column));
        }
        self.relations.get(key).map(KeyKind::Relation)
    }

    pub fn has_key(&self, key: &str) -> bool {
        self.fields.contains_key(key) || self.relations.contains_key(key)
    }

    pub(crate) fn check_key(&self, key: &str) -> Result<KeyKind<'_>> {
        self.key_kind(key)
            .ok_or_else(|| EngineError::unknown_key(&self.name, key))
    }

    /// Applies `fix` to the effective config, then adds the autoconfigured
    /// creator and getter groups the fix asks for.
    pub(crate) fn configure(&mut self, fix: &ConfigFix) {
        fix.apply(&mut self.config);

        if fix.creators_autoconfig == Some(true) {
            let creators = &mut self.config.creators;
            if fix.autoinject_creators.unwrap_or(true) {
                if creators.is_empty() && !self.required.is_empty() {
                    creators.push(self.required.clone());
                }
                for group in creators.iter_mut() {
                    group.extend(self.required.iter().cloned());
                }
            } else if !self.required.is_empty() {
                creators.push(self.required.clone());
            }
            dedup_groups(creators);
        }

        if fix.getters_autoconfig == Some(true) {
            self.config.getters.extend(self.unique.iter().cloned());
            dedup_groups(&mut self.config.getters);
        }
    }
}

/// Drops repeated groups, keeping the first occurrence.
fn dedup_groups(groups: &mut Vec<KeySet>) {
    let mut seen = Vec::with_capacity(groups.len());
    groups.retain(|group| {
        if seen.contains(group) {
            false
        } else {
            seen.push(group.clone());
            true
        }
    });
}

/// Declares an entity type before registration.
///
/// Unless configured, creators default to one group of the required keys and
/// getters default to the unique combinations. `creators_autoconfig` and
/// `getters_autoconfig` on the fix turn that off or add to configured groups.
#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    name: String,
    model: Option<String>,
    fields: BTreeMap<String, ColumnType>,
    relations: BTreeMap<String, RelationDef>,
    required: KeySet,
    unique: Vec<KeySet>,
    fix: ConfigFix,
}

impl EntityTypeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            model: None,
            fields: BTreeMap::new(),
            relations: BTreeMap::new(),
            required: KeySet::new(),
            unique: Vec::new(),
            fix: ConfigFix::default(),
        }
    }

    /// Starts from the introspected shape of a backend model. Related models
    /// are referenced by their model name.
    pub fn from_backend<B: Backend + ?Sized>(backend: &B, model: &str) -> Result<Self> {
        let mut builder = Self::new(model).model(model);
        for (name, column) in backend.iterate_fields(model)? {
            builder = builder.field(&name, column);
        }
        for info in backend.iterate_relations(model)? {
            builder = builder.relation(&info.name, &info.target_model, info.kind, info.reverse.as_deref());
        }
        builder.required = backend.iterate_required_fields(model)?;
        builder.unique = backend.iterate_unique_field_combinations(model)?;
        Ok(builder)
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }

    pub fn field(mut self, name: &str, column: ColumnType) -> Self {
        self.fields.insert(name.to_string(), column);
        self
    }

    pub fn relation(mut self, name: &str, target: &str, kind: RelationKind, reverse: Option<&str>) -> Self {
        self.relations.insert(
            name.to_string(),
            RelationDef {
                name: name.to_string(),
                target: target.to_string(),
                kind,
                reverse: reverse.map(str::to_string),
                replace_x_to_many: false,
            },
        );
        self
    }

    /// Marks an already declared x-to-many relation as replacing on persist.
    pub fn replace_x_to_many(mut self, relation: &str) -> Self {
        if let Some(def) = self.relations.get_mut(relation) {
            def.replace_x_to_many = true;
        }
        self
    }

    pub fn required<I: IntoIterator<Item = S>, S: Into<String>>(mut self, keys: I) -> Self {
        self.required.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn unique<I: IntoIterator<Item = S>, S: Into<String>>(mut self, keys: I) -> Self {
        self.unique.push(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn config(mut self, fix: ConfigFix) -> Self {
        self.fix = fix.over(&self.fix);
        self
    }

    pub(crate) fn type_name(&self) -> &str {
        &self.name
    }

    pub(crate) fn build(self, id: TypeId) -> Result<EntityType> {
        let mut ty = EntityType {
            id,
            model: self.model.unwrap_or_else(|| self.name.clone()),
            name: self.name,
            fields: self.fields,
            relations: self.relations,
            required: self.required,
            unique: self.unique,
            config: TypeConfig::default(),
            scope: None,
            base: None,
        };

        let declared = ty
            .required
            .iter()
            .chain(ty.unique.iter().flatten())
            .chain(self.fix.creators.iter().flatten().flatten())
            .chain(self.fix.getters.iter().flatten().flatten())
            .chain(self.fix.nullables.iter().flatten())
            .chain(self.fix.remove_null_fields.iter().flatten())
            .chain(self.fix.norewrite_fields.iter().flat_map(|fields| fields.keys()));
        for key in declared {
            ty.check_key(key)?;
        }
        for path in self.fix.defaults.keys() {
            let head = crate::graph::path::split_path(path);
            if let Some(first) = head.first() {
                ty.check_key(first)?;
            }
        }

        if self.fix.creators_autoconfig.is_none() && !ty.required.is_empty() {
            ty.config.creators = vec![ty.required.clone()];
        }
        if self.fix.getters_autoconfig.is_none() {
            ty.config.getters = ty.unique.clone();
        }
        ty.configure(&self.fix);
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_set;

    fn book() -> EntityTypeBuilder {
        EntityTypeBuilder::new("book")
            .field("id", ColumnType::Integer)
            .field("title", ColumnType::Text)
            .field("isbn", ColumnType::String)
            .relation("author", "author", RelationKind::ManyToOne, Some("books"))
            .required(["title", "author"])
            .unique(["id"])
            .unique(["isbn"])
    }

    #[test]
    fn test_autoconfig_creators_and_getters() {
        let ty = book().build(TypeId(0)).unwrap();
        assert_eq!(ty.config().creators, vec![key_set(["author", "title"])]);
        assert_eq!(ty.config().getters, vec![key_set(["id"]), key_set(["isbn"])]);
        assert_eq!(ty.model(), "book");
    }

    #[test]
    fn test_configured_groups_replace_autoconfig() {
        let ty = book()
            .config(ConfigFix::new().creators([key_set(["isbn"])]).getters([key_set(["title"])]))
            .build(TypeId(0))
            .unwrap();
        assert_eq!(ty.config().creators, vec![key_set(["isbn"])]);
        assert_eq!(ty.config().getters, vec![key_set(["title"])]);
    }

    #[test]
    fn test_autoinject_required_into_creators() {
        let ty = book()
            .config(
                ConfigFix::new()
                    .creators([key_set(["isbn"]), key_set(["id", "title"])])
                    .creators_autoconfig(true),
            )
            .build(TypeId(0))
            .unwrap();
        assert_eq!(
            ty.config().creators,
            vec![key_set(["author", "isbn", "title"]), key_set(["author", "id", "title"])]
        );

        // A configured group equal to the required keys stays single.
        let ty = book()
            .config(ConfigFix::new().creators([key_set(["author", "title"])]).creators_autoconfig(true))
            .build(TypeId(0))
            .unwrap();
        assert_eq!(ty.config().creators, vec![key_set(["author", "title"])]);
    }

    #[test]
    fn test_autoconfig_adds_groups_without_injecting() {
        let ty = book()
            .config(
                ConfigFix::new()
                    .creators([key_set(["isbn"])])
                    .creators_autoconfig(true)
                    .autoinject_creators(false)
                    .getters([key_set(["title"])])
                    .getters_autoconfig(true),
            )
            .build(TypeId(0))
            .unwrap();
        assert_eq!(ty.config().creators, vec![key_set(["isbn"]), key_set(["author", "title"])]);
        assert_eq!(
            ty.config().getters,
            vec![key_set(["title"]), key_set(["id"]), key_set(["isbn"])]
        );
    }

    #[test]
    fn test_autoconfig_turned_off() {
        let ty = book()
            .config(ConfigFix::new().creators_autoconfig(false).getters_autoconfig(false))
            .build(TypeId(0))
            .unwrap();
        assert!(ty.config().creators.is_empty());
        assert!(ty.config().getters.is_empty());

        // Turning autoconfig off also keeps required keys out of configured groups.
        let ty = book()
            .config(ConfigFix::new().creators([key_set(["isbn"])]).creators_autoconfig(false))
            .build(TypeId(0))
            .unwrap();
        assert_eq!(ty.config().creators, vec![key_set(["isbn"])]);
    }

    #[test]
    fn test_unknown_norewrite_key_is_rejected() {
        let err = book()
            .config(ConfigFix::new().norewrite("subtitle", Some(true)))
            .build(TypeId(0))
            .unwrap_err();
        assert_eq!(err, EngineError::unknown_key("book", "subtitle"));
    }

    #[test]
    fn test_unknown_config_key_is_rejected() {
        let err = book()
            .config(ConfigFix::new().getters([key_set(["missing"])]))
            .build(TypeId(0))
            .unwrap_err();
        assert_eq!(err, EngineError::unknown_key("book", "missing"));
    }

    #[test]
    fn test_key_kind() {
        let ty = book().build(TypeId(0)).unwrap();
        assert_eq!(ty.key_kind("title"), Some(KeyKind::Field(ColumnType::Text)));
        assert!(matches!(ty.key_kind("author"), Some(KeyKind::Relation(def)) if def.target == "author"));
        assert_eq!(ty.key_kind("nope"), None);
    }
}
