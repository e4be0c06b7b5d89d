use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{ColumnType, EngineError, KeySet, RelationKind, Result};

/// Name of the surrogate key every model carries.
pub const PRIMARY_KEY: &str = "id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unique: bool,
    pub primary_key: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            unique: false,
            primary_key: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    fn primary_key() -> Self {
        Self {
            name: PRIMARY_KEY.to_string(),
            column_type: ColumnType::Integer,
            nullable: false,
            unique: true,
            primary_key: true,
        }
    }
}

/// What happens to linked records of the owning side when the target
/// record is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    SetNull,
    Cascade,
    Restrict,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationColumn {
    pub name: String,
    pub target: String,
    pub kind: RelationKind,
    pub reverse: Option<String>,
    pub required: bool,
    pub on_delete: OnDelete,
}

impl RelationColumn {
    pub fn new(name: impl Into<String>, target: impl Into<String>, kind: RelationKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            reverse: None,
            required: false,
            on_delete: OnDelete::default(),
        }
    }

    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn on_delete(mut self, on_delete: OnDelete) -> Self {
        self.on_delete = on_delete;
        self
    }

    /// The declaration of the other side, if this relation names one.
    pub(crate) fn mirrored(&self, owner: &str) -> Option<RelationColumn> {
        let reverse = self.reverse.as_ref()?;
        Some(RelationColumn {
            name: reverse.clone(),
            target: owner.to_string(),
            kind: self.kind.reverse(),
            reverse: Some(self.name.clone()),
            required: false,
            on_delete: OnDelete::default(),
        })
    }
}

/// Table-level description of a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSchema {
    name: String,
    schema: Option<String>,
    columns: Vec<Column>,
    relations: Vec<RelationColumn>,
    unique_together: Vec<KeySet>,
}

impl ModelSchema {
    /// A model with only its surrogate `id` column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            schema: None,
            columns: vec![Column::primary_key()],
            relations: Vec::new(),
            unique_together: Vec::new(),
        }
    }

    pub fn in_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn column(mut self, column: Column) -> Self {
        self.columns.retain(|c| c.name != column.name);
        self.columns.push(column);
        self
    }

    pub fn unique_together<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_together
            .push(keys.into_iter().map(Into::into).collect());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn full_name(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", schema, self.name),
            None => self.name.clone(),
        }
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn relations(&self) -> &[RelationColumn] {
        &self.relations
    }

    pub fn unique_groups(&self) -> &[KeySet] {
        &self.unique_together
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn get_relation(&self, name: &str) -> Option<&RelationColumn> {
        self.relations.iter().find(|r| r.name == name)
    }

    fn has_key(&self, name: &str) -> bool {
        self.get_column(name).is_some() || self.get_relation(name).is_some()
    }

    fn validate(&self) -> Result<()> {
        for group in &self.unique_together {
            if let Some(key) = group.iter().find(|k| !self.has_key(k)) {
                return Err(EngineError::unknown_key(&self.name, key));
            }
        }
        Ok(())
    }
}

/// Model metadata only. Cloning is cheap; every change produces a new
/// catalog and leaves the old one untouched.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    models: Arc<HashMap<String, ModelSchema>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(self, schema: ModelSchema) -> Result<Self> {
        let name = schema.name().to_string();
        if self.models.contains_key(&name) {
            return Err(EngineError::ModelExists(name));
        }
        // Relations are declared through `with_relation` only.
        if !schema.relations.is_empty() {
            return Err(EngineError::Backend(format!(
                "model '{}' must be created without relations",
                name
            )));
        }

        let mut models = (*self.models).clone();
        models.insert(name, schema);
        Ok(Self {
            models: Arc::new(models),
        })
    }

    /// Adds a relation to `model`, and its mirror to the target model when
    /// a reverse name is given.
    pub fn with_relation(self, model: &str, relation: RelationColumn) -> Result<Self> {
        let owner = self.get_model(model)?;
        if owner.has_key(&relation.name) {
            return Err(EngineError::Backend(format!(
                "'{}.{}' is already defined",
                model, relation.name
            )));
        }
        let target = self.get_model(&relation.target)?;
        let mirror = relation.mirrored(model);
        if let Some(mirror) = &mirror
            && target.has_key(&mirror.name)
        {
            return Err(EngineError::Backend(format!(
                "'{}.{}' is already defined",
                target.name, mirror.name
            )));
        }
        if mirror.is_some() && relation.target == model && relation.reverse.as_deref() == Some(&relation.name) {
            return Err(EngineError::Backend(format!(
                "relation '{}.{}' cannot be its own reverse",
                model, relation.name
            )));
        }

        let mut models = (*self.models).clone();
        if let Some(mirror) = mirror
            && let Some(schema) = models.get_mut(&relation.target)
        {
            schema.relations.push(mirror);
        }
        if let Some(schema) = models.get_mut(model) {
            schema.relations.push(relation);
        }
        Ok(Self {
            models: Arc::new(models),
        })
    }

    pub fn with_unique_together(self, model: &str, keys: KeySet) -> Result<Self> {
        let mut schema = self.get_model(model)?.clone();
        schema.unique_together.push(keys);
        schema.validate()?;

        let mut models = (*self.models).clone();
        models.insert(model.to_string(), schema);
        Ok(Self {
            models: Arc::new(models),
        })
    }

    pub fn get_model(&self, name: &str) -> Result<&ModelSchema> {
        self.models
            .get(name)
            .ok_or_else(|| EngineError::ModelNotFound(name.to_string()))
    }

    pub fn model_exists(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn list_models(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Relations of every model that point at `target`, as `(model, relation)`.
    pub fn incoming(&self, target: &str) -> Vec<(&ModelSchema, &RelationColumn)> {
        let mut found: Vec<_> = self
            .models
            .values()
            .flat_map(|m| m.relations.iter().map(move |r| (m, r)))
            .filter(|(_, r)| r.target == target)
            .collect();
        found.sort_by(|a, b| (a.0.name(), &a.1.name).cmp(&(b.0.name(), &b.1.name)));
        found
    }
}
