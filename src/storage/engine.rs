use std::collections::BTreeMap;

use crate::core::{ColumnType, KeySet, RecordRef, RelationKind, Result, Value};

/// A relation as reported by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationInfo {
    pub name: String,
    pub target_model: String,
    pub kind: RelationKind,
    pub reverse: Option<String>,
}

/// A value sent to or matched against a backend.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Null field, unset x-to-one relation or (on update) cleared x-to-many.
    Null,
    Scalar(Value),
    /// Single related record.
    Ref(RecordRef),
    /// Related records added to an x-to-many relation. As a criterion the
    /// relation must contain all of them.
    Refs(Vec<RecordRef>),
    /// Related records replacing the whole x-to-many relation.
    ReplaceRefs(Vec<RecordRef>),
}

pub type FieldValues = BTreeMap<String, StoredValue>;

/// Record storage the persister resolves entities against.
///
/// Model names are the `model` of an [`EntityType`](crate::schema::EntityType).
pub trait Backend {
    /// Scalar fields of a model, relation columns excluded.
    fn iterate_fields(&self, model: &str) -> Result<Vec<(String, ColumnType)>>;

    fn iterate_relations(&self, model: &str) -> Result<Vec<RelationInfo>>;

    /// Field and relation names that cannot be null.
    fn iterate_required_fields(&self, model: &str) -> Result<KeySet>;

    /// Unique and primary key combinations.
    fn iterate_unique_field_combinations(&self, model: &str) -> Result<Vec<KeySet>>;

    fn get_table_fullname(&self, model: &str) -> Result<String>;

    fn find(&self, model: &str, criteria: &FieldValues) -> Result<Vec<RecordRef>>;

    fn create(&mut self, model: &str, values: &FieldValues) -> Result<RecordRef>;

    fn update(&mut self, record: &RecordRef, values: &FieldValues) -> Result<()>;

    /// Whether a stored field is null, or a relation has no linked record.
    fn is_unset(&self, record: &RecordRef, key: &str) -> Result<bool>;

    /// Deletes a record following the backend's own on-delete rules.
    fn delete(&mut self, record: &RecordRef) -> Result<()>;
}

impl<B: Backend + ?Sized> Backend for &mut B {
    fn iterate_fields(&self, model: &str) -> Result<Vec<(String, ColumnType)>> {
        (**self).iterate_fields(model)
    }

    fn iterate_relations(&self, model: &str) -> Result<Vec<RelationInfo>> {
        (**self).iterate_relations(model)
    }

    fn iterate_required_fields(&self, model: &str) -> Result<KeySet> {
        (**self).iterate_required_fields(model)
    }

    fn iterate_unique_field_combinations(&self, model: &str) -> Result<Vec<KeySet>> {
        (**self).iterate_unique_field_combinations(model)
    }

    fn get_table_fullname(&self, model: &str) -> Result<String> {
        (**self).get_table_fullname(model)
    }

    fn find(&self, model: &str, criteria: &FieldValues) -> Result<Vec<RecordRef>> {
        (**self).find(model, criteria)
    }

    fn create(&mut self, model: &str, values: &FieldValues) -> Result<RecordRef> {
        (**self).create(model, values)
    }

    fn update(&mut self, record: &RecordRef, values: &FieldValues) -> Result<()> {
        (**self).update(record, values)
    }

    fn is_unset(&self, record: &RecordRef, key: &str) -> Result<bool> {
        (**self).is_unset(record, key)
    }

    fn delete(&mut self, record: &RecordRef) -> Result<()> {
        (**self).delete(record)
    }
}
