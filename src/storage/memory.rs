use std::collections::{BTreeSet, HashMap, VecDeque};

use log::{debug, warn};

use super::catalog::{Catalog, ModelSchema, OnDelete, RelationColumn};
use super::change::{Change, Link};
use super::engine::{Backend, FieldValues, RelationInfo, StoredValue};
use super::table::{Row, Table};
use crate::core::{ColumnType, EngineError, KeySet, RecordRef, Result, Value};

/// One end of a relation as seen from `model`. Links are stored once per
/// relation pair, on the side whose `(model, relation)` sorts first.
struct Side {
    model: String,
    relation: String,
    own_is_from: bool,
}

impl Side {
    fn matches(&self, link: &Link) -> bool {
        link.model == self.model && link.relation == self.relation
    }

    fn own(&self, link: &Link) -> i64 {
        if self.own_is_from { link.from } else { link.to }
    }

    fn other(&self, link: &Link) -> i64 {
        if self.own_is_from { link.to } else { link.from }
    }

    fn link(&self, own: i64, other: i64) -> Link {
        let (from, to) = if self.own_is_from { (own, other) } else { (other, own) };
        Link {
            model: self.model.clone(),
            relation: self.relation.clone(),
            from,
            to,
        }
    }
}

/// In-memory record store with relations, constraints and an undo journal.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    catalog: Catalog,
    tables: HashMap<String, Table>,
    links: BTreeSet<Link>,
    journal: Option<Vec<Change>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn create_model(&mut self, schema: ModelSchema) -> Result<()> {
        let name = schema.name().to_string();
        self.catalog = self.catalog.clone().with_model(schema)?;
        self.tables.insert(name.clone(), Table::new(name.clone()));
        debug!("created model '{}'", name);
        Ok(())
    }

    /// Declares a relation on `model`. A reverse name declares the other
    /// side on the target model as well.
    pub fn relate(&mut self, model: &str, relation: RelationColumn) -> Result<()> {
        debug!(
            "relating '{}.{}' to '{}' ({})",
            model, relation.name, relation.target, relation.kind
        );
        self.catalog = self.catalog.clone().with_relation(model, relation)?;
        Ok(())
    }

    /// Declares a unique group that may mix columns and relations.
    pub fn unique_together<I, S>(&mut self, model: &str, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let keys: KeySet = keys.into_iter().map(Into::into).collect();
        self.catalog = self.catalog.clone().with_unique_together(model, keys)?;
        Ok(())
    }

    // ---- transactions -----------------------------------------------------

    pub fn begin(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Err(EngineError::Backend("transaction already active".into()));
        }
        self.journal = Some(Vec::new());
        debug!("transaction started");
        Ok(())
    }

    pub fn commit(&mut self) -> Result<()> {
        let changes = self
            .journal
            .take()
            .ok_or_else(|| EngineError::Backend("no active transaction".into()))?;
        debug!("transaction committed ({} changes)", changes.len());
        Ok(())
    }

    /// Undoes every change made since `begin`, newest first.
    pub fn rollback(&mut self) -> Result<()> {
        let changes = self
            .journal
            .take()
            .ok_or_else(|| EngineError::Backend("no active transaction".into()))?;
        debug!("rolling back {} changes", changes.len());
        for change in changes.into_iter().rev() {
            self.undo(change);
        }
        Ok(())
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    fn record(&mut self, change: Change) {
        if let Some(journal) = &mut self.journal {
            journal.push(change);
        }
    }

    fn undo(&mut self, change: Change) {
        match change {
            Change::InsertRow { model, id } => {
                if let Some(table) = self.tables.get_mut(&model) {
                    table.delete(id);
                }
            }
            Change::UpdateRow { model, id, old_row } | Change::DeleteRow { model, id, old_row } => {
                if let Some(table) = self.tables.get_mut(&model) {
                    table.restore(id, old_row);
                }
            }
            Change::AddLink(link) => {
                self.links.remove(&link);
            }
            Change::RemoveLink(link) => {
                self.links.insert(link);
            }
        }
    }

    /// Runs `op` so that a failure leaves no partial changes behind.
    fn atomic<T>(&mut self, op: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let outer = self.journal.is_some();
        let mark = match &mut self.journal {
            Some(journal) => journal.len(),
            None => {
                self.journal = Some(Vec::new());
                0
            }
        };

        let result = op(self);
        if result.is_err() {
            let tail = self
                .journal
                .as_mut()
                .map(|journal| journal.split_off(mark))
                .unwrap_or_default();
            for change in tail.into_iter().rev() {
                self.undo(change);
            }
        }
        if !outer {
            self.journal = None;
        }
        result
    }

    // ---- inspection -------------------------------------------------------

    /// Column values of a record.
    pub fn fetch(&self, record: &RecordRef) -> Result<Row> {
        self.table(&record.model)?
            .get(record.key)
            .cloned()
            .ok_or_else(|| EngineError::RecordNotFound(record.clone()))
    }

    /// Records linked to `record` through `relation`, ordered by key.
    pub fn related_records(&self, record: &RecordRef, relation: &str) -> Result<Vec<RecordRef>> {
        let target = self.relation(&record.model, relation)?.target.clone();
        if !self.table(&record.model)?.contains(record.key) {
            return Err(EngineError::RecordNotFound(record.clone()));
        }
        let mut keys = self.related(&record.model, relation, record.key)?;
        keys.sort_unstable();
        Ok(keys
            .into_iter()
            .map(|key| RecordRef::new(target.clone(), key))
            .collect())
    }

    pub fn records(&self, model: &str) -> Result<Vec<RecordRef>> {
        Ok(self
            .table(model)?
            .scan()
            .map(|(id, _)| RecordRef::new(model, id))
            .collect())
    }

    pub fn count(&self, model: &str) -> Result<usize> {
        Ok(self.table(model)?.row_count())
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    // ---- internals --------------------------------------------------------

    fn schema(&self, model: &str) -> Result<&ModelSchema> {
        self.catalog.get_model(model)
    }

    fn table(&self, model: &str) -> Result<&Table> {
        self.tables
            .get(model)
            .ok_or_else(|| EngineError::ModelNotFound(model.to_string()))
    }

    fn relation(&self, model: &str, name: &str) -> Result<&RelationColumn> {
        self.schema(model)?
            .get_relation(name)
            .ok_or_else(|| EngineError::unknown_key(model, name))
    }

    fn side(&self, model: &str, relation: &str) -> Result<Side> {
        let rel = self.relation(model, relation)?;
        let side = match &rel.reverse {
            Some(reverse) if (rel.target.as_str(), reverse.as_str()) < (model, relation) => Side {
                model: rel.target.clone(),
                relation: reverse.clone(),
                own_is_from: false,
            },
            _ => Side {
                model: model.to_string(),
                relation: relation.to_string(),
                own_is_from: true,
            },
        };
        Ok(side)
    }

    fn related(&self, model: &str, relation: &str, id: i64) -> Result<Vec<i64>> {
        let side = self.side(model, relation)?;
        Ok(self
            .links
            .iter()
            .filter(|l| side.matches(l) && side.own(l) == id)
            .map(|l| side.other(l))
            .collect())
    }

    fn remove_links_where(&mut self, pred: impl Fn(&Link) -> bool) {
        let doomed: Vec<Link> = self.links.iter().filter(|l| pred(l)).cloned().collect();
        for link in doomed {
            self.links.remove(&link);
            self.record(Change::RemoveLink(link));
        }
    }

    fn clear_links(&mut self, model: &str, relation: &str, id: i64) -> Result<()> {
        let side = self.side(model, relation)?;
        self.remove_links_where(|l| side.matches(l) && side.own(l) == id);
        Ok(())
    }

    /// Links `id` to `other`, dropping links that would break a single-valued
    /// end on either side.
    fn add_link(&mut self, model: &str, relation: &str, id: i64, other: i64) -> Result<()> {
        let kind = self.relation(model, relation)?.kind;
        let side = self.side(model, relation)?;
        if kind.is_x_to_one() {
            self.remove_links_where(|l| side.matches(l) && side.own(l) == id && side.other(l) != other);
        }
        if kind.reverse().is_x_to_one() {
            self.remove_links_where(|l| side.matches(l) && side.other(l) == other && side.own(l) != id);
        }
        let link = side.link(id, other);
        if self.links.insert(link.clone()) {
            self.record(Change::AddLink(link));
        }
        Ok(())
    }

    fn check_ref(&self, rel: &RelationColumn, record: &RecordRef) -> Result<()> {
        if record.model != rel.target {
            return Err(EngineError::mismatch(rel.target.clone(), record.model.clone()));
        }
        if !self.table(&record.model)?.contains(record.key) {
            return Err(EngineError::RecordNotFound(record.clone()));
        }
        Ok(())
    }

    /// Splits values into a column row and relation assignments, checking
    /// keys, reference targets and required relations.
    fn split_values(
        &self,
        schema: &ModelSchema,
        values: &FieldValues,
    ) -> Result<(Row, Vec<(RelationColumn, StoredValue)>)> {
        let mut row = Row::new();
        let mut relations = Vec::new();
        for (key, value) in values {
            if schema.get_column(key).is_some() {
                let value = match value {
                    StoredValue::Null => Value::Null,
                    StoredValue::Scalar(v) => v.clone(),
                    _ => return Err(EngineError::mismatch("scalar", "record reference")),
                };
                row.insert(key.clone(), value);
            } else if let Some(rel) = schema.get_relation(key) {
                match value {
                    StoredValue::Scalar(_) => {
                        return Err(EngineError::mismatch("record reference", "scalar"));
                    }
                    StoredValue::Null if rel.required => {
                        return Err(not_null(schema, key));
                    }
                    StoredValue::Refs(records) if rel.kind.is_x_to_one() && records.len() > 1 => {
                        return Err(EngineError::mismatch("single record", "several records"));
                    }
                    StoredValue::Ref(record) => self.check_ref(rel, record)?,
                    StoredValue::Refs(records) | StoredValue::ReplaceRefs(records) => {
                        for record in records {
                            self.check_ref(rel, record)?;
                        }
                    }
                    StoredValue::Null => {}
                }
                relations.push((rel.clone(), value.clone()));
            } else {
                return Err(EngineError::unknown_key(schema.name(), key));
            }
        }
        Ok((row, relations))
    }

    fn apply_relation(&mut self, model: &str, rel: &RelationColumn, id: i64, value: &StoredValue) -> Result<()> {
        match value {
            StoredValue::Null => self.clear_links(model, &rel.name, id),
            StoredValue::Ref(record) => self.add_link(model, &rel.name, id, record.key),
            StoredValue::Refs(records) => {
                for record in records {
                    self.add_link(model, &rel.name, id, record.key)?;
                }
                Ok(())
            }
            StoredValue::ReplaceRefs(records) => {
                self.clear_links(model, &rel.name, id)?;
                for record in records {
                    self.add_link(model, &rel.name, id, record.key)?;
                }
                Ok(())
            }
            StoredValue::Scalar(_) => Err(EngineError::mismatch("record reference", "scalar")),
        }
    }

    fn matches(
        &self,
        schema: &ModelSchema,
        id: i64,
        row: &Row,
        key: &str,
        expected: &StoredValue,
    ) -> Result<bool> {
        if schema.get_column(key).is_some() {
            let actual = row.get(key).unwrap_or(&Value::Null);
            return Ok(match expected {
                StoredValue::Null => actual.is_null(),
                StoredValue::Scalar(v) if v.is_null() => actual.is_null(),
                StoredValue::Scalar(v) => actual == v,
                _ => false,
            });
        }
        let rel = self.relation(schema.name(), key)?;
        let related = self.related(schema.name(), key, id)?;
        let holds = |record: &RecordRef| record.model == rel.target && related.contains(&record.key);
        Ok(match expected {
            StoredValue::Null => related.is_empty(),
            StoredValue::Ref(record) => holds(record),
            StoredValue::Refs(records) | StoredValue::ReplaceRefs(records) => {
                records.iter().all(|r| holds(r))
            }
            StoredValue::Scalar(_) => false,
        })
    }

    /// Unique groups that involve a relation, checked against stored links.
    fn check_mixed_unique(&self, schema: &ModelSchema, id: i64) -> Result<()> {
        let table = self.table(schema.name())?;
        let Some(row) = table.get(id) else {
            return Ok(());
        };
        for group in schema.unique_groups() {
            if group.iter().all(|k| schema.get_column(k).is_some()) {
                continue;
            }
            let mut criteria = FieldValues::new();
            for key in group {
                let value = if schema.get_column(key).is_some() {
                    match row.get(key) {
                        Some(v) if !v.is_null() => StoredValue::Scalar(v.clone()),
                        _ => StoredValue::Null,
                    }
                } else {
                    let target = &self.relation(schema.name(), key)?.target;
                    match self.related(schema.name(), key, id)?.as_slice() {
                        [single] => StoredValue::Ref(RecordRef::new(target.clone(), *single)),
                        _ => StoredValue::Null,
                    }
                };
                if value == StoredValue::Null {
                    criteria.clear();
                    break;
                }
                criteria.insert(key.clone(), value);
            }
            if criteria.is_empty() {
                continue;
            }
            let clash = self
                .find(schema.name(), &criteria)?
                .into_iter()
                .any(|record| record.key != id);
            if clash {
                return Err(EngineError::ConstraintViolation(format!(
                    "Unique constraint violation: '{}' already has a record with ({})",
                    schema.name(),
                    group.iter().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Records removed by deleting `record`, in deletion order. Fails when a
    /// restricting or non-nullable reference would be left dangling.
    fn plan_delete(&self, record: &RecordRef) -> Result<Vec<RecordRef>> {
        let mut doomed: Vec<RecordRef> = Vec::new();
        let mut seen: BTreeSet<RecordRef> = BTreeSet::new();
        let mut blockers: Vec<(RecordRef, String)> = Vec::new();
        let mut queue = VecDeque::from([record.clone()]);
        seen.insert(record.clone());

        while let Some(current) = queue.pop_front() {
            for (owner, rel) in self.catalog.incoming(&current.model) {
                let side = self.side(owner.name(), &rel.name)?;
                let owners: Vec<i64> = self
                    .links
                    .iter()
                    .filter(|l| side.matches(l) && side.other(l) == current.key)
                    .map(|l| side.own(l))
                    .collect();
                for id in owners {
                    let referrer = RecordRef::new(owner.name(), id);
                    match rel.on_delete {
                        OnDelete::Cascade => {
                            if seen.insert(referrer.clone()) {
                                queue.push_back(referrer);
                            }
                        }
                        OnDelete::Restrict => {
                            blockers.push((referrer, format!("{}.{}", owner.name(), rel.name)));
                        }
                        OnDelete::SetNull if rel.required && rel.kind.is_x_to_one() => {
                            blockers.push((referrer, format!("{}.{}", owner.name(), rel.name)));
                        }
                        OnDelete::SetNull => {}
                    }
                }
            }
            doomed.push(current);
        }

        if let Some((referrer, relation)) = blockers.into_iter().find(|(r, _)| !seen.contains(r)) {
            return Err(EngineError::ConstraintViolation(format!(
                "{} is still referenced by {} through '{}'",
                record, referrer, relation
            )));
        }
        Ok(doomed)
    }

    fn remove_record(&mut self, record: &RecordRef) -> Result<()> {
        let own: Vec<String> = self
            .schema(&record.model)?
            .relations()
            .iter()
            .map(|r| r.name.clone())
            .collect();
        for relation in own {
            self.clear_links(&record.model, &relation, record.key)?;
        }

        let incoming: Vec<(String, String)> = self
            .catalog
            .incoming(&record.model)
            .into_iter()
            .map(|(owner, rel)| (owner.name().to_string(), rel.name.clone()))
            .collect();
        for (owner, relation) in incoming {
            let side = self.side(&owner, &relation)?;
            self.remove_links_where(|l| side.matches(l) && side.other(l) == record.key);
        }

        let old_row = self
            .tables
            .get_mut(&record.model)
            .and_then(|t| t.delete(record.key));
        if let Some(old_row) = old_row {
            self.record(Change::DeleteRow {
                model: record.model.clone(),
                id: record.key,
                old_row,
            });
        }
        Ok(())
    }
}

fn not_null(schema: &ModelSchema, key: &str) -> EngineError {
    EngineError::ConstraintViolation(format!(
        "NOT NULL constraint failed: {}.{}",
        schema.name(),
        key
    ))
}

impl Backend for MemoryBackend {
    fn iterate_fields(&self, model: &str) -> Result<Vec<(String, ColumnType)>> {
        Ok(self
            .schema(model)?
            .columns()
            .iter()
            .map(|c| (c.name.clone(), c.column_type))
            .collect())
    }

    fn iterate_relations(&self, model: &str) -> Result<Vec<RelationInfo>> {
        Ok(self
            .schema(model)?
            .relations()
            .iter()
            .map(|r| RelationInfo {
                name: r.name.clone(),
                target_model: r.target.clone(),
                kind: r.kind,
                reverse: r.reverse.clone(),
            })
            .collect())
    }

    fn iterate_required_fields(&self, model: &str) -> Result<KeySet> {
        let schema = self.schema(model)?;
        let columns = schema
            .columns()
            .iter()
            .filter(|c| !c.nullable && !c.primary_key)
            .map(|c| c.name.clone());
        let relations = schema
            .relations()
            .iter()
            .filter(|r| r.required)
            .map(|r| r.name.clone());
        Ok(columns.chain(relations).collect())
    }

    fn iterate_unique_field_combinations(&self, model: &str) -> Result<Vec<KeySet>> {
        let schema = self.schema(model)?;
        let mut combos: Vec<KeySet> = schema
            .columns()
            .iter()
            .filter(|c| c.unique)
            .map(|c| KeySet::from([c.name.clone()]))
            .collect();
        combos.extend(schema.unique_groups().iter().cloned());
        Ok(combos)
    }

    fn get_table_fullname(&self, model: &str) -> Result<String> {
        Ok(self.schema(model)?.full_name())
    }

    fn find(&self, model: &str, criteria: &FieldValues) -> Result<Vec<RecordRef>> {
        let schema = self.schema(model)?;
        for key in criteria.keys() {
            if schema.get_column(key).is_none() && schema.get_relation(key).is_none() {
                return Err(EngineError::unknown_key(model, key));
            }
        }

        let mut found = Vec::new();
        for (id, row) in self.table(model)?.scan() {
            let mut hit = true;
            for (key, expected) in criteria {
                if !self.matches(schema, id, row, key, expected)? {
                    hit = false;
                    break;
                }
            }
            if hit {
                found.push(RecordRef::new(model, id));
            }
        }
        Ok(found)
    }

    fn create(&mut self, model: &str, values: &FieldValues) -> Result<RecordRef> {
        self.atomic(|db| db.create_record(model, values))
    }

    fn update(&mut self, record: &RecordRef, values: &FieldValues) -> Result<()> {
        self.atomic(|db| db.update_record(record, values))
    }

    fn is_unset(&self, record: &RecordRef, key: &str) -> Result<bool> {
        let row = self
            .table(&record.model)?
            .get(record.key)
            .ok_or_else(|| EngineError::RecordNotFound(record.clone()))?;
        let schema = self.schema(&record.model)?;
        if schema.get_relation(key).is_some() {
            return Ok(self.related(&record.model, key, record.key)?.is_empty());
        }
        if schema.get_column(key).is_none() {
            return Err(EngineError::unknown_key(&record.model, key));
        }
        Ok(row.get(key).map_or(true, Value::is_null))
    }

    fn delete(&mut self, record: &RecordRef) -> Result<()> {
        self.atomic(|db| db.delete_record(record))
    }
}

impl MemoryBackend {
    fn create_record(&mut self, model: &str, values: &FieldValues) -> Result<RecordRef> {
        let schema = self.schema(model)?.clone();
        let (row, relations) = self.split_values(&schema, values)?;
        for rel in schema.relations().iter().filter(|r| r.required) {
            let present = matches!(
                values.get(&rel.name),
                Some(StoredValue::Ref(_))
            ) || matches!(
                values.get(&rel.name),
                Some(StoredValue::Refs(v) | StoredValue::ReplaceRefs(v)) if !v.is_empty()
            );
            if !present {
                return Err(not_null(&schema, &rel.name));
            }
        }

        let table = self
            .tables
            .get_mut(model)
            .ok_or_else(|| EngineError::ModelNotFound(model.to_string()))?;
        let id = table.insert(&schema, row)?;
        self.record(Change::InsertRow {
            model: model.to_string(),
            id,
        });

        for (rel, value) in &relations {
            self.apply_relation(model, rel, id, value)?;
        }
        self.check_mixed_unique(&schema, id)?;

        let record = RecordRef::new(model, id);
        debug!("created {}", record);
        Ok(record)
    }

    fn update_record(&mut self, record: &RecordRef, values: &FieldValues) -> Result<()> {
        let schema = self.schema(&record.model)?.clone();
        if !self.table(&record.model)?.contains(record.key) {
            return Err(EngineError::RecordNotFound(record.clone()));
        }
        let (row, relations) = self.split_values(&schema, values)?;

        if !row.is_empty() {
            let table = self
                .tables
                .get_mut(&record.model)
                .ok_or_else(|| EngineError::ModelNotFound(record.model.clone()))?;
            let old_row = table.update(&schema, record.key, row)?;
            self.record(Change::UpdateRow {
                model: record.model.clone(),
                id: record.key,
                old_row,
            });
        }
        for (rel, value) in &relations {
            self.apply_relation(&record.model, rel, record.key, value)?;
        }
        self.check_mixed_unique(&schema, record.key)?;

        debug!("updated {}", record);
        Ok(())
    }

    fn delete_record(&mut self, record: &RecordRef) -> Result<()> {
        if !self.table(&record.model)?.contains(record.key) {
            return Err(EngineError::RecordNotFound(record.clone()));
        }
        let doomed = self.plan_delete(record)?;
        for victim in &doomed {
            if victim != record {
                warn!("cascade delete of {} caused by {}", victim, record);
            }
            self.remove_record(victim)?;
        }
        debug!("deleted {}", record);
        Ok(())
    }
}
