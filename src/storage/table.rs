use std::collections::BTreeMap;

use crate::core::{EngineError, Result, Value};

use super::catalog::{ModelSchema, PRIMARY_KEY};

/// Column values of one record. Missing columns read as null.
pub type Row = BTreeMap<String, Value>;

/// Row storage of a single model, keyed by the surrogate id.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    rows: BTreeMap<i64, Row>,
    next_id: i64,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts a row, assigning the next id unless the row carries one.
    pub fn insert(&mut self, schema: &ModelSchema, mut row: Row) -> Result<i64> {
        let id = match row.get(PRIMARY_KEY) {
            Some(Value::Integer(id)) => *id,
            Some(Value::Null) | None => self.next_id,
            Some(other) => {
                return Err(EngineError::mismatch("integer id", other.type_name()));
            }
        };
        row.insert(PRIMARY_KEY.to_string(), Value::Integer(id));

        self.validate_row(schema, &row)?;
        self.check_uniqueness(schema, &row, None)?;

        self.next_id = self.next_id.max(id + 1);
        self.rows.insert(id, row);
        Ok(id)
    }

    /// Merges `changes` into the row and returns the previous row.
    pub fn update(&mut self, schema: &ModelSchema, id: i64, changes: Row) -> Result<Row> {
        let old = self.rows.get(&id).cloned().ok_or_else(|| {
            EngineError::Backend(format!("row {} of '{}' does not exist", id, self.name))
        })?;
        if let Some(new_id) = changes.get(PRIMARY_KEY)
            && *new_id != Value::Integer(id)
        {
            return Err(EngineError::ConstraintViolation(format!(
                "primary key of '{}' cannot be changed",
                self.name
            )));
        }

        let mut row = old.clone();
        row.extend(changes);
        self.validate_row(schema, &row)?;
        self.check_uniqueness(schema, &row, Some(id))?;

        self.rows.insert(id, row);
        Ok(old)
    }

    pub fn delete(&mut self, id: i64) -> Option<Row> {
        self.rows.remove(&id)
    }

    /// Puts back a row removed or changed earlier, bypassing validation.
    pub fn restore(&mut self, id: i64, row: Row) {
        self.rows.insert(id, row);
    }

    pub fn get(&self, id: i64) -> Option<&Row> {
        self.rows.get(&id)
    }

    pub fn contains(&self, id: i64) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn scan(&self) -> impl Iterator<Item = (i64, &Row)> {
        self.rows.iter().map(|(id, row)| (*id, row))
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    fn validate_row(&self, schema: &ModelSchema, row: &Row) -> Result<()> {
        for key in row.keys() {
            if schema.get_column(key).is_none() {
                return Err(EngineError::unknown_key(&self.name, key));
            }
        }
        for column in schema.columns() {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                if !column.nullable {
                    return Err(EngineError::ConstraintViolation(format!(
                        "NOT NULL constraint failed: {}.{}",
                        self.name, column.name
                    )));
                }
                continue;
            }
            if !column.column_type.accepts(value) {
                return Err(EngineError::mismatch(
                    column.column_type.to_string(),
                    value.type_name(),
                ));
            }
        }
        Ok(())
    }

    /// Unique columns and column-only unique groups. Nulls never collide.
    fn check_uniqueness(&self, schema: &ModelSchema, row: &Row, ignore_id: Option<i64>) -> Result<()> {
        let others = || {
            self.rows
                .iter()
                .filter(move |(id, _)| Some(**id) != ignore_id)
                .map(|(_, r)| r)
        };

        for column in schema.columns().iter().filter(|c| c.unique) {
            let value = row.get(&column.name).unwrap_or(&Value::Null);
            if value.is_null() {
                continue;
            }
            if others().any(|other| other.get(&column.name) == Some(value)) {
                return Err(EngineError::ConstraintViolation(format!(
                    "Unique constraint violation: column '{}.{}' already contains value {}",
                    self.name, column.name, value
                )));
            }
        }

        for group in schema.unique_groups() {
            if !group.iter().all(|k| schema.get_column(k).is_some()) {
                continue;
            }
            let values: Vec<&Value> = group
                .iter()
                .map(|k| row.get(k).unwrap_or(&Value::Null))
                .collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            let clash = others().any(|other| {
                group
                    .iter()
                    .zip(&values)
                    .all(|(k, v)| other.get(k) == Some(*v))
            });
            if clash {
                return Err(EngineError::ConstraintViolation(format!(
                    "Unique constraint violation: '{}' already has a row with ({})",
                    self.name,
                    group.iter().cloned().collect::<Vec<_>>().join(", ")
                )));
            }
        }
        Ok(())
    }
}
