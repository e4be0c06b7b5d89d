pub mod catalog;
pub mod change;
pub mod engine;
pub mod memory;
pub mod table;

pub use catalog::{Catalog, Column, ModelSchema, OnDelete, PRIMARY_KEY, RelationColumn};
pub use engine::{Backend, FieldValues, RelationInfo, StoredValue};
pub use memory::MemoryBackend;
pub use table::{Row, Table};
