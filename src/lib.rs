// ============================================================================
// GraphPersist Library
// ============================================================================

//! Entity graphs with mirrored relations, scoped type configuration and a
//! persister that resolves every entity against backend records.
//!
//! # Examples
//!
//! ```
//! use graphpersist::storage::{Column, ModelSchema, RelationColumn};
//! use graphpersist::{
//!     Assign, ColumnType, Graph, MemoryBackend, Persister, RelationKind, TypeRegistry,
//! };
//!
//! # fn main() -> graphpersist::Result<()> {
//! let mut db = MemoryBackend::new();
//! db.create_model(
//!     ModelSchema::new("author").column(Column::new("name", ColumnType::String).unique()),
//! )?;
//! db.create_model(
//!     ModelSchema::new("book").column(Column::new("title", ColumnType::String).not_null()),
//! )?;
//! db.relate(
//!     "book",
//!     RelationColumn::new("author", "author", RelationKind::ManyToOne).reverse("books"),
//! )?;
//!
//! let registry = TypeRegistry::new();
//! registry.register_models(&db, &["author", "book"])?;
//!
//! let mut graph = Graph::new(&registry);
//! let book = graph.create_with(registry.find("book")?, [
//!     ("title", Assign::from("Dune")),
//!     ("author__name", Assign::from("Frank Herbert")),
//! ])?;
//!
//! let outcome = Persister::new(&mut db).persist(&mut graph, book)?;
//! assert_eq!(outcome.items, vec![book]);
//! assert_eq!(db.count("author")?, 1);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod graph;
pub mod persist;
pub mod schema;
pub mod storage;

// Re-export main types for convenience
pub use core::{
    CollectionId, ColumnType, ConfigFix, EngineError, EntityId, KeySet, PersistConfig, RecordRef,
    RelationKind, Result, Target, TypeConfig, TypeId, Value, key_set,
};
pub use graph::{Assign, EntityProxy, Graph, Node};
pub use persist::{DropReason, DroppedItem, PersistOutcome, Persister};
pub use schema::{EntityType, EntityTypeBuilder, FixTarget, Scope, TypeRegistry};
pub use storage::{Backend, MemoryBackend};
