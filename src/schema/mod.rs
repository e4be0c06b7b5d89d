pub mod entity_type;
pub mod registry;
pub mod scope;

pub use entity_type::{EntityType, EntityTypeBuilder, KeyKind, RelationDef};
pub use registry::TypeRegistry;
pub use scope::{FixTarget, Scope};
