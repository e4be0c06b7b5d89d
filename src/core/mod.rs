pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{ConfigFix, Conversions, ConversionsFix, PersistConfig, TypeConfig};
pub use error::{EngineError, Result};
pub use types::{CollectionId, EntityId, KeySet, RecordRef, RelationKind, Target, TypeId, key_set};
pub use value::{ColumnType, Value};
