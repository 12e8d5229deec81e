//! Schema registry for Trellis.
//!
//! The catalog stores data-model definitions per project: field kinds,
//! requiredness, defaults, constraints, and monotonically versioned
//! snapshots. Instance payloads are validated here against the closed
//! schema before any mutation reaches the document store.

mod field;
mod model;
mod registry;
mod types;
mod validator;

pub use field::FieldDef;
pub use model::{FieldChange, ModelDef};
pub use registry::SchemaRegistry;
pub use types::{Cardinality, FieldKind, StringConstraints};
pub use validator::InstanceValidator;
