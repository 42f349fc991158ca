//! Schema model and reader (C1): parses a declarative entity/field/
//! relationship schema into an in-memory graph consumed by every other
//! component.

pub mod model;
pub mod reader;

pub use model::{EntityDescriptor, FieldDescriptor, FieldType, RelationshipDescriptor, Schema};
pub use reader::{parse_schema, resolve_field_type};
