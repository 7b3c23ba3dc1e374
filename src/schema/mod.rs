//! Schema contracts consumed by the query compiler
//!
//! Models, properties and access contexts are owned by the schema and ACL
//! subsystems. The compiler never mutates them; it reads metadata, casts
//! values and asks for the id to slot mapping.

mod access;
mod errors;
mod model;
mod property;

pub use access::{AccessContext, AccessLevel, AclEntry, AclTarget, Principal};
pub use errors::{SchemaError, SchemaResult};
pub use model::{IndexSlot, Model, ModelDefinition, ResolvedProperty};
pub use property::{cast_date, is_object_id, Property, PropertyModifier, PropertyType};
