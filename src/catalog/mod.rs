//! Catalog module
//!
//! This module contains the type registry, schema definitions, and the
//! persisted catalog.

pub mod catalog;
pub mod registry;
pub mod schema;
pub mod types;

pub use catalog::{Catalog, EntityType, IndexDef, IndexId, PropertyMeta, SchemaChanges, TypeId};
pub use registry::{decode, encode, type_of, Date, PropertyType};
pub use schema::{EntityDef, PropertyDef, Schema};
pub use types::TypeTag;
