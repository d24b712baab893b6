//! Persisted catalog for boxdb
//!
//! The catalog is the committed form of a [`Schema`]: it assigns stable type,
//! property and index ids, fixes the record order of properties, and decides
//! whether a schema supplied at open is compatible with what is on disk.

use super::schema::{EntityDef, PropertyDef, Schema};
use super::types::TypeTag;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info};

/// Entity type id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

/// Secondary index id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexId(pub u32);

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

impl fmt::Display for IndexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "index#{}", self.0)
    }
}

/// A committed property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyMeta {
    /// Property id, unique within its type
    pub id: u16,
    /// Property name
    pub name: String,
    /// Declared type, immutable once committed
    pub type_tag: TypeTag,
    /// May the property hold null?
    pub nullable: bool,
    /// Is this the id property?
    pub is_id: bool,
    /// Secondary index, if any
    pub index: Option<IndexId>,
}

/// A committed entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityType {
    /// Type id
    pub id: TypeId,
    /// Type name
    pub name: String,
    /// Properties in record order
    pub properties: Vec<PropertyMeta>,
    /// Next property id
    next_property_id: u16,
}

impl EntityType {
    /// Get a property by name
    pub fn property(&self, name: &str) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// Get a property by name, failing with `UnknownProperty`
    pub fn require_property(&self, name: &str) -> Result<&PropertyMeta> {
        self.property(name).ok_or_else(|| Error::UnknownProperty {
            entity: self.name.clone(),
            property: name.to_string(),
        })
    }

    /// Properties stored in the record body, in record order
    pub fn stored_properties(&self) -> impl Iterator<Item = &PropertyMeta> {
        self.properties.iter().filter(|p| !p.is_id)
    }

    /// The id property, if declared
    pub fn id_property(&self) -> Option<&PropertyMeta> {
        self.properties.iter().find(|p| p.is_id)
    }
}

/// A committed secondary index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index id
    pub id: IndexId,
    /// Owning entity type
    pub type_id: TypeId,
    /// Indexed property name
    pub property: String,
    /// Type of indexed values
    pub type_tag: TypeTag,
    /// Does the index reject duplicate values?
    pub unique: bool,
}

/// Outcome of reconciling a supplied schema against the catalog
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaChanges {
    /// Types added by the supplied schema
    pub new_types: Vec<TypeId>,
    /// Indexes that must be built from existing records
    pub new_indexes: Vec<IndexId>,
    /// Indexes no longer declared, to be discarded
    pub dropped_indexes: Vec<IndexId>,
    /// Number of properties appended to existing types
    pub new_properties: usize,
    /// Number of properties whose nullability was relaxed
    pub relaxed_properties: usize,
}

impl SchemaChanges {
    /// True when the catalog is unchanged
    pub fn is_empty(&self) -> bool {
        *self == SchemaChanges::default()
    }
}

/// System catalog - the committed schema with assigned ids
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Catalog {
    /// Bumped each time the catalog changes
    pub schema_version: u32,
    /// Entity types ordered by id
    types: Vec<EntityType>,
    /// Index definitions ordered by id
    indexes: Vec<IndexDef>,
    next_type_id: u32,
    next_index_id: u32,
}

impl Catalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self {
            schema_version: 0,
            types: Vec::new(),
            indexes: Vec::new(),
            next_type_id: 1,
            next_index_id: 1,
        }
    }

    /// Build the catalog of a fresh store
    pub fn create(schema: &Schema) -> Result<Self> {
        schema.validate()?;
        let mut catalog = Self::new();
        for def in &schema.entities {
            catalog.add_type(def);
        }
        catalog.schema_version = 1;
        debug!(types = catalog.types.len(), indexes = catalog.indexes.len(), "created catalog");
        Ok(catalog)
    }

    fn add_type(&mut self, def: &EntityDef) -> TypeId {
        let id = TypeId(self.next_type_id);
        self.next_type_id += 1;
        let mut ty = EntityType {
            id,
            name: def.name.clone(),
            properties: Vec::new(),
            next_property_id: 1,
        };
        for p in &def.properties {
            self.add_property(&mut ty, p);
        }
        self.types.push(ty);
        id
    }

    fn add_property(&mut self, ty: &mut EntityType, def: &PropertyDef) -> Option<IndexId> {
        let index = if def.indexed {
            Some(self.add_index(ty.id, def))
        } else {
            None
        };
        ty.properties.push(PropertyMeta {
            id: ty.next_property_id,
            name: def.name.clone(),
            type_tag: def.type_tag,
            nullable: def.nullable,
            is_id: def.id,
            index,
        });
        ty.next_property_id += 1;
        index
    }

    fn add_index(&mut self, type_id: TypeId, def: &PropertyDef) -> IndexId {
        let id = IndexId(self.next_index_id);
        self.next_index_id += 1;
        self.indexes.push(IndexDef {
            id,
            type_id,
            property: def.name.clone(),
            type_tag: def.type_tag,
            unique: def.unique,
        });
        id
    }

    /// Merge a supplied schema into this catalog.
    ///
    /// New types, properties and indexes are accepted. Removing a type or a
    /// property, changing a property's type, flipping its id flag, or making
    /// a nullable property non-null fails with `SchemaMismatch`. Entity types
    /// and properties are matched by name; new properties go after the
    /// existing ones in record order.
    pub fn reconcile(&self, schema: &Schema) -> Result<(Catalog, SchemaChanges)> {
        schema.validate()?;
        let mut next = self.clone();
        let mut changes = SchemaChanges::default();

        for existing in &self.types {
            if schema.get(&existing.name).is_none() {
                return Err(Error::SchemaMismatch(format!(
                    "entity type '{}' was removed",
                    existing.name
                )));
            }
        }

        for def in &schema.entities {
            let Some(pos) = next.types.iter().position(|t| t.name == def.name) else {
                let id = next.add_type(def);
                changes.new_types.push(id);
                changes.new_indexes.extend(
                    next.indexes
                        .iter()
                        .filter(|i| i.type_id == id)
                        .map(|i| i.id),
                );
                continue;
            };
            let mut ty = next.types[pos].clone();

            for old in &ty.properties {
                if def.get_property(&old.name).is_none() {
                    return Err(Error::SchemaMismatch(format!(
                        "property '{}.{}' was removed",
                        ty.name, old.name
                    )));
                }
            }

            for p in &def.properties {
                let Some(idx) = ty.properties.iter().position(|m| m.name == p.name) else {
                    if p.id {
                        return Err(Error::SchemaMismatch(format!(
                            "id property '{}.{}' cannot be added to an existing type",
                            ty.name, p.name
                        )));
                    }
                    if !p.nullable {
                        return Err(Error::SchemaMismatch(format!(
                            "new property '{}.{}' must be nullable",
                            ty.name, p.name
                        )));
                    }
                    if let Some(index) = next.add_property(&mut ty, p) {
                        changes.new_indexes.push(index);
                    }
                    changes.new_properties += 1;
                    continue;
                };

                let meta = &ty.properties[idx];
                if meta.type_tag != p.type_tag {
                    return Err(Error::SchemaMismatch(format!(
                        "property '{}.{}' changed type from {} to {}",
                        ty.name, p.name, meta.type_tag, p.type_tag
                    )));
                }
                if meta.is_id != p.id {
                    return Err(Error::SchemaMismatch(format!(
                        "id flag of property '{}.{}' changed",
                        ty.name, p.name
                    )));
                }
                if meta.nullable && !p.nullable {
                    return Err(Error::SchemaMismatch(format!(
                        "property '{}.{}' cannot become non-null",
                        ty.name, p.name
                    )));
                }
                if !meta.nullable && p.nullable {
                    ty.properties[idx].nullable = true;
                    changes.relaxed_properties += 1;
                }

                let current = ty.properties[idx]
                    .index
                    .and_then(|id| next.index(id).map(|i| (id, i.unique)));
                match (current, p.indexed) {
                    (None, true) => {
                        let index = next.add_index(ty.id, p);
                        ty.properties[idx].index = Some(index);
                        changes.new_indexes.push(index);
                    }
                    (Some((id, _)), false) => {
                        ty.properties[idx].index = None;
                        next.indexes.retain(|i| i.id != id);
                        changes.dropped_indexes.push(id);
                    }
                    (Some((id, unique)), true) if unique != p.unique => {
                        // Uniqueness changed: rebuild under a fresh id.
                        next.indexes.retain(|i| i.id != id);
                        changes.dropped_indexes.push(id);
                        let index = next.add_index(ty.id, p);
                        ty.properties[idx].index = Some(index);
                        changes.new_indexes.push(index);
                    }
                    _ => {}
                }
            }
            next.types[pos] = ty;
        }

        if !changes.is_empty() {
            next.schema_version += 1;
            info!(
                schema_version = next.schema_version,
                new_types = changes.new_types.len(),
                new_indexes = changes.new_indexes.len(),
                dropped_indexes = changes.dropped_indexes.len(),
                new_properties = changes.new_properties,
                "schema changed"
            );
        }
        Ok((next, changes))
    }

    /// Get an entity type by name
    pub fn get_type(&self, name: &str) -> Result<&EntityType> {
        self.types
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::EntityTypeNotFound(name.to_string()))
    }

    /// Get an entity type by id
    pub fn type_by_id(&self, id: TypeId) -> Option<&EntityType> {
        self.types.iter().find(|t| t.id == id)
    }

    /// All entity types ordered by id
    pub fn types(&self) -> &[EntityType] {
        &self.types
    }

    /// Get an index by id
    pub fn index(&self, id: IndexId) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.id == id)
    }

    /// All indexes ordered by id
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    /// Indexes of one entity type
    pub fn type_indexes(&self, type_id: TypeId) -> impl Iterator<Item = &IndexDef> {
        self.indexes.iter().filter(move |i| i.type_id == type_id)
    }

    /// List all entity type names
    pub fn list_types(&self) -> Vec<String> {
        self.types.iter().map(|t| t.name.clone()).collect()
    }

    /// The schema this catalog was built from
    pub fn to_schema(&self) -> Schema {
        let mut schema = Schema::new();
        for ty in &self.types {
            let mut def = EntityDef::new(&ty.name);
            for p in &ty.properties {
                let mut prop = PropertyDef::new(&p.name, p.type_tag)
                    .nullable(p.nullable)
                    .id(p.is_id);
                if let Some(index) = p.index.and_then(|id| self.index(id)) {
                    prop = if index.unique { prop.unique() } else { prop.indexed() };
                }
                def = def.property(prop);
            }
            schema = schema.entity(def);
        }
        schema
    }

    /// Get entity type info as a formatted string (for .schema command)
    pub fn get_type_info(&self, name: &str) -> Result<String> {
        let ty = self.get_type(name)?;
        let mut info = format!("Entity: {} ({})\n", ty.name, ty.id);
        info.push_str("Properties:\n");

        for p in &ty.properties {
            let mut flags = Vec::new();
            if p.is_id {
                flags.push("ID");
            }
            if !p.nullable {
                flags.push("NOT NULL");
            }
            match p.index.and_then(|id| self.index(id)) {
                Some(index) if index.unique => flags.push("UNIQUE"),
                Some(_) => flags.push("INDEXED"),
                None => {}
            }

            let flags_str = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            info.push_str(&format!("  {} {}{}\n", p.name, p.type_tag, flags_str));
        }
        Ok(info)
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new().entity(
            EntityDef::new("Person")
                .id("id")
                .property(PropertyDef::new("name", TypeTag::String).unique())
                .property(PropertyDef::new("age", TypeTag::Int).indexed()),
        )
    }

    #[test]
    fn test_create_assigns_ids() {
        let catalog = Catalog::create(&schema()).unwrap();
        let person = catalog.get_type("Person").unwrap();
        assert_eq!(person.id, TypeId(1));
        assert_eq!(person.stored_properties().count(), 2);
        assert_eq!(catalog.indexes().len(), 2);
        let name_index = person.property("name").unwrap().index.unwrap();
        assert!(catalog.index(name_index).unwrap().unique);
        assert!(matches!(
            catalog.get_type("Car"),
            Err(Error::EntityTypeNotFound(_))
        ));
    }

    #[test]
    fn test_reconcile_same_schema_is_noop() {
        let catalog = Catalog::create(&schema()).unwrap();
        let (next, changes) = catalog.reconcile(&schema()).unwrap();
        assert!(changes.is_empty());
        assert_eq!(next, catalog);
    }

    #[test]
    fn test_reconcile_accepts_additions() {
        let catalog = Catalog::create(&schema()).unwrap();
        let extended = Schema::new()
            .entity(
                EntityDef::new("Person")
                    .property(PropertyDef::new("email", TypeTag::String).indexed())
                    .id("id")
                    .property(PropertyDef::new("age", TypeTag::Int).indexed())
                    .property(PropertyDef::new("name", TypeTag::String).unique()),
            )
            .entity(EntityDef::new("Pet").property(PropertyDef::new("kind", TypeTag::String)));
        let (next, changes) = catalog.reconcile(&extended).unwrap();
        assert_eq!(changes.new_types.len(), 1);
        assert_eq!(changes.new_indexes.len(), 1);
        assert_eq!(changes.new_properties, 1);
        assert_eq!(next.schema_version, catalog.schema_version + 1);

        // Record order keeps existing properties first.
        let names: Vec<_> = next
            .get_type("Person")
            .unwrap()
            .properties
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["id", "name", "age", "email"]);
    }

    #[test]
    fn test_reconcile_rejects_incompatible_changes() {
        let catalog = Catalog::create(&schema()).unwrap();

        let retyped = Schema::new().entity(
            EntityDef::new("Person")
                .id("id")
                .property(PropertyDef::new("name", TypeTag::String).unique())
                .property(PropertyDef::new("age", TypeTag::Long).indexed()),
        );
        assert!(matches!(catalog.reconcile(&retyped), Err(Error::SchemaMismatch(_))));

        let removed = Schema::new().entity(
            EntityDef::new("Person")
                .id("id")
                .property(PropertyDef::new("name", TypeTag::String).unique()),
        );
        assert!(matches!(catalog.reconcile(&removed), Err(Error::SchemaMismatch(_))));

        let no_type = Schema::new();
        assert!(matches!(catalog.reconcile(&no_type), Err(Error::SchemaMismatch(_))));
    }

    #[test]
    fn test_reconcile_drops_index() {
        let catalog = Catalog::create(&schema()).unwrap();
        let unindexed = Schema::new().entity(
            EntityDef::new("Person")
                .id("id")
                .property(PropertyDef::new("name", TypeTag::String).unique())
                .property(PropertyDef::new("age", TypeTag::Int)),
        );
        let (next, changes) = catalog.reconcile(&unindexed).unwrap();
        assert_eq!(changes.dropped_indexes.len(), 1);
        assert_eq!(next.indexes().len(), 1);
        assert!(next.get_type("Person").unwrap().property("age").unwrap().index.is_none());
    }

    #[test]
    fn test_round_trip_to_schema() {
        let catalog = Catalog::create(&schema()).unwrap();
        assert_eq!(catalog.to_schema(), schema());
        let json = serde_json::to_string(&catalog).unwrap();
        let back: Catalog = serde_json::from_str(&json).unwrap();
        assert_eq!(back, catalog);
    }
}
