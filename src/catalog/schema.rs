//! Schema definitions for boxdb
//!
//! This module defines the schema a caller supplies when opening a store:
//! entity types and their property definitions.

use super::registry::PropertyType;
use super::types::TypeTag;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Property definition in an entity type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyDef {
    /// Property name
    pub name: String,
    /// Declared type
    #[serde(rename = "type")]
    pub type_tag: TypeTag,
    /// May the property hold null?
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    /// Is this the id property?
    #[serde(default)]
    pub id: bool,
    /// Does this property have a secondary index?
    #[serde(default)]
    pub indexed: bool,
    /// Is the secondary index unique?
    #[serde(default)]
    pub unique: bool,
}

fn default_nullable() -> bool {
    true
}

impl PropertyDef {
    /// Create a new nullable, unindexed property
    pub fn new(name: impl Into<String>, type_tag: TypeTag) -> Self {
        Self {
            name: name.into(),
            type_tag,
            nullable: true,
            id: false,
            indexed: false,
            unique: false,
        }
    }

    /// Create a property whose tag and nullability come from a Rust type
    pub fn of<T: PropertyType>(name: impl Into<String>) -> Self {
        Self::new(name, T::TYPE_TAG).nullable(T::NULLABLE)
    }

    /// Create the id property of an entity type
    pub fn id_property(name: impl Into<String>) -> Self {
        Self::new(name, TypeTag::Long).nullable(false).id(true)
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark as not nullable
    pub fn not_null(self) -> Self {
        self.nullable(false)
    }

    /// Set id flag
    pub fn id(mut self, id: bool) -> Self {
        self.id = id;
        self
    }

    /// Set indexed flag
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Set unique flag (implies indexed)
    pub fn unique(mut self) -> Self {
        self.indexed = true;
        self.unique = true;
        self
    }
}

/// Entity type definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDef {
    /// Entity type name
    pub name: String,
    /// Ordered property list
    pub properties: Vec<PropertyDef>,
}

impl EntityDef {
    /// Create an entity type with no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: Vec::new(),
        }
    }

    /// Append a property
    pub fn property(mut self, property: PropertyDef) -> Self {
        self.properties.push(property);
        self
    }

    /// Append an id property
    pub fn id(self, name: impl Into<String>) -> Self {
        self.property(PropertyDef::id_property(name))
    }

    /// Get a property by name
    pub fn get_property(&self, name: &str) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.name == name)
    }

    /// The id property, if one is declared
    pub fn id_property(&self) -> Option<&PropertyDef> {
        self.properties.iter().find(|p| p.id)
    }

    /// Check naming and flag rules for this type
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidSchema("entity type name is empty".into()));
        }

        let mut seen = HashSet::new();
        let mut ids = 0;
        for p in &self.properties {
            if p.name.trim().is_empty() {
                return Err(Error::InvalidSchema(format!(
                    "entity type '{}' has a property with an empty name",
                    self.name
                )));
            }
            if !seen.insert(p.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "duplicate property '{}' in entity type '{}'",
                    p.name, self.name
                )));
            }
            if p.unique && !p.indexed {
                return Err(Error::InvalidSchema(format!(
                    "property '{}.{}' is unique but not indexed",
                    self.name, p.name
                )));
            }
            if p.id {
                ids += 1;
                if p.type_tag != TypeTag::Long {
                    return Err(Error::InvalidSchema(format!(
                        "id property '{}.{}' must be LONG, not {}",
                        self.name, p.name, p.type_tag
                    )));
                }
                if p.indexed {
                    return Err(Error::InvalidSchema(format!(
                        "id property '{}.{}' cannot carry a secondary index",
                        self.name, p.name
                    )));
                }
            }
        }
        if ids > 1 {
            return Err(Error::InvalidSchema(format!(
                "entity type '{}' declares {} id properties",
                self.name, ids
            )));
        }
        Ok(())
    }
}

/// Store schema - the set of entity types
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    /// Entity types in declaration order
    pub entities: Vec<EntityDef>,
}

impl Schema {
    /// Create an empty schema
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entity type
    pub fn entity(mut self, entity: EntityDef) -> Self {
        self.entities.push(entity);
        self
    }

    /// Get an entity type by name
    pub fn get(&self, name: &str) -> Option<&EntityDef> {
        self.entities.iter().find(|e| e.name == name)
    }

    /// Parse a schema from JSON
    pub fn from_json_str(json: &str) -> Result<Self> {
        let schema: Schema =
            serde_json::from_str(json).map_err(|e| Error::InvalidSchema(e.to_string()))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Check every entity type and name uniqueness across types
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for entity in &self.entities {
            entity.validate()?;
            if !names.insert(entity.name.as_str()) {
                return Err(Error::InvalidSchema(format!(
                    "duplicate entity type '{}'",
                    entity.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> EntityDef {
        EntityDef::new("Person")
            .id("id")
            .property(PropertyDef::of::<String>("name").unique())
            .property(PropertyDef::of::<Option<i32>>("age").indexed())
    }

    #[test]
    fn test_builder_flags() {
        let def = person();
        let name = def.get_property("name").unwrap();
        assert!(name.indexed && name.unique && !name.nullable);
        let age = def.get_property("age").unwrap();
        assert_eq!(age.type_tag, TypeTag::Int);
        assert!(age.nullable);
        assert_eq!(def.id_property().unwrap().name, "id");
        assert!(Schema::new().entity(def).validate().is_ok());
    }

    #[test]
    fn test_rejects_duplicates() {
        let def = EntityDef::new("A")
            .property(PropertyDef::new("x", TypeTag::Int))
            .property(PropertyDef::new("x", TypeTag::Long));
        assert!(matches!(def.validate(), Err(Error::InvalidSchema(_))));

        let schema = Schema::new().entity(EntityDef::new("A")).entity(EntityDef::new("A"));
        assert!(schema.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_id() {
        let two_ids = EntityDef::new("A").id("a").id("b");
        assert!(two_ids.validate().is_err());

        let int_id = EntityDef::new("A").property(PropertyDef::new("id", TypeTag::Int).id(true));
        assert!(int_id.validate().is_err());
    }

    #[test]
    fn test_schema_from_json() {
        let schema = Schema::from_json_str(
            r#"{ "entities": [ { "name": "Note", "properties": [
                { "name": "id", "type": "Long", "id": true, "nullable": false },
                { "name": "text", "type": "String", "indexed": true }
            ] } ] }"#,
        )
        .unwrap();
        let note = schema.get("Note").unwrap();
        assert!(note.get_property("text").unwrap().nullable);
        assert!(note.get_property("text").unwrap().indexed);
    }
}
