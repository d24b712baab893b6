//! Entity records for boxdb
//!
//! This module defines entities, their ids, and how an entity is serialized
//! into a record.
//!
//! A record is `entity_id u64 | property_count u16 | wrapped property*`, with
//! the stored properties in the catalog's record order. Records written before
//! a property was added carry a smaller count; the missing trailing properties
//! decode as null.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::catalog::registry::{decode_from, encode_checked};
use crate::catalog::{EntityType, PropertyType};
use crate::error::{Error, Result};
use crate::storage::value::Value;

/// Entity identifier
///
/// Zero means "not yet assigned".
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct EntityId(u64);

impl EntityId {
    /// The unassigned id
    pub const UNASSIGNED: EntityId = EntityId(0);

    pub fn new(id: u64) -> Self {
        EntityId(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }

    /// Check if a store has assigned this id
    pub fn is_assigned(&self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        EntityId(id)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An entity: an id plus named property values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity id, unassigned until first put
    pub id: EntityId,
    /// Property values in record order
    pub values: IndexMap<String, Value>,
}

impl Entity {
    /// Create an entity without id or values
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an entity with a given id
    pub fn with_id(id: impl Into<EntityId>) -> Self {
        Self {
            id: id.into(),
            values: IndexMap::new(),
        }
    }

    /// Set a property value
    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    /// Set a property value in place
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Get a property value; absent properties read as null
    pub fn get(&self, name: &str) -> &Value {
        const NULL: Value = Value::Null;
        self.values.get(name).unwrap_or(&NULL)
    }

    /// Read a property as a Rust value
    pub fn value<T: PropertyType>(&self, name: &str) -> Result<T> {
        T::from_value(self.get(name).clone()).map_err(|e| match e {
            Error::TypeMismatch {
                expected, found, ..
            } => Error::TypeMismatch {
                property: name.to_string(),
                expected,
                found,
            },
            other => other,
        })
    }
}

/// Serialize an entity against its type.
///
/// Values must match the declared tags exactly; a value for the id property is
/// accepted only if it equals the entity id.
pub fn encode_record(ty: &EntityType, entity: &Entity) -> Result<Vec<u8>> {
    for name in entity.values.keys() {
        let prop = ty.require_property(name)?;
        if prop.is_id {
            let given = entity.get(name);
            if given != &Value::Long(entity.id.get() as i64) {
                return Err(Error::type_mismatch(
                    name.as_str(),
                    format!("entity id {}", entity.id),
                    given,
                ));
            }
        }
    }

    let stored: Vec<_> = ty.stored_properties().collect();
    let mut buf = BytesMut::with_capacity(16 + stored.len() * 8);
    buf.put_u64_le(entity.id.get());
    buf.put_u16_le(stored.len() as u16);
    for prop in stored {
        encode_checked(
            &prop.name,
            prop.type_tag,
            prop.nullable,
            entity.get(&prop.name),
            &mut buf,
        )?;
    }
    Ok(buf.to_vec())
}

/// Read only the entity id of a record
pub fn record_entity_id(record: &[u8]) -> Result<EntityId> {
    if record.len() < 10 {
        return Err(Error::Serialization("record header truncated".into()));
    }
    let mut buf = record;
    Ok(EntityId(buf.get_u64_le()))
}

/// Deserialize a record of `ty`
pub fn decode_record(ty: &EntityType, record: &[u8]) -> Result<Entity> {
    let id = record_entity_id(record)?;
    let mut buf = &record[8..];
    let count = buf.get_u16_le() as usize;

    let mut entity = Entity::with_id(id);
    for (i, prop) in ty.stored_properties().enumerate() {
        let value = if i < count {
            decode_from(&mut buf, prop.type_tag)?
        } else {
            Value::Null
        };
        entity.values.insert(prop.name.clone(), value);
    }
    Ok(entity)
}

/// Decode one property of a record without materializing the others
pub fn decode_property(ty: &EntityType, record: &[u8], name: &str) -> Result<Value> {
    let id = record_entity_id(record)?;
    let prop = ty.require_property(name)?;
    if prop.is_id {
        return Ok(Value::Long(id.get() as i64));
    }
    let mut buf = &record[8..];
    let count = buf.get_u16_le() as usize;
    for (i, p) in ty.stored_properties().enumerate() {
        if i >= count {
            break;
        }
        let value = decode_from(&mut buf, p.type_tag)?;
        if p.name == name {
            return Ok(value);
        }
    }
    Ok(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, EntityDef, PropertyDef, Schema, TypeTag};

    fn person_type(extra: bool) -> EntityType {
        let mut def = EntityDef::new("Person")
            .id("id")
            .property(PropertyDef::new("name", TypeTag::String).not_null())
            .property(PropertyDef::new("age", TypeTag::Int));
        if extra {
            def = def.property(PropertyDef::new("email", TypeTag::String));
        }
        let catalog = Catalog::create(&Schema::new().entity(def)).unwrap();
        catalog.get_type("Person").unwrap().clone()
    }

    #[test]
    fn test_record_round_trip() {
        let ty = person_type(false);
        let entity = Entity::with_id(42).set("name", "Ada").set("age", 36);
        let record = encode_record(&ty, &entity).unwrap();

        assert_eq!(record_entity_id(&record).unwrap(), EntityId::new(42));
        let decoded = decode_record(&ty, &record).unwrap();
        assert_eq!(decoded, entity);
        assert_eq!(decode_property(&ty, &record, "age").unwrap(), Value::Int(36));
        assert_eq!(decode_property(&ty, &record, "id").unwrap(), Value::Long(42));
    }

    #[test]
    fn test_missing_values_are_null() {
        let ty = person_type(false);
        let record = encode_record(&ty, &Entity::with_id(1).set("name", "x")).unwrap();
        let decoded = decode_record(&ty, &record).unwrap();
        assert_eq!(decoded.get("age"), &Value::Null);
    }

    #[test]
    fn test_rejects_bad_values() {
        let ty = person_type(false);
        let err = encode_record(&ty, &Entity::with_id(1).set("name", "x").set("age", 3i64))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));

        let err = encode_record(&ty, &Entity::with_id(1).set("age", 3)).unwrap_err();
        assert!(matches!(err, Error::NullNotAllowed(_)));

        let err = encode_record(&ty, &Entity::with_id(1).set("name", "x").set("nick", "y"))
            .unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));

        let err = encode_record(&ty, &Entity::with_id(1).set("name", "x").set("id", 2i64))
            .unwrap_err();
        assert!(matches!(err, Error::TypeMismatch { .. }));
    }

    #[test]
    fn test_old_records_decode_new_properties_as_null() {
        let old = person_type(false);
        let new = person_type(true);
        let record = encode_record(&old, &Entity::with_id(7).set("name", "Bo").set("age", 3)).unwrap();
        let decoded = decode_record(&new, &record).unwrap();
        assert_eq!(decoded.get("age"), &Value::Int(3));
        assert_eq!(decoded.get("email"), &Value::Null);
        assert_eq!(decoded.values.len(), 3);
    }
}
