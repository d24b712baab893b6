//! Secondary indexes for boxdb
//!
//! An index maps property values to entity ids. Entries are `(value, id)`
//! pairs kept in a copy-on-write B+ tree, so entries with equal values are
//! ordered by ascending entity id and a transaction's private copy shares
//! structure with the snapshot it started from. Null values are not indexed.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::catalog::registry::{decode_from, encode_into};
use crate::catalog::{IndexDef, IndexId, TypeTag};
use crate::error::{Error, Result};
use crate::storage::btree::CowBTree;
use crate::storage::record::EntityId;
use crate::storage::value::Value;

/// A value as ordered inside an index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey(pub Value);

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

type Entry = (IndexKey, EntityId);

const MIN_ID: EntityId = EntityId::UNASSIGNED;

fn max_id() -> EntityId {
    EntityId::new(u64::MAX)
}

/// One secondary index
#[derive(Debug, Clone)]
pub struct SecondaryIndex {
    pub id: IndexId,
    pub property: String,
    pub type_tag: TypeTag,
    pub unique: bool,
    tree: CowBTree<Entry, ()>,
}

impl SecondaryIndex {
    /// Create an empty index for a definition
    pub fn new(def: &IndexDef) -> Self {
        Self {
            id: def.id,
            property: def.property.clone(),
            type_tag: def.type_tag,
            unique: def.unique,
            tree: CowBTree::new(),
        }
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Entity holding `value`, if any; the lowest id when several do
    pub fn owner(&self, value: &Value) -> Option<EntityId> {
        let key = IndexKey(value.clone());
        self.tree
            .range(
                Bound::Included(&(key.clone(), MIN_ID)),
                Bound::Included(&(key, max_id())),
            )
            .next()
            .map(|((_, id), _)| *id)
    }

    /// Add an entry; unique indexes reject a value held by another entity
    pub fn insert(&mut self, value: &Value, id: EntityId) -> Result<()> {
        if value.is_null() {
            return Ok(());
        }
        if value.type_tag() != Some(self.type_tag) {
            return Err(Error::type_mismatch(&self.property, self.type_tag, value.type_name()));
        }
        if self.unique {
            if let Some(owner) = self.owner(value) {
                if owner != id {
                    return Err(Error::DuplicateValue {
                        property: self.property.clone(),
                        value: value.to_string(),
                    });
                }
            }
        }
        self.tree.insert((IndexKey(value.clone()), id), ());
        Ok(())
    }

    /// Remove an entry, returning whether it existed
    pub fn remove(&mut self, value: &Value, id: EntityId) -> bool {
        if value.is_null() {
            return false;
        }
        self.tree.remove(&(IndexKey(value.clone()), id)).is_some()
    }

    /// Ids of entities holding `value`, ascending
    pub fn lookup(&self, value: &Value) -> Vec<EntityId> {
        self.range_lookup(Bound::Included(value), Bound::Included(value))
    }

    /// Ids of entities whose value lies within the bounds, ordered by value
    /// and then by id
    pub fn range_lookup(&self, lower: Bound<&Value>, upper: Bound<&Value>) -> Vec<EntityId> {
        if let (Bound::Included(lo) | Bound::Excluded(lo), Bound::Included(hi) | Bound::Excluded(hi)) =
            (lower, upper)
        {
            match lo.total_cmp(hi) {
                Ordering::Greater => return Vec::new(),
                Ordering::Equal
                    if matches!(lower, Bound::Excluded(_)) || matches!(upper, Bound::Excluded(_)) =>
                {
                    return Vec::new()
                }
                _ => {}
            }
        }
        let lower = match lower {
            Bound::Included(v) => Bound::Included((IndexKey(v.clone()), MIN_ID)),
            Bound::Excluded(v) => Bound::Excluded((IndexKey(v.clone()), max_id())),
            Bound::Unbounded => Bound::Unbounded,
        };
        let upper = match upper {
            Bound::Included(v) => Bound::Included((IndexKey(v.clone()), max_id())),
            Bound::Excluded(v) => Bound::Excluded((IndexKey(v.clone()), MIN_ID)),
            Bound::Unbounded => Bound::Unbounded,
        };
        self.tree
            .range(lower.as_ref(), upper.as_ref())
            .map(|((_, id), _)| *id)
            .collect()
    }

    /// All `(value, id)` entries in index order
    pub fn entries(&self) -> impl Iterator<Item = (&Value, EntityId)> {
        self.tree.iter().map(|((key, id), _)| (&key.0, *id))
    }

    /// Serialize the entries for the index chain
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + self.len() * 16);
        buf.put_u64_le(self.len() as u64);
        for (value, id) in self.entries() {
            encode_into(value, &mut buf);
            buf.put_u64_le(id.get());
        }
        buf.to_vec()
    }

    /// Rebuild an index from its chain
    pub fn decode(def: &IndexDef, bytes: &[u8]) -> Result<Self> {
        let truncated = |_| Error::Serialization("index chain truncated".into());
        let mut index = Self::new(def);
        let mut buf = bytes;
        let count = buf.read_u64::<LittleEndian>().map_err(truncated)?;
        for _ in 0..count {
            let value = decode_from(&mut buf, def.type_tag)?;
            let id = EntityId::new(buf.read_u64::<LittleEndian>().map_err(truncated)?);
            index.tree.insert((IndexKey(value), id), ());
        }
        Ok(index)
    }
}

/// The secondary indexes of one version
#[derive(Debug, Clone, Default)]
pub struct IndexSet {
    indexes: BTreeMap<IndexId, SecondaryIndex>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an index
    pub fn add(&mut self, index: SecondaryIndex) {
        self.indexes.insert(index.id, index);
    }

    /// Drop an index
    pub fn drop_index(&mut self, id: IndexId) -> Option<SecondaryIndex> {
        self.indexes.remove(&id)
    }

    pub fn get(&self, id: IndexId) -> Result<&SecondaryIndex> {
        self.indexes
            .get(&id)
            .ok_or_else(|| Error::Internal(format!("{} is not loaded", id)))
    }

    fn get_mut(&mut self, id: IndexId) -> Result<&mut SecondaryIndex> {
        self.indexes
            .get_mut(&id)
            .ok_or_else(|| Error::Internal(format!("{} is not loaded", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SecondaryIndex> {
        self.indexes.values()
    }

    pub fn insert(&mut self, index_id: IndexId, value: &Value, id: EntityId) -> Result<()> {
        self.get_mut(index_id)?.insert(value, id)
    }

    pub fn remove(&mut self, index_id: IndexId, value: &Value, id: EntityId) -> Result<bool> {
        Ok(self.get_mut(index_id)?.remove(value, id))
    }

    pub fn lookup(&self, index_id: IndexId, value: &Value) -> Result<Vec<EntityId>> {
        Ok(self.get(index_id)?.lookup(value))
    }

    pub fn range_lookup(
        &self,
        index_id: IndexId,
        lower: Bound<&Value>,
        upper: Bound<&Value>,
    ) -> Result<Vec<EntityId>> {
        Ok(self.get(index_id)?.range_lookup(lower, upper))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TypeId;

    fn def(tag: TypeTag, unique: bool) -> IndexDef {
        IndexDef {
            id: IndexId(1),
            type_id: TypeId(1),
            property: "p".into(),
            type_tag: tag,
            unique,
        }
    }

    fn ids(raw: &[u64]) -> Vec<EntityId> {
        raw.iter().map(|&i| EntityId::new(i)).collect()
    }

    #[test]
    fn test_non_unique_lookup() {
        let mut index = SecondaryIndex::new(&def(TypeTag::Int, false));
        index.insert(&Value::Int(5), EntityId::new(3)).unwrap();
        index.insert(&Value::Int(5), EntityId::new(1)).unwrap();
        index.insert(&Value::Int(7), EntityId::new(2)).unwrap();
        index.insert(&Value::Null, EntityId::new(9)).unwrap();

        assert_eq!(index.lookup(&Value::Int(5)), ids(&[1, 3]));
        assert_eq!(index.lookup(&Value::Int(6)), ids(&[]));
        assert_eq!(index.len(), 3);

        assert!(index.remove(&Value::Int(5), EntityId::new(1)));
        assert!(!index.remove(&Value::Int(5), EntityId::new(1)));
        assert_eq!(index.lookup(&Value::Int(5)), ids(&[3]));
    }

    #[test]
    fn test_unique_rejects_other_entity() {
        let mut index = SecondaryIndex::new(&def(TypeTag::String, true));
        index.insert(&Value::String("a".into()), EntityId::new(1)).unwrap();
        // Re-inserting for the same entity is fine.
        index.insert(&Value::String("a".into()), EntityId::new(1)).unwrap();
        let err = index
            .insert(&Value::String("a".into()), EntityId::new(2))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateValue { .. }));
        assert_eq!(index.owner(&Value::String("a".into())), Some(EntityId::new(1)));
    }

    #[test]
    fn test_range_lookup_bounds() {
        let mut index = SecondaryIndex::new(&def(TypeTag::Int, false));
        for (age, id) in [(20, 1), (5, 2), (15, 3), (10, 4), (10, 5)] {
            index.insert(&Value::Int(age), EntityId::new(id)).unwrap();
        }
        let ten = Value::Int(10);
        let twenty = Value::Int(20);
        assert_eq!(
            index.range_lookup(Bound::Included(&ten), Bound::Excluded(&twenty)),
            ids(&[4, 5, 3])
        );
        assert_eq!(
            index.range_lookup(Bound::Excluded(&ten), Bound::Unbounded),
            ids(&[3, 1])
        );
        assert_eq!(
            index.range_lookup(Bound::Unbounded, Bound::Included(&ten)),
            ids(&[2, 4, 5])
        );
        assert!(index
            .range_lookup(Bound::Included(&twenty), Bound::Included(&ten))
            .is_empty());
        assert!(index
            .range_lookup(Bound::Excluded(&ten), Bound::Included(&ten))
            .is_empty());
    }

    #[test]
    fn test_float_order() {
        let mut index = SecondaryIndex::new(&def(TypeTag::Double, false));
        for (v, id) in [(1.5, 1), (-0.5, 2), (f64::INFINITY, 3), (0.0, 4)] {
            index.insert(&Value::Double(v), EntityId::new(id)).unwrap();
        }
        assert_eq!(
            index.range_lookup(Bound::Unbounded, Bound::Unbounded),
            ids(&[2, 4, 1, 3])
        );
    }

    #[test]
    fn test_rejects_wrong_type() {
        let mut index = SecondaryIndex::new(&def(TypeTag::Int, false));
        assert!(index.insert(&Value::Long(1), EntityId::new(1)).is_err());
    }

    #[test]
    fn test_codec() {
        let d = def(TypeTag::String, false);
        let mut index = SecondaryIndex::new(&d);
        index.insert(&Value::String("beta".into()), EntityId::new(2)).unwrap();
        index.insert(&Value::String("alpha".into()), EntityId::new(7)).unwrap();
        let decoded = SecondaryIndex::decode(&d, &index.encode()).unwrap();
        let entries: Vec<_> = decoded.entries().map(|(v, id)| (v.clone(), id)).collect();
        assert_eq!(
            entries,
            vec![
                (Value::String("alpha".into()), EntityId::new(7)),
                (Value::String("beta".into()), EntityId::new(2)),
            ]
        );
    }

    #[test]
    fn test_index_set() {
        let mut set = IndexSet::new();
        set.add(SecondaryIndex::new(&def(TypeTag::Int, false)));
        set.insert(IndexId(1), &Value::Int(1), EntityId::new(1)).unwrap();
        assert_eq!(set.lookup(IndexId(1), &Value::Int(1)).unwrap(), ids(&[1]));
        assert!(set.lookup(IndexId(2), &Value::Int(1)).is_err());
        assert!(set.remove(IndexId(1), &Value::Int(1), EntityId::new(1)).unwrap());
    }
}
