//! Committed versions
//!
//! A [`Version`] is the whole logical state of the store as of one commit:
//! the catalog, one entity directory per type, the secondary indexes and the
//! live-record count of every data page. Versions are immutable once
//! published; a write transaction works on a clone, which shares all tree
//! nodes with its base until they are modified.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, EntityType, IndexId, TypeId};
use crate::error::{Error, Result};
use crate::index::{IndexSet, SecondaryIndex};
use crate::storage::btree::CowBTree;
use crate::storage::page::PageId;
use crate::storage::record::{Entity, EntityId};
use crate::storage::record_store::{retain_location, RecordLocation};
use crate::storage::value::Value;

/// A persisted structure with its own page chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChainKey {
    Directory(TypeId),
    Index(IndexId),
}

/// Entity directory of one type
pub type Directory = CowBTree<EntityId, RecordLocation>;

/// One committed (or, inside a write transaction, pending) state
#[derive(Debug, Clone)]
pub struct Version {
    /// Commit number; 0 before the first commit
    pub number: u64,
    pub catalog: Arc<Catalog>,
    pub directories: BTreeMap<TypeId, Directory>,
    pub indexes: IndexSet,
    /// Live records per data page or overflow root
    pub page_live: CowBTree<PageId, u32>,
    /// Chain pages currently holding each structure
    pub chains: BTreeMap<ChainKey, Vec<PageId>>,
    /// Chain pages holding the catalog
    pub catalog_chain: Vec<PageId>,
}

impl Version {
    /// The empty state of a new store
    pub fn empty(catalog: Catalog) -> Self {
        let mut version = Self {
            number: 0,
            catalog: Arc::new(catalog),
            directories: BTreeMap::new(),
            indexes: IndexSet::new(),
            page_live: CowBTree::new(),
            chains: BTreeMap::new(),
            catalog_chain: Vec::new(),
        };
        version.sync_structures();
        version
    }

    /// Bring directories and indexes in line with the catalog.
    ///
    /// Returns the structures created (empty) and the indexes dropped.
    pub fn sync_structures(&mut self) -> (Vec<ChainKey>, Vec<ChainKey>) {
        let mut created = Vec::new();
        for ty in self.catalog.types() {
            if !self.directories.contains_key(&ty.id) {
                self.directories.insert(ty.id, CowBTree::new());
                created.push(ChainKey::Directory(ty.id));
            }
        }
        for def in self.catalog.indexes() {
            if self.indexes.get(def.id).is_err() {
                self.indexes.add(SecondaryIndex::new(def));
                created.push(ChainKey::Index(def.id));
            }
        }

        let stale: Vec<IndexId> = self
            .indexes
            .iter()
            .map(|index| index.id)
            .filter(|id| self.catalog.index(*id).is_none())
            .collect();
        let mut dropped = Vec::new();
        for id in stale {
            self.indexes.drop_index(id);
            dropped.push(ChainKey::Index(id));
        }
        (created, dropped)
    }

    /// Directory of a type
    pub fn directory(&self, type_id: TypeId) -> Result<&Directory> {
        self.directories
            .get(&type_id)
            .ok_or_else(|| Error::Internal(format!("no directory for type {}", type_id)))
    }

    pub fn directory_mut(&mut self, type_id: TypeId) -> Result<&mut Directory> {
        self.directories
            .get_mut(&type_id)
            .ok_or_else(|| Error::Internal(format!("no directory for type {}", type_id)))
    }

    /// Location of an entity's record
    pub fn location(&self, type_id: TypeId, id: EntityId) -> Option<RecordLocation> {
        self.directories
            .get(&type_id)
            .and_then(|dir| dir.get(&id))
            .copied()
    }

    /// Number of entities of a type
    pub fn entity_count(&self, type_id: TypeId) -> usize {
        self.directories.get(&type_id).map_or(0, |dir| dir.len())
    }

    /// Rebuild page live counts from the directories
    pub fn recount_pages(&mut self) {
        let mut live = CowBTree::new();
        for dir in self.directories.values() {
            for (_, loc) in dir.iter() {
                retain_location(&mut live, *loc);
            }
        }
        self.page_live = live;
    }
}

/// Index entries an entity contributes: `(index, value)` for every indexed,
/// non-null property
pub fn index_entries(ty: &EntityType, entity: &Entity) -> Vec<(IndexId, Value)> {
    ty.properties
        .iter()
        .filter_map(|prop| {
            let index = prop.index?;
            let value = if prop.is_id {
                Value::Long(entity.id.get() as i64)
            } else {
                entity.get(&prop.name).clone()
            };
            (!value.is_null()).then_some((index, value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityDef, PropertyDef, Schema, TypeTag};

    fn catalog() -> Catalog {
        Catalog::create(
            &Schema::new().entity(
                EntityDef::new("Person")
                    .id("id")
                    .property(PropertyDef::new("name", TypeTag::String).unique())
                    .property(PropertyDef::new("age", TypeTag::Int).indexed())
                    .property(PropertyDef::new("bio", TypeTag::String)),
            ),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_version_has_all_structures() {
        let version = Version::empty(catalog());
        assert_eq!(version.directories.len(), 1);
        assert_eq!(version.indexes.iter().count(), 2);
        assert_eq!(version.entity_count(TypeId(1)), 0);
    }

    #[test]
    fn test_index_entries_skip_nulls() {
        let catalog = catalog();
        let ty = catalog.get_type("Person").unwrap();
        let entity = Entity::with_id(3).set("name", "Ann").set("bio", "x");
        let entries = index_entries(ty, &entity);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1, Value::String("Ann".into()));
    }

    #[test]
    fn test_recount_pages() {
        let mut version = Version::empty(catalog());
        let dir = version.directory_mut(TypeId(1)).unwrap();
        dir.insert(EntityId::new(1), RecordLocation::Slot { page: 5, slot: 0 });
        dir.insert(EntityId::new(2), RecordLocation::Slot { page: 5, slot: 1 });
        dir.insert(EntityId::new(3), RecordLocation::Overflow { root: 9 });
        version.recount_pages();
        assert_eq!(version.page_live.get(&5), Some(&2));
        assert_eq!(version.page_live.get(&9), Some(&1));
    }
}
