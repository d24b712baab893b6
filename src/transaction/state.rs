//! Private state of a write transaction
//!
//! Mutations go through [`TxnState`] so that the directory, the indexes, the
//! page live counts and the set of structures to persist always move
//! together.

use std::collections::BTreeSet;

use crate::catalog::{EntityType, IndexId};
use crate::error::{Error, Result};
use crate::storage::page::PageId;
use crate::storage::record::{decode_record, EntityId};
use crate::storage::record_store::{delete_record, retain_location, PageStore, RecordLocation, TxnPages};
use crate::storage::value::Value;

use super::version::{index_entries, ChainKey, Version};

#[derive(Debug, Clone)]
pub(crate) struct TxnState {
    pub version: Version,
    /// Committed pages no longer referenced
    pub freed: Vec<PageId>,
    /// Structures whose chains must be rewritten
    pub dirty: BTreeSet<ChainKey>,
}

impl TxnState {
    pub fn new(base: &Version) -> Self {
        Self {
            version: base.clone(),
            freed: Vec::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Fail with `DuplicateValue` if another entity holds one of the unique values
    pub fn check_unique(&self, ty: &EntityType, id: EntityId, entries: &[(IndexId, Value)]) -> Result<()> {
        for (index_id, value) in entries {
            let index = self.version.indexes.get(*index_id)?;
            if !index.unique {
                continue;
            }
            if let Some(owner) = index.owner(value) {
                if owner != id {
                    return Err(Error::DuplicateValue {
                        property: format!("{}.{}", ty.name, index.property),
                        value: value.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Point `id` at a freshly written record, replacing any previous one
    pub fn put(
        &mut self,
        store: &PageStore,
        pages: &TxnPages,
        ty: &EntityType,
        id: EntityId,
        location: RecordLocation,
        entries: &[(IndexId, Value)],
    ) -> Result<()> {
        if let Some(old) = self.version.location(ty.id, id) {
            self.unlink(store, pages, ty, id, old)?;
        }
        for (index_id, value) in entries {
            self.version.indexes.insert(*index_id, value, id)?;
            self.dirty.insert(ChainKey::Index(*index_id));
        }
        self.version.directory_mut(ty.id)?.insert(id, location);
        retain_location(&mut self.version.page_live, location);
        self.dirty.insert(ChainKey::Directory(ty.id));
        Ok(())
    }

    /// Remove an entity, returning where its record was
    pub fn remove(
        &mut self,
        store: &PageStore,
        pages: &TxnPages,
        ty: &EntityType,
        id: EntityId,
    ) -> Result<Option<RecordLocation>> {
        let Some(old) = self.version.location(ty.id, id) else {
            return Ok(None);
        };
        self.unlink(store, pages, ty, id, old)?;
        self.version.directory_mut(ty.id)?.remove(&id);
        self.dirty.insert(ChainKey::Directory(ty.id));
        Ok(Some(old))
    }

    /// Drop the index entries and the page reference of a stored record
    fn unlink(
        &mut self,
        store: &PageStore,
        pages: &TxnPages,
        ty: &EntityType,
        id: EntityId,
        old: RecordLocation,
    ) -> Result<()> {
        let has_index = ty.properties.iter().any(|p| p.index.is_some());
        if has_index {
            let record = store.read_record(old, Some(pages))?;
            let entity = decode_record(ty, &record)?;
            for (index_id, value) in index_entries(ty, &entity) {
                self.version.indexes.remove(index_id, &value, id)?;
                self.dirty.insert(ChainKey::Index(index_id));
            }
        }
        let freed = delete_record(store, pages, &mut self.version.page_live, old)?;
        self.freed.extend(freed);
        Ok(())
    }
}
