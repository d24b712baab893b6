//! Version persistence
//!
//! A commit writes, in order: the new data and overflow pages, a fresh chain
//! for every directory or index it touched, and a fresh catalog chain. Only
//! after those are synced is the header page for the new version written.
//! Header pages 0 and 1 alternate, so the previous header stays intact until
//! the new one is complete; opening a store picks the valid header with the
//! highest version.
//!
//! The catalog chain holds [`StoreMeta`] as JSON. Directory and index chains
//! use the binary codecs of their modules.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::catalog::Catalog;
use crate::config::{MAX_PAGE_SIZE, MIN_PAGE_SIZE};
use crate::error::{Error, Result};
use crate::index::{IndexSet, SecondaryIndex};
use crate::storage::btree::CowBTree;
use crate::storage::chain::{build_chain, chain_pages_needed, read_chain};
use crate::storage::page::{FileHeader, Page, PageId, PageType, FORMAT_VERSION};
use crate::storage::pager::Pager;
use crate::storage::record_store::{decode_directory, encode_directory, PageStore};

use super::state::TxnState;
use super::version::{ChainKey, Version};

/// Contents of the catalog chain
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct StoreMeta<'a> {
    pub catalog: Cow<'a, Catalog>,
    /// Next entity id the sequence hands out
    pub next_entity_id: u64,
    /// Root page of every directory and index chain
    pub chains: Vec<(ChainKey, PageId)>,
    /// Pages not referenced by this version
    pub free_pages: Vec<PageId>,
}

/// A version read back from disk
#[derive(Debug)]
pub(crate) struct Loaded {
    pub version: Version,
    pub next_entity_id: u64,
    pub free_pages: Vec<PageId>,
}

fn chain_type(key: ChainKey) -> PageType {
    match key {
        ChainKey::Directory(_) => PageType::Directory,
        ChainKey::Index(_) => PageType::Index,
    }
}

/// Find the newest valid header page and adopt its page size.
///
/// Returns `None` for a file that never received a header.
pub(crate) fn locate_header(pager: &mut Pager) -> Result<Option<FileHeader>> {
    let raw = pager.read_prefix(2 * MAX_PAGE_SIZE)?;
    if raw.iter().all(|b| *b == 0) {
        return Ok(None);
    }

    let mut sizes: Vec<usize> = FileHeader::peek_page_size(&raw).into_iter().collect();
    let mut size = MIN_PAGE_SIZE;
    while size <= MAX_PAGE_SIZE {
        if !sizes.contains(&size) {
            sizes.push(size);
        }
        size *= 2;
    }

    for size in sizes {
        if !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) || !size.is_power_of_two() {
            continue;
        }
        pager.set_page_size(size);
        let newest = [0, 1]
            .into_iter()
            .filter_map(|slot| pager.read_page(slot).ok())
            .filter_map(|page| FileHeader::from_page(&page).ok())
            .filter(|header| header.page_size as usize == size)
            .max_by_key(|header| header.version);
        if let Some(header) = newest {
            debug!(
                version = header.version,
                page_size = size,
                page_count = header.page_count,
                "found header"
            );
            return Ok(Some(header));
        }
    }
    warn!("no valid header page");
    Err(Error::CorruptPage(0))
}

/// Read the version a header publishes
pub(crate) fn load(store: &PageStore, header: &FileHeader) -> Result<Loaded> {
    let (bytes, catalog_chain) =
        read_chain(header.catalog_root, PageType::Catalog, |id| store.page(id))?;
    let meta: StoreMeta<'static> = serde_json::from_slice(&bytes)?;

    let mut version = Version {
        number: header.version,
        catalog: Arc::new(meta.catalog.into_owned()),
        directories: BTreeMap::new(),
        indexes: IndexSet::new(),
        page_live: CowBTree::new(),
        chains: BTreeMap::new(),
        catalog_chain,
    };

    for (key, root) in meta.chains {
        let (bytes, ids) = read_chain(root, chain_type(key), |id| store.page(id))?;
        match key {
            ChainKey::Directory(type_id) => {
                version.directories.insert(type_id, decode_directory(&bytes)?);
            }
            ChainKey::Index(index_id) => {
                let def = version.catalog.index(index_id).ok_or_else(|| {
                    Error::Serialization(format!("{} has a chain but no definition", index_id))
                })?;
                version.indexes.add(SecondaryIndex::decode(def, &bytes)?);
            }
        }
        version.chains.insert(key, ids);
    }

    let (missing, stale) = version.sync_structures();
    if !missing.is_empty() || !stale.is_empty() {
        return Err(Error::Serialization(
            "catalog and stored structures disagree".into(),
        ));
    }
    version.recount_pages();

    Ok(Loaded {
        version,
        next_entity_id: meta.next_entity_id,
        free_pages: meta.free_pages,
    })
}

/// Write everything version `number` needs except its header.
///
/// Every page id this commit ends up using is pushed to `used`, so the caller
/// can hand them back to the allocator if writing fails.
pub(crate) fn write_version<F>(
    store: &PageStore,
    state: &mut TxnState,
    kept: Vec<Page>,
    number: u64,
    next_entity_id: u64,
    mut alloc: F,
    used: &mut Vec<PageId>,
) -> Result<FileHeader>
where
    F: FnMut() -> Result<PageId>,
{
    let page_size = store.page_size();
    used.extend(kept.iter().map(Page::page_id));
    let records = store.write_pages(kept, number)?;

    let dirty = std::mem::take(&mut state.dirty);
    let chains_written = dirty.len();
    for key in dirty {
        let payload = match key {
            ChainKey::Directory(type_id) => Some(encode_directory(state.version.directory(type_id)?)?),
            ChainKey::Index(index_id) => state.version.indexes.get(index_id).ok().map(|i| i.encode()),
        };
        let old = match payload {
            Some(payload) => {
                let mut ids = Vec::new();
                for _ in 0..chain_pages_needed(payload.len(), page_size) {
                    let id = alloc()?;
                    used.push(id);
                    ids.push(id);
                }
                store.write_pages(build_chain(&ids, chain_type(key), &payload, page_size)?, number)?;
                state.version.chains.insert(key, ids)
            }
            None => state.version.chains.remove(&key),
        };
        state.freed.extend(old.unwrap_or_default());
    }

    state.freed.append(&mut state.version.catalog_chain);
    let chains: Vec<(ChainKey, PageId)> = state
        .version
        .chains
        .iter()
        .filter_map(|(key, ids)| ids.first().map(|root| (*key, *root)))
        .collect();

    let mut catalog_ids: Vec<PageId> = Vec::new();
    loop {
        let committed: HashSet<PageId> = used.iter().copied().collect();
        let meta = StoreMeta {
            catalog: Cow::Borrowed(&*state.version.catalog),
            next_entity_id,
            chains: chains.clone(),
            free_pages: store.allocator().persisted_free(&committed, &state.freed),
        };
        let payload = serde_json::to_vec(&meta)?;
        let needed = chain_pages_needed(payload.len(), page_size);
        if catalog_ids.len() >= needed {
            store.write_pages(build_chain(&catalog_ids, PageType::Catalog, &payload, page_size)?, number)?;
            break;
        }
        while catalog_ids.len() < needed {
            let id = alloc()?;
            used.push(id);
            catalog_ids.push(id);
        }
    }

    let catalog_root = catalog_ids[0];
    state.version.catalog_chain = catalog_ids;
    debug!(version = number, records, chains_written, "wrote version pages");

    Ok(FileHeader {
        format_version: FORMAT_VERSION,
        page_size: page_size as u32,
        schema_version: state.version.catalog.schema_version,
        version: number,
        catalog_root,
        page_count: store.allocator().page_count(),
    })
}

/// Write the header page that makes a version current
pub(crate) fn publish_header(store: &PageStore, header: &FileHeader, sync: bool) -> Result<()> {
    let page = header.to_page(FileHeader::slot_for(header.version));
    store.pager().write_page(&page)?;
    if sync {
        store.sync()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityDef, IndexId, PropertyDef, Schema, TypeId, TypeTag};
    use crate::storage::record_store::Allocator;

    fn catalog() -> Catalog {
        Catalog::create(
            &Schema::new().entity(
                EntityDef::new("Note")
                    .id("id")
                    .property(PropertyDef::new("title", TypeTag::String).indexed()),
            ),
        )
        .unwrap()
    }

    fn write(store: &PageStore, state: &mut TxnState, number: u64) -> FileHeader {
        let mut used = Vec::new();
        let header = write_version(store, state, Vec::new(), number, 1, || store.allocate(None), &mut used)
            .unwrap();
        store.allocator().commit(number, used, std::mem::take(&mut state.freed));
        publish_header(store, &header, true).unwrap();
        header
    }

    #[test]
    fn test_write_and_load_version() {
        let store = PageStore::new(Pager::memory(1024), 16, Allocator::new(2, 100, []));
        let mut state = TxnState::new(&Version::empty(catalog()));
        state.dirty.insert(ChainKey::Directory(TypeId(1)));
        state.dirty.insert(ChainKey::Index(IndexId(1)));

        let header = write(&store, &mut state, 1);
        assert_eq!(header.version, 1);

        let loaded = load(&store, &header).unwrap();
        assert_eq!(loaded.version.number, 1);
        assert_eq!(loaded.version.directories.len(), 1);
        assert_eq!(loaded.version.indexes.iter().count(), 1);
        assert_eq!(loaded.next_entity_id, 1);
        assert_eq!(loaded.version.chains, state.version.chains);
    }

    #[test]
    fn test_rewriting_frees_old_chains() {
        let store = PageStore::new(Pager::memory(1024), 16, Allocator::new(2, 100, []));
        let mut state = TxnState::new(&Version::empty(catalog()));
        state.dirty.insert(ChainKey::Directory(TypeId(1)));
        state.dirty.insert(ChainKey::Index(IndexId(1)));
        write(&store, &mut state, 1);
        let first_chains = state.version.chains.clone();

        state.dirty.insert(ChainKey::Directory(TypeId(1)));
        let header = write(&store, &mut state, 2);
        let loaded = load(&store, &header).unwrap();

        let old_dir = &first_chains[&ChainKey::Directory(TypeId(1))];
        assert!(loaded.free_pages.contains(&old_dir[0]));
        assert_eq!(
            loaded.version.chains[&ChainKey::Index(IndexId(1))],
            first_chains[&ChainKey::Index(IndexId(1))]
        );
    }

    #[test]
    fn test_locate_header_prefers_newest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let pager = Pager::open(&path, 2048).unwrap();
        let store = PageStore::new(pager, 16, Allocator::new(2, 100, []));
        let mut state = TxnState::new(&Version::empty(catalog()));
        state.dirty.insert(ChainKey::Directory(TypeId(1)));
        state.dirty.insert(ChainKey::Index(IndexId(1)));
        write(&store, &mut state, 1);
        write(&store, &mut state, 2);
        drop(store);

        // Reopen with a different default page size: the header wins.
        let mut pager = Pager::open(&path, 4096).unwrap();
        let header = locate_header(&mut pager).unwrap().unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(pager.page_size(), 2048);
    }

    #[test]
    fn test_locate_header_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut pager = Pager::open(dir.path().join("data"), 4096).unwrap();
        assert!(locate_header(&mut pager).unwrap().is_none());
    }
}
