//! Record store for boxdb
//!
//! This module places records into pages and tracks which pages are free.
//!
//! Placement is append-only: a write transaction fills pages it allocated
//! itself and never touches a committed page, so a [`RecordLocation`] seen
//! by an older snapshot stays readable until that snapshot is gone. Deleting
//! a record only drops its reference; the page is freed once its live count
//! reaches zero, and reused once no snapshot older than the freeing commit
//! remains.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};

use super::btree::CowBTree;
use super::cache::{CacheStats, PageCache};
use super::chain::{build_chain, chain_page_ids, chain_pages_needed, read_chain};
use super::page::{max_inline_record, Page, PageId, PageType};
use super::pager::Pager;
use super::record::EntityId;
use crate::catalog::TypeId;
use crate::error::{Error, Result};

/// Where a record lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordLocation {
    /// A slot in a data page
    Slot { page: PageId, slot: u16 },
    /// An overflow chain starting at `root`
    Overflow { root: PageId },
}

impl RecordLocation {
    /// Page whose live count covers this record
    pub fn page(&self) -> PageId {
        match self {
            RecordLocation::Slot { page, .. } => *page,
            RecordLocation::Overflow { root } => *root,
        }
    }
}

impl fmt::Display for RecordLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordLocation::Slot { page, slot } => write!(f, "{}:{}", page, slot),
            RecordLocation::Overflow { root } => write!(f, "overflow@{}", root),
        }
    }
}

/// Prefix a record with the type id it belongs to
pub fn slot_payload(type_id: TypeId, record: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + record.len());
    payload.extend_from_slice(&type_id.0.to_le_bytes());
    payload.extend_from_slice(record);
    payload
}

/// Split a stored payload into its type id and record
pub fn split_slot_payload(payload: &[u8]) -> Result<(TypeId, &[u8])> {
    let mut buf = payload;
    let type_id = buf
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::Serialization("record payload truncated".into()))?;
    Ok((TypeId(type_id), buf))
}

// ========== Page allocation ==========

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub page_count: u32,
    pub max_pages: u32,
    pub free: usize,
    pub pending: usize,
    pub in_flight: usize,
}

/// Free-page bookkeeping
#[derive(Debug)]
pub struct Allocator {
    /// Pages ready for reuse
    free: BTreeSet<PageId>,
    /// Pages freed by a commit, keyed by that commit's version
    pending: Vec<(u64, Vec<PageId>)>,
    /// Pages handed to transactions that have not committed yet
    in_flight: HashSet<PageId>,
    /// Pages in the file
    page_count: u32,
    max_pages: u32,
}

impl Allocator {
    pub fn new(page_count: u32, max_pages: u32, free: impl IntoIterator<Item = PageId>) -> Self {
        Self {
            free: free.into_iter().collect(),
            pending: Vec::new(),
            in_flight: HashSet::new(),
            page_count,
            max_pages,
        }
    }

    /// Hand out a page: reuse a free one, reclaim, or grow the file.
    ///
    /// `oldest_live` is the version of the oldest snapshot still open.
    pub fn allocate(&mut self, oldest_live: Option<u64>) -> Result<PageId> {
        if self.free.is_empty() {
            self.reclaim(oldest_live);
        }
        let id = match self.free.pop_first() {
            Some(id) => id,
            None if self.page_count < self.max_pages => {
                self.page_count += 1;
                self.page_count - 1
            }
            None => return Err(Error::StoreFull(self.page_count)),
        };
        self.in_flight.insert(id);
        Ok(id)
    }

    /// Move pages whose freeing commit no live snapshot predates into the free set
    pub fn reclaim(&mut self, oldest_live: Option<u64>) -> usize {
        let mut reclaimed = 0;
        let free = &mut self.free;
        self.pending.retain(|(version, ids)| {
            if oldest_live.map_or(true, |oldest| oldest >= *version) {
                reclaimed += ids.len();
                free.extend(ids.iter().copied());
                false
            } else {
                true
            }
        });
        if reclaimed > 0 {
            debug!(reclaimed, ?oldest_live, "reclaimed pages");
        }
        reclaimed
    }

    /// Return pages that never became part of a committed version
    pub fn release(&mut self, ids: impl IntoIterator<Item = PageId>) {
        for id in ids {
            if self.in_flight.remove(&id) {
                self.free.insert(id);
            }
        }
    }

    /// Record a commit: `used` pages are now committed, `freed` pages wait
    /// for older snapshots to close
    pub fn commit(&mut self, version: u64, used: impl IntoIterator<Item = PageId>, freed: Vec<PageId>) {
        for id in used {
            self.in_flight.remove(&id);
        }
        if !freed.is_empty() {
            self.pending.push((version, freed));
        }
    }

    /// Pages that are free once the store is reopened: everything not part
    /// of the version being published
    pub fn persisted_free(&self, committed: &HashSet<PageId>, freed: &[PageId]) -> Vec<PageId> {
        let mut ids: BTreeSet<PageId> = self.free.iter().copied().collect();
        ids.extend(self.pending.iter().flat_map(|(_, ids)| ids.iter().copied()));
        ids.extend(self.in_flight.iter().copied());
        ids.extend(freed.iter().copied());
        ids.retain(|id| !committed.contains(id));
        ids.into_iter().collect()
    }

    /// Number of pages in the file
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            page_count: self.page_count,
            max_pages: self.max_pages,
            free: self.free.len(),
            pending: self.pending.iter().map(|(_, ids)| ids.len()).sum(),
            in_flight: self.in_flight.len(),
        }
    }
}

// ========== Shared page store ==========

/// Committed pages, shared by all transactions
#[derive(Debug)]
pub struct PageStore {
    pager: Pager,
    cache: PageCache,
    allocator: Mutex<Allocator>,
}

impl PageStore {
    pub fn new(pager: Pager, cache_pages: usize, allocator: Allocator) -> Self {
        Self {
            pager,
            cache: PageCache::new(cache_pages),
            allocator: Mutex::new(allocator),
        }
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    pub fn pager(&self) -> &Pager {
        &self.pager
    }

    /// Lock the allocator
    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Fetch a committed page
    pub fn page(&self, page_id: PageId) -> Result<Arc<Page>> {
        if let Some(page) = self.cache.get(page_id) {
            return Ok(page);
        }
        match self.pager.read_page(page_id) {
            Ok(page) => {
                let page = Arc::new(page);
                self.cache.insert(page.clone());
                Ok(page)
            }
            Err(Error::CorruptPage(id)) => {
                warn!(page_id = id, "page failed verification");
                Err(Error::CorruptPage(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Allocate a page id
    pub fn allocate(&self, oldest_live: Option<u64>) -> Result<PageId> {
        let id = self.allocator.lock().allocate(oldest_live)?;
        self.cache.invalidate(id);
        Ok(id)
    }

    /// Seal and write pages as part of `version`
    pub fn write_pages(&self, pages: impl IntoIterator<Item = Page>, version: u64) -> Result<usize> {
        let mut written = 0;
        for mut page in pages {
            page.set_version(version);
            page.seal();
            self.pager.write_page(&page)?;
            self.cache.insert(Arc::new(page));
            written += 1;
        }
        Ok(written)
    }

    pub fn sync(&self) -> Result<()> {
        self.pager.sync()
    }

    /// Read the record at `loc`, looking at a transaction's own pages first
    pub fn read_record(&self, loc: RecordLocation, fresh: Option<&TxnPages>) -> Result<Vec<u8>> {
        let fetch = |id: PageId| -> Result<Arc<Page>> {
            match fresh.and_then(|f| f.page(id)) {
                Some(page) => Ok(Arc::new(page.clone())),
                None => self.page(id),
            }
        };
        let payload = match loc {
            RecordLocation::Slot { page, slot } => {
                let record = match fresh.and_then(|f| f.page(page)) {
                    Some(p) => p.record(slot).map(<[u8]>::to_vec),
                    None => self.page(page)?.record(slot).map(<[u8]>::to_vec),
                };
                record.ok_or(Error::CorruptPage(page))?
            }
            RecordLocation::Overflow { root } => read_chain(root, PageType::Overflow, fetch)?.0,
        };
        let (_, record) = split_slot_payload(&payload)?;
        Ok(record.to_vec())
    }

    /// Page ids of the overflow chain starting at `root`
    pub fn overflow_pages(&self, root: PageId, fresh: Option<&TxnPages>) -> Result<Vec<PageId>> {
        if let Some(ids) = fresh.and_then(|f| f.chains.get(&root)) {
            return Ok(ids.clone());
        }
        chain_page_ids(root, PageType::Overflow, |id| self.page(id))
    }
}

// ========== Transaction-private pages ==========

/// Pages allocated by one write transaction
#[derive(Debug, Default)]
pub struct TxnPages {
    fresh: BTreeMap<PageId, Page>,
    /// Data page currently being filled
    fill: Option<PageId>,
    /// Overflow roots and their chain pages
    chains: BTreeMap<PageId, Vec<PageId>>,
}

impl TxnPages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh page of `page_type`
    pub fn allocate<F>(&mut self, page_type: PageType, page_size: usize, alloc: &mut F) -> Result<PageId>
    where
        F: FnMut() -> Result<PageId>,
    {
        let id = alloc()?;
        self.fresh.insert(id, Page::new(id, page_type, page_size));
        Ok(id)
    }

    /// Store a record of `type_id` and return its location
    pub fn write_record<F>(
        &mut self,
        page_size: usize,
        type_id: TypeId,
        record: &[u8],
        mut alloc: F,
    ) -> Result<RecordLocation>
    where
        F: FnMut() -> Result<PageId>,
    {
        let payload = slot_payload(type_id, record);

        if payload.len() > max_inline_record(page_size) {
            let count = chain_pages_needed(payload.len(), page_size);
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                match alloc() {
                    Ok(id) => ids.push(id),
                    Err(e) => {
                        // Keep partial chains visible to abort so they are released.
                        for id in ids {
                            self.fresh.insert(id, Page::new(id, PageType::Free, page_size));
                        }
                        return Err(e);
                    }
                }
            }
            for page in build_chain(&ids, PageType::Overflow, &payload, page_size)? {
                self.fresh.insert(page.page_id(), page);
            }
            let root = ids[0];
            self.chains.insert(root, ids);
            return Ok(RecordLocation::Overflow { root });
        }

        if let Some(id) = self.fill {
            if let Some(page) = self.fresh.get_mut(&id) {
                if let Some(slot) = page.insert_record(&payload) {
                    return Ok(RecordLocation::Slot { page: id, slot });
                }
            }
        }
        let id = self.allocate(PageType::Data, page_size, &mut alloc)?;
        self.fill = Some(id);
        let slot = self
            .fresh
            .get_mut(&id)
            .and_then(|page| page.insert_record(&payload))
            .ok_or_else(|| Error::Internal(format!("record does not fit empty page {}", id)))?;
        Ok(RecordLocation::Slot { page: id, slot })
    }

    /// A page allocated by this transaction
    pub fn page(&self, id: PageId) -> Option<&Page> {
        self.fresh.get(&id)
    }

    pub fn is_fresh(&self, id: PageId) -> bool {
        self.fresh.contains_key(&id)
    }

    /// Number of pages allocated so far
    pub fn len(&self) -> usize {
        self.fresh.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fresh.is_empty()
    }

    /// Split into pages still referenced by `page_live` and page ids that
    /// can go straight back to the allocator
    pub fn finish(self, page_live: &CowBTree<PageId, u32>) -> (Vec<Page>, Vec<PageId>) {
        let mut referenced: HashSet<PageId> = HashSet::new();
        for &id in self.fresh.keys() {
            if page_live.contains_key(&id) {
                match self.chains.get(&id) {
                    Some(chain) => referenced.extend(chain.iter().copied()),
                    None => {
                        referenced.insert(id);
                    }
                }
            }
        }
        let mut keep = Vec::new();
        let mut unused = Vec::new();
        for (id, page) in self.fresh {
            if referenced.contains(&id) {
                keep.push(page);
            } else {
                unused.push(id);
            }
        }
        (keep, unused)
    }

    /// All allocated page ids, used when the transaction aborts
    pub fn page_ids(&self) -> Vec<PageId> {
        self.fresh.keys().copied().collect()
    }
}

// ========== Live counts ==========

/// Count a new reference to `loc`
pub fn retain_location(page_live: &mut CowBTree<PageId, u32>, loc: RecordLocation) {
    let page = loc.page();
    let count = page_live.get(&page).copied().unwrap_or(0);
    page_live.insert(page, count + 1);
}

/// Drop a reference to `loc`, returning the committed pages that became
/// unreferenced
pub fn delete_record(
    store: &PageStore,
    fresh: &TxnPages,
    page_live: &mut CowBTree<PageId, u32>,
    loc: RecordLocation,
) -> Result<Vec<PageId>> {
    let page = loc.page();
    let count = page_live.get(&page).copied().unwrap_or(0);
    if count > 1 {
        page_live.insert(page, count - 1);
        return Ok(Vec::new());
    }
    page_live.remove(&page);
    if fresh.is_fresh(page) {
        return Ok(Vec::new());
    }
    match loc {
        RecordLocation::Slot { page, .. } => Ok(vec![page]),
        RecordLocation::Overflow { root } => store.overflow_pages(root, Some(fresh)),
    }
}

// ========== Directory codec ==========

const LOC_SLOT: u8 = 1;
const LOC_OVERFLOW: u8 = 2;

/// Serialize a type directory for its chain
pub fn encode_directory(directory: &CowBTree<EntityId, RecordLocation>) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(8 + directory.len() * 15);
    buf.write_u64::<LittleEndian>(directory.len() as u64)?;
    for (id, loc) in directory.iter() {
        buf.write_u64::<LittleEndian>(id.get())?;
        let (tag, page, slot) = match *loc {
            RecordLocation::Slot { page, slot } => (LOC_SLOT, page, slot),
            RecordLocation::Overflow { root } => (LOC_OVERFLOW, root, 0),
        };
        buf.write_u8(tag)?;
        buf.write_u32::<LittleEndian>(page)?;
        buf.write_u16::<LittleEndian>(slot)?;
    }
    Ok(buf)
}

/// Deserialize a type directory
pub fn decode_directory(bytes: &[u8]) -> Result<CowBTree<EntityId, RecordLocation>> {
    let truncated = |_| Error::Serialization("directory chain truncated".into());
    let mut buf = bytes;
    let count = buf.read_u64::<LittleEndian>().map_err(truncated)?;
    let mut directory = CowBTree::new();
    for _ in 0..count {
        let id = EntityId::new(buf.read_u64::<LittleEndian>().map_err(truncated)?);
        let tag = buf.read_u8().map_err(truncated)?;
        let page = buf.read_u32::<LittleEndian>().map_err(truncated)?;
        let slot = buf.read_u16::<LittleEndian>().map_err(truncated)?;
        let loc = match tag {
            LOC_SLOT => RecordLocation::Slot { page, slot },
            LOC_OVERFLOW => RecordLocation::Overflow { root: page },
            other => {
                return Err(Error::Serialization(format!(
                    "unknown record location tag {}",
                    other
                )))
            }
        };
        directory.insert(id, loc);
    }
    Ok(directory)
}
