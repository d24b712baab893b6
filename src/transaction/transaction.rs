//! Transaction Manager
//!
//! Handles transaction lifecycle (Begin, Commit, Abort) and concurrency control.
//!
//! Read transactions pin a committed version and never block. Write
//! transactions run optimistically against a private copy of the version
//! they started from. Commits are serialized by a writer lock; a commit whose
//! base is no longer the latest version is validated against the commits in
//! between and, when nothing overlaps, replayed on top of the latest one.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};

use crate::catalog::{Catalog, EntityType, IndexId, Schema, TypeId};
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::index::IndexKey;
use crate::storage::cache::CacheStats;
use crate::storage::page::{PageId, PageType};
use crate::storage::pager::Pager;
use crate::storage::record::{decode_property, encode_record, Entity, EntityId};
use crate::storage::record_store::{Allocator, AllocatorStats, PageStore, RecordLocation, TxnPages};
use crate::storage::value::Value;

use super::persist;
use super::snapshot::{SnapshotGuard, SnapshotRegistry};
use super::state::TxnState;
use super::version::{index_entries, ChainKey, Version};
use super::view::{ReadView, Sealed};

/// First page id available to data; pages 0 and 1 are the headers
const FIRST_DATA_PAGE: PageId = 2;

/// Transaction State
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborted,
}

/// What two overlapping commits can collide on
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ConflictKey {
    Entity(TypeId, EntityId),
    Unique(IndexId, IndexKey),
}

/// One entry of a write set
#[derive(Debug, Clone)]
enum WriteOp {
    Put {
        location: RecordLocation,
        entries: Vec<(IndexId, Value)>,
    },
    Remove,
}

/// Result of a compaction run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Data pages inspected
    pub pages_examined: usize,
    /// Pages below the live-ratio threshold
    pub sparse_pages: usize,
    /// Records rewritten into fresh pages
    pub records_moved: usize,
    /// Version the compaction committed
    pub version: u64,
}

/// Store-wide counters
#[derive(Debug, Clone, PartialEq)]
pub struct StoreStats {
    pub version: u64,
    pub schema_version: u32,
    /// Entity count per type name
    pub entities: Vec<(String, usize)>,
    pub allocator: AllocatorStats,
    pub cache: CacheStats,
    pub open_snapshots: usize,
}

/// Transaction Manager
#[derive(Debug)]
pub struct TransactionManager {
    config: StoreConfig,
    store: PageStore,
    /// Latest committed version
    current: RwLock<Arc<Version>>,
    /// Serializes commits
    commit_lock: Mutex<()>,
    snapshots: Arc<SnapshotRegistry>,
    /// Conflict keys of recent commits, oldest first
    commit_log: Mutex<VecDeque<(u64, Arc<HashSet<ConflictKey>>)>>,
    /// Threads holding an active write transaction
    writers: Mutex<HashSet<ThreadId>>,
    next_entity_id: AtomicU64,
}

impl TransactionManager {
    /// Open the store kept by `pager`, creating it when the file is new.
    ///
    /// A supplied schema is reconciled with the persisted catalog; without
    /// one the store must already exist.
    pub fn open(mut pager: Pager, config: StoreConfig, schema: Option<&Schema>) -> Result<Arc<Self>> {
        config.validate()?;

        let Some(header) = persist::locate_header(&mut pager)? else {
            let schema = schema
                .ok_or_else(|| Error::InvalidSchema("a new store needs a schema".into()))?;
            let catalog = Catalog::create(schema)?;
            pager.set_page_size(config.page_size);
            let allocator = Allocator::new(FIRST_DATA_PAGE, config.max_pages, []);
            let store = PageStore::new(pager, config.cache_pages, allocator);
            let manager = Arc::new(Self::new(config, store, Version::empty(catalog), 1));
            manager.initialize()?;
            info!(
                types = manager.current().catalog.types().len(),
                "created store"
            );
            return Ok(manager);
        };

        let max_pages = config.max_pages.max(header.page_count);
        let allocator = Allocator::new(header.page_count, max_pages, []);
        let store = PageStore::new(pager, config.cache_pages, allocator);
        let loaded = persist::load(&store, &header)?;
        *store.allocator() = Allocator::new(header.page_count, max_pages, loaded.free_pages);

        let manager = Arc::new(Self::new(config, store, loaded.version, loaded.next_entity_id));
        info!(
            version = header.version,
            page_count = header.page_count,
            "opened store"
        );
        if let Some(schema) = schema {
            manager.reconcile(schema)?;
        }
        Ok(manager)
    }

    fn new(config: StoreConfig, store: PageStore, version: Version, next_entity_id: u64) -> Self {
        Self {
            config,
            store,
            current: RwLock::new(Arc::new(version)),
            commit_lock: Mutex::new(()),
            snapshots: Arc::new(SnapshotRegistry::new()),
            commit_log: Mutex::new(VecDeque::new()),
            writers: Mutex::new(HashSet::new()),
            next_entity_id: AtomicU64::new(next_entity_id.max(1)),
        }
    }

    /// Commit the first version of a new store
    fn initialize(self: &Arc<Self>) -> Result<()> {
        let mut txn = self.begin_write()?;
        let keys: Vec<ChainKey> = {
            let version = &txn.state.version;
            let dirs = version.directories.keys().map(|id| ChainKey::Directory(*id));
            let indexes = version.indexes.iter().map(|index| ChainKey::Index(index.id));
            dirs.chain(indexes).collect()
        };
        txn.state.dirty.extend(keys);
        txn.schema_change = true;
        txn.commit()?;
        Ok(())
    }

    /// Apply a supplied schema to the persisted catalog
    fn reconcile(self: &Arc<Self>, schema: &Schema) -> Result<()> {
        let (catalog, changes) = self.current().catalog.reconcile(schema)?;
        if changes.is_empty() {
            debug!("schema unchanged");
            return Ok(());
        }
        info!(
            new_types = changes.new_types.len(),
            new_indexes = changes.new_indexes.len(),
            dropped_indexes = changes.dropped_indexes.len(),
            new_properties = changes.new_properties,
            schema_version = catalog.schema_version,
            "schema changed"
        );
        let mut txn = self.begin_write()?;
        txn.change_catalog(catalog, &changes.new_indexes)?;
        txn.commit()?;
        Ok(())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Latest committed version
    pub fn current(&self) -> Arc<Version> {
        self.current.read().clone()
    }

    /// Hand out a page, reclaiming what no open snapshot can still read
    fn allocate_page(&self) -> Result<PageId> {
        self.snapshots
            .with_oldest(|oldest| self.store.allocate(oldest))
    }

    /// Take the next id; the sequence never wraps and never yields `u64::MAX`
    fn next_id(&self) -> Result<EntityId> {
        self.next_entity_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next < u64::MAX).then(|| next + 1)
            })
            .map(EntityId::new)
            .map_err(|_| Error::IdSpaceExhausted)
    }

    /// Keep the sequence ahead of an explicitly chosen id.
    ///
    /// Ids below the sequence are never handed out again, so a caller may
    /// only choose one that is at or above it.
    fn observe_id(&self, id: EntityId) -> Result<()> {
        let chosen = id.get();
        self.next_entity_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                if chosen < next {
                    return None;
                }
                chosen.checked_add(1)
            })
            .map(|_| ())
            .map_err(|_| Error::InvalidEntityId(chosen))
    }

    /// Begin a read-only transaction on the latest version
    pub fn begin_read(self: &Arc<Self>) -> ReadTxn {
        let (version, snapshot) = self.snapshots.acquire(&self.current);
        trace!(version = version.number, "begin read transaction");
        ReadTxn {
            manager: Arc::clone(self),
            version,
            _snapshot: snapshot,
        }
    }

    /// Begin a write transaction.
    ///
    /// Fails with `TransactionAlreadyActive` if this thread already holds one.
    pub fn begin_write(self: &Arc<Self>) -> Result<WriteTxn> {
        let thread = thread::current().id();
        if !self.writers.lock().insert(thread) {
            return Err(Error::TransactionAlreadyActive);
        }
        let (base, snapshot) = self.snapshots.acquire(&self.current);
        debug!(version = base.number, "begin write transaction");
        Ok(WriteTxn {
            manager: Arc::clone(self),
            state: TxnState::new(&base),
            base,
            pages: TxnPages::new(),
            writes: BTreeMap::new(),
            claims: HashSet::new(),
            schema_change: false,
            status: TransactionState::Active,
            thread,
            _snapshot: snapshot,
        })
    }

    /// Run `f` in a read transaction
    pub fn run_in_read<R>(self: &Arc<Self>, f: impl FnOnce(&ReadTxn) -> Result<R>) -> Result<R> {
        let txn = self.begin_read();
        f(&txn)
    }

    /// Run `f` in a write transaction and commit it.
    ///
    /// The whole closure is re-run on `WriteConflict`, at most
    /// `max_conflict_retries` times. Any other error aborts the transaction.
    pub fn run_in_write<R>(
        self: &Arc<Self>,
        mut f: impl FnMut(&mut WriteTxn) -> Result<R>,
    ) -> Result<R> {
        let mut attempt = 0;
        loop {
            let mut txn = self.begin_write()?;
            let result = f(&mut txn).and_then(|value| txn.commit().map(|_| value));
            match result {
                Err(e) if e.is_retryable() && attempt < self.config.max_conflict_retries => {
                    attempt += 1;
                    debug!(attempt, "retrying after write conflict");
                }
                other => return other,
            }
        }
    }

    /// Fail with `WriteConflict` if a commit after `base` overlaps `keys`
    fn validate(&self, base: u64, keys: &HashSet<ConflictKey>) -> Result<()> {
        let log = self.commit_log.lock();
        let overlapping = log
            .iter()
            .filter(|(version, _)| *version > base)
            .find(|(_, written)| !written.is_disjoint(keys));
        if let Some((version, _)) = overlapping {
            warn!(base, conflicting_version = version, "write conflict");
            return Err(Error::WriteConflict);
        }
        Ok(())
    }

    fn record_commit(&self, version: u64, keys: HashSet<ConflictKey>) {
        let mut log = self.commit_log.lock();
        log.push_back((version, Arc::new(keys)));
        match self.snapshots.oldest() {
            Some(oldest) => {
                while log.front().is_some_and(|(v, _)| *v <= oldest) {
                    log.pop_front();
                }
            }
            None => log.clear(),
        }
    }

    /// Commit a write transaction; `publish` false stops before the header
    fn commit(&self, txn: &mut WriteTxn, publish: bool) -> Result<u64> {
        if txn.writes.is_empty() && !txn.schema_change {
            self.store.allocator().release(txn.pages.page_ids());
            return Ok(txn.base.number);
        }

        let _guard = self.commit_lock.lock();
        let latest = self.current();
        let keys = txn.conflict_keys();
        if latest.number != txn.base.number {
            if txn.schema_change || !Arc::ptr_eq(&latest.catalog, &txn.base.catalog) {
                warn!(base = txn.base.number, latest = latest.number, "schema changed concurrently");
                return Err(Error::WriteConflict);
            }
            self.validate(txn.base.number, &keys)?;
            txn.replay(&latest)?;
        }
        let number = latest.number + 1;

        let pages = std::mem::take(&mut txn.pages);
        let (kept, unused) = pages.finish(&txn.state.version.page_live);
        self.store.allocator().release(unused);

        let mut used = Vec::new();
        let written = persist::write_version(
            &self.store,
            &mut txn.state,
            kept,
            number,
            self.next_entity_id.load(Ordering::SeqCst),
            || self.allocate_page(),
            &mut used,
        )
        .and_then(|header| {
            if self.config.sync_on_commit {
                self.store.sync()?;
            }
            Ok(header)
        });
        let header = match written {
            Ok(header) => header,
            Err(e) => {
                self.store.allocator().release(used);
                return Err(e);
            }
        };

        if !publish {
            debug!(version = number, "stopped before publishing");
            return Ok(number);
        }
        // A failed header write may still have reached the disk, so the
        // pages stay in flight instead of going back to the free set.
        persist::publish_header(&self.store, &header, self.config.sync_on_commit)?;

        let mut version = txn.state.version.clone();
        version.number = number;
        let freed = std::mem::take(&mut txn.state.freed);
        let freed_pages = freed.len();
        *self.current.write() = Arc::new(version);
        self.store.allocator().commit(number, used, freed);
        self.record_commit(number, keys);

        info!(
            version = number,
            writes = txn.writes.len(),
            freed_pages,
            "committed"
        );
        Ok(number)
    }

    /// Rewrite live records out of pages whose live ratio is below `threshold`
    pub fn compact(self: &Arc<Self>, threshold: f64) -> Result<CompactionStats> {
        let mut txn = self.begin_write()?;
        let version = txn.state.version.clone();
        let mut stats = CompactionStats::default();

        let mut sparse = HashSet::new();
        for (page_id, live) in version.page_live.iter() {
            let page = self.store.page(*page_id)?;
            if page.page_type() != PageType::Data {
                continue;
            }
            stats.pages_examined += 1;
            let slots = page.slot_count().max(1);
            if (*live as f64) / (slots as f64) < threshold {
                sparse.insert(*page_id);
            }
        }
        stats.sparse_pages = sparse.len();

        let catalog = Arc::clone(&version.catalog);
        for (type_id, directory) in &version.directories {
            let ty = catalog
                .type_by_id(*type_id)
                .ok_or_else(|| Error::Internal(format!("directory for unknown type {}", type_id)))?;
            for (id, location) in directory.iter() {
                if !matches!(location, RecordLocation::Slot { page, .. } if sparse.contains(page)) {
                    continue;
                }
                if let Some(entity) = txn.load(ty, *id)? {
                    txn.put_entity(ty, &entity)?;
                    stats.records_moved += 1;
                }
            }
        }

        stats.version = txn.commit()?;
        info!(
            pages_examined = stats.pages_examined,
            sparse_pages = stats.sparse_pages,
            records_moved = stats.records_moved,
            "compaction finished"
        );
        Ok(stats)
    }

    /// Store-wide counters
    pub fn stats(&self) -> StoreStats {
        let version = self.current();
        StoreStats {
            version: version.number,
            schema_version: version.catalog.schema_version,
            entities: version
                .catalog
                .types()
                .iter()
                .map(|ty| (ty.name.clone(), version.entity_count(ty.id)))
                .collect(),
            allocator: self.store.allocator().stats(),
            cache: self.store.cache_stats(),
            open_snapshots: self.snapshots.count(),
        }
    }
}

// ========== Read transactions ==========

/// A read-only transaction over one committed version
#[derive(Debug)]
pub struct ReadTxn {
    manager: Arc<TransactionManager>,
    version: Arc<Version>,
    _snapshot: SnapshotGuard,
}

impl ReadTxn {
    /// Version number this transaction reads
    pub fn version_number(&self) -> u64 {
        self.version.number
    }

    /// Get an entity by type name and id
    pub fn get(&self, type_name: &str, id: EntityId) -> Result<Option<Entity>> {
        let ty = self.version.catalog.get_type(type_name)?;
        self.load(ty, id)
    }
}

impl Sealed for ReadTxn {}

impl ReadView for ReadTxn {
    fn version(&self) -> &Version {
        &self.version
    }

    fn read_record(&self, location: RecordLocation) -> Result<Vec<u8>> {
        self.manager.store.read_record(location, None)
    }
}

// ========== Write transactions ==========

/// A write transaction.
///
/// Dropping an active write transaction aborts it.
#[derive(Debug)]
pub struct WriteTxn {
    manager: Arc<TransactionManager>,
    base: Arc<Version>,
    state: TxnState,
    pages: TxnPages,
    writes: BTreeMap<(TypeId, EntityId), WriteOp>,
    /// Unique values this transaction inserted
    claims: HashSet<ConflictKey>,
    schema_change: bool,
    status: TransactionState,
    thread: ThreadId,
    _snapshot: SnapshotGuard,
}

impl WriteTxn {
    pub fn state(&self) -> TransactionState {
        self.status
    }

    /// Version this transaction started from
    pub fn base_version(&self) -> u64 {
        self.base.number
    }

    /// Insert or replace an entity, returning its id
    pub fn put(&mut self, type_name: &str, entity: &Entity) -> Result<EntityId> {
        let catalog = Arc::clone(&self.state.version.catalog);
        let ty = catalog.get_type(type_name)?;
        self.put_entity(ty, entity)
    }

    /// Get an entity, including this transaction's own writes
    pub fn get(&self, type_name: &str, id: EntityId) -> Result<Option<Entity>> {
        let ty = self.state.version.catalog.get_type(type_name)?;
        self.load(ty, id)
    }

    /// Remove an entity; false if it did not exist
    pub fn remove(&mut self, type_name: &str, id: EntityId) -> Result<bool> {
        let catalog = Arc::clone(&self.state.version.catalog);
        let ty = catalog.get_type(type_name)?;
        self.remove_entity(ty, id)
    }

    /// Commit, returning the new version number
    pub fn commit(mut self) -> Result<u64> {
        self.finish(true)
    }

    /// Discard every change
    pub fn abort(mut self) {
        self.abort_in_place();
    }

    /// Write all pages of the commit but never publish its header, as a
    /// crash right before the header write would.
    #[doc(hidden)]
    pub fn commit_without_publish(mut self) -> Result<u64> {
        self.finish(false)
    }

    pub(crate) fn put_entity(&mut self, ty: &EntityType, entity: &Entity) -> Result<EntityId> {
        self.ensure_active()?;
        let id = if entity.id.is_assigned() {
            if !self.contains(ty, entity.id) {
                self.manager.observe_id(entity.id)?;
            }
            entity.id
        } else {
            self.manager.next_id()?
        };
        let stored = if entity.id == id {
            Cow::Borrowed(entity)
        } else {
            let mut assigned = entity.clone();
            assigned.id = id;
            Cow::Owned(assigned)
        };

        let record = encode_record(ty, &stored)?;
        let entries = index_entries(ty, &stored);
        self.state.check_unique(ty, id, &entries)?;

        let manager = Arc::clone(&self.manager);
        let location = self.pages.write_record(
            manager.store.page_size(),
            ty.id,
            &record,
            || manager.allocate_page(),
        )?;
        self.state
            .put(&manager.store, &self.pages, ty, id, location, &entries)?;

        let catalog = Arc::clone(&self.state.version.catalog);
        for (index_id, value) in &entries {
            if catalog.index(*index_id).is_some_and(|def| def.unique) {
                self.claims
                    .insert(ConflictKey::Unique(*index_id, IndexKey(value.clone())));
            }
        }
        trace!(entity = %ty.name, %id, %location, "put");
        self.writes
            .insert((ty.id, id), WriteOp::Put { location, entries });
        Ok(id)
    }

    pub(crate) fn remove_entity(&mut self, ty: &EntityType, id: EntityId) -> Result<bool> {
        self.ensure_active()?;
        let manager = Arc::clone(&self.manager);
        match self.state.remove(&manager.store, &self.pages, ty, id)? {
            Some(location) => {
                trace!(entity = %ty.name, %id, %location, "remove");
                self.writes.insert((ty.id, id), WriteOp::Remove);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Swap in a new catalog and build the structures it adds
    fn change_catalog(&mut self, catalog: Catalog, new_indexes: &[IndexId]) -> Result<()> {
        self.state.version.catalog = Arc::new(catalog);
        let (created, dropped) = self.state.version.sync_structures();
        self.state.dirty.extend(created);
        self.state.dirty.extend(dropped);
        for &index_id in new_indexes {
            self.backfill(index_id)?;
        }
        self.schema_change = true;
        Ok(())
    }

    /// Fill a new index from the records already stored
    fn backfill(&mut self, index_id: IndexId) -> Result<()> {
        let catalog = Arc::clone(&self.state.version.catalog);
        let def = catalog
            .index(index_id)
            .ok_or_else(|| Error::Internal(format!("{} is not defined", index_id)))?;
        let ty = catalog
            .type_by_id(def.type_id)
            .ok_or_else(|| Error::Internal(format!("{} has no type", index_id)))?;

        let records: Vec<(EntityId, RecordLocation)> = self
            .state
            .version
            .directory(ty.id)?
            .iter()
            .map(|(id, location)| (*id, *location))
            .collect();
        let mut entries = 0;
        for (id, location) in records {
            let record = self.read_record(location)?;
            let value = decode_property(ty, &record, &def.property)?;
            if !value.is_null() {
                self.state.version.indexes.insert(index_id, &value, id)?;
                entries += 1;
            }
        }
        self.state.dirty.insert(ChainKey::Index(index_id));
        debug!(index = %index_id, entity = %ty.name, entries, "backfilled index");
        Ok(())
    }

    fn conflict_keys(&self) -> HashSet<ConflictKey> {
        let mut keys = self.claims.clone();
        keys.extend(
            self.writes
                .keys()
                .map(|(type_id, id)| ConflictKey::Entity(*type_id, *id)),
        );
        keys
    }

    /// Re-apply the write set on top of `latest`
    fn replay(&mut self, latest: &Version) -> Result<()> {
        let manager = Arc::clone(&self.manager);
        let catalog = Arc::clone(&latest.catalog);
        let mut state = TxnState::new(latest);
        for (&(type_id, id), op) in &self.writes {
            let ty = catalog
                .type_by_id(type_id)
                .ok_or_else(|| Error::Internal(format!("write to unknown type {}", type_id)))?;
            match op {
                WriteOp::Put { location, entries } => {
                    state.check_unique(ty, id, entries)?;
                    state.put(&manager.store, &self.pages, ty, id, *location, entries)?;
                }
                WriteOp::Remove => {
                    state.remove(&manager.store, &self.pages, ty, id)?;
                }
            }
        }
        debug!(
            base = self.base.number,
            latest = latest.number,
            writes = self.writes.len(),
            "replayed write set"
        );
        self.state = state;
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        if self.status == TransactionState::Active {
            Ok(())
        } else {
            Err(Error::TransactionClosed)
        }
    }

    fn finish(&mut self, publish: bool) -> Result<u64> {
        self.ensure_active()?;
        self.status = TransactionState::Committing;
        let manager = Arc::clone(&self.manager);
        match manager.commit(self, publish) {
            Ok(version) if publish => {
                self.status = TransactionState::Committed;
                Ok(version)
            }
            Ok(version) => {
                // Pages written without a header stay in flight.
                self.status = TransactionState::Aborted;
                Ok(version)
            }
            Err(e) => {
                self.abort_in_place();
                Err(e)
            }
        }
    }

    fn abort_in_place(&mut self) {
        let pages = std::mem::take(&mut self.pages);
        self.manager.store.allocator().release(pages.page_ids());
        if self.status != TransactionState::Aborted {
            debug!(base = self.base.number, writes = self.writes.len(), "write transaction aborted");
        }
        self.status = TransactionState::Aborted;
    }
}

impl Sealed for WriteTxn {}

impl ReadView for WriteTxn {
    fn version(&self) -> &Version {
        &self.state.version
    }

    fn read_record(&self, location: RecordLocation) -> Result<Vec<u8>> {
        self.manager.store.read_record(location, Some(&self.pages))
    }
}

impl Drop for WriteTxn {
    fn drop(&mut self) {
        if matches!(
            self.status,
            TransactionState::Active | TransactionState::Committing
        ) {
            self.abort_in_place();
        }
        self.manager.writers.lock().remove(&self.thread);
    }
}
