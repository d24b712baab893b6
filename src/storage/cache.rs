//! Page cache for boxdb
//!
//! Committed pages never change, so the cache holds shared immutable
//! `Arc<Page>`s and evicts the least recently used page when full. Nothing is
//! ever written back.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use super::page::{Page, PageId};

#[derive(Debug)]
struct Frame {
    page: Arc<Page>,
    tick: u64,
}

#[derive(Debug, Default)]
struct Inner {
    frames: HashMap<PageId, Frame>,
    /// tick -> page, least recent first
    replacer: BTreeMap<u64, PageId>,
    clock: u64,
    hits: u64,
    misses: u64,
}

/// LRU cache of decoded pages
#[derive(Debug)]
pub struct PageCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

/// Cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub cached: usize,
    pub hits: u64,
    pub misses: u64,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Look up a page, marking it recently used
    pub fn get(&self, page_id: PageId) -> Option<Arc<Page>> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.clock += 1;
        let tick = inner.clock;
        let Some(frame) = inner.frames.get_mut(&page_id) else {
            inner.misses += 1;
            return None;
        };
        let old = std::mem::replace(&mut frame.tick, tick);
        let page = frame.page.clone();
        inner.replacer.remove(&old);
        inner.replacer.insert(tick, page_id);
        inner.hits += 1;
        Some(page)
    }

    /// Insert a page, evicting the least recently used one if full
    pub fn insert(&self, page: Arc<Page>) {
        let page_id = page.page_id();
        let mut inner = self.inner.lock();
        inner.clock += 1;
        let tick = inner.clock;

        if let Some(old) = inner.frames.insert(page_id, Frame { page, tick }) {
            inner.replacer.remove(&old.tick);
        }
        inner.replacer.insert(tick, page_id);

        while inner.frames.len() > self.capacity {
            let Some((_, victim)) = inner.replacer.pop_first() else {
                break;
            };
            inner.frames.remove(&victim);
        }
    }

    /// Drop a page, e.g. when it is handed out for reuse
    pub fn invalidate(&self, page_id: PageId) {
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.remove(&page_id) {
            inner.replacer.remove(&frame.tick);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            cached: inner.frames.len(),
            hits: inner.hits,
            misses: inner.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::PageType;

    fn page(id: PageId) -> Arc<Page> {
        Arc::new(Page::new(id, PageType::Data, 1024))
    }

    #[test]
    fn test_lru_eviction() {
        let cache = PageCache::new(2);
        cache.insert(page(1));
        cache.insert(page(2));
        assert!(cache.get(1).is_some());
        cache.insert(page(3));

        assert!(cache.get(2).is_none());
        assert!(cache.get(1).is_some());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.stats().cached, 2);
    }

    #[test]
    fn test_invalidate() {
        let cache = PageCache::new(4);
        cache.insert(page(5));
        cache.invalidate(5);
        assert!(cache.get(5).is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (0, 1));
    }
}
