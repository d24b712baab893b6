//! Snapshot tracking
//!
//! Every open transaction pins the version it started from. Pages freed by a
//! commit are reused only once no pinned version predates that commit.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::version::Version;

/// Open snapshots, counted per version
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    live: Mutex<BTreeMap<u64, usize>>,
}

impl SnapshotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the current version.
    ///
    /// The registry lock is held while `current` is read, so a reclaim that
    /// runs afterwards always sees the new snapshot.
    pub fn acquire(self: &Arc<Self>, current: &RwLock<Arc<Version>>) -> (Arc<Version>, SnapshotGuard) {
        let mut live = self.live.lock();
        let version = current.read().clone();
        *live.entry(version.number).or_insert(0) += 1;
        let guard = SnapshotGuard {
            registry: Arc::clone(self),
            version: version.number,
        };
        (version, guard)
    }

    /// Oldest pinned version
    pub fn oldest(&self) -> Option<u64> {
        self.live.lock().keys().next().copied()
    }

    /// Run `f` with the oldest pinned version while no snapshot can be taken
    pub fn with_oldest<R>(&self, f: impl FnOnce(Option<u64>) -> R) -> R {
        let live = self.live.lock();
        f(live.keys().next().copied())
    }

    /// Number of open snapshots
    pub fn count(&self) -> usize {
        self.live.lock().values().sum()
    }

    fn release(&self, version: u64) {
        let mut live = self.live.lock();
        if let Some(count) = live.get_mut(&version) {
            *count -= 1;
            if *count == 0 {
                live.remove(&version);
            }
        }
    }
}

/// Keeps a version pinned until dropped
#[derive(Debug)]
pub struct SnapshotGuard {
    registry: Arc<SnapshotRegistry>,
    version: u64,
}

impl SnapshotGuard {
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Drop for SnapshotGuard {
    fn drop(&mut self) {
        self.registry.release(self.version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Catalog;

    #[test]
    fn test_guards_pin_versions() {
        let registry = Arc::new(SnapshotRegistry::new());
        let mut version = Version::empty(Catalog::new());
        version.number = 3;
        let current = RwLock::new(Arc::new(version.clone()));

        let (_, a) = registry.acquire(&current);
        let (_, b) = registry.acquire(&current);
        version.number = 4;
        *current.write() = Arc::new(version);
        let (pinned, c) = registry.acquire(&current);

        assert_eq!(pinned.number, 4);
        assert_eq!(registry.oldest(), Some(3));
        assert_eq!(registry.count(), 3);

        drop(a);
        assert_eq!(registry.oldest(), Some(3));
        drop(b);
        assert_eq!(registry.with_oldest(|oldest| oldest), Some(4));
        assert_eq!(c.version(), 4);
        drop(c);
        assert_eq!(registry.oldest(), None);
    }
}
