//! Block Cache - LRU of decompressed copies of sealed blocks
//!
//! **Purpose**: bound the memory spent on lazily decompressed blocks
//!
//! A sealed block keeps its raw arena after the first read so hot blocks are
//! decompressed once. The cache only tracks *which* blocks hold such a copy;
//! the copy itself lives inside the block. When an entry falls off the LRU the
//! owner drops the copy when it is not locked; a busy block is parked on a
//! pending list and released on a later load.

use crate::storage::data_block::{BlockRef, DataBlock};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::{Arc, Weak};

/// Cache statistics
#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    /// Reads served by an already decompressed block
    pub hits: u64,
    /// Reads that had to decompress
    pub misses: u64,
    /// Decompressed copies dropped by eviction
    pub evictions: u64,
    /// Current number of tracked blocks
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

type WeakBlock = Weak<parking_lot::Mutex<DataBlock>>;

pub struct BlockCache {
    /// block id -> block holding a decompressed copy
    entries: Mutex<LruCache<u64, WeakBlock>>,
    /// Evicted blocks that were locked when their copy should have gone
    pending: Mutex<Vec<(u64, WeakBlock)>>,
    stats: RwLock<CacheStats>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            pending: Mutex::new(Vec::new()),
            stats: RwLock::new(CacheStats {
                capacity: capacity.get(),
                ..CacheStats::default()
            }),
        }
    }

    /// Track a freshly decompressed block
    ///
    /// Returns the least recently used block that must give up its copy, if any.
    pub fn admit(&self, id: u64, block: &BlockRef) -> Option<(u64, WeakBlock)> {
        let evicted = {
            let mut entries = self.entries.lock();
            entries.push(id, Arc::downgrade(block))
        };
        let mut stats = self.stats.write();
        stats.misses += 1;
        match evicted {
            Some((evicted_id, weak)) if evicted_id != id => {
                stats.evictions += 1;
                Some((evicted_id, weak))
            }
            _ => None,
        }
    }

    /// Refresh recency of a block that was already decompressed
    ///
    /// Returns false when the block is not tracked.
    pub fn touch(&self, id: u64) -> bool {
        let hit = self.entries.lock().get(&id).is_some();
        if hit {
            self.stats.write().hits += 1;
        }
        hit
    }

    /// Park an evicted block whose copy could not be dropped yet
    pub fn defer(&self, id: u64, block: WeakBlock) {
        let mut pending = self.pending.lock();
        if !pending.iter().any(|(p, _)| *p == id) {
            pending.push((id, block));
        }
    }

    /// Take parked blocks that have not been readmitted since
    pub fn take_pending(&self) -> Vec<(u64, WeakBlock)> {
        let mut pending = std::mem::take(&mut *self.pending.lock());
        if !pending.is_empty() {
            let entries = self.entries.lock();
            pending.retain(|(id, _)| !entries.contains(id));
        }
        pending
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn remove(&self, id: u64) {
        self.entries.lock().pop(&id);
    }

    /// Remove and return every tracked block
    ///
    /// Parked blocks are included.
    pub fn drain(&self) -> Vec<WeakBlock> {
        let mut drained: Vec<WeakBlock> = std::mem::take(&mut *self.pending.lock())
            .into_iter()
            .map(|(_, weak)| weak)
            .collect();
        let mut entries = self.entries.lock();
        while let Some((_, weak)) = entries.pop_lru() {
            drained.push(weak);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.size = self.len();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> BlockRef {
        DataBlock::new(Vec::new(), None, 4096).into_ref()
    }

    #[test]
    fn test_eviction_returns_lru() {
        let cache = BlockCache::new(2);
        let (a, b, c) = (block(), block(), block());

        assert!(cache.admit(1, &a).is_none());
        assert!(cache.admit(2, &b).is_none());
        assert!(cache.touch(1));
        assert!(!cache.touch(9));

        let (evicted_id, evicted) = cache.admit(3, &c).expect("block 2 evicted");
        assert_eq!(evicted_id, 2);
        assert!(Arc::ptr_eq(&evicted.upgrade().unwrap(), &b));
        assert_eq!(cache.len(), 2);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 3);
        assert_eq!(stats.evictions, 1);
    }

    #[test]
    fn test_readmit_same_block() {
        let cache = BlockCache::new(1);
        let a = block();
        assert!(cache.admit(7, &a).is_none());
        assert!(cache.admit(7, &a).is_none());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_drain() {
        let cache = BlockCache::new(4);
        let (a, b) = (block(), block());
        cache.admit(1, &a);
        cache.admit(2, &b);
        cache.remove(1);
        cache.defer(1, Arc::downgrade(&a));
        assert_eq!(cache.drain().len(), 2);
        assert!(cache.is_empty());
        assert_eq!(cache.pending_len(), 0);
    }

    #[test]
    fn test_pending_skips_readmitted() {
        let cache = BlockCache::new(2);
        let (a, b) = (block(), block());
        cache.defer(1, Arc::downgrade(&a));
        cache.defer(1, Arc::downgrade(&a));
        cache.defer(2, Arc::downgrade(&b));
        assert_eq!(cache.pending_len(), 2);

        cache.admit(2, &b);
        let pending = cache.take_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].0, 1);
        assert_eq!(cache.pending_len(), 0);
    }
}
