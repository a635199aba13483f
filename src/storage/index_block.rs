//! IndexBlock: second level of the map
//!
//! Holds a sorted list of `(first key, data block)` entries covering the
//! half-open range `[lo, hi)`. The first entry's key always equals `lo`, so
//! every key inside the range has a floor entry.

use super::data_block::BlockRef;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type IndexRef = Arc<RwLock<IndexBlock>>;

static NEXT_INDEX_ID: AtomicU64 = AtomicU64::new(1);

pub struct IndexBlock {
    id: u64,
    lo: Vec<u8>,
    hi: Option<Vec<u8>>,
    entries: Vec<(Vec<u8>, BlockRef)>,
    capacity: usize,
}

impl IndexBlock {
    pub fn new(lo: Vec<u8>, hi: Option<Vec<u8>>, capacity: usize) -> Self {
        Self {
            id: NEXT_INDEX_ID.fetch_add(1, Ordering::Relaxed),
            lo,
            hi,
            entries: Vec::new(),
            capacity,
        }
    }

    pub fn into_ref(self) -> IndexRef {
        Arc::new(RwLock::new(self))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn lo(&self) -> &[u8] {
        &self.lo
    }

    pub fn hi(&self) -> Option<&[u8]> {
        self.hi.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() > self.capacity
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.lo.as_slice() <= key && self.hi.as_deref().map_or(true, |hi| key < hi)
    }

    /// Number of entries with first key <= `key`
    fn upper_bound(&self, key: &[u8]) -> usize {
        self.entries.partition_point(|(first, _)| first.as_slice() <= key)
    }

    /// Data block whose first key is the floor of `key`
    pub fn find_block(&self, key: &[u8]) -> Option<BlockRef> {
        match self.upper_bound(key) {
            0 => None,
            n => Some(self.entries[n - 1].1.clone()),
        }
    }

    /// Data block whose first key is strictly below `key`
    pub fn find_block_before(&self, key: &[u8]) -> Option<BlockRef> {
        let n = self.entries.partition_point(|(first, _)| first.as_slice() < key);
        match n {
            0 => None,
            n => Some(self.entries[n - 1].1.clone()),
        }
    }

    /// Block registered under exactly `first_key`
    pub fn block_at(&self, first_key: &[u8]) -> Option<BlockRef> {
        self.entries
            .binary_search_by(|(first, _)| first.as_slice().cmp(first_key))
            .ok()
            .map(|idx| self.entries[idx].1.clone())
    }

    pub fn last_block(&self) -> Option<BlockRef> {
        self.entries.last().map(|(_, block)| block.clone())
    }

    /// Register a block; replaces an entry with the same first key
    pub fn insert_entry(&mut self, first_key: Vec<u8>, block: BlockRef) {
        match self
            .entries
            .binary_search_by(|(first, _)| first.as_slice().cmp(&first_key))
        {
            Ok(idx) => self.entries[idx].1 = block,
            Err(idx) => self.entries.insert(idx, (first_key, block)),
        }
    }

    pub fn remove_entry(&mut self, first_key: &[u8]) -> Option<BlockRef> {
        self.entries
            .binary_search_by(|(first, _)| first.as_slice().cmp(first_key))
            .ok()
            .map(|idx| self.entries.remove(idx).1)
    }

    /// Move the upper half of the entries into a new index block
    pub fn split(&mut self) -> IndexBlock {
        let mid = self.entries.len() / 2;
        let upper = self.entries.split_off(mid.max(1));
        let new_lo = upper[0].0.clone();
        let mut right = IndexBlock::new(new_lo.clone(), self.hi.take(), self.capacity);
        right.entries = upper;
        self.hi = Some(new_lo);
        log::debug!(
            "split index block {}: {} + {} entries (new index {})",
            self.id,
            self.entries.len(),
            right.entries.len(),
            right.id
        );
        right
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BlockRef> {
        self.entries.iter().map(|(_, block)| block)
    }

    pub fn entries(&self) -> &[(Vec<u8>, BlockRef)] {
        &self.entries
    }
}
