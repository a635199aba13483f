//! BigSortedMap: concurrent ordered map over compressed data blocks
//!
//! ## Structure
//! ```text
//! top: BTreeMap<lo, IndexBlock>        (RwLock)
//!        └─ IndexBlock: [(first key, DataBlock)]   (RwLock each)
//!              └─ DataBlock: sorted records        (Mutex each)
//! ```
//!
//! ## Locking
//! - Lock order is DataBlock -> IndexBlock -> top. A lookup never holds one
//!   level while waiting for the next: it clones the reference, releases, then
//!   locks the block and re-validates ownership (`retired`, `[lo, hi)`),
//!   retrying when a split or merge moved the key.
//! - A mutation holds exactly one block lock from lookup to the last update.
//!   Siblings created by splits are private until every update has been
//!   applied, then published into the index. Merges only `try_lock` the right
//!   neighbour.
//!
//! ## Admission
//! Writes that would push the global memory counter over the configured limit
//! return `Ok(false)`; nothing is evicted.

use super::context::EngineContext;
use super::data_block::{BlockRef, DataBlock, PutOutcome};
use super::index_block::{IndexBlock, IndexRef};
use super::key;
use super::record::{self, RecordSpec, ValueCompression};
use super::scanner::{ScanEntry, Scanner};
use super::snapshot;
use crate::cache::{BlockCache, CacheStats};
use crate::codec::{self, Codec, CodecType, Dictionary, ZstdCodec};
use crate::config::MapConfig;
use crate::ops::{self, OpContext, Operation, RecordView, Updates};
use crate::{Result, StorageError};
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{RawMutex, RwLock};
use rayon::prelude::*;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

pub(crate) type BlockGuard = ArcMutexGuard<RawMutex, DataBlock>;

/// Samples larger than this are cut when training a dictionary
const MAX_DICTIONARY_SAMPLE: usize = 1024;

enum Route {
    /// No block exists yet
    Empty,
    /// The structure changed underneath the lookup; retry
    Stale,
    Found(BlockRef),
}

/// An update after value encoding and validation
struct Prepared<'a> {
    key: &'a [u8],
    stored: Cow<'a, [u8]>,
    expire: u64,
    compression: Option<ValueCompression>,
    is_delete: bool,
}

/// Map statistics
#[derive(Debug, Clone, Default)]
pub struct MapStats {
    pub data_blocks: usize,
    pub index_blocks: usize,
    /// Stored records, including expired ones not yet purged
    pub records: usize,
    pub sealed_blocks: usize,
    /// Sealed blocks currently holding a decompressed copy
    pub decompressed_blocks: usize,
    /// Uncompressed record bytes
    pub raw_bytes: usize,
    /// Compressed payload bytes of sealed blocks
    pub compressed_bytes: usize,
    pub memory_used: u64,
    pub sequence: u64,
    pub cache: CacheStats,
}

impl MapStats {
    pub fn compression_ratio(&self) -> f64 {
        if self.compressed_bytes == 0 {
            1.0
        } else {
            self.raw_bytes as f64 / self.compressed_bytes as f64
        }
    }
}

pub struct BigSortedMap {
    ctx: Arc<EngineContext>,
    top: RwLock<BTreeMap<Vec<u8>, IndexRef>>,
    sequence: AtomicU64,
    cache: BlockCache,
}

/// Re-put a record with a new expiration
struct ExpireOp<'a> {
    key: &'a [u8],
    expire: u64,
}

impl Operation for ExpireOp<'_> {
    fn key(&self) -> &[u8] {
        self.key
    }

    fn execute(
        &mut self,
        found: Option<&RecordView<'_>>,
        _ctx: &OpContext<'_>,
        updates: &mut Updates,
    ) -> Result<bool> {
        match ops::exact(found, self.key) {
            Some(record) => {
                updates.put(self.key.to_vec(), &record.value, self.expire)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl BigSortedMap {
    pub fn new(config: MapConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: BlockCache::new(config.decompressed_cache_blocks),
            ctx: Arc::new(EngineContext::new(config)),
            top: RwLock::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &MapConfig {
        self.ctx.config()
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    // ==================== Routing ====================

    fn route_index(&self, key: &[u8]) -> Option<IndexRef> {
        let top = self.top.read();
        top.range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, index)| index.clone())
    }

    fn route(&self, key: &[u8]) -> Route {
        let index = {
            let top = self.top.read();
            if top.is_empty() {
                return Route::Empty;
            }
            match top
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
                .next_back()
            {
                Some((_, index)) => index.clone(),
                None => return Route::Stale,
            }
        };
        let index = index.read();
        if !index.contains_key(key) {
            return Route::Stale;
        }
        match index.find_block(key) {
            Some(block) => Route::Found(block),
            None => Route::Stale,
        }
    }

    /// Block holding the keys just below `key`
    fn route_before(&self, key: &[u8]) -> Route {
        let index = {
            let top = self.top.read();
            if top.is_empty() {
                return Route::Empty;
            }
            match top
                .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
                .next_back()
            {
                Some((_, index)) => index.clone(),
                None => return Route::Empty,
            }
        };
        let index = index.read();
        if !(index.lo() < key && index.hi().map_or(true, |hi| key <= hi)) {
            return Route::Stale;
        }
        match index.find_block_before(key) {
            Some(block) => Route::Found(block),
            None => Route::Stale,
        }
    }

    fn route_last(&self) -> Route {
        let index = {
            let top = self.top.read();
            match top.values().next_back() {
                Some(index) => index.clone(),
                None => return Route::Empty,
            }
        };
        let index = index.read();
        if index.hi().is_some() {
            return Route::Stale;
        }
        match index.last_block() {
            Some(block) => Route::Found(block),
            None => Route::Stale,
        }
    }

    fn ensure_root(&self) {
        let mut top = self.top.write();
        if top.is_empty() {
            let config = self.ctx.config();
            let block = DataBlock::new(Vec::new(), None, config.max_block_size);
            let mut index = IndexBlock::new(Vec::new(), None, config.index_block_capacity);
            index.insert_entry(Vec::new(), block.into_ref());
            top.insert(Vec::new(), index.into_ref());
            log::debug!("created first block");
        }
    }

    /// Lock the block owning `key`
    ///
    /// Returns `None` only for an empty map when `create` is false.
    fn lock_owner(&self, key: &[u8], create: bool) -> Option<BlockGuard> {
        loop {
            match self.route(key) {
                Route::Empty if !create => return None,
                Route::Empty => self.ensure_root(),
                Route::Stale => std::thread::yield_now(),
                Route::Found(block) => {
                    let guard = block.lock_arc();
                    if !guard.is_retired() && guard.contains_key(key) {
                        return Some(guard);
                    }
                }
            }
        }
    }

    fn lock_owner_for_write(&self, key: &[u8]) -> Result<BlockGuard> {
        self.lock_owner(key, true)
            .ok_or_else(|| StorageError::Corruption("map has no blocks after creation".into()))
    }

    /// Lock the block holding keys just below `before` (or the last block)
    fn lock_preceding(&self, before: Option<&[u8]>) -> Option<BlockGuard> {
        if before == Some(&[][..]) {
            return None;
        }
        loop {
            let route = match before {
                Some(key) => self.route_before(key),
                None => self.route_last(),
            };
            match route {
                Route::Empty => return None,
                Route::Stale => std::thread::yield_now(),
                Route::Found(block) => {
                    let guard = block.lock_arc();
                    let owns = match before {
                        Some(key) => guard.lo() < key && guard.hi().map_or(true, |hi| key <= hi),
                        None => guard.hi().is_none(),
                    };
                    if !guard.is_retired() && owns {
                        return Some(guard);
                    }
                }
            }
        }
    }

    // ==================== Block lifecycle ====================

    /// Make the block readable, tracking decompressed copies in the cache
    fn load_block(&self, guard: &mut BlockGuard) -> Result<()> {
        let admitted = if guard.ensure_decompressed(&self.ctx)? {
            guard.sync_accounting(self.ctx.memory());
            true
        } else {
            // a copy that lost its cache slot while busy is tracked again
            guard.is_sealed() && !self.cache.touch(guard.id())
        };
        if admitted {
            if let Some((id, weak)) = self.cache.admit(guard.id(), ArcMutexGuard::mutex(guard)) {
                self.release_copy(id, &weak);
            }
            for (id, weak) in self.cache.take_pending() {
                self.release_copy(id, &weak);
            }
        }
        Ok(())
    }

    /// Drop the decompressed copy of an evicted block, parking it if busy
    fn release_copy(&self, id: u64, weak: &Weak<parking_lot::Mutex<DataBlock>>) {
        if let Some(block) = weak.upgrade() {
            match block.try_lock() {
                Some(mut guard) => {
                    if guard.drop_decompressed() {
                        guard.sync_accounting(self.ctx.memory());
                    }
                }
                None => self.cache.defer(id, weak.clone()),
            }
        }
    }

    fn begin_mutation(&self, guard: &mut BlockGuard) -> Result<()> {
        let was_sealed = guard.is_sealed();
        guard.prepare_mutation(&self.ctx)?;
        if was_sealed {
            self.cache.remove(guard.id());
        }
        Ok(())
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest sequence number handed out so far
    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn encode_value<'v>(
        &self,
        codec: &dyn Codec,
        value: &'v [u8],
    ) -> Result<(Cow<'v, [u8]>, Option<ValueCompression>)> {
        match self.ctx.config().value_compression_threshold {
            Some(threshold) if value.len() >= threshold && codec.codec_type() != CodecType::None => {
                let compressed = codec.compress_to_vec(value)?;
                if compressed.len() < value.len() {
                    let marker = ValueCompression {
                        tag: codec.tag(),
                        raw_len: value.len(),
                    };
                    return Ok((Cow::Owned(compressed), Some(marker)));
                }
                Ok((Cow::Borrowed(value), None))
            }
            _ => Ok((Cow::Borrowed(value), None)),
        }
    }

    /// Validate and apply one operation's updates to the locked block
    ///
    /// Nothing is applied unless every update stays inside the block, fits a
    /// block, and the memory limit admits the net growth.
    fn apply_updates(&self, guard: &mut BlockGuard, updates: &Updates) -> Result<bool> {
        let capacity = guard.capacity();
        let codec = self.ctx.codec();
        let seq = self.next_sequence();

        let mut prepared = Vec::with_capacity(updates.len());
        let mut growth: i64 = 0;
        for update in updates.iter() {
            if !guard.contains_key(update.key) {
                return Err(StorageError::KeyOutOfBlock(format!(
                    "update key {:?} outside block {} [{:?}, {:?})",
                    update.key,
                    guard.id(),
                    guard.lo(),
                    guard.hi()
                )));
            }
            let existing = match guard.search(update.key, false)? {
                Some(idx) => guard.layout(idx)?.total_len(),
                None => 0,
            };
            if update.is_delete {
                growth -= existing as i64;
                prepared.push(Prepared {
                    key: update.key,
                    stored: Cow::Borrowed(&[]),
                    expire: 0,
                    compression: None,
                    is_delete: true,
                });
                continue;
            }

            let (stored, compression) = self.encode_value(codec.as_ref(), update.value)?;
            let len = RecordSpec {
                key: update.key,
                value: &stored,
                seq,
                expire: update.expire,
                compression,
            }
            .encoded_len();
            if len > capacity {
                return Err(StorageError::RecordTooLarge { size: len, max: capacity });
            }
            growth += len as i64 - existing as i64;
            prepared.push(Prepared {
                key: update.key,
                stored,
                expire: update.expire,
                compression,
                is_delete: false,
            });
        }

        if growth > 0 && self.ctx.memory().would_exceed(growth as u64) {
            log::warn!(
                "write rejected: {} more bytes would exceed memory limit {:?} (allocated {})",
                growth,
                self.ctx.memory().limit(),
                self.ctx.memory().allocated()
            );
            return Ok(false);
        }

        self.begin_mutation(guard)?;
        let mut siblings: Vec<DataBlock> = Vec::new();
        let mut deleted = false;
        for update in &prepared {
            if update.is_delete {
                let target = owner_mut(&mut **guard, &mut siblings, update.key)?;
                deleted |= target.delete(update.key)?;
                continue;
            }
            let spec = RecordSpec {
                key: update.key,
                value: &update.stored,
                seq,
                expire: update.expire,
                compression: update.compression,
            };
            loop {
                let target = owner_mut(&mut **guard, &mut siblings, update.key)?;
                match target.put(&spec)? {
                    PutOutcome::NeedSplit => {
                        let right = target.split(update.key)?;
                        siblings.push(right);
                    }
                    PutOutcome::Inserted | PutOutcome::Updated => break,
                }
            }
        }

        let memory = self.ctx.memory();
        if !siblings.is_empty() && self.ctx.config().codec.compress_on_split {
            guard.seal(codec.as_ref())?;
        }
        guard.sync_accounting(memory);
        for sibling in &mut siblings {
            sibling.sync_accounting(memory);
        }

        siblings.sort_by(|a, b| a.lo().cmp(b.lo()));
        for sibling in siblings {
            self.publish(sibling);
        }

        if deleted {
            self.try_merge(guard)?;
        }
        Ok(true)
    }

    /// Register a new sibling in the index, splitting the index if it overflows
    fn publish(&self, block: DataBlock) {
        let lo = block.lo().to_vec();
        let block = block.into_ref();
        loop {
            let index = match self.route_index(&lo) {
                Some(index) => index,
                None => {
                    std::thread::yield_now();
                    continue;
                }
            };
            let mut index = index.write();
            if !index.contains_key(&lo) {
                continue;
            }
            index.insert_entry(lo.clone(), block.clone());
            if index.is_full() {
                let right = index.split();
                let right_lo = right.lo().to_vec();
                self.top.write().insert(right_lo, right.into_ref());
            }
            return;
        }
    }

    /// Absorb the right neighbour when this block has become sparse
    fn try_merge(&self, guard: &mut BlockGuard) -> Result<()> {
        let capacity = guard.capacity();
        let threshold = (self.ctx.config().merge_threshold * capacity as f64) as usize;
        if guard.used_size() >= threshold {
            return Ok(());
        }
        let hi = match guard.hi() {
            Some(hi) => hi.to_vec(),
            None => return Ok(()),
        };
        let index = match self.route_index(&hi) {
            Some(index) => index,
            None => return Ok(()),
        };
        let mut index = index.write();
        // the neighbour must share our index block so no index block ever empties
        if !index.contains_key(&hi) || index.lo() == hi.as_slice() {
            return Ok(());
        }
        let right_ref = match index.block_at(&hi) {
            Some(block) => block,
            None => return Ok(()),
        };
        let mut right = match right_ref.try_lock() {
            Some(right) => right,
            None => return Ok(()),
        };
        if right.is_retired() || guard.used_size() + right.used_size() > capacity * 3 / 4 {
            return Ok(());
        }

        self.begin_mutation(guard)?;
        let was_sealed = right.is_sealed();
        right.prepare_mutation(&self.ctx)?;
        let right_id = right.id();
        guard.merge_from(&mut right)?;
        index.remove_entry(&hi);

        let memory = self.ctx.memory();
        right.sync_accounting(memory);
        guard.sync_accounting(memory);
        if was_sealed {
            self.cache.remove(right_id);
        }
        log::debug!("merged block {} into block {}", right_id, guard.id());
        Ok(())
    }

    // ==================== Point operations ====================

    /// Insert or overwrite `key`
    ///
    /// Returns `Ok(false)` when the memory limit refuses the write and
    /// `Err(RecordTooLarge)` when the record cannot fit any block.
    pub fn put(&self, key: &[u8], value: &[u8], expire: u64) -> Result<bool> {
        let mut guard = self.lock_owner_for_write(key)?;
        self.load_block(&mut guard)?;
        let mut updates = Updates::new();
        updates.put(key.to_vec(), value, expire)?;
        self.apply_updates(&mut guard, &updates)
    }

    /// Remove `key`; returns whether a live record was removed
    pub fn delete(&self, key: &[u8]) -> Result<bool> {
        let mut guard = match self.lock_owner(key, false) {
            Some(guard) => guard,
            None => return Ok(false),
        };
        self.load_block(&mut guard)?;
        let live = match guard.search(key, false)? {
            Some(idx) => !guard.layout(idx)?.is_expired(record::now_millis()),
            None => return Ok(false),
        };
        let mut updates = Updates::new();
        updates.delete(key.to_vec())?;
        self.apply_updates(&mut guard, &updates)?;
        Ok(live)
    }

    fn read_with<R>(
        &self,
        key: &[u8],
        snapshot: Option<u64>,
        f: impl FnOnce(&RecordView<'_>) -> R,
    ) -> Result<Option<R>> {
        let mut guard = match self.lock_owner(key, false) {
            Some(guard) => guard,
            None => return Ok(None),
        };
        self.load_block(&mut guard)?;
        let idx = match guard.search(key, false)? {
            Some(idx) => idx,
            None => return Ok(None),
        };
        let view = guard.view(idx, &self.ctx)?;
        if record::is_expired(view.expire, record::now_millis())
            || snapshot.map_or(false, |s| view.seq > s)
        {
            return Ok(None);
        }
        Ok(Some(f(&view)))
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.read_with(key, None, |record| record.value.to_vec())
    }

    /// Read as of a snapshot sequence; records written later are invisible
    pub fn get_with_snapshot(&self, key: &[u8], snapshot: u64) -> Result<Option<Vec<u8>>> {
        self.read_with(key, Some(snapshot), |record| record.value.to_vec())
    }

    /// Copy the value into `buf` if it fits
    ///
    /// Always returns the value size, so a caller with a short buffer can
    /// retry with one of the right length.
    pub fn get_into(&self, key: &[u8], buf: &mut [u8], snapshot: Option<u64>) -> Result<Option<usize>> {
        self.read_with(key, snapshot, |record| {
            let size = record.value.len();
            if size <= buf.len() {
                buf[..size].copy_from_slice(&record.value);
            }
            size
        })
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.read_with(key, None, |_| ())?.is_some())
    }

    /// Expiration of a live record; `Some(0)` means it never expires
    pub fn get_expire(&self, key: &[u8]) -> Result<Option<u64>> {
        self.read_with(key, None, |record| record.expire)
    }

    /// Change the expiration of an existing record; `0` removes it
    pub fn set_expire(&self, key: &[u8], expire: u64) -> Result<bool> {
        self.execute(&mut ExpireOp { key, expire })
    }

    /// Run an operation under the lock of the block owning its key
    pub fn execute(&self, op: &mut dyn Operation) -> Result<bool> {
        let key = op.key().to_vec();
        let mut guard = self.lock_owner_for_write(&key)?;
        self.load_block(&mut guard)?;

        let now_ms = record::now_millis();
        let op_ctx = OpContext {
            config: self.ctx.config(),
            now_ms,
        };
        let mut updates = Updates::new();
        let accepted = {
            // a floor lookup steps back over expired records
            let live = match guard.search(&key, op.floor())? {
                Some(mut idx) => loop {
                    if !guard.layout(idx)?.is_expired(now_ms) {
                        break Some(idx);
                    }
                    if !op.floor() || idx == 0 {
                        break None;
                    }
                    idx -= 1;
                },
                None => None,
            };
            let found = match live {
                Some(idx) => {
                    let view = guard.view(idx, &self.ctx)?;
                    if view.key > key.as_slice() || !guard.contains_key(view.key) {
                        return Err(StorageError::Corruption(format!(
                            "lookup in block {} returned key outside its range",
                            guard.id()
                        )));
                    }
                    Some(view)
                }
                None => None,
            };
            op.execute(found.as_ref(), &op_ctx, &mut updates)?
        };

        if !accepted {
            return Ok(false);
        }
        if updates.is_empty() {
            return Ok(true);
        }
        log::trace!("applying {} updates for key {:?}", updates.len(), key);
        self.apply_updates(&mut guard, &updates)
    }

    // ==================== Scans ====================

    /// Ascending scan over `[start, end)`; `None` bounds are open
    pub fn scanner(&self, start: Option<&[u8]>, end: Option<&[u8]>, snapshot: Option<u64>) -> Scanner<'_> {
        Scanner::new(self, start.unwrap_or(&[]), end, snapshot, false)
    }

    /// Descending scan over `[start, end)`
    pub fn reverse_scanner(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        snapshot: Option<u64>,
    ) -> Scanner<'_> {
        Scanner::new(self, start.unwrap_or(&[]), end, snapshot, true)
    }

    /// Every key starting with `prefix`, ascending
    pub fn prefix_scanner(&self, prefix: &[u8]) -> Scanner<'_> {
        let end = key::prefix_successor(prefix);
        Scanner::new(self, prefix, end.as_deref(), None, false)
    }

    /// Copy the live records in `[from, end)` of the block owning `from`
    ///
    /// Returns the key to continue from, or `None` at the end of the range.
    pub(crate) fn scan_block(
        &self,
        from: &[u8],
        end: Option<&[u8]>,
        snapshot: Option<u64>,
        now_ms: u64,
        out: &mut Vec<ScanEntry>,
    ) -> Result<Option<Vec<u8>>> {
        let mut guard = match self.lock_owner(from, false) {
            Some(guard) => guard,
            None => return Ok(None),
        };
        self.load_block(&mut guard)?;
        guard.collect_range(from, end, snapshot, now_ms, &self.ctx, out)?;
        Ok(match guard.hi() {
            Some(hi) if end.map_or(true, |e| hi < e) => Some(hi.to_vec()),
            _ => None,
        })
    }

    /// Copy (descending) the live records in `[start, before)` of the block
    /// holding the keys just below `before`
    pub(crate) fn scan_block_rev(
        &self,
        start: &[u8],
        before: Option<&[u8]>,
        snapshot: Option<u64>,
        now_ms: u64,
        out: &mut Vec<ScanEntry>,
    ) -> Result<Option<Vec<u8>>> {
        let mut guard = match self.lock_preceding(before) {
            Some(guard) => guard,
            None => return Ok(None),
        };
        self.load_block(&mut guard)?;
        guard.collect_range_rev(start, before, snapshot, now_ms, &self.ctx, out)?;
        let lo = guard.lo();
        Ok(if lo.is_empty() || lo <= start {
            None
        } else {
            Some(lo.to_vec())
        })
    }

    // ==================== Persistence ====================

    /// Write every live record to `path`; returns the number of records
    pub fn snapshot<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        snapshot::write_snapshot(self, path.as_ref())
    }

    /// Bulk-load records from a snapshot file; returns the number loaded
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<u64> {
        snapshot::load_snapshot(self, path.as_ref())
    }

    // ==================== Memory ====================

    pub fn memory_used(&self) -> u64 {
        self.ctx.memory().allocated()
    }

    pub fn set_stats_updates_disabled(&self, disabled: bool) {
        self.ctx.memory().set_stats_updates_disabled(disabled);
    }

    /// Recount the footprint of every block and reset the global counter
    pub fn recompute_memory(&self) -> u64 {
        let total = self
            .all_blocks()
            .iter()
            .map(|block| block.lock().reset_accounting() as u64)
            .sum();
        self.ctx.memory().reset(total);
        total
    }

    // ==================== Compression ====================

    /// Install a new block codec; blocks sealed earlier stay readable
    pub fn swap_codec(&self, codec: Arc<dyn Codec>) -> Arc<dyn Codec> {
        self.ctx.swap_codec(codec)
    }

    pub fn register_dictionary(&self, dictionary: Dictionary) {
        self.ctx.register_dictionary(dictionary);
    }

    /// Compress every unsealed block with the active codec (in parallel)
    pub fn seal_all(&self) -> Result<usize> {
        let codec = self.ctx.codec();
        let memory = self.ctx.memory();
        let results: Vec<Result<bool>> = self
            .all_blocks()
            .par_iter()
            .map(|block| {
                let mut guard = block.lock();
                if guard.is_retired() || guard.is_sealed() {
                    return Ok(false);
                }
                let sealed = guard.seal(codec.as_ref())?;
                if sealed {
                    guard.sync_accounting(memory);
                }
                Ok(sealed)
            })
            .collect();
        let mut sealed = 0;
        for result in results {
            if result? {
                sealed += 1;
            }
        }
        log::debug!("sealed {} blocks with {}", sealed, codec.codec_type());
        Ok(sealed)
    }

    /// Drop every cached decompressed copy of sealed blocks
    pub fn trim_caches(&self) -> usize {
        let mut dropped = 0;
        for weak in self.cache.drain() {
            if let Some(block) = weak.upgrade() {
                let mut guard = block.lock();
                if guard.drop_decompressed() {
                    guard.sync_accounting(self.ctx.memory());
                    dropped += 1;
                }
            }
        }
        dropped
    }

    /// Train a zstd dictionary on the current records and make it the active codec
    pub fn train_dictionary(&self, max_size: usize) -> Result<Dictionary> {
        let now_ms = record::now_millis();
        let mut samples: Vec<Vec<u8>> = Vec::new();
        for block in self.all_blocks() {
            let mut guard = block.lock_arc();
            if guard.is_retired() || guard.is_empty() {
                continue;
            }
            self.load_block(&mut guard)?;
            let mut entries = Vec::new();
            guard.collect_range(&[], None, None, now_ms, &self.ctx, &mut entries)?;
            for entry in entries {
                let mut sample = entry.key;
                sample.extend_from_slice(&entry.value);
                sample.truncate(MAX_DICTIONARY_SAMPLE);
                samples.push(sample);
            }
        }

        let dictionary = ZstdCodec::train_dictionary(&samples, max_size)?;
        self.ctx.register_dictionary(dictionary.clone());

        let current = self.ctx.codec();
        let level = if current.codec_type() == CodecType::Zstd {
            current.level()
        } else {
            self.ctx.config().codec.level
        };
        self.ctx.swap_codec(codec::create(
            CodecType::Zstd,
            level,
            current.compression_threshold(),
            Some(dictionary.clone()),
        ));
        log::debug!(
            "trained dictionary {} ({} bytes) from {} samples",
            dictionary.id(),
            dictionary.bytes().len(),
            samples.len()
        );
        Ok(dictionary)
    }

    // ==================== Maintenance ====================

    /// Data blocks in key order; each reference is taken under a short index lock
    fn all_blocks(&self) -> Vec<BlockRef> {
        let indexes: Vec<IndexRef> = self.top.read().values().cloned().collect();
        let mut blocks = Vec::new();
        for index in indexes {
            blocks.extend(index.read().blocks().cloned());
        }
        blocks
    }

    /// Physically remove expired records; returns how many were removed
    pub fn purge_expired(&self) -> Result<usize> {
        let now_ms = record::now_millis();
        let mut purged = 0;
        for block in self.all_blocks() {
            let mut guard = block.lock_arc();
            if guard.is_retired() || guard.is_empty() {
                continue;
            }
            self.load_block(&mut guard)?;
            let expired = guard.expired_keys(now_ms)?;
            if expired.is_empty() {
                continue;
            }
            self.begin_mutation(&mut guard)?;
            for key in &expired {
                guard.delete(key)?;
            }
            guard.sync_accounting(self.ctx.memory());
            purged += expired.len();
        }
        if purged > 0 {
            log::debug!("purged {} expired records", purged);
        }
        Ok(purged)
    }

    pub fn stats(&self) -> MapStats {
        let mut stats = MapStats {
            index_blocks: self.top.read().len(),
            memory_used: self.memory_used(),
            sequence: self.current_sequence(),
            cache: self.cache.stats(),
            ..MapStats::default()
        };
        for block in self.all_blocks() {
            let guard = block.lock();
            if guard.is_retired() {
                continue;
            }
            stats.data_blocks += 1;
            stats.records += guard.len();
            stats.raw_bytes += guard.used_size();
            if guard.is_sealed() {
                stats.sealed_blocks += 1;
                stats.compressed_bytes += guard.compressed_size();
                if guard.is_decompressed() {
                    stats.decompressed_blocks += 1;
                }
            }
        }
        stats
    }

    /// Check that blocks partition the key space without gaps or overlaps
    ///
    /// Only meaningful while no writer is active.
    pub fn verify_partition(&self) -> Result<()> {
        {
            // index locks are taken with the top lock released
            let indexes: Vec<(Vec<u8>, IndexRef)> = self
                .top
                .read()
                .iter()
                .map(|(lo, index)| (lo.clone(), index.clone()))
                .collect();
            let mut expected: Option<Vec<u8>> = Some(Vec::new());
            for (lo, index) in &indexes {
                let index = index.read();
                if expected.as_deref() != Some(lo.as_slice()) || index.lo() != lo.as_slice() {
                    return Err(StorageError::Corruption(format!(
                        "index block {} starts at {:?}, expected {:?}",
                        index.id(),
                        lo,
                        expected
                    )));
                }
                match index.entries().first() {
                    Some((first, _)) if first.as_slice() == index.lo() => {}
                    _ => {
                        return Err(StorageError::Corruption(format!(
                            "index block {} does not start with its low key",
                            index.id()
                        )))
                    }
                }
                expected = index.hi().map(|hi| hi.to_vec());
            }
            if !indexes.is_empty() && expected.is_some() {
                return Err(StorageError::Corruption("last index block is bounded".into()));
            }
        }

        let blocks = self.all_blocks();
        let mut expected: Option<Vec<u8>> = Some(Vec::new());
        for block in &blocks {
            let mut guard = block.lock_arc();
            if guard.is_retired() {
                return Err(StorageError::Corruption(format!(
                    "retired block {} still indexed",
                    guard.id()
                )));
            }
            if expected.as_deref() != Some(guard.lo()) {
                return Err(StorageError::Corruption(format!(
                    "block {} starts at {:?}, expected {:?}",
                    guard.id(),
                    guard.lo(),
                    expected
                )));
            }
            if let Some(hi) = guard.hi() {
                if hi <= guard.lo() {
                    return Err(StorageError::Corruption(format!(
                        "block {} has empty range",
                        guard.id()
                    )));
                }
            }
            self.load_block(&mut guard)?;
            guard.check_invariants()?;
            expected = guard.hi().map(|hi| hi.to_vec());
        }
        if !blocks.is_empty() && expected.is_some() {
            return Err(StorageError::Corruption("last block is bounded".into()));
        }
        Ok(())
    }

    /// First keys of all data blocks, ascending
    pub fn block_boundaries(&self) -> Vec<Vec<u8>> {
        self.all_blocks()
            .iter()
            .map(|block| block.lock().lo().to_vec())
            .collect()
    }
}

/// The block among the locked one and its private siblings that owns `key`
fn owner_mut<'a>(
    primary: &'a mut DataBlock,
    siblings: &'a mut [DataBlock],
    key: &[u8],
) -> Result<&'a mut DataBlock> {
    if primary.contains_key(key) {
        return Ok(primary);
    }
    siblings
        .iter_mut()
        .find(|block| block.contains_key(key))
        .ok_or_else(|| StorageError::Corruption(format!("no block owns key {:?} after split", key)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecType;
    use crate::config::CodecConfig;

    fn map() -> BigSortedMap {
        BigSortedMap::new(MapConfig::for_testing()).unwrap()
    }

    fn key(i: u32) -> Vec<u8> {
        format!("key:{:06}", i).into_bytes()
    }

    #[test]
    fn test_put_get_delete() {
        let map = map();
        assert_eq!(map.get(b"missing").unwrap(), None);
        assert!(!map.delete(b"missing").unwrap());

        assert!(map.put(b"hello", b"world", 0).unwrap());
        assert_eq!(map.get(b"hello").unwrap(), Some(b"world".to_vec()));
        assert!(map.exists(b"hello").unwrap());

        assert!(map.put(b"hello", b"again", 0).unwrap());
        assert_eq!(map.get(b"hello").unwrap(), Some(b"again".to_vec()));

        assert!(map.delete(b"hello").unwrap());
        assert_eq!(map.get(b"hello").unwrap(), None);
        assert!(!map.exists(b"hello").unwrap());
    }

    #[test]
    fn test_zero_length_value_is_not_absent() {
        let map = map();
        map.put(b"empty", b"", 0).unwrap();
        assert_eq!(map.get(b"empty").unwrap(), Some(Vec::new()));
    }

    #[test]
    fn test_get_into_two_phase() {
        let map = map();
        map.put(b"k", b"0123456789", 0).unwrap();

        let mut small = [0u8; 4];
        assert_eq!(map.get_into(b"k", &mut small, None).unwrap(), Some(10));
        assert_eq!(small, [0u8; 4]);

        let mut buf = vec![0u8; 10];
        assert_eq!(map.get_into(b"k", &mut buf, None).unwrap(), Some(10));
        assert_eq!(buf, b"0123456789");
        assert_eq!(map.get_into(b"nope", &mut buf, None).unwrap(), None);
    }

    #[test]
    fn test_splits_keep_all_keys() {
        let map = map();
        for i in 0..2000 {
            assert!(map.put(&key(i), format!("value-{}", i).as_bytes(), 0).unwrap());
        }
        let stats = map.stats();
        assert!(stats.data_blocks > 10);
        assert!(stats.index_blocks > 1);
        assert_eq!(stats.records, 2000);
        map.verify_partition().unwrap();

        for i in 0..2000 {
            assert_eq!(map.get(&key(i)).unwrap(), Some(format!("value-{}", i).into_bytes()));
        }
        let boundaries = map.block_boundaries();
        assert!(boundaries.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_reverse_insert_order() {
        let map = map();
        for i in (0..500).rev() {
            map.put(&key(i), b"v", 0).unwrap();
        }
        map.verify_partition().unwrap();
        let keys: Vec<_> = map.scanner(None, None, None).map(|e| e.unwrap().key).collect();
        assert_eq!(keys.len(), 500);
        assert_eq!(keys[0], key(0));
        assert_eq!(keys[499], key(499));
    }

    #[test]
    fn test_deletes_merge_blocks() {
        let map = map();
        for i in 0..1000 {
            map.put(&key(i), b"some value bytes", 0).unwrap();
        }
        let before = map.stats().data_blocks;
        // descending, so each sparse block finds an already sparse right neighbour
        for i in (0..1000).rev() {
            if i % 10 != 0 {
                assert!(map.delete(&key(i)).unwrap());
            }
        }
        let after = map.stats();
        assert!(after.data_blocks < before, "{} -> {}", before, after.data_blocks);
        assert_eq!(after.records, 100);
        map.verify_partition().unwrap();
        for i in (0..1000).step_by(10) {
            assert!(map.exists(&key(i)).unwrap());
        }
    }

    #[test]
    fn test_record_too_large() {
        let map = map();
        let huge = vec![7u8; 600];
        assert!(matches!(
            map.put(b"huge", &huge, 0),
            Err(StorageError::RecordTooLarge { .. })
        ));
        assert_eq!(map.get(b"huge").unwrap(), None);
        assert_eq!(map.scanner(None, None, None).count(), 0);
    }

    #[test]
    fn test_memory_limit_rejects_writes() {
        let config = MapConfig {
            global_memory_limit: Some(4096),
            ..MapConfig::for_testing()
        };
        let map = BigSortedMap::new(config).unwrap();
        let mut accepted = 0;
        for i in 0..1000 {
            if map.put(&key(i), &[1u8; 64], 0).unwrap() {
                accepted += 1;
            } else {
                break;
            }
        }
        assert!(accepted > 0 && accepted < 1000);
        // a split may overshoot by about one block
        assert!(map.memory_used() < 4096 + 1024);
        assert!(!map.put(&key(5000), &[1u8; 64], 0).unwrap());
        assert_eq!(map.get(&key(5000)).unwrap(), None);

        // shrinking writes are still admitted
        assert!(map.delete(&key(0)).unwrap());
    }

    #[test]
    fn test_memory_accounting_tracks_growth() {
        let map = map();
        assert_eq!(map.memory_used(), 0);
        for i in 0..300 {
            map.put(&key(i), &[0u8; 32], 0).unwrap();
        }
        let used = map.memory_used();
        assert!(used >= 300 * 32);
        assert_eq!(map.recompute_memory(), used);
    }

    #[test]
    fn test_expiration() {
        let map = map();
        let past = record::now_millis() - 1;
        let future = record::now_millis() + 60_000;
        map.put(b"old", b"v", past).unwrap();
        map.put(b"new", b"v", future).unwrap();

        assert_eq!(map.get(b"old").unwrap(), None);
        assert_eq!(map.get_expire(b"new").unwrap(), Some(future));
        assert!(!map.delete(b"old").unwrap());

        assert!(map.set_expire(b"new", past).unwrap());
        assert_eq!(map.get(b"new").unwrap(), None);
        assert!(!map.set_expire(b"new", 0).unwrap());

        map.put(b"gone", b"v", past).unwrap();
        // "new" expired above and is still stored
        assert_eq!(map.purge_expired().unwrap(), 2);
        assert_eq!(map.stats().records, 0);
    }

    #[test]
    fn test_snapshot_sequence_hides_later_writes() {
        let map = map();
        map.put(b"a", b"1", 0).unwrap();
        let snap = map.current_sequence();
        map.put(b"b", b"2", 0).unwrap();

        assert_eq!(map.get_with_snapshot(b"a", snap).unwrap(), Some(b"1".to_vec()));
        assert_eq!(map.get_with_snapshot(b"b", snap).unwrap(), None);
        assert_eq!(map.get(b"b").unwrap(), Some(b"2".to_vec()));
    }

    struct MultiPut {
        key: Vec<u8>,
        others: Vec<Vec<u8>>,
    }

    impl Operation for MultiPut {
        fn key(&self) -> &[u8] {
            &self.key
        }

        fn execute(
            &mut self,
            _found: Option<&RecordView<'_>>,
            _ctx: &OpContext<'_>,
            updates: &mut Updates,
        ) -> Result<bool> {
            updates.put(self.key.clone(), b"main", 0)?;
            for other in &self.others {
                updates.put(other.clone(), b"side", 0)?;
            }
            Ok(true)
        }
    }

    #[test]
    fn test_update_outside_block_rejected_atomically() {
        let map = map();
        for i in 0..500 {
            map.put(&key(i), b"v", 0).unwrap();
        }
        assert!(map.stats().data_blocks > 2);

        let mut op = MultiPut {
            key: key(0),
            others: vec![key(1), key(499)],
        };
        assert!(matches!(map.execute(&mut op), Err(StorageError::KeyOutOfBlock(_))));
        assert_eq!(map.get(&key(0)).unwrap(), Some(b"v".to_vec()));
        assert_eq!(map.get(&key(1)).unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_multi_update_split_publishes_siblings() {
        let map = map();
        let mut op = MultiPut {
            key: b"base".to_vec(),
            others: (0..40).map(|i| format!("base:{:02}", i).into_bytes()).collect(),
        };
        assert!(map.execute(&mut op).unwrap());
        assert!(map.stats().data_blocks > 1);
        map.verify_partition().unwrap();
        assert_eq!(map.get(b"base").unwrap(), Some(b"main".to_vec()));
        for i in 0..40 {
            let k = format!("base:{:02}", i).into_bytes();
            assert_eq!(map.get(&k).unwrap(), Some(b"side".to_vec()));
        }
    }

    struct FloorLookup {
        key: Vec<u8>,
        seen: Option<Vec<u8>>,
    }

    impl Operation for FloorLookup {
        fn key(&self) -> &[u8] {
            &self.key
        }

        fn floor(&self) -> bool {
            true
        }

        fn execute(
            &mut self,
            found: Option<&RecordView<'_>>,
            _ctx: &OpContext<'_>,
            _updates: &mut Updates,
        ) -> Result<bool> {
            self.seen = found.map(|r| r.key.to_vec());
            Ok(true)
        }
    }

    #[test]
    fn test_floor_lookup_sees_preceding_record() {
        let map = map();
        map.put(b"apple", b"1", 0).unwrap();
        map.put(b"cherry", b"2", 0).unwrap();

        let mut lookup = FloorLookup {
            key: b"banana".to_vec(),
            seen: None,
        };
        assert!(map.execute(&mut lookup).unwrap());
        assert_eq!(lookup.seen, Some(b"apple".to_vec()));

        let mut lookup = FloorLookup {
            key: b"aardvark".to_vec(),
            seen: None,
        };
        map.execute(&mut lookup).unwrap();
        assert_eq!(lookup.seen, None);
    }

    #[test]
    fn test_floor_lookup_skips_expired_record() {
        let map = map();
        let past = record::now_millis() - 1;
        map.put(b"apple", b"1", 0).unwrap();
        map.put(b"banana", b"2", past).unwrap();

        let mut lookup = FloorLookup {
            key: b"cherry".to_vec(),
            seen: None,
        };
        assert!(map.execute(&mut lookup).unwrap());
        assert_eq!(lookup.seen, Some(b"apple".to_vec()));

        map.put(b"aardvark", b"3", past).unwrap();
        let mut lookup = FloorLookup {
            key: b"apricot".to_vec(),
            seen: None,
        };
        map.execute(&mut lookup).unwrap();
        assert_eq!(lookup.seen, None);
    }

    #[test]
    fn test_verify_partition_alongside_index_splits() {
        let map = map();
        std::thread::scope(|scope| {
            for t in 0..2u32 {
                let map = &map;
                scope.spawn(move || {
                    for i in 0..600 {
                        map.put(&key(t * 1000 + i), b"v", 0).unwrap();
                    }
                });
            }
            let map = &map;
            scope.spawn(move || {
                for _ in 0..200 {
                    // results are only meaningful once writers stop
                    let _ = map.verify_partition();
                }
            });
        });
        assert!(map.stats().index_blocks > 1);
        map.verify_partition().unwrap();
    }

    #[test]
    fn test_busy_evicted_block_released_later() {
        let config = MapConfig {
            codec: CodecConfig {
                codec_type: CodecType::Lz4,
                ..CodecConfig::default()
            },
            decompressed_cache_blocks: 1,
            ..MapConfig::for_testing()
        };
        let map = BigSortedMap::new(config).unwrap();
        for i in 0..400 {
            map.put(&key(i), b"repetitive repetitive repetitive", 0).unwrap();
        }
        map.seal_all().unwrap();
        let blocks = map.all_blocks();
        assert!(blocks.len() >= 3);
        let second = blocks[1].lock().lo().to_vec();

        map.get(&key(0)).unwrap();
        {
            // the first block is locked while its cache slot is taken
            let _busy = blocks[0].lock();
            map.get(&key(399)).unwrap();
        }
        assert_eq!(map.stats().decompressed_blocks, 2);

        map.get(&second).unwrap();
        assert_eq!(map.stats().decompressed_blocks, 1);

        assert_eq!(map.trim_caches(), 1);
        assert_eq!(map.stats().decompressed_blocks, 0);
    }

    #[test]
    fn test_trim_caches_releases_busy_evictions() {
        let config = MapConfig {
            codec: CodecConfig {
                codec_type: CodecType::Lz4,
                ..CodecConfig::default()
            },
            decompressed_cache_blocks: 1,
            ..MapConfig::for_testing()
        };
        let map = BigSortedMap::new(config).unwrap();
        for i in 0..400 {
            map.put(&key(i), b"repetitive repetitive repetitive", 0).unwrap();
        }
        map.seal_all().unwrap();
        let blocks = map.all_blocks();

        map.get(&key(0)).unwrap();
        {
            let _busy = blocks[0].lock();
            map.get(&key(399)).unwrap();
        }
        assert_eq!(map.trim_caches(), 2);
        assert_eq!(map.stats().decompressed_blocks, 0);
    }

    #[test]
    fn test_seal_all_and_codec_swap() {
        let config = MapConfig {
            codec: CodecConfig {
                codec_type: CodecType::Lz4,
                ..CodecConfig::default()
            },
            ..MapConfig::for_testing()
        };
        let map = BigSortedMap::new(config).unwrap();
        for i in 0..400 {
            map.put(&key(i), b"repetitive repetitive repetitive", 0).unwrap();
        }
        let sealed = map.seal_all().unwrap();
        assert!(sealed > 0);
        assert_eq!(map.stats().sealed_blocks, sealed);

        map.swap_codec(codec::create(CodecType::Zstd, 3, 100, None));
        for i in 0..400 {
            assert_eq!(
                map.get(&key(i)).unwrap(),
                Some(b"repetitive repetitive repetitive".to_vec())
            );
        }
        let stats = map.stats();
        assert!(stats.decompressed_blocks <= map.config().decompressed_cache_blocks);
        assert!(stats.compression_ratio() > 1.0);

        map.trim_caches();
        assert_eq!(map.stats().decompressed_blocks, 0);

        // writes into a sealed block rewrite it raw
        map.put(&key(7), b"changed", 0).unwrap();
        assert_eq!(map.get(&key(7)).unwrap(), Some(b"changed".to_vec()));
        map.verify_partition().unwrap();
    }

    #[test]
    fn test_value_compression() {
        let config = MapConfig {
            max_block_size: 4096,
            value_compression_threshold: Some(256),
            codec: CodecConfig {
                codec_type: CodecType::Zstd,
                level: 3,
                ..CodecConfig::default()
            },
            ..MapConfig::for_testing()
        };
        let map = BigSortedMap::new(config).unwrap();
        // logical size exceeds the block, stored size does not
        let value = vec![b'x'; 10_000];
        assert!(map.put(b"big", &value, 0).unwrap());
        assert_eq!(map.get(b"big").unwrap(), Some(value));
    }

    #[test]
    fn test_train_dictionary() {
        let config = MapConfig {
            codec: CodecConfig {
                codec_type: CodecType::Zstd,
                level: 3,
                ..CodecConfig::default()
            },
            ..MapConfig::for_testing()
        };
        let map = BigSortedMap::new(config).unwrap();
        for i in 0..2000u32 {
            let value = format!("{{\"id\":{},\"name\":\"user-{}\",\"active\":{}}}", i, i * 7, i % 2 == 0);
            map.put(&key(i), value.as_bytes(), 0).unwrap();
        }
        let dictionary = map.train_dictionary(4096).unwrap();
        assert_ne!(dictionary.id(), 0);
        assert_eq!(map.context().codec().dictionary_id(), dictionary.id());

        map.seal_all().unwrap();
        map.swap_codec(codec::create(CodecType::Lz4, 1, 100, None));
        let value = map.get(&key(1234)).unwrap().unwrap();
        assert!(value.starts_with(b"{\"id\":1234"));
    }

    #[test]
    fn test_concurrent_writers() {
        let map = Arc::new(map());
        let handles: Vec<_> = (0..4u32)
            .map(|t| {
                let map = map.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        let k = key(t * 10_000 + i);
                        assert!(map.put(&k, &k, 0).unwrap());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(map.stats().records, 2000);
        map.verify_partition().unwrap();
        for t in 0..4u32 {
            for i in 0..500 {
                let k = key(t * 10_000 + i);
                assert_eq!(map.get(&k).unwrap(), Some(k.clone()));
            }
        }
    }
}
