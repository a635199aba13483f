//! DataBlock: fixed-capacity leaf holding sorted records
//!
//! ## Layout
//! ```text
//! arena:   [record 0][record 1]...[record n-1]   (sorted by key, contiguous)
//! offsets: [off 0, off 1, ..., off n-1]          (binary search index)
//! ```
//!
//! A block owns the half-open key range `[lo, hi)`; `lo` is its identity in the
//! parent index block. Records never span blocks.
//!
//! ## Compression
//! - `seal()` compresses the arena with the active codec and drops the raw copy
//! - first access after sealing decompresses lazily and keeps the raw copy as a
//!   cache until it is evicted (`drop_decompressed`) or the block is mutated
//! - compressed payloads carry the codec tag that produced them

use super::context::EngineContext;
use super::memory::MemoryTracker;
use super::record::{RecordLayout, RecordSpec};
use super::scanner::ScanEntry;
use crate::codec::{Codec, CodecTag, CodecType};
use crate::{Result, StorageError};
use parking_lot::Mutex;
use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bytes of every block's capacity reserved for block metadata
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Approximate fixed heap cost of one block, counted by memory accounting
const BLOCK_STRUCT_OVERHEAD: usize = 128;

/// Smallest arena allocation
const SIZE_CLASS_MIN: usize = 256;

pub type BlockRef = Arc<Mutex<DataBlock>>;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug)]
struct CompressedPayload {
    tag: CodecTag,
    raw_len: usize,
    bytes: Vec<u8>,
}

/// Result of a single-record insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Inserted,
    Updated,
    /// The record fits a block but not this one; split and retry
    NeedSplit,
}

/// Decoded view of a stored record
#[derive(Debug, Clone)]
pub struct RecordView<'a> {
    pub key: &'a [u8],
    /// Logical value (decompressed if it was stored compressed)
    pub value: Cow<'a, [u8]>,
    pub expire: u64,
    pub seq: u64,
}

impl<'a> RecordView<'a> {
    pub fn has_prefix(&self, prefix: &[u8]) -> bool {
        self.key.starts_with(prefix)
    }
}

#[derive(Debug)]
pub struct DataBlock {
    id: u64,
    lo: Vec<u8>,
    hi: Option<Vec<u8>>,
    max_size: usize,
    arena: Vec<u8>,
    offsets: Vec<u32>,
    /// arena/offsets hold the current records
    decompressed: bool,
    compressed: Option<CompressedPayload>,
    record_count: usize,
    used: usize,
    accounted: usize,
    retired: bool,
}

fn size_class(needed: usize, max: usize) -> usize {
    let mut class = SIZE_CLASS_MIN;
    while class < needed {
        class *= 2;
    }
    class.min(max).max(needed)
}

/// Rebuild the offset index of a decompressed arena
fn index_records(arena: &[u8]) -> Result<Vec<u32>> {
    let mut offsets = Vec::new();
    let mut pos = 0;
    while pos < arena.len() {
        offsets.push(pos as u32);
        pos = RecordLayout::parse(arena, pos)?.end();
    }
    Ok(offsets)
}

impl DataBlock {
    pub fn new(lo: Vec<u8>, hi: Option<Vec<u8>>, max_size: usize) -> Self {
        Self {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            lo,
            hi,
            max_size,
            arena: Vec::new(),
            offsets: Vec::new(),
            decompressed: true,
            compressed: None,
            record_count: 0,
            used: 0,
            accounted: 0,
            retired: false,
        }
    }

    pub fn into_ref(self) -> BlockRef {
        Arc::new(Mutex::new(self))
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

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    pub fn len(&self) -> usize {
        self.record_count
    }

    pub fn is_empty(&self) -> bool {
        self.record_count == 0
    }

    /// Bytes used by records (uncompressed)
    pub fn used_size(&self) -> usize {
        self.used
    }

    /// Bytes available to records
    pub fn capacity(&self) -> usize {
        self.max_size - BLOCK_HEADER_SIZE
    }

    pub fn is_sealed(&self) -> bool {
        self.compressed.is_some()
    }

    pub fn is_decompressed(&self) -> bool {
        self.decompressed
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed.as_ref().map(|c| c.bytes.len()).unwrap_or(0)
    }

    /// Does this block own `key`?
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.lo.as_slice() <= key && self.hi.as_deref().map_or(true, |hi| key < hi)
    }

    // ===== Compression =====

    /// Decompress if needed; returns true when a decompression happened
    pub fn ensure_decompressed(&mut self, ctx: &EngineContext) -> Result<bool> {
        if self.decompressed {
            return Ok(false);
        }
        let payload = self
            .compressed
            .as_ref()
            .ok_or_else(|| StorageError::Corruption(format!("block {} has no records", self.id)))?;
        let decoder = ctx.decoder_for(payload.tag)?;
        let arena = decoder.decompress_to_vec(&payload.bytes, payload.raw_len)?;
        let offsets = index_records(&arena)?;
        if offsets.len() != self.record_count {
            return Err(StorageError::Codec(format!(
                "block {} decompressed to {} records, expected {} (codec {})",
                self.id,
                offsets.len(),
                self.record_count,
                payload.tag.codec_type
            )));
        }
        self.arena = arena;
        self.offsets = offsets;
        self.decompressed = true;
        Ok(true)
    }

    /// Drop the decompressed cache of a sealed block
    pub fn drop_decompressed(&mut self) -> bool {
        if self.compressed.is_none() || !self.decompressed {
            return false;
        }
        self.arena = Vec::new();
        self.offsets = Vec::new();
        self.decompressed = false;
        true
    }

    /// Make the raw arena authoritative; the compressed payload becomes stale
    pub fn prepare_mutation(&mut self, ctx: &EngineContext) -> Result<()> {
        self.ensure_decompressed(ctx)?;
        self.compressed = None;
        Ok(())
    }

    /// Compress the arena with `codec`; returns true if the block is now sealed
    pub fn seal(&mut self, codec: &dyn Codec) -> Result<bool> {
        if self.retired
            || self.compressed.is_some()
            || !self.decompressed
            || codec.codec_type() == CodecType::None
            || self.used == 0
            || self.used < codec.compression_threshold()
        {
            return Ok(false);
        }
        let bytes = codec.compress_to_vec(&self.arena)?;
        if bytes.len() >= self.used {
            return Ok(false);
        }
        log::trace!(
            "sealed block {} with {}: {} -> {} bytes",
            self.id,
            codec.codec_type(),
            self.used,
            bytes.len()
        );
        self.compressed = Some(CompressedPayload {
            tag: codec.tag(),
            raw_len: self.used,
            bytes,
        });
        self.arena = Vec::new();
        self.offsets = Vec::new();
        self.decompressed = false;
        Ok(true)
    }

    pub fn codec_tag(&self) -> Option<CodecTag> {
        self.compressed.as_ref().map(|c| c.tag)
    }

    // ===== Lookup =====

    fn check_decompressed(&self) -> Result<()> {
        if self.decompressed {
            Ok(())
        } else {
            Err(StorageError::Corruption(format!(
                "block {} accessed while compressed",
                self.id
            )))
        }
    }

    pub fn layout(&self, idx: usize) -> Result<RecordLayout> {
        let offset = *self.offsets.get(idx).ok_or_else(|| {
            StorageError::Corruption(format!("record index {} out of {}", idx, self.offsets.len()))
        })?;
        RecordLayout::parse(&self.arena, offset as usize)
    }

    pub fn key_at(&self, idx: usize) -> Result<&[u8]> {
        let layout = self.layout(idx)?;
        Ok(layout.key(&self.arena))
    }

    /// Binary search; `Err(pos)` is the insertion point
    fn find(&self, key: &[u8]) -> Result<std::result::Result<usize, usize>> {
        self.check_decompressed()?;
        let mut low = 0;
        let mut high = self.offsets.len();
        while low < high {
            let mid = (low + high) / 2;
            match self.key_at(mid)?.cmp(key) {
                CmpOrdering::Less => low = mid + 1,
                CmpOrdering::Greater => high = mid,
                CmpOrdering::Equal => return Ok(Ok(mid)),
            }
        }
        Ok(Err(low))
    }

    /// Exact lookup, or the greatest key <= `key` when `floor` is set
    pub fn search(&self, key: &[u8], floor: bool) -> Result<Option<usize>> {
        Ok(match self.find(key)? {
            Ok(idx) => Some(idx),
            Err(pos) if floor && pos > 0 => Some(pos - 1),
            Err(_) => None,
        })
    }

    /// Decode record `idx`, decompressing its value if needed
    pub fn view(&self, idx: usize, ctx: &EngineContext) -> Result<RecordView<'_>> {
        let layout = self.layout(idx)?;
        let stored = layout.stored_value(&self.arena);
        let value = match layout.compression {
            None => Cow::Borrowed(stored),
            Some(c) => Cow::Owned(ctx.decoder_for(c.tag)?.decompress_to_vec(stored, c.raw_len)?),
        };
        Ok(RecordView {
            key: layout.key(&self.arena),
            value,
            expire: layout.expire,
            seq: layout.seq,
        })
    }

    /// Copy live records in `[start, end)` into `out` (ascending)
    pub fn collect_range(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        snapshot: Option<u64>,
        now_ms: u64,
        ctx: &EngineContext,
        out: &mut Vec<ScanEntry>,
    ) -> Result<()> {
        let first = match self.find(start)? {
            Ok(idx) => idx,
            Err(pos) => pos,
        };
        for idx in first..self.offsets.len() {
            let layout = self.layout(idx)?;
            let key = layout.key(&self.arena);
            if end.map_or(false, |e| key >= e) {
                break;
            }
            if layout.is_expired(now_ms) || snapshot.map_or(false, |s| layout.seq > s) {
                continue;
            }
            let view = self.view(idx, ctx)?;
            out.push(ScanEntry {
                key: key.to_vec(),
                value: view.value.into_owned(),
                expire: layout.expire,
            });
        }
        Ok(())
    }

    /// Copy live records in `[start, end)` into `out` (descending)
    pub fn collect_range_rev(
        &self,
        start: &[u8],
        end: Option<&[u8]>,
        snapshot: Option<u64>,
        now_ms: u64,
        ctx: &EngineContext,
        out: &mut Vec<ScanEntry>,
    ) -> Result<()> {
        let upper = match end {
            Some(e) => match self.find(e)? {
                Ok(idx) => idx,
                Err(pos) => pos,
            },
            None => {
                self.check_decompressed()?;
                self.offsets.len()
            }
        };
        for idx in (0..upper).rev() {
            let layout = self.layout(idx)?;
            let key = layout.key(&self.arena);
            if key < start {
                break;
            }
            if layout.is_expired(now_ms) || snapshot.map_or(false, |s| layout.seq > s) {
                continue;
            }
            let view = self.view(idx, ctx)?;
            out.push(ScanEntry {
                key: key.to_vec(),
                value: view.value.into_owned(),
                expire: layout.expire,
            });
        }
        Ok(())
    }

    /// Keys of expired records
    pub fn expired_keys(&self, now_ms: u64) -> Result<Vec<Vec<u8>>> {
        self.check_decompressed()?;
        let mut keys = Vec::new();
        for idx in 0..self.offsets.len() {
            let layout = self.layout(idx)?;
            if layout.is_expired(now_ms) {
                keys.push(layout.key(&self.arena).to_vec());
            }
        }
        Ok(keys)
    }

    #[cfg(test)]
    fn arena(&self) -> &[u8] {
        &self.arena
    }

    // ===== Mutation =====

    fn reserve_for(&mut self, needed: usize) {
        if self.arena.capacity() < needed {
            let target = size_class(needed, self.max_size);
            self.arena.reserve_exact(target - self.arena.len());
        }
    }

    fn shrink_if_sparse(&mut self) {
        let class = size_class(self.arena.len(), self.max_size);
        if self.arena.capacity() > class * 2 {
            self.arena.shrink_to(class);
        }
    }

    fn shift_offsets(&mut self, from: usize, delta: i64) {
        if delta == 0 {
            return;
        }
        for off in &mut self.offsets[from..] {
            *off = (*off as i64 + delta) as u32;
        }
    }

    /// Insert or overwrite one record in place
    ///
    /// The block must have been prepared with [`prepare_mutation`](Self::prepare_mutation).
    pub fn put(&mut self, spec: &RecordSpec<'_>) -> Result<PutOutcome> {
        let new_len = spec.encoded_len();
        if new_len > self.capacity() {
            return Err(StorageError::RecordTooLarge {
                size: new_len,
                max: self.capacity(),
            });
        }
        match self.find(spec.key)? {
            Ok(idx) => {
                let layout = self.layout(idx)?;
                let old_len = layout.total_len();
                let new_used = self.used - old_len + new_len;
                if new_used > self.capacity() {
                    return Ok(PutOutcome::NeedSplit);
                }
                self.reserve_for(new_used);
                let start = layout.offset;
                self.arena.splice(start..start + old_len, spec.encode());
                self.shift_offsets(idx + 1, new_len as i64 - old_len as i64);
                self.used = new_used;
                Ok(PutOutcome::Updated)
            }
            Err(pos) => {
                let new_used = self.used + new_len;
                if new_used > self.capacity() {
                    return Ok(PutOutcome::NeedSplit);
                }
                self.reserve_for(new_used);
                let start = match self.offsets.get(pos) {
                    Some(off) => *off as usize,
                    None => self.arena.len(),
                };
                self.arena.splice(start..start, spec.encode());
                self.offsets.insert(pos, start as u32);
                self.shift_offsets(pos + 1, new_len as i64);
                self.used = new_used;
                self.record_count += 1;
                Ok(PutOutcome::Inserted)
            }
        }
    }

    /// Remove one record, compacting the gap
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        let idx = match self.find(key)? {
            Ok(idx) => idx,
            Err(_) => return Ok(false),
        };
        let layout = self.layout(idx)?;
        let len = layout.total_len();
        self.arena.drain(layout.offset..layout.offset + len);
        self.offsets.remove(idx);
        self.shift_offsets(idx, -(len as i64));
        self.used -= len;
        self.record_count -= 1;
        self.shrink_if_sparse();
        Ok(true)
    }

    /// Move the upper half (by cumulative bytes) into a new sibling
    ///
    /// `incoming` is the key that did not fit; it decides the split point when
    /// the block holds a single record.
    pub fn split(&mut self, incoming: &[u8]) -> Result<DataBlock> {
        self.check_decompressed()?;
        let count = self.offsets.len();
        let split_idx = match count {
            0 => {
                return Err(StorageError::InvalidArgument(format!(
                    "cannot split empty block {}",
                    self.id
                )))
            }
            1 => {
                if incoming > self.key_at(0)? {
                    1
                } else {
                    0
                }
            }
            _ => {
                let half = self.used / 2;
                self.offsets
                    .partition_point(|&off| (off as usize) < half)
                    .clamp(1, count - 1)
            }
        };

        let right_lo = if split_idx < count {
            self.key_at(split_idx)?.to_vec()
        } else {
            incoming.to_vec()
        };
        if right_lo.as_slice() <= self.lo.as_slice() {
            return Err(StorageError::Corruption(format!(
                "split of block {} would not advance its low key",
                self.id
            )));
        }

        let cut = match self.offsets.get(split_idx) {
            Some(off) => *off as usize,
            None => self.arena.len(),
        };
        let tail = self.arena.split_off(cut);
        let right_offsets: Vec<u32> = self.offsets[split_idx..]
            .iter()
            .map(|off| off - cut as u32)
            .collect();
        self.offsets.truncate(split_idx);

        let mut right = DataBlock::new(right_lo.clone(), self.hi.take(), self.max_size);
        right.used = tail.len();
        right.record_count = right_offsets.len();
        right.offsets = right_offsets;
        right.arena = tail;
        right.reserve_for(right.used);

        self.hi = Some(right_lo);
        self.used = cut;
        self.record_count = split_idx;
        self.shrink_if_sparse();

        log::trace!(
            "split block {} at record {}/{}: left {} bytes, right {} bytes (new block {})",
            self.id,
            split_idx,
            count,
            self.used,
            right.used,
            right.id
        );
        Ok(right)
    }

    /// Absorb the adjacent right sibling; the sibling is retired
    pub fn merge_from(&mut self, right: &mut DataBlock) -> Result<()> {
        self.check_decompressed()?;
        right.check_decompressed()?;
        if self.hi.as_deref() != Some(right.lo.as_slice()) {
            return Err(StorageError::InvalidArgument(format!(
                "block {} is not adjacent to block {}",
                self.id, right.id
            )));
        }
        if self.used + right.used > self.capacity() {
            return Err(StorageError::InvalidArgument(format!(
                "blocks {} and {} do not fit into one block",
                self.id, right.id
            )));
        }
        let base = self.arena.len() as u32;
        self.reserve_for(self.used + right.used);
        self.arena.extend_from_slice(&right.arena);
        self.offsets.extend(right.offsets.iter().map(|off| off + base));
        self.used += right.used;
        self.record_count += right.record_count;
        self.hi = right.hi.take();
        self.compressed = None;
        right.retire();
        Ok(())
    }

    /// Mark this block as merged away and release its memory
    pub fn retire(&mut self) {
        self.retired = true;
        self.arena = Vec::new();
        self.offsets = Vec::new();
        self.compressed = None;
        self.decompressed = true;
        self.used = 0;
        self.record_count = 0;
    }

    // ===== Accounting =====

    pub fn footprint(&self) -> usize {
        if self.retired {
            return 0;
        }
        BLOCK_STRUCT_OVERHEAD
            + self.lo.len()
            + self.hi.as_ref().map_or(0, |h| h.len())
            + self.arena.capacity()
            + self.offsets.capacity() * std::mem::size_of::<u32>()
            + self.compressed.as_ref().map_or(0, |c| c.bytes.capacity())
    }

    /// Push the change in footprint since the last sync to the tracker
    pub fn sync_accounting(&mut self, memory: &MemoryTracker) {
        let now = self.footprint();
        memory.incr(now as i64 - self.accounted as i64);
        self.accounted = now;
    }

    /// Forget previous accounting and return the current footprint
    pub fn reset_accounting(&mut self) -> usize {
        self.accounted = self.footprint();
        self.accounted
    }

    /// Verify record order and range ownership
    pub fn check_invariants(&self) -> Result<()> {
        self.check_decompressed()?;
        let mut prev: Option<&[u8]> = None;
        for idx in 0..self.offsets.len() {
            let key = self.key_at(idx)?;
            if !self.contains_key(key) {
                return Err(StorageError::Corruption(format!(
                    "block {} holds key {:?} outside its range",
                    self.id, key
                )));
            }
            if let Some(p) = prev {
                if p >= key {
                    return Err(StorageError::Corruption(format!(
                        "block {} keys out of order at record {}",
                        self.id, idx
                    )));
                }
            }
            prev = Some(key);
        }
        Ok(())
    }
}
