//! Operations: read-modify-write commands executed under one block lock
//!
//! ## Protocol
//! 1. The map locks the block owning [`Operation::key`] and looks the key up
//!    (exact, or floor when [`Operation::floor`] is set). Expired records are
//!    hidden.
//! 2. [`Operation::execute`] inspects the found record, which may belong to a
//!    different logical key after a floor lookup, and emits zero or more
//!    [`Update`]s.
//! 3. The map validates and applies every update before unlocking.
//!
//! Each Redis-style command is one Operation struct plus a dispatcher
//! function on the matching command type ([`Strings`], [`Hashes`], [`Sets`],
//! [`ZSets`], [`SparseBitmaps`]).

pub mod bitmap;
pub mod hash;
pub mod scratch;
pub mod set;
pub mod string;
pub mod zset;

pub use bitmap::{SparseBitmaps, SparseChunkCount, SparseGetBit, SparseSetBit};
pub use hash::{HashDelete, HashExists, HashGet, HashIncrBy, HashSet, Hashes};
pub use set::{SetAdd, SetIsMember, SetRemove, Sets};
pub use string::{
    IncrementLong, SetCondition, StringAppend, StringGet, StringGetSet, StringLength, StringSet,
    StringSetRange, Strings,
};
pub use zset::{ZSetAdd, ZSetIncrBy, ZSetRemove, ZSetScore, ZSets};

pub use crate::storage::data_block::RecordView;

use std::ops::Range;

use crate::config::MapConfig;
use crate::{Result, StorageError};

/// Most updates a single operation may emit
pub const MAX_UPDATES: usize = 64;

/// One output triple of an operation
///
/// Borrowed from the [`Updates`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Update<'a> {
    pub key: &'a [u8],
    pub value: &'a [u8],
    /// Epoch millis, 0 = no expiration
    pub expire: u64,
    pub is_delete: bool,
}

#[derive(Debug)]
struct Entry {
    key: Vec<u8>,
    value: Range<usize>,
    expire: u64,
    is_delete: bool,
}

/// Output buffer filled by [`Operation::execute`]
///
/// Values are packed into one arena borrowed from the thread's
/// [`scratch`] buffer and returned to it on drop.
#[derive(Debug)]
pub struct Updates {
    entries: Vec<Entry>,
    values: Vec<u8>,
}

impl Default for Updates {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Updates {
    fn drop(&mut self) {
        scratch::give_back(std::mem::take(&mut self.values));
    }
}

impl Updates {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            values: scratch::take(),
        }
    }

    fn check_room(&self) -> Result<()> {
        if self.entries.len() >= MAX_UPDATES {
            return Err(StorageError::InvalidArgument(format!(
                "operation emitted more than {} updates",
                MAX_UPDATES
            )));
        }
        Ok(())
    }

    pub fn put(&mut self, key: Vec<u8>, value: &[u8], expire: u64) -> Result<()> {
        self.put_with(key, expire, |buf| buf.extend_from_slice(value))
    }

    /// Put a value built in place inside the arena
    pub fn put_with<F>(&mut self, key: Vec<u8>, expire: u64, build: F) -> Result<()>
    where
        F: FnOnce(&mut ValueBuf<'_>),
    {
        self.check_room()?;
        let start = self.values.len();
        build(&mut ValueBuf {
            buf: &mut self.values,
            start,
        });
        let end = self.values.len();
        self.entries.push(Entry {
            key,
            value: start..end,
            expire,
            is_delete: false,
        });
        Ok(())
    }

    pub fn delete(&mut self, key: Vec<u8>) -> Result<()> {
        self.check_room()?;
        let at = self.values.len();
        self.entries.push(Entry {
            key,
            value: at..at,
            expire: 0,
            is_delete: true,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Update<'_>> {
        self.entries.get(idx).map(|e| self.view(e))
    }

    pub fn iter(&self) -> impl Iterator<Item = Update<'_>> + '_ {
        self.entries.iter().map(move |e| self.view(e))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.values.clear();
    }

    fn view<'a>(&'a self, e: &'a Entry) -> Update<'a> {
        Update {
            key: &e.key,
            value: &self.values[e.value.clone()],
            expire: e.expire,
            is_delete: e.is_delete,
        }
    }
}

/// Value under construction in an [`Updates`] arena
///
/// Offsets are relative to the start of this value.
pub struct ValueBuf<'a> {
    buf: &'a mut Vec<u8>,
    start: usize,
}

impl ValueBuf<'_> {
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn resize(&mut self, len: usize, fill: u8) {
        self.buf.resize(self.start + len, fill);
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..]
    }
}

/// Read-only environment handed to an operation
#[derive(Debug, Clone, Copy)]
pub struct OpContext<'a> {
    pub config: &'a MapConfig,
    /// Wall clock used for expiration checks during this call
    pub now_ms: u64,
}

pub trait Operation {
    /// Composite key to lock and look up
    fn key(&self) -> &[u8];

    /// Fall back to the greatest key <= `key()` inside the owning block
    fn floor(&self) -> bool {
        false
    }

    /// Compute updates from the found record
    ///
    /// Returning `Ok(false)` reports a failed precondition; emitted updates
    /// are discarded in that case.
    fn execute(
        &mut self,
        found: Option<&RecordView<'_>>,
        ctx: &OpContext<'_>,
        updates: &mut Updates,
    ) -> Result<bool>;
}

/// Found record if it is exactly `key`
pub(crate) fn exact<'r, 'a>(found: Option<&'r RecordView<'a>>, key: &[u8]) -> Option<&'r RecordView<'a>> {
    found.filter(|r| r.key == key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updates_limit() {
        let mut updates = Updates::new();
        for i in 0..MAX_UPDATES {
            updates.put(vec![i as u8], &[], 0).unwrap();
        }
        assert!(matches!(
            updates.delete(vec![0]),
            Err(StorageError::InvalidArgument(_))
        ));
        assert_eq!(updates.len(), MAX_UPDATES);
        updates.clear();
        assert!(updates.is_empty());
    }

    #[test]
    fn test_values_share_one_arena() {
        let mut updates = Updates::new();
        updates.put(b"a".to_vec(), b"one", 5).unwrap();
        updates
            .put_with(b"b".to_vec(), 0, |buf| {
                buf.extend_from_slice(b"xy");
                buf.resize(5, b'-');
                buf.as_mut_slice()[4] = b'z';
            })
            .unwrap();
        updates.delete(b"c".to_vec()).unwrap();

        let all: Vec<Update<'_>> = updates.iter().collect();
        assert_eq!(all.len(), 3);
        assert_eq!((all[0].key, all[0].value, all[0].expire), (&b"a"[..], &b"one"[..], 5));
        assert_eq!(all[1].value, b"xy--z");
        assert!(all[2].is_delete);
        assert!(all[2].value.is_empty());
        assert_eq!(updates.get(1).map(|u| u.key), Some(&b"b"[..]));
    }

    #[test]
    fn test_arena_returns_to_scratch() {
        {
            let mut updates = Updates::new();
            updates.put(b"k".to_vec(), &[7u8; 4096], 0).unwrap();
        }
        assert!(scratch::scratch_capacity() >= 4096);
        let updates = Updates::new();
        assert_eq!(scratch::scratch_capacity(), 0);
        drop(updates);
        assert!(scratch::scratch_capacity() >= 4096);
    }
}
