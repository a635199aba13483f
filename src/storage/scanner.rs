//! Range scanner
//!
//! Copies the in-range records of one block while holding its lock, then
//! releases it. The next block is resolved by key (the previous block's `hi`,
//! or `lo` when scanning backwards), never by block identity, so concurrent
//! splits and merges cannot make the scanner skip or repeat keys.

use super::key;
use super::map::BigSortedMap;
use super::record;
use crate::Result;
use std::cmp;
use std::collections::VecDeque;

/// One record produced by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    /// Epoch millis, 0 = no expiration
    pub expire: u64,
}

#[derive(Debug, Clone)]
enum Cursor {
    /// Forward: next block is the one owning this key
    From(Vec<u8>),
    /// Reverse: next block holds the keys just below this one
    Before(Vec<u8>),
    /// Reverse: start at the last block
    Last,
    Done,
}

pub struct Scanner<'m> {
    map: &'m BigSortedMap,
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    snapshot: Option<u64>,
    reverse: bool,
    now_ms: u64,
    cursor: Cursor,
    buffer: VecDeque<ScanEntry>,
    current: Option<ScanEntry>,
}

impl<'m> Scanner<'m> {
    pub(crate) fn new(
        map: &'m BigSortedMap,
        start: &[u8],
        end: Option<&[u8]>,
        snapshot: Option<u64>,
        reverse: bool,
    ) -> Self {
        let empty_range = end.map_or(false, |e| e <= start);
        let cursor = if empty_range {
            Cursor::Done
        } else if reverse {
            match end {
                Some(e) => Cursor::Before(e.to_vec()),
                None => Cursor::Last,
            }
        } else {
            Cursor::From(start.to_vec())
        };
        Self {
            map,
            start: start.to_vec(),
            end: end.map(|e| e.to_vec()),
            snapshot,
            reverse,
            now_ms: record::now_millis(),
            cursor,
            buffer: VecDeque::new(),
            current: None,
        }
    }

    pub fn snapshot(&self) -> Option<u64> {
        self.snapshot
    }

    pub fn is_reverse(&self) -> bool {
        self.reverse
    }

    /// Pull blocks until at least one entry is buffered or the range ends
    fn fill(&mut self) -> Result<()> {
        while self.buffer.is_empty() {
            let mut batch = Vec::new();
            let next = match std::mem::replace(&mut self.cursor, Cursor::Done) {
                Cursor::Done => return Ok(()),
                Cursor::From(from) => self
                    .map
                    .scan_block(&from, self.end.as_deref(), self.snapshot, self.now_ms, &mut batch)?
                    .map(Cursor::From),
                Cursor::Before(before) => self
                    .map
                    .scan_block_rev(&self.start, Some(&before), self.snapshot, self.now_ms, &mut batch)?
                    .map(Cursor::Before),
                Cursor::Last => self
                    .map
                    .scan_block_rev(&self.start, None, self.snapshot, self.now_ms, &mut batch)?
                    .map(Cursor::Before),
            };
            self.cursor = next.unwrap_or(Cursor::Done);
            self.buffer.extend(batch);
        }
        Ok(())
    }

    pub fn has_next(&mut self) -> Result<bool> {
        self.fill()?;
        Ok(!self.buffer.is_empty())
    }

    /// Move to the next entry; returns false at the end of the range
    pub fn advance(&mut self) -> Result<bool> {
        self.fill()?;
        self.current = self.buffer.pop_front();
        Ok(self.current.is_some())
    }

    /// Key of the entry reached by the last [`advance`](Self::advance)
    pub fn key(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.key.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.current.as_ref().map(|e| e.value.as_slice())
    }

    pub fn value_size(&self) -> Option<usize> {
        self.current.as_ref().map(|e| e.value.len())
    }

    /// Continue from `key`, clamped to the scanner's range
    ///
    /// Forward scanners resume at the first key >= `key`; reverse scanners at
    /// the last key <= `key`.
    pub fn seek(&mut self, key: &[u8]) {
        self.buffer.clear();
        self.current = None;
        self.cursor = if self.reverse {
            let bound = key::next_key(key);
            let bound = match &self.end {
                Some(end) => cmp::min(bound, end.clone()),
                None => bound,
            };
            if bound.as_slice() <= self.start.as_slice() {
                Cursor::Done
            } else {
                Cursor::Before(bound)
            }
        } else {
            let from = cmp::max(key, self.start.as_slice()).to_vec();
            match &self.end {
                Some(end) if from.as_slice() >= end.as_slice() => Cursor::Done,
                _ => Cursor::From(from),
            }
        };
    }

    /// Release buffered entries; the scanner yields nothing afterwards
    pub fn close(&mut self) {
        self.cursor = Cursor::Done;
        self.buffer.clear();
        self.current = None;
    }
}

impl Iterator for Scanner<'_> {
    type Item = Result<ScanEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Err(e) = self.fill() {
            self.close();
            return Some(Err(e));
        }
        self.buffer.pop_front().map(Ok)
    }
}
