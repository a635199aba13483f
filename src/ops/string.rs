//! String commands: SET, GET, APPEND, INCRBY, GETSET, SETRANGE, STRLEN
//!
//! A string is a single record keyed `[String][len][key]`. Counters are
//! stored as 8-byte big-endian `i64`.

use super::{exact, OpContext, Operation, RecordView, Updates};
use crate::storage::key::{self, DataType};
use crate::storage::BigSortedMap;
use crate::{Result, StorageError};

/// Largest offset accepted by SETRANGE
pub const MAX_SET_RANGE_OFFSET: usize = 1 << 29;

/// Write precondition of SET
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// NX
    IfAbsent,
    /// XX
    IfPresent,
}

pub fn string_key(key: &[u8]) -> Vec<u8> {
    key::encode(DataType::String, key, &[])
}

/// Decode a stored counter
pub fn decode_long(value: &[u8]) -> Result<i64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        StorageError::WrongType(format!("counter value has {} bytes, expected 8", value.len()))
    })?;
    Ok(i64::from_be_bytes(bytes))
}

#[derive(Debug)]
pub struct StringSet {
    key: Vec<u8>,
    value: Vec<u8>,
    expire: u64,
    condition: SetCondition,
}

impl StringSet {
    pub fn new(key: &[u8], value: &[u8], expire: u64, condition: SetCondition) -> Self {
        Self {
            key: string_key(key),
            value: value.to_vec(),
            expire,
            condition,
        }
    }
}

impl Operation for StringSet {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        let exists = exact(found, &self.key).is_some();
        match (self.condition, exists) {
            (SetCondition::IfAbsent, true) | (SetCondition::IfPresent, false) => Ok(false),
            _ => {
                updates.put(self.key.clone(), &self.value, self.expire)?;
                Ok(true)
            }
        }
    }
}

#[derive(Debug)]
pub struct StringGet {
    key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl StringGet {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: string_key(key),
            value: None,
        }
    }
}

impl Operation for StringGet {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.value = exact(found, &self.key).map(|r| r.value.to_vec());
        Ok(true)
    }
}

/// APPEND: append-to-absent behaves like SET; the expiration is kept
#[derive(Debug)]
pub struct StringAppend {
    key: Vec<u8>,
    suffix: Vec<u8>,
    pub new_len: usize,
}

impl StringAppend {
    pub fn new(key: &[u8], suffix: &[u8]) -> Self {
        Self {
            key: string_key(key),
            suffix: suffix.to_vec(),
            new_len: 0,
        }
    }
}

impl Operation for StringAppend {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        match exact(found, &self.key) {
            Some(record) => {
                let suffix = &self.suffix;
                updates.put_with(self.key.clone(), record.expire, |buf| {
                    buf.extend_from_slice(&record.value);
                    buf.extend_from_slice(suffix);
                })?;
                self.new_len = record.value.len() + self.suffix.len();
            }
            None => {
                self.new_len = self.suffix.len();
                updates.put(self.key.clone(), &self.suffix, 0)?;
            }
        }
        Ok(true)
    }
}

/// INCRBY on an 8-byte big-endian counter; absent counts as 0
#[derive(Debug)]
pub struct IncrementLong {
    key: Vec<u8>,
    delta: i64,
    pub result: i64,
}

impl IncrementLong {
    pub fn new(key: &[u8], delta: i64) -> Self {
        Self::with_composite_key(string_key(key), delta)
    }

    /// Increment a counter stored under an already encoded key
    pub fn with_composite_key(key: Vec<u8>, delta: i64) -> Self {
        Self { key, delta, result: 0 }
    }
}

impl Operation for IncrementLong {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        let (current, expire) = match exact(found, &self.key) {
            Some(record) => (decode_long(&record.value)?, record.expire),
            None => (0, 0),
        };
        self.result = current.checked_add(self.delta).ok_or_else(|| {
            StorageError::InvalidArgument(format!("increment {} of {} overflows", self.delta, current))
        })?;
        updates.put(self.key.clone(), &self.result.to_be_bytes(), expire)?;
        Ok(true)
    }
}

/// GETSET: store a new value (clearing any expiration), return the old one
#[derive(Debug)]
pub struct StringGetSet {
    key: Vec<u8>,
    value: Vec<u8>,
    pub previous: Option<Vec<u8>>,
}

impl StringGetSet {
    pub fn new(key: &[u8], value: &[u8]) -> Self {
        Self {
            key: string_key(key),
            value: value.to_vec(),
            previous: None,
        }
    }
}

impl Operation for StringGetSet {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        self.previous = exact(found, &self.key).map(|r| r.value.to_vec());
        updates.put(self.key.clone(), &self.value, 0)?;
        Ok(true)
    }
}

/// SETRANGE: overwrite from `offset`, zero-padding a shorter value
#[derive(Debug)]
pub struct StringSetRange {
    key: Vec<u8>,
    offset: usize,
    bytes: Vec<u8>,
    pub new_len: usize,
}

impl StringSetRange {
    pub fn new(key: &[u8], offset: usize, bytes: &[u8]) -> Self {
        Self {
            key: string_key(key),
            offset,
            bytes: bytes.to_vec(),
            new_len: 0,
        }
    }
}

impl Operation for StringSetRange {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        if self.offset > MAX_SET_RANGE_OFFSET {
            return Err(StorageError::InvalidArgument(format!(
                "offset {} exceeds {}",
                self.offset, MAX_SET_RANGE_OFFSET
            )));
        }
        let existing = exact(found, &self.key);
        if self.bytes.is_empty() {
            self.new_len = existing.map(|r| r.value.len()).unwrap_or(0);
            return Ok(true);
        }
        let expire = existing.map(|r| r.expire).unwrap_or(0);
        let (offset, bytes) = (self.offset, &self.bytes);
        let end = offset + bytes.len();
        updates.put_with(self.key.clone(), expire, |buf| {
            if let Some(record) = existing {
                buf.extend_from_slice(&record.value);
            }
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf.as_mut_slice()[offset..end].copy_from_slice(bytes);
        })?;
        self.new_len = existing.map_or(end, |r| r.value.len().max(end));
        Ok(true)
    }
}

#[derive(Debug)]
pub struct StringLength {
    key: Vec<u8>,
    pub len: usize,
}

impl StringLength {
    pub fn new(key: &[u8]) -> Self {
        Self {
            key: string_key(key),
            len: 0,
        }
    }
}

impl Operation for StringLength {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.len = exact(found, &self.key).map(|r| r.value.len()).unwrap_or(0);
        Ok(true)
    }
}

/// String command dispatcher
///
/// Write commands return `None` (or `false`) when the memory limit refused
/// the write.
pub struct Strings;

impl Strings {
    pub fn set(map: &BigSortedMap, key: &[u8], value: &[u8], expire: u64, condition: SetCondition) -> Result<bool> {
        map.execute(&mut StringSet::new(key, value, expire, condition))
    }

    pub fn get(map: &BigSortedMap, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut op = StringGet::new(key);
        map.execute(&mut op)?;
        Ok(op.value)
    }

    /// Returns the new length
    pub fn append(map: &BigSortedMap, key: &[u8], suffix: &[u8]) -> Result<Option<usize>> {
        let mut op = StringAppend::new(key, suffix);
        Ok(map.execute(&mut op)?.then_some(op.new_len))
    }

    pub fn incr_by(map: &BigSortedMap, key: &[u8], delta: i64) -> Result<Option<i64>> {
        let mut op = IncrementLong::new(key, delta);
        Ok(map.execute(&mut op)?.then_some(op.result))
    }

    pub fn incr(map: &BigSortedMap, key: &[u8]) -> Result<Option<i64>> {
        Self::incr_by(map, key, 1)
    }

    /// Returns whether the write happened and the previous value
    pub fn get_set(map: &BigSortedMap, key: &[u8], value: &[u8]) -> Result<(bool, Option<Vec<u8>>)> {
        let mut op = StringGetSet::new(key, value);
        let applied = map.execute(&mut op)?;
        Ok((applied, op.previous))
    }

    /// Returns the new length
    pub fn set_range(map: &BigSortedMap, key: &[u8], offset: usize, bytes: &[u8]) -> Result<Option<usize>> {
        let mut op = StringSetRange::new(key, offset, bytes);
        Ok(map.execute(&mut op)?.then_some(op.new_len))
    }

    pub fn strlen(map: &BigSortedMap, key: &[u8]) -> Result<usize> {
        let mut op = StringLength::new(key);
        map.execute(&mut op)?;
        Ok(op.len)
    }

    pub fn delete(map: &BigSortedMap, key: &[u8]) -> Result<bool> {
        map.delete(&string_key(key))
    }
}
