//! Sorted-set commands
//!
//! Each member is one record keyed `[ZSet][len][key][member]` whose value is
//! the score as 8 big-endian bytes of its `f64` bit pattern. Score-ordered
//! reads sort the members of one key after a prefix scan.

use super::{exact, OpContext, Operation, RecordView, Updates};
use crate::storage::key::{self, DataType};
use crate::storage::BigSortedMap;
use crate::{Result, StorageError};
use std::cmp::Ordering;

pub fn member_key(key: &[u8], member: &[u8]) -> Vec<u8> {
    key::encode(DataType::ZSet, key, member)
}

fn encode_score(score: f64) -> [u8; 8] {
    score.to_bits().to_be_bytes()
}

pub fn decode_score(value: &[u8]) -> Result<f64> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        StorageError::WrongType(format!("score value has {} bytes, expected 8", value.len()))
    })?;
    Ok(f64::from_bits(u64::from_be_bytes(bytes)))
}

fn check_score(score: f64) -> Result<f64> {
    if score.is_nan() {
        return Err(StorageError::InvalidArgument("score is not a number".to_string()));
    }
    Ok(score)
}

/// ZADD of one member; `added` is false when an existing score was updated
#[derive(Debug)]
pub struct ZSetAdd {
    key: Vec<u8>,
    score: f64,
    pub added: bool,
}

impl ZSetAdd {
    pub fn new(key: &[u8], member: &[u8], score: f64) -> Self {
        Self {
            key: member_key(key, member),
            score,
            added: false,
        }
    }
}

impl Operation for ZSetAdd {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        let score = check_score(self.score)?;
        self.added = exact(found, &self.key).is_none();
        updates.put(self.key.clone(), &encode_score(score), 0)?;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct ZSetScore {
    key: Vec<u8>,
    pub score: Option<f64>,
}

impl ZSetScore {
    pub fn new(key: &[u8], member: &[u8]) -> Self {
        Self {
            key: member_key(key, member),
            score: None,
        }
    }
}

impl Operation for ZSetScore {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.score = exact(found, &self.key)
            .map(|r| decode_score(&r.value))
            .transpose()?;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct ZSetRemove {
    key: Vec<u8>,
    pub removed: bool,
}

impl ZSetRemove {
    pub fn new(key: &[u8], member: &[u8]) -> Self {
        Self {
            key: member_key(key, member),
            removed: false,
        }
    }
}

impl Operation for ZSetRemove {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        self.removed = exact(found, &self.key).is_some();
        if self.removed {
            updates.delete(self.key.clone())?;
        }
        Ok(true)
    }
}

/// ZINCRBY; an absent member starts from 0
#[derive(Debug)]
pub struct ZSetIncrBy {
    key: Vec<u8>,
    delta: f64,
    pub result: f64,
}

impl ZSetIncrBy {
    pub fn new(key: &[u8], member: &[u8], delta: f64) -> Self {
        Self {
            key: member_key(key, member),
            delta,
            result: 0.0,
        }
    }
}

impl Operation for ZSetIncrBy {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        let current = match exact(found, &self.key) {
            Some(record) => decode_score(&record.value)?,
            None => 0.0,
        };
        self.result = check_score(current + check_score(self.delta)?)?;
        updates.put(self.key.clone(), &encode_score(self.result), 0)?;
        Ok(true)
    }
}

/// Sorted-set command dispatcher
pub struct ZSets;

impl ZSets {
    /// `None` when the memory limit refused the write
    pub fn add(map: &BigSortedMap, key: &[u8], member: &[u8], score: f64) -> Result<Option<bool>> {
        let mut op = ZSetAdd::new(key, member, score);
        Ok(map.execute(&mut op)?.then_some(op.added))
    }

    pub fn score(map: &BigSortedMap, key: &[u8], member: &[u8]) -> Result<Option<f64>> {
        let mut op = ZSetScore::new(key, member);
        map.execute(&mut op)?;
        Ok(op.score)
    }

    pub fn remove(map: &BigSortedMap, key: &[u8], member: &[u8]) -> Result<bool> {
        let mut op = ZSetRemove::new(key, member);
        map.execute(&mut op)?;
        Ok(op.removed)
    }

    pub fn incr_by(map: &BigSortedMap, key: &[u8], member: &[u8], delta: f64) -> Result<Option<f64>> {
        let mut op = ZSetIncrBy::new(key, member, delta);
        Ok(map.execute(&mut op)?.then_some(op.result))
    }

    /// ZRANGEBYSCORE over `[min, max]`, ordered by score then member
    pub fn range_by_score(map: &BigSortedMap, key: &[u8], min: f64, max: f64) -> Result<Vec<(Vec<u8>, f64)>> {
        let prefix = key::logical_prefix(DataType::ZSet, key);
        let mut members = Vec::new();
        for entry in map.prefix_scanner(&prefix) {
            let entry = entry?;
            let score = decode_score(&entry.value)?;
            if score >= min && score <= max {
                members.push((entry.key[prefix.len()..].to_vec(), score));
            }
        }
        members.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    /// ZCARD
    pub fn cardinality(map: &BigSortedMap, key: &[u8]) -> Result<usize> {
        let prefix = key::logical_prefix(DataType::ZSet, key);
        let mut count = 0;
        for entry in map.prefix_scanner(&prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}
