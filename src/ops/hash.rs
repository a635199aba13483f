//! Hash commands: one record per field, keyed `[Hash][len][key][field]`

use super::string::decode_long;
use super::{exact, OpContext, Operation, RecordView, Updates};
use crate::storage::key::{self, DataType};
use crate::storage::BigSortedMap;
use crate::{Result, StorageError};

pub fn field_key(key: &[u8], field: &[u8]) -> Vec<u8> {
    key::encode(DataType::Hash, key, field)
}

/// HSET of one field; `created` tells whether the field was new
#[derive(Debug)]
pub struct HashSet {
    key: Vec<u8>,
    value: Vec<u8>,
    if_absent: bool,
    pub created: bool,
}

impl HashSet {
    pub fn new(key: &[u8], field: &[u8], value: &[u8]) -> Self {
        Self {
            key: field_key(key, field),
            value: value.to_vec(),
            if_absent: false,
            created: false,
        }
    }

    /// HSETNX
    pub fn if_absent(mut self) -> Self {
        self.if_absent = true;
        self
    }
}

impl Operation for HashSet {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        let existing = exact(found, &self.key);
        if existing.is_some() && self.if_absent {
            return Ok(false);
        }
        self.created = existing.is_none();
        updates.put(self.key.clone(), &self.value, 0)?;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct HashGet {
    key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl HashGet {
    pub fn new(key: &[u8], field: &[u8]) -> Self {
        Self {
            key: field_key(key, field),
            value: None,
        }
    }
}

impl Operation for HashGet {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.value = exact(found, &self.key).map(|r| r.value.to_vec());
        Ok(true)
    }
}

#[derive(Debug)]
pub struct HashDelete {
    key: Vec<u8>,
    pub deleted: bool,
}

impl HashDelete {
    pub fn new(key: &[u8], field: &[u8]) -> Self {
        Self {
            key: field_key(key, field),
            deleted: false,
        }
    }
}

impl Operation for HashDelete {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        self.deleted = exact(found, &self.key).is_some();
        if self.deleted {
            updates.delete(self.key.clone())?;
        }
        Ok(true)
    }
}

#[derive(Debug)]
pub struct HashExists {
    key: Vec<u8>,
    pub exists: bool,
}

impl HashExists {
    pub fn new(key: &[u8], field: &[u8]) -> Self {
        Self {
            key: field_key(key, field),
            exists: false,
        }
    }
}

impl Operation for HashExists {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.exists = exact(found, &self.key).is_some();
        Ok(true)
    }
}

/// HINCRBY on an 8-byte big-endian field value
#[derive(Debug)]
pub struct HashIncrBy {
    key: Vec<u8>,
    delta: i64,
    pub result: i64,
}

impl HashIncrBy {
    pub fn new(key: &[u8], field: &[u8], delta: i64) -> Self {
        Self {
            key: field_key(key, field),
            delta,
            result: 0,
        }
    }
}

impl Operation for HashIncrBy {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        let current = match exact(found, &self.key) {
            Some(record) => decode_long(&record.value)?,
            None => 0,
        };
        self.result = current.checked_add(self.delta).ok_or_else(|| {
            StorageError::InvalidArgument(format!("increment {} of {} overflows", self.delta, current))
        })?;
        updates.put(self.key.clone(), &self.result.to_be_bytes(), 0)?;
        Ok(true)
    }
}

/// Hash command dispatcher
pub struct Hashes;

impl Hashes {
    /// Returns `Some(true)` when the field was created, `None` when the
    /// memory limit refused the write
    pub fn set(map: &BigSortedMap, key: &[u8], field: &[u8], value: &[u8]) -> Result<Option<bool>> {
        let mut op = HashSet::new(key, field, value);
        Ok(map.execute(&mut op)?.then_some(op.created))
    }

    pub fn set_if_absent(map: &BigSortedMap, key: &[u8], field: &[u8], value: &[u8]) -> Result<bool> {
        map.execute(&mut HashSet::new(key, field, value).if_absent())
    }

    pub fn get(map: &BigSortedMap, key: &[u8], field: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut op = HashGet::new(key, field);
        map.execute(&mut op)?;
        Ok(op.value)
    }

    pub fn delete(map: &BigSortedMap, key: &[u8], field: &[u8]) -> Result<bool> {
        let mut op = HashDelete::new(key, field);
        map.execute(&mut op)?;
        Ok(op.deleted)
    }

    pub fn exists(map: &BigSortedMap, key: &[u8], field: &[u8]) -> Result<bool> {
        let mut op = HashExists::new(key, field);
        map.execute(&mut op)?;
        Ok(op.exists)
    }

    pub fn incr_by(map: &BigSortedMap, key: &[u8], field: &[u8], delta: i64) -> Result<Option<i64>> {
        let mut op = HashIncrBy::new(key, field, delta);
        Ok(map.execute(&mut op)?.then_some(op.result))
    }

    /// HLEN
    pub fn len(map: &BigSortedMap, key: &[u8]) -> Result<usize> {
        let prefix = key::logical_prefix(DataType::Hash, key);
        let mut count = 0;
        for entry in map.prefix_scanner(&prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    /// HGETALL, ordered by field bytes
    pub fn get_all(map: &BigSortedMap, key: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let prefix = key::logical_prefix(DataType::Hash, key);
        map.prefix_scanner(&prefix)
            .map(|entry| {
                let entry = entry?;
                Ok((entry.key[prefix.len()..].to_vec(), entry.value))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;

    fn map() -> BigSortedMap {
        BigSortedMap::new(MapConfig::for_testing()).unwrap()
    }

    #[test]
    fn test_set_get_delete() {
        let map = map();
        assert_eq!(Hashes::set(&map, b"h", b"a", b"1").unwrap(), Some(true));
        assert_eq!(Hashes::set(&map, b"h", b"a", b"2").unwrap(), Some(false));
        assert_eq!(Hashes::get(&map, b"h", b"a").unwrap(), Some(b"2".to_vec()));
        assert!(Hashes::exists(&map, b"h", b"a").unwrap());
        assert!(!Hashes::exists(&map, b"h", b"b").unwrap());

        assert!(Hashes::delete(&map, b"h", b"a").unwrap());
        assert!(!Hashes::delete(&map, b"h", b"a").unwrap());
        assert_eq!(Hashes::get(&map, b"h", b"a").unwrap(), None);
    }

    #[test]
    fn test_set_if_absent() {
        let map = map();
        assert!(Hashes::set_if_absent(&map, b"h", b"f", b"first").unwrap());
        assert!(!Hashes::set_if_absent(&map, b"h", b"f", b"second").unwrap());
        assert_eq!(Hashes::get(&map, b"h", b"f").unwrap(), Some(b"first".to_vec()));
    }

    #[test]
    fn test_incr_by() {
        let map = map();
        assert_eq!(Hashes::incr_by(&map, b"h", b"n", 5).unwrap(), Some(5));
        assert_eq!(Hashes::incr_by(&map, b"h", b"n", -7).unwrap(), Some(-2));
        Hashes::set(&map, b"h", b"s", b"text").unwrap();
        assert!(matches!(
            Hashes::incr_by(&map, b"h", b"s", 1),
            Err(StorageError::WrongType(_))
        ));
    }

    #[test]
    fn test_len_and_get_all_stay_inside_one_hash() {
        let map = map();
        for i in 0..200u32 {
            Hashes::set(&map, b"user", format!("f{:03}", i).as_bytes(), &i.to_be_bytes()).unwrap();
        }
        // "users" shares the byte prefix "user" but is a different hash
        Hashes::set(&map, b"users", b"f000", b"x").unwrap();

        assert_eq!(Hashes::len(&map, b"user").unwrap(), 200);
        assert_eq!(Hashes::len(&map, b"users").unwrap(), 1);
        assert_eq!(Hashes::len(&map, b"nobody").unwrap(), 0);

        let all = Hashes::get_all(&map, b"user").unwrap();
        assert_eq!(all.len(), 200);
        assert_eq!(all[0], (b"f000".to_vec(), 0u32.to_be_bytes().to_vec()));
        assert_eq!(all[199].0, b"f199".to_vec());
    }
}
