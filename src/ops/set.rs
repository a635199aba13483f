//! Set commands: one empty-valued record per member

use super::{exact, OpContext, Operation, RecordView, Updates};
use crate::storage::key::{self, DataType};
use crate::storage::BigSortedMap;
use crate::Result;

pub fn member_key(key: &[u8], member: &[u8]) -> Vec<u8> {
    key::encode(DataType::Set, key, member)
}

#[derive(Debug)]
pub struct SetAdd {
    key: Vec<u8>,
    pub added: bool,
}

impl SetAdd {
    pub fn new(key: &[u8], member: &[u8]) -> Self {
        Self {
            key: member_key(key, member),
            added: false,
        }
    }
}

impl Operation for SetAdd {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        self.added = exact(found, &self.key).is_none();
        if self.added {
            updates.put(self.key.clone(), &[], 0)?;
        }
        Ok(true)
    }
}

#[derive(Debug)]
pub struct SetRemove {
    key: Vec<u8>,
    pub removed: bool,
}

impl SetRemove {
    pub fn new(key: &[u8], member: &[u8]) -> Self {
        Self {
            key: member_key(key, member),
            removed: false,
        }
    }
}

impl Operation for SetRemove {
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

#[derive(Debug)]
pub struct SetIsMember {
    key: Vec<u8>,
    pub is_member: bool,
}

impl SetIsMember {
    pub fn new(key: &[u8], member: &[u8]) -> Self {
        Self {
            key: member_key(key, member),
            is_member: false,
        }
    }
}

impl Operation for SetIsMember {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.is_member = exact(found, &self.key).is_some();
        Ok(true)
    }
}

/// Set command dispatcher
pub struct Sets;

impl Sets {
    /// SADD of one member; `None` when the memory limit refused the write
    pub fn add(map: &BigSortedMap, key: &[u8], member: &[u8]) -> Result<Option<bool>> {
        let mut op = SetAdd::new(key, member);
        Ok(map.execute(&mut op)?.then_some(op.added))
    }

    pub fn remove(map: &BigSortedMap, key: &[u8], member: &[u8]) -> Result<bool> {
        let mut op = SetRemove::new(key, member);
        map.execute(&mut op)?;
        Ok(op.removed)
    }

    pub fn is_member(map: &BigSortedMap, key: &[u8], member: &[u8]) -> Result<bool> {
        let mut op = SetIsMember::new(key, member);
        map.execute(&mut op)?;
        Ok(op.is_member)
    }

    /// SMEMBERS, ordered by member bytes
    pub fn members(map: &BigSortedMap, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let prefix = key::logical_prefix(DataType::Set, key);
        map.prefix_scanner(&prefix)
            .map(|entry| entry.map(|e| e.key[prefix.len()..].to_vec()))
            .collect()
    }

    /// SCARD
    pub fn cardinality(map: &BigSortedMap, key: &[u8]) -> Result<usize> {
        let prefix = key::logical_prefix(DataType::Set, key);
        let mut count = 0;
        for entry in map.prefix_scanner(&prefix) {
            entry?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapConfig;

    #[test]
    fn test_membership() {
        let map = BigSortedMap::new(MapConfig::for_testing()).unwrap();
        assert_eq!(Sets::add(&map, b"s", b"a").unwrap(), Some(true));
        assert_eq!(Sets::add(&map, b"s", b"a").unwrap(), Some(false));
        assert_eq!(Sets::add(&map, b"s", b"b").unwrap(), Some(true));
        assert!(Sets::is_member(&map, b"s", b"a").unwrap());
        assert!(!Sets::is_member(&map, b"s", b"c").unwrap());
        assert_eq!(Sets::cardinality(&map, b"s").unwrap(), 2);

        assert!(Sets::remove(&map, b"s", b"a").unwrap());
        assert!(!Sets::remove(&map, b"s", b"a").unwrap());
        assert_eq!(Sets::members(&map, b"s").unwrap(), vec![b"b".to_vec()]);
    }

    #[test]
    fn test_members_across_blocks() {
        let map = BigSortedMap::new(MapConfig::for_testing()).unwrap();
        for i in (0..500u32).rev() {
            Sets::add(&map, b"big", &i.to_be_bytes()).unwrap();
        }
        let members = Sets::members(&map, b"big").unwrap();
        assert_eq!(members.len(), 500);
        assert_eq!(members[0], 0u32.to_be_bytes().to_vec());
        assert!(members.windows(2).all(|w| w[0] < w[1]));
        assert!(map.stats().data_blocks > 1);
    }
}
