//! Composite key encoding
//!
//! ```text
//! [type tag: u8][key length: u32 BE][key bytes][type-specific suffix]
//! ```
//!
//! Keys compare as raw byte strings (unsigned lexicographic order). The
//! big-endian length keeps all records of one logical key contiguous and
//! prevents `"ab" + suffix` from interleaving with `"abc"`.

use crate::{Result, StorageError};

/// Size of the fixed header in front of the user key
pub const KEY_HEADER_SIZE: usize = 5;

/// Logical data type, stored as the first byte of every composite key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DataType {
    /// Untyped keys written straight through the map API
    Raw = 0,
    String = 1,
    Hash = 2,
    Set = 3,
    ZSet = 4,
    Bitmap = 5,
}

impl DataType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(DataType::Raw),
            1 => Some(DataType::String),
            2 => Some(DataType::Hash),
            3 => Some(DataType::Set),
            4 => Some(DataType::ZSet),
            5 => Some(DataType::Bitmap),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }
}

/// Build `[tag][len][key][suffix]`
pub fn encode(data_type: DataType, key: &[u8], suffix: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(KEY_HEADER_SIZE + key.len() + suffix.len());
    buf.push(data_type.tag());
    buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
    buf.extend_from_slice(key);
    buf.extend_from_slice(suffix);
    buf
}

/// Prefix shared by every record belonging to one logical key
pub fn logical_prefix(data_type: DataType, key: &[u8]) -> Vec<u8> {
    encode(data_type, key, &[])
}

/// Borrowed view of a decoded composite key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositeKey<'a> {
    pub data_type: DataType,
    pub key: &'a [u8],
    pub suffix: &'a [u8],
}

/// Split a composite key into its parts
pub fn decode(composite: &[u8]) -> Result<CompositeKey<'_>> {
    if composite.len() < KEY_HEADER_SIZE {
        return Err(StorageError::InvalidArgument(format!(
            "composite key too short: {} bytes",
            composite.len()
        )));
    }
    let data_type = DataType::from_byte(composite[0]).ok_or_else(|| {
        StorageError::InvalidArgument(format!("unknown data type tag {}", composite[0]))
    })?;
    let len = u32::from_be_bytes([composite[1], composite[2], composite[3], composite[4]]) as usize;
    let key_end = KEY_HEADER_SIZE + len;
    if composite.len() < key_end {
        return Err(StorageError::InvalidArgument(format!(
            "composite key declares {} key bytes but holds {}",
            len,
            composite.len() - KEY_HEADER_SIZE
        )));
    }
    Ok(CompositeKey {
        data_type,
        key: &composite[KEY_HEADER_SIZE..key_end],
        suffix: &composite[key_end..],
    })
}

/// Smallest byte string strictly greater than every string starting with `prefix`
///
/// Returns `None` when no such bound exists (empty prefix or all `0xFF`).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}

/// Smallest byte string strictly greater than `key`
pub fn next_key(key: &[u8]) -> Vec<u8> {
    let mut next = Vec::with_capacity(key.len() + 1);
    next.extend_from_slice(key);
    next.push(0);
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let composite = encode(DataType::Hash, b"user:1", b"name");
        assert_eq!(composite[0], DataType::Hash.tag());
        assert_eq!(&composite[1..5], &6u32.to_be_bytes());

        let decoded = decode(&composite).unwrap();
        assert_eq!(decoded.data_type, DataType::Hash);
        assert_eq!(decoded.key, b"user:1");
        assert_eq!(decoded.suffix, b"name");
    }

    #[test]
    fn test_length_prefix_prevents_interleaving() {
        let short = encode(DataType::Set, b"ab", b"zzz");
        let long = encode(DataType::Set, b"abc", b"");
        let short_prefix = logical_prefix(DataType::Set, b"ab");
        assert!(short.starts_with(&short_prefix));
        assert!(!long.starts_with(&short_prefix));
        assert!(short < long);
    }

    #[test]
    fn test_types_do_not_mix() {
        let s = encode(DataType::String, b"k", b"");
        let h = encode(DataType::Hash, b"k", b"f");
        assert!(s < h);
        assert!(!h.starts_with(&logical_prefix(DataType::String, b"k")));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(&[1, 0, 0]).is_err());
        assert!(decode(&[9, 0, 0, 0, 0]).is_err());
        assert!(decode(&[1, 0, 0, 0, 10, b'a']).is_err());
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_successor(&[1, 0xFF]), Some(vec![2]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_successor(&[]), None);

        let prefix = logical_prefix(DataType::ZSet, b"scores");
        let end = prefix_successor(&prefix).unwrap();
        let member = encode(DataType::ZSet, b"scores", &[0xFF; 16]);
        assert!(member < end);
    }

    #[test]
    fn test_next_key() {
        let k = b"abc".to_vec();
        let n = next_key(&k);
        assert!(n > k);
        assert!(n < b"abd".to_vec());
    }
}
