//! Record encoding inside a data block arena
//!
//! ## Layout
//! ```text
//! [flags: u8]
//! [key_len: varint][value_len: varint][seq: varint]
//! [expire_ms: u64 LE]                               if HAS_EXPIRE
//! [codec: u8][dictionary_id: varint][raw_len: varint]  if VALUE_COMPRESSED
//! [key bytes][value bytes]
//! ```
//!
//! `value_len` is the stored length (compressed length when the value is
//! compressed). Varints are LEB128.

use crate::codec::{CodecTag, CodecType};
use crate::{Result, StorageError};
use std::time::{SystemTime, UNIX_EPOCH};

pub const FLAG_HAS_EXPIRE: u8 = 0x01;
pub const FLAG_VALUE_COMPRESSED: u8 = 0x02;

/// Largest possible header: flags + 3 varints + expire + codec info
pub const MAX_RECORD_HEADER: usize = 1 + 10 + 10 + 10 + 8 + 1 + 5 + 10;

/// Append `value` as LEB128
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Decode a LEB128 value starting at `pos`; returns `(value, bytes consumed)`
pub fn get_varint(buf: &[u8], pos: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    let mut i = pos;
    loop {
        let byte = *buf
            .get(i)
            .ok_or_else(|| StorageError::Corruption(format!("truncated varint at {}", pos)))?;
        if shift >= 64 {
            return Err(StorageError::Corruption(format!("varint overflow at {}", pos)));
        }
        value |= ((byte & 0x7F) as u64) << shift;
        i += 1;
        if byte & 0x80 == 0 {
            return Ok((value, i - pos));
        }
        shift += 7;
    }
}

pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// `expire == 0` means the record never expires
#[inline]
pub fn is_expired(expire: u64, now_ms: u64) -> bool {
    expire != 0 && expire <= now_ms
}

/// Value-level compression marker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueCompression {
    pub tag: CodecTag,
    pub raw_len: usize,
}

/// A record about to be written
#[derive(Debug, Clone, Copy)]
pub struct RecordSpec<'a> {
    pub key: &'a [u8],
    /// Stored form of the value (already compressed if `compression` is set)
    pub value: &'a [u8],
    pub seq: u64,
    pub expire: u64,
    pub compression: Option<ValueCompression>,
}

impl<'a> RecordSpec<'a> {
    pub fn encoded_len(&self) -> usize {
        let mut len = 1
            + varint_len(self.key.len() as u64)
            + varint_len(self.value.len() as u64)
            + varint_len(self.seq)
            + self.key.len()
            + self.value.len();
        if self.expire != 0 {
            len += 8;
        }
        if let Some(c) = &self.compression {
            len += 1 + varint_len(c.tag.dictionary_id as u64) + varint_len(c.raw_len as u64);
        }
        len
    }

    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        let mut flags = 0u8;
        if self.expire != 0 {
            flags |= FLAG_HAS_EXPIRE;
        }
        if self.compression.is_some() {
            flags |= FLAG_VALUE_COMPRESSED;
        }
        buf.push(flags);
        put_varint(buf, self.key.len() as u64);
        put_varint(buf, self.value.len() as u64);
        put_varint(buf, self.seq);
        if self.expire != 0 {
            buf.extend_from_slice(&self.expire.to_le_bytes());
        }
        if let Some(c) = &self.compression {
            buf.push(c.tag.codec_type.to_byte());
            put_varint(buf, c.tag.dictionary_id as u64);
            put_varint(buf, c.raw_len as u64);
        }
        buf.extend_from_slice(self.key);
        buf.extend_from_slice(self.value);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }
}

/// Decoded header of a record located at `offset` inside an arena
///
/// Offsets are absolute positions inside the arena; a layout is only valid
/// until the arena is mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub offset: usize,
    pub seq: u64,
    pub expire: u64,
    pub compression: Option<ValueCompression>,
    pub key_offset: usize,
    pub key_len: usize,
    pub value_offset: usize,
    pub value_len: usize,
}

impl RecordLayout {
    pub fn parse(arena: &[u8], offset: usize) -> Result<Self> {
        let flags = *arena
            .get(offset)
            .ok_or_else(|| StorageError::Corruption(format!("record offset {} out of bounds", offset)))?;
        let mut pos = offset + 1;
        let (key_len, n) = get_varint(arena, pos)?;
        pos += n;
        let (value_len, n) = get_varint(arena, pos)?;
        pos += n;
        let (seq, n) = get_varint(arena, pos)?;
        pos += n;

        let mut expire = 0;
        if flags & FLAG_HAS_EXPIRE != 0 {
            let bytes = arena
                .get(pos..pos + 8)
                .ok_or_else(|| StorageError::Corruption("truncated expire".into()))?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            expire = u64::from_le_bytes(raw);
            pos += 8;
        }

        let mut compression = None;
        if flags & FLAG_VALUE_COMPRESSED != 0 {
            let codec_byte = *arena
                .get(pos)
                .ok_or_else(|| StorageError::Corruption("truncated value codec".into()))?;
            let codec_type = CodecType::from_byte(codec_byte).ok_or_else(|| {
                StorageError::Corruption(format!("unknown value codec {}", codec_byte))
            })?;
            pos += 1;
            let (dictionary_id, n) = get_varint(arena, pos)?;
            pos += n;
            let (raw_len, n) = get_varint(arena, pos)?;
            pos += n;
            compression = Some(ValueCompression {
                tag: CodecTag {
                    codec_type,
                    dictionary_id: dictionary_id as u32,
                },
                raw_len: raw_len as usize,
            });
        }

        let key_offset = pos;
        let value_offset = key_offset + key_len as usize;
        let end = value_offset + value_len as usize;
        if end > arena.len() {
            return Err(StorageError::Corruption(format!(
                "record at {} ends at {} beyond arena of {}",
                offset,
                end,
                arena.len()
            )));
        }

        Ok(Self {
            offset,
            seq,
            expire,
            compression,
            key_offset,
            key_len: key_len as usize,
            value_offset,
            value_len: value_len as usize,
        })
    }

    pub fn end(&self) -> usize {
        self.value_offset + self.value_len
    }

    pub fn total_len(&self) -> usize {
        self.end() - self.offset
    }

    pub fn key<'a>(&self, arena: &'a [u8]) -> &'a [u8] {
        &arena[self.key_offset..self.key_offset + self.key_len]
    }

    /// Stored (possibly compressed) value bytes
    pub fn stored_value<'a>(&self, arena: &'a [u8]) -> &'a [u8] {
        &arena[self.value_offset..self.value_offset + self.value_len]
    }

    /// Logical value length
    pub fn value_size(&self) -> usize {
        self.compression.map(|c| c.raw_len).unwrap_or(self.value_len)
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        is_expired(self.expire, now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_boundaries() {
        for v in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_varint(&mut buf, v);
            assert_eq!(buf.len(), varint_len(v));
            let (decoded, n) = get_varint(&buf, 0).unwrap();
            assert_eq!(decoded, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn test_truncated_varint() {
        assert!(get_varint(&[0x80, 0x80], 0).is_err());
    }

    #[test]
    fn test_record_layout() {
        let spec = RecordSpec {
            key: b"key-1",
            value: b"hello world",
            seq: 42,
            expire: 1_700_000_000_000,
            compression: None,
        };
        let mut arena = vec![0xAA; 3];
        spec.encode_into(&mut arena);
        assert_eq!(arena.len(), 3 + spec.encoded_len());

        let layout = RecordLayout::parse(&arena, 3).unwrap();
        assert_eq!(layout.key(&arena), b"key-1");
        assert_eq!(layout.stored_value(&arena), b"hello world");
        assert_eq!(layout.seq, 42);
        assert_eq!(layout.expire, 1_700_000_000_000);
        assert_eq!(layout.end(), arena.len());
        assert_eq!(layout.total_len(), spec.encoded_len());
    }

    #[test]
    fn test_compressed_marker() {
        let tag = CodecTag {
            codec_type: CodecType::Zstd,
            dictionary_id: 77,
        };
        let spec = RecordSpec {
            key: b"k",
            value: &[1, 2, 3],
            seq: 0,
            expire: 0,
            compression: Some(ValueCompression { tag, raw_len: 4000 }),
        };
        let arena = spec.encode();
        let layout = RecordLayout::parse(&arena, 0).unwrap();
        assert_eq!(layout.compression, Some(ValueCompression { tag, raw_len: 4000 }));
        assert_eq!(layout.value_size(), 4000);
        assert_eq!(layout.expire, 0);
    }

    #[test]
    fn test_expiration() {
        assert!(!is_expired(0, u64::MAX));
        assert!(is_expired(10, 10));
        assert!(!is_expired(11, 10));
    }

    #[test]
    fn test_truncated_record_is_corruption() {
        let spec = RecordSpec {
            key: b"abc",
            value: b"defgh",
            seq: 1,
            expire: 0,
            compression: None,
        };
        let mut arena = spec.encode();
        arena.truncate(arena.len() - 2);
        assert!(matches!(RecordLayout::parse(&arena, 0), Err(StorageError::Corruption(_))));
    }
}
