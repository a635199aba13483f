//! Sparse bitmaps
//!
//! A bitmap is split into fixed-size chunks of `chunk_bits` bits. Each
//! non-empty chunk is one record keyed `[Bitmap][len][key][chunk index u64 BE]`
//! with the value
//!
//! ```text
//! [format u8][set bit count u32 BE][payload]
//! ```
//!
//! The payload is either the raw chunk bytes (bit 0 is the high bit of byte
//! 0) or a serialized roaring bitmap when few bits are set. The form is
//! re-chosen on every write, so readers never observe the difference. A chunk
//! whose last set bit is cleared is deleted.

use super::{exact, OpContext, Operation, RecordView, Updates};
use crate::storage::key::{self, DataType};
use crate::storage::BigSortedMap;
use crate::{Result, StorageError};
use roaring::RoaringBitmap;

pub const FORMAT_RAW: u8 = 0;
pub const FORMAT_SPARSE: u8 = 1;

/// `[format][bit count]`
pub const CHUNK_HEADER_SIZE: usize = 5;

/// Whether a chunk with `bit_count` set bits is stored in sparse form
pub fn should_compress(bit_count: u32, threshold: u32) -> bool {
    bit_count <= threshold
}

pub fn chunk_key(key: &[u8], chunk_index: u64) -> Vec<u8> {
    key::encode(DataType::Bitmap, key, &chunk_index.to_be_bytes())
}

/// Chunk index and bit position inside the chunk for a bitmap offset
pub fn locate(offset: u64, chunk_bits: u64) -> (u64, u32) {
    (offset / chunk_bits, (offset % chunk_bits) as u32)
}

#[derive(Debug, Clone, PartialEq)]
enum Bits {
    Raw(Vec<u8>),
    Sparse(RoaringBitmap),
}

/// Decoded chunk value
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    bits: Bits,
    count: u32,
    chunk_bits: u32,
}

impl Chunk {
    pub fn empty(chunk_bits: u32) -> Self {
        Self {
            bits: Bits::Sparse(RoaringBitmap::new()),
            count: 0,
            chunk_bits,
        }
    }

    pub fn decode(value: &[u8], chunk_bits: u32) -> Result<Self> {
        if value.len() < CHUNK_HEADER_SIZE {
            return Err(StorageError::WrongType(format!(
                "bitmap chunk of {} bytes has no header",
                value.len()
            )));
        }
        let count = u32::from_be_bytes([value[1], value[2], value[3], value[4]]);
        let payload = &value[CHUNK_HEADER_SIZE..];
        let bits = match value[0] {
            FORMAT_RAW => {
                let chunk_bytes = (chunk_bits / 8) as usize;
                if payload.len() != chunk_bytes {
                    return Err(StorageError::Corruption(format!(
                        "raw bitmap chunk has {} bytes, expected {}",
                        payload.len(),
                        chunk_bytes
                    )));
                }
                let actual: u32 = payload.iter().map(|b| b.count_ones()).sum();
                if actual != count {
                    return Err(StorageError::Corruption(format!(
                        "raw bitmap chunk header says {} bits, payload has {}",
                        count, actual
                    )));
                }
                Bits::Raw(payload.to_vec())
            }
            FORMAT_SPARSE => {
                let bitmap = RoaringBitmap::deserialize_from(payload)
                    .map_err(|e| StorageError::Corruption(format!("sparse bitmap chunk: {}", e)))?;
                if bitmap.len() != count as u64 {
                    return Err(StorageError::Corruption(format!(
                        "sparse bitmap chunk header says {} bits, payload has {}",
                        count,
                        bitmap.len()
                    )));
                }
                if bitmap.max().map_or(false, |max| max >= chunk_bits) {
                    return Err(StorageError::Corruption(
                        "sparse bitmap chunk holds a bit past the chunk end".to_string(),
                    ));
                }
                Bits::Sparse(bitmap)
            }
            other => {
                return Err(StorageError::WrongType(format!(
                    "unknown bitmap chunk format {}",
                    other
                )))
            }
        };
        Ok(Self {
            bits,
            count,
            chunk_bits,
        })
    }

    /// Encode in the form chosen by [`should_compress`]
    pub fn encode(&self, threshold: u32) -> Result<Vec<u8>> {
        let sparse = should_compress(self.count, threshold);
        let mut out = Vec::with_capacity(CHUNK_HEADER_SIZE + (self.chunk_bits / 8) as usize);
        out.push(if sparse { FORMAT_SPARSE } else { FORMAT_RAW });
        out.extend_from_slice(&self.count.to_be_bytes());
        match (&self.bits, sparse) {
            (Bits::Sparse(bitmap), true) => serialize(bitmap, &mut out)?,
            (Bits::Raw(raw), false) => out.extend_from_slice(raw),
            (Bits::Raw(raw), true) => {
                let bitmap: RoaringBitmap = (0..self.chunk_bits).filter(|&bit| raw_get(raw, bit)).collect();
                serialize(&bitmap, &mut out)?;
            }
            (Bits::Sparse(bitmap), false) => {
                let mut raw = vec![0u8; (self.chunk_bits / 8) as usize];
                for bit in bitmap.iter() {
                    raw_set(&mut raw, bit, true);
                }
                out.extend_from_slice(&raw);
            }
        }
        Ok(out)
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_sparse(&self) -> bool {
        matches!(self.bits, Bits::Sparse(_))
    }

    pub fn get(&self, bit: u32) -> bool {
        match &self.bits {
            Bits::Raw(raw) => raw_get(raw, bit),
            Bits::Sparse(bitmap) => bitmap.contains(bit),
        }
    }

    /// Returns the previous value of the bit
    pub fn set(&mut self, bit: u32, value: bool) -> bool {
        let previous = self.get(bit);
        if previous == value {
            return previous;
        }
        match &mut self.bits {
            Bits::Raw(raw) => raw_set(raw, bit, value),
            Bits::Sparse(bitmap) => {
                if value {
                    bitmap.insert(bit);
                } else {
                    bitmap.remove(bit);
                }
            }
        }
        if value {
            self.count += 1;
        } else {
            self.count -= 1;
        }
        previous
    }
}

fn serialize(bitmap: &RoaringBitmap, out: &mut Vec<u8>) -> Result<()> {
    bitmap
        .serialize_into(out)
        .map_err(|e| StorageError::Serialization(format!("sparse bitmap chunk: {}", e)))
}

fn raw_get(raw: &[u8], bit: u32) -> bool {
    raw[(bit / 8) as usize] & (0x80 >> (bit % 8)) != 0
}

fn raw_set(raw: &mut [u8], bit: u32, value: bool) {
    let mask = 0x80 >> (bit % 8);
    let byte = &mut raw[(bit / 8) as usize];
    if value {
        *byte |= mask;
    } else {
        *byte &= !mask;
    }
}

/// SETBIT; `previous` holds the old bit
#[derive(Debug)]
pub struct SparseSetBit {
    key: Vec<u8>,
    bit: u32,
    value: bool,
    chunk_bits: u32,
    pub previous: bool,
}

impl SparseSetBit {
    pub fn new(key: &[u8], offset: u64, value: bool, chunk_bits: u64) -> Self {
        let (chunk, bit) = locate(offset, chunk_bits);
        Self {
            key: chunk_key(key, chunk),
            bit,
            value,
            chunk_bits: chunk_bits as u32,
            previous: false,
        }
    }
}

impl Operation for SparseSetBit {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, ctx: &OpContext<'_>, updates: &mut Updates) -> Result<bool> {
        let (mut chunk, expire) = match exact(found, &self.key) {
            Some(record) => (Chunk::decode(&record.value, self.chunk_bits)?, record.expire),
            None => (Chunk::empty(self.chunk_bits), 0),
        };
        self.previous = chunk.set(self.bit, self.value);
        if self.previous == self.value {
            return Ok(true);
        }
        if chunk.count() == 0 {
            updates.delete(self.key.clone())?;
        } else {
            let value = chunk.encode(ctx.config.bitmap.compress_threshold)?;
            updates.put(self.key.clone(), &value, expire)?;
        }
        Ok(true)
    }
}

/// GETBIT; absent chunks read as zero
#[derive(Debug)]
pub struct SparseGetBit {
    key: Vec<u8>,
    bit: u32,
    chunk_bits: u32,
    pub value: bool,
}

impl SparseGetBit {
    pub fn new(key: &[u8], offset: u64, chunk_bits: u64) -> Self {
        let (chunk, bit) = locate(offset, chunk_bits);
        Self {
            key: chunk_key(key, chunk),
            bit,
            chunk_bits: chunk_bits as u32,
            value: false,
        }
    }
}

impl Operation for SparseGetBit {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.value = match exact(found, &self.key) {
            Some(record) => Chunk::decode(&record.value, self.chunk_bits)?.get(self.bit),
            None => false,
        };
        Ok(true)
    }
}

/// Set bits of the chunk holding `offset`, read from the chunk header
#[derive(Debug)]
pub struct SparseChunkCount {
    key: Vec<u8>,
    pub count: u32,
}

impl SparseChunkCount {
    pub fn new(key: &[u8], offset: u64, chunk_bits: u64) -> Self {
        let (chunk, _) = locate(offset, chunk_bits);
        Self {
            key: chunk_key(key, chunk),
            count: 0,
        }
    }
}

impl Operation for SparseChunkCount {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn execute(&mut self, found: Option<&RecordView<'_>>, _ctx: &OpContext<'_>, _updates: &mut Updates) -> Result<bool> {
        self.count = match exact(found, &self.key) {
            Some(record) => header_count(&record.value)?,
            None => 0,
        };
        Ok(true)
    }
}

fn header_count(value: &[u8]) -> Result<u32> {
    match value {
        [FORMAT_RAW | FORMAT_SPARSE, a, b, c, d, ..] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(StorageError::WrongType("value is not a bitmap chunk".to_string())),
    }
}

/// Sparse bitmap command dispatcher
pub struct SparseBitmaps;

impl SparseBitmaps {
    /// SETBIT; returns the previous bit, or `None` when the memory limit
    /// refused the write
    pub fn set_bit(map: &BigSortedMap, key: &[u8], offset: u64, value: bool) -> Result<Option<bool>> {
        let mut op = SparseSetBit::new(key, offset, value, map.config().bitmap.chunk_bits);
        Ok(map.execute(&mut op)?.then_some(op.previous))
    }

    pub fn get_bit(map: &BigSortedMap, key: &[u8], offset: u64) -> Result<bool> {
        let mut op = SparseGetBit::new(key, offset, map.config().bitmap.chunk_bits);
        map.execute(&mut op)?;
        Ok(op.value)
    }

    pub fn chunk_count(map: &BigSortedMap, key: &[u8], offset: u64) -> Result<u32> {
        let mut op = SparseChunkCount::new(key, offset, map.config().bitmap.chunk_bits);
        map.execute(&mut op)?;
        Ok(op.count)
    }

    /// BITCOUNT over every chunk of the bitmap
    pub fn bit_count(map: &BigSortedMap, key: &[u8]) -> Result<u64> {
        let prefix = key::logical_prefix(DataType::Bitmap, key);
        let mut total = 0u64;
        for entry in map.prefix_scanner(&prefix) {
            total += header_count(&entry?.value)? as u64;
        }
        Ok(total)
    }

    /// Drop every chunk; returns how many were removed
    pub fn delete(map: &BigSortedMap, key: &[u8]) -> Result<usize> {
        let prefix = key::logical_prefix(DataType::Bitmap, key);
        let keys = map
            .prefix_scanner(&prefix)
            .map(|entry| entry.map(|e| e.key))
            .collect::<Result<Vec<_>>>()?;
        let mut removed = 0;
        for chunk in keys {
            if map.delete(&chunk)? {
                removed += 1;
            }
        }
        log::debug!("deleted bitmap of {} chunks", removed);
        Ok(removed)
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
    fn test_set_and_get_bits() {
        let map = map();
        assert_eq!(SparseBitmaps::set_bit(&map, b"bm", 0, true).unwrap(), Some(false));
        assert_eq!(SparseBitmaps::set_bit(&map, b"bm", 0, true).unwrap(), Some(true));
        assert_eq!(SparseBitmaps::set_bit(&map, b"bm", 1_000_000, true).unwrap(), Some(false));

        assert!(SparseBitmaps::get_bit(&map, b"bm", 0).unwrap());
        assert!(SparseBitmaps::get_bit(&map, b"bm", 1_000_000).unwrap());
        assert!(!SparseBitmaps::get_bit(&map, b"bm", 1).unwrap());
        assert!(!SparseBitmaps::get_bit(&map, b"bm", 999_999).unwrap());
        assert!(!SparseBitmaps::get_bit(&map, b"missing", 0).unwrap());
        assert_eq!(SparseBitmaps::bit_count(&map, b"bm").unwrap(), 2);
    }

    #[test]
    fn test_clearing_last_bit_deletes_chunk() {
        let map = map();
        SparseBitmaps::set_bit(&map, b"bm", 5, true).unwrap();
        assert_eq!(map.stats().records, 1);
        assert_eq!(SparseBitmaps::set_bit(&map, b"bm", 5, false).unwrap(), Some(true));
        assert_eq!(map.stats().records, 0);
        // clearing an unset bit writes nothing
        assert_eq!(SparseBitmaps::set_bit(&map, b"bm", 7, false).unwrap(), Some(false));
        assert_eq!(map.stats().records, 0);
    }

    #[test]
    fn test_form_switches_with_density() {
        let map = map();
        let threshold = map.config().bitmap.compress_threshold as u64;
        let chunk_key = chunk_key(b"bm", 0);

        for bit in 0..threshold {
            SparseBitmaps::set_bit(&map, b"bm", bit, true).unwrap();
        }
        let value = map.get(&chunk_key).unwrap().unwrap();
        assert_eq!(value[0], FORMAT_SPARSE);

        SparseBitmaps::set_bit(&map, b"bm", threshold, true).unwrap();
        let value = map.get(&chunk_key).unwrap().unwrap();
        assert_eq!(value[0], FORMAT_RAW);
        assert_eq!(value.len(), CHUNK_HEADER_SIZE + 1024 / 8);

        SparseBitmaps::set_bit(&map, b"bm", 0, false).unwrap();
        let value = map.get(&chunk_key).unwrap().unwrap();
        assert_eq!(value[0], FORMAT_SPARSE);

        assert_eq!(SparseBitmaps::chunk_count(&map, b"bm", 3).unwrap(), threshold as u32);
        for bit in 1..=threshold {
            assert!(SparseBitmaps::get_bit(&map, b"bm", bit).unwrap());
        }
        assert!(!SparseBitmaps::get_bit(&map, b"bm", 0).unwrap());
    }

    #[test]
    fn test_chunk_encoding() {
        let mut chunk = Chunk::empty(64);
        assert!(!chunk.set(3, true));
        assert!(!chunk.set(63, true));
        let raw = chunk.encode(0).unwrap();
        assert_eq!(raw[0], FORMAT_RAW);
        assert_eq!(&raw[CHUNK_HEADER_SIZE..], &[0x10, 0, 0, 0, 0, 0, 0, 0x01]);

        let decoded = Chunk::decode(&raw, 64).unwrap();
        assert!(!decoded.is_sparse());
        assert!(decoded.get(3) && decoded.get(63) && !decoded.get(4));

        let sparse = decoded.encode(10).unwrap();
        assert_eq!(sparse[0], FORMAT_SPARSE);
        assert_eq!(Chunk::decode(&sparse, 64).unwrap().count(), 2);
    }

    #[test]
    fn test_malformed_chunks_rejected() {
        assert!(matches!(Chunk::decode(&[0, 0], 64), Err(StorageError::WrongType(_))));
        assert!(matches!(
            Chunk::decode(&[9, 0, 0, 0, 0], 64),
            Err(StorageError::WrongType(_))
        ));
        // header claims one bit, payload is empty
        let mut value = vec![FORMAT_RAW, 0, 0, 0, 1];
        value.extend_from_slice(&[0u8; 8]);
        assert!(matches!(Chunk::decode(&value, 64), Err(StorageError::Corruption(_))));
    }

    #[test]
    fn test_delete_bitmap() {
        let map = map();
        for offset in [0u64, 5_000, 90_000] {
            SparseBitmaps::set_bit(&map, b"bm", offset, true).unwrap();
        }
        SparseBitmaps::set_bit(&map, b"other", 0, true).unwrap();
        assert_eq!(SparseBitmaps::delete(&map, b"bm").unwrap(), 3);
        assert_eq!(SparseBitmaps::bit_count(&map, b"bm").unwrap(), 0);
        assert_eq!(SparseBitmaps::bit_count(&map, b"other").unwrap(), 1);
    }
}
