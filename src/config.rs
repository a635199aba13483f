//! Map configuration
//!
//! Provides sizing, compression and admission-control knobs for a
//! [`BigSortedMap`](crate::BigSortedMap). All structures are serde-serializable
//! so a store can be configured from a JSON document.

use crate::codec::CodecType;
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest block size that still leaves room for a useful record.
pub const MIN_BLOCK_SIZE: usize = 256;

/// Largest supported block size (offsets inside a block are `u32`, but
/// blocks are meant to stay small enough to compress as a unit).
pub const MAX_BLOCK_SIZE: usize = 1 << 20;

/// Codec configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Block codec used when sealing blocks
    pub codec_type: CodecType,

    /// Codec level (zstd: 1-22, lz4hc: 1-12, ignored by the others)
    pub level: i32,

    /// Blocks whose used size is below this are never compressed (default 100 bytes)
    pub compression_threshold: usize,

    /// Seal the lower half of a block right after it splits
    ///
    /// Split-off lower halves are typically cold under append-heavy workloads.
    pub compress_on_split: bool,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            codec_type: CodecType::None,
            level: 1,
            compression_threshold: 100,
            compress_on_split: false,
        }
    }
}

/// Sparse bitmap configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitmapConfig {
    /// Bits per chunk (must be a multiple of 8)
    pub chunk_bits: u64,

    /// Chunks with at most this many set bits are stored in sparse form
    pub compress_threshold: u32,
}

impl Default for BitmapConfig {
    fn default() -> Self {
        Self {
            chunk_bits: 4096,
            compress_threshold: 128,
        }
    }
}

/// Top-level configuration of a sorted map instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapConfig {
    /// Data block capacity in bytes (default 4096)
    pub max_block_size: usize,

    /// Maximum entries per index block (default 512)
    pub index_block_capacity: usize,

    /// Global memory limit in bytes; writes are refused once it would be exceeded
    pub global_memory_limit: Option<u64>,

    /// Fraction of block capacity below which a block merges with its right sibling
    pub merge_threshold: f64,

    /// Block codec
    pub codec: CodecConfig,

    /// Values at least this large are stored compressed inside their record
    pub value_compression_threshold: Option<usize>,

    /// How many sealed blocks may keep a decompressed copy around
    pub decompressed_cache_blocks: usize,

    /// Sparse bitmap layout
    pub bitmap: BitmapConfig,

    /// Directory where background snapshots are written
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            max_block_size: 4096,
            index_block_capacity: 512,
            global_memory_limit: None,
            merge_threshold: 0.25,
            codec: CodecConfig::default(),
            value_compression_threshold: None,
            decompressed_cache_blocks: 1024,
            bitmap: BitmapConfig::default(),
            snapshot_dir: None,
        }
    }
}

impl MapConfig {
    /// Small blocks and a tiny index fan-out so tests exercise splits quickly
    pub fn for_testing() -> Self {
        Self {
            max_block_size: 512,
            index_block_capacity: 8,
            decompressed_cache_blocks: 16,
            bitmap: BitmapConfig {
                chunk_bits: 1024,
                compress_threshold: 32,
            },
            ..Default::default()
        }
    }

    /// Zstd-sealed blocks, compressed large values, small decompressed cache
    pub fn memory_optimized() -> Self {
        Self {
            max_block_size: 8192,
            codec: CodecConfig {
                codec_type: CodecType::Zstd,
                level: 3,
                compression_threshold: 100,
                compress_on_split: true,
            },
            value_compression_threshold: Some(1024),
            decompressed_cache_blocks: 256,
            ..Default::default()
        }
    }

    /// LZ4 sealing, larger decompressed cache
    pub fn throughput_optimized() -> Self {
        Self {
            max_block_size: 4096,
            codec: CodecConfig {
                codec_type: CodecType::Lz4,
                level: 1,
                compression_threshold: 256,
                compress_on_split: false,
            },
            decompressed_cache_blocks: 16 * 1024,
            ..Default::default()
        }
    }

    /// Parse a configuration from a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: MapConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Serialize this configuration as pretty JSON
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Check the configuration for inconsistent settings
    pub fn validate(&self) -> Result<()> {
        if self.max_block_size < MIN_BLOCK_SIZE || self.max_block_size > MAX_BLOCK_SIZE {
            return Err(StorageError::Config(format!(
                "max_block_size must be within [{}, {}], got {}",
                MIN_BLOCK_SIZE, MAX_BLOCK_SIZE, self.max_block_size
            )));
        }
        if self.index_block_capacity < 4 {
            return Err(StorageError::Config(format!(
                "index_block_capacity must be at least 4, got {}",
                self.index_block_capacity
            )));
        }
        if !(0.0..0.5).contains(&self.merge_threshold) {
            return Err(StorageError::Config(format!(
                "merge_threshold must be within [0.0, 0.5), got {}",
                self.merge_threshold
            )));
        }
        if self.bitmap.chunk_bits == 0 || self.bitmap.chunk_bits % 8 != 0 {
            return Err(StorageError::Config(format!(
                "bitmap.chunk_bits must be a positive multiple of 8, got {}",
                self.bitmap.chunk_bits
            )));
        }
        // a raw chunk must fit into one block together with its key
        let chunk_bytes = (self.bitmap.chunk_bits / 8) as usize;
        if chunk_bytes + 64 > self.max_block_size / 2 {
            return Err(StorageError::Config(format!(
                "bitmap chunk of {} bytes does not fit half a block of {} bytes",
                chunk_bytes, self.max_block_size
            )));
        }
        // sparse form costs about 2 bytes per set bit plus a 16-byte header
        if self.bitmap.compress_threshold as usize * 2 + 16 >= chunk_bytes {
            return Err(StorageError::Config(format!(
                "bitmap.compress_threshold {} makes the sparse form larger than a {}-byte chunk",
                self.bitmap.compress_threshold, chunk_bytes
            )));
        }
        if self.decompressed_cache_blocks == 0 {
            return Err(StorageError::Config("decompressed_cache_blocks must be > 0".into()));
        }
        Ok(())
    }
}
