//! Block compression codecs
//!
//! ## Interface
//! - `compress(src, dst) -> compressed_len`
//! - `decompress(src, dst) -> decompressed_len`
//! - level and compression threshold are adjustable at runtime
//!
//! ## Codec tagging
//! Every compressed payload carries a [`CodecTag`] (codec type + dictionary id).
//! Swapping the active codec is therefore non-retroactive: payloads produced by
//! an older codec are decoded with the codec their tag names, never with
//! whatever happens to be active at read time.

mod lz4_codec;
mod snappy_codec;
mod zstd_codec;

pub use lz4_codec::Lz4Codec;
pub use snappy_codec::SnappyCodec;
pub use zstd_codec::ZstdCodec;

use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Codec type (persisted as a single byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum CodecType {
    /// No compression
    #[default]
    None = 0,
    /// LZ4 block format, fast mode
    Lz4 = 1,
    /// LZ4 block format, high-compression mode
    Lz4Hc = 2,
    /// Zstd, optionally with a dictionary
    Zstd = 3,
    /// Snappy raw format
    Snappy = 4,
}

impl CodecType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CodecType::None),
            1 => Some(CodecType::Lz4),
            2 => Some(CodecType::Lz4Hc),
            3 => Some(CodecType::Zstd),
            4 => Some(CodecType::Snappy),
            _ => None,
        }
    }

    pub fn to_byte(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            CodecType::None => "none",
            CodecType::Lz4 => "lz4",
            CodecType::Lz4Hc => "lz4hc",
            CodecType::Zstd => "zstd",
            CodecType::Snappy => "snappy",
        }
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Identifies the codec instance that produced a compressed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecTag {
    pub codec_type: CodecType,
    /// 0 = no dictionary
    pub dictionary_id: u32,
}

impl CodecTag {
    pub const NONE: CodecTag = CodecTag {
        codec_type: CodecType::None,
        dictionary_id: 0,
    };
}

/// Shared compression dictionary
#[derive(Clone)]
pub struct Dictionary {
    id: u32,
    bytes: Arc<Vec<u8>>,
}

impl Dictionary {
    /// Wrap raw dictionary bytes; the id is derived from the content
    pub fn new(bytes: Vec<u8>) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        // 0 is reserved for "no dictionary"
        let id = hasher.finalize().max(1);
        Self {
            id,
            bytes: Arc::new(bytes),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for Dictionary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dictionary")
            .field("id", &self.id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Block compression codec
///
/// Implementations must be safe to call concurrently from many threads.
pub trait Codec: Send + Sync + fmt::Debug {
    fn codec_type(&self) -> CodecType;

    /// Worst-case compressed size for `src_len` input bytes
    fn max_compressed_len(&self, src_len: usize) -> usize;

    /// Compress `src` into `dst`, returning the compressed length
    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    /// Decompress `src` into `dst`, returning the decompressed length
    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize>;

    fn level(&self) -> i32;

    fn set_level(&self, level: i32);

    /// Inputs smaller than this are not worth compressing
    fn compression_threshold(&self) -> usize;

    fn set_compression_threshold(&self, threshold: usize);

    fn dictionary_id(&self) -> u32 {
        0
    }

    fn tag(&self) -> CodecTag {
        CodecTag {
            codec_type: self.codec_type(),
            dictionary_id: self.dictionary_id(),
        }
    }

    /// Compress into a freshly allocated buffer trimmed to the compressed length
    fn compress_to_vec(&self, src: &[u8]) -> Result<Vec<u8>> {
        let mut dst = vec![0u8; self.max_compressed_len(src.len())];
        let n = self.compress(src, &mut dst)?;
        dst.truncate(n);
        dst.shrink_to_fit();
        Ok(dst)
    }

    /// Decompress a payload whose original length is known
    fn decompress_to_vec(&self, src: &[u8], raw_len: usize) -> Result<Vec<u8>> {
        let mut dst = vec![0u8; raw_len];
        let n = self.decompress(src, &mut dst)?;
        if n != raw_len {
            return Err(StorageError::Codec(format!(
                "{} produced {} bytes, expected {}",
                self.codec_type(),
                n,
                raw_len
            )));
        }
        Ok(dst)
    }
}

/// Level and threshold shared by all codec implementations
#[derive(Debug)]
pub(crate) struct CodecSettings {
    level: AtomicI32,
    threshold: AtomicUsize,
}

impl CodecSettings {
    pub(crate) fn new(level: i32, threshold: usize) -> Self {
        Self {
            level: AtomicI32::new(level),
            threshold: AtomicUsize::new(threshold),
        }
    }

    pub(crate) fn level(&self) -> i32 {
        self.level.load(Ordering::Relaxed)
    }

    pub(crate) fn set_level(&self, level: i32) {
        self.level.store(level, Ordering::Relaxed);
    }

    pub(crate) fn threshold(&self) -> usize {
        self.threshold.load(Ordering::Relaxed)
    }

    pub(crate) fn set_threshold(&self, threshold: usize) {
        self.threshold.store(threshold, Ordering::Relaxed);
    }
}

/// Pass-through codec
#[derive(Debug)]
pub struct NoCodec {
    settings: CodecSettings,
}

impl NoCodec {
    pub fn new() -> Self {
        Self {
            settings: CodecSettings::new(0, usize::MAX),
        }
    }
}

impl Default for NoCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for NoCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::None
    }

    fn max_compressed_len(&self, src_len: usize) -> usize {
        src_len
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        copy_into(src, dst)
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        copy_into(src, dst)
    }

    fn level(&self) -> i32 {
        self.settings.level()
    }

    fn set_level(&self, level: i32) {
        self.settings.set_level(level);
    }

    fn compression_threshold(&self) -> usize {
        self.settings.threshold()
    }

    fn set_compression_threshold(&self, threshold: usize) {
        self.settings.set_threshold(threshold);
    }
}

fn copy_into(src: &[u8], dst: &mut [u8]) -> Result<usize> {
    if dst.len() < src.len() {
        return Err(StorageError::Codec(format!(
            "destination too small: {} < {}",
            dst.len(),
            src.len()
        )));
    }
    dst[..src.len()].copy_from_slice(src);
    Ok(src.len())
}

/// Build a codec of the given type
///
/// `dictionary` is only honoured by zstd; other codecs ignore it.
pub fn create(
    codec_type: CodecType,
    level: i32,
    threshold: usize,
    dictionary: Option<Dictionary>,
) -> Arc<dyn Codec> {
    match codec_type {
        CodecType::None => {
            let codec = NoCodec::new();
            codec.set_compression_threshold(threshold);
            Arc::new(codec)
        }
        CodecType::Lz4 => Arc::new(Lz4Codec::fast(threshold)),
        CodecType::Lz4Hc => Arc::new(Lz4Codec::high_compression(level, threshold)),
        CodecType::Zstd => match dictionary {
            Some(dict) => Arc::new(ZstdCodec::with_dictionary(level, threshold, dict)),
            None => Arc::new(ZstdCodec::new(level, threshold)),
        },
        CodecType::Snappy => Arc::new(SnappyCodec::new(threshold)),
    }
}
