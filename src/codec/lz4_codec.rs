//! LZ4 block codec
//!
//! Both flavors emit the standard LZ4 block format, so any payload can be
//! decoded by either. The high-compression flavor records its level for
//! callers that persist it; the pure-Rust encoder has a single search mode.

use super::{Codec, CodecSettings, CodecType};
use crate::{Result, StorageError};

#[derive(Debug)]
pub struct Lz4Codec {
    high_compression: bool,
    settings: CodecSettings,
}

impl Lz4Codec {
    pub fn fast(threshold: usize) -> Self {
        Self {
            high_compression: false,
            settings: CodecSettings::new(1, threshold),
        }
    }

    pub fn high_compression(level: i32, threshold: usize) -> Self {
        Self {
            high_compression: true,
            settings: CodecSettings::new(level.clamp(1, 12), threshold),
        }
    }
}

impl Codec for Lz4Codec {
    fn codec_type(&self) -> CodecType {
        if self.high_compression {
            CodecType::Lz4Hc
        } else {
            CodecType::Lz4
        }
    }

    fn max_compressed_len(&self, src_len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(src_len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        lz4_flex::block::compress_into(src, dst)
            .map_err(|e| StorageError::Codec(format!("lz4 compression failed: {}", e)))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        lz4_flex::block::decompress_into(src, dst)
            .map_err(|e| StorageError::Codec(format!("lz4 decompression failed: {}", e)))
    }

    fn level(&self) -> i32 {
        self.settings.level()
    }

    fn set_level(&self, level: i32) {
        if self.high_compression {
            self.settings.set_level(level.clamp(1, 12));
        }
    }

    fn compression_threshold(&self) -> usize {
        self.settings.threshold()
    }

    fn set_compression_threshold(&self, threshold: usize) {
        self.settings.set_threshold(threshold);
    }
}
