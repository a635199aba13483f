//! Snappy raw-format codec

use super::{Codec, CodecSettings, CodecType};
use crate::{Result, StorageError};

#[derive(Debug)]
pub struct SnappyCodec {
    settings: CodecSettings,
}

impl SnappyCodec {
    pub fn new(threshold: usize) -> Self {
        Self {
            settings: CodecSettings::new(0, threshold),
        }
    }
}

impl Codec for SnappyCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Snappy
    }

    fn max_compressed_len(&self, src_len: usize) -> usize {
        snap::raw::max_compress_len(src_len).max(1)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let mut encoder = snap::raw::Encoder::new();
        encoder
            .compress(src, dst)
            .map_err(|e| StorageError::Codec(format!("Compression failed: {}", e)))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let mut decoder = snap::raw::Decoder::new();
        decoder
            .decompress(src, dst)
            .map_err(|e| StorageError::Codec(format!("Decompression failed: {}", e)))
    }

    fn level(&self) -> i32 {
        self.settings.level()
    }

    fn set_level(&self, _level: i32) {
        // snappy has no levels
    }

    fn compression_threshold(&self) -> usize {
        self.settings.threshold()
    }

    fn set_compression_threshold(&self, threshold: usize) {
        self.settings.set_threshold(threshold);
    }
}
