//! Zstd codec with optional shared dictionary
//!
//! Dictionaries are trained from block samples (see
//! [`ZstdCodec::train_dictionary`]) and identified by a content-derived id so
//! blocks compressed with a dictionary can find it again after a codec swap.

use super::{Codec, CodecSettings, CodecType, Dictionary};
use crate::{Result, StorageError};

#[derive(Debug)]
pub struct ZstdCodec {
    settings: CodecSettings,
    dictionary: Option<Dictionary>,
}

impl ZstdCodec {
    pub fn new(level: i32, threshold: usize) -> Self {
        Self {
            settings: CodecSettings::new(clamp_level(level), threshold),
            dictionary: None,
        }
    }

    pub fn with_dictionary(level: i32, threshold: usize, dictionary: Dictionary) -> Self {
        Self {
            settings: CodecSettings::new(clamp_level(level), threshold),
            dictionary: Some(dictionary),
        }
    }

    pub fn dictionary(&self) -> Option<&Dictionary> {
        self.dictionary.as_ref()
    }

    /// Train a dictionary of at most `max_size` bytes from sample payloads
    pub fn train_dictionary<S: AsRef<[u8]>>(samples: &[S], max_size: usize) -> Result<Dictionary> {
        if samples.is_empty() {
            return Err(StorageError::InvalidArgument(
                "cannot train a dictionary without samples".into(),
            ));
        }
        let bytes = zstd::dict::from_samples(samples, max_size)
            .map_err(|e| StorageError::Codec(format!("zstd dictionary training failed: {}", e)))?;
        Ok(Dictionary::new(bytes))
    }
}

fn clamp_level(level: i32) -> i32 {
    level.clamp(1, 22)
}

impl Codec for ZstdCodec {
    fn codec_type(&self) -> CodecType {
        CodecType::Zstd
    }

    fn max_compressed_len(&self, src_len: usize) -> usize {
        zstd::zstd_safe::compress_bound(src_len)
    }

    fn compress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let level = self.settings.level();
        let written = match &self.dictionary {
            Some(dict) => {
                let mut compressor = zstd::bulk::Compressor::with_dictionary(level, dict.bytes())?;
                compressor.compress_to_buffer(src, dst)
            }
            None => zstd::bulk::compress_to_buffer(src, dst, level),
        };
        written.map_err(|e| StorageError::Codec(format!("zstd compression failed: {}", e)))
    }

    fn decompress(&self, src: &[u8], dst: &mut [u8]) -> Result<usize> {
        let read = match &self.dictionary {
            Some(dict) => {
                let mut decompressor = zstd::bulk::Decompressor::with_dictionary(dict.bytes())?;
                decompressor.decompress_to_buffer(src, dst)
            }
            None => zstd::bulk::decompress_to_buffer(src, dst),
        };
        read.map_err(|e| StorageError::Codec(format!("zstd decompression failed: {}", e)))
    }

    fn level(&self) -> i32 {
        self.settings.level()
    }

    fn set_level(&self, level: i32) {
        self.settings.set_level(clamp_level(level));
    }

    fn compression_threshold(&self) -> usize {
        self.settings.threshold()
    }

    fn set_compression_threshold(&self, threshold: usize) {
        self.settings.set_threshold(threshold);
    }

    fn dictionary_id(&self) -> u32 {
        self.dictionary.as_ref().map(|d| d.id()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples() -> Vec<Vec<u8>> {
        (0..1024u32)
            .map(|i| {
                format!(
                    "{{\"id\":{},\"name\":\"sensor-{}\",\"kind\":\"{}\",\"reading\":{}}}",
                    i,
                    i.wrapping_mul(7919) % 1000,
                    ["temperature", "humidity", "pressure", "voltage"][(i % 4) as usize],
                    i.wrapping_mul(2654435761) % 100_000
                )
                .into_bytes()
            })
            .collect()
    }

    #[test]
    fn test_dictionary_roundtrip() {
        let samples = samples();
        let dict = ZstdCodec::train_dictionary(&samples, 4096).unwrap();
        let codec = ZstdCodec::with_dictionary(3, 0, dict.clone());
        assert_eq!(codec.dictionary_id(), dict.id());

        let payload = samples[7].clone();
        let compressed = codec.compress_to_vec(&payload).unwrap();
        let restored = codec.decompress_to_vec(&compressed, payload.len()).unwrap();
        assert_eq!(restored, payload);
    }

    #[test]
    fn test_train_without_samples_fails() {
        let empty: Vec<Vec<u8>> = Vec::new();
        assert!(ZstdCodec::train_dictionary(&empty, 1024).is_err());
    }

    #[test]
    fn test_level_is_clamped() {
        let codec = ZstdCodec::new(100, 0);
        assert_eq!(codec.level(), 22);
        codec.set_level(-5);
        assert_eq!(codec.level(), 1);
    }
}
