//! Engine context: configuration, active codec, dictionaries, memory tracker
//!
//! One context is created per map and shared by every block operation. The
//! active codec may be swapped at runtime; compressed payloads keep the
//! [`CodecTag`] of the codec that produced them and are decoded through
//! [`EngineContext::decoder_for`].

use super::memory::MemoryTracker;
use crate::codec::{self, Codec, CodecTag, CodecType, Dictionary};
use crate::config::MapConfig;
use crate::{Result, StorageError};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::Arc;

pub struct EngineContext {
    config: MapConfig,
    codec: RwLock<Arc<dyn Codec>>,
    dictionaries: RwLock<AHashMap<u32, Dictionary>>,
    /// Decoders for tags other than the active codec
    decoders: RwLock<AHashMap<CodecTag, Arc<dyn Codec>>>,
    memory: MemoryTracker,
}

impl EngineContext {
    pub fn new(config: MapConfig) -> Self {
        let codec = codec::create(
            config.codec.codec_type,
            config.codec.level,
            config.codec.compression_threshold,
            None,
        );
        let memory = MemoryTracker::new(config.global_memory_limit);
        Self {
            config,
            codec: RwLock::new(codec),
            dictionaries: RwLock::new(AHashMap::new()),
            decoders: RwLock::new(AHashMap::new()),
            memory,
        }
    }

    pub fn config(&self) -> &MapConfig {
        &self.config
    }

    pub fn memory(&self) -> &MemoryTracker {
        &self.memory
    }

    /// Snapshot of the active codec
    ///
    /// Callers keep using the returned instance even if a swap happens meanwhile.
    pub fn codec(&self) -> Arc<dyn Codec> {
        self.codec.read().clone()
    }

    /// Install a new active codec, returning the previous one
    ///
    /// Not retroactive: nothing already compressed is rewritten.
    pub fn swap_codec(&self, codec: Arc<dyn Codec>) -> Arc<dyn Codec> {
        let mut guard = self.codec.write();
        log::debug!("swapping codec {} -> {}", guard.codec_type(), codec.codec_type());
        std::mem::replace(&mut *guard, codec)
    }

    /// Make a dictionary resolvable for payloads tagged with its id
    pub fn register_dictionary(&self, dictionary: Dictionary) {
        self.dictionaries.write().insert(dictionary.id(), dictionary);
    }

    pub fn dictionary(&self, id: u32) -> Option<Dictionary> {
        self.dictionaries.read().get(&id).cloned()
    }

    /// Codec able to decode payloads carrying `tag`
    pub fn decoder_for(&self, tag: CodecTag) -> Result<Arc<dyn Codec>> {
        {
            let active = self.codec.read();
            if active.tag() == tag {
                return Ok(active.clone());
            }
        }
        if let Some(decoder) = self.decoders.read().get(&tag) {
            return Ok(decoder.clone());
        }

        let dictionary = if tag.dictionary_id != 0 {
            if tag.codec_type != CodecType::Zstd {
                return Err(StorageError::Codec(format!(
                    "codec {} does not support dictionaries (id {})",
                    tag.codec_type, tag.dictionary_id
                )));
            }
            Some(self.dictionary(tag.dictionary_id).ok_or_else(|| {
                StorageError::Codec(format!("unknown dictionary id {}", tag.dictionary_id))
            })?)
        } else {
            None
        };

        // level does not matter for decoding
        let decoder = codec::create(tag.codec_type, 1, 0, dictionary);
        self.decoders.write().insert(tag, decoder.clone());
        Ok(decoder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_swap_is_not_retroactive() {
        let ctx = EngineContext::new(MapConfig::default());
        let payload = vec![7u8; 2048];

        ctx.swap_codec(codec::create(CodecType::Lz4, 1, 0, None));
        let lz4 = ctx.codec();
        let compressed = lz4.compress_to_vec(&payload).unwrap();
        let tag = lz4.tag();

        ctx.swap_codec(codec::create(CodecType::Zstd, 3, 0, None));
        assert_eq!(ctx.codec().codec_type(), CodecType::Zstd);

        let decoder = ctx.decoder_for(tag).unwrap();
        assert_eq!(decoder.codec_type(), CodecType::Lz4);
        assert_eq!(decoder.decompress_to_vec(&compressed, payload.len()).unwrap(), payload);
    }

    #[test]
    fn test_unknown_dictionary() {
        let ctx = EngineContext::new(MapConfig::default());
        let tag = CodecTag {
            codec_type: CodecType::Zstd,
            dictionary_id: 12345,
        };
        assert!(matches!(ctx.decoder_for(tag), Err(StorageError::Codec(_))));

        let dict = Dictionary::new(vec![1, 2, 3, 4]);
        ctx.register_dictionary(dict.clone());
        assert!(ctx.dictionary(dict.id()).is_some());
    }
}
