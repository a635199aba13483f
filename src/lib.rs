//! redsorted storage engine
//!
//! Embedded, memory-resident sorted map with block compression and
//! Redis-style data types layered on composite keys.
//!
//! ## Architecture
//! - Storage: two-level index (top map -> index blocks -> data blocks)
//! - Blocks: arena-backed, sealed with LZ4 / LZ4HC / Zstd (+ dictionary) / Snappy
//! - Operations: read-modify-write commands executed under one block lock
//! - Persistence: checksummed snapshot files written by a background worker
//!
//! ## Example
//! ```
//! use redsorted::{BigSortedMap, MapConfig};
//! use redsorted::ops::Strings;
//!
//! let map = BigSortedMap::new(MapConfig::default())?;
//! Strings::incr_by(&map, b"visits", 3)?;
//! assert_eq!(Strings::incr(&map, b"visits")?, Some(4));
//! # Ok::<(), redsorted::StorageError>(())
//! ```

pub mod cache;
pub mod codec;
pub mod config;
pub mod ops;
pub mod storage;

mod error;

pub use codec::{Codec, CodecType, Dictionary};
pub use config::{BitmapConfig, CodecConfig, MapConfig};
pub use error::{Result, StorageError};
pub use ops::{Operation, Update, Updates, ValueBuf};
pub use storage::{BigSortedMap, MapStats, ScanEntry, Scanner, SnapshotManager};
