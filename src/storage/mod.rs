//! Storage layer implementation
//!
//! Two-level ordered index over compressible data blocks:
//! - `data_block`: sorted records in one arena, sealed with the active codec
//! - `index_block`: sorted `(first key, block)` entries
//! - `map`: the [`BigSortedMap`] tying both levels together
//! - `scanner`: ordered range iteration
//! - `snapshot`: persistence and the background snapshot worker

pub mod context;
pub mod data_block;
pub mod index_block;
pub mod key;
pub mod map;
pub mod memory;
pub mod record;
pub mod scanner;
pub mod snapshot;

pub use context::EngineContext;
pub use data_block::{BlockRef, DataBlock, PutOutcome, RecordView};
pub use index_block::{IndexBlock, IndexRef};
pub use key::{CompositeKey, DataType};
pub use map::{BigSortedMap, MapStats};
pub use memory::MemoryTracker;
pub use scanner::{ScanEntry, Scanner};
pub use snapshot::{SnapshotHeader, SnapshotManager, SnapshotOutcome};
