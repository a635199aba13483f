//! Error types for the redsorted storage engine
//!
//! Expected conditions (absent keys, admission rejection) are never errors:
//! they are `Option::None` and `Ok(false)` respectively.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Codec error: {0}")]
    Codec(String),

    /// A single record does not fit into one data block.
    #[error("Record too large: {size} bytes (max {max})")]
    RecordTooLarge { size: usize, max: usize },

    /// An operation produced an update outside the data block it was executed against.
    #[error("Key out of block: {0}")]
    KeyOutOfBlock(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Wrong type: {0}")]
    WrongType(String),

    #[error("Snapshot already in progress")]
    SnapshotInProgress,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
