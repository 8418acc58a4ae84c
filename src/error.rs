//! Error types for the tempora indexing subsystem

use crate::types::Timestamp;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Two indexers of one index claim the same value, or indexer families are mixed
    #[error("Indexer conflict on index '{index}': {detail}")]
    IndexerConflict { index: String, detail: String },

    #[error("Unknown index: '{0}'")]
    UnknownIndex(String),

    /// A modification references a document the target store does not track
    #[error("Inconsistent document reference: {0}")]
    InconsistentDocument(String),

    #[error("Invalid validity period: [{from}, {to})")]
    InvalidPeriod { from: Timestamp, to: Timestamp },

    #[error("Corrupted chunk index file {path}: {reason}")]
    CorruptedChunkFile { path: std::path::PathBuf, reason: String },

    #[error("Branch not found: '{0}'")]
    BranchNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Another thread's load of the same chunk failed
    #[error("Chunk index load failed: {0}")]
    ChunkLoad(String),
}

impl From<bincode::Error> for IndexError {
    fn from(err: bincode::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Serialization(err.to_string())
    }
}
