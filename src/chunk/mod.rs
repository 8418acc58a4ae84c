//! Chunk-partitioned document indices
//!
//! Every chunk of the primary store gets its own document table, built on
//! demand from the chunk's entries and persisted as a sealed file once the
//! chunk is closed.

mod builder;
mod document_index;
mod manager;
pub mod persistence;

pub use builder::{BuildStats, ChunkIndexBuilder};
pub use document_index::ChunkDocumentIndex;
pub use manager::{ChunkIndexManager, ChunkManagerStats, DEFAULT_CHUNK_CACHE_CAPACITY};
pub use persistence::{ChunkFileStore, ChunkIndexPayload, SealMarker, SealedObject};
