//! Tempora
//!
//! Secondary indexing for a bitemporal, branch-aware key-value store.
//!
//! ## Overview
//! - Every write is versioned by branch and commit timestamp
//! - Indices map extracted values back to `(branch, keyspace, key)`, each
//!   mapping valid over a half-open timestamp interval
//! - Commits are indexed incrementally from old/new value diffs
//!
//! ## Architecture
//! - `index`: documents, indexers, the indexing process and [`IndexManager`]
//! - `backend`: in-memory (per branch) and chunked (per store chunk) document storage
//! - `chunk`: lazily rebuilt, LRU-cached, sealed-file persisted chunk indices
//! - `query`: search specifications, AND/OR evaluation and the result cache
//! - `store`: contracts of the primary store, plus [`MemoryStore`]

pub mod backend;
pub mod chunk;
pub mod config;
pub mod index;
pub mod query;
pub mod store;
pub mod types;

mod error;

pub use config::{BackendKind, IndexConfig, QueryCacheConfig};
pub use error::{IndexError, Result};

pub use index::{IndexDocument, IndexManager, IndexManagerStats, Indexer, IndexingStats};
pub use query::{NumberCondition, QueryNode, SearchSpecification, TextCondition, TextMatchMode};
pub use store::{ChunkSource, MemoryStore, TemporalStore, ValueCodec};
pub use types::{Period, QualifiedKey, TemporalKey, Timestamp, ValueChange, MASTER_BRANCH, TIMESTAMP_INFINITY};
