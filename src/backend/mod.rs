//! Document store backends
//!
//! A backend stores index documents and answers atomic searches. Two
//! implementations exist:
//! - [`InMemoryBackend`]: one document table per branch, origin documents are
//!   consulted (and shadowed) at query time
//! - [`ChunkedBackend`]: one document table per store chunk, materialized on
//!   demand by the [`crate::chunk::ChunkIndexManager`]

pub mod chunked;
pub mod memory;

pub use chunked::ChunkedBackend;
pub use memory::InMemoryBackend;

use crate::index::{IndexDocument, IndexModifications, OpenDocuments, RollbackOutcome};
use crate::query::SearchSpecification;
use crate::types::{IndexValue, QualifiedKey, Timestamp};
use crate::Result;
use std::collections::BTreeSet;

/// How a backend wants a reindex to be carried out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexMode {
    /// The caller replays every branch's history through the indexing process
    Replay,
    /// Documents are rebuilt on demand when next accessed
    Lazy,
}

pub trait DocumentBackend: Send + Sync {
    /// Merge one batch of modifications; each branch's part is applied atomically
    fn apply(&self, modifications: &IndexModifications) -> Result<()>;

    /// Open documents of one key stored by `branch` itself (inherited ones excluded)
    fn matching_branch_local_documents(&self, branch: &str, keyspace: &str, key: &str) -> Result<OpenDocuments>;

    /// Whether `branch` itself stores any document (open or closed) for the tuple
    fn has_branch_local_documents(
        &self,
        branch: &str,
        index_name: &str,
        keyspace: &str,
        key: &str,
        value: &IndexValue,
    ) -> Result<bool>;

    /// Documents of the specification's index valid at `timestamp` on `branch`
    /// (origin branches included) whose value matches the specification
    fn query(&self, timestamp: Timestamp, branch: &str, spec: &SearchSpecification) -> Result<Vec<IndexDocument>>;

    /// Drop the documents of one index, keeping its registration
    fn delete_index_contents(&self, index_name: &str) -> Result<()>;

    /// Drop the documents of an index whose registration is gone
    fn delete_index_and_indexers(&self, index_name: &str) -> Result<()>;

    fn delete_all(&self) -> Result<()>;

    /// Discard document state at or after `timestamp` on the given branches
    fn rollback(
        &self,
        branches: &[String],
        timestamp: Timestamp,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> Result<RollbackOutcome>;

    /// Drop the documents of `indices` ahead of a reindex
    fn prepare_reindex(&self, indices: &BTreeSet<String>) -> Result<ReindexMode>;
}
