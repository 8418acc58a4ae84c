//! Contracts of the primary temporal store
//!
//! The indexing subsystem does not own key-value data. It reads entries,
//! branch metadata and chunk layout through the traits in this module.
//! [`MemoryStore`] is a complete in-process implementation used by tests and
//! embedded setups.

mod codec;
pub mod memory;

pub use codec::{JsonCodec, ValueCodec};
pub use memory::MemoryStore;

use crate::types::{Period, Timestamp};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Branch metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchInfo {
    pub name: String,
    /// Origin branch (`None` for master)
    pub origin: Option<String>,
    /// Timestamp at which the branch was forked from its origin (0 for master)
    pub branching_timestamp: Timestamp,
    /// Timestamp of the latest completed commit on this branch
    pub now: Timestamp,
}

impl BranchInfo {
    pub fn is_master(&self) -> bool {
        self.origin.is_none()
    }
}

/// One physical entry: serialized value of a key at a timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub key: String,
    pub timestamp: Timestamp,
    /// `None` is a deletion tombstone
    pub value: Option<Vec<u8>>,
}

/// Read access to the primary temporal key-value store
pub trait TemporalStore: Send + Sync {
    fn branch(&self, name: &str) -> Result<Option<BranchInfo>>;

    /// All branches, every origin listed before its children
    fn branches(&self) -> Result<Vec<BranchInfo>>;

    /// Keyspaces visible on `branch` at `timestamp` (inherited ones included)
    fn keyspaces(&self, branch: &str, timestamp: Timestamp) -> Result<BTreeSet<String>>;

    /// Branch-local entries with timestamps in `period` and not after the
    /// branch's `now`, ordered by `(key, timestamp)`
    fn entries(&self, branch: &str, keyspace: &str, period: Period) -> Result<Vec<StoredEntry>>;

    /// Latest value of a key at or before `timestamp`, falling back to the
    /// origin branch for timestamps the branch did not write
    fn get(&self, branch: &str, keyspace: &str, key: &str, timestamp: Timestamp) -> Result<Option<Vec<u8>>>;

    /// Keys holding a value at `timestamp` (origin fallback included)
    fn keys(&self, branch: &str, keyspace: &str, timestamp: Timestamp) -> Result<BTreeSet<String>>;

    /// Branch metadata or `BranchNotFound`
    fn require_branch(&self, name: &str) -> Result<BranchInfo> {
        self.branch(name)?
            .ok_or_else(|| crate::IndexError::BranchNotFound(name.to_string()))
    }
}

/// Chunk identity: branch plus position in the branch's chunk sequence
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub branch: String,
    pub sequence: u64,
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}#{}", self.branch, self.sequence)
    }
}

/// A physical partition of one branch's history
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Chunk {
    pub id: ChunkId,
    pub period: Period,
}

impl Chunk {
    pub fn new(branch: impl Into<String>, sequence: u64, period: Period) -> Self {
        Self {
            id: ChunkId {
                branch: branch.into(),
                sequence,
            },
            period,
        }
    }

    pub fn branch(&self) -> &str {
        &self.id.branch
    }

    /// Head chunks accept new writes and are never persisted
    pub fn is_head(&self) -> bool {
        self.period.is_open_ended()
    }
}

/// Chunk layout of the primary store
pub trait ChunkSource: Send + Sync {
    /// Chunks of a branch ordered by period
    fn chunks(&self, branch: &str) -> Result<Vec<Chunk>>;

    /// Physical entries of a chunk for one keyspace, ordered by `(key, timestamp)`.
    ///
    /// Regular chunks contain a full snapshot of the branch at their lower bound;
    /// delta chunks contain only the branch-local changes.
    fn entries(&self, chunk: &Chunk, keyspace: &str) -> Result<Vec<StoredEntry>>;

    /// Keyspaces with entries in the chunk
    fn keyspaces(&self, chunk: &Chunk) -> Result<BTreeSet<String>>;

    fn chunk_at(&self, branch: &str, timestamp: Timestamp) -> Result<Option<Chunk>> {
        Ok(self
            .chunks(branch)?
            .into_iter()
            .find(|chunk| chunk.period.contains(timestamp)))
    }

    fn head_chunk(&self, branch: &str) -> Result<Chunk> {
        self.chunks(branch)?
            .into_iter()
            .find(|chunk| chunk.is_head())
            .ok_or_else(|| crate::IndexError::BranchNotFound(branch.to_string()))
    }
}
