//! Materialized documents of one chunk

use super::persistence::ChunkIndexPayload;
use crate::index::{DocumentTable, IndexDocument, IndexModifications, IndexerMap, OpenDocuments, RollbackOutcome};
use crate::query::ValueMatcher;
use crate::store::Chunk;
use crate::types::{IndexValue, QualifiedKey, Timestamp};
use crate::Result;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};

/// Document table of a chunk plus the indexers it was built with.
///
/// Shared behind `Arc`; only head chunk indices are mutated after creation.
pub struct ChunkDocumentIndex {
    chunk: Chunk,
    indexers: IndexerMap,
    table: RwLock<DocumentTable>,
    persistent: AtomicBool,
}

impl ChunkDocumentIndex {
    pub fn new(chunk: Chunk, indexers: IndexerMap, table: DocumentTable) -> Self {
        Self {
            chunk,
            indexers,
            table: RwLock::new(table),
            persistent: AtomicBool::new(false),
        }
    }

    pub fn from_payload(chunk: Chunk, payload: ChunkIndexPayload) -> Result<Self> {
        let table = DocumentTable::from_records(chunk.branch(), payload.documents)?;
        let index = Self::new(chunk, payload.indexers, table);
        index.mark_persistent();
        Ok(index)
    }

    pub fn to_payload(&self) -> ChunkIndexPayload {
        ChunkIndexPayload {
            branch: self.chunk.branch().to_string(),
            indexers: self.indexers.clone(),
            documents: self.table.read().to_records(),
        }
    }

    /// Same documents under an updated chunk handle (head chunk closed by the store)
    pub fn reassign(&self, chunk: Chunk) -> Self {
        Self::new(chunk, self.indexers.clone(), self.table.read().clone())
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    pub fn indexers(&self) -> &IndexerMap {
        &self.indexers
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn mark_persistent(&self) {
        self.persistent.store(true, Ordering::Release);
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.read().is_empty()
    }

    pub fn documents(&self) -> Vec<IndexDocument> {
        self.table.read().documents().cloned().collect()
    }

    pub fn validate(&self, modifications: &IndexModifications) -> Result<()> {
        self.table.read().validate(modifications)
    }

    pub fn apply(&self, modifications: &IndexModifications) -> Result<()> {
        self.table.write().apply(modifications)
    }

    pub fn open_documents(&self, keyspace: &str, key: &str) -> OpenDocuments {
        self.table.read().open_documents(keyspace, key)
    }

    pub fn has_documents_for(&self, index_name: &str, keyspace: &str, key: &str, value: &IndexValue) -> bool {
        self.table.read().has_documents_for(index_name, keyspace, key, value)
    }

    pub fn query(&self, index_name: &str, timestamp: Timestamp, matcher: &ValueMatcher) -> Vec<IndexDocument> {
        self.table.read().query(index_name, timestamp, matcher)
    }

    pub fn delete_index(&self, index_name: &str) -> usize {
        self.table.write().delete_index(index_name)
    }

    pub fn rollback(&self, timestamp: Timestamp, keys: Option<&BTreeSet<QualifiedKey>>) -> RollbackOutcome {
        self.table.write().rollback(timestamp, keys)
    }
}
