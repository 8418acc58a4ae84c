//! Incremental indexing process
//!
//! Turns a batch of value changes into document modifications. The batch may
//! span many commits, branches and timestamps and arrive in any order: entries
//! are sorted by `(timestamp, branch, keyspace, key)` and all entries of one
//! timestamp are flushed to the backend as a single set of modifications, since
//! a later entry of that timestamp may refer to documents created by an earlier
//! one.

use super::document::IndexDocument;
use super::indexer::{resolve_optional, IndexerMap};
use super::modifications::IndexModifications;
use super::table::OpenDocuments;
use crate::backend::DocumentBackend;
use crate::store::{BranchInfo, TemporalStore};
use crate::types::{IndexValue, TemporalKey, Timestamp, ValueChange};
use crate::Result;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, trace};

/// Counters of one indexing run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexingStats {
    pub entries: usize,
    pub creations: usize,
    pub terminations: usize,
    pub deletions: usize,
    pub flushes: usize,
}

impl IndexingStats {
    /// Whether any document was created, terminated or deleted
    pub fn modified(&self) -> bool {
        self.creations + self.terminations + self.deletions > 0
    }

    pub fn merge(&mut self, other: IndexingStats) {
        self.entries += other.entries;
        self.creations += other.creations;
        self.terminations += other.terminations;
        self.deletions += other.deletions;
        self.flushes += other.flushes;
    }

    fn record(&mut self, modifications: &IndexModifications) {
        self.creations += modifications.creations().len();
        self.terminations += modifications.terminations().len();
        self.deletions += modifications.deletions().len();
        self.flushes += 1;
    }
}

pub struct IndexingProcess<'a> {
    backend: &'a dyn DocumentBackend,
    store: &'a dyn TemporalStore,
    indexers: IndexerMap,
}

impl<'a> IndexingProcess<'a> {
    pub fn new(backend: &'a dyn DocumentBackend, store: &'a dyn TemporalStore, indexers: IndexerMap) -> Self {
        Self {
            backend,
            store,
            indexers,
        }
    }

    /// Only maintain the given indices
    pub fn restricted_to(mut self, indices: &BTreeSet<String>) -> Self {
        self.indexers.retain(|name, _| indices.contains(name));
        self
    }

    pub fn run<I>(&self, workload: I) -> Result<IndexingStats>
    where
        I: IntoIterator<Item = (TemporalKey, ValueChange)>,
    {
        let mut workload: Vec<(TemporalKey, ValueChange)> = workload.into_iter().collect();
        let mut stats = IndexingStats::default();
        if workload.is_empty() || self.indexers.is_empty() {
            return Ok(stats);
        }
        workload.sort_by(|a, b| a.0.cmp(&b.0));

        let mut branches: HashMap<String, BranchInfo> = HashMap::new();
        let mut modifications = IndexModifications::new();
        let mut current: Option<Timestamp> = None;

        for (id, change) in &workload {
            if current.is_some_and(|ts| ts != id.timestamp) {
                self.flush(&mut modifications, &mut stats)?;
            }
            current = Some(id.timestamp);

            if !branches.contains_key(&id.branch) {
                let info = self.store.require_branch(&id.branch)?;
                branches.insert(id.branch.clone(), info);
            }
            let branch = &branches[&id.branch];
            self.index_entry(id, change, branch, &mut modifications)?;
            stats.entries += 1;
        }
        self.flush(&mut modifications, &mut stats)?;

        debug!(
            entries = stats.entries,
            creations = stats.creations,
            terminations = stats.terminations,
            deletions = stats.deletions,
            flushes = stats.flushes,
            "Indexing batch processed"
        );
        Ok(stats)
    }

    fn flush(&self, modifications: &mut IndexModifications, stats: &mut IndexingStats) -> Result<()> {
        if modifications.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(modifications);
        trace!(modifications = batch.len(), "Flushing index modifications");
        self.backend.apply(&batch)?;
        stats.record(&batch);
        Ok(())
    }

    fn index_entry(
        &self,
        id: &TemporalKey,
        change: &ValueChange,
        branch: &BranchInfo,
        modifications: &mut IndexModifications,
    ) -> Result<()> {
        // Looked up lazily, at most once per entry
        let mut stored: Option<OpenDocuments> = None;

        for (index_name, indexers) in &self.indexers {
            let old = resolve_optional(index_name, indexers, change.old.as_ref())?;
            let new = resolve_optional(index_name, indexers, change.new.as_ref())?;
            if old.is_none() && new.is_none() {
                continue;
            }
            let old = old.unwrap_or_default();
            let new = new.unwrap_or_default();

            for value in new.difference(&old) {
                modifications.add_creation(IndexDocument::new(
                    index_name.as_str(),
                    id.branch.as_str(),
                    id.keyspace.as_str(),
                    id.key.as_str(),
                    value.clone(),
                    id.timestamp,
                ));
            }

            for value in old.difference(&new) {
                if stored.is_none() {
                    stored = Some(
                        self.backend
                            .matching_branch_local_documents(&id.branch, &id.keyspace, &id.key)?,
                    );
                }
                let open = stored
                    .as_ref()
                    .and_then(|docs| docs.get(index_name))
                    .and_then(|by_value| by_value.get(value));
                self.remove_value(index_name, value, id, branch, open, modifications)?;
            }
        }
        Ok(())
    }

    fn remove_value(
        &self,
        index_name: &str,
        value: &IndexValue,
        id: &TemporalKey,
        branch: &BranchInfo,
        stored: Option<&Vec<IndexDocument>>,
        modifications: &mut IndexModifications,
    ) -> Result<()> {
        let timestamp = id.timestamp;

        if let Some(pending) = modifications
            .pending_open_document(index_name, &id.branch, &id.keyspace, &id.key, value)
            .cloned()
        {
            return Self::close(pending, timestamp, modifications);
        }

        if let Some(document) = stored.and_then(|docs| docs.first()) {
            return Self::close(document.clone(), timestamp, modifications);
        }

        if branch.is_master() {
            // Value without a document on master: the index was not built for
            // this data yet (dirty), nothing to terminate
            trace!(index = index_name, key = %id.key, "No open document for removed value");
            return Ok(());
        }
        if branch.branching_timestamp >= timestamp {
            return Ok(());
        }
        if self
            .backend
            .has_branch_local_documents(&id.branch, index_name, &id.keyspace, &id.key, value)?
        {
            // Already closed on this branch
            trace!(index = index_name, key = %id.key, "Removed value has no open document");
            return Ok(());
        }

        // Inherited value that held on this branch since the fork
        let mut inherited = IndexDocument::new(
            index_name,
            id.branch.as_str(),
            id.keyspace.as_str(),
            id.key.as_str(),
            value.clone(),
            branch.branching_timestamp,
        );
        inherited.set_valid_to(timestamp)?;
        modifications.add_creation(inherited);
        Ok(())
    }

    fn close(document: IndexDocument, timestamp: Timestamp, modifications: &mut IndexModifications) -> Result<()> {
        if document.valid_from() == timestamp {
            modifications.add_deletion(document);
            Ok(())
        } else {
            modifications.add_termination(document, timestamp)
        }
    }
}
