//! In-memory document backend
//!
//! One [`DocumentTable`] per branch. A branch only stores the documents it
//! produced itself; queries walk the origin chain and hide origin documents
//! that a descendant branch has taken over.

use super::{DocumentBackend, ReindexMode};
use crate::index::{DocumentTable, IndexDocument, IndexModifications, OpenDocuments, RollbackOutcome};
use crate::query::SearchSpecification;
use crate::store::TemporalStore;
use crate::types::{IndexValue, QualifiedKey, Timestamp};
use crate::Result;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub struct InMemoryBackend {
    store: Arc<dyn TemporalStore>,
    tables: DashMap<String, DocumentTable>,
}

impl InMemoryBackend {
    pub fn new(store: Arc<dyn TemporalStore>) -> Self {
        Self {
            store,
            tables: DashMap::new(),
        }
    }

    /// Copy of every document stored by `branch` itself
    pub fn branch_documents(&self, branch: &str) -> Vec<IndexDocument> {
        self.tables
            .get(branch)
            .map(|table| table.documents().cloned().collect())
            .unwrap_or_default()
    }

    pub fn document_count(&self) -> usize {
        self.tables.iter().map(|table| table.len()).sum()
    }

    /// Whether a descendant branch stores any document for the document's tuple
    fn is_shadowed(&self, document: &IndexDocument, descendants: &[String]) -> bool {
        descendants.iter().any(|branch| {
            self.tables.get(branch).is_some_and(|table| {
                table.has_documents_for(document.index_name(), document.keyspace(), document.key(), document.value())
            })
        })
    }
}

impl DocumentBackend for InMemoryBackend {
    fn apply(&self, modifications: &IndexModifications) -> Result<()> {
        let parts: Vec<(String, IndexModifications)> = modifications
            .branches()
            .into_iter()
            .map(|branch| {
                let part = modifications.for_branch(&branch);
                (branch, part)
            })
            .collect();

        for (branch, part) in &parts {
            match self.tables.get(branch) {
                Some(table) => table.validate(part)?,
                None => DocumentTable::new(branch.as_str()).validate(part)?,
            }
        }
        for (branch, part) in &parts {
            self.tables
                .entry(branch.clone())
                .or_insert_with(|| DocumentTable::new(branch.as_str()))
                .apply(part)?;
        }
        Ok(())
    }

    fn matching_branch_local_documents(&self, branch: &str, keyspace: &str, key: &str) -> Result<OpenDocuments> {
        Ok(self
            .tables
            .get(branch)
            .map(|table| table.open_documents(keyspace, key))
            .unwrap_or_default())
    }

    fn has_branch_local_documents(
        &self,
        branch: &str,
        index_name: &str,
        keyspace: &str,
        key: &str,
        value: &IndexValue,
    ) -> Result<bool> {
        Ok(self
            .tables
            .get(branch)
            .is_some_and(|table| table.has_documents_for(index_name, keyspace, key, value)))
    }

    fn query(&self, timestamp: Timestamp, branch: &str, spec: &SearchSpecification) -> Result<Vec<IndexDocument>> {
        let matcher = spec.matcher()?;
        let mut results = Vec::new();
        // Branches below the current one whose documents take precedence
        let mut descendants: Vec<String> = Vec::new();
        let mut current = branch.to_string();
        let mut at = timestamp;

        loop {
            let info = self.store.require_branch(&current)?;
            let found = self
                .tables
                .get(&current)
                .map(|table| table.query(&spec.index_name, at, &matcher))
                .unwrap_or_default();
            results.extend(found.into_iter().filter(|doc| !self.is_shadowed(doc, &descendants)));

            let Some(origin) = info.origin else {
                break;
            };
            if at >= info.branching_timestamp {
                descendants.push(current);
            }
            at = at.min(info.branching_timestamp);
            current = origin;
        }
        Ok(results)
    }

    fn delete_index_contents(&self, index_name: &str) -> Result<()> {
        let removed: usize = self
            .tables
            .iter_mut()
            .map(|mut table| table.delete_index(index_name))
            .sum();
        debug!(index = index_name, removed, "Deleted index documents");
        Ok(())
    }

    fn delete_index_and_indexers(&self, index_name: &str) -> Result<()> {
        self.delete_index_contents(index_name)
    }

    fn delete_all(&self) -> Result<()> {
        self.tables.clear();
        Ok(())
    }

    fn rollback(
        &self,
        branches: &[String],
        timestamp: Timestamp,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> Result<RollbackOutcome> {
        let mut outcome = RollbackOutcome::default();
        for branch in branches {
            if let Some(mut table) = self.tables.get_mut(branch) {
                outcome.merge(table.rollback(timestamp, keys));
            }
        }
        Ok(outcome)
    }

    fn prepare_reindex(&self, indices: &BTreeSet<String>) -> Result<ReindexMode> {
        for index_name in indices {
            self.delete_index_contents(index_name)?;
        }
        Ok(ReindexMode::Replay)
    }
}
