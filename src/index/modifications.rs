//! Batched document modifications
//!
//! One `IndexModifications` holds every change produced for a single commit
//! timestamp. It is flushed to the backend as a unit.

use super::document::{DocumentId, IndexDocument};
use crate::types::{IndexValue, Timestamp};
use crate::{IndexError, Result};
use std::collections::BTreeSet;

/// Set `valid_to` of an existing document
#[derive(Debug, Clone)]
pub struct DocumentTermination {
    pub document: IndexDocument,
    pub terminate_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct IndexModifications {
    creations: Vec<IndexDocument>,
    terminations: Vec<DocumentTermination>,
    deletions: Vec<IndexDocument>,
}

impl IndexModifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_creation(&mut self, document: IndexDocument) {
        self.creations.push(document);
    }

    /// Schedule termination of `document` at `timestamp`
    pub fn add_termination(&mut self, document: IndexDocument, timestamp: Timestamp) -> Result<()> {
        if timestamp <= document.valid_from() {
            return Err(IndexError::InvalidPeriod {
                from: document.valid_from(),
                to: timestamp,
            });
        }
        if let Some(pending) = self.pending_creation_mut(document.id()) {
            return pending.set_valid_to(timestamp);
        }
        self.terminations.push(DocumentTermination {
            document,
            terminate_at: timestamp,
        });
        Ok(())
    }

    /// Schedule deletion of `document`; a creation pending in this batch is cancelled instead
    pub fn add_deletion(&mut self, document: IndexDocument) {
        let before = self.creations.len();
        self.creations.retain(|pending| pending.id() != document.id());
        if self.creations.len() == before {
            self.deletions.push(document);
        }
    }

    /// Open document created in this batch for the given coordinates
    pub fn pending_open_document(
        &self,
        index_name: &str,
        branch: &str,
        keyspace: &str,
        key: &str,
        value: &IndexValue,
    ) -> Option<&IndexDocument> {
        self.creations.iter().find(|doc| {
            doc.is_open()
                && doc.index_name() == index_name
                && doc.branch() == branch
                && doc.keyspace() == keyspace
                && doc.key() == key
                && doc.value() == value
        })
    }

    fn pending_creation_mut(&mut self, id: DocumentId) -> Option<&mut IndexDocument> {
        self.creations.iter_mut().find(|doc| doc.id() == id)
    }

    pub fn creations(&self) -> &[IndexDocument] {
        &self.creations
    }

    pub fn terminations(&self) -> &[DocumentTermination] {
        &self.terminations
    }

    pub fn deletions(&self) -> &[IndexDocument] {
        &self.deletions
    }

    pub fn is_empty(&self) -> bool {
        self.creations.is_empty() && self.terminations.is_empty() && self.deletions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.creations.len() + self.terminations.len() + self.deletions.len()
    }

    /// Branches touched by this batch
    pub fn branches(&self) -> BTreeSet<String> {
        self.creations
            .iter()
            .map(|d| d.branch())
            .chain(self.terminations.iter().map(|t| t.document.branch()))
            .chain(self.deletions.iter().map(|d| d.branch()))
            .map(str::to_string)
            .collect()
    }

    /// The part of this batch that targets `branch`
    pub fn for_branch(&self, branch: &str) -> IndexModifications {
        IndexModifications {
            creations: self.creations.iter().filter(|d| d.branch() == branch).cloned().collect(),
            terminations: self
                .terminations
                .iter()
                .filter(|t| t.document.branch() == branch)
                .cloned()
                .collect(),
            deletions: self.deletions.iter().filter(|d| d.branch() == branch).cloned().collect(),
        }
    }
}
