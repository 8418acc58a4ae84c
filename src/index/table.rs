//! Document table
//!
//! All documents of one branch (or one chunk of a branch), addressable by id,
//! by index name and by qualified key. Both backends store their documents in
//! tables; the chunked backend persists a table per chunk.

use super::document::{DocumentId, DocumentRecord, IndexDocument};
use super::modifications::IndexModifications;
use crate::query::ValueMatcher;
use crate::types::{IndexValue, QualifiedKey, Timestamp};
use crate::{IndexError, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Open documents of one key: index name -> value -> documents
pub type OpenDocuments = BTreeMap<String, BTreeMap<IndexValue, Vec<IndexDocument>>>;

/// Outcome of a rollback on one table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub removed: usize,
    pub reopened: usize,
}

impl RollbackOutcome {
    pub fn merge(&mut self, other: RollbackOutcome) {
        self.removed += other.removed;
        self.reopened += other.reopened;
    }

    pub fn is_empty(&self) -> bool {
        self.removed == 0 && self.reopened == 0
    }
}

#[derive(Debug, Clone)]
pub struct DocumentTable {
    branch: String,
    documents: HashMap<DocumentId, IndexDocument>,
    by_index: HashMap<String, HashSet<DocumentId>>,
    by_key: HashMap<QualifiedKey, HashSet<DocumentId>>,
}

impl DocumentTable {
    pub fn new(branch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            documents: HashMap::new(),
            by_index: HashMap::new(),
            by_key: HashMap::new(),
        }
    }

    /// Rebuild a table from persisted records
    pub fn from_records(branch: &str, records: Vec<DocumentRecord>) -> Result<Self> {
        let mut table = Self::new(branch);
        for record in records {
            table.insert(IndexDocument::from_record(branch, record)?);
        }
        Ok(table)
    }

    pub fn to_records(&self) -> Vec<DocumentRecord> {
        let mut records: Vec<DocumentRecord> = self.documents.values().map(IndexDocument::to_record).collect();
        records.sort_by(|a, b| {
            (&a.index_name, &a.keyspace, &a.key, a.valid_from, &a.value).cmp(&(
                &b.index_name,
                &b.keyspace,
                &b.key,
                b.valid_from,
                &b.value,
            ))
        });
        records
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn get(&self, id: DocumentId) -> Option<&IndexDocument> {
        self.documents.get(&id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &IndexDocument> {
        self.documents.values()
    }

    pub fn insert(&mut self, document: IndexDocument) {
        let id = document.id();
        self.by_index
            .entry(document.index_name().to_string())
            .or_default()
            .insert(id);
        self.by_key.entry(document.qualified_key()).or_default().insert(id);
        self.documents.insert(id, document);
    }

    pub fn remove(&mut self, id: DocumentId) -> Option<IndexDocument> {
        let document = self.documents.remove(&id)?;
        if let Some(ids) = self.by_index.get_mut(document.index_name()) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_index.remove(document.index_name());
            }
        }
        let qualified_key = document.qualified_key();
        if let Some(ids) = self.by_key.get_mut(&qualified_key) {
            ids.remove(&id);
            if ids.is_empty() {
                self.by_key.remove(&qualified_key);
            }
        }
        Some(document)
    }

    /// Check that every termination and deletion targets a known document
    pub fn validate(&self, modifications: &IndexModifications) -> Result<()> {
        for creation in modifications.creations() {
            if creation.branch() != self.branch {
                return Err(IndexError::InconsistentDocument(format!(
                    "{} does not belong to branch '{}'",
                    creation, self.branch
                )));
            }
        }
        for termination in modifications.terminations() {
            let stored = self.documents.get(&termination.document.id()).ok_or_else(|| {
                IndexError::InconsistentDocument(format!("cannot terminate unknown {}", termination.document))
            })?;
            if termination.terminate_at <= stored.valid_from() {
                return Err(IndexError::InvalidPeriod {
                    from: stored.valid_from(),
                    to: termination.terminate_at,
                });
            }
        }
        for deletion in modifications.deletions() {
            if !self.documents.contains_key(&deletion.id()) {
                return Err(IndexError::InconsistentDocument(format!("cannot delete unknown {}", deletion)));
            }
        }
        Ok(())
    }

    /// Apply a batch atomically: nothing is changed if validation fails
    pub fn apply(&mut self, modifications: &IndexModifications) -> Result<()> {
        self.validate(modifications)?;

        for termination in modifications.terminations() {
            if let Some(stored) = self.documents.get_mut(&termination.document.id()) {
                stored.set_valid_to(termination.terminate_at)?;
            }
        }
        for deletion in modifications.deletions() {
            self.remove(deletion.id());
        }
        for creation in modifications.creations() {
            // A table rebuilt from published entries may already hold the commit
            if !self.has_same_start(creation) {
                self.insert(creation.clone());
            }
        }
        Ok(())
    }

    /// Whether a document of the creation's tuple starting at the same timestamp exists
    fn has_same_start(&self, creation: &IndexDocument) -> bool {
        self.key_documents(&creation.qualified_key()).any(|d| {
            d.index_name() == creation.index_name()
                && d.value() == creation.value()
                && d.valid_from() == creation.valid_from()
        })
    }

    /// Open documents of one key, grouped by index and value
    pub fn open_documents(&self, keyspace: &str, key: &str) -> OpenDocuments {
        let mut grouped = OpenDocuments::new();
        let qualified_key = QualifiedKey::new(keyspace, key);
        for document in self.key_documents(&qualified_key).filter(|d| d.is_open()) {
            grouped
                .entry(document.index_name().to_string())
                .or_default()
                .entry(document.value().clone())
                .or_default()
                .push(document.clone());
        }
        grouped
    }

    fn key_documents<'a>(&'a self, qualified_key: &QualifiedKey) -> impl Iterator<Item = &'a IndexDocument> + 'a {
        self.by_key
            .get(qualified_key)
            .into_iter()
            .flat_map(|ids| ids.iter())
            .filter_map(|id| self.documents.get(id))
    }

    /// Documents of `index_name` valid at `timestamp` whose value matches
    pub fn query(&self, index_name: &str, timestamp: Timestamp, matcher: &ValueMatcher) -> Vec<IndexDocument> {
        let Some(ids) = self.by_index.get(index_name) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.documents.get(id))
            .filter(|d| d.is_valid_at(timestamp) && matcher.matches(d.value()))
            .cloned()
            .collect()
    }

    /// Whether any document (at any time) exists for the tuple
    pub fn has_documents_for(&self, index_name: &str, keyspace: &str, key: &str, value: &IndexValue) -> bool {
        self.key_documents(&QualifiedKey::new(keyspace, key))
            .any(|d| d.index_name() == index_name && d.value() == value)
    }

    pub fn index_names(&self) -> BTreeSet<String> {
        self.by_index.keys().cloned().collect()
    }

    /// Drop every document of `index_name`; returns how many were removed
    pub fn delete_index(&mut self, index_name: &str) -> usize {
        let Some(ids) = self.by_index.get(index_name).cloned() else {
            return 0;
        };
        for id in &ids {
            self.remove(*id);
        }
        ids.len()
    }

    pub fn clear(&mut self) {
        self.documents.clear();
        self.by_index.clear();
        self.by_key.clear();
    }

    /// Undo everything that happened at or after `timestamp`.
    ///
    /// Documents created at or after `timestamp` are removed, documents
    /// terminated at or after it are reopened. With `keys`, only documents of
    /// those keys are touched.
    pub fn rollback(&mut self, timestamp: Timestamp, keys: Option<&BTreeSet<QualifiedKey>>) -> RollbackOutcome {
        let candidates: Vec<DocumentId> = match keys {
            Some(keys) => keys
                .iter()
                .filter_map(|k| self.by_key.get(k))
                .flat_map(|ids| ids.iter().copied())
                .collect(),
            None => self.documents.keys().copied().collect(),
        };

        let mut outcome = RollbackOutcome::default();
        for id in candidates {
            let Some(document) = self.documents.get_mut(&id) else {
                continue;
            };
            if document.valid_from() >= timestamp {
                self.remove(id);
                outcome.removed += 1;
            } else if !document.is_open() && document.valid_to() >= timestamp {
                document.reopen();
                outcome.reopened += 1;
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{SearchSpecification, TextCondition};

    fn doc(key: &str, value: &str, from: Timestamp) -> IndexDocument {
        IndexDocument::new("name", "master", "people", key, value.into(), from)
    }

    fn equals(value: &str) -> ValueMatcher {
        SearchSpecification::text("name", TextCondition::Equals, value)
            .matcher()
            .unwrap()
    }

    #[test]
    fn test_apply_is_atomic() {
        let mut table = DocumentTable::new("master");
        let existing = doc("k1", "a", 100);
        table.insert(existing.clone());

        let mut mods = IndexModifications::new();
        mods.add_creation(doc("k2", "b", 200));
        mods.add_termination(existing.clone(), 200).unwrap();
        mods.add_deletion(doc("k3", "ghost", 50));

        let err = table.apply(&mods).unwrap_err();
        assert!(matches!(err, IndexError::InconsistentDocument(_)));
        assert_eq!(table.len(), 1);
        assert!(table.get(existing.id()).unwrap().is_open());
    }

    #[test]
    fn test_apply_and_query() {
        let mut table = DocumentTable::new("master");
        let first = doc("k1", "a", 100);
        table.insert(first.clone());

        let mut mods = IndexModifications::new();
        mods.add_termination(first, 200).unwrap();
        mods.add_creation(doc("k1", "b", 200));
        table.apply(&mods).unwrap();

        assert_eq!(table.query("name", 150, &equals("a")).len(), 1);
        assert!(table.query("name", 200, &equals("a")).is_empty());
        assert_eq!(table.query("name", 200, &equals("b")).len(), 1);
        assert!(table.query("other", 200, &equals("b")).is_empty());

        let open = table.open_documents("people", "k1");
        assert_eq!(open["name"].len(), 1);
        assert!(open["name"].contains_key(&IndexValue::from("b")));
        assert!(table.has_documents_for("name", "people", "k1", &"a".into()));
    }

    #[test]
    fn test_creation_already_present_is_skipped() {
        let mut table = DocumentTable::new("master");
        let mut rebuilt = doc("k1", "a", 100);
        rebuilt.set_valid_to(200).unwrap();
        table.insert(rebuilt.clone());

        let mut mods = IndexModifications::new();
        mods.add_creation(doc("k1", "a", 100));
        mods.add_creation(doc("k1", "a", 300));
        table.apply(&mods).unwrap();

        assert_eq!(table.len(), 2);
        assert!(table.query("name", 250, &equals("a")).is_empty());
        assert_eq!(table.query("name", 300, &equals("a")).len(), 1);
        assert_eq!(table.get(rebuilt.id()).unwrap().valid_to(), 200);
    }

    #[test]
    fn test_rollback_removes_and_reopens() {
        let mut table = DocumentTable::new("master");
        let mut early = doc("k1", "a", 100);
        early.set_valid_to(200).unwrap();
        table.insert(early.clone());
        table.insert(doc("k1", "b", 200));
        let mut other = doc("k2", "c", 50);
        other.set_valid_to(250).unwrap();
        table.insert(other.clone());

        let only_k1: BTreeSet<_> = [QualifiedKey::new("people", "k1")].into_iter().collect();
        let outcome = table.rollback(200, Some(&only_k1));
        assert_eq!(outcome, RollbackOutcome { removed: 1, reopened: 1 });
        assert!(table.get(early.id()).unwrap().is_open());
        assert!(!table.get(other.id()).unwrap().is_open());

        let outcome = table.rollback(200, None);
        assert_eq!(outcome.reopened, 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_records_and_index_deletion() {
        let mut table = DocumentTable::new("feature");
        table.insert(IndexDocument::new("name", "feature", "people", "k1", "a".into(), 1));
        table.insert(IndexDocument::new("age", "feature", "people", "k1", IndexValue::Long(3), 1));

        let restored = DocumentTable::from_records("feature", table.to_records()).unwrap();
        assert_eq!(restored.len(), 2);
        assert_eq!(restored.index_names().len(), 2);

        let mut table = restored;
        assert_eq!(table.delete_index("age"), 1);
        assert_eq!(table.index_names().into_iter().collect::<Vec<_>>(), vec!["name".to_string()]);
    }
}
