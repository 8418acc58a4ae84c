//! Index documents
//!
//! An index document is the atomic indexing fact: "in `branch`, the key
//! `keyspace/key` produced `value` for index `index_name` during
//! `[valid_from, valid_to)`". Only `valid_to` ever changes after creation.

use crate::types::{IndexValue, QualifiedKey, Timestamp, TIMESTAMP_INFINITY};
use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique document identity, used for equality only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct IndexDocument {
    id: DocumentId,
    index_name: String,
    branch: String,
    keyspace: String,
    key: String,
    value: IndexValue,
    valid_from: Timestamp,
    valid_to: Timestamp,
}

impl IndexDocument {
    /// Create an open document valid from `valid_from`
    pub fn new(
        index_name: impl Into<String>,
        branch: impl Into<String>,
        keyspace: impl Into<String>,
        key: impl Into<String>,
        value: IndexValue,
        valid_from: Timestamp,
    ) -> Self {
        Self {
            id: DocumentId::generate(),
            index_name: index_name.into(),
            branch: branch.into(),
            keyspace: keyspace.into(),
            key: key.into(),
            value,
            valid_from,
            valid_to: TIMESTAMP_INFINITY,
        }
    }

    /// Rebuild a document from its persisted record under a fresh id
    pub fn from_record(branch: &str, record: DocumentRecord) -> Result<Self> {
        if record.valid_from >= record.valid_to {
            return Err(IndexError::InvalidPeriod {
                from: record.valid_from,
                to: record.valid_to,
            });
        }
        Ok(Self {
            id: DocumentId::generate(),
            index_name: record.index_name,
            branch: branch.to_string(),
            keyspace: record.keyspace,
            key: record.key,
            value: record.value,
            valid_from: record.valid_from,
            valid_to: record.valid_to,
        })
    }

    pub fn to_record(&self) -> DocumentRecord {
        DocumentRecord {
            index_name: self.index_name.clone(),
            keyspace: self.keyspace.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            valid_from: self.valid_from,
            valid_to: self.valid_to,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.id
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn value(&self) -> &IndexValue {
        &self.value
    }

    pub fn valid_from(&self) -> Timestamp {
        self.valid_from
    }

    pub fn valid_to(&self) -> Timestamp {
        self.valid_to
    }

    pub fn qualified_key(&self) -> QualifiedKey {
        QualifiedKey::new(self.keyspace.clone(), self.key.clone())
    }

    pub fn is_open(&self) -> bool {
        self.valid_to == TIMESTAMP_INFINITY
    }

    pub fn is_valid_at(&self, timestamp: Timestamp) -> bool {
        self.valid_from <= timestamp && timestamp < self.valid_to
    }

    /// Terminate (or re-terminate) validity at `valid_to`.
    ///
    /// Fails without touching the document when `valid_to <= valid_from`;
    /// such a document has to be deleted instead.
    pub fn set_valid_to(&mut self, valid_to: Timestamp) -> Result<()> {
        if valid_to <= self.valid_from {
            return Err(IndexError::InvalidPeriod {
                from: self.valid_from,
                to: valid_to,
            });
        }
        self.valid_to = valid_to;
        Ok(())
    }

    /// Reopen a terminated document (rollback only)
    pub(crate) fn reopen(&mut self) {
        self.valid_to = TIMESTAMP_INFINITY;
    }

    /// Content equality, ignoring the document id
    pub fn same_content(&self, other: &IndexDocument) -> bool {
        self.content() == other.content()
    }

    /// `(index, branch, keyspace, key, value, valid_from, valid_to)`
    pub fn content(&self) -> (&str, &str, &str, &str, &IndexValue, Timestamp, Timestamp) {
        (
            &self.index_name,
            &self.branch,
            &self.keyspace,
            &self.key,
            &self.value,
            self.valid_from,
            self.valid_to,
        )
    }
}

impl PartialEq for IndexDocument {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for IndexDocument {}

impl std::hash::Hash for IndexDocument {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for IndexDocument {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let to = if self.is_open() {
            "+inf".to_string()
        } else {
            self.valid_to.to_string()
        };
        write!(
            f,
            "IndexDocument[{}: {}/{}->{} = {} @ [{}, {})]",
            self.index_name, self.branch, self.keyspace, self.key, self.value, self.valid_from, to
        )
    }
}

/// Persisted form of a document (branch is stored once per chunk file)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub index_name: String,
    pub keyspace: String,
    pub key: String,
    pub value: IndexValue,
    pub valid_from: Timestamp,
    pub valid_to: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_termination_rules() {
        let mut doc = IndexDocument::new("name", "master", "people", "k1", "Hello".into(), 100);
        assert!(doc.is_open());
        assert!(doc.is_valid_at(100));
        assert!(!doc.is_valid_at(99));

        assert!(doc.set_valid_to(100).is_err());
        assert!(doc.set_valid_to(50).is_err());
        assert!(doc.is_open());

        doc.set_valid_to(200).unwrap();
        assert!(!doc.is_open());
        assert!(doc.is_valid_at(199));
        assert!(!doc.is_valid_at(200));
    }

    #[test]
    fn test_identity_vs_content() {
        let a = IndexDocument::new("name", "master", "people", "k1", "x".into(), 1);
        let b = IndexDocument::new("name", "master", "people", "k1", "x".into(), 1);
        assert_ne!(a, b);
        assert!(a.same_content(&b));
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_record_round_trip_rejects_bad_interval() {
        let doc = IndexDocument::new("name", "master", "people", "k1", "x".into(), 5);
        let restored = IndexDocument::from_record("master", doc.to_record()).unwrap();
        assert!(restored.same_content(&doc));
        assert_ne!(restored.id(), doc.id());

        let mut broken = doc.to_record();
        broken.valid_to = 5;
        assert!(IndexDocument::from_record("master", broken).is_err());
    }
}
