//! Identifiers for keys and versioned writes

use super::{Object, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A key scoped by its keyspace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QualifiedKey {
    pub keyspace: String,
    pub key: String,
}

impl QualifiedKey {
    pub fn new(keyspace: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for QualifiedKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}", self.keyspace, self.key)
    }
}

/// Identifier of one versioned write: `(branch, keyspace, key)` at a timestamp.
///
/// Field order defines the derived ordering: timestamp first, then branch,
/// keyspace and key. The indexing process relies on exactly this order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TemporalKey {
    pub timestamp: Timestamp,
    pub branch: String,
    pub keyspace: String,
    pub key: String,
}

impl TemporalKey {
    pub fn new(
        branch: impl Into<String>,
        keyspace: impl Into<String>,
        key: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            timestamp,
            branch: branch.into(),
            keyspace: keyspace.into(),
            key: key.into(),
        }
    }

    pub fn qualified_key(&self) -> QualifiedKey {
        QualifiedKey::new(self.keyspace.clone(), self.key.clone())
    }
}

impl fmt::Display for TemporalKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}:{}->{}", self.branch, self.timestamp, self.keyspace, self.key)
    }
}

/// Old and new value of one write (`None` = absent / deleted)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueChange {
    pub old: Option<Object>,
    pub new: Option<Object>,
}

impl ValueChange {
    pub fn new(old: Option<Object>, new: Option<Object>) -> Self {
        Self { old, new }
    }

    pub fn insert(new: Object) -> Self {
        Self { old: None, new: Some(new) }
    }

    pub fn update(old: Object, new: Object) -> Self {
        Self { old: Some(old), new: Some(new) }
    }

    pub fn delete(old: Object) -> Self {
        Self { old: Some(old), new: None }
    }
}
