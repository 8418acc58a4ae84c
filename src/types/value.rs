//! Indexed values
//!
//! Index values form a closed set of families. A single index never mixes
//! families, which is enforced by the indexer registry at registration time.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Result-type family of an indexer (and of the values it produces)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexFamily {
    Text,
    Long,
    Double,
}

impl fmt::Display for IndexFamily {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IndexFamily::Text => write!(f, "text"),
            IndexFamily::Long => write!(f, "long"),
            IndexFamily::Double => write!(f, "double"),
        }
    }
}

/// A single value extracted by an indexer
///
/// Doubles are compared with `total_cmp` and hashed by bit pattern, so the
/// type has a total order and can be used as a map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexValue {
    Text(String),
    Long(i64),
    Double(f64),
}

impl IndexValue {
    pub fn family(&self) -> IndexFamily {
        match self {
            IndexValue::Text(_) => IndexFamily::Text,
            IndexValue::Long(_) => IndexFamily::Long,
            IndexValue::Double(_) => IndexFamily::Double,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            IndexValue::Text(s) => Some(s),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            IndexValue::Text(_) => 0,
            IndexValue::Long(_) => 1,
            IndexValue::Double(_) => 2,
        }
    }
}

impl PartialEq for IndexValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexValue {}

impl PartialOrd for IndexValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (IndexValue::Text(a), IndexValue::Text(b)) => a.cmp(b),
            (IndexValue::Long(a), IndexValue::Long(b)) => a.cmp(b),
            (IndexValue::Double(a), IndexValue::Double(b)) => a.total_cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for IndexValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            IndexValue::Text(s) => s.hash(state),
            IndexValue::Long(v) => v.hash(state),
            IndexValue::Double(v) => v.to_bits().hash(state),
        }
    }
}

impl fmt::Display for IndexValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IndexValue::Text(s) => write!(f, "'{}'", s),
            IndexValue::Long(v) => write!(f, "{}", v),
            IndexValue::Double(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for IndexValue {
    fn from(value: &str) -> Self {
        IndexValue::Text(value.to_string())
    }
}

impl From<String> for IndexValue {
    fn from(value: String) -> Self {
        IndexValue::Text(value)
    }
}

impl From<i64> for IndexValue {
    fn from(value: i64) -> Self {
        IndexValue::Long(value)
    }
}

impl From<f64> for IndexValue {
    fn from(value: f64) -> Self {
        IndexValue::Double(value)
    }
}
