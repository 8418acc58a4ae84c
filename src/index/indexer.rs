//! Indexers: value extraction functions
//!
//! Indexers are plain data (a JSON pointer plus an optional type tag) so they
//! can be persisted in the registry and in chunk index files, and compared to
//! detect stale files.

use crate::types::{IndexFamily, IndexValue, Object};
use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Object field holding the type tag matched by [`FieldExtractor::type_tag`]
pub const TYPE_TAG_FIELD: &str = "_type";

/// Indexers per index name
pub type IndexerMap = BTreeMap<String, Vec<Indexer>>;

/// Extracts the value(s) found at a JSON pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldExtractor {
    /// JSON pointer, e.g. `/name` or `/address/city`
    pub pointer: String,
    /// Only objects whose `_type` field equals this tag are indexed
    pub type_tag: Option<String>,
}

impl FieldExtractor {
    pub fn new(pointer: impl Into<String>) -> Self {
        let pointer = pointer.into();
        let pointer = if pointer.starts_with('/') || pointer.is_empty() {
            pointer
        } else {
            format!("/{}", pointer)
        };
        Self { pointer, type_tag: None }
    }

    fn applies_to(&self, object: &Object) -> bool {
        let Some(fields) = object.as_object() else {
            return false;
        };
        match &self.type_tag {
            Some(tag) => fields.get(TYPE_TAG_FIELD).and_then(|t| t.as_str()) == Some(tag.as_str()),
            None => true,
        }
    }

    /// Raw JSON values at the pointer, arrays flattened one level
    fn raw_values<'a>(&self, object: &'a Object) -> Vec<&'a Object> {
        match object.pointer(&self.pointer) {
            Some(Object::Array(items)) => items.iter().collect(),
            Some(Object::Null) | None => Vec::new(),
            Some(value) => vec![value],
        }
    }
}

/// A value extraction function of one result-type family
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Indexer {
    Text(FieldExtractor),
    Long(FieldExtractor),
    Double(FieldExtractor),
}

impl Indexer {
    pub fn text(pointer: impl Into<String>) -> Self {
        Indexer::Text(FieldExtractor::new(pointer))
    }

    pub fn long(pointer: impl Into<String>) -> Self {
        Indexer::Long(FieldExtractor::new(pointer))
    }

    pub fn double(pointer: impl Into<String>) -> Self {
        Indexer::Double(FieldExtractor::new(pointer))
    }

    /// Restrict the indexer to objects tagged with `tag`
    pub fn for_type(mut self, tag: impl Into<String>) -> Self {
        self.extractor_mut().type_tag = Some(tag.into());
        self
    }

    pub fn family(&self) -> IndexFamily {
        match self {
            Indexer::Text(_) => IndexFamily::Text,
            Indexer::Long(_) => IndexFamily::Long,
            Indexer::Double(_) => IndexFamily::Double,
        }
    }

    pub fn extractor(&self) -> &FieldExtractor {
        match self {
            Indexer::Text(e) | Indexer::Long(e) | Indexer::Double(e) => e,
        }
    }

    fn extractor_mut(&mut self) -> &mut FieldExtractor {
        match self {
            Indexer::Text(e) | Indexer::Long(e) | Indexer::Double(e) => e,
        }
    }

    pub fn can_index(&self, object: &Object) -> bool {
        self.extractor().applies_to(object)
    }

    /// Values produced for `object`; nulls and mistyped values are dropped
    pub fn extract_values(&self, object: &Object) -> BTreeSet<IndexValue> {
        let raw = self.extractor().raw_values(object);
        match self {
            Indexer::Text(_) => raw
                .into_iter()
                .filter_map(|v| v.as_str().map(|s| IndexValue::Text(s.to_string())))
                .collect(),
            Indexer::Long(_) => raw
                .into_iter()
                .filter_map(|v| v.as_i64().map(IndexValue::Long))
                .collect(),
            Indexer::Double(_) => raw
                .into_iter()
                .filter_map(|v| v.as_f64().map(IndexValue::Double))
                .collect(),
        }
    }
}

/// Values of `index_name` for `object`.
///
/// Returns `None` when no indexer of the index applies to the object, and
/// `IndexerConflict` when more than one does.
pub fn resolve_values(
    index_name: &str,
    indexers: &[Indexer],
    object: &Object,
) -> Result<Option<BTreeSet<IndexValue>>> {
    let mut capable = indexers.iter().filter(|indexer| indexer.can_index(object));
    let Some(first) = capable.next() else {
        return Ok(None);
    };
    if capable.next().is_some() {
        return Err(IndexError::IndexerConflict {
            index: index_name.to_string(),
            detail: "more than one indexer claims the same value".to_string(),
        });
    }
    Ok(Some(first.extract_values(object)))
}

/// Values for an optional object (`None` = no value = empty set)
pub fn resolve_optional(
    index_name: &str,
    indexers: &[Indexer],
    object: Option<&Object>,
) -> Result<Option<BTreeSet<IndexValue>>> {
    match object {
        Some(object) => resolve_values(index_name, indexers, object),
        None => Ok(None),
    }
}
