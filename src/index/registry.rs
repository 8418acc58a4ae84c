//! Indexer registry
//!
//! Tracks, per index name:
//! - the registered indexers (all of one family)
//! - the dirty flag (documents may be out of sync, a reindex is required)
//!
//! Persisted next to the chunk index files when an index directory is configured.

use super::indexer::{Indexer, IndexerMap};
use crate::types::IndexFamily;
use crate::{IndexError, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

const REGISTRY_FILE: &str = "indexers.bin";

/// Registration of one index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDefinition {
    pub name: String,
    pub family: IndexFamily,
    pub indexers: Vec<Indexer>,
    pub dirty: bool,
}

pub struct IndexerRegistry {
    indexes: RwLock<BTreeMap<String, IndexDefinition>>,
    persist_path: Option<PathBuf>,
}

impl IndexerRegistry {
    /// Registry without persistence
    pub fn new() -> Self {
        Self {
            indexes: RwLock::new(BTreeMap::new()),
            persist_path: None,
        }
    }

    /// Open (or create) the registry persisted in `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        let persist_path = dir.as_ref().join(REGISTRY_FILE);

        let indexes = if persist_path.exists() {
            let data = fs::read(&persist_path)?;
            let definitions: Vec<IndexDefinition> = bincode::deserialize(&data)?;
            definitions
                .into_iter()
                .map(|definition| (definition.name.clone(), definition))
                .collect()
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            indexes: RwLock::new(indexes),
            persist_path: Some(persist_path),
        })
    }

    /// Register `indexer` under `index_name` and mark the index dirty.
    ///
    /// Returns `false` if the exact indexer was already registered.
    pub fn add_indexer(&self, index_name: &str, indexer: Indexer) -> Result<bool> {
        if index_name.is_empty() {
            return Err(IndexError::InvalidArgument("Index name must not be empty".into()));
        }
        let mut indexes = self.indexes.write();
        match indexes.get_mut(index_name) {
            Some(definition) => {
                if definition.family != indexer.family() {
                    return Err(IndexError::IndexerConflict {
                        index: index_name.to_string(),
                        detail: format!(
                            "cannot add a {} indexer to a {} index",
                            indexer.family(),
                            definition.family
                        ),
                    });
                }
                if definition.indexers.contains(&indexer) {
                    return Ok(false);
                }
                definition.indexers.push(indexer);
                definition.dirty = true;
            }
            None => {
                indexes.insert(
                    index_name.to_string(),
                    IndexDefinition {
                        name: index_name.to_string(),
                        family: indexer.family(),
                        indexers: vec![indexer],
                        dirty: true,
                    },
                );
            }
        }
        self.persist(&indexes)?;
        Ok(true)
    }

    /// Remove one indexer; the index disappears with its last indexer.
    ///
    /// Returns whether the indexer was registered.
    pub fn remove_indexer(&self, index_name: &str, indexer: &Indexer) -> Result<bool> {
        let mut indexes = self.indexes.write();
        let Some(definition) = indexes.get_mut(index_name) else {
            return Ok(false);
        };
        let before = definition.indexers.len();
        definition.indexers.retain(|existing| existing != indexer);
        let removed = definition.indexers.len() != before;
        if definition.indexers.is_empty() {
            indexes.remove(index_name);
        } else if removed {
            definition.dirty = true;
        }
        if removed {
            self.persist(&indexes)?;
        }
        Ok(removed)
    }

    pub fn remove_index(&self, index_name: &str) -> Result<bool> {
        let mut indexes = self.indexes.write();
        let removed = indexes.remove(index_name).is_some();
        if removed {
            self.persist(&indexes)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut indexes = self.indexes.write();
        indexes.clear();
        self.persist(&indexes)
    }

    pub fn contains(&self, index_name: &str) -> bool {
        self.indexes.read().contains_key(index_name)
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.read().is_empty()
    }

    pub fn family(&self, index_name: &str) -> Option<IndexFamily> {
        self.indexes.read().get(index_name).map(|d| d.family)
    }

    pub fn index_names(&self) -> BTreeSet<String> {
        self.indexes.read().keys().cloned().collect()
    }

    pub fn indexers(&self, index_name: &str) -> Vec<Indexer> {
        self.indexes
            .read()
            .get(index_name)
            .map(|d| d.indexers.clone())
            .unwrap_or_default()
    }

    /// Copy of all registrations (indexers only)
    pub fn snapshot(&self) -> IndexerMap {
        self.indexes
            .read()
            .iter()
            .map(|(name, definition)| (name.clone(), definition.indexers.clone()))
            .collect()
    }

    pub fn is_dirty(&self, index_name: &str) -> bool {
        self.indexes.read().get(index_name).map(|d| d.dirty).unwrap_or(false)
    }

    pub fn dirty_indices(&self) -> BTreeSet<String> {
        self.indexes
            .read()
            .values()
            .filter(|d| d.dirty)
            .map(|d| d.name.clone())
            .collect()
    }

    pub fn set_dirty(&self, index_name: &str, dirty: bool) -> Result<()> {
        let mut indexes = self.indexes.write();
        match indexes.get_mut(index_name) {
            Some(definition) if definition.dirty != dirty => definition.dirty = dirty,
            Some(_) => return Ok(()),
            None => return Err(IndexError::UnknownIndex(index_name.to_string())),
        }
        self.persist(&indexes)
    }

    /// Flag every index dirty; returns how many were clean before
    pub fn mark_all_dirty(&self) -> Result<usize> {
        let mut indexes = self.indexes.write();
        let mut marked = 0;
        for definition in indexes.values_mut().filter(|d| !d.dirty) {
            definition.dirty = true;
            marked += 1;
        }
        if marked > 0 {
            self.persist(&indexes)?;
        }
        Ok(marked)
    }

    /// Write `indexes` to disk; callers hold the write guard so snapshots land in order
    fn persist(&self, indexes: &BTreeMap<String, IndexDefinition>) -> Result<()> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let definitions: Vec<&IndexDefinition> = indexes.values().collect();
        let data = bincode::serialize(&definitions)?;

        let tmp_path = path.with_extension("bin.tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

impl Default for IndexerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_family_conflict() {
        let registry = IndexerRegistry::new();
        assert!(registry.add_indexer("name", Indexer::text("name")).unwrap());
        assert!(!registry.add_indexer("name", Indexer::text("name")).unwrap());

        let err = registry.add_indexer("name", Indexer::long("age")).unwrap_err();
        assert!(matches!(err, IndexError::IndexerConflict { .. }));
        assert_eq!(registry.indexers("name").len(), 1);
        assert_eq!(registry.family("name"), Some(IndexFamily::Text));
    }

    #[test]
    fn test_dirty_flags() {
        let registry = IndexerRegistry::new();
        registry.add_indexer("name", Indexer::text("name")).unwrap();
        assert!(registry.is_dirty("name"));

        registry.set_dirty("name", false).unwrap();
        assert!(registry.dirty_indices().is_empty());

        registry.add_indexer("name", Indexer::text("name").for_type("person")).unwrap();
        assert!(registry.is_dirty("name"));
        assert!(registry.set_dirty("unknown", false).is_err());
    }

    #[test]
    fn test_remove_last_indexer_removes_index() {
        let registry = IndexerRegistry::new();
        registry.add_indexer("name", Indexer::text("name")).unwrap();
        assert!(!registry.remove_indexer("name", &Indexer::text("other")).unwrap());
        assert!(registry.remove_indexer("name", &Indexer::text("name")).unwrap());
        assert!(!registry.contains("name"));
    }

    #[test]
    fn test_registry_persistence() {
        let dir = tempdir().unwrap();
        {
            let registry = IndexerRegistry::open(dir.path()).unwrap();
            registry.add_indexer("name", Indexer::text("name")).unwrap();
            registry.add_indexer("age", Indexer::long("age")).unwrap();
            registry.set_dirty("age", false).unwrap();
        }

        let reopened = IndexerRegistry::open(dir.path()).unwrap();
        assert_eq!(reopened.index_names().len(), 2);
        assert!(reopened.is_dirty("name"));
        assert!(!reopened.is_dirty("age"));
        assert_eq!(reopened.indexers("age"), vec![Indexer::long("age")]);

        assert_eq!(reopened.mark_all_dirty().unwrap(), 1);
        assert_eq!(reopened.mark_all_dirty().unwrap(), 0);
        drop(reopened);
        let again = IndexerRegistry::open(dir.path()).unwrap();
        assert_eq!(again.dirty_indices().len(), 2);
    }

    #[test]
    fn test_concurrent_mutations_persist_latest_state() {
        let dir = tempdir().unwrap();
        let registry = std::sync::Arc::new(IndexerRegistry::open(dir.path()).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry.add_indexer(&format!("index{}", i), Indexer::text("name")).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = IndexerRegistry::open(dir.path()).unwrap();
        assert_eq!(reopened.index_names(), registry.index_names());
        assert_eq!(reopened.index_names().len(), 8);
    }
}
