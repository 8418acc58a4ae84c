//! Index manager configuration
//!
//! Selects the document backend and sizes the caches. Stored as JSON.

use crate::backend::{ChunkedBackend, DocumentBackend, InMemoryBackend};
use crate::chunk::{ChunkIndexManager, DEFAULT_CHUNK_CACHE_CAPACITY};
use crate::index::{IndexManager, IndexerRegistry, DEFAULT_QUERY_CACHE_CAPACITY};
use crate::query::QueryCache;
use crate::store::{ChunkSource, TemporalStore, ValueCodec};
use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Sub-directory of the index directory holding chunk index files
const CHUNK_DIR: &str = "chunks";

/// Physical layout of index documents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendKind {
    /// One document table per branch, nothing persisted
    #[default]
    InMemory,
    /// One document table per store chunk, closed chunks persisted as sealed files
    Chunked,
}

/// Query result cache settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryCacheConfig {
    /// When disabled (or with capacity 0) every search goes to the backend
    pub enabled: bool,
    pub capacity: usize,
}

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_QUERY_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub backend: BackendKind,

    pub query_cache: QueryCacheConfig,

    /// Closed chunk indices kept in memory (head chunk indices are not counted)
    pub chunk_cache_capacity: usize,

    /// Indexer registry and chunk index files; `None` keeps everything in memory
    pub index_dir: Option<PathBuf>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::InMemory,
            query_cache: QueryCacheConfig::default(),
            chunk_cache_capacity: DEFAULT_CHUNK_CACHE_CAPACITY,
            index_dir: None,
        }
    }
}

impl IndexConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn chunked<P: AsRef<Path>>(index_dir: P) -> Self {
        Self {
            backend: BackendKind::Chunked,
            index_dir: Some(index_dir.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Same settings without a query cache
    pub fn without_query_cache(mut self) -> Self {
        self.query_cache.enabled = false;
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = fs::read(path)?;
        let config: IndexConfig = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_cache_capacity == 0 {
            return Err(IndexError::InvalidArgument(
                "chunk_cache_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Assemble an [`IndexManager`] over the given store
    pub fn build(
        &self,
        store: Arc<dyn TemporalStore>,
        source: Arc<dyn ChunkSource>,
        codec: Arc<dyn ValueCodec>,
    ) -> Result<IndexManager> {
        self.validate()?;

        let registry = Arc::new(match &self.index_dir {
            Some(dir) => IndexerRegistry::open(dir)?,
            None => IndexerRegistry::new(),
        });
        let cache = QueryCache::new(self.query_cache.enabled, self.query_cache.capacity);

        let manager = match self.backend {
            BackendKind::InMemory => {
                // Documents are not persisted, only the registrations survive a reopen
                let marked = registry.mark_all_dirty()?;
                if marked > 0 {
                    debug!(indices = marked, "Reopened in-memory indices flagged for reindex");
                }
                let backend: Arc<dyn DocumentBackend> = Arc::new(InMemoryBackend::new(Arc::clone(&store)));
                IndexManager::new(store, codec, registry, backend, cache)
            }
            BackendKind::Chunked => {
                let mut chunks = ChunkIndexManager::new(
                    Arc::clone(&store),
                    source,
                    Arc::clone(&codec),
                    Arc::clone(&registry),
                    self.chunk_cache_capacity,
                );
                if let Some(dir) = &self.index_dir {
                    chunks = chunks.with_index_dir(dir.join(CHUNK_DIR))?;
                }
                let chunks = Arc::new(chunks);
                let backend: Arc<dyn DocumentBackend> =
                    Arc::new(ChunkedBackend::new(Arc::clone(&store), Arc::clone(&chunks)));
                IndexManager::new(store, codec, registry, backend, cache).with_chunk_manager(chunks)
            }
        };

        info!(
            backend = ?self.backend,
            index_dir = ?self.index_dir,
            query_cache = self.query_cache.enabled,
            "Index manager created"
        );
        Ok(manager)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::Indexer;
    use crate::query::{SearchSpecification, TextCondition};
    use crate::store::{JsonCodec, MemoryStore};
    use crate::types::MASTER_BRANCH;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_config_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("index.json");

        let config = IndexConfig::chunked(dir.path().join("idx")).without_query_cache();
        config.save(&path).unwrap();
        assert_eq!(IndexConfig::load(&path).unwrap(), config);

        // Missing fields take their defaults
        fs::write(&path, br#"{"backend": "Chunked"}"#).unwrap();
        let partial = IndexConfig::load(&path).unwrap();
        assert_eq!(partial.backend, BackendKind::Chunked);
        assert_eq!(partial.chunk_cache_capacity, DEFAULT_CHUNK_CACHE_CAPACITY);
        assert!(partial.query_cache.enabled);

        fs::write(&path, br#"{"chunk_cache_capacity": 0}"#).unwrap();
        assert!(matches!(IndexConfig::load(&path), Err(IndexError::InvalidArgument(_))));
    }

    #[test]
    fn test_build_reopens_registry() {
        let dir = TempDir::new().unwrap();
        let config = IndexConfig::chunked(dir.path());
        let store = Arc::new(MemoryStore::new());

        let manager = config.build(store.clone(), store.clone(), Arc::new(JsonCodec)).unwrap();
        manager.add_indexer("name", Indexer::text("name")).unwrap();
        assert!(manager.stats().chunks.is_some());
        drop(manager);

        let reopened = config.build(store.clone(), store, Arc::new(JsonCodec)).unwrap();
        assert_eq!(reopened.indexers("name"), vec![Indexer::text("name")]);
        assert!(reopened.is_reindex_required());
    }

    #[test]
    fn test_in_memory_reopen_reindexes() {
        let dir = TempDir::new().unwrap();
        let config = IndexConfig {
            index_dir: Some(dir.path().to_path_buf()),
            ..IndexConfig::in_memory()
        };
        let store = Arc::new(MemoryStore::new());
        let spec = SearchSpecification::text("name", TextCondition::Equals, "A");

        let manager = config.build(store.clone(), store.clone(), Arc::new(JsonCodec)).unwrap();
        manager.add_indexer("name", Indexer::text("name")).unwrap();
        manager.reindex_all().unwrap();
        let workload = store
            .stage(MASTER_BRANCH, 100, vec![("people".to_string(), "k1".to_string(), Some(json!({"name": "A"})))])
            .unwrap();
        manager.index(workload).unwrap();
        store.publish(MASTER_BRANCH, 100).unwrap();
        assert_eq!(manager.query(100, MASTER_BRANCH, &spec).unwrap().len(), 1);
        assert!(!manager.is_reindex_required());
        drop(manager);

        let reopened = config.build(store.clone(), store, Arc::new(JsonCodec)).unwrap();
        assert!(reopened.is_reindex_required());
        let found = reopened.query(100, MASTER_BRANCH, &spec).unwrap();
        assert_eq!(found.len(), 1);
        assert!(!reopened.is_reindex_required());
    }
}
