//! Index manager
//!
//! Owning facade over the indexer registry, the document backend and the
//! query cache. A global readers-writer lock separates the two classes of
//! callers:
//! - shared: commit indexing, queries, registry reads
//! - exclusive: indexer changes, index removal, reindex, rollback
//!
//! Every operation that changes which documents exist clears the query cache.

use super::indexer::Indexer;
use super::process::{IndexingProcess, IndexingStats};
use super::registry::IndexerRegistry;
use super::table::RollbackOutcome;
use crate::backend::{DocumentBackend, InMemoryBackend, ReindexMode};
use crate::chunk::{ChunkIndexManager, ChunkManagerStats};
use crate::query::{CacheStats, QueryCache, QueryEvaluator, QueryNode, SearchResult, SearchSpecification};
use crate::store::{BranchInfo, JsonCodec, TemporalStore, ValueCodec};
use crate::types::{Period, QualifiedKey, TemporalKey, Timestamp, ValueChange};
use crate::{IndexError, Result};
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of cached atomic search results
pub const DEFAULT_QUERY_CACHE_CAPACITY: usize = 1024;

/// Index manager statistics
#[derive(Debug, Clone)]
pub struct IndexManagerStats {
    pub indices: usize,
    pub dirty_indices: usize,
    pub query_cache: CacheStats,
    /// Present for the chunked backend only
    pub chunks: Option<ChunkManagerStats>,
}

pub struct IndexManager {
    store: Arc<dyn TemporalStore>,
    codec: Arc<dyn ValueCodec>,
    registry: Arc<IndexerRegistry>,
    backend: Arc<dyn DocumentBackend>,
    chunks: Option<Arc<ChunkIndexManager>>,
    cache: QueryCache,
    lock: RwLock<()>,
}

impl IndexManager {
    pub fn new(
        store: Arc<dyn TemporalStore>,
        codec: Arc<dyn ValueCodec>,
        registry: Arc<IndexerRegistry>,
        backend: Arc<dyn DocumentBackend>,
        cache: QueryCache,
    ) -> Self {
        Self {
            store,
            codec,
            registry,
            backend,
            chunks: None,
            cache,
            lock: RwLock::new(()),
        }
    }

    /// In-memory backend, JSON values, default query cache
    pub fn in_memory(store: Arc<dyn TemporalStore>) -> Self {
        let backend = Arc::new(InMemoryBackend::new(Arc::clone(&store)));
        Self::new(
            store,
            Arc::new(JsonCodec),
            Arc::new(IndexerRegistry::new()),
            backend,
            QueryCache::new(true, DEFAULT_QUERY_CACHE_CAPACITY),
        )
    }

    /// Expose the chunk manager backing a chunked backend (for statistics)
    pub fn with_chunk_manager(mut self, chunks: Arc<ChunkIndexManager>) -> Self {
        self.chunks = Some(chunks);
        self
    }

    pub fn registry(&self) -> &Arc<IndexerRegistry> {
        &self.registry
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    // ==================== Registry ====================

    /// Register an indexer; the index becomes dirty.
    ///
    /// Returns `false` if the indexer was already registered.
    pub fn add_indexer(&self, index_name: &str, indexer: Indexer) -> Result<bool> {
        let _guard = self.lock.write();
        let added = self.registry.add_indexer(index_name, indexer)?;
        if added {
            self.cache.invalidate_all();
            info!(index = index_name, "Indexer added, reindex required");
        }
        Ok(added)
    }

    /// Unregister an indexer. Removing the last indexer removes the index and
    /// its documents; otherwise the index becomes dirty.
    pub fn remove_indexer(&self, index_name: &str, indexer: &Indexer) -> Result<bool> {
        let _guard = self.lock.write();
        if !self.registry.remove_indexer(index_name, indexer)? {
            return Ok(false);
        }
        if !self.registry.contains(index_name) {
            self.backend.delete_index_and_indexers(index_name)?;
            info!(index = index_name, "Last indexer removed, index dropped");
        }
        self.cache.invalidate_all();
        Ok(true)
    }

    pub fn remove_index(&self, index_name: &str) -> Result<bool> {
        let _guard = self.lock.write();
        if !self.registry.remove_index(index_name)? {
            return Ok(false);
        }
        self.backend.delete_index_and_indexers(index_name)?;
        self.cache.invalidate_all();
        info!(index = index_name, "Index removed");
        Ok(true)
    }

    /// Drop every index registration and document
    pub fn clear_all_indices(&self) -> Result<()> {
        let _guard = self.lock.write();
        self.registry.clear()?;
        self.backend.delete_all()?;
        self.cache.invalidate_all();
        info!("All indices cleared");
        Ok(())
    }

    pub fn index_names(&self) -> BTreeSet<String> {
        let _guard = self.lock.read();
        self.registry.index_names()
    }

    pub fn indexers(&self, index_name: &str) -> Vec<Indexer> {
        let _guard = self.lock.read();
        self.registry.indexers(index_name)
    }

    pub fn is_reindex_required(&self) -> bool {
        let _guard = self.lock.read();
        !self.registry.dirty_indices().is_empty()
    }

    pub fn dirty_indices(&self) -> BTreeSet<String> {
        let _guard = self.lock.read();
        self.registry.dirty_indices()
    }

    // ==================== Indexing ====================

    /// Index a batch of committed (or staged) value changes
    pub fn index<I>(&self, workload: I) -> Result<IndexingStats>
    where
        I: IntoIterator<Item = (TemporalKey, ValueChange)>,
    {
        let _guard = self.lock.read();
        let stats = IndexingProcess::new(self.backend.as_ref(), self.store.as_ref(), self.registry.snapshot())
            .run(workload)?;
        if stats.modified() {
            self.cache.invalidate_all();
        }
        Ok(stats)
    }

    pub fn reindex(&self, indices: &BTreeSet<String>) -> Result<IndexingStats> {
        let _guard = self.lock.write();
        self.reindex_locked(indices)
    }

    pub fn reindex_all(&self) -> Result<IndexingStats> {
        let _guard = self.lock.write();
        self.reindex_locked(&self.registry.index_names())
    }

    pub fn reindex_dirty(&self) -> Result<IndexingStats> {
        let _guard = self.lock.write();
        self.reindex_locked(&self.registry.dirty_indices())
    }

    /// Discard document state at or after `timestamp` on `branches`
    /// (optionally only for `keys`), e.g. for a commit that was indexed but
    /// never published.
    pub fn rollback(
        &self,
        branches: &[String],
        timestamp: Timestamp,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> Result<RollbackOutcome> {
        let _guard = self.lock.write();
        let outcome = self.backend.rollback(branches, timestamp, keys)?;
        self.cache.invalidate_all();
        info!(
            branches = ?branches,
            timestamp,
            removed = outcome.removed,
            reopened = outcome.reopened,
            "Index rollback"
        );
        Ok(outcome)
    }

    // ==================== Queries ====================

    /// Identifiers matching one specification (cached)
    pub fn query(&self, timestamp: Timestamp, branch: &str, spec: &SearchSpecification) -> Result<SearchResult> {
        self.ensure_clean(std::iter::once(&spec.index_name))?;
        let _guard = self.lock.read();
        self.evaluator().atomic(timestamp, branch, spec)
    }

    /// Keys of `keyspace` matching `query`
    pub fn evaluate(
        &self,
        timestamp: Timestamp,
        branch: &str,
        keyspace: &str,
        query: &QueryNode,
    ) -> Result<BTreeSet<QualifiedKey>> {
        self.ensure_clean(query.index_names().iter())?;
        let _guard = self.lock.read();
        self.evaluator().evaluate(timestamp, branch, keyspace, query)
    }

    /// Like [`IndexManager::evaluate`], as identifiers on the requested branch
    pub fn find_identifiers(
        &self,
        timestamp: Timestamp,
        branch: &str,
        keyspace: &str,
        query: &QueryNode,
    ) -> Result<Vec<TemporalKey>> {
        Ok(self
            .evaluate(timestamp, branch, keyspace, query)?
            .into_iter()
            .map(|k| TemporalKey::new(branch, k.keyspace, k.key, timestamp))
            .collect())
    }

    pub fn stats(&self) -> IndexManagerStats {
        let _guard = self.lock.read();
        IndexManagerStats {
            indices: self.registry.index_names().len(),
            dirty_indices: self.registry.dirty_indices().len(),
            query_cache: self.cache.stats(),
            chunks: self.chunks.as_ref().map(|chunks| chunks.stats()),
        }
    }

    fn evaluator(&self) -> QueryEvaluator<'_> {
        QueryEvaluator::new(self.backend.as_ref(), self.store.as_ref(), &self.registry, &self.cache)
    }

    /// Reindex before reading any dirty index among `indices`
    fn ensure_clean<'n, I>(&self, indices: I) -> Result<()>
    where
        I: IntoIterator<Item = &'n String>,
    {
        let dirty = indices.into_iter().any(|name| self.registry.is_dirty(name));
        if dirty {
            let _guard = self.lock.write();
            // Another caller may have reindexed while we waited
            self.reindex_locked(&self.registry.dirty_indices())?;
        }
        Ok(())
    }

    fn reindex_locked(&self, indices: &BTreeSet<String>) -> Result<IndexingStats> {
        if let Some(unknown) = indices.iter().find(|name| !self.registry.contains(name)) {
            return Err(IndexError::UnknownIndex(unknown.clone()));
        }
        if indices.is_empty() {
            return Ok(IndexingStats::default());
        }

        let mode = self.backend.prepare_reindex(indices)?;
        let stats = match mode {
            ReindexMode::Replay => self.replay(indices)?,
            ReindexMode::Lazy => IndexingStats::default(),
        };
        for name in indices {
            self.registry.set_dirty(name, false)?;
        }
        self.cache.invalidate_all();

        info!(
            indices = ?indices,
            mode = ?mode,
            entries = stats.entries,
            creations = stats.creations,
            "Reindex complete"
        );
        Ok(stats)
    }

    /// Re-run the published history of every branch, origins first
    fn replay(&self, indices: &BTreeSet<String>) -> Result<IndexingStats> {
        let process = IndexingProcess::new(self.backend.as_ref(), self.store.as_ref(), self.registry.snapshot())
            .restricted_to(indices);

        let mut total = IndexingStats::default();
        for branch in self.store.branches()? {
            let workload = self.history(&branch)?;
            debug!(branch = %branch.name, entries = workload.len(), "Replaying branch history");
            total.merge(process.run(workload)?);
        }
        Ok(total)
    }

    /// Branch-local writes as value changes against the previously visible value
    fn history(&self, branch: &BranchInfo) -> Result<Vec<(TemporalKey, ValueChange)>> {
        let mut workload = Vec::new();
        for keyspace in self.store.keyspaces(&branch.name, branch.now)? {
            for entry in self.store.entries(&branch.name, &keyspace, Period::eternal())? {
                let old = match entry.timestamp.checked_sub(1) {
                    Some(before) => self.decode(self.store.get(&branch.name, &keyspace, &entry.key, before)?)?,
                    None => None,
                };
                let new = self.decode(entry.value)?;
                workload.push((
                    TemporalKey::new(branch.name.as_str(), keyspace.as_str(), entry.key, entry.timestamp),
                    ValueChange::new(old, new),
                ));
            }
        }
        Ok(workload)
    }

    fn decode(&self, bytes: Option<Vec<u8>>) -> Result<Option<crate::types::Object>> {
        bytes.map(|bytes| self.codec.decode(&bytes)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendKind, IndexConfig};
    use crate::query::{NumberCondition, TextCondition};
    use crate::store::MemoryStore;
    use crate::types::{Object, MASTER_BRANCH};
    use serde_json::json;
    use tempfile::TempDir;

    fn commit(manager: &IndexManager, store: &MemoryStore, branch: &str, ts: Timestamp, key: &str, value: Option<Object>) {
        let workload = store
            .stage(branch, ts, vec![("people".to_string(), key.to_string(), value)])
            .unwrap();
        manager.index(workload).unwrap();
        store.publish(branch, ts).unwrap();
    }

    fn keys(manager: &IndexManager, ts: Timestamp, branch: &str, spec: SearchSpecification) -> Vec<String> {
        manager
            .evaluate(ts, branch, "people", &QueryNode::leaf(spec))
            .unwrap()
            .into_iter()
            .map(|k| k.key)
            .collect()
    }

    fn vowels(count: &str) -> SearchSpecification {
        SearchSpecification::text("vowels", TextCondition::Equals, count)
    }

    fn managers(dir: &TempDir) -> Vec<(Arc<MemoryStore>, IndexManager)> {
        [BackendKind::InMemory, BackendKind::Chunked]
            .into_iter()
            .map(|backend| {
                let store = Arc::new(MemoryStore::new());
                let config = IndexConfig {
                    backend,
                    index_dir: Some(dir.path().join(format!("{:?}", backend))),
                    ..IndexConfig::default()
                };
                let manager = config.build(store.clone(), store.clone(), Arc::new(JsonCodec)).unwrap();
                (store, manager)
            })
            .collect()
    }

    #[test]
    fn test_hello_hi() {
        let dir = TempDir::new().unwrap();
        for (store, manager) in managers(&dir) {
            manager.add_indexer("vowels", Indexer::text("vowels")).unwrap();
            commit(&manager, &store, MASTER_BRANCH, 100, "k1", Some(json!({"text": "Hello", "vowels": "2"})));
            commit(&manager, &store, MASTER_BRANCH, 200, "k1", Some(json!({"text": "Hi", "vowels": "1"})));

            assert_eq!(keys(&manager, 150, MASTER_BRANCH, vowels("2")), vec!["k1"]);
            assert!(keys(&manager, 200, MASTER_BRANCH, vowels("2")).is_empty());
            assert_eq!(keys(&manager, 250, MASTER_BRANCH, vowels("1")), vec!["k1"]);
            assert!(keys(&manager, 99, MASTER_BRANCH, vowels("2")).is_empty());
            assert!(!manager.is_reindex_required());
        }
    }

    #[test]
    fn test_unknown_index_after_removal() {
        let manager = IndexManager::in_memory(Arc::new(MemoryStore::new()));
        manager.add_indexer("name", Indexer::text("name")).unwrap();
        let spec = SearchSpecification::text("name", TextCondition::Equals, "A");
        assert!(manager.query(100, MASTER_BRANCH, &spec).unwrap().is_empty());

        assert!(manager.remove_index("name").unwrap());
        assert!(matches!(
            manager.query(100, MASTER_BRANCH, &spec),
            Err(IndexError::UnknownIndex(_))
        ));
        assert!(!manager.remove_index("name").unwrap());
    }

    #[test]
    fn test_query_cache_invalidation() {
        let store = Arc::new(MemoryStore::new());
        let manager = IndexManager::in_memory(store.clone());
        manager.add_indexer("name", Indexer::text("name")).unwrap();
        commit(&manager, &store, MASTER_BRANCH, 100, "k1", Some(json!({"name": "A", "age": 3})));

        let spec = SearchSpecification::text("name", TextCondition::Equals, "A");
        let first = manager.query(100, MASTER_BRANCH, &spec).unwrap();
        let second = manager.query(100, MASTER_BRANCH, &spec).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.stats().query_cache.hits, 1);

        // Unrelated structural change clears every cached result
        manager.add_indexer("age", Indexer::long("age")).unwrap();
        assert_eq!(manager.stats().query_cache.size, 0);
        let third = manager.query(100, MASTER_BRANCH, &spec).unwrap();
        assert_eq!(first, third);
        assert!(!Arc::ptr_eq(&first, &third));

        let age = SearchSpecification::long("age", NumberCondition::LessThan, 5);
        assert_eq!(manager.query(100, MASTER_BRANCH, &age).unwrap().len(), 1);
    }

    #[test]
    fn test_dirty_index_is_reindexed_on_query() {
        let dir = TempDir::new().unwrap();
        for (store, manager) in managers(&dir) {
            // Written before any index exists
            commit(&manager, &store, MASTER_BRANCH, 100, "k1", Some(json!({"name": "A"})));
            commit(&manager, &store, MASTER_BRANCH, 110, "k2", Some(json!({"name": "A"})));
            store.publish(MASTER_BRANCH, 150).unwrap();
            store.create_branch("feature", MASTER_BRANCH, 150).unwrap();
            commit(&manager, &store, "feature", 200, "k1", None);
            commit(&manager, &store, MASTER_BRANCH, 210, "k2", Some(json!({"name": "B"})));

            manager.add_indexer("name", Indexer::text("name")).unwrap();
            assert_eq!(manager.dirty_indices().len(), 1);

            let a = || SearchSpecification::text("name", TextCondition::Equals, "A");
            assert_eq!(keys(&manager, 250, MASTER_BRANCH, a()), vec!["k1"]);
            assert!(!manager.is_reindex_required());
            assert_eq!(keys(&manager, 250, "feature", a()), vec!["k2"]);
            assert_eq!(keys(&manager, 180, "feature", a()), vec!["k1", "k2"]);

            let ids = manager
                .find_identifiers(250, "feature", "people", &QueryNode::leaf(a()))
                .unwrap();
            assert_eq!(ids, vec![TemporalKey::new("feature", "people", "k2", 250)]);
        }
    }

    #[test]
    fn test_rollback_of_unpublished_commit() {
        let dir = TempDir::new().unwrap();
        for (store, manager) in managers(&dir) {
            manager.add_indexer("name", Indexer::text("name")).unwrap();
            commit(&manager, &store, MASTER_BRANCH, 100, "k1", Some(json!({"name": "A"})));

            let workload = store
                .stage(MASTER_BRANCH, 200, vec![("people".to_string(), "k1".to_string(), Some(json!({"name": "B"})))])
                .unwrap();
            manager.index(workload).unwrap();
            let discarded = store.discard(MASTER_BRANCH, 200).unwrap();
            let outcome = manager
                .rollback(&[MASTER_BRANCH.to_string()], 200, Some(&discarded))
                .unwrap();
            assert_eq!(outcome, RollbackOutcome { removed: 1, reopened: 1 });

            store.publish(MASTER_BRANCH, 300).unwrap();
            let a = SearchSpecification::text("name", TextCondition::Equals, "A");
            assert_eq!(keys(&manager, 300, MASTER_BRANCH, a), vec!["k1"]);
            let b = SearchSpecification::text("name", TextCondition::Equals, "B");
            assert!(keys(&manager, 300, MASTER_BRANCH, b).is_empty());
        }
    }

    #[test]
    fn test_commit_indexed_after_publish() {
        let dir = TempDir::new().unwrap();
        for (store, manager) in managers(&dir) {
            manager.add_indexer("name", Indexer::text("name")).unwrap();
            manager.reindex_all().unwrap();
            let publish_then_index = |ts: Timestamp, name: &str| {
                let workload = store
                    .stage(MASTER_BRANCH, ts, vec![("people".to_string(), "k1".to_string(), Some(json!({"name": name})))])
                    .unwrap();
                store.publish(MASTER_BRANCH, ts).unwrap();
                manager.index(workload).unwrap();
            };
            let name = |value: &str| SearchSpecification::text("name", TextCondition::Equals, value);

            publish_then_index(100, "A");
            publish_then_index(200, "B");
            assert!(keys(&manager, 250, MASTER_BRANCH, name("A")).is_empty());
            assert_eq!(keys(&manager, 250, MASTER_BRANCH, name("B")), vec!["k1"]);

            // Published, rebuilt from the store, and only then indexed
            let workload = store
                .stage(MASTER_BRANCH, 300, vec![("people".to_string(), "k1".to_string(), Some(json!({"name": "C"})))])
                .unwrap();
            store.publish(MASTER_BRANCH, 300).unwrap();
            manager.reindex_all().unwrap();
            assert_eq!(keys(&manager, 300, MASTER_BRANCH, name("C")), vec!["k1"]);
            manager.index(workload).unwrap();

            assert!(keys(&manager, 350, MASTER_BRANCH, name("B")).is_empty());
            assert_eq!(keys(&manager, 350, MASTER_BRANCH, name("C")), vec!["k1"]);
            assert_eq!(keys(&manager, 150, MASTER_BRANCH, name("A")), vec!["k1"]);
        }
    }

    #[test]
    fn test_rollback_clears_cached_results() {
        let store = Arc::new(MemoryStore::new());
        let manager = IndexManager::in_memory(store.clone());
        manager.add_indexer("name", Indexer::text("name")).unwrap();
        manager.add_indexer("age", Indexer::long("age")).unwrap();
        commit(&manager, &store, MASTER_BRANCH, 100, "k1", Some(json!({"name": "A", "age": 3})));

        let workload = store
            .stage(MASTER_BRANCH, 200, vec![("people".to_string(), "k1".to_string(), Some(json!({"name": "B", "age": 3})))])
            .unwrap();
        manager.index(workload).unwrap();

        let age = SearchSpecification::long("age", NumberCondition::Equals, 3);
        let before = manager.query(100, MASTER_BRANCH, &age).unwrap();
        let stats = manager.stats().query_cache;
        assert!(stats.size > 0);

        // The rolled back commit never touched "age"
        let discarded = store.discard(MASTER_BRANCH, 200).unwrap();
        manager
            .rollback(&[MASTER_BRANCH.to_string()], 200, Some(&discarded))
            .unwrap();
        assert_eq!(manager.stats().query_cache.size, 0);

        let after = manager.query(100, MASTER_BRANCH, &age).unwrap();
        assert_eq!(before, after);
        assert_eq!(manager.stats().query_cache.misses, stats.misses + 1);
    }

    #[test]
    fn test_remove_last_indexer_drops_index() {
        let manager = IndexManager::in_memory(Arc::new(MemoryStore::new()));
        let indexer = Indexer::text("name");
        manager.add_indexer("name", indexer.clone()).unwrap();
        assert!(!manager.add_indexer("name", indexer.clone()).unwrap());
        assert!(matches!(
            manager.add_indexer("name", Indexer::long("age")),
            Err(IndexError::IndexerConflict { .. })
        ));

        assert!(manager.remove_indexer("name", &indexer).unwrap());
        assert!(manager.index_names().is_empty());
        assert!(manager.indexers("name").is_empty());
        assert!(manager.reindex(&["name".to_string()].into_iter().collect()).is_err());
    }
}
