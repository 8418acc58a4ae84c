//! Chunk-partitioned document backend
//!
//! Writes go to the head chunk index of their branch, reads to the chunk
//! covering the query timestamp. Chunk indices are self-contained (a delta
//! chunk carries its origin baseline), so no cross-branch shadowing is needed.

use super::{DocumentBackend, ReindexMode};
use crate::chunk::{ChunkDocumentIndex, ChunkIndexManager};
use crate::index::{IndexDocument, IndexModifications, OpenDocuments, RollbackOutcome};
use crate::query::SearchSpecification;
use crate::store::TemporalStore;
use crate::types::{IndexValue, QualifiedKey, Timestamp};
use crate::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub struct ChunkedBackend {
    store: Arc<dyn TemporalStore>,
    manager: Arc<ChunkIndexManager>,
}

impl ChunkedBackend {
    pub fn new(store: Arc<dyn TemporalStore>, manager: Arc<ChunkIndexManager>) -> Self {
        Self { store, manager }
    }

    pub fn manager(&self) -> &Arc<ChunkIndexManager> {
        &self.manager
    }

    fn head_index(&self, branch: &str) -> Result<Arc<ChunkDocumentIndex>> {
        let head = self.manager.source().head_chunk(branch)?;
        self.manager.get_index_for_chunk(&head)
    }
}

impl DocumentBackend for ChunkedBackend {
    fn apply(&self, modifications: &IndexModifications) -> Result<()> {
        let mut parts = Vec::new();
        for branch in modifications.branches() {
            let index = self.head_index(&branch)?;
            let part = modifications.for_branch(&branch);
            index.validate(&part)?;
            parts.push((index, part));
        }
        for (index, part) in &parts {
            index.apply(part)?;
        }
        Ok(())
    }

    fn matching_branch_local_documents(&self, branch: &str, keyspace: &str, key: &str) -> Result<OpenDocuments> {
        Ok(self.head_index(branch)?.open_documents(keyspace, key))
    }

    fn has_branch_local_documents(
        &self,
        branch: &str,
        index_name: &str,
        keyspace: &str,
        key: &str,
        value: &IndexValue,
    ) -> Result<bool> {
        Ok(self.head_index(branch)?.has_documents_for(index_name, keyspace, key, value))
    }

    fn query(&self, timestamp: Timestamp, branch: &str, spec: &SearchSpecification) -> Result<Vec<IndexDocument>> {
        let matcher = spec.matcher()?;
        let mut current = branch.to_string();

        loop {
            if let Some(chunk) = self.manager.source().chunk_at(&current, timestamp)? {
                let index = self.manager.get_index_for_chunk(&chunk)?;
                return Ok(index.query(&spec.index_name, timestamp, &matcher));
            }
            // Before the branch's first chunk: the origin's history applies
            match self.store.require_branch(&current)?.origin {
                Some(origin) => current = origin,
                None => return Ok(Vec::new()),
            }
        }
    }

    fn delete_index_contents(&self, index_name: &str) -> Result<()> {
        self.manager.delete_index_contents(index_name)
    }

    fn delete_index_and_indexers(&self, index_name: &str) -> Result<()> {
        self.manager.delete_index_and_indexers(index_name)
    }

    fn delete_all(&self) -> Result<()> {
        self.manager.delete_all_chunk_indices()
    }

    fn rollback(
        &self,
        branches: &[String],
        timestamp: Timestamp,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> Result<RollbackOutcome> {
        self.manager.rollback_chunk_indices(branches, timestamp, keys)
    }

    fn prepare_reindex(&self, indices: &BTreeSet<String>) -> Result<ReindexMode> {
        // Every chunk index embeds the full indexer set, so all of them are stale
        debug!(indices = indices.len(), "Invalidating all chunk indices for reindex");
        self.manager.delete_all_chunk_indices()?;
        Ok(ReindexMode::Lazy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{IndexerRegistry, IndexingProcess, Indexer};
    use crate::query::TextCondition;
    use crate::store::{JsonCodec, MemoryStore};
    use crate::types::{Object, MASTER_BRANCH};
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        registry: Arc<IndexerRegistry>,
        backend: ChunkedBackend,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let registry = Arc::new(IndexerRegistry::new());
            registry.add_indexer("name", Indexer::text("name")).unwrap();
            let manager = Arc::new(ChunkIndexManager::new(
                store.clone(),
                store.clone(),
                Arc::new(JsonCodec),
                registry.clone(),
                4,
            ));
            let backend = ChunkedBackend::new(store.clone(), manager);
            Self {
                store,
                registry,
                backend,
            }
        }

        fn commit(&self, branch: &str, ts: Timestamp, key: &str, value: Option<Object>) {
            let workload = self
                .store
                .stage(branch, ts, vec![("people".to_string(), key.to_string(), value)])
                .unwrap();
            IndexingProcess::new(&self.backend, self.store.as_ref(), self.registry.snapshot())
                .run(workload)
                .unwrap();
            self.store.publish(branch, ts).unwrap();
        }

        fn keys(&self, ts: Timestamp, branch: &str, value: &str) -> Vec<String> {
            let spec = SearchSpecification::text("name", TextCondition::Equals, value);
            let mut keys: Vec<String> = self
                .backend
                .query(ts, branch, &spec)
                .unwrap()
                .iter()
                .map(|d| d.key().to_string())
                .collect();
            keys.sort();
            keys
        }
    }

    #[test]
    fn test_commits_across_rollover() {
        let fx = Fixture::new();
        fx.commit(MASTER_BRANCH, 100, "k1", Some(json!({"name": "Hello"})));
        fx.commit(MASTER_BRANCH, 200, "k1", Some(json!({"name": "Hi"})));
        fx.store.rollover(MASTER_BRANCH, 250).unwrap();
        fx.commit(MASTER_BRANCH, 300, "k2", Some(json!({"name": "Hi"})));

        assert_eq!(fx.keys(150, MASTER_BRANCH, "Hello"), vec!["k1"]);
        assert_eq!(fx.keys(220, MASTER_BRANCH, "Hi"), vec!["k1"]);
        assert_eq!(fx.keys(300, MASTER_BRANCH, "Hi"), vec!["k1", "k2"]);
        assert!(fx.keys(300, MASTER_BRANCH, "Hello").is_empty());
        // The closed head was promoted when the first chunk was queried
        assert_eq!(fx.backend.manager().stats().pinned_heads, 1);
    }

    #[test]
    fn test_branch_reads_and_origin_fallback() {
        let fx = Fixture::new();
        fx.commit(MASTER_BRANCH, 100, "k1", Some(json!({"name": "A"})));
        fx.commit(MASTER_BRANCH, 110, "k2", Some(json!({"name": "A"})));
        fx.store.publish(MASTER_BRANCH, 150).unwrap();
        fx.store.create_branch("feature", MASTER_BRANCH, 150).unwrap();
        fx.commit("feature", 200, "k1", Some(json!({"name": "B"})));
        fx.commit(MASTER_BRANCH, 210, "k3", Some(json!({"name": "A"})));

        assert_eq!(fx.keys(250, "feature", "A"), vec!["k2"]);
        assert_eq!(fx.keys(250, "feature", "B"), vec!["k1"]);
        assert_eq!(fx.keys(180, "feature", "A"), vec!["k1", "k2"]);
        // Before the fork the branch reads its origin
        assert_eq!(fx.keys(105, "feature", "A"), vec!["k1"]);
        assert_eq!(fx.keys(250, MASTER_BRANCH, "A"), vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_rollback_and_reindex_invalidation() {
        let fx = Fixture::new();
        fx.commit(MASTER_BRANCH, 100, "k1", Some(json!({"name": "A"})));
        let workload = fx
            .store
            .stage(MASTER_BRANCH, 200, vec![("people".to_string(), "k1".to_string(), Some(json!({"name": "B"})))])
            .unwrap();
        IndexingProcess::new(&fx.backend, fx.store.as_ref(), fx.registry.snapshot())
            .run(workload)
            .unwrap();
        assert_eq!(fx.keys(200, MASTER_BRANCH, "B"), vec!["k1"]);

        // The commit is abandoned before publication
        let outcome = fx.backend.rollback(&[MASTER_BRANCH.to_string()], 200, None).unwrap();
        assert_eq!(outcome, RollbackOutcome { removed: 1, reopened: 1 });
        assert_eq!(fx.keys(300, MASTER_BRANCH, "A"), vec!["k1"]);

        let indices: BTreeSet<String> = ["name".to_string()].into_iter().collect();
        assert_eq!(fx.backend.prepare_reindex(&indices).unwrap(), ReindexMode::Lazy);
        assert_eq!(fx.backend.manager().stats().pinned_heads, 0);
        assert_eq!(fx.keys(300, MASTER_BRANCH, "A"), vec!["k1"]);
    }
}
