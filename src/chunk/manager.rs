//! Chunk index manager
//!
//! Maps store chunks to their [`ChunkDocumentIndex`]:
//! - closed chunks live in a bounded LRU cache, backed by sealed files when an
//!   index directory is configured
//! - head chunks receive the documents of new commits and are pinned until
//!   they are invalidated or the store closes them
//! - concurrent requests for one chunk share a single load
//!
//! Loaders hold the read side of `load_process_lock` from the cache miss until
//! the result is cached; every invalidation takes the write side.

use super::builder::ChunkIndexBuilder;
use super::document_index::ChunkDocumentIndex;
use super::persistence::ChunkFileStore;
use crate::index::{IndexerMap, IndexerRegistry, RollbackOutcome};
use crate::store::{Chunk, ChunkId, ChunkSource, TemporalStore, ValueCodec};
use crate::types::{QualifiedKey, Timestamp};
use crate::{IndexError, Result};
use lru::LruCache;
use parking_lot::{Condvar, Mutex, RwLock};
use rayon::prelude::*;
use std::collections::{BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Closed chunk indices kept in memory when no capacity is given
pub const DEFAULT_CHUNK_CACHE_CAPACITY: usize = 64;

/// Outcome of an in-flight load, shared with waiting callers
struct PendingLoad {
    state: Mutex<Option<std::result::Result<Arc<ChunkDocumentIndex>, String>>>,
    ready: Condvar,
}

impl PendingLoad {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    fn complete(&self, result: std::result::Result<Arc<ChunkDocumentIndex>, String>) {
        *self.state.lock() = Some(result);
        self.ready.notify_all();
    }

    fn wait(&self) -> Result<Arc<ChunkDocumentIndex>> {
        let mut state = self.state.lock();
        loop {
            if let Some(result) = state.as_ref() {
                return result.clone().map_err(IndexError::ChunkLoad);
            }
            self.ready.wait(&mut state);
        }
    }
}

/// Chunk index manager statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkManagerStats {
    pub hits: u64,
    pub misses: u64,
    /// Indices reconstructed from store entries
    pub rebuilds: u64,
    /// Indices read from sealed files
    pub file_loads: u64,
    /// Unusable or stale files deleted
    pub corrupt_files: u64,
    pub cached: usize,
    pub pinned_heads: usize,
}

impl std::fmt::Display for ChunkManagerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Chunk indices: {} cached, {} heads, {} hits, {} misses ({} rebuilt, {} from files, {} corrupt)",
            self.cached, self.pinned_heads, self.hits, self.misses, self.rebuilds, self.file_loads, self.corrupt_files
        )
    }
}

pub struct ChunkIndexManager {
    store: Arc<dyn TemporalStore>,
    source: Arc<dyn ChunkSource>,
    codec: Arc<dyn ValueCodec>,
    registry: Arc<IndexerRegistry>,
    files: Option<ChunkFileStore>,

    cache: Mutex<LruCache<ChunkId, Arc<ChunkDocumentIndex>>>,
    heads: Mutex<HashMap<ChunkId, Arc<ChunkDocumentIndex>>>,
    loading: Mutex<HashMap<ChunkId, Arc<PendingLoad>>>,
    load_process_lock: RwLock<()>,

    hits: AtomicU64,
    misses: AtomicU64,
    rebuilds: AtomicU64,
    file_loads: AtomicU64,
    corrupt_files: AtomicU64,
}

impl ChunkIndexManager {
    pub fn new(
        store: Arc<dyn TemporalStore>,
        source: Arc<dyn ChunkSource>,
        codec: Arc<dyn ValueCodec>,
        registry: Arc<IndexerRegistry>,
        capacity: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CHUNK_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            source,
            codec,
            registry,
            files: None,
            cache: Mutex::new(LruCache::new(capacity)),
            heads: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashMap::new()),
            load_process_lock: RwLock::new(()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            file_loads: AtomicU64::new(0),
            corrupt_files: AtomicU64::new(0),
        }
    }

    /// Persist closed chunk indices below `dir`
    pub fn with_index_dir<P: AsRef<Path>>(mut self, dir: P) -> Result<Self> {
        self.files = Some(ChunkFileStore::open(dir)?);
        Ok(self)
    }

    pub fn source(&self) -> &Arc<dyn ChunkSource> {
        &self.source
    }

    pub fn files(&self) -> Option<&ChunkFileStore> {
        self.files.as_ref()
    }

    /// Document index of `chunk`, loaded or rebuilt on a miss.
    ///
    /// A pinned head index whose chunk the store has closed since is promoted
    /// through the same single-flight path as a load.
    pub fn get_index_for_chunk(&self, chunk: &Chunk) -> Result<Arc<ChunkDocumentIndex>> {
        if let Some(index) = self.cached(chunk) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(index);
        }

        let pending = {
            let mut loading = self.loading.lock();
            if let Some(index) = self.cached(chunk) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(index);
            }
            if let Some(pending) = loading.get(&chunk.id) {
                let pending = Arc::clone(pending);
                drop(loading);
                trace!(chunk = %chunk.id, "Waiting for in-flight chunk index load");
                return pending.wait();
            }
            let pending = Arc::new(PendingLoad::new());
            loading.insert(chunk.id.clone(), Arc::clone(&pending));
            pending
        };

        let result = {
            let _guard = self.load_process_lock.read();
            let stale_head = self.heads.lock().get(&chunk.id).cloned();
            match stale_head {
                Some(head) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    Ok(self.promote(&head, chunk))
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    let result = self.load(chunk).map(Arc::new);
                    if let Ok(index) = &result {
                        self.insert(Arc::clone(index));
                    }
                    result
                }
            }
        };

        self.loading.lock().remove(&chunk.id);
        pending.complete(match &result {
            Ok(index) => Ok(Arc::clone(index)),
            Err(e) => Err(e.to_string()),
        });
        result
    }

    /// Load several chunks in parallel; returns how many were loaded
    pub fn warm_up(&self, chunks: &[Chunk]) -> Result<usize> {
        chunks
            .par_iter()
            .map(|chunk| self.get_index_for_chunk(chunk).map(|_| ()))
            .collect::<Result<Vec<()>>>()
            .map(|loaded| loaded.len())
    }

    pub fn is_cached(&self, chunk: &ChunkId) -> bool {
        self.lookup(chunk).is_some()
    }

    pub fn stats(&self) -> ChunkManagerStats {
        ChunkManagerStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
            file_loads: self.file_loads.load(Ordering::Relaxed),
            corrupt_files: self.corrupt_files.load(Ordering::Relaxed),
            cached: self.cache.lock().len(),
            pinned_heads: self.heads.lock().len(),
        }
    }

    /// Evict one chunk index and delete its file
    pub fn delete_index_for_chunk(&self, chunk: &ChunkId) -> Result<()> {
        let _guard = self.load_process_lock.write();
        self.cache.lock().pop(chunk);
        self.heads.lock().remove(chunk);
        if let Some(files) = &self.files {
            files.delete(chunk)?;
        }
        Ok(())
    }

    /// Evict every chunk index and delete every file
    pub fn delete_all_chunk_indices(&self) -> Result<()> {
        let _guard = self.load_process_lock.write();
        self.cache.lock().clear();
        self.heads.lock().clear();
        if let Some(files) = &self.files {
            let removed = files.delete_all()?;
            debug!(removed, "Deleted all chunk index files");
        }
        Ok(())
    }

    /// Drop the documents of one index from every cached chunk index.
    ///
    /// Persisted files hold all indices at once, so persistent indices are
    /// evicted and their files deleted instead.
    pub fn delete_index_contents(&self, index_name: &str) -> Result<()> {
        let _guard = self.load_process_lock.write();

        let persistent: Vec<ChunkId> = {
            let mut cache = self.cache.lock();
            let persistent: Vec<ChunkId> = cache
                .iter()
                .filter(|(_, index)| index.is_persistent())
                .map(|(id, _)| id.clone())
                .collect();
            for (_, index) in cache.iter().filter(|(_, index)| !index.is_persistent()) {
                index.delete_index(index_name);
            }
            for id in &persistent {
                cache.pop(id);
            }
            persistent
        };
        for index in self.heads.lock().values() {
            index.delete_index(index_name);
        }

        if let Some(files) = &self.files {
            for id in &persistent {
                files.delete(id)?;
            }
        }
        debug!(index = index_name, evicted = persistent.len(), "Deleted index contents from chunk indices");
        Ok(())
    }

    /// Remove an index whose registration is gone from every chunk index
    pub fn delete_index_and_indexers(&self, index_name: &str) -> Result<()> {
        // Uncached files embed the old indexer set and are detected as stale on load
        self.delete_index_contents(index_name)
    }

    /// Roll back cached head indices of `branches` whose period contains `timestamp`
    pub fn rollback_chunk_indices(
        &self,
        branches: &[String],
        timestamp: Timestamp,
        keys: Option<&BTreeSet<QualifiedKey>>,
    ) -> Result<RollbackOutcome> {
        let _guard = self.load_process_lock.write();
        let targeted = |chunk: &Chunk| branches.iter().any(|b| b == chunk.branch());

        let mut outcome = RollbackOutcome::default();
        for index in self.heads.lock().values() {
            let chunk = index.chunk();
            if !targeted(chunk) {
                continue;
            }
            if index.is_persistent() || !chunk.period.contains(timestamp) {
                warn!(chunk = %chunk.id, timestamp, "Skipping rollback of chunk index");
                continue;
            }
            outcome.merge(index.rollback(timestamp, keys));
        }
        for (id, index) in self.cache.lock().iter() {
            if targeted(index.chunk()) && index.chunk().period.contains(timestamp) {
                warn!(chunk = %id, timestamp, "Closed chunk index cannot be rolled back");
            }
        }
        Ok(outcome)
    }

    /// Cached index; `None` on a miss and for a pinned head the store has closed since
    fn cached(&self, chunk: &Chunk) -> Option<Arc<ChunkDocumentIndex>> {
        if let Some(head) = self.heads.lock().get(&chunk.id) {
            if head.chunk().is_head() && !chunk.is_head() {
                return None;
            }
            return Some(Arc::clone(head));
        }
        self.cache.lock().get(&chunk.id).cloned()
    }

    fn lookup(&self, chunk: &ChunkId) -> Option<Arc<ChunkDocumentIndex>> {
        if let Some(index) = self.heads.lock().get(chunk) {
            return Some(Arc::clone(index));
        }
        self.cache.lock().get(chunk).cloned()
    }

    /// Move a closed head into the LRU; the caller owns the chunk's in-flight slot
    fn promote(&self, head: &Arc<ChunkDocumentIndex>, chunk: &Chunk) -> Arc<ChunkDocumentIndex> {
        let closed = Arc::new(head.reassign(chunk.clone()));
        if let Some(files) = &self.files {
            match files.write(&chunk.id, &closed.to_payload()) {
                Ok(()) => closed.mark_persistent(),
                Err(e) => warn!(chunk = %chunk.id, error = %e, "Failed to persist closed head chunk index"),
            }
        }
        self.heads.lock().remove(&chunk.id);
        self.cache.lock().put(chunk.id.clone(), Arc::clone(&closed));
        debug!(chunk = %chunk.id, persistent = closed.is_persistent(), "Promoted closed head chunk index");
        closed
    }

    fn insert(&self, index: Arc<ChunkDocumentIndex>) {
        let id = index.chunk().id.clone();
        if index.chunk().is_head() {
            self.heads.lock().insert(id, index);
        } else if let Some((evicted, _)) = self.cache.lock().push(id.clone(), index) {
            if evicted != id {
                trace!(chunk = %evicted, "Evicted chunk index");
            }
        }
    }

    fn load(&self, chunk: &Chunk) -> Result<ChunkDocumentIndex> {
        let indexers = self.registry.snapshot();

        if !chunk.is_head() {
            if let Some(index) = self.load_file(chunk, &indexers)? {
                self.file_loads.fetch_add(1, Ordering::Relaxed);
                return Ok(index);
            }
        }

        let builder = ChunkIndexBuilder::new(self.store.as_ref(), self.source.as_ref(), self.codec.as_ref(), &indexers);
        let (table, stats) = builder.build(chunk)?;
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
        let index = ChunkDocumentIndex::new(chunk.clone(), indexers, table);

        if !chunk.is_head() {
            if let Some(files) = &self.files {
                match files.write(&chunk.id, &index.to_payload()) {
                    Ok(()) => index.mark_persistent(),
                    Err(e) => warn!(chunk = %chunk.id, error = %e, "Failed to persist chunk index"),
                }
            }
        }
        debug!(
            chunk = %chunk.id,
            entries = stats.entries,
            baseline_keys = stats.baseline_keys,
            documents = stats.documents,
            persistent = index.is_persistent(),
            "Rebuilt chunk index"
        );
        Ok(index)
    }

    /// Sealed file contents, or `None` when missing, unusable or stale (deleted)
    fn load_file(
        &self,
        chunk: &Chunk,
        indexers: &IndexerMap,
    ) -> Result<Option<ChunkDocumentIndex>> {
        let Some(files) = &self.files else {
            return Ok(None);
        };

        let problem = match files.read(&chunk.id) {
            Ok(None) => return Ok(None),
            Ok(Some(payload)) if payload.branch != chunk.branch() => {
                format!("belongs to branch '{}'", payload.branch)
            }
            Ok(Some(payload)) if &payload.indexers != indexers => {
                debug!(chunk = %chunk.id, "Chunk index file built with other indexers, rebuilding");
                files.delete(&chunk.id)?;
                return Ok(None);
            }
            Ok(Some(payload)) => match ChunkDocumentIndex::from_payload(chunk.clone(), payload) {
                Ok(index) => return Ok(Some(index)),
                Err(e) => e.to_string(),
            },
            Err(e) => e.to_string(),
        };

        warn!(chunk = %chunk.id, problem = %problem, "Unusable chunk index file, rebuilding");
        self.corrupt_files.fetch_add(1, Ordering::Relaxed);
        files.delete(&chunk.id)?;
        Ok(None)
    }
}
