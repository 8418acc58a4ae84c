//! Reconstruction of chunk document indices from store entries
//!
//! Delta chunks start from the origin branch's live keys at the branching
//! timestamp; regular chunks carry their own snapshot. In both cases the
//! chunk's entries are replayed per keyspace in `(key, timestamp)` order and
//! reconciled against the key's open documents.

use crate::index::{resolve_optional, DocumentTable, IndexDocument, IndexerMap};
use crate::store::{BranchInfo, Chunk, ChunkSource, StoredEntry, TemporalStore, ValueCodec};
use crate::types::{IndexValue, Object, Timestamp};
use crate::Result;
use std::collections::{BTreeMap, BTreeSet};

/// Build statistics
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BuildStats {
    /// Origin keys indexed as baseline (delta chunks only)
    pub baseline_keys: usize,
    pub entries: usize,
    pub documents: usize,
}

/// Open documents of one key, by (index, value)
type OpenSet = BTreeMap<(String, IndexValue), IndexDocument>;

pub struct ChunkIndexBuilder<'a> {
    store: &'a dyn TemporalStore,
    source: &'a dyn ChunkSource,
    codec: &'a dyn ValueCodec,
    indexers: &'a IndexerMap,
}

impl<'a> ChunkIndexBuilder<'a> {
    pub fn new(
        store: &'a dyn TemporalStore,
        source: &'a dyn ChunkSource,
        codec: &'a dyn ValueCodec,
        indexers: &'a IndexerMap,
    ) -> Self {
        Self {
            store,
            source,
            codec,
            indexers,
        }
    }

    /// A delta chunk is the first chunk of a branch that has an origin
    pub fn is_delta(chunk: &Chunk, branch: &BranchInfo) -> bool {
        chunk.id.sequence == 0 && branch.origin.is_some()
    }

    pub fn build(&self, chunk: &Chunk) -> Result<(DocumentTable, BuildStats)> {
        let branch = self.store.require_branch(chunk.branch())?;
        let baseline_from = if Self::is_delta(chunk, &branch) {
            branch
                .origin
                .as_deref()
                .map(|origin| (origin.to_string(), branch.branching_timestamp))
        } else {
            None
        };

        let mut keyspaces = self.source.keyspaces(chunk)?;
        if let Some((origin, at)) = &baseline_from {
            keyspaces.extend(self.store.keyspaces(origin, *at)?);
        }

        let mut table = DocumentTable::new(chunk.branch());
        let mut stats = BuildStats::default();
        for keyspace in &keyspaces {
            let mut open: BTreeMap<String, OpenSet> = BTreeMap::new();
            if let Some((origin, at)) = &baseline_from {
                stats.baseline_keys += self.baseline(chunk, origin, *at, keyspace, &mut open)?;
            }

            let entries = self.source.entries(chunk, keyspace)?;
            stats.entries += entries.len();
            for entry in entries {
                let key_open = open.entry(entry.key.clone()).or_default();
                self.reconcile(chunk, keyspace, &entry, key_open, &mut table)?;
            }

            for document in open.into_values().flat_map(BTreeMap::into_values) {
                table.insert(document);
            }
        }
        stats.documents = table.len();
        Ok((table, stats))
    }

    /// Open one document per (index, value) of every live origin key
    fn baseline(
        &self,
        chunk: &Chunk,
        origin: &str,
        at: Timestamp,
        keyspace: &str,
        open: &mut BTreeMap<String, OpenSet>,
    ) -> Result<usize> {
        let keys = self.store.keys(origin, keyspace, at)?;
        for key in &keys {
            let Some(bytes) = self.store.get(origin, keyspace, key, at)? else {
                continue;
            };
            let object = self.codec.decode(&bytes)?;
            let key_open = open.entry(key.clone()).or_default();
            for (index_name, values) in self.values_of(Some(&object))? {
                for value in values {
                    let document = IndexDocument::new(
                        index_name.as_str(),
                        chunk.branch(),
                        keyspace,
                        key.as_str(),
                        value.clone(),
                        at,
                    );
                    key_open.insert((index_name.clone(), value), document);
                }
            }
        }
        Ok(keys.len())
    }

    fn reconcile(
        &self,
        chunk: &Chunk,
        keyspace: &str,
        entry: &StoredEntry,
        open: &mut OpenSet,
        table: &mut DocumentTable,
    ) -> Result<()> {
        let object = match &entry.value {
            Some(bytes) => Some(self.codec.decode(bytes)?),
            None => None,
        };
        let wanted: BTreeSet<(String, IndexValue)> = self
            .values_of(object.as_ref())?
            .into_iter()
            .flat_map(|(index_name, values)| values.into_iter().map(move |v| (index_name.clone(), v)))
            .collect();

        let stale: Vec<(String, IndexValue)> = open.keys().filter(|k| !wanted.contains(*k)).cloned().collect();
        for slot in stale {
            if let Some(mut document) = open.remove(&slot) {
                if document.valid_from() < entry.timestamp {
                    document.set_valid_to(entry.timestamp)?;
                    table.insert(document);
                }
            }
        }

        for (index_name, value) in wanted {
            if open.contains_key(&(index_name.clone(), value.clone())) {
                continue;
            }
            let document = IndexDocument::new(
                index_name.as_str(),
                chunk.branch(),
                keyspace,
                entry.key.as_str(),
                value.clone(),
                entry.timestamp,
            );
            open.insert((index_name, value), document);
        }
        Ok(())
    }

    /// Values per index for an object (indices that cannot index it are left out)
    fn values_of(&self, object: Option<&Object>) -> Result<Vec<(String, BTreeSet<IndexValue>)>> {
        let mut values = Vec::new();
        for (index_name, indexers) in self.indexers {
            if let Some(found) = resolve_optional(index_name, indexers, object)? {
                values.push((index_name.clone(), found));
            }
        }
        Ok(values)
    }
}
