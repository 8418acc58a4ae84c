//! In-memory temporal store
//!
//! Keeps every version of every key per branch, with chunk boundaries created
//! by explicit rollovers. Writes are two-phase: [`MemoryStore::stage`] records
//! the entries (invisible to readers) and returns the indexing workload,
//! [`MemoryStore::publish`] advances the branch's `now` and makes them visible.

use super::{BranchInfo, Chunk, ChunkSource, JsonCodec, StoredEntry, TemporalStore, ValueCodec};
use crate::types::{Object, Period, QualifiedKey, TemporalKey, Timestamp, ValueChange, MASTER_BRANCH};
use crate::{IndexError, Result};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// keyspace -> key -> timestamp -> serialized value (`None` = tombstone)
type BranchData = BTreeMap<String, BTreeMap<String, BTreeMap<Timestamp, Option<Vec<u8>>>>>;

struct BranchState {
    info: BranchInfo,
    data: BranchData,
    /// Lower bound of every chunk, ascending; the last one is the head chunk
    chunk_lowers: Vec<Timestamp>,
}

impl BranchState {
    fn new(info: BranchInfo) -> Self {
        let first_lower = info.branching_timestamp;
        Self {
            info,
            data: BTreeMap::new(),
            chunk_lowers: vec![first_lower],
        }
    }

    fn chunk(&self, sequence: usize) -> Option<Chunk> {
        let lower = *self.chunk_lowers.get(sequence)?;
        let period = match self.chunk_lowers.get(sequence + 1) {
            Some(&upper) => Period::new(lower, upper).ok()?,
            None => Period::open_ended(lower),
        };
        Some(Chunk::new(self.info.name.clone(), sequence as u64, period))
    }

    /// Latest local version at or before `timestamp` (`Some(None)` = tombstone)
    fn local_version(&self, keyspace: &str, key: &str, timestamp: Timestamp) -> Option<Option<Vec<u8>>> {
        let bound = timestamp.min(self.info.now);
        self.data
            .get(keyspace)?
            .get(key)?
            .range(..=bound)
            .next_back()
            .map(|(_, value)| value.clone())
    }
}

/// Multi-branch in-memory implementation of [`TemporalStore`] and [`ChunkSource`]
pub struct MemoryStore {
    branches: RwLock<BTreeMap<String, BranchState>>,
    /// Branch names in creation order (origins before children)
    creation_order: RwLock<Vec<String>>,
    codec: JsonCodec,
}

impl MemoryStore {
    /// Create a store with an empty master branch
    pub fn new() -> Self {
        let master = BranchInfo {
            name: MASTER_BRANCH.to_string(),
            origin: None,
            branching_timestamp: 0,
            now: 0,
        };
        let mut branches = BTreeMap::new();
        branches.insert(MASTER_BRANCH.to_string(), BranchState::new(master));

        Self {
            branches: RwLock::new(branches),
            creation_order: RwLock::new(vec![MASTER_BRANCH.to_string()]),
            codec: JsonCodec,
        }
    }

    /// Fork `name` from `origin` at `branching_timestamp`
    pub fn create_branch(&self, name: &str, origin: &str, branching_timestamp: Timestamp) -> Result<()> {
        let mut branches = self.branches.write();
        if branches.contains_key(name) {
            return Err(IndexError::InvalidArgument(format!("Branch '{}' already exists", name)));
        }
        let origin_state = branches
            .get(origin)
            .ok_or_else(|| IndexError::BranchNotFound(origin.to_string()))?;
        if branching_timestamp > origin_state.info.now {
            return Err(IndexError::InvalidArgument(format!(
                "Branching timestamp {} is after origin '{}' now ({})",
                branching_timestamp, origin, origin_state.info.now
            )));
        }

        let info = BranchInfo {
            name: name.to_string(),
            origin: Some(origin.to_string()),
            branching_timestamp,
            now: branching_timestamp,
        };
        branches.insert(name.to_string(), BranchState::new(info));
        self.creation_order.write().push(name.to_string());
        Ok(())
    }

    /// Record writes at `timestamp` without making them visible.
    ///
    /// Returns the indexing workload (old value as currently visible, new value).
    pub fn stage(
        &self,
        branch: &str,
        timestamp: Timestamp,
        writes: Vec<(String, String, Option<Object>)>,
    ) -> Result<Vec<(TemporalKey, ValueChange)>> {
        let now = self.require_branch(branch)?.now;
        if timestamp <= now {
            return Err(IndexError::InvalidArgument(format!(
                "Commit timestamp {} must be after branch '{}' now ({})",
                timestamp, branch, now
            )));
        }

        let mut workload = Vec::with_capacity(writes.len());
        let mut encoded = Vec::with_capacity(writes.len());
        for (keyspace, key, value) in writes {
            let old = match self.get(branch, &keyspace, &key, now)? {
                Some(bytes) => Some(self.codec.decode(&bytes)?),
                None => None,
            };
            let bytes = match &value {
                Some(object) => Some(self.codec.encode(object)?),
                None => None,
            };
            workload.push((
                TemporalKey::new(branch, keyspace.clone(), key.clone(), timestamp),
                ValueChange::new(old, value),
            ));
            encoded.push((keyspace, key, bytes));
        }

        let mut branches = self.branches.write();
        let state = branches
            .get_mut(branch)
            .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
        for (keyspace, key, bytes) in encoded {
            state
                .data
                .entry(keyspace)
                .or_default()
                .entry(key)
                .or_default()
                .insert(timestamp, bytes);
        }
        Ok(workload)
    }

    /// Make every staged write up to `timestamp` visible
    pub fn publish(&self, branch: &str, timestamp: Timestamp) -> Result<()> {
        let mut branches = self.branches.write();
        let state = branches
            .get_mut(branch)
            .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
        if timestamp < state.info.now {
            return Err(IndexError::InvalidArgument(format!(
                "Cannot move branch '{}' now backwards ({} < {})",
                branch, timestamp, state.info.now
            )));
        }
        state.info.now = timestamp;
        Ok(())
    }

    /// Close the head chunk of `branch` at `timestamp` and open a new head chunk
    pub fn rollover(&self, branch: &str, timestamp: Timestamp) -> Result<()> {
        let mut branches = self.branches.write();
        let state = branches
            .get_mut(branch)
            .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
        let head_lower = state.chunk_lowers.last().copied().unwrap_or(0);
        if timestamp <= head_lower {
            return Err(IndexError::InvalidPeriod { from: head_lower, to: timestamp });
        }
        state.chunk_lowers.push(timestamp);
        Ok(())
    }

    /// Drop staged (unpublished) writes at or after `timestamp`.
    ///
    /// Returns the keys that had a discarded write.
    pub fn discard(&self, branch: &str, timestamp: Timestamp) -> Result<BTreeSet<QualifiedKey>> {
        let mut branches = self.branches.write();
        let state = branches
            .get_mut(branch)
            .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
        let bound = timestamp.max(state.info.now.saturating_add(1));

        let mut discarded = BTreeSet::new();
        for (keyspace, keys) in state.data.iter_mut() {
            for (key, versions) in keys.iter_mut() {
                if !versions.split_off(&bound).is_empty() {
                    discarded.insert(QualifiedKey::new(keyspace.clone(), key.clone()));
                }
            }
            keys.retain(|_, versions| !versions.is_empty());
        }
        Ok(discarded)
    }

    fn local_keyspaces(&self, branch: &str, period: Period) -> Result<BTreeSet<String>> {
        let branches = self.branches.read();
        let state = branches
            .get(branch)
            .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
        let now = state.info.now;
        Ok(state
            .data
            .iter()
            .filter(|(_, keys)| {
                keys.values().any(|versions| {
                    versions
                        .keys()
                        .any(|ts| period.contains(*ts) && *ts <= now)
                })
            })
            .map(|(keyspace, _)| keyspace.clone())
            .collect())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TemporalStore for MemoryStore {
    fn branch(&self, name: &str) -> Result<Option<BranchInfo>> {
        Ok(self.branches.read().get(name).map(|state| state.info.clone()))
    }

    fn branches(&self) -> Result<Vec<BranchInfo>> {
        let branches = self.branches.read();
        Ok(self
            .creation_order
            .read()
            .iter()
            .filter_map(|name| branches.get(name).map(|state| state.info.clone()))
            .collect())
    }

    fn keyspaces(&self, branch: &str, timestamp: Timestamp) -> Result<BTreeSet<String>> {
        let info = self.require_branch(branch)?;
        let mut keyspaces = self.local_keyspaces(branch, Period::new(0, timestamp.saturating_add(1))?)?;
        if let Some(origin) = &info.origin {
            keyspaces.extend(TemporalStore::keyspaces(
                self,
                origin,
                timestamp.min(info.branching_timestamp),
            )?);
        }
        Ok(keyspaces)
    }

    fn entries(&self, branch: &str, keyspace: &str, period: Period) -> Result<Vec<StoredEntry>> {
        let branches = self.branches.read();
        let state = branches
            .get(branch)
            .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
        let now = state.info.now;

        let mut entries = Vec::new();
        if let Some(keys) = state.data.get(keyspace) {
            for (key, versions) in keys {
                for (&timestamp, value) in versions {
                    if period.contains(timestamp) && timestamp <= now {
                        entries.push(StoredEntry {
                            key: key.clone(),
                            timestamp,
                            value: value.clone(),
                        });
                    }
                }
            }
        }
        Ok(entries)
    }

    fn get(&self, branch: &str, keyspace: &str, key: &str, timestamp: Timestamp) -> Result<Option<Vec<u8>>> {
        let (local, info) = {
            let branches = self.branches.read();
            let state = branches
                .get(branch)
                .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
            (state.local_version(keyspace, key, timestamp), state.info.clone())
        };

        match local {
            Some(value) => Ok(value),
            None => match &info.origin {
                Some(origin) => self.get(origin, keyspace, key, timestamp.min(info.branching_timestamp)),
                None => Ok(None),
            },
        }
    }

    fn keys(&self, branch: &str, keyspace: &str, timestamp: Timestamp) -> Result<BTreeSet<String>> {
        let info = self.require_branch(branch)?;
        let mut candidates: BTreeSet<String> = {
            let branches = self.branches.read();
            branches
                .get(branch)
                .and_then(|state| state.data.get(keyspace))
                .map(|keys| keys.keys().cloned().collect())
                .unwrap_or_default()
        };
        if let Some(origin) = &info.origin {
            candidates.extend(self.keys(origin, keyspace, timestamp.min(info.branching_timestamp))?);
        }

        let mut live = BTreeSet::new();
        for key in candidates {
            if self.get(branch, keyspace, &key, timestamp)?.is_some() {
                live.insert(key);
            }
        }
        Ok(live)
    }
}

impl ChunkSource for MemoryStore {
    fn chunks(&self, branch: &str) -> Result<Vec<Chunk>> {
        let branches = self.branches.read();
        let state = branches
            .get(branch)
            .ok_or_else(|| IndexError::BranchNotFound(branch.to_string()))?;
        Ok((0..state.chunk_lowers.len())
            .filter_map(|sequence| state.chunk(sequence))
            .collect())
    }

    fn entries(&self, chunk: &Chunk, keyspace: &str) -> Result<Vec<StoredEntry>> {
        let lower = chunk.period.lower();
        if chunk.id.sequence == 0 {
            return TemporalStore::entries(self, chunk.branch(), keyspace, chunk.period);
        }

        // Regular chunk after a rollover: snapshot at the lower bound, then the
        // changes strictly after it.
        let mut by_key: BTreeMap<String, Vec<StoredEntry>> = BTreeMap::new();
        for key in self.keys(chunk.branch(), keyspace, lower)? {
            let value = self.get(chunk.branch(), keyspace, &key, lower)?;
            by_key.entry(key.clone()).or_default().push(StoredEntry {
                key,
                timestamp: lower,
                value,
            });
        }
        for entry in TemporalStore::entries(self, chunk.branch(), keyspace, chunk.period)? {
            if entry.timestamp > lower {
                by_key.entry(entry.key.clone()).or_default().push(entry);
            }
        }
        Ok(by_key.into_values().flatten().collect())
    }

    fn keyspaces(&self, chunk: &Chunk) -> Result<BTreeSet<String>> {
        let mut keyspaces = self.local_keyspaces(chunk.branch(), chunk.period)?;
        if chunk.id.sequence > 0 {
            keyspaces.extend(TemporalStore::keyspaces(self, chunk.branch(), chunk.period.lower())?);
        }
        Ok(keyspaces)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn write(keyspace: &str, key: &str, value: Option<Object>) -> (String, String, Option<Object>) {
        (keyspace.to_string(), key.to_string(), value)
    }

    #[test]
    fn test_stage_is_invisible_until_publish() {
        let store = MemoryStore::new();
        let workload = store
            .stage(MASTER_BRANCH, 100, vec![write("people", "k1", Some(json!({"name": "Hello"})))])
            .unwrap();
        assert_eq!(workload.len(), 1);
        assert_eq!(workload[0].1.old, None);

        assert!(store.get(MASTER_BRANCH, "people", "k1", 100).unwrap().is_none());
        store.publish(MASTER_BRANCH, 100).unwrap();
        assert!(store.get(MASTER_BRANCH, "people", "k1", 100).unwrap().is_some());
        assert!(store.get(MASTER_BRANCH, "people", "k1", 99).unwrap().is_none());
    }

    #[test]
    fn test_branch_fallback() {
        let store = MemoryStore::new();
        store
            .stage(MASTER_BRANCH, 100, vec![write("people", "k1", Some(json!({"name": "A"})))])
            .unwrap();
        store.publish(MASTER_BRANCH, 100).unwrap();
        store.create_branch("feature", MASTER_BRANCH, 100).unwrap();

        // Master changes after the fork are not visible on the branch
        store
            .stage(MASTER_BRANCH, 200, vec![write("people", "k2", Some(json!({"name": "B"})))])
            .unwrap();
        store.publish(MASTER_BRANCH, 200).unwrap();

        let keys = store.keys("feature", "people", 300).unwrap();
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec!["k1".to_string()]);

        let workload = store
            .stage("feature", 300, vec![write("people", "k1", None)])
            .unwrap();
        assert_eq!(workload[0].1.old, Some(json!({"name": "A"})));
        store.publish("feature", 300).unwrap();
        assert!(store.keys("feature", "people", 300).unwrap().is_empty());
        assert_eq!(store.keys("feature", "people", 250).unwrap().len(), 1);
    }

    #[test]
    fn test_rollover_snapshot() {
        let store = MemoryStore::new();
        store
            .stage(
                MASTER_BRANCH,
                100,
                vec![
                    write("people", "k1", Some(json!({"name": "A"}))),
                    write("people", "k2", Some(json!({"name": "B"}))),
                ],
            )
            .unwrap();
        store.publish(MASTER_BRANCH, 100).unwrap();
        store.stage(MASTER_BRANCH, 150, vec![write("people", "k2", None)]).unwrap();
        store.publish(MASTER_BRANCH, 150).unwrap();
        store.rollover(MASTER_BRANCH, 200).unwrap();
        store
            .stage(MASTER_BRANCH, 250, vec![write("people", "k1", Some(json!({"name": "C"})))])
            .unwrap();
        store.publish(MASTER_BRANCH, 250).unwrap();

        let chunks = store.chunks(MASTER_BRANCH).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].period, Period::new(0, 200).unwrap());
        assert!(chunks[1].is_head());

        let head_entries = ChunkSource::entries(&store, &chunks[1], "people").unwrap();
        let stamps: Vec<_> = head_entries.iter().map(|e| (e.key.as_str(), e.timestamp)).collect();
        assert_eq!(stamps, vec![("k1", 200), ("k1", 250)]);

        let first_entries = ChunkSource::entries(&store, &chunks[0], "people").unwrap();
        assert_eq!(first_entries.len(), 3);
        assert!(store.rollover(MASTER_BRANCH, 150).is_err());
    }

    #[test]
    fn test_discard_only_drops_staged_writes() {
        let store = MemoryStore::new();
        store
            .stage(MASTER_BRANCH, 100, vec![write("people", "k1", Some(json!({"name": "A"})))])
            .unwrap();
        store.publish(MASTER_BRANCH, 100).unwrap();
        store
            .stage(
                MASTER_BRANCH,
                200,
                vec![
                    write("people", "k1", Some(json!({"name": "B"}))),
                    write("people", "k2", Some(json!({"name": "C"}))),
                ],
            )
            .unwrap();

        // Published versions are never discarded, even with an earlier bound
        let discarded = store.discard(MASTER_BRANCH, 50).unwrap();
        assert_eq!(discarded.len(), 2);
        assert!(discarded.contains(&QualifiedKey::new("people", "k2")));

        store.publish(MASTER_BRANCH, 200).unwrap();
        let value = store.get(MASTER_BRANCH, "people", "k1", 200).unwrap().unwrap();
        assert_eq!(JsonCodec.decode(&value).unwrap(), json!({"name": "A"}));
        assert_eq!(store.keys(MASTER_BRANCH, "people", 200).unwrap().len(), 1);
    }
}
