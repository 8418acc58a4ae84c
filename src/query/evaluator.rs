//! Query evaluation
//!
//! Every leaf is resolved through the query cache into the set of matching
//! keys of one keyspace; `And`/`Or` combine those sets. Negated conditions
//! also match keys without any value for the index, so they are resolved as
//! "live keys minus the keys matching the positive condition".

use super::ast::QueryNode;
use super::cache::{QueryCache, SearchResult};
use super::spec::SearchSpecification;
use crate::backend::DocumentBackend;
use crate::index::IndexerRegistry;
use crate::store::TemporalStore;
use crate::types::{QualifiedKey, TemporalKey, Timestamp};
use crate::{IndexError, Result};
use std::collections::BTreeSet;
use tracing::trace;

pub struct QueryEvaluator<'a> {
    backend: &'a dyn DocumentBackend,
    store: &'a dyn TemporalStore,
    registry: &'a IndexerRegistry,
    cache: &'a QueryCache,
}

impl<'a> QueryEvaluator<'a> {
    pub fn new(
        backend: &'a dyn DocumentBackend,
        store: &'a dyn TemporalStore,
        registry: &'a IndexerRegistry,
        cache: &'a QueryCache,
    ) -> Self {
        Self {
            backend,
            store,
            registry,
            cache,
        }
    }

    /// Keys of `keyspace` matching `query` on `branch` at `timestamp`
    pub fn evaluate(
        &self,
        timestamp: Timestamp,
        branch: &str,
        keyspace: &str,
        query: &QueryNode,
    ) -> Result<BTreeSet<QualifiedKey>> {
        // Fail on any bad leaf before short-circuiting skips it
        for spec in query.specifications() {
            self.check(spec)?;
        }
        self.eval_node(timestamp, branch, keyspace, query)
    }

    /// Identifiers matched by one specification, through the cache
    pub fn atomic(&self, timestamp: Timestamp, branch: &str, spec: &SearchSpecification) -> Result<SearchResult> {
        self.check(spec)?;
        self.search(timestamp, branch, spec)
    }

    fn eval_node(
        &self,
        timestamp: Timestamp,
        branch: &str,
        keyspace: &str,
        node: &QueryNode,
    ) -> Result<BTreeSet<QualifiedKey>> {
        match node {
            QueryNode::And(left, right) => {
                let left = self.eval_node(timestamp, branch, keyspace, left)?;
                if left.is_empty() {
                    return Ok(left);
                }
                let right = self.eval_node(timestamp, branch, keyspace, right)?;
                Ok(left.intersection(&right).cloned().collect())
            }
            QueryNode::Or(left, right) => {
                let mut keys = self.eval_node(timestamp, branch, keyspace, left)?;
                keys.extend(self.eval_node(timestamp, branch, keyspace, right)?);
                Ok(keys)
            }
            QueryNode::Where(spec) => self.eval_leaf(timestamp, branch, keyspace, spec),
        }
    }

    fn eval_leaf(
        &self,
        timestamp: Timestamp,
        branch: &str,
        keyspace: &str,
        spec: &SearchSpecification,
    ) -> Result<BTreeSet<QualifiedKey>> {
        if !spec.accepts_empty() {
            let matches = self.search(timestamp, branch, spec)?;
            return Ok(project(&matches, keyspace));
        }

        let negated = self.search(timestamp, branch, &spec.negated())?;
        let excluded = project(&negated, keyspace);
        let keys = self
            .store
            .keys(branch, keyspace, timestamp)?
            .into_iter()
            .map(|key| QualifiedKey::new(keyspace, key))
            .filter(|key| !excluded.contains(key))
            .collect();
        Ok(keys)
    }

    fn search(&self, timestamp: Timestamp, branch: &str, spec: &SearchSpecification) -> Result<SearchResult> {
        self.cache.get_or_search(timestamp, branch, spec, || {
            let documents = self.backend.query(timestamp, branch, spec)?;
            trace!(spec = %spec, branch, timestamp, documents = documents.len(), "Atomic search");
            Ok(documents
                .iter()
                .map(|d| TemporalKey::new(branch, d.keyspace(), d.key(), timestamp))
                .collect())
        })
    }

    fn check(&self, spec: &SearchSpecification) -> Result<()> {
        let family = self
            .registry
            .family(&spec.index_name)
            .ok_or_else(|| IndexError::UnknownIndex(spec.index_name.clone()))?;
        if family != spec.condition.family() {
            return Err(IndexError::InvalidArgument(format!(
                "Condition of family {:?} cannot be applied to {:?} index '{}'",
                spec.condition.family(),
                family,
                spec.index_name
            )));
        }
        Ok(())
    }
}

fn project(matches: &BTreeSet<TemporalKey>, keyspace: &str) -> BTreeSet<QualifiedKey> {
    matches
        .iter()
        .filter(|id| id.keyspace == keyspace)
        .map(TemporalKey::qualified_key)
        .collect()
}
