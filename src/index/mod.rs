//! Index layer
//!
//! Index documents, indexers and their registry, the incremental indexing
//! process and the owning [`IndexManager`].

mod document;
mod indexer;
mod manager;
mod modifications;
mod process;
mod registry;
mod table;

pub use document::{DocumentId, DocumentRecord, IndexDocument};
pub use indexer::{resolve_optional, resolve_values, FieldExtractor, Indexer, IndexerMap};
pub use manager::{IndexManager, IndexManagerStats, DEFAULT_QUERY_CACHE_CAPACITY};
pub use modifications::{DocumentTermination, IndexModifications};
pub use process::{IndexingProcess, IndexingStats};
pub use registry::{IndexDefinition, IndexerRegistry};
pub use table::{DocumentTable, OpenDocuments, RollbackOutcome};
