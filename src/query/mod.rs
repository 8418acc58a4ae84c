//! Query layer: search specifications, boolean trees, evaluation and caching

mod ast;
mod cache;
mod evaluator;
mod spec;

pub use ast::QueryNode;
pub use cache::{CacheStats, QueryCache, SearchResult};
pub use evaluator::QueryEvaluator;
pub use spec::{Condition, NumberCondition, SearchSpecification, TextCondition, TextMatchMode, ValueMatcher};
