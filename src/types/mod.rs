//! Core value types shared by the indexing layers

mod identifier;
mod period;
mod value;

pub use identifier::{QualifiedKey, TemporalKey, ValueChange};
pub use period::Period;
pub use value::{IndexFamily, IndexValue};

/// Commit timestamp (monotonically increasing per branch)
pub type Timestamp = u64;

/// Upper bound of an open-ended validity interval (`+∞`)
pub const TIMESTAMP_INFINITY: Timestamp = u64::MAX;

/// Name of the root branch, the only branch without an origin
pub const MASTER_BRANCH: &str = "master";

/// Object model of stored values (decoded through a [`crate::store::ValueCodec`])
pub type Object = serde_json::Value;
