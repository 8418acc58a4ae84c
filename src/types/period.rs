//! Half-open validity periods

use super::{Timestamp, TIMESTAMP_INFINITY};
use crate::{IndexError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Validity period `[lower, upper)`; `upper == TIMESTAMP_INFINITY` means open-ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Period {
    lower: Timestamp,
    upper: Timestamp,
}

impl Period {
    /// Create a period, rejecting empty or inverted intervals
    pub fn new(lower: Timestamp, upper: Timestamp) -> Result<Self> {
        if lower >= upper {
            return Err(IndexError::InvalidPeriod { from: lower, to: upper });
        }
        Ok(Self { lower, upper })
    }

    /// `[lower, +∞)`
    pub fn open_ended(lower: Timestamp) -> Self {
        Self { lower, upper: TIMESTAMP_INFINITY }
    }

    /// `[0, +∞)`
    pub fn eternal() -> Self {
        Self::open_ended(0)
    }

    pub fn lower(&self) -> Timestamp {
        self.lower
    }

    pub fn upper(&self) -> Timestamp {
        self.upper
    }

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.lower <= timestamp && timestamp < self.upper
    }

    pub fn is_open_ended(&self) -> bool {
        self.upper == TIMESTAMP_INFINITY
    }

    /// Close an open-ended period at `upper`
    pub fn with_upper(&self, upper: Timestamp) -> Result<Self> {
        Self::new(self.lower, upper)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_open_ended() {
            write!(f, "[{}, +inf)", self.lower)
        } else {
            write!(f, "[{}, {})", self.lower, self.upper)
        }
    }
}
