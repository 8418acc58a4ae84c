//! Atomic search specifications
//!
//! A search specification is one WHERE clause: an index name plus a typed
//! condition. It is the unit memoized by the query cache, so it implements
//! `Eq` and `Hash` (doubles by bit pattern).

use crate::types::{IndexFamily, IndexValue};
use crate::{IndexError, Result};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextCondition {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    NotStartsWith,
    EndsWith,
    NotEndsWith,
    MatchesRegex,
    NotMatchesRegex,
}

impl TextCondition {
    pub fn is_negated(&self) -> bool {
        matches!(
            self,
            TextCondition::NotEquals
                | TextCondition::NotContains
                | TextCondition::NotStartsWith
                | TextCondition::NotEndsWith
                | TextCondition::NotMatchesRegex
        )
    }

    pub fn negate(&self) -> Self {
        match self {
            TextCondition::Equals => TextCondition::NotEquals,
            TextCondition::NotEquals => TextCondition::Equals,
            TextCondition::Contains => TextCondition::NotContains,
            TextCondition::NotContains => TextCondition::Contains,
            TextCondition::StartsWith => TextCondition::NotStartsWith,
            TextCondition::NotStartsWith => TextCondition::StartsWith,
            TextCondition::EndsWith => TextCondition::NotEndsWith,
            TextCondition::NotEndsWith => TextCondition::EndsWith,
            TextCondition::MatchesRegex => TextCondition::NotMatchesRegex,
            TextCondition::NotMatchesRegex => TextCondition::MatchesRegex,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NumberCondition {
    Equals,
    NotEquals,
    LessThan,
    LessEqual,
    GreaterThan,
    GreaterEqual,
}

impl NumberCondition {
    pub fn is_negated(&self) -> bool {
        matches!(self, NumberCondition::NotEquals)
    }

    pub fn negate(&self) -> Self {
        match self {
            NumberCondition::Equals => NumberCondition::NotEquals,
            NumberCondition::NotEquals => NumberCondition::Equals,
            NumberCondition::LessThan => NumberCondition::GreaterEqual,
            NumberCondition::LessEqual => NumberCondition::GreaterThan,
            NumberCondition::GreaterThan => NumberCondition::LessEqual,
            NumberCondition::GreaterEqual => NumberCondition::LessThan,
        }
    }

    fn compare<T: PartialOrd>(&self, value: T, reference: T) -> bool {
        match self {
            NumberCondition::Equals => value == reference,
            NumberCondition::NotEquals => value != reference,
            NumberCondition::LessThan => value < reference,
            NumberCondition::LessEqual => value <= reference,
            NumberCondition::GreaterThan => value > reference,
            NumberCondition::GreaterEqual => value >= reference,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TextMatchMode {
    #[default]
    Strict,
    CaseInsensitive,
}

#[derive(Debug, Clone)]
pub enum Condition {
    Text {
        condition: TextCondition,
        mode: TextMatchMode,
        value: String,
    },
    Long {
        condition: NumberCondition,
        value: i64,
    },
    Double {
        condition: NumberCondition,
        value: f64,
        /// Absolute tolerance for (not-)equality
        tolerance: f64,
    },
}

impl Condition {
    pub fn family(&self) -> IndexFamily {
        match self {
            Condition::Text { .. } => IndexFamily::Text,
            Condition::Long { .. } => IndexFamily::Long,
            Condition::Double { .. } => IndexFamily::Double,
        }
    }

    pub fn is_negated(&self) -> bool {
        match self {
            Condition::Text { condition, .. } => condition.is_negated(),
            Condition::Long { condition, .. } | Condition::Double { condition, .. } => condition.is_negated(),
        }
    }

    pub fn negate(&self) -> Self {
        match self {
            Condition::Text { condition, mode, value } => Condition::Text {
                condition: condition.negate(),
                mode: *mode,
                value: value.clone(),
            },
            Condition::Long { condition, value } => Condition::Long {
                condition: condition.negate(),
                value: *value,
            },
            Condition::Double { condition, value, tolerance } => Condition::Double {
                condition: condition.negate(),
                value: *value,
                tolerance: *tolerance,
            },
        }
    }
}

impl PartialEq for Condition {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Condition::Text { condition: c1, mode: m1, value: v1 },
                Condition::Text { condition: c2, mode: m2, value: v2 },
            ) => c1 == c2 && m1 == m2 && v1 == v2,
            (Condition::Long { condition: c1, value: v1 }, Condition::Long { condition: c2, value: v2 }) => {
                c1 == c2 && v1 == v2
            }
            (
                Condition::Double { condition: c1, value: v1, tolerance: t1 },
                Condition::Double { condition: c2, value: v2, tolerance: t2 },
            ) => c1 == c2 && v1.to_bits() == v2.to_bits() && t1.to_bits() == t2.to_bits(),
            _ => false,
        }
    }
}

impl Eq for Condition {}

impl Hash for Condition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Condition::Text { condition, mode, value } => {
                0u8.hash(state);
                condition.hash(state);
                mode.hash(state);
                value.hash(state);
            }
            Condition::Long { condition, value } => {
                1u8.hash(state);
                condition.hash(state);
                value.hash(state);
            }
            Condition::Double { condition, value, tolerance } => {
                2u8.hash(state);
                condition.hash(state);
                value.to_bits().hash(state);
                tolerance.to_bits().hash(state);
            }
        }
    }
}

/// One WHERE clause: index name + condition
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchSpecification {
    pub index_name: String,
    pub condition: Condition,
}

impl SearchSpecification {
    pub fn new(index_name: impl Into<String>, condition: Condition) -> Self {
        Self {
            index_name: index_name.into(),
            condition,
        }
    }

    /// Strict text condition
    pub fn text(index_name: impl Into<String>, condition: TextCondition, value: impl Into<String>) -> Self {
        Self::new(
            index_name,
            Condition::Text {
                condition,
                mode: TextMatchMode::Strict,
                value: value.into(),
            },
        )
    }

    pub fn long(index_name: impl Into<String>, condition: NumberCondition, value: i64) -> Self {
        Self::new(index_name, Condition::Long { condition, value })
    }

    pub fn double(index_name: impl Into<String>, condition: NumberCondition, value: f64, tolerance: f64) -> Self {
        Self::new(
            index_name,
            Condition::Double {
                condition,
                value,
                tolerance: tolerance.abs(),
            },
        )
    }

    /// Switch a text condition to case-insensitive matching
    pub fn case_insensitive(mut self) -> Self {
        if let Condition::Text { mode, .. } = &mut self.condition {
            *mode = TextMatchMode::CaseInsensitive;
        }
        self
    }

    /// Negated conditions also match keys without any value for the index
    pub fn accepts_empty(&self) -> bool {
        self.condition.is_negated()
    }

    pub fn negated(&self) -> Self {
        Self {
            index_name: self.index_name.clone(),
            condition: self.condition.negate(),
        }
    }

    /// Compile the condition into a reusable matcher
    pub fn matcher(&self) -> Result<ValueMatcher> {
        let regex = match &self.condition {
            Condition::Text {
                condition: TextCondition::MatchesRegex | TextCondition::NotMatchesRegex,
                mode,
                value,
            } => Some(
                RegexBuilder::new(value)
                    .case_insensitive(*mode == TextMatchMode::CaseInsensitive)
                    .build()
                    .map_err(|e| IndexError::InvalidArgument(format!("Invalid regex '{}': {}", value, e)))?,
            ),
            _ => None,
        };
        Ok(ValueMatcher {
            condition: self.condition.clone(),
            regex,
        })
    }
}

impl fmt::Display for SearchSpecification {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.condition {
            Condition::Text { condition, mode, value } => {
                write!(f, "{} {:?} '{}' ({:?})", self.index_name, condition, value, mode)
            }
            Condition::Long { condition, value } => write!(f, "{} {:?} {}", self.index_name, condition, value),
            Condition::Double { condition, value, tolerance } => {
                write!(f, "{} {:?} {} (±{})", self.index_name, condition, value, tolerance)
            }
        }
    }
}

/// Compiled form of a condition
#[derive(Debug, Clone)]
pub struct ValueMatcher {
    condition: Condition,
    regex: Option<Regex>,
}

impl ValueMatcher {
    pub fn matches(&self, value: &IndexValue) -> bool {
        match (&self.condition, value) {
            (Condition::Text { condition, mode, value: reference }, IndexValue::Text(text)) => {
                self.match_text(*condition, *mode, text, reference)
            }
            (Condition::Long { condition, value: reference }, IndexValue::Long(v)) => condition.compare(*v, *reference),
            (
                Condition::Double {
                    condition,
                    value: reference,
                    tolerance,
                },
                IndexValue::Double(v),
            ) => match condition {
                NumberCondition::Equals => (v - reference).abs() <= *tolerance,
                NumberCondition::NotEquals => (v - reference).abs() > *tolerance,
                other => other.compare(*v, *reference),
            },
            _ => false,
        }
    }

    fn match_text(&self, condition: TextCondition, mode: TextMatchMode, text: &str, reference: &str) -> bool {
        if let Some(regex) = &self.regex {
            let found = regex.is_match(text);
            return if condition.is_negated() { !found } else { found };
        }

        let (text, reference) = match mode {
            TextMatchMode::Strict => (text.to_string(), reference.to_string()),
            TextMatchMode::CaseInsensitive => (text.to_lowercase(), reference.to_lowercase()),
        };
        let positive = match condition {
            TextCondition::Equals | TextCondition::NotEquals => text == reference,
            TextCondition::Contains | TextCondition::NotContains => text.contains(&reference),
            TextCondition::StartsWith | TextCondition::NotStartsWith => text.starts_with(&reference),
            TextCondition::EndsWith | TextCondition::NotEndsWith => text.ends_with(&reference),
            // Compiled above; unreachable without a regex
            TextCondition::MatchesRegex | TextCondition::NotMatchesRegex => false,
        };
        if condition.is_negated() {
            !positive
        } else {
            positive
        }
    }
}
