//! Boolean query tree

use super::spec::SearchSpecification;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryNode {
    And(Box<QueryNode>, Box<QueryNode>),
    Or(Box<QueryNode>, Box<QueryNode>),
    Where(SearchSpecification),
}

impl QueryNode {
    pub fn leaf(spec: SearchSpecification) -> Self {
        QueryNode::Where(spec)
    }

    pub fn and(self, other: QueryNode) -> Self {
        QueryNode::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: QueryNode) -> Self {
        QueryNode::Or(Box::new(self), Box::new(other))
    }

    /// Leaves in evaluation order
    pub fn specifications(&self) -> Vec<&SearchSpecification> {
        match self {
            QueryNode::And(left, right) | QueryNode::Or(left, right) => {
                let mut specs = left.specifications();
                specs.extend(right.specifications());
                specs
            }
            QueryNode::Where(spec) => vec![spec],
        }
    }

    pub fn index_names(&self) -> BTreeSet<String> {
        self.specifications()
            .into_iter()
            .map(|spec| spec.index_name.clone())
            .collect()
    }
}

impl From<SearchSpecification> for QueryNode {
    fn from(spec: SearchSpecification) -> Self {
        QueryNode::Where(spec)
    }
}

impl fmt::Display for QueryNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            QueryNode::And(left, right) => write!(f, "({} AND {})", left, right),
            QueryNode::Or(left, right) => write!(f, "({} OR {})", left, right),
            QueryNode::Where(spec) => write!(f, "{}", spec),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{NumberCondition, TextCondition};

    #[test]
    fn test_tree_building() {
        let query = QueryNode::leaf(SearchSpecification::text("name", TextCondition::StartsWith, "A"))
            .and(SearchSpecification::long("age", NumberCondition::GreaterThan, 30).into())
            .or(SearchSpecification::text("name", TextCondition::Equals, "Bob").into());

        assert_eq!(query.specifications().len(), 3);
        assert_eq!(query.index_names().len(), 2);
        assert!(query.to_string().contains(" OR "));
        assert!(matches!(query, QueryNode::Or(_, _)));
    }
}
