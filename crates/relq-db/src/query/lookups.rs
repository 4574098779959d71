//! Q objects for building filter trees.
//!
//! A [`Q`] leaf pairs a lookup path such as `"author__name__icontains"` with a
//! [`FilterValue`]. Leaves combine with `&` (AND), `|` (OR), and `!` (NOT).
//!
//! # Examples
//!
//! ```
//! use relq_db::query::lookups::Q;
//!
//! let q = Q::filter("author__name", "Alice") & Q::filter("pages__gt", 100);
//! let either = Q::filter("title__startswith", "A") | Q::filter("title__startswith", "B");
//! let negated = !Q::filter("tags__name", "draft");
//! ```

use std::ops;

use crate::query::expressions::Expression;
use crate::query::query::Query;
use crate::query::where_node::Connector;
use crate::value::Value;

/// The right-hand side of a filter.
#[derive(Debug, Clone)]
pub enum FilterValue {
    /// A literal value. `Value::List` feeds `in` and `range`; `Value::Null`
    /// becomes an `isnull` test.
    Value(Value),
    /// An expression such as `F("other_field")`, resolved against the query.
    Expression(Expression),
    /// A nested query, compiled as a subquery.
    Query(Box<Query>),
}

impl<T: Into<Value>> From<T> for FilterValue {
    fn from(v: T) -> Self {
        Self::Value(v.into())
    }
}

impl From<Expression> for FilterValue {
    fn from(e: Expression) -> Self {
        Self::Expression(e)
    }
}

impl From<Query> for FilterValue {
    fn from(q: Query) -> Self {
        Self::Query(Box::new(q))
    }
}

/// A composable query filter.
#[derive(Debug, Clone)]
pub enum Q {
    /// A single lookup.
    Filter {
        /// The lookup path, e.g. `"author__name__icontains"`.
        lookup: String,
        /// The right-hand side.
        value: FilterValue,
    },
    /// Logical AND of multiple conditions.
    And(Vec<Q>),
    /// Logical OR of multiple conditions.
    Or(Vec<Q>),
    /// Logical negation of a condition.
    Not(Box<Q>),
}

impl Q {
    /// Creates a new filter leaf.
    pub fn filter(lookup: impl Into<String>, value: impl Into<FilterValue>) -> Self {
        Self::Filter {
            lookup: lookup.into(),
            value: value.into(),
        }
    }

    /// Returns `true` if this is an empty AND/OR.
    pub fn is_empty(&self) -> bool {
        match self {
            Self::And(children) | Self::Or(children) => children.is_empty(),
            _ => false,
        }
    }

    /// Views this Q as a tree node: its connector, whether it is negated, and
    /// its children. A leaf is an AND node holding itself.
    pub(crate) fn as_node(&self) -> (Connector, bool, Vec<&Q>) {
        match self {
            Self::Filter { .. } => (Connector::And, false, vec![self]),
            Self::And(children) => (Connector::And, false, children.iter().collect()),
            Self::Or(children) => (Connector::Or, false, children.iter().collect()),
            Self::Not(inner) => (Connector::And, true, vec![inner.as_ref()]),
        }
    }
}

impl ops::BitAnd for Q {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), other) => {
                left.push(other);
                Self::And(left)
            }
            (other, Self::And(mut right)) => {
                right.insert(0, other);
                Self::And(right)
            }
            (left, right) => Self::And(vec![left, right]),
        }
    }
}

impl ops::BitOr for Q {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        match (self, rhs) {
            (Self::Or(mut left), Self::Or(right)) => {
                left.extend(right);
                Self::Or(left)
            }
            (Self::Or(mut left), other) => {
                left.push(other);
                Self::Or(left)
            }
            (other, Self::Or(mut right)) => {
                right.insert(0, other);
                Self::Or(right)
            }
            (left, right) => Self::Or(vec![left, right]),
        }
    }
}

impl ops::Not for Q {
    type Output = Self;

    fn not(self) -> Self::Output {
        match self {
            Self::Not(inner) => *inner,
            other => Self::Not(Box::new(other)),
        }
    }
}
