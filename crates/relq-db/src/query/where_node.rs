//! The boolean filter tree of a query.
//!
//! A [`WhereNode`] is an AND/OR node, optionally negated, whose children are
//! nested nodes, [`Condition`]s, raw SQL fragments, or the "matches nothing"
//! marker. The compiler turns a tree into SQL and reports when a subtree
//! matches everything or nothing so the surrounding node can simplify.

use std::collections::BTreeMap;

use crate::query::custom_lookups::{BuiltinLookup, LookupKind};
use crate::query::expressions::{Col, Expression};
use crate::query::query::Query;
use crate::value::Value;

/// How the children of a node combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Connector {
    /// All children must hold.
    And,
    /// At least one child must hold.
    Or,
}

impl Connector {
    /// The SQL keyword.
    pub const fn sql(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
        }
    }
}

/// The right-hand side of a condition.
#[derive(Debug, Clone)]
pub enum LookupRhs {
    /// A single literal.
    Value(Value),
    /// The items of an `in` list.
    List(Vec<Value>),
    /// The bounds of a `range`.
    Range(Value, Value),
    /// A resolved expression.
    Expression(Expression),
    /// A subquery.
    Query(Box<Query>),
}

impl LookupRhs {
    /// Returns the boolean literal, if that is what the side holds.
    pub const fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Value(Value::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    fn relabeled(&self, change_map: &BTreeMap<String, String>) -> Self {
        match self {
            Self::Expression(e) => Self::Expression(e.relabeled(change_map)),
            Self::Query(q) => {
                let mut q = q.clone();
                q.relabel_external(change_map);
                Self::Query(q)
            }
            Self::Value(_) | Self::List(_) | Self::Range(..) => self.clone(),
        }
    }
}

/// A single lookup applied to a left-hand expression.
#[derive(Debug, Clone)]
pub struct Condition {
    /// The left-hand side, usually a column, possibly transformed.
    pub lhs: Expression,
    /// The lookup.
    pub lookup: LookupKind,
    /// The right-hand side.
    pub rhs: LookupRhs,
}

impl Condition {
    /// `col IS [NOT] NULL`
    pub fn isnull(col: Col, is_null: bool) -> Self {
        Self {
            lhs: Expression::Col(col),
            lookup: LookupKind::Builtin(BuiltinLookup::IsNull),
            rhs: LookupRhs::Value(Value::Bool(is_null)),
        }
    }

    /// `lhs = rhs`
    pub fn exact(lhs: Expression, rhs: Expression) -> Self {
        Self {
            lhs,
            lookup: LookupKind::Builtin(BuiltinLookup::Exact),
            rhs: LookupRhs::Expression(rhs),
        }
    }

    /// Returns `true` if either side holds an aggregate.
    pub fn contains_aggregate(&self) -> bool {
        self.lhs.contains_aggregate()
            || matches!(&self.rhs, LookupRhs::Expression(e) if e.contains_aggregate())
    }

    fn relabeled(&self, change_map: &BTreeMap<String, String>) -> Self {
        Self {
            lhs: self.lhs.relabeled(change_map),
            lookup: self.lookup.clone(),
            rhs: self.rhs.relabeled(change_map),
        }
    }
}

/// Raw SQL conditions added through `extra(where=...)`.
#[derive(Debug, Clone)]
pub struct ExtraWhere {
    /// SQL fragments, ANDed together.
    pub sqls: Vec<String>,
    /// Parameters bound in order.
    pub params: Vec<Value>,
}

/// A child of a [`WhereNode`].
#[derive(Debug, Clone)]
pub enum WhereChild {
    /// A nested node.
    Node(WhereNode),
    /// A lookup.
    Condition(Condition),
    /// Matches no row.
    Nothing,
    /// Raw SQL.
    Extra(ExtraWhere),
}

impl WhereChild {
    fn contains_aggregate(&self) -> bool {
        match self {
            Self::Node(node) => node.contains_aggregate(),
            Self::Condition(cond) => cond.contains_aggregate(),
            Self::Nothing | Self::Extra(_) => false,
        }
    }

    fn relabel(&mut self, change_map: &BTreeMap<String, String>) {
        match self {
            Self::Node(node) => node.relabel_aliases(change_map),
            Self::Condition(cond) => *cond = cond.relabeled(change_map),
            Self::Nothing | Self::Extra(_) => {}
        }
    }
}

/// An AND/OR node of the filter tree.
#[derive(Debug, Clone)]
pub struct WhereNode {
    /// How children combine.
    pub connector: Connector,
    /// Whether the node is wrapped in `NOT`.
    pub negated: bool,
    /// The children.
    pub children: Vec<WhereChild>,
}

impl Default for WhereNode {
    fn default() -> Self {
        Self::new(Connector::And, false)
    }
}

impl WhereNode {
    /// Creates an empty node.
    pub const fn new(connector: Connector, negated: bool) -> Self {
        Self {
            connector,
            negated,
            children: Vec::new(),
        }
    }

    /// Returns `true` if the node has no children at all.
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Returns `true` if the tree holds no leaf anywhere.
    pub fn is_empty_tree(&self) -> bool {
        self.children.iter().all(|c| match c {
            WhereChild::Node(node) => node.is_empty_tree(),
            _ => false,
        })
    }

    /// Adds a child under `connector`.
    ///
    /// When the connectors match, a non-negated child node with the same
    /// connector (or a single child) is flattened into this node. When they
    /// differ, the current children are pushed down into a new node and this
    /// node switches to `connector` with that node and the new child.
    pub fn add(&mut self, child: WhereChild, connector: Connector) {
        if self.connector == connector {
            match child {
                WhereChild::Node(node)
                    if !node.negated
                        && (node.connector == connector || node.children.len() == 1) =>
                {
                    self.children.extend(node.children);
                }
                other => self.children.push(other),
            }
        } else {
            let existing = Self {
                connector: self.connector,
                negated: self.negated,
                children: std::mem::take(&mut self.children),
            };
            self.connector = connector;
            self.negated = false;
            self.children = vec![WhereChild::Node(existing), child];
        }
    }

    /// Negates the node in place.
    pub fn negate(&mut self) {
        self.negated = !self.negated;
    }

    /// Returns `true` if any condition holds an aggregate.
    pub fn contains_aggregate(&self) -> bool {
        self.children.iter().any(WhereChild::contains_aggregate)
    }

    /// Renames column aliases through `change_map`.
    pub fn relabel_aliases(&mut self, change_map: &BTreeMap<String, String>) {
        for child in &mut self.children {
            child.relabel(change_map);
        }
    }

    /// Returns a relabeled copy.
    #[must_use]
    pub fn relabeled_clone(&self, change_map: &BTreeMap<String, String>) -> Self {
        let mut clone = self.clone();
        clone.relabel_aliases(change_map);
        clone
    }

    /// Splits the tree into a WHERE part and a HAVING part.
    ///
    /// A subtree without aggregates stays in WHERE. An AND node that is not
    /// negated (after accounting for enclosing negations) splits child by
    /// child. Anything else that touches an aggregate moves to HAVING whole.
    pub fn split_having(&self, negated: bool) -> (Option<Self>, Option<Self>) {
        if !self.contains_aggregate() {
            return (Some(self.clone()), None);
        }
        let in_negated = negated ^ self.negated;
        let may_split = !in_negated && self.connector == Connector::And;
        if !may_split {
            return (None, Some(self.clone()));
        }
        let mut where_parts = Vec::new();
        let mut having_parts = Vec::new();
        for child in &self.children {
            match child {
                WhereChild::Node(node) => {
                    let (w, h) = node.split_having(in_negated);
                    where_parts.extend(w.map(WhereChild::Node));
                    having_parts.extend(h.map(WhereChild::Node));
                }
                other if other.contains_aggregate() => having_parts.push(other.clone()),
                other => where_parts.push(other.clone()),
            }
        }
        let rebuild = |children: Vec<WhereChild>| {
            (!children.is_empty()).then(|| Self {
                connector: self.connector,
                negated: self.negated,
                children,
            })
        };
        (rebuild(where_parts), rebuild(having_parts))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{FieldDef, FieldType};

    fn cond(alias: &str, column: &str, v: i64) -> WhereChild {
        WhereChild::Condition(Condition {
            lhs: Expression::Col(Col::new(alias, FieldDef::new(column, FieldType::IntegerField))),
            lookup: LookupKind::Builtin(BuiltinLookup::Exact),
            rhs: LookupRhs::Value(Value::Int(v)),
        })
    }

    fn agg_cond() -> WhereChild {
        WhereChild::Condition(Condition {
            lhs: Expression::count(Expression::Star),
            lookup: LookupKind::Builtin(BuiltinLookup::Gt),
            rhs: LookupRhs::Value(Value::Int(1)),
        })
    }

    #[test]
    fn test_add_same_connector_appends() {
        let mut node = WhereNode::default();
        node.add(cond("b", "x", 1), Connector::And);
        node.add(cond("b", "y", 2), Connector::And);
        assert_eq!(node.children.len(), 2);
        assert_eq!(node.connector, Connector::And);
    }

    #[test]
    fn test_add_flattens_matching_node() {
        let mut inner = WhereNode::default();
        inner.add(cond("b", "x", 1), Connector::And);
        inner.add(cond("b", "y", 2), Connector::And);
        let mut node = WhereNode::default();
        node.add(WhereChild::Node(inner), Connector::And);
        assert_eq!(node.children.len(), 2);
    }

    #[test]
    fn test_add_keeps_negated_node() {
        let mut inner = WhereNode::new(Connector::And, true);
        inner.add(cond("b", "x", 1), Connector::And);
        let mut node = WhereNode::default();
        node.add(WhereChild::Node(inner), Connector::And);
        assert_eq!(node.children.len(), 1);
        assert!(matches!(&node.children[0], WhereChild::Node(n) if n.negated));
    }

    #[test]
    fn test_add_other_connector_pushes_down() {
        let mut node = WhereNode::default();
        node.add(cond("b", "x", 1), Connector::And);
        node.add(cond("b", "y", 2), Connector::Or);
        assert_eq!(node.connector, Connector::Or);
        assert_eq!(node.children.len(), 2);
        assert!(matches!(&node.children[0], WhereChild::Node(n) if n.connector == Connector::And));
    }

    #[test]
    fn test_is_empty_tree() {
        let mut node = WhereNode::default();
        assert!(node.is_empty_tree());
        node.children.push(WhereChild::Node(WhereNode::default()));
        assert!(node.is_empty_tree());
        node.add(cond("b", "x", 1), Connector::And);
        assert!(!node.is_empty_tree());
    }

    #[test]
    fn test_relabel_aliases() {
        let mut node = WhereNode::default();
        node.add(cond("book", "x", 1), Connector::And);
        let mut map = BTreeMap::new();
        map.insert("book".to_string(), "U0".to_string());
        node.relabel_aliases(&map);
        match &node.children[0] {
            WhereChild::Condition(c) => assert_eq!(c.lhs.cols()[0].alias, "U0"),
            _ => panic!("expected condition"),
        }
    }

    #[test]
    fn test_split_having_and_node_splits() {
        let mut node = WhereNode::default();
        node.add(cond("b", "x", 1), Connector::And);
        node.add(agg_cond(), Connector::And);
        let (w, h) = node.split_having(false);
        assert_eq!(w.unwrap().children.len(), 1);
        assert_eq!(h.unwrap().children.len(), 1);
    }

    #[test]
    fn test_split_having_or_node_moves_whole() {
        let mut node = WhereNode::new(Connector::Or, false);
        node.children.push(cond("b", "x", 1));
        node.children.push(agg_cond());
        let (w, h) = node.split_having(false);
        assert!(w.is_none());
        assert_eq!(h.unwrap().children.len(), 2);
    }

    #[test]
    fn test_split_having_negated_and_moves_whole() {
        let mut node = WhereNode::new(Connector::And, true);
        node.children.push(cond("b", "x", 1));
        node.children.push(agg_cond());
        let (w, h) = node.split_having(false);
        assert!(w.is_none());
        assert!(h.unwrap().negated);
    }

    #[test]
    fn test_split_having_without_aggregates() {
        let mut node = WhereNode::default();
        node.add(cond("b", "x", 1), Connector::And);
        let (w, h) = node.split_having(false);
        assert!(w.is_some());
        assert!(h.is_none());
    }
}
