//! Join type decisions for one filter-tree node.
//!
//! Every child of a node votes for the aliases it needs as `INNER` joins.
//! Once all children are compiled the votes decide which joins to promote to
//! `LEFT OUTER` and which to demote to `INNER`:
//!
//! - under OR, an alias not needed by every child is promoted: a row must
//!   survive when only the other branches match;
//! - under AND, or under OR when every child needs the alias, it is demoted:
//!   a row without a match for it can never satisfy the node.
//!
//! Negation flips the effective connector, since `NOT (a AND b)` is
//! `NOT a OR NOT b`.

use std::collections::{BTreeMap, BTreeSet};

use crate::query::joins::AliasMap;
use crate::query::where_node::Connector;

/// Collects votes for one node and applies the resulting join types.
#[derive(Debug, Clone)]
pub struct JoinPromoter {
    connector: Connector,
    negated: bool,
    effective_connector: Connector,
    num_children: usize,
    votes: BTreeMap<String, usize>,
}

impl JoinPromoter {
    /// Creates a promoter for a node with `num_children` children.
    pub fn new(connector: Connector, num_children: usize, negated: bool) -> Self {
        let effective_connector = match (negated, connector) {
            (false, c) => c,
            (true, Connector::And) => Connector::Or,
            (true, Connector::Or) => Connector::And,
        };
        Self {
            connector,
            negated,
            effective_connector,
            num_children,
            votes: BTreeMap::new(),
        }
    }

    /// The connector after accounting for negation.
    pub const fn effective_connector(&self) -> Connector {
        self.effective_connector
    }

    /// Records one vote for each alias a child requires as `INNER`.
    pub fn add_votes(&mut self, aliases: impl IntoIterator<Item = String>) {
        for alias in aliases {
            *self.votes.entry(alias).or_insert(0) += 1;
        }
    }

    /// Promotes and demotes joins in `alias_map` and returns the demoted
    /// aliases, which the enclosing node counts as this node's votes.
    pub fn update_join_types(self, alias_map: &mut AliasMap) -> BTreeSet<String> {
        let mut to_promote = BTreeSet::new();
        let mut to_demote = BTreeSet::new();
        for (alias, votes) in self.votes {
            if self.effective_connector == Connector::Or && votes < self.num_children {
                to_promote.insert(alias.clone());
            }
            if self.effective_connector == Connector::And
                || (self.effective_connector == Connector::Or && votes == self.num_children)
            {
                to_demote.insert(alias);
            }
        }
        tracing::trace!(
            connector = ?self.connector,
            negated = self.negated,
            promote = ?to_promote,
            demote = ?to_demote,
            "join promotion"
        );
        alias_map.promote_joins(to_promote);
        alias_map.demote_joins(to_demote.iter().cloned());
        to_demote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::joins::{Join, JoinType};

    fn map_with_nullable_joins() -> (AliasMap, String, String) {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let publisher = map.join(
            Join::new(
                "publisher",
                "book",
                vec![("publisher_id".into(), "id".into())],
                "book.publisher",
                true,
            ),
            None,
        );
        let editor = map.join(
            Join::new(
                "author",
                "book",
                vec![("editor_id".into(), "id".into())],
                "book.editor",
                true,
            ),
            None,
        );
        map.demote_joins([publisher.clone(), editor.clone()]);
        (map, publisher, editor)
    }

    #[test]
    fn test_effective_connector_flips_under_negation() {
        assert_eq!(
            JoinPromoter::new(Connector::And, 2, true).effective_connector(),
            Connector::Or
        );
        assert_eq!(
            JoinPromoter::new(Connector::Or, 2, true).effective_connector(),
            Connector::And
        );
        assert_eq!(
            JoinPromoter::new(Connector::Or, 2, false).effective_connector(),
            Connector::Or
        );
    }

    #[test]
    fn test_or_promotes_partial_votes() {
        let (mut map, publisher, editor) = map_with_nullable_joins();
        let mut promoter = JoinPromoter::new(Connector::Or, 2, false);
        promoter.add_votes(["book".to_string(), publisher.clone()]);
        promoter.add_votes(["book".to_string(), editor.clone()]);
        let demoted = promoter.update_join_types(&mut map);
        assert_eq!(map.join_type(&publisher), Some(JoinType::LeftOuter));
        assert_eq!(map.join_type(&editor), Some(JoinType::LeftOuter));
        assert_eq!(demoted, ["book".to_string()].into_iter().collect());
    }

    #[test]
    fn test_or_demotes_unanimous_votes() {
        let (mut map, publisher, _) = map_with_nullable_joins();
        map.promote_joins([publisher.clone()]);
        let mut promoter = JoinPromoter::new(Connector::Or, 2, false);
        promoter.add_votes([publisher.clone()]);
        promoter.add_votes([publisher.clone()]);
        let demoted = promoter.update_join_types(&mut map);
        assert_eq!(map.join_type(&publisher), Some(JoinType::Inner));
        assert!(demoted.contains(&publisher));
    }

    #[test]
    fn test_and_demotes_everything_voted() {
        let (mut map, publisher, editor) = map_with_nullable_joins();
        map.promote_joins([publisher.clone(), editor.clone()]);
        let mut promoter = JoinPromoter::new(Connector::And, 2, false);
        promoter.add_votes([publisher.clone()]);
        let demoted = promoter.update_join_types(&mut map);
        assert_eq!(map.join_type(&publisher), Some(JoinType::Inner));
        assert_eq!(map.join_type(&editor), Some(JoinType::LeftOuter));
        assert_eq!(demoted.len(), 1);
    }

    #[test]
    fn test_negated_and_behaves_like_or() {
        let (mut map, publisher, editor) = map_with_nullable_joins();
        let mut promoter = JoinPromoter::new(Connector::And, 2, true);
        promoter.add_votes([publisher.clone()]);
        promoter.add_votes([editor.clone()]);
        promoter.update_join_types(&mut map);
        assert_eq!(map.join_type(&publisher), Some(JoinType::LeftOuter));
        assert_eq!(map.join_type(&editor), Some(JoinType::LeftOuter));
    }
}
