//! Aggregation planning.
//!
//! `aggregate()` and `count()` add summary annotations and evaluate them in a
//! single-row query. When the query is sliced, distinct, grouped, or already
//! carries annotations, the aggregates must run over the rows of the query
//! rather than inside it, so the query becomes the inner part of
//! `SELECT <aggregates> FROM (<query>) subquery`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use indexmap::IndexMap;
use relq_core::RelqResult;

use crate::executor::DbExecutor;
use crate::query::compiler::{CompiledQuery, ResultType};
use crate::query::expressions::{AggregateFunc, Annotation, Col, Expression};
use crate::query::query::{GroupBy, Query, SelectRelated};
use crate::value::Value;

/// The query that evaluates a set of summary annotations.
#[derive(Debug, Clone)]
pub enum AggregationPlan {
    /// The aggregates are selected from the query itself.
    Direct(Query),
    /// The query is wrapped in an outer query that aggregates its rows.
    Subquery(Query),
}

impl AggregationPlan {
    /// Returns `true` for the wrapped form.
    pub const fn is_subquery(&self) -> bool {
        matches!(self, Self::Subquery(_))
    }

    /// The query to run.
    pub fn query(&self) -> &Query {
        match self {
            Self::Direct(query) | Self::Subquery(query) => query,
        }
    }

    /// Consumes the plan and returns the query to run.
    pub fn into_query(self) -> Query {
        match self {
            Self::Direct(query) | Self::Subquery(query) => query,
        }
    }
}

impl Query {
    /// Plans the evaluation of the selected annotations, where `added` are
    /// the names of the aggregates just requested.
    pub fn plan_aggregation(&self, added: &[String]) -> AggregationPlan {
        let existing: Vec<&Expression> = self
            .annotations
            .iter()
            .filter(|(name, _)| !added.contains(name))
            .map(|(_, annotation)| &annotation.expr)
            .collect();
        let needs_subquery = matches!(self.group_by, GroupBy::Exprs(_))
            || self.is_sliced()
            || !existing.is_empty()
            || self.distinct;

        let mut outer = if needs_subquery {
            let has_existing_aggregates = existing.iter().any(|e| e.contains_aggregate());
            self.wrap_for_aggregation(has_existing_aggregates)
        } else {
            let mut outer = self.clone();
            outer.select.clear();
            outer.default_cols = false;
            outer.extra.clear();
            outer
        };
        outer.clear_ordering(true);
        outer.clear_limits();
        outer.select_for_update = false;
        outer.select_related = SelectRelated::Off;

        if needs_subquery {
            tracing::debug!(model = %self.model.label, "aggregating over a subquery");
            AggregationPlan::Subquery(outer)
        } else {
            AggregationPlan::Direct(outer)
        }
    }

    /// Moves the summary annotations into a new outer query wrapping a copy
    /// of this one.
    fn wrap_for_aggregation(&self, has_existing_aggregates: bool) -> Self {
        let mut inner = self.clone();
        inner.select_for_update = false;
        inner.select_related = SelectRelated::Off;
        inner.set_annotation_mask(Some(
            self.annotation_select().map(|(name, _)| name.clone()).collect(),
        ));
        if !self.is_sliced() && self.distinct_fields.is_empty() {
            inner.clear_ordering(true);
        }
        if !inner.distinct {
            if inner.default_cols && has_existing_aggregates {
                let alias = inner.get_initial_alias();
                let pk = self.model.pk().clone();
                inner.group_by = GroupBy::Exprs(vec![Expression::Col(Col::new(alias, pk))]);
            }
            inner.default_cols = false;
        }

        let relabels: BTreeMap<String, String> = inner
            .alias_map
            .aliases()
            .into_iter()
            .map(|alias| (alias, "subquery".to_string()))
            .collect();

        let mut outer = Self::for_model(Arc::clone(&self.ctx), Arc::clone(&self.model));
        let selected: Vec<(String, bool, Expression)> = inner
            .annotation_select()
            .map(|(name, a)| (name.clone(), a.is_summary, a.expr.clone()))
            .collect();
        let mut col_cnt = 0;
        for (name, is_summary, expr) in selected {
            if !is_summary {
                continue;
            }
            let rewritten = inner.rewrite_cols(expr, &mut col_cnt);
            outer.annotations.insert(
                name.clone(),
                Annotation {
                    expr: rewritten.relabeled(&relabels),
                    is_summary: true,
                },
            );
            inner.annotations.shift_remove(&name);
            if let Some(mask) = &mut inner.annotation_select_mask {
                mask.remove(&name);
            }
        }

        let nothing_selected = inner.select.is_empty()
            && !inner.default_cols
            && inner
                .annotation_select_mask
                .as_ref()
                .map_or(inner.annotations.is_empty(), BTreeSet::is_empty);
        if nothing_selected {
            let alias = inner.get_initial_alias();
            inner.select = vec![Col::new(alias, self.model.pk().clone())];
        }
        outer.subquery = Some(Box::new(inner));
        outer
    }

    /// Replaces the columns and inner aggregates of a summary aggregate by
    /// references to new `__col<n>` annotations selected by this (inner)
    /// query.
    fn rewrite_cols(&mut self, expr: Expression, col_cnt: &mut usize) -> Expression {
        match expr {
            Expression::Aggregate {
                func,
                expr,
                distinct,
            } => Expression::Aggregate {
                func,
                expr: Box::new(self.rewrite_source(*expr, col_cnt)),
                distinct,
            },
            other => self.rewrite_source(other, col_cnt),
        }
    }

    fn rewrite_source(&mut self, expr: Expression, col_cnt: &mut usize) -> Expression {
        match expr {
            Expression::Col(_) | Expression::Aggregate { .. } | Expression::Subquery(_) => {
                *col_cnt += 1;
                let alias = format!("__col{col_cnt}");
                self.annotations.insert(
                    alias.clone(),
                    Annotation {
                        expr,
                        is_summary: false,
                    },
                );
                self.append_annotation_mask([alias.clone()]);
                Expression::Ref(alias)
            }
            Expression::Func { name, args, output } => Expression::Func {
                name,
                args: args
                    .into_iter()
                    .map(|a| self.rewrite_source(a, col_cnt))
                    .collect(),
                output,
            },
            Expression::Transform { name, lhs } => Expression::Transform {
                name,
                lhs: Box::new(self.rewrite_source(*lhs, col_cnt)),
            },
            Expression::Arithmetic { op, lhs, rhs } => Expression::Arithmetic {
                op,
                lhs: Box::new(self.rewrite_source(*lhs, col_cnt)),
                rhs: Box::new(self.rewrite_source(*rhs, col_cnt)),
            },
            other => other,
        }
    }

    /// Evaluates the selected annotations; `added` are the names of the
    /// aggregates just requested.
    ///
    /// A query that can match no rows is not executed. Every aggregate is
    /// then NULL. Counts selected directly from the query are 0; a wrapping
    /// subquery leaves them NULL as well.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and errors reported by `executor`.
    pub fn get_aggregation(
        &self,
        executor: &dyn DbExecutor,
        added: &[String],
    ) -> RelqResult<IndexMap<String, Value>> {
        if self.annotation_select().next().is_none() {
            return Ok(IndexMap::new());
        }
        let plan = self.plan_aggregation(added);
        let wrapped = plan.is_subquery();
        let outer = plan.into_query();
        let names: Vec<(String, bool)> = outer
            .annotation_select()
            .map(|(name, a)| {
                let is_count = matches!(
                    a.expr,
                    Expression::Aggregate {
                        func: AggregateFunc::Count,
                        ..
                    }
                );
                (name.clone(), is_count)
            })
            .collect();

        let mut compiler = outer.get_compiler(executor.backend_type());
        let row = compiler.execute_sql(executor, ResultType::Single)?.into_row();
        let values = match row {
            Some(row) => row.into_values(),
            None => {
                tracing::debug!(wrapped, "aggregating an empty query");
                names
                    .iter()
                    .map(|(_, is_count)| {
                        if *is_count && !wrapped {
                            Value::Int(0)
                        } else {
                            Value::Null
                        }
                    })
                    .collect()
            }
        };
        Ok(names
            .into_iter()
            .map(|(name, _)| name)
            .zip(values)
            .collect())
    }

    /// Counts the rows the query returns.
    ///
    /// # Errors
    ///
    /// See [`get_aggregation`](Self::get_aggregation).
    pub fn get_count(&self, executor: &dyn DbExecutor) -> RelqResult<i64> {
        let mut obj = self.clone();
        obj.add_annotation(Expression::count_all(), "__count", true)?;
        let result = obj.get_aggregation(executor, &["__count".to_string()])?;
        Ok(result
            .get("__count")
            .and_then(Value::as_int)
            .unwrap_or(0))
    }

    /// The query `has_results` runs: a constant select limited to one row.
    ///
    /// # Errors
    ///
    /// Returns [`relq_core::RelqError::FieldError`] if grouping columns cannot
    /// be resolved.
    pub fn exists(&self) -> RelqResult<Self> {
        let mut q = self.clone();
        if !q.distinct {
            if matches!(q.group_by, GroupBy::All) {
                let names: Vec<String> = self
                    .ctx
                    .models()
                    .all_concrete_fields(&self.model)
                    .into_iter()
                    .map(|(_, f)| f.name)
                    .collect();
                q.add_fields(&names, false)?;
                q.set_group_by();
            }
            q.clear_select_clause();
        }
        q.clear_ordering(true);
        q.set_limits(None, Some(1));
        q.add_extra(
            vec![("a".to_string(), "1".to_string())],
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        );
        q.set_extra_mask(Some(BTreeSet::from(["a".to_string()])));
        Ok(q)
    }

    /// Returns `true` if the query matches at least one row.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and errors reported by `executor`.
    pub fn has_results(&self, executor: &dyn DbExecutor) -> RelqResult<bool> {
        let q = self.exists()?;
        q.get_compiler(executor.backend_type()).has_results(executor)
    }

    /// Returns `true` if the query has any filter.
    pub fn has_filters(&self) -> bool {
        !self.where_.children.is_empty()
    }

    /// Compiles the aggregation query, for inspection.
    ///
    /// # Errors
    ///
    /// See [`sql_with_params`](Self::sql_with_params).
    pub fn aggregation_sql(&self, added: &[String]) -> RelqResult<CompiledQuery> {
        self.plan_aggregation(added).into_query().sql_with_params()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::compiler::Row;
    use crate::testing::{library_context, StubExecutor};

    fn book_query() -> Query {
        Query::new(library_context(), "library.book").unwrap()
    }

    fn with_sum(mut q: Query) -> Query {
        q.add_annotation(Expression::sum(Expression::f("pages")), "total", true)
            .unwrap();
        q
    }

    fn sql_of(plan: &AggregationPlan) -> String {
        plan.query()
            .sql_with_params()
            .unwrap()
            .sql()
            .unwrap()
            .to_string()
    }

    #[test]
    fn test_plain_aggregate_is_direct() {
        let mut q = book_query();
        q.add_filter("pages__gt", 1).unwrap();
        let plan = with_sum(q).plan_aggregation(&["total".to_string()]);
        assert!(!plan.is_subquery());
        assert_eq!(
            sql_of(&plan),
            "SELECT SUM(\"library_book\".\"pages\") AS \"total\" FROM \"library_book\" \
             WHERE \"library_book\".\"pages\" > ?"
        );
    }

    #[test]
    fn test_sliced_aggregate_wraps_subquery() {
        let mut q = book_query();
        q.add_filter("pages__gt", 1).unwrap();
        q.set_limits(Some(0), Some(5));
        let plan = with_sum(q).plan_aggregation(&["total".to_string()]);
        assert!(plan.is_subquery());
        assert_eq!(
            sql_of(&plan),
            "SELECT SUM(\"__col1\") FROM (SELECT \"library_book\".\"pages\" AS \"__col1\" \
             FROM \"library_book\" WHERE \"library_book\".\"pages\" > ? LIMIT 5) subquery"
        );
    }

    #[test]
    fn test_distinct_aggregate_wraps_subquery() {
        let mut q = book_query();
        q.set_distinct(true);
        let plan = with_sum(q).plan_aggregation(&["total".to_string()]);
        assert!(plan.is_subquery());
        assert!(sql_of(&plan).contains("FROM (SELECT DISTINCT "));
    }

    #[test]
    fn test_aggregate_over_annotation_groups_inner_by_pk() {
        let mut q = book_query();
        q.add_annotation(Expression::count(Expression::f("tags")), "n_tags", false)
            .unwrap();
        q.group_by = GroupBy::All;
        q.add_annotation(Expression::max(Expression::f("n_tags")), "most", true)
            .unwrap();
        let plan = q.plan_aggregation(&["most".to_string()]);
        assert!(plan.is_subquery());
        let sql = sql_of(&plan);
        assert!(sql.starts_with("SELECT MAX(\"n_tags\") FROM (SELECT COUNT("), "{sql}");
        assert!(sql.contains("GROUP BY \"library_book\".\"id\""), "{sql}");
        assert!(sql.ends_with(") subquery"), "{sql}");
    }

    #[test]
    fn test_count_over_slice_selects_pk() {
        let mut q = book_query();
        q.set_limits(Some(2), None);
        q.add_annotation(Expression::count_all(), "__count", true).unwrap();
        let plan = q.plan_aggregation(&["__count".to_string()]);
        let sql = sql_of(&plan);
        assert!(sql.starts_with(
            "SELECT COUNT(*) FROM (SELECT \"library_book\".\"id\" AS \"Col1\" FROM \"library_book\""
        ), "{sql}");
        assert!(sql.ends_with("LIMIT -1 OFFSET 2) subquery"), "{sql}");
    }

    #[test]
    fn test_get_count_reads_first_column() {
        let executor = StubExecutor::with_rows(vec![Row::new(
            vec!["__count".into()],
            vec![Value::Int(12)],
        )]);
        assert_eq!(book_query().get_count(&executor).unwrap(), 12);
        let (sql, _) = &executor.statements()[0];
        assert_eq!(sql, "SELECT COUNT(*) AS \"__count\" FROM \"library_book\"");
    }

    #[test]
    fn test_empty_query_aggregates_without_round_trip() {
        let executor = StubExecutor::default();
        let mut q = book_query();
        q.add_filter("pk__in", Vec::<Value>::new()).unwrap();
        assert_eq!(q.get_count(&executor).unwrap(), 0);
        let result = with_sum(q.clone())
            .get_aggregation(&executor, &["total".to_string()])
            .unwrap();
        assert_eq!(result.get("total"), Some(&Value::Null));
        assert!(!q.has_results(&executor).unwrap());
        assert_eq!(executor.calls(), 0);
    }

    #[test]
    fn test_empty_sliced_aggregate_is_null() {
        let executor = StubExecutor::default();
        let mut q = book_query();
        q.add_filter("pk__in", Vec::<Value>::new()).unwrap();
        q.set_limits(Some(0), Some(3));
        q.add_annotation(Expression::count_all(), "n", true).unwrap();
        assert!(q.plan_aggregation(&["n".to_string()]).is_subquery());
        let result = q.get_aggregation(&executor, &["n".to_string()]).unwrap();
        assert_eq!(result.get("n"), Some(&Value::Null));
        assert_eq!(q.get_count(&executor).unwrap(), 0);
        assert_eq!(executor.calls(), 0);
    }

    #[test]
    fn test_exists_selects_constant() {
        let mut q = book_query();
        q.add_filter("title", "Dune").unwrap();
        let sql = q.exists().unwrap().sql_with_params().unwrap();
        assert_eq!(
            sql.sql(),
            Some("SELECT (1) AS \"a\" FROM \"library_book\" WHERE \"library_book\".\"title\" = ? LIMIT 1")
        );
    }

    #[test]
    fn test_exists_keeps_grouping() {
        let mut q = book_query();
        q.add_annotation(Expression::count(Expression::f("tags")), "n_tags", false)
            .unwrap();
        q.group_by = GroupBy::All;
        let sql = q.exists().unwrap().sql_with_params().unwrap();
        let sql = sql.sql().unwrap();
        assert!(sql.starts_with("SELECT (1) AS \"a\" FROM"), "{sql}");
        assert!(sql.contains("GROUP BY \"library_book\".\"id\", \"library_book\".\"title\""), "{sql}");
    }

    #[test]
    fn test_has_filters() {
        let mut q = book_query();
        assert!(!q.has_filters());
        q.add_filter("pages", 1).unwrap();
        assert!(q.has_filters());
    }
}
