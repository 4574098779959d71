//! QuerySet for building and executing database queries.
//!
//! A [`QuerySet`] wraps a [`Query`] and exposes the chainable API callers
//! build queries with. Every builder method leaves `self` untouched and
//! returns a new `QuerySet`, so a base queryset can be refined in several
//! directions:
//!
//! ```ignore
//! let books = QuerySet::new(ctx, "library.book")?;
//! let long = books.filter(Q::filter("pages__gt", 300))?;
//! let recent_long = long.order_by(["-published"])?.slice(None, Some(10))?;
//! let rows = recent_long.fetch(&backend)?;
//! ```
//!
//! Nothing touches the database until a terminal method (`fetch`, `get`,
//! `first`, `count`, `exists`, `aggregate`) is called with a
//! [`DbExecutor`].

use std::collections::BTreeSet;
use std::ops;
use std::sync::Arc;

use indexmap::IndexMap;
use relq_core::logging::query_span;
use relq_core::{RelqError, RelqResult};

use crate::context::QueryContext;
use crate::executor::DbExecutor;
use crate::model::ModelMeta;
use crate::query::compiler::{CompiledQuery, ResultType, Row};
use crate::query::expressions::{Expression, OrderBy};
use crate::query::lookups::{FilterValue, Q};
use crate::query::query::{GroupBy, Query, SelectRelated};
use crate::query::where_node::Connector;
use crate::value::Value;

/// Upper bound on the rows `get()` fetches to report how many matched.
const MAX_GET_RESULTS: usize = 21;

/// A lazy, chainable query over one model.
#[derive(Debug, Clone)]
pub struct QuerySet {
    query: Query,
    /// Names passed to `values()`, if it was called.
    fields: Option<Vec<String>>,
}

impl QuerySet {
    /// Creates a queryset over every row of the model with the given label.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] if the model is not registered.
    pub fn new(ctx: Arc<QueryContext>, label: &str) -> RelqResult<Self> {
        Ok(Self::from_query(Query::new(ctx, label)?))
    }

    /// Wraps an existing query.
    pub const fn from_query(query: Query) -> Self {
        Self {
            query,
            fields: None,
        }
    }

    /// Returns a reference to the underlying query.
    pub const fn query(&self) -> &Query {
        &self.query
    }

    /// Consumes the queryset, returning the underlying query.
    pub fn into_query(self) -> Query {
        self.query
    }

    /// Returns the model this queryset selects from.
    pub fn model(&self) -> &Arc<ModelMeta> {
        self.query.get_meta()
    }

    /// Returns `true` once `values()` has been called.
    pub const fn is_values(&self) -> bool {
        self.fields.is_some()
    }

    /// Returns `true` if the results have a defined order.
    pub fn ordered(&self) -> bool {
        !self.query.order_by.is_empty()
            || !self.query.extra_order_by.is_empty()
            || (self.query.default_ordering && !self.model().ordering.is_empty())
    }

    fn object_name(&self) -> String {
        let name = &self.model().model_name;
        let mut chars = name.chars();
        chars.next().map_or_else(String::new, |first| {
            first.to_uppercase().chain(chars).collect()
        })
    }

    fn not_after_slice(&self, action: &str) -> RelqResult<()> {
        if self.query.is_sliced() {
            return Err(RelqError::IncompatibleQuery(format!(
                "Cannot {action} a query once a slice has been taken."
            )));
        }
        Ok(())
    }

    fn not_after_values(&self, method: &str) -> RelqResult<()> {
        if self.fields.is_some() {
            return Err(RelqError::IncompatibleQuery(format!(
                "Cannot call {method}() after .values() or .values_list()"
            )));
        }
        Ok(())
    }

    // ── Filtering methods (lazy) ─────────────────────────────────────

    /// Returns a copy of this queryset.
    #[must_use]
    pub fn all(&self) -> Self {
        self.clone()
    }

    /// Returns a new queryset restricted to rows matching `q`.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] on a sliced queryset, and
    /// lookup resolution errors from the query.
    pub fn filter(&self, q: Q) -> RelqResult<Self> {
        self.filter_or_exclude(false, q)
    }

    /// Returns a new queryset excluding rows matching `q`.
    ///
    /// # Errors
    ///
    /// See [`filter`](Self::filter).
    pub fn exclude(&self, q: Q) -> RelqResult<Self> {
        self.filter_or_exclude(true, q)
    }

    fn filter_or_exclude(&self, negate: bool, q: Q) -> RelqResult<Self> {
        if q.is_empty() {
            return Ok(self.clone());
        }
        self.not_after_slice("filter")?;
        let mut clone = self.clone();
        let q = if negate { !q } else { q };
        clone.query.add_q(&q)?;
        Ok(clone)
    }

    /// Returns an empty queryset. No query is sent when it is evaluated.
    #[must_use]
    pub fn none(&self) -> Self {
        let mut clone = self.clone();
        clone.query.set_empty();
        clone
    }

    /// Adds a raw SQL select, where clause, tables or ordering.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] on a sliced queryset.
    pub fn extra(
        &self,
        select: &[(&str, &str)],
        select_params: Vec<Value>,
        where_sql: &[&str],
        params: Vec<Value>,
        tables: &[&str],
        order_by: &[&str],
    ) -> RelqResult<Self> {
        self.not_after_slice("change")?;
        let mut clone = self.clone();
        clone.query.add_extra(
            select
                .iter()
                .map(|(name, sql)| ((*name).to_string(), (*sql).to_string()))
                .collect(),
            select_params,
            where_sql.iter().map(|s| (*s).to_string()).collect(),
            params,
            tables.iter().map(|s| (*s).to_string()).collect(),
            order_by.iter().map(|s| (*s).to_string()).collect(),
        );
        Ok(clone)
    }

    // ── Ordering and slicing ─────────────────────────────────────────

    /// Replaces the ordering. An empty list removes explicit ordering; the
    /// model's default ordering still applies.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] on a sliced queryset, and
    /// [`RelqError::FieldError`] for malformed names.
    pub fn order_by<I, O>(&self, fields: I) -> RelqResult<Self>
    where
        I: IntoIterator<Item = O>,
        O: Into<OrderBy>,
    {
        self.not_after_slice("reorder")?;
        let mut clone = self.clone();
        clone.query.clear_ordering(false);
        let items: Vec<OrderBy> = fields.into_iter().map(Into::into).collect();
        if !items.is_empty() {
            clone.query.add_ordering(items)?;
        }
        Ok(clone)
    }

    /// Reverses the ordering.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] on a sliced queryset.
    pub fn reverse(&self) -> RelqResult<Self> {
        self.not_after_slice("reverse")?;
        let mut clone = self.clone();
        clone.query.reverse_ordering();
        Ok(clone)
    }

    /// Selects distinct rows, or `DISTINCT ON` the given fields when any are
    /// named.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] on a sliced queryset.
    pub fn distinct(&self, fields: &[&str]) -> RelqResult<Self> {
        self.not_after_slice("create distinct fields on")?;
        let mut clone = self.clone();
        clone.query.add_distinct_fields(fields);
        Ok(clone)
    }

    /// Limits the results to `start..stop`, relative to any earlier slice.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::InvalidValue`] for negative bounds.
    pub fn slice(&self, start: Option<i64>, stop: Option<i64>) -> RelqResult<Self> {
        let to_index = |bound: Option<i64>| -> RelqResult<Option<usize>> {
            bound
                .map(|b| {
                    usize::try_from(b).map_err(|_| {
                        RelqError::InvalidValue("Negative indexing is not supported.".into())
                    })
                })
                .transpose()
        };
        let (low, high) = (to_index(start)?, to_index(stop)?);
        let mut clone = self.clone();
        clone.query.set_limits(low, high);
        Ok(clone)
    }

    // ── Annotation and selection ─────────────────────────────────────

    /// Attaches named expressions to every row.
    ///
    /// When any of them is an aggregate the rows are grouped: by every
    /// model column, or by the selected values after `values()`.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::InvalidValue`] if a name collides with a field,
    /// and resolution errors for the expressions.
    pub fn annotate<S: AsRef<str>>(&self, annotations: Vec<(S, Expression)>) -> RelqResult<Self> {
        let names: BTreeSet<String> = match &self.fields {
            Some(fields) => fields.iter().cloned().collect(),
            None => self
                .query
                .context()
                .models()
                .field_names(self.model())
                .into_iter()
                .collect(),
        };
        let mut clone = self.clone();
        let mut added = Vec::with_capacity(annotations.len());
        for (alias, expr) in annotations {
            let alias = alias.as_ref();
            if names.contains(alias) {
                return Err(RelqError::InvalidValue(format!(
                    "The annotation '{alias}' conflicts with a field on the model."
                )));
            }
            clone.query.add_annotation(expr, alias, false)?;
            added.push(alias.to_string());
        }
        let groups = added.iter().any(|alias| {
            clone
                .query
                .annotations()
                .get(alias)
                .is_some_and(|a| a.expr.contains_aggregate())
        });
        if groups {
            if clone.fields.is_none() {
                clone.query.group_by = GroupBy::All;
            } else {
                clone.query.set_group_by();
            }
        }
        Ok(clone)
    }

    /// Returns rows holding only the named fields, annotations and extra
    /// selects. No names selects every concrete field.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for unknown names.
    pub fn values(&self, fields: &[&str]) -> RelqResult<Self> {
        let fields: Vec<String> = fields.iter().map(|f| (*f).to_string()).collect();
        let mut clone = self.clone();
        clone.query.set_values(&fields)?;
        clone.fields = Some(fields);
        Ok(clone)
    }

    /// Loads only the named fields; the primary key is always loaded.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] after `values()`.
    pub fn only(&self, fields: &[&str]) -> RelqResult<Self> {
        self.not_after_values("only")?;
        let mut clone = self.clone();
        clone.query.add_immediate_loading(fields);
        Ok(clone)
    }

    /// Defers loading of the named fields. No names clears every deferral.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] after `values()`.
    pub fn defer(&self, fields: &[&str]) -> RelqResult<Self> {
        self.not_after_values("defer")?;
        let mut clone = self.clone();
        if fields.is_empty() {
            clone.query.clear_deferred_loading();
        } else {
            clone.query.add_deferred_loading(fields);
        }
        Ok(clone)
    }

    /// Loads related rows in the same query. No paths follows every
    /// non-null foreign key.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] after `values()`.
    pub fn select_related(&self, paths: &[&str]) -> RelqResult<Self> {
        self.not_after_values("select_related")?;
        let mut clone = self.clone();
        if paths.is_empty() {
            clone.query.set_select_related_all();
        } else {
            clone.query.add_select_related(paths);
        }
        Ok(clone)
    }

    /// Stops following relations with `select_related`.
    #[must_use]
    pub fn clear_select_related(&self) -> Self {
        let mut clone = self.clone();
        clone.query.select_related = SelectRelated::Off;
        clone
    }

    /// Locks the selected rows with `SELECT ... FOR UPDATE`.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::InvalidValue`] when both `nowait` and
    /// `skip_locked` are set.
    pub fn select_for_update(&self, nowait: bool, skip_locked: bool) -> RelqResult<Self> {
        if nowait && skip_locked {
            return Err(RelqError::InvalidValue(
                "The nowait option cannot be used with skip_locked.".into(),
            ));
        }
        let mut clone = self.clone();
        clone.query.set_select_for_update(nowait, skip_locked);
        Ok(clone)
    }

    // ── Combination ──────────────────────────────────────────────────

    /// Returns rows matched by both querysets.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] when the querysets cannot be
    /// combined.
    pub fn and(&self, other: &Self) -> RelqResult<Self> {
        if self.query.is_empty() {
            return Ok(self.clone());
        }
        if other.query.is_empty() {
            return Ok(other.clone());
        }
        let other = other.as_filterable()?;
        let mut combined = self.clone();
        combined.query.combine(&other.query, Connector::And)?;
        Ok(combined)
    }

    /// Returns rows matched by either queryset.
    ///
    /// # Errors
    ///
    /// See [`and`](Self::and).
    pub fn or(&self, other: &Self) -> RelqResult<Self> {
        if self.query.is_empty() {
            return Ok(other.clone());
        }
        if other.query.is_empty() {
            return Ok(self.clone());
        }
        let mut combined = self.as_filterable()?;
        let other = other.as_filterable()?;
        combined.query.combine(&other.query, Connector::Or)?;
        Ok(combined)
    }

    /// A sliced queryset becomes `pk IN (sliced subquery)` so it can be
    /// combined.
    fn as_filterable(&self) -> RelqResult<Self> {
        if self.query.can_filter() {
            return Ok(self.clone());
        }
        let pks = self.values(&["pk"])?;
        let base = Query::for_model(Arc::clone(self.query.context()), Arc::clone(self.model()));
        Self::from_query(base).filter(Q::filter("pk__in", pks))
    }

    // ── Terminal methods (execute) ───────────────────────────────────

    /// Compiles the query without executing it.
    ///
    /// # Errors
    ///
    /// Returns compilation errors.
    pub fn sql(&self) -> RelqResult<CompiledQuery> {
        self.query.sql_with_params()
    }

    /// Executes the query and returns every row.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and errors reported by `executor`.
    pub fn fetch(&self, executor: &dyn DbExecutor) -> RelqResult<Vec<Row>> {
        let _span = query_span(&self.model().label).entered();
        let mut compiler = self.query.get_compiler(executor.backend_type());
        Ok(compiler.execute_sql(executor, ResultType::Multi)?.into_rows())
    }

    /// Returns the single matching row.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::DoesNotExist`] when nothing matches and
    /// [`RelqError::MultipleObjectsReturned`] when more than one row does.
    pub fn get(&self, executor: &dyn DbExecutor) -> RelqResult<Row> {
        let mut clone = self.clone();
        if self.query.can_filter() && self.query.distinct_fields().is_empty() {
            clone.query.clear_ordering(false);
        }
        let limited = !self.query.is_select_for_update();
        if limited {
            clone.query.set_limits(None, Some(MAX_GET_RESULTS));
        }
        let mut rows = clone.fetch(executor)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            0 => Err(RelqError::DoesNotExist(format!(
                "{} matching query does not exist.",
                self.object_name()
            ))),
            n => {
                let count = if limited && n >= MAX_GET_RESULTS {
                    format!("more than {}", MAX_GET_RESULTS - 1)
                } else {
                    n.to_string()
                };
                Err(RelqError::MultipleObjectsReturned(format!(
                    "get() returned more than one {} -- it returned {count}!",
                    self.object_name()
                )))
            }
        }
    }

    /// Returns the first row, ordering by primary key when the queryset is
    /// unordered.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and errors reported by `executor`.
    pub fn first(&self, executor: &dyn DbExecutor) -> RelqResult<Option<Row>> {
        let ordered = if self.ordered() {
            self.clone()
        } else {
            self.order_by(["pk"])?
        };
        let mut rows = ordered.slice(None, Some(1))?.fetch(executor)?;
        Ok(if rows.is_empty() {
            None
        } else {
            Some(rows.remove(0))
        })
    }

    /// Counts the matching rows.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and errors reported by `executor`.
    pub fn count(&self, executor: &dyn DbExecutor) -> RelqResult<i64> {
        let _span = query_span(&self.model().label).entered();
        self.query.get_count(executor)
    }

    /// Returns `true` if any row matches.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and errors reported by `executor`.
    pub fn exists(&self, executor: &dyn DbExecutor) -> RelqResult<bool> {
        let _span = query_span(&self.model().label).entered();
        self.query.has_results(executor)
    }

    /// Computes aggregates over the whole result, keyed by alias.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::InvalidValue`] for expressions that are not
    /// aggregates, [`RelqError::NotSupported`] after `distinct(fields)`, and
    /// execution errors.
    pub fn aggregate<S: AsRef<str>>(
        &self,
        executor: &dyn DbExecutor,
        aggregates: Vec<(S, Expression)>,
    ) -> RelqResult<IndexMap<String, Value>> {
        if !self.query.distinct_fields().is_empty() {
            return Err(RelqError::NotSupported(
                "aggregate() + distinct(fields) not implemented.".into(),
            ));
        }
        let _span = query_span(&self.model().label).entered();
        let mut query = self.query.clone();
        let mut added = Vec::with_capacity(aggregates.len());
        for (alias, expr) in aggregates {
            let alias = alias.as_ref();
            query.add_annotation(expr, alias, true)?;
            let is_aggregate = query
                .annotations()
                .get(alias)
                .is_some_and(|a| a.expr.contains_aggregate());
            if !is_aggregate {
                return Err(RelqError::InvalidValue(format!(
                    "{alias} is not an aggregate expression"
                )));
            }
            added.push(alias.to_string());
        }
        query.get_aggregation(executor, &added)
    }
}

impl From<QuerySet> for FilterValue {
    fn from(qs: QuerySet) -> Self {
        Self::Query(Box::new(qs.query))
    }
}

impl ops::BitAnd for QuerySet {
    type Output = RelqResult<Self>;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(&rhs)
    }
}

impl ops::BitOr for QuerySet {
    type Output = RelqResult<Self>;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(&rhs)
    }
}
