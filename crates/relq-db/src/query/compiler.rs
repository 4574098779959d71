//! SQL compiler.
//!
//! [`SqlCompiler`] owns a copy of a [`Query`] and renders it as one
//! parameterized SELECT for a [`DatabaseBackendType`]. Compiling may add joins
//! (ordering by a relation, `select_related`, `DISTINCT ON` a related field),
//! which is why the compiler works on its own copy.
//!
//! Fragments are built with `%s` markers and `%%` for a literal percent sign;
//! the final pass numbers the markers in the placeholder style of the
//! backend (`$1, $2, ...` for PostgreSQL, `?` for SQLite and MySQL).
//!
//! A filter tree that can never match compiles to [`CompiledQuery::Empty`]
//! and is never sent to the database.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use relq_core::{RelqError, RelqResult};

use crate::executor::DbExecutor;
use crate::fields::{FieldDef, FieldType};
use crate::model::{ModelMeta, RelationKind};
use crate::query::custom_lookups::{BuiltinLookup, LookupKind};
use crate::query::expressions::{AggregateFunc, Col, Expression, OrderBy};
use crate::query::filter::SetupJoins;
use crate::query::query::{split_lookup, GroupBy, Query, RelatedTree, SelectRelated};
use crate::query::where_node::{Condition, LookupRhs, WhereChild, WhereNode};
use crate::value::Value;

/// The type of database backend, used by the compiler to generate
/// backend-specific SQL syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseBackendType {
    /// PostgreSQL (uses `$1, $2, ...` placeholders).
    PostgreSQL,
    /// SQLite (uses `?` placeholders).
    SQLite,
    /// MySQL (uses `?` placeholders).
    MySQL,
}

impl DatabaseBackendType {
    /// Parses the vendor name of an engine (`postgresql`, `sqlite3`, `mysql`).
    pub fn from_vendor(vendor: &str) -> Option<Self> {
        match vendor.to_lowercase().as_str() {
            "postgresql" | "postgres" | "postgresql_psycopg2" => Some(Self::PostgreSQL),
            "sqlite3" | "sqlite" => Some(Self::SQLite),
            "mysql" => Some(Self::MySQL),
            _ => None,
        }
    }

    /// The vendor name.
    pub const fn vendor(self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgresql",
            Self::SQLite => "sqlite",
            Self::MySQL => "mysql",
        }
    }

    /// Returns a parameter placeholder for the given 1-based index.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${index}"),
            Self::SQLite | Self::MySQL => "?".to_string(),
        }
    }

    /// Quotes an identifier. Names that are already quoted are returned
    /// unchanged.
    pub fn quote_name(self, name: &str) -> String {
        let quote = match self {
            Self::MySQL => '`',
            Self::PostgreSQL | Self::SQLite => '"',
        };
        if name.len() >= 2 && name.starts_with(quote) && name.ends_with(quote) {
            return name.to_string();
        }
        format!("{quote}{name}{quote}")
    }

    /// The LIMIT used when only an offset is requested, for backends that
    /// need one.
    const fn no_limit_value(self) -> Option<&'static str> {
        match self {
            Self::PostgreSQL => None,
            Self::SQLite => Some("-1"),
            Self::MySQL => Some("18446744073709551615"),
        }
    }

    const fn random_function(self) -> &'static str {
        match self {
            Self::MySQL => "RAND",
            Self::PostgreSQL | Self::SQLite => "RANDOM",
        }
    }
}

// ── Results ─────────────────────────────────────────────────────────

/// `Row` holds a list of column names and their corresponding values. It
/// provides typed access via the [`get`](Row::get) method.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from column names and values.
    ///
    /// # Panics
    ///
    /// Panics if the number of columns does not match the number of values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the values, in column order.
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Consumes the row and returns its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    ///
    /// # Errors
    ///
    /// Returns an error if the column does not exist or the value cannot be
    /// converted to the requested type.
    pub fn get<T: FromValue>(&self, column: &str) -> RelqResult<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c == column)
            .ok_or_else(|| {
                RelqError::DatabaseError(format!("Column '{column}' not found in row"))
            })?;
        T::from_value(&self.values[idx])
    }

    /// Gets a typed value by column index.
    ///
    /// # Errors
    ///
    /// Returns an error if the index is out of bounds or the value cannot be
    /// converted to the requested type.
    pub fn get_by_index<T: FromValue>(&self, idx: usize) -> RelqResult<T> {
        if idx >= self.values.len() {
            return Err(RelqError::DatabaseError(format!(
                "Column index {idx} out of bounds (row has {} columns)",
                self.values.len()
            )));
        }
        T::from_value(&self.values[idx])
    }

    /// Returns a reference to the raw Value at the given column name.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }
}

/// Trait for converting a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> RelqResult<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            _ => Err(RelqError::DatabaseError(format!(
                "Expected Int, got {value:?}"
            ))),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::Int(i) => i32::try_from(*i).map_err(|e| {
                RelqError::DatabaseError(format!("Int value out of i32 range: {e}"))
            }),
            _ => Err(RelqError::DatabaseError(format!(
                "Expected Int, got {value:?}"
            ))),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(RelqError::DatabaseError(format!(
                "Expected Float, got {value:?}"
            ))),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::Bool(b) => Ok(*b),
            _ => Err(RelqError::DatabaseError(format!(
                "Expected Bool, got {value:?}"
            ))),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(RelqError::DatabaseError(format!(
                "Expected String, got {value:?}"
            ))),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            _ => Err(RelqError::DatabaseError(format!(
                "Expected Date, got {value:?}"
            ))),
        }
    }
}

impl FromValue for uuid::Uuid {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::Uuid(u) => Ok(*u),
            _ => Err(RelqError::DatabaseError(format!(
                "Expected Uuid, got {value:?}"
            ))),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> RelqResult<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> RelqResult<Self> {
        match value {
            Value::Null => Ok(None),
            _ => T::from_value(value).map(Some),
        }
    }
}

/// A compiled query.
#[derive(Debug, Clone, PartialEq)]
pub enum CompiledQuery {
    /// SQL text and its parameters, in placeholder order.
    Sql {
        /// The SQL text.
        sql: String,
        /// The bound parameters.
        params: Vec<Value>,
    },
    /// The query provably matches no rows and need not be executed.
    Empty,
}

impl CompiledQuery {
    /// The SQL text, unless the query is empty.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Sql { sql, .. } => Some(sql),
            Self::Empty => None,
        }
    }

    /// The parameters; empty for an empty query.
    pub fn params(&self) -> &[Value] {
        match self {
            Self::Sql { params, .. } => params,
            Self::Empty => &[],
        }
    }

    /// Returns `true` if the query matches no rows.
    pub const fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// The outcome of compiling a filter subtree.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CompiledFilter {
    /// A condition and its parameters.
    Sql(String, Vec<Value>),
    /// Matches no row.
    Empty,
    /// Matches every row; contributes no SQL.
    Everything,
}

/// How many rows the caller wants back from [`SqlCompiler::execute_sql`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultType {
    /// The first row, if any.
    Single,
    /// Every row.
    Multi,
    /// Nothing; the statement's affected-row count is returned.
    NoResults,
}

/// The rows produced by [`SqlCompiler::execute_sql`].
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResult {
    /// For [`ResultType::Single`].
    Single(Option<Row>),
    /// For [`ResultType::Multi`].
    Multi(Vec<Row>),
    /// For [`ResultType::NoResults`].
    Affected(u64),
}

impl QueryResult {
    /// The rows, whatever the result type.
    pub fn into_rows(self) -> Vec<Row> {
        match self {
            Self::Single(row) => row.into_iter().collect(),
            Self::Multi(rows) => rows,
            Self::Affected(_) => Vec::new(),
        }
    }

    /// The first row.
    pub fn into_row(self) -> Option<Row> {
        self.into_rows().into_iter().next()
    }
}

/// Value conversions applied to a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Converter {
    /// Integers to booleans.
    Bool,
    /// ISO strings to dates.
    Date,
    /// ISO strings to date-times.
    DateTime,
    /// ISO strings to times.
    Time,
    /// Strings or 16 bytes to UUIDs.
    Uuid,
    /// Strings to JSON documents.
    Json,
    /// Integers to floats.
    Float,
    /// `COUNT` of no rows is 0, never NULL.
    CountNullToZero,
}

impl Converter {
    /// Converts one value.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::DatabaseError`] when a string does not parse.
    pub fn convert(self, value: Value) -> RelqResult<Value> {
        Ok(match (self, value) {
            (Self::Bool, Value::Int(i)) => Value::Bool(i != 0),
            (Self::Float, Value::Int(i)) => Value::Float(i as f64),
            (Self::CountNullToZero, Value::Null) => Value::Int(0),
            (Self::Date, Value::String(s)) => Value::Date(
                NaiveDate::parse_from_str(&s, "%Y-%m-%d").map_err(|e| conversion_error("date", &s, e))?,
            ),
            (Self::Date, Value::DateTime(dt)) => Value::Date(dt.date()),
            (Self::DateTime, Value::String(s)) => Value::DateTime(
                NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f"))
                    .map_err(|e| conversion_error("datetime", &s, e))?,
            ),
            (Self::Time, Value::String(s)) => Value::Time(
                NaiveTime::parse_from_str(&s, "%H:%M:%S%.f")
                    .map_err(|e| conversion_error("time", &s, e))?,
            ),
            (Self::Uuid, Value::String(s)) => Value::Uuid(
                uuid::Uuid::parse_str(&s).map_err(|e| conversion_error("uuid", &s, e))?,
            ),
            (Self::Uuid, Value::Bytes(b)) => Value::Uuid(
                uuid::Uuid::from_slice(&b).map_err(|e| conversion_error("uuid", "<bytes>", e))?,
            ),
            (Self::Json, Value::String(s)) => Value::Json(
                serde_json::from_str(&s).map_err(|e| conversion_error("json", &s, e))?,
            ),
            (_, other) => other,
        })
    }

    /// The conversions needed for a column of `field_type`.
    pub fn for_field_type(field_type: &FieldType) -> Option<Self> {
        match field_type {
            FieldType::BooleanField => Some(Self::Bool),
            FieldType::DateField => Some(Self::Date),
            FieldType::DateTimeField => Some(Self::DateTime),
            FieldType::TimeField => Some(Self::Time),
            FieldType::UuidField => Some(Self::Uuid),
            FieldType::JsonField => Some(Self::Json),
            FieldType::FloatField | FieldType::DecimalField { .. } => Some(Self::Float),
            _ => None,
        }
    }
}

fn conversion_error(kind: &str, raw: &str, err: impl std::fmt::Display) -> RelqError {
    RelqError::DatabaseError(format!("Cannot convert '{raw}' to {kind}: {err}"))
}

// ── Compiler ────────────────────────────────────────────────────────

/// A column or expression in the select list.
#[derive(Debug, Clone)]
pub struct SelectItem {
    /// The selected expression.
    pub expr: Expression,
    /// The `AS` alias, for annotations and extra selects.
    pub alias: Option<String>,
}

/// Where the columns of each model loaded by a query sit in the select list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlassInfo {
    /// The model label.
    pub model: String,
    /// The relation followed to reach the model; `None` for the queried model.
    pub field: Option<String>,
    /// Set when the relation was followed from its target side.
    pub reverse: bool,
    /// Positions of the model's columns in the select list.
    pub select_fields: Vec<usize>,
    /// Models reached from this one.
    pub related: Vec<KlassInfo>,
}

type Fragment = (String, Vec<Value>);

#[derive(Debug, Clone)]
struct ResolvedOrder {
    expr: Expression,
    descending: bool,
    is_ref: bool,
}

#[derive(Debug, Default)]
struct SqlSetup {
    order_by: Vec<(ResolvedOrder, Fragment)>,
    extra_select: Vec<Expression>,
    where_: Option<WhereNode>,
    having: Option<WhereNode>,
    group_by: Vec<Fragment>,
}

/// The SQL compiler translates a [`Query`] into parameterized SQL.
///
/// Different backends use different placeholder styles:
/// - PostgreSQL: `$1, $2, $3, ...`
/// - SQLite / MySQL: `?, ?, ?, ...`
#[derive(Debug, Clone)]
pub struct SqlCompiler {
    query: Query,
    backend: DatabaseBackendType,
    select: Vec<SelectItem>,
    klass_info: Option<KlassInfo>,
    annotation_col_map: BTreeMap<String, usize>,
    col_count: usize,
}

impl SqlCompiler {
    /// Creates a compiler for `query`.
    pub const fn new(query: Query, backend: DatabaseBackendType) -> Self {
        Self {
            query,
            backend,
            select: Vec::new(),
            klass_info: None,
            annotation_col_map: BTreeMap::new(),
            col_count: 0,
        }
    }

    /// The compiler's copy of the query, including joins added while
    /// compiling.
    pub const fn query(&self) -> &Query {
        &self.query
    }

    /// The target backend.
    pub const fn backend(&self) -> DatabaseBackendType {
        self.backend
    }

    /// The select list of the last compilation.
    pub fn select(&self) -> &[SelectItem] {
        &self.select
    }

    /// Where each loaded model's columns are, after compilation. `None` when
    /// the model's default columns are not selected.
    pub const fn klass_info(&self) -> Option<&KlassInfo> {
        self.klass_info.as_ref()
    }

    /// Positions of the selected annotations.
    pub const fn annotation_col_map(&self) -> &BTreeMap<String, usize> {
        &self.annotation_col_map
    }

    /// Number of columns returned to the caller. Columns added only to
    /// satisfy `SELECT DISTINCT` ordering are not counted.
    pub const fn col_count(&self) -> usize {
        self.col_count
    }

    fn qn(&self, name: &str) -> String {
        self.backend.quote_name(name)
    }

    /// Compiles the query.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for orderings, `select_related` paths
    /// and `DISTINCT ON` fields that do not resolve, and
    /// [`RelqError::NotSupported`] for constructs the backend lacks.
    pub fn as_sql(&mut self) -> RelqResult<CompiledQuery> {
        let compiled = match self.compile_select(true, false)? {
            Some((sql, params)) => CompiledQuery::Sql {
                sql: self.finalize(&sql),
                params,
            },
            None => CompiledQuery::Empty,
        };
        match &compiled {
            CompiledQuery::Sql { sql, params } => {
                tracing::debug!(backend = self.backend.vendor(), %sql, params = params.len(), "compiled query");
            }
            CompiledQuery::Empty => {
                tracing::debug!(model = %self.query.model.label, "query matches no rows");
            }
        }
        Ok(compiled)
    }

    /// Numbers `%s` markers in the backend's placeholder style and turns
    /// `%%` into `%`.
    fn finalize(&self, sql: &str) -> String {
        let mut out = String::with_capacity(sql.len());
        let mut index = 0;
        let mut chars = sql.chars().peekable();
        while let Some(c) = chars.next() {
            if c != '%' {
                out.push(c);
                continue;
            }
            match chars.peek() {
                Some('s') => {
                    chars.next();
                    index += 1;
                    out.push_str(&self.backend.placeholder(index));
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                }
                _ => out.push('%'),
            }
        }
        out
    }

    /// Compiles to a fragment with `%s` markers; `None` when the query
    /// matches no rows.
    pub(crate) fn compile_select(
        &mut self,
        with_limits: bool,
        with_col_aliases: bool,
    ) -> RelqResult<Option<Fragment>> {
        if let Some(inner) = self.query.subquery.clone() {
            return self.compile_aggregate_wrapper(*inner);
        }

        let setup = self.pre_sql_setup()?;
        let distinct_fields = self.get_distinct()?;
        let from = self.get_from_clause();

        let where_ = match &setup.where_ {
            Some(node) => match self.compile_where(node)? {
                CompiledFilter::Empty => return Ok(None),
                CompiledFilter::Everything => None,
                CompiledFilter::Sql(sql, params) => Some((sql, params)),
            },
            None => None,
        };
        let having = match &setup.having {
            Some(node) => match self.compile_where(node)? {
                CompiledFilter::Empty => return Ok(None),
                CompiledFilter::Everything => None,
                CompiledFilter::Sql(sql, params) => Some((sql, params)),
            },
            None => None,
        };

        let mut params = Vec::new();
        let mut result = vec!["SELECT".to_string()];
        if self.query.distinct {
            if distinct_fields.is_empty() {
                result.push("DISTINCT".to_string());
            } else if self.backend == DatabaseBackendType::PostgreSQL {
                result.push(format!("DISTINCT ON ({})", distinct_fields.join(", ")));
            } else {
                return Err(RelqError::NotSupported(
                    "DISTINCT ON fields is not supported by this database backend".into(),
                ));
            }
        }

        let mut out_cols = Vec::new();
        let mut col_idx = 1;
        for item in &self.select {
            let mut sql = self.compile_expr(&item.expr, &mut params)?;
            if let Some(alias) = &item.alias {
                sql = format!("{sql} AS {}", self.qn(alias));
            } else if with_col_aliases {
                sql = format!("{sql} AS {}", self.qn(&format!("Col{col_idx}")));
                col_idx += 1;
            }
            out_cols.push(sql);
        }
        for expr in &setup.extra_select {
            out_cols.push(self.compile_expr(expr, &mut params)?);
        }
        result.push(out_cols.join(", "));
        result.push("FROM".to_string());
        result.extend(from);

        if let Some((sql, where_params)) = where_ {
            result.push(format!("WHERE {sql}"));
            params.extend(where_params);
        }

        let mut order_by: Vec<Fragment> = setup.order_by.into_iter().map(|(_, f)| f).collect();
        if !setup.group_by.is_empty() {
            if !distinct_fields.is_empty() {
                return Err(RelqError::NotSupported(
                    "annotate() + distinct(fields) is not implemented.".into(),
                ));
            }
            let mut grouping = Vec::new();
            for (sql, group_params) in setup.group_by {
                grouping.push(sql);
                params.extend(group_params);
            }
            result.push(format!("GROUP BY {}", grouping.join(", ")));
            if order_by.is_empty() && self.backend == DatabaseBackendType::MySQL {
                order_by.push(("NULL".to_string(), Vec::new()));
            }
        }

        if let Some((sql, having_params)) = having {
            result.push(format!("HAVING {sql}"));
            params.extend(having_params);
        }

        if !order_by.is_empty() {
            let mut ordering = Vec::new();
            for (sql, order_params) in order_by {
                ordering.push(sql);
                params.extend(order_params);
            }
            result.push(format!("ORDER BY {}", ordering.join(", ")));
        }

        if with_limits {
            if let Some(high) = self.query.high_mark {
                result.push(format!("LIMIT {}", high - self.query.low_mark));
            }
            if self.query.low_mark > 0 {
                if self.query.high_mark.is_none() {
                    if let Some(no_limit) = self.backend.no_limit_value() {
                        result.push(format!("LIMIT {no_limit}"));
                    }
                }
                result.push(format!("OFFSET {}", self.query.low_mark));
            }
        }

        if self.query.select_for_update {
            if self.backend == DatabaseBackendType::SQLite {
                tracing::trace!("SELECT ... FOR UPDATE ignored on SQLite");
            } else if self.query.select_for_update_nowait {
                result.push("FOR UPDATE NOWAIT".to_string());
            } else if self.query.select_for_update_skip_locked {
                result.push("FOR UPDATE SKIP LOCKED".to_string());
            } else {
                result.push("FOR UPDATE".to_string());
            }
        }

        Ok(Some((result.join(" "), params)))
    }

    /// Compiles `SELECT <summary aggregates> FROM (<inner>) subquery`.
    fn compile_aggregate_wrapper(&mut self, inner: Query) -> RelqResult<Option<Fragment>> {
        let mut inner_compiler = Self::new(inner, self.backend);
        let Some((inner_sql, inner_params)) = inner_compiler.compile_select(true, true)? else {
            return Ok(None);
        };
        self.select = self
            .query
            .annotation_select()
            .map(|(name, annotation)| SelectItem {
                expr: annotation.expr.clone(),
                alias: Some(name.clone()),
            })
            .collect();
        self.annotation_col_map = self
            .select
            .iter()
            .enumerate()
            .filter_map(|(i, item)| item.alias.clone().map(|a| (a, i)))
            .collect();
        self.col_count = self.select.len();

        let mut params = Vec::new();
        let mut cols = Vec::with_capacity(self.select.len());
        for item in &self.select {
            cols.push(self.compile_expr(&item.expr, &mut params)?);
        }
        params.extend(inner_params);
        Ok(Some((
            format!("SELECT {} FROM ({inner_sql}) subquery", cols.join(", ")),
            params,
        )))
    }

    // ── Setup ───────────────────────────────────────────────────────

    fn pre_sql_setup(&mut self) -> RelqResult<SqlSetup> {
        self.setup_query()?;
        let order_by = self.get_order_by()?;
        let extra_select = self.get_extra_select(&order_by)?;
        let (where_, having) = self.query.where_.split_having(false);
        let group_by = self.get_group_by(&extra_select, &order_by, having.as_ref())?;
        Ok(SqlSetup {
            order_by,
            extra_select,
            where_,
            having,
            group_by,
        })
    }

    fn setup_query(&mut self) -> RelqResult<()> {
        if self.query.alias_map.refcounts().values().all(|count| *count == 0) {
            self.query.get_initial_alias();
        }
        self.get_select()
    }

    /// Builds the select list: extra selects, default or explicit columns,
    /// annotations, then the columns of `select_related` models.
    fn get_select(&mut self) -> RelqResult<()> {
        let mut select: Vec<SelectItem> = self
            .query
            .extra_select()
            .map(|(name, extra)| SelectItem {
                expr: Expression::raw(extra.sql.clone(), extra.params.clone()),
                alias: Some(name.clone()),
            })
            .collect();

        let mut klass_info = None;
        if self.query.default_cols {
            let mut select_fields = Vec::new();
            for col in self.get_default_columns(None, None, None)? {
                select_fields.push(select.len());
                select.push(SelectItem {
                    expr: Expression::Col(col),
                    alias: None,
                });
            }
            klass_info = Some(KlassInfo {
                model: self.query.model.label.clone(),
                field: None,
                reverse: false,
                select_fields,
                related: Vec::new(),
            });
        }
        for col in &self.query.select {
            select.push(SelectItem {
                expr: Expression::Col(col.clone()),
                alias: None,
            });
        }

        let mut annotation_col_map = BTreeMap::new();
        for (name, annotation) in self.query.annotation_select() {
            annotation_col_map.insert(name.clone(), select.len());
            select.push(SelectItem {
                expr: annotation.expr.clone(),
                alias: Some(name.clone()),
            });
        }
        self.select = select;

        if let Some(info) = &mut klass_info {
            let requested = match &self.query.select_related {
                SelectRelated::Off => None,
                SelectRelated::All => Some(None),
                SelectRelated::Fields(tree) => Some(Some(tree.clone())),
            };
            if let Some(requested) = requested {
                let opts = Arc::clone(&self.query.model);
                let root = self.query.get_initial_alias();
                info.related = self.get_related_selections(&opts, &root, 1, requested.as_ref())?;
            }
        }
        self.klass_info = klass_info;
        self.annotation_col_map = annotation_col_map;
        self.col_count = self.select.len();
        Ok(())
    }

    /// The concrete columns of `opts` (the query's model by default),
    /// honoring deferred loading and joining parent tables as needed.
    ///
    /// With `from_parent`, fields of `from_parent` and its ancestors are
    /// skipped since the parent row is already loaded.
    fn get_default_columns(
        &mut self,
        start_alias: Option<String>,
        opts: Option<Arc<ModelMeta>>,
        from_parent: Option<&Arc<ModelMeta>>,
    ) -> RelqResult<Vec<Col>> {
        let opts = opts.unwrap_or_else(|| Arc::clone(&self.query.model));
        let start_alias = match start_alias {
            Some(alias) => alias,
            None => self.query.get_initial_alias(),
        };
        let only_load = self.query.get_loaded_field_names()?;
        let ctx = Arc::clone(&self.query.ctx);
        let registry = ctx.models();
        let mut seen = BTreeMap::new();
        let mut cols = Vec::new();
        for (owner, field) in registry.all_concrete_fields(&opts) {
            if let Some(parent) = from_parent {
                let inherited = owner.label != opts.label
                    && (owner.label == parent.label
                        || !registry.base_chain(parent, &owner.label).is_empty());
                if inherited {
                    continue;
                }
            }
            if let Some(loaded) = only_load.get(&owner.label) {
                if !loaded.contains(field.attname()) {
                    continue;
                }
            }
            let alias = self
                .query
                .join_parent_model(&opts, &owner.label, &start_alias, &mut seen)?;
            cols.push(Col::new(alias, field));
        }
        Ok(cols)
    }

    /// Joins and selects the models followed by `select_related`.
    ///
    /// `requested` is `None` to follow every non-null foreign key up to the
    /// query's maximum depth, or the tree of relations to follow.
    fn get_related_selections(
        &mut self,
        opts: &Arc<ModelMeta>,
        root_alias: &str,
        cur_depth: usize,
        requested: Option<&RelatedTree>,
    ) -> RelqResult<Vec<KlassInfo>> {
        let restricted = requested.is_some();
        if !restricted && cur_depth > self.query.max_depth {
            return Ok(Vec::new());
        }
        let only_load = self.query.get_loaded_field_names()?;
        let ctx = Arc::clone(&self.query.ctx);
        let registry = ctx.models();
        let mut infos = Vec::new();
        let mut found = BTreeSet::new();

        for (owner, field) in registry.all_concrete_fields(opts) {
            found.insert(field.name.clone());
            let next = requested.and_then(|r| r.0.get(&field.name));
            if restricted && !field.is_relation() && next.is_some() {
                return Err(RelqError::FieldError(format!(
                    "Non-relational field given in select_related: '{}'. Choices are: {}",
                    field.name,
                    related_choices(&ctx, opts)
                )));
            }
            if !select_related_descend(&field, requested, only_load.get(&owner.label), None)? {
                continue;
            }
            let Some(target) = field.field_type.related_model() else {
                continue;
            };
            let target = registry.require(target)?;
            let alias = match self.query.setup_joins(
                &[field.name.clone()],
                opts,
                root_alias,
                None,
                true,
            )? {
                SetupJoins::Joined(info) => info.joins.last().cloned().unwrap_or_default(),
                SetupJoins::RequiresSubquery(_) => continue,
            };
            let columns = self.get_default_columns(Some(alias.clone()), Some(Arc::clone(&target)), None)?;
            let select_fields = self.push_columns(columns);
            let next = requested.map(|_| next.cloned().unwrap_or_default());
            let related =
                self.get_related_selections(&target, &alias, cur_depth + 1, next.as_ref())?;
            infos.push(KlassInfo {
                model: target.label.clone(),
                field: Some(field.name.clone()),
                reverse: false,
                select_fields,
                related,
            });
        }

        let Some(requested) = requested else {
            return Ok(infos);
        };
        for relation in opts.related_objects() {
            if relation.kind != RelationKind::OneToOne {
                continue;
            }
            let model = registry.require(&relation.related_model)?;
            let Some(fk) = model.local_field(&relation.field_name).cloned() else {
                continue;
            };
            if !select_related_descend(
                &fk,
                Some(requested),
                only_load.get(&model.label),
                Some(&relation.name),
            )? {
                continue;
            }
            found.insert(relation.name.clone());
            let alias = match self.query.setup_joins(
                &[relation.name.clone()],
                opts,
                root_alias,
                None,
                true,
            )? {
                SetupJoins::Joined(info) => info.joins.last().cloned().unwrap_or_default(),
                SetupJoins::RequiresSubquery(_) => continue,
            };
            let columns =
                self.get_default_columns(Some(alias.clone()), Some(Arc::clone(&model)), Some(opts))?;
            let select_fields = self.push_columns(columns);
            let next = requested.0.get(&relation.name).cloned().unwrap_or_default();
            let related = self.get_related_selections(&model, &alias, cur_depth + 1, Some(&next))?;
            infos.push(KlassInfo {
                model: model.label.clone(),
                field: Some(relation.name.clone()),
                reverse: true,
                select_fields,
                related,
            });
        }

        let missing: Vec<String> = requested
            .0
            .keys()
            .filter(|name| !found.contains(*name))
            .map(|name| format!("'{name}'"))
            .collect();
        if !missing.is_empty() {
            return Err(RelqError::FieldError(format!(
                "Invalid field name(s) given in select_related: {}. Choices are: {}",
                missing.join(", "),
                related_choices(&ctx, opts)
            )));
        }
        Ok(infos)
    }

    fn push_columns(&mut self, columns: Vec<Col>) -> Vec<usize> {
        columns
            .into_iter()
            .map(|col| {
                self.select.push(SelectItem {
                    expr: Expression::Col(col),
                    alias: None,
                });
                self.select.len() - 1
            })
            .collect()
    }

    // ── Ordering ────────────────────────────────────────────────────

    /// Resolves the ordering: `extra(order_by=...)` first, then the explicit
    /// ordering, then the model's default ordering.
    fn get_order_by(&mut self) -> RelqResult<Vec<(ResolvedOrder, Fragment)>> {
        let ordering: Vec<OrderBy> = if !self.query.extra_order_by.is_empty() {
            self.query
                .extra_order_by
                .iter()
                .cloned()
                .map(OrderBy::Name)
                .collect()
        } else if !self.query.default_ordering || !self.query.order_by.is_empty() {
            self.query.order_by.clone()
        } else {
            self.query
                .model
                .ordering
                .iter()
                .cloned()
                .map(OrderBy::Name)
                .collect()
        };
        let default_desc = !self.query.standard_ordering;

        let mut resolved = Vec::new();
        for item in ordering {
            let name = match item {
                OrderBy::Expression { expr, descending } => {
                    let expr = self.query.resolve_expression(expr, true, None, false)?;
                    resolved.push(ResolvedOrder {
                        expr,
                        descending: descending != default_desc,
                        is_ref: false,
                    });
                    continue;
                }
                OrderBy::Name(name) => name,
            };
            if name == "?" {
                resolved.push(ResolvedOrder {
                    expr: Expression::func(self.backend.random_function(), Vec::new()),
                    descending: false,
                    is_ref: false,
                });
                continue;
            }
            let (col, descending) = order_dir(&name, default_desc);
            if self.query.annotation_select().any(|(n, _)| n == col) {
                resolved.push(ResolvedOrder {
                    expr: Expression::Ref(col.to_string()),
                    descending,
                    is_ref: true,
                });
                continue;
            }
            if let Some(annotation) = self.query.annotations.get(col) {
                resolved.push(ResolvedOrder {
                    expr: annotation.expr.clone(),
                    descending,
                    is_ref: false,
                });
                continue;
            }
            if let Some((table, column)) = col.split_once('.') {
                resolved.push(ResolvedOrder {
                    expr: Expression::raw(format!("{}.{column}", self.qn(table)), Vec::new()),
                    descending,
                    is_ref: false,
                });
                continue;
            }
            if self.query.extra_select().any(|(n, _)| n == col) {
                resolved.push(ResolvedOrder {
                    expr: Expression::Ref(col.to_string()),
                    descending,
                    is_ref: true,
                });
                continue;
            }
            if let Some(extra) = self.query.extra.get(col) {
                resolved.push(ResolvedOrder {
                    expr: Expression::raw(extra.sql.clone(), extra.params.clone()),
                    descending,
                    is_ref: false,
                });
                continue;
            }
            let opts = Arc::clone(&self.query.model);
            let mut already_seen = BTreeSet::new();
            resolved.extend(self.find_ordering_name(col, descending, &opts, None, &mut already_seen)?);
        }

        let mut out: Vec<(ResolvedOrder, Fragment)> = Vec::new();
        let mut seen: Vec<Fragment> = Vec::new();
        for order in resolved {
            let mut params = Vec::new();
            let sql = self.compile_expr(&order.expr, &mut params)?;
            let key = (sql.clone(), params.clone());
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
            let direction = if order.descending { "DESC" } else { "ASC" };
            out.push((order, (format!("{sql} {direction}"), params)));
        }
        Ok(out)
    }

    /// Orders by a field path. A relation to a model with a default ordering
    /// is ordered by that ordering instead of by its key.
    fn find_ordering_name(
        &mut self,
        name: &str,
        descending: bool,
        opts: &Arc<ModelMeta>,
        alias: Option<String>,
        already_seen: &mut BTreeSet<Vec<Vec<(String, String)>>>,
    ) -> RelqResult<Vec<ResolvedOrder>> {
        let pieces = split_lookup(name);
        let alias = match alias {
            Some(alias) => alias,
            None => self.query.get_initial_alias(),
        };
        let info = match self.query.setup_joins(&pieces, opts, &alias, None, true)? {
            SetupJoins::Joined(info) => info,
            SetupJoins::RequiresSubquery(_) => {
                return Err(RelqError::FieldError(format!(
                    "Cannot order by '{name}'"
                )));
            }
        };
        let is_attname = info
            .final_field
            .field_def()
            .is_some_and(|f| f.attname() == name);
        if info.final_field.is_relation() && !info.opts.ordering.is_empty() && !is_attname {
            let join_tuple: Vec<Vec<(String, String)>> = info
                .joins
                .iter()
                .map(|j| {
                    self.query
                        .alias_map
                        .get(j)
                        .map(|join| join.join_cols.clone())
                        .unwrap_or_default()
                })
                .collect();
            if !already_seen.insert(join_tuple) {
                return Err(RelqError::FieldError("Infinite loop caused by ordering.".into()));
            }
            let last = info.joins.last().cloned();
            let mut results = Vec::new();
            for item in &info.opts.ordering {
                let (item_name, item_desc) = order_dir(item, descending);
                results.extend(self.find_ordering_name(
                    item_name,
                    item_desc,
                    &info.opts,
                    last.clone(),
                    already_seen,
                )?);
            }
            return Ok(results);
        }
        let (targets, alias, _) = self.query.trim_joins(info.targets, info.joins, &info.path);
        Ok(targets
            .into_iter()
            .map(|target| ResolvedOrder {
                expr: Expression::Col(Col::new(alias.clone(), target)),
                descending,
                is_ref: false,
            })
            .collect())
    }

    /// Ordering columns that `SELECT DISTINCT` must also select.
    fn get_extra_select(
        &self,
        order_by: &[(ResolvedOrder, Fragment)],
    ) -> RelqResult<Vec<Expression>> {
        if !self.query.distinct || !self.query.distinct_fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut selected = Vec::new();
        for item in &self.select {
            let mut params = Vec::new();
            let sql = self.compile_expr(&item.expr, &mut params)?;
            selected.push((sql, params));
        }
        let mut extra = Vec::new();
        for (order, _) in order_by {
            if order.is_ref {
                continue;
            }
            let mut params = Vec::new();
            let sql = self.compile_expr(&order.expr, &mut params)?;
            let key = (sql, params);
            if !selected.contains(&key) {
                selected.push(key);
                extra.push(order.expr.clone());
            }
        }
        Ok(extra)
    }

    // ── Grouping ────────────────────────────────────────────────────

    /// The GROUP BY list: the explicit expressions, the non-aggregate parts of
    /// the select list and ordering, and the columns HAVING refers to.
    /// Duplicates are removed by their SQL.
    fn get_group_by(
        &self,
        extra_select: &[Expression],
        order_by: &[(ResolvedOrder, Fragment)],
        having: Option<&WhereNode>,
    ) -> RelqResult<Vec<Fragment>> {
        let mut expressions = match &self.query.group_by {
            GroupBy::None => return Ok(Vec::new()),
            GroupBy::All => Vec::new(),
            GroupBy::Exprs(exprs) => exprs.clone(),
        };
        for item in &self.select {
            expressions.extend(select_group_by_cols(&item.expr));
        }
        for expr in extra_select {
            expressions.extend(select_group_by_cols(expr));
        }
        for (order, _) in order_by {
            if order.is_ref || order.expr.contains_aggregate() {
                continue;
            }
            expressions.extend(select_group_by_cols(&order.expr));
        }
        if let Some(having) = having {
            expressions.extend(where_group_by_cols(having));
        }

        let mut out: Vec<Fragment> = Vec::new();
        for expr in &expressions {
            let mut params = Vec::new();
            let sql = self.compile_expr(expr, &mut params)?;
            let fragment = (sql, params);
            if !out.contains(&fragment) {
                out.push(fragment);
            }
        }
        Ok(out)
    }

    fn get_distinct(&mut self) -> RelqResult<Vec<String>> {
        let mut result = Vec::new();
        let opts = Arc::clone(&self.query.model);
        for name in self.query.distinct_fields.clone() {
            if self.query.annotation_select().any(|(n, _)| *n == name) {
                result.push(self.qn(&name));
                continue;
            }
            let parts = split_lookup(&name);
            let alias = self.query.get_initial_alias();
            let info = match self.query.setup_joins(&parts, &opts, &alias, None, true)? {
                SetupJoins::Joined(info) => info,
                SetupJoins::RequiresSubquery(_) => {
                    return Err(RelqError::FieldError(format!(
                        "Cannot use '{name}' in distinct()"
                    )));
                }
            };
            let (targets, alias, _) = self.query.trim_joins(info.targets, info.joins, &info.path);
            for target in targets {
                result.push(format!("{}.{}", self.qn(&alias), self.qn(&target.column)));
            }
        }
        Ok(result)
    }

    // ── FROM ────────────────────────────────────────────────────────

    /// The tables and joins of the FROM clause. Aliases no longer referenced
    /// are left out.
    fn get_from_clause(&mut self) -> Vec<String> {
        let mut result = Vec::new();
        for alias in self.query.alias_map.aliases() {
            if self.query.alias_map.refcount(&alias) == 0 {
                continue;
            }
            let Some(join) = self.query.alias_map.get(&alias) else {
                continue;
            };
            let alias_str = if alias == join.table_name {
                String::new()
            } else {
                format!(" {}", self.qn(&alias))
            };
            match (&join.parent_alias, join.join_type) {
                (Some(parent), Some(join_type)) => {
                    let conditions: Vec<String> = join
                        .join_cols
                        .iter()
                        .map(|(lhs, rhs)| {
                            format!(
                                "{}.{} = {}.{}",
                                self.qn(parent),
                                self.qn(lhs),
                                self.qn(&alias),
                                self.qn(rhs)
                            )
                        })
                        .collect();
                    result.push(format!(
                        "{} {}{alias_str} ON ({})",
                        join_type.sql_keyword(),
                        self.qn(&join.table_name),
                        conditions.join(" AND ")
                    ));
                }
                _ => {
                    let table = format!("{}{alias_str}", self.qn(&join.table_name));
                    if result.is_empty() {
                        result.push(table);
                    } else {
                        result.push(format!(", {table}"));
                    }
                }
            }
        }
        for table in self.query.extra_tables.clone() {
            let (alias, _) = self.query.alias_map.table_alias(&table, false);
            if self.query.alias_map.refcount(&alias) == 1 {
                result.push(format!(", {}", self.qn(&alias)));
            }
        }
        result
    }

    // ── WHERE ───────────────────────────────────────────────────────

    /// Compiles a filter tree.
    ///
    /// An AND node matches nothing as soon as one child matches nothing and
    /// everything once all children match everything; an OR node the other
    /// way around. Negation swaps the two outcomes.
    pub(crate) fn compile_where(&self, node: &WhereNode) -> RelqResult<CompiledFilter> {
        let (mut full_needed, mut empty_needed) = match node.connector {
            crate::query::where_node::Connector::And => (node.children.len(), 1),
            crate::query::where_node::Connector::Or => (1, node.children.len()),
        };
        let mut result = Vec::new();
        let mut params = Vec::new();
        for child in &node.children {
            match self.compile_where_child(child)? {
                CompiledFilter::Empty => empty_needed -= 1,
                CompiledFilter::Everything => full_needed -= 1,
                CompiledFilter::Sql(sql, child_params) => {
                    result.push(sql);
                    params.extend(child_params);
                }
            }
            if empty_needed == 0 {
                return Ok(if node.negated {
                    CompiledFilter::Everything
                } else {
                    CompiledFilter::Empty
                });
            }
            if full_needed == 0 {
                return Ok(if node.negated {
                    CompiledFilter::Empty
                } else {
                    CompiledFilter::Everything
                });
            }
        }
        if result.is_empty() {
            return Ok(CompiledFilter::Everything);
        }
        let joined = result.join(&format!(" {} ", node.connector.sql()));
        let sql = if node.negated {
            format!("NOT ({joined})")
        } else if result.len() > 1 {
            format!("({joined})")
        } else {
            joined
        };
        Ok(CompiledFilter::Sql(sql, params))
    }

    fn compile_where_child(&self, child: &WhereChild) -> RelqResult<CompiledFilter> {
        match child {
            WhereChild::Node(node) => self.compile_where(node),
            WhereChild::Condition(cond) => self.compile_condition(cond),
            WhereChild::Nothing => Ok(CompiledFilter::Empty),
            WhereChild::Extra(extra) => {
                if extra.sqls.is_empty() {
                    return Ok(CompiledFilter::Everything);
                }
                let sql = extra
                    .sqls
                    .iter()
                    .map(|s| format!("({s})"))
                    .collect::<Vec<_>>()
                    .join(" AND ");
                Ok(CompiledFilter::Sql(sql, extra.params.clone()))
            }
        }
    }

    fn compile_condition(&self, cond: &Condition) -> RelqResult<CompiledFilter> {
        let mut params = Vec::new();
        let lhs = self.compile_expr(&cond.lhs, &mut params)?;
        let lookup = match &cond.lookup {
            LookupKind::Builtin(lookup) => *lookup,
            LookupKind::Custom(custom) => {
                let Some(rhs) = self.compile_plain_rhs(&cond.rhs, &mut params)? else {
                    return Ok(CompiledFilter::Empty);
                };
                return Ok(CompiledFilter::Sql(custom.compile(&lhs, &rhs), params));
            }
        };

        let sql = match lookup {
            BuiltinLookup::IsNull => {
                let is_null = cond.rhs.as_bool().ok_or_else(|| {
                    RelqError::InvalidValue("The QuerySet value for an isnull lookup must be True or False.".into())
                })?;
                if is_null {
                    format!("{lhs} IS NULL")
                } else {
                    format!("{lhs} IS NOT NULL")
                }
            }
            BuiltinLookup::In => match &cond.rhs {
                LookupRhs::List(items) => {
                    let items: Vec<&Value> = items.iter().filter(|v| !v.is_null()).collect();
                    if items.is_empty() {
                        return Ok(CompiledFilter::Empty);
                    }
                    let marks = vec!["%s"; items.len()].join(", ");
                    params.extend(items.into_iter().cloned());
                    format!("{lhs} IN ({marks})")
                }
                other => {
                    let Some(rhs) = self.compile_plain_rhs(other, &mut params)? else {
                        return Ok(CompiledFilter::Empty);
                    };
                    if matches!(other, LookupRhs::Value(_)) {
                        format!("{lhs} IN ({rhs})")
                    } else {
                        format!("{lhs} IN {rhs}")
                    }
                }
            },
            BuiltinLookup::Range => match &cond.rhs {
                LookupRhs::Range(low, high) => {
                    params.push(low.clone());
                    params.push(high.clone());
                    format!("{lhs} BETWEEN %s AND %s")
                }
                _ => {
                    return Err(RelqError::InvalidValue(
                        "The range lookup requires a pair of values".into(),
                    ))
                }
            },
            BuiltinLookup::Contains
            | BuiltinLookup::IContains
            | BuiltinLookup::StartsWith
            | BuiltinLookup::IStartsWith
            | BuiltinLookup::EndsWith
            | BuiltinLookup::IEndsWith => self.compile_pattern(lookup, &lhs, &cond.rhs, &mut params)?,
            BuiltinLookup::Regex | BuiltinLookup::IRegex => {
                let Some(rhs) = self.compile_plain_rhs(&cond.rhs, &mut params)? else {
                    return Ok(CompiledFilter::Empty);
                };
                let insensitive = lookup == BuiltinLookup::IRegex;
                match (self.backend, insensitive) {
                    (DatabaseBackendType::PostgreSQL, false) => format!("{lhs} ~ {rhs}"),
                    (DatabaseBackendType::PostgreSQL, true) => format!("{lhs} ~* {rhs}"),
                    (DatabaseBackendType::SQLite, false) => format!("{lhs} REGEXP {rhs}"),
                    (DatabaseBackendType::SQLite, true) => format!("{lhs} REGEXP '(?i)' || {rhs}"),
                    (DatabaseBackendType::MySQL, false) => format!("{lhs} REGEXP BINARY {rhs}"),
                    (DatabaseBackendType::MySQL, true) => format!("{lhs} REGEXP {rhs}"),
                }
            }
            BuiltinLookup::IExact => {
                let Some(rhs) = self.compile_plain_rhs(&cond.rhs, &mut params)? else {
                    return Ok(CompiledFilter::Empty);
                };
                format!("LOWER({lhs}) = LOWER({rhs})")
            }
            BuiltinLookup::Exact
            | BuiltinLookup::Gt
            | BuiltinLookup::Gte
            | BuiltinLookup::Lt
            | BuiltinLookup::Lte => {
                let Some(rhs) = self.compile_plain_rhs(&cond.rhs, &mut params)? else {
                    return Ok(CompiledFilter::Empty);
                };
                let op = match lookup {
                    BuiltinLookup::Gt => ">",
                    BuiltinLookup::Gte => ">=",
                    BuiltinLookup::Lt => "<",
                    BuiltinLookup::Lte => "<=",
                    _ => "=",
                };
                format!("{lhs} {op} {rhs}")
            }
        };
        Ok(CompiledFilter::Sql(sql, params))
    }

    /// Compiles a right-hand side as a single SQL operand. Subqueries are
    /// parenthesized; `None` means the operand is a subquery matching no
    /// rows.
    fn compile_plain_rhs(
        &self,
        rhs: &LookupRhs,
        params: &mut Vec<Value>,
    ) -> RelqResult<Option<String>> {
        Ok(Some(match rhs {
            LookupRhs::Value(value) => {
                params.push(value.clone());
                "%s".to_string()
            }
            LookupRhs::List(items) => {
                params.extend(items.iter().cloned());
                format!("({})", vec!["%s"; items.len()].join(", "))
            }
            LookupRhs::Range(low, high) => {
                params.push(low.clone());
                params.push(high.clone());
                "%s AND %s".to_string()
            }
            LookupRhs::Expression(expr) => self.compile_expr(expr, params)?,
            LookupRhs::Query(query) => {
                let mut query = (**query).clone();
                if !query.is_sliced() {
                    query.clear_ordering(true);
                }
                let Some((sql, sub_params)) = Self::new(query, self.backend).compile_select(true, false)? else {
                    return Ok(None);
                };
                params.extend(sub_params);
                format!("({sql})")
            }
        }))
    }

    fn compile_pattern(
        &self,
        lookup: BuiltinLookup,
        lhs: &str,
        rhs: &LookupRhs,
        params: &mut Vec<Value>,
    ) -> RelqResult<String> {
        let insensitive = matches!(
            lookup,
            BuiltinLookup::IContains | BuiltinLookup::IStartsWith | BuiltinLookup::IEndsWith
        );
        let (prefix, suffix) = match lookup {
            BuiltinLookup::StartsWith | BuiltinLookup::IStartsWith => ("", "%"),
            BuiltinLookup::EndsWith | BuiltinLookup::IEndsWith => ("%", ""),
            _ => ("%", "%"),
        };
        let pattern = match rhs {
            LookupRhs::Value(value) => {
                let text = value.as_str().map_or_else(|| value.to_string(), str::to_string);
                params.push(Value::String(format!("{prefix}{}{suffix}", escape_like(&text))));
                "%s".to_string()
            }
            LookupRhs::Expression(expr) => {
                let operand = self.compile_expr(expr, params)?;
                let prefix = prefix.replace('%', "%%");
                let suffix = suffix.replace('%', "%%");
                if self.backend == DatabaseBackendType::MySQL {
                    format!("CONCAT('{prefix}', {operand}, '{suffix}')")
                } else {
                    let mut parts = Vec::new();
                    if !prefix.is_empty() {
                        parts.push(format!("'{prefix}'"));
                    }
                    parts.push(operand);
                    if !suffix.is_empty() {
                        parts.push(format!("'{suffix}'"));
                    }
                    parts.join(" || ")
                }
            }
            _ => {
                return Err(RelqError::InvalidValue(format!(
                    "The {} lookup requires a single value",
                    lookup.name()
                )))
            }
        };
        Ok(match (self.backend, insensitive) {
            (DatabaseBackendType::PostgreSQL, false) => format!("{lhs} LIKE {pattern}"),
            (DatabaseBackendType::PostgreSQL, true) => format!("{lhs} ILIKE {pattern}"),
            (DatabaseBackendType::SQLite, false) => format!("{lhs} LIKE {pattern} ESCAPE '\\'"),
            (DatabaseBackendType::SQLite, true) => {
                format!("LOWER({lhs}) LIKE LOWER({pattern}) ESCAPE '\\'")
            }
            (DatabaseBackendType::MySQL, false) => format!("{lhs} LIKE BINARY {pattern}"),
            (DatabaseBackendType::MySQL, true) => format!("LOWER({lhs}) LIKE LOWER({pattern})"),
        })
    }

    // ── Expressions ─────────────────────────────────────────────────

    /// Compiles an expression, appending its parameters to `params`.
    pub(crate) fn compile_expr(&self, expr: &Expression, params: &mut Vec<Value>) -> RelqResult<String> {
        Ok(match expr {
            Expression::F(name) => {
                return Err(RelqError::FieldError(format!(
                    "Unresolved reference F({name}) cannot be compiled"
                )))
            }
            Expression::Col(col) => format!("{}.{}", self.qn(&col.alias), self.qn(col.column())),
            Expression::Ref(name) => self.qn(name),
            Expression::Value(Value::Null) => "NULL".to_string(),
            Expression::Value(value) => {
                params.push(value.clone());
                "%s".to_string()
            }
            Expression::Star => "*".to_string(),
            Expression::Aggregate {
                func,
                expr,
                distinct,
            } => {
                if self.backend == DatabaseBackendType::SQLite
                    && matches!(func, AggregateFunc::StdDev | AggregateFunc::Variance)
                {
                    return Err(RelqError::NotSupported(format!(
                        "{} is not available on SQLite",
                        func.sql_name()
                    )));
                }
                let inner = self.compile_expr(expr, params)?;
                let distinct = if *distinct { "DISTINCT " } else { "" };
                format!("{}({distinct}{inner})", func.sql_name())
            }
            Expression::Func { name, args, .. } => {
                let mut compiled = Vec::with_capacity(args.len());
                for arg in args {
                    compiled.push(self.compile_expr(arg, params)?);
                }
                format!("{name}({})", compiled.join(", "))
            }
            Expression::Transform { name, lhs } => {
                let transform = self.query.ctx.lookups().get_transform(name).ok_or_else(|| {
                    RelqError::FieldError(format!("Unknown transform '{name}'"))
                })?;
                let lhs = self.compile_expr(lhs, params)?;
                transform
                    .sql_template(self.backend)
                    .replace('%', "%%")
                    .replace("{column}", &lhs)
            }
            Expression::Arithmetic { op, lhs, rhs } => {
                let lhs = self.compile_expr(lhs, params)?;
                let rhs = self.compile_expr(rhs, params)?;
                format!("({lhs} {} {rhs})", op.sql())
            }
            Expression::RawSql { sql, params: raw } => {
                params.extend(raw.iter().cloned());
                format!("({sql})")
            }
            Expression::Subquery(query) => {
                match Self::new((**query).clone(), self.backend).compile_select(true, false)? {
                    Some((sql, sub_params)) => {
                        params.extend(sub_params);
                        format!("({sql})")
                    }
                    None => "NULL".to_string(),
                }
            }
        })
    }

    // ── Execution ───────────────────────────────────────────────────

    /// The converters of each returned column.
    pub fn get_converters(&self) -> Vec<Vec<Converter>> {
        self.select
            .iter()
            .take(self.col_count)
            .map(|item| {
                let mut converters = Vec::new();
                if matches!(
                    item.expr,
                    Expression::Aggregate {
                        func: AggregateFunc::Count,
                        ..
                    }
                ) {
                    converters.push(Converter::CountNullToZero);
                }
                if let Some(converter) = self
                    .query
                    .expression_output(&item.expr)
                    .as_ref()
                    .and_then(Converter::for_field_type)
                {
                    converters.push(converter);
                }
                converters
            })
            .collect()
    }

    /// Converts the values of a row and drops columns selected only for
    /// `SELECT DISTINCT` ordering.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::DatabaseError`] when a value does not convert.
    pub fn apply_converters(&self, row: Row, converters: &[Vec<Converter>]) -> RelqResult<Row> {
        let keep = if self.col_count == 0 { row.len() } else { self.col_count.min(row.len()) };
        let Row { columns, values } = row;
        let mut out = Vec::with_capacity(keep);
        for (pos, value) in values.into_iter().take(keep).enumerate() {
            let mut value = value;
            for converter in converters.get(pos).map_or(&[][..], Vec::as_slice) {
                value = converter.convert(value)?;
            }
            out.push(value);
        }
        Ok(Row::new(columns.into_iter().take(keep).collect(), out))
    }

    /// Compiles and runs the query.
    ///
    /// A query matching no rows is answered without a database round trip.
    ///
    /// # Errors
    ///
    /// Returns compilation errors and errors reported by `executor`.
    pub fn execute_sql(
        &mut self,
        executor: &dyn DbExecutor,
        result_type: ResultType,
    ) -> RelqResult<QueryResult> {
        let (sql, params) = match self.as_sql()? {
            CompiledQuery::Sql { sql, params } => (sql, params),
            CompiledQuery::Empty => {
                return Ok(match result_type {
                    ResultType::Single => QueryResult::Single(None),
                    ResultType::Multi => QueryResult::Multi(Vec::new()),
                    ResultType::NoResults => QueryResult::Affected(0),
                });
            }
        };
        if executor.backend_type() != self.backend {
            tracing::warn!(
                compiled_for = self.backend.vendor(),
                executor = executor.backend_type().vendor(),
                "executing SQL compiled for another backend"
            );
        }
        if result_type == ResultType::NoResults {
            return Ok(QueryResult::Affected(executor.execute_sql(&sql, &params)?));
        }
        let rows = executor.query(&sql, &params)?;
        let converters = self.get_converters();
        let mut converted = Vec::with_capacity(rows.len());
        for row in rows {
            converted.push(self.apply_converters(row, &converters)?);
        }
        Ok(match result_type {
            ResultType::Single => QueryResult::Single(converted.into_iter().next()),
            _ => QueryResult::Multi(converted),
        })
    }

    /// Returns `true` if the query returns at least one row.
    ///
    /// # Errors
    ///
    /// See [`execute_sql`](Self::execute_sql).
    pub fn has_results(&mut self, executor: &dyn DbExecutor) -> RelqResult<bool> {
        Ok(self.execute_sql(executor, ResultType::Single)?.into_row().is_some())
    }
}

/// Splits a leading `-` (descending) or `+` off an ordering name. The
/// direction is relative to `default_desc`.
fn order_dir(name: &str, default_desc: bool) -> (&str, bool) {
    if let Some(rest) = name.strip_prefix('-') {
        (rest, !default_desc)
    } else if let Some(rest) = name.strip_prefix('+') {
        (rest, default_desc)
    } else {
        (name, default_desc)
    }
}

/// Escapes the LIKE wildcards of a literal.
fn escape_like(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn select_group_by_cols(expr: &Expression) -> Vec<Expression> {
    match expr {
        Expression::RawSql { .. } => vec![expr.clone()],
        other => other.group_by_cols(),
    }
}

fn where_group_by_cols(node: &WhereNode) -> Vec<Expression> {
    let mut cols = Vec::new();
    for child in &node.children {
        match child {
            WhereChild::Node(inner) => cols.extend(where_group_by_cols(inner)),
            WhereChild::Condition(cond) => {
                cols.extend(cond.lhs.group_by_cols());
                if let LookupRhs::Expression(rhs) = &cond.rhs {
                    cols.extend(rhs.group_by_cols());
                }
            }
            WhereChild::Nothing | WhereChild::Extra(_) => {}
        }
    }
    cols
}

/// Whether `select_related` follows `field`. `reverse_name` is set when the
/// relation is followed from its target model.
fn select_related_descend(
    field: &FieldDef,
    requested: Option<&RelatedTree>,
    load_fields: Option<&BTreeSet<String>>,
    reverse_name: Option<&str>,
) -> RelqResult<bool> {
    if !field.is_relation() || field.is_many_to_many() {
        return Ok(false);
    }
    if field.is_parent_link() && reverse_name.is_none() {
        return Ok(false);
    }
    let name = reverse_name.unwrap_or(&field.name);
    if let Some(requested) = requested {
        if !requested.0.contains_key(name) {
            return Ok(false);
        }
    } else if field.null {
        return Ok(false);
    }
    if let Some(load_fields) = load_fields {
        if !load_fields.contains(field.attname()) {
            if requested.is_some() {
                return Err(RelqError::FieldError(format!(
                    "Field {name} cannot be both deferred and traversed using select_related at the same time."
                )));
            }
            return Ok(false);
        }
    }
    Ok(true)
}

fn related_choices(ctx: &crate::context::QueryContext, opts: &ModelMeta) -> String {
    let mut choices: Vec<String> = ctx
        .models()
        .all_concrete_fields(opts)
        .into_iter()
        .filter(|(_, f)| f.is_relation() && !f.is_parent_link())
        .map(|(_, f)| f.name)
        .collect();
    choices.extend(
        opts.related_objects()
            .iter()
            .filter(|r| r.kind == RelationKind::OneToOne)
            .map(|r| r.name.clone()),
    );
    if choices.is_empty() {
        "(none)".to_string()
    } else {
        choices.join(", ")
    }
}
