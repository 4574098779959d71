//! # relq-db
//!
//! The query engine of relq. Provides [`ModelMeta`](model::ModelMeta) and the
//! [`ModelRegistry`](model::ModelRegistry) for describing a schema, the
//! [`Query`](query::Query) IR that turns lookups like `author__name__icontains`
//! into joins and conditions, and the [`SqlCompiler`](query::SqlCompiler) that
//! renders a query as parameterized SQL.
//!
//! ## Architecture
//!
//! A [`QuerySet`](query::QuerySet) builds a [`Query`](query::Query) through
//! method chaining without touching the database. Each filter resolves its
//! lookup path against the registry, sets up the joins the path needs (reusing
//! existing ones where allowed), and adds a condition to the WHERE tree; a
//! join promoter then decides which joins must be LEFT OUTER. SQL is only
//! generated when a terminal method (`.fetch()`, `.get()`, `.count()`, ...) is
//! called with a [`DbExecutor`](executor::DbExecutor).
//!
//! ## Module Overview
//!
//! - [`model`] - [`ModelMeta`](model::ModelMeta) and the model registry
//! - [`fields`] - Field definitions ([`FieldDef`](fields::FieldDef)) and types
//! - [`value`] - The backend-agnostic [`Value`](value::Value) enum
//! - [`context`] - The shared [`QueryContext`](context::QueryContext)
//! - [`query`] - Query building, lookups, expressions, and compilation
//! - [`executor`] - The [`DbExecutor`](executor::DbExecutor) trait

// These clippy lints are intentionally allowed for the query engine:
// - struct_excessive_bools: FieldDef and Query carry many independent flags
// - too_many_lines: the SQL compiler methods are large due to many match arms
// - format_push_string: format! with push_str is clearer than write! for SQL generation
// - doc_markdown: backtick requirements for documentation items are too strict
// - needless_pass_by_value: filter values are moved into the query
// - return_self_not_must_use: builder pattern methods are self-documenting
#![allow(clippy::struct_excessive_bools)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::format_push_string)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::too_many_arguments)]

pub mod context;
pub mod executor;
pub mod fields;
pub mod model;
pub mod query;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

// Re-export the most commonly used types at the crate root.
pub use context::{DatabaseFeatures, QueryContext};
pub use executor::DbExecutor;
pub use fields::{FieldDef, FieldType};
pub use model::{ModelMeta, ModelRegistry};
pub use query::{
    AggregateFunc, CompiledQuery, Connector, DatabaseBackendType, Expression, FilterValue,
    JoinType, OrderBy, Query, QuerySet, Row, SqlCompiler, WhereNode, Q,
};
pub use value::Value;
