//! Query building, compilation, and execution.
//!
//! This module contains the complete query pipeline:
//!
//! - [`lookups`] - Q objects and filter values
//! - [`expressions`] - Columns, F-references, aggregates, and ordering items
//! - [`custom_lookups`] - The lookup and transform registry
//! - [`path`] - Resolving `a__b__c` names into relation paths
//! - [`joins`] - Join records and the alias map
//! - [`promoter`] - INNER/LEFT OUTER join promotion
//! - [`where_node`] - The filter condition tree
//! - [`query`] - The query IR and its clause setters
//! - [`filter`] - Turning lookups into conditions and joins
//! - [`aggregation`] - Aggregates, counts, and existence checks
//! - [`compiler`] - SQL generation and execution
//! - [`queryset`] - The chainable QuerySet API

pub mod aggregation;
pub mod compiler;
pub mod custom_lookups;
pub mod expressions;
pub mod filter;
pub mod joins;
pub mod lookups;
pub mod path;
pub mod promoter;
#[allow(clippy::module_inception)]
pub mod query;
pub mod queryset;
pub mod where_node;

pub use compiler::{CompiledQuery, DatabaseBackendType, QueryResult, ResultType, Row, SqlCompiler};
pub use custom_lookups::LookupRegistry;
pub use expressions::{AggregateFunc, Annotation, Col, Expression, OrderBy};
pub use joins::{AliasMap, Join, JoinType};
pub use lookups::{FilterValue, Q};
pub use query::{GroupBy, Query};
pub use queryset::QuerySet;
pub use where_node::{Connector, WhereNode};
