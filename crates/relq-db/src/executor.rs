//! Database executor trait.
//!
//! This module defines the [`DbExecutor`] trait that provides the minimal
//! interface required by [`SqlCompiler`](crate::query::compiler::SqlCompiler)
//! and [`QuerySet`](crate::query::queryset::QuerySet) execution methods.
//!
//! The `DbExecutor` trait is implemented by backend types (e.g.,
//! `SqliteBackend`) in the `relq-db-backends` crate. Calls are synchronous:
//! all blocking happens inside the executor, never while a query is built.

use relq_core::{RelqError, RelqResult};

use crate::query::compiler::{DatabaseBackendType, Row};
use crate::value::Value;

/// Minimal database executor trait.
///
/// This is the bridge between the query engine (`relq-db`) and the concrete
/// database backends (`relq-db-backends`). Execution methods accept
/// `&dyn DbExecutor`, which backends implement.
pub trait DbExecutor: Send + Sync {
    /// Returns the backend type for SQL compilation.
    fn backend_type(&self) -> DatabaseBackendType;

    /// Runs a SQL statement that does not return rows.
    /// Returns the number of rows affected.
    fn execute_sql(&self, sql: &str, params: &[Value]) -> RelqResult<u64>;

    /// Runs a SQL query and returns all result rows.
    fn query(&self, sql: &str, params: &[Value]) -> RelqResult<Vec<Row>>;

    /// Runs a SQL query and returns exactly one row.
    /// Returns `DoesNotExist` if no rows, `MultipleObjectsReturned` if more than one.
    fn query_one(&self, sql: &str, params: &[Value]) -> RelqResult<Row> {
        let mut rows = self.query(sql, params)?.into_iter();
        match (rows.next(), rows.next()) {
            (Some(row), None) => Ok(row),
            (None, _) => Err(RelqError::DoesNotExist(
                "Query returned no rows".to_string(),
            )),
            (Some(_), Some(_)) => Err(RelqError::MultipleObjectsReturned(
                "Query returned more than one row".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubExecutor;

    fn row(id: i64) -> Row {
        Row::new(vec!["id".to_string()], vec![Value::Int(id)])
    }

    #[test]
    fn test_query_one_single_row() {
        let executor = StubExecutor::with_rows(vec![row(7)]);
        let found = executor.query_one("SELECT 1", &[]).unwrap();
        assert_eq!(found.get::<i64>("id").unwrap(), 7);
    }

    #[test]
    fn test_query_one_no_rows() {
        let executor = StubExecutor::default();
        assert!(matches!(
            executor.query_one("SELECT 1", &[]),
            Err(RelqError::DoesNotExist(_))
        ));
    }

    #[test]
    fn test_query_one_many_rows() {
        let executor = StubExecutor::with_rows(vec![row(1), row(2)]);
        assert!(matches!(
            executor.query_one("SELECT 1", &[]),
            Err(RelqError::MultipleObjectsReturned(_))
        ));
    }
}
