//! # relq-db-backends
//!
//! Database backend implementations for relq. Each backend implements
//! [`DbExecutor`](relq_db::DbExecutor) so that compiled queries can be run
//! against a real database.
//!
//! Supported backends:
//! - `SQLite` (feature `sqlite`, enabled by default)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteBackend;
