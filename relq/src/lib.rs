//! # relq
//!
//! A relational query engine: describe models in a registry, build queries
//! with lookup paths like `author__name__icontains`, and let the engine work
//! out the joins, the WHERE tree, and the SQL.
//!
//! This is the meta-crate that re-exports the sub-crates for convenient
//! access. Depend on `relq` to get everything, or on the individual crates
//! for finer-grained control.

/// Error types, settings, and logging setup.
pub use relq_core as core;

/// Model registry, query IR, `QuerySet`, and SQL compiler.
pub use relq_db as db;

/// Database backends: `SQLite`.
pub use relq_db_backends as db_backends;

/// Third-party crates re-exported so applications share one version.
pub mod deps {
    pub use chrono;
    pub use serde_json;
    pub use tracing;
    pub use tracing_subscriber;
}

/// The types most applications need.
pub mod prelude {
    pub use relq_core::{RelqError, RelqResult, Settings};
    pub use relq_db::{
        DbExecutor, Expression, FieldDef, FieldType, ModelMeta, ModelRegistry, OrderBy,
        QueryContext, QuerySet, Value, Q,
    };
    #[cfg(feature = "sqlite")]
    pub use relq_db_backends::SqliteBackend;
}
