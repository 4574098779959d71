//! SQLite database backend using `rusqlite`.
//!
//! This module provides the [`SqliteBackend`] which implements the
//! [`DbExecutor`] trait on top of a single `rusqlite` connection.
//!
//! Features:
//! - WAL mode enabled for file-based databases
//! - In-memory database support via `:memory:` path (great for testing)
//! - A `REGEXP` function backed by the `regex` crate, used by the `regex`
//!   and `iregex` lookups
//! - Simple `Mutex`-based concurrency control

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use relq_core::{DatabaseSettings, RelqError, RelqResult};
use relq_db::query::compiler::{DatabaseBackendType, Row};
use relq_db::value::Value;
use relq_db::DbExecutor;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A SQLite database backend.
///
/// Uses `rusqlite` for database access with a `Mutex`-based concurrency
/// model. Every call blocks the calling thread until the statement finishes.
pub struct SqliteBackend {
    /// The path to the database file (or ":memory:").
    path: PathBuf,
    /// The connection, guarded by a mutex.
    conn: Mutex<rusqlite::Connection>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Opens a new SQLite database at the given path.
    ///
    /// If the path is `:memory:`, an in-memory database is created.
    /// WAL journal mode is enabled for file-based databases.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(path: impl Into<PathBuf>) -> RelqResult<Self> {
        let path = path.into();
        let in_memory = path.to_str() == Some(":memory:");
        let conn = if in_memory {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| RelqError::OperationalError(format!("SQLite open failed: {e}")))?;

        let pragmas = if in_memory {
            "PRAGMA foreign_keys=ON;"
        } else {
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;"
        };
        conn.execute_batch(pragmas)
            .map_err(|e| RelqError::OperationalError(format!("Failed to set pragmas: {e}")))?;
        register_regexp(&conn).map_err(|e| {
            RelqError::OperationalError(format!("Failed to register REGEXP: {e}"))
        })?;

        tracing::debug!(path = %path.display(), "opened SQLite database");
        Ok(Self {
            path,
            conn: Mutex::new(conn),
        })
    }

    /// Opens an in-memory database (convenience constructor).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn memory() -> RelqResult<Self> {
        Self::open(":memory:")
    }

    /// Opens the database described by `settings`.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::ConfigurationError`] if the engine is not SQLite,
    /// and open errors otherwise.
    pub fn from_settings(settings: &DatabaseSettings) -> RelqResult<Self> {
        if DatabaseBackendType::from_vendor(settings.vendor()) != Some(DatabaseBackendType::SQLite) {
            return Err(RelqError::ConfigurationError(format!(
                "SqliteBackend cannot serve the '{}' engine",
                settings.engine
            )));
        }
        Self::open(&settings.name)
    }

    /// Returns the database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs several `;`-separated statements without parameters, such as a
    /// schema or fixture script.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::DatabaseError`] if any statement fails.
    pub fn execute_batch(&self, sql: &str) -> RelqResult<()> {
        self.lock()?
            .execute_batch(sql)
            .map_err(|e| RelqError::DatabaseError(format!("{e}")))
    }

    fn lock(&self) -> RelqResult<MutexGuard<'_, rusqlite::Connection>> {
        self.conn
            .lock()
            .map_err(|_| RelqError::OperationalError("SQLite connection lock poisoned".into()))
    }

    /// Binds `Value`s to a `rusqlite` statement.
    fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> RelqResult<()> {
        for (i, param) in params.iter().enumerate() {
            let idx = i + 1;
            match param {
                Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
                Value::Bool(b) => stmt.raw_bind_parameter(idx, b),
                Value::Int(v) => stmt.raw_bind_parameter(idx, v),
                Value::Float(v) => stmt.raw_bind_parameter(idx, v),
                Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
                Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
                Value::Date(d) => stmt.raw_bind_parameter(idx, d.to_string()),
                Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.to_string()),
                Value::Time(t) => stmt.raw_bind_parameter(idx, t.to_string()),
                Value::Uuid(u) => stmt.raw_bind_parameter(idx, u.to_string()),
                Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string()),
                Value::List(vals) => {
                    let json = serde_json::to_string(
                        &vals.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    )
                    .map_err(|e| RelqError::DatabaseError(format!("Bind error: {e}")))?;
                    stmt.raw_bind_parameter(idx, json)
                }
            }
            .map_err(|e| RelqError::DatabaseError(format!("Bind error: {e}")))?;
        }
        Ok(())
    }

    /// Converts a `rusqlite::Row` to our generic `Row`.
    fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> RelqResult<Row> {
        let mut values = Vec::with_capacity(column_names.len());
        for i in 0..column_names.len() {
            let val_ref = sqlite_row
                .get_ref(i)
                .map_err(|e| RelqError::DatabaseError(format!("{e}")))?;
            values.push(match val_ref {
                ValueRef::Null => Value::Null,
                ValueRef::Integer(v) => Value::Int(v),
                ValueRef::Real(v) => Value::Float(v),
                ValueRef::Text(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
                ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            });
        }
        Ok(Row::new(column_names.to_vec(), values))
    }
}

impl DbExecutor for SqliteBackend {
    fn backend_type(&self) -> DatabaseBackendType {
        DatabaseBackendType::SQLite
    }

    fn execute_sql(&self, sql: &str, params: &[Value]) -> RelqResult<u64> {
        tracing::trace!(sql = %sql, params = params.len(), "execute");
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| RelqError::DatabaseError(format!("{e}")))?;
        Self::bind_params(&mut stmt, params)?;
        let count = stmt
            .raw_execute()
            .map_err(|e| RelqError::DatabaseError(format!("{e}")))?;
        Ok(u64::try_from(count).unwrap_or(u64::MAX))
    }

    fn query(&self, sql: &str, params: &[Value]) -> RelqResult<Vec<Row>> {
        tracing::trace!(sql = %sql, params = params.len(), "query");
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| RelqError::DatabaseError(format!("{e}")))?;

        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();

        Self::bind_params(&mut stmt, params)?;

        let mut raw_rows = stmt.raw_query();
        let mut rows = Vec::new();
        while let Some(row) = raw_rows
            .next()
            .map_err(|e| RelqError::DatabaseError(format!("{e}")))?
        {
            rows.push(Self::convert_row(row, &column_names)?);
        }
        Ok(rows)
    }
}

/// Registers `regexp(pattern, text)`, which SQLite calls for
/// `text REGEXP pattern`. Either operand being NULL yields NULL.
fn register_regexp(conn: &rusqlite::Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            if matches!(ctx.get_raw(0), ValueRef::Null) {
                return Ok(None);
            }
            let text = match ctx.get_raw(1) {
                ValueRef::Null => return Ok(None),
                ValueRef::Integer(i) => i.to_string(),
                ValueRef::Real(f) => f.to_string(),
                ValueRef::Text(t) | ValueRef::Blob(t) => String::from_utf8_lossy(t).into_owned(),
            };
            let re: Arc<Regex> = ctx.get_or_create_aux(0, |vr| -> Result<_, BoxError> {
                Ok(Regex::new(vr.as_str()?)?)
            })?;
            Ok(Some(re.is_match(&text)))
        },
    )
}
