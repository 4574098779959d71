//! Core error types for relq.
//!
//! [`RelqError`] covers every failure the query engine can surface to callers:
//! unresolvable lookups, incompatible query combinations, alias exhaustion,
//! invalid filter values, database failures, and configuration problems.
//!
//! Conditions that are part of normal query planning (a filter that can never
//! match, a path that needs a subquery) are not errors; they are expressed as
//! ordinary return values by the query engine.

use thiserror::Error;

/// The primary error type for relq.
#[derive(Error, Debug)]
pub enum RelqError {
    // ── Query construction errors ────────────────────────────────────

    /// A lookup path could not be resolved against the model schema.
    ///
    /// The message lists the valid choices when a name is unknown.
    #[error("Field error: {0}")]
    FieldError(String),

    /// Two queries cannot be combined, or an operation is not allowed in the
    /// query's current state (for example filtering after slicing).
    #[error("Incompatible query: {0}")]
    IncompatibleQuery(String),

    /// No free alias prefix could be found while relabeling a subquery.
    #[error("Maximum recursion depth exceeded: too many subqueries ({0} prefixes tried)")]
    AliasExhaustion(usize),

    /// A filter value is not valid for the requested lookup.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The configured backend cannot express the requested construct.
    #[error("Not supported: {0}")]
    NotSupported(String),

    // ── Execution errors ─────────────────────────────────────────────

    /// Raised when a query expected exactly one result but found none.
    #[error("Object does not exist: {0}")]
    DoesNotExist(String),

    /// Raised when a query expected exactly one result but found multiple.
    #[error("Multiple objects returned when one expected: {0}")]
    MultipleObjectsReturned(String),

    /// A generic database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// An operational error in the database layer (connection, lock, etc.).
    #[error("Operational error: {0}")]
    OperationalError(String),

    // ── Configuration and IO ─────────────────────────────────────────

    /// The settings or model registry are invalid.
    #[error("Improperly configured: {0}")]
    ConfigurationError(String),

    /// An IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl RelqError {
    /// Returns `true` for errors raised while building a query, before any
    /// database access took place.
    pub const fn is_query_error(&self) -> bool {
        matches!(
            self,
            Self::FieldError(_)
                | Self::IncompatibleQuery(_)
                | Self::AliasExhaustion(_)
                | Self::InvalidValue(_)
                | Self::NotSupported(_)
        )
    }
}

/// A convenience type alias for results that use [`RelqError`].
pub type RelqResult<T> = Result<T, RelqError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_error_display() {
        let err = RelqError::FieldError("Cannot resolve keyword 'nme' into field.".into());
        assert_eq!(
            err.to_string(),
            "Field error: Cannot resolve keyword 'nme' into field."
        );
    }

    #[test]
    fn test_alias_exhaustion_display() {
        let err = RelqError::AliasExhaustion(128);
        assert!(err.to_string().contains("128"));
    }

    #[test]
    fn test_is_query_error() {
        assert!(RelqError::FieldError(String::new()).is_query_error());
        assert!(RelqError::IncompatibleQuery(String::new()).is_query_error());
        assert!(RelqError::AliasExhaustion(1).is_query_error());
        assert!(!RelqError::DatabaseError(String::new()).is_query_error());
        assert!(!RelqError::DoesNotExist(String::new()).is_query_error());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: RelqError = io.into();
        assert!(matches!(err, RelqError::IoError(_)));
    }
}
