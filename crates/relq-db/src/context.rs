//! The configuration shared by every query.
//!
//! A [`QueryContext`] bundles the model registry, the lookup registry, and the
//! capabilities of the target database. It is built once at startup and
//! shared by `Arc`; queries only ever read it.

use std::sync::Arc;

use relq_core::{DatabaseSettings, RelqError, RelqResult, Settings};

use crate::model::ModelRegistry;
use crate::query::compiler::DatabaseBackendType;
use crate::query::custom_lookups::LookupRegistry;

/// Capabilities of the target database that influence query building.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatabaseFeatures {
    /// The SQL dialect.
    pub backend: DatabaseBackendType,
    /// Set for backends that store the empty string as NULL.
    pub interprets_empty_strings_as_nulls: bool,
}

impl DatabaseFeatures {
    /// The default features of a backend.
    pub const fn for_backend(backend: DatabaseBackendType) -> Self {
        Self {
            backend,
            interprets_empty_strings_as_nulls: false,
        }
    }

    /// Reads the features from database settings.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::ConfigurationError`] for an unknown engine.
    pub fn from_settings(settings: &DatabaseSettings) -> RelqResult<Self> {
        let backend = DatabaseBackendType::from_vendor(settings.vendor()).ok_or_else(|| {
            RelqError::ConfigurationError(format!(
                "Unknown database engine '{}'",
                settings.engine
            ))
        })?;
        let mut features = Self::for_backend(backend);
        if let Some(flag) = settings.interprets_empty_strings_as_nulls {
            features.interprets_empty_strings_as_nulls = flag;
        }
        Ok(features)
    }
}

impl Default for DatabaseFeatures {
    fn default() -> Self {
        Self::for_backend(DatabaseBackendType::SQLite)
    }
}

/// Models, lookups, and database features used to build and compile queries.
#[derive(Debug, Clone)]
pub struct QueryContext {
    models: ModelRegistry,
    lookups: LookupRegistry,
    features: DatabaseFeatures,
    max_subquery_depth: usize,
}

impl QueryContext {
    /// Creates a context with the default lookups and SQLite features.
    pub fn new(models: ModelRegistry) -> Arc<Self> {
        Self::builder(models).build()
    }

    /// Starts a context builder.
    pub fn builder(models: ModelRegistry) -> QueryContextBuilder {
        QueryContextBuilder {
            context: Self {
                models,
                lookups: LookupRegistry::with_defaults(),
                features: DatabaseFeatures::default(),
                max_subquery_depth: 127,
            },
        }
    }

    /// Builds a context from engine settings, using the default database.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::ConfigurationError`] if the default database is
    /// missing or its engine is unknown.
    pub fn from_settings(settings: &Settings, models: ModelRegistry) -> RelqResult<Arc<Self>> {
        let database = settings.default_database().ok_or_else(|| {
            RelqError::ConfigurationError(format!(
                "The default database '{}' is not configured",
                settings.default_database
            ))
        })?;
        let features = DatabaseFeatures::from_settings(database)?;
        tracing::debug!(backend = ?features.backend, "query context configured");
        Ok(Self::builder(models)
            .features(features)
            .max_subquery_depth(settings.max_subquery_depth)
            .build())
    }

    /// The model registry.
    pub const fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// The lookup and transform registry.
    pub const fn lookups(&self) -> &LookupRegistry {
        &self.lookups
    }

    /// The database features.
    pub const fn features(&self) -> DatabaseFeatures {
        self.features
    }

    /// Number of alias prefixes tried before giving up on relabeling a
    /// subquery.
    pub const fn max_subquery_depth(&self) -> usize {
        self.max_subquery_depth
    }
}

/// Builder for [`QueryContext`].
#[derive(Debug)]
pub struct QueryContextBuilder {
    context: QueryContext,
}

impl QueryContextBuilder {
    /// Replaces the lookup registry.
    #[must_use]
    pub fn lookups(mut self, lookups: LookupRegistry) -> Self {
        self.context.lookups = lookups;
        self
    }

    /// Sets the database features.
    #[must_use]
    pub fn features(mut self, features: DatabaseFeatures) -> Self {
        self.context.features = features;
        self
    }

    /// Shorthand for the default features of `backend`.
    #[must_use]
    pub fn backend(mut self, backend: DatabaseBackendType) -> Self {
        self.context.features = DatabaseFeatures::for_backend(backend);
        self
    }

    /// Sets the alias prefix limit used when relabeling subqueries.
    #[must_use]
    pub fn max_subquery_depth(mut self, depth: usize) -> Self {
        self.context.max_subquery_depth = depth;
        self
    }

    /// Finishes the context.
    pub fn build(self) -> Arc<QueryContext> {
        Arc::new(self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_features_from_settings() {
        let settings = DatabaseSettings {
            engine: "relq.backends.postgresql".into(),
            ..Default::default()
        };
        let features = DatabaseFeatures::from_settings(&settings).unwrap();
        assert_eq!(features.backend, DatabaseBackendType::PostgreSQL);
        assert!(!features.interprets_empty_strings_as_nulls);
    }

    #[test]
    fn test_empty_string_flag_override() {
        let settings = DatabaseSettings {
            interprets_empty_strings_as_nulls: Some(true),
            ..Default::default()
        };
        let features = DatabaseFeatures::from_settings(&settings).unwrap();
        assert_eq!(features.backend, DatabaseBackendType::SQLite);
        assert!(features.interprets_empty_strings_as_nulls);
    }

    #[test]
    fn test_unknown_engine() {
        let settings = DatabaseSettings {
            engine: "relq.backends.oracle".into(),
            ..Default::default()
        };
        assert!(matches!(
            DatabaseFeatures::from_settings(&settings),
            Err(RelqError::ConfigurationError(_))
        ));
    }

    #[test]
    fn test_from_settings_uses_default_database() {
        let mut settings = Settings::default();
        settings.max_subquery_depth = 10;
        let ctx = QueryContext::from_settings(&settings, ModelRegistry::default()).unwrap();
        assert_eq!(ctx.features().backend, DatabaseBackendType::SQLite);
        assert_eq!(ctx.max_subquery_depth(), 10);

        settings.default_database = "missing".into();
        assert!(QueryContext::from_settings(&settings, ModelRegistry::default()).is_err());
    }
}
