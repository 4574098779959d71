//! Settings for the relq query engine.
//!
//! [`Settings`] holds the engine configuration: logging behaviour, the
//! configured databases, and planning limits. Every field has a sensible
//! default so a partial configuration file is enough.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// The database engine (e.g. `relq.backends.postgresql`).
    pub engine: String,
    /// The database name (or file path for `SQLite`).
    pub name: String,
    /// Forces the empty-string-as-NULL behaviour on or off. When unset the
    /// backend's own feature flag is used.
    #[serde(default)]
    pub interprets_empty_strings_as_nulls: Option<bool>,
    /// Additional engine-specific options.
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            engine: "relq.backends.sqlite3".to_string(),
            name: ":memory:".to_string(),
            interprets_empty_strings_as_nulls: None,
            options: HashMap::new(),
        }
    }
}

impl DatabaseSettings {
    /// Returns the short vendor name of the engine: the last dotted segment
    /// of `engine` (`sqlite3`, `postgresql`, `mysql`).
    pub fn vendor(&self) -> &str {
        self.engine.rsplit('.').next().unwrap_or(&self.engine)
    }
}

/// Engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Enables human-readable log output.
    pub debug: bool,
    /// The tracing filter directive (e.g. "info", "relq_db=trace").
    pub log_level: String,
    /// The key into `databases` used when no alias is given.
    pub default_database: String,
    /// Configured databases, keyed by alias.
    pub databases: HashMap<String, DatabaseSettings>,
    /// Upper bound on the number of alias prefixes tried when relabeling a
    /// nested subquery.
    pub max_subquery_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let mut databases = HashMap::new();
        databases.insert("default".to_string(), DatabaseSettings::default());
        Self {
            debug: true,
            log_level: "info".to_string(),
            default_database: "default".to_string(),
            databases,
            max_subquery_depth: 127,
        }
    }
}

impl Settings {
    /// Returns the settings of the default database, if configured.
    pub fn default_database(&self) -> Option<&DatabaseSettings> {
        self.databases.get(&self.default_database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(settings.debug);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.max_subquery_depth, 127);
        assert!(settings.default_database().is_some());
    }

    #[test]
    fn test_default_database() {
        let db = DatabaseSettings::default();
        assert_eq!(db.vendor(), "sqlite3");
        assert_eq!(db.name, ":memory:");
        assert!(db.interprets_empty_strings_as_nulls.is_none());
    }

    #[test]
    fn test_vendor_without_dots() {
        let db = DatabaseSettings {
            engine: "postgresql".into(),
            ..DatabaseSettings::default()
        };
        assert_eq!(db.vendor(), "postgresql");
    }

    #[test]
    fn test_missing_default_database() {
        let settings = Settings {
            default_database: "replica".into(),
            ..Settings::default()
        };
        assert!(settings.default_database().is_none());
    }
}
