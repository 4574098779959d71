//! Settings loading from configuration files.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML or JSON file (overriding defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `RELQ_DEBUG` | `debug` |
//! | `RELQ_LOG_LEVEL` | `log_level` |
//! | `RELQ_DATABASE_ENGINE` | `engine` of the default database |
//! | `RELQ_DATABASE_NAME` | `name` of the default database |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use relq_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file("relq.toml").unwrap();
//! let settings = settings_loader::from_json_file_with_env("relq.json").unwrap();
//! ```

use std::path::Path;

use crate::error::{RelqError, RelqResult};
use crate::settings::Settings;

/// Loads settings from a TOML string. Missing keys keep their defaults.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or cannot be deserialized.
pub fn from_toml_str(toml_str: &str) -> RelqResult<Settings> {
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| RelqError::ConfigurationError(format!("Failed to parse TOML: {e}")))?;
    merge_over_defaults(toml_to_json(toml_value), "TOML")
}

/// Loads settings from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file(path: impl AsRef<Path>) -> RelqResult<Settings> {
    from_toml_str(&read_config(path.as_ref(), "TOML")?)
}

/// Loads settings from a TOML file and then applies environment variable overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> RelqResult<Settings> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from a JSON string. Missing keys keep their defaults.
///
/// # Errors
///
/// Returns an error if the JSON is malformed or cannot be deserialized.
pub fn from_json_str(json_str: &str) -> RelqResult<Settings> {
    let json_value: serde_json::Value = serde_json::from_str(json_str)
        .map_err(|e| RelqError::ConfigurationError(format!("Failed to parse JSON: {e}")))?;
    merge_over_defaults(json_value, "JSON")
}

/// Loads settings from a JSON file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the JSON is malformed.
pub fn from_json_file(path: impl AsRef<Path>) -> RelqResult<Settings> {
    from_json_str(&read_config(path.as_ref(), "JSON")?)
}

/// Loads settings from a JSON file and then applies environment variable overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the JSON is malformed.
pub fn from_json_file_with_env(path: impl AsRef<Path>) -> RelqResult<Settings> {
    let mut settings = from_json_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from just environment variables (starting from defaults).
pub fn from_env() -> Settings {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `RELQ_*` environment variable overrides to a settings struct.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(val) = std::env::var("RELQ_DEBUG") {
        settings.debug = matches!(val.to_lowercase().as_str(), "true" | "1" | "yes");
    }

    if let Ok(val) = std::env::var("RELQ_LOG_LEVEL") {
        settings.log_level = val;
    }

    let engine = std::env::var("RELQ_DATABASE_ENGINE").ok();
    let name = std::env::var("RELQ_DATABASE_NAME").ok();
    if engine.is_some() || name.is_some() {
        let db = settings
            .databases
            .entry(settings.default_database.clone())
            .or_default();
        if let Some(engine) = engine {
            db.engine = engine;
        }
        if let Some(name) = name {
            db.name = name;
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn read_config(path: &Path, format: &str) -> RelqResult<String> {
    std::fs::read_to_string(path).map_err(|e| {
        RelqError::ConfigurationError(format!(
            "Failed to read {format} file '{}': {e}",
            path.display()
        ))
    })
}

fn merge_over_defaults(value: serde_json::Value, format: &str) -> RelqResult<Settings> {
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        RelqError::ConfigurationError(format!("Failed to serialize default settings: {e}"))
    })?;

    let merged = merge_json(default_json, value);
    serde_json::from_value(merged).map_err(|e| {
        RelqError::ConfigurationError(format!("Failed to deserialize settings from {format}: {e}"))
    })
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => serde_json::Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = match base_map.remove(&key) {
                    Some(base_v) => merge_json(base_v, override_v),
                    None => override_v,
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── TOML loading ────────────────────────────────────────────────

    #[test]
    fn test_from_toml_str_basic() {
        let toml = r#"
            debug = false
            log_level = "relq_db=trace"
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.log_level, "relq_db=trace");
        // Defaults preserved
        assert_eq!(settings.max_subquery_depth, 127);
        assert_eq!(settings.default_database, "default");
    }

    #[test]
    fn test_from_toml_str_databases() {
        let toml = r#"
            [databases.default]
            engine = "relq.backends.postgresql"
            name = "library"
            interprets_empty_strings_as_nulls = true
        "#;

        let settings = from_toml_str(toml).unwrap();
        let db = settings.databases.get("default").unwrap();
        assert_eq!(db.vendor(), "postgresql");
        assert_eq!(db.name, "library");
        assert_eq!(db.interprets_empty_strings_as_nulls, Some(true));
    }

    #[test]
    fn test_from_toml_str_partial_database_keeps_defaults() {
        let toml = r#"
            [databases.default]
            name = "other.sqlite3"
        "#;

        let settings = from_toml_str(toml).unwrap();
        let db = settings.default_database().unwrap();
        assert_eq!(db.vendor(), "sqlite3");
        assert_eq!(db.name, "other.sqlite3");
    }

    #[test]
    fn test_from_toml_str_empty() {
        let settings = from_toml_str("").unwrap();
        assert!(settings.debug);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_from_toml_str_invalid() {
        let result = from_toml_str("[[invalid toml content");
        assert!(matches!(result, Err(RelqError::ConfigurationError(_))));
    }

    #[test]
    fn test_from_toml_str_wrong_type() {
        let result = from_toml_str("max_subquery_depth = \"deep\"");
        assert!(result.is_err());
    }

    // ── JSON loading ────────────────────────────────────────────────

    #[test]
    fn test_from_json_str_basic() {
        let json = r#"{
            "debug": false,
            "max_subquery_depth": 16
        }"#;

        let settings = from_json_str(json).unwrap();
        assert!(!settings.debug);
        assert_eq!(settings.max_subquery_depth, 16);
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_from_json_str_invalid() {
        assert!(from_json_str("{not json").is_err());
    }

    #[test]
    fn test_from_toml_file_missing() {
        let result = from_toml_file("/nonexistent/relq.toml");
        assert!(matches!(result, Err(RelqError::ConfigurationError(_))));
    }

    #[test]
    fn test_from_json_file_roundtrip() {
        let dir = std::env::temp_dir().join("relq-settings-loader-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("settings.json");
        std::fs::write(&path, r#"{"log_level": "warn"}"#).unwrap();

        let settings = from_json_file(&path).unwrap();
        assert_eq!(settings.log_level, "warn");
        std::fs::remove_file(&path).ok();
    }

    // ── Helpers ─────────────────────────────────────────────────────

    #[test]
    fn test_merge_json_nested() {
        let base = serde_json::json!({"a": {"b": 1, "c": 2}, "d": 3});
        let over = serde_json::json!({"a": {"c": 20}});
        let merged = merge_json(base, over);
        assert_eq!(merged, serde_json::json!({"a": {"b": 1, "c": 20}, "d": 3}));
    }

    #[test]
    fn test_toml_to_json_array() {
        let value: toml::Value = toml::from_str("x = [1, 2]").unwrap();
        let json = toml_to_json(value);
        assert_eq!(json, serde_json::json!({"x": [1, 2]}));
    }
}
