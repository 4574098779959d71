//! Lookup and transform registry.
//!
//! - **Lookups** produce a boolean SQL expression (e.g. `col != value`).
//! - **Transforms** wrap the left-hand side before a lookup is applied
//!   (e.g. `LOWER(col)`, `EXTRACT(YEAR FROM col)`) and can be chained:
//!   `title__lower__contains` applies `LOWER()` then `contains`.
//!
//! The built-in lookups are always available. Custom lookups and transforms
//! are registered by name and shared by every query built from the same
//! [`QueryContext`](crate::context::QueryContext).
//!
//! # Examples
//!
//! ```
//! use relq_db::query::custom_lookups::*;
//!
//! let mut registry = LookupRegistry::with_defaults();
//! registry.register_lookup("ne", CustomLookup::new("ne", "{column} != {value}"));
//! registry.register_transform(
//!     "abs",
//!     Transform::new("abs", "ABS({column})", TransformOutput::SameAsInput),
//! );
//! assert!(registry.get_lookup("ne").is_some());
//! assert!(registry.get_lookup("exact").is_some());
//! ```

use std::collections::HashMap;

use crate::fields::FieldType;
use crate::query::compiler::DatabaseBackendType;

/// The built-in lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinLookup {
    /// `lhs = rhs`
    Exact,
    /// Case-insensitive equality.
    IExact,
    /// Substring match.
    Contains,
    /// Case-insensitive substring match.
    IContains,
    /// Membership test against a list or subquery.
    In,
    /// `lhs > rhs`
    Gt,
    /// `lhs >= rhs`
    Gte,
    /// `lhs < rhs`
    Lt,
    /// `lhs <= rhs`
    Lte,
    /// Prefix match.
    StartsWith,
    /// Case-insensitive prefix match.
    IStartsWith,
    /// Suffix match.
    EndsWith,
    /// Case-insensitive suffix match.
    IEndsWith,
    /// `lhs BETWEEN a AND b`
    Range,
    /// `lhs IS [NOT] NULL`
    IsNull,
    /// Regular expression match.
    Regex,
    /// Case-insensitive regular expression match.
    IRegex,
}

impl BuiltinLookup {
    const ALL: [Self; 17] = [
        Self::Exact,
        Self::IExact,
        Self::Contains,
        Self::IContains,
        Self::In,
        Self::Gt,
        Self::Gte,
        Self::Lt,
        Self::Lte,
        Self::StartsWith,
        Self::IStartsWith,
        Self::EndsWith,
        Self::IEndsWith,
        Self::Range,
        Self::IsNull,
        Self::Regex,
        Self::IRegex,
    ];

    /// The lookup name used in filter paths.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::IExact => "iexact",
            Self::Contains => "contains",
            Self::IContains => "icontains",
            Self::In => "in",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::StartsWith => "startswith",
            Self::IStartsWith => "istartswith",
            Self::EndsWith => "endswith",
            Self::IEndsWith => "iendswith",
            Self::Range => "range",
            Self::IsNull => "isnull",
            Self::Regex => "regex",
            Self::IRegex => "iregex",
        }
    }

    /// Parses a lookup name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|l| l.name() == name)
    }

    /// Lookups usable directly on a relation field.
    pub const fn is_related_lookup(self) -> bool {
        matches!(
            self,
            Self::Exact | Self::In | Self::IsNull | Self::Gt | Self::Gte | Self::Lt | Self::Lte
        )
    }
}

/// A lookup resolved by name: either built in or registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupKind {
    /// One of the built-in lookups.
    Builtin(BuiltinLookup),
    /// A registered custom lookup.
    Custom(CustomLookup),
}

impl LookupKind {
    /// The lookup name.
    pub fn name(&self) -> &str {
        match self {
            Self::Builtin(b) => b.name(),
            Self::Custom(c) => &c.name,
        }
    }

    /// Returns `true` for `isnull`.
    pub fn is_isnull(&self) -> bool {
        matches!(self, Self::Builtin(BuiltinLookup::IsNull))
    }
}

/// A custom lookup that produces a boolean SQL expression.
///
/// The `sql_template` uses `{column}` and `{value}` as placeholders, e.g.
/// `"{column} != {value}"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomLookup {
    /// The name of this lookup (e.g., "ne").
    pub name: String,
    /// The SQL template with `{column}` and `{value}` placeholders.
    pub sql_template: String,
}

impl CustomLookup {
    /// Creates a new custom lookup.
    pub fn new(name: impl Into<String>, sql_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_template: sql_template.into(),
        }
    }

    /// Renders the lookup for a compiled left-hand side and right-hand side.
    pub fn compile(&self, lhs_sql: &str, rhs_sql: &str) -> String {
        self.sql_template
            .replace("{column}", lhs_sql)
            .replace("{value}", rhs_sql)
    }
}

/// The output type of a transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformOutput {
    /// A string value.
    String,
    /// An integer value.
    Integer,
    /// A date value.
    Date,
    /// The same type as the transformed expression.
    SameAsInput,
}

impl TransformOutput {
    /// The field type of the transformed value, given the input's type.
    pub fn field_type(self, input: Option<FieldType>) -> Option<FieldType> {
        match self {
            Self::String => Some(FieldType::TextField),
            Self::Integer => Some(FieldType::IntegerField),
            Self::Date => Some(FieldType::DateField),
            Self::SameAsInput => input,
        }
    }
}

/// A transform applied to the left-hand side of a lookup.
///
/// Each backend has its own template since the SQL differs between them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transform {
    /// The name of this transform (e.g., "lower", "year").
    pub name: String,
    /// SQL template for PostgreSQL.
    pub sql_template_pg: String,
    /// SQL template for SQLite.
    pub sql_template_sqlite: String,
    /// SQL template for MySQL.
    pub sql_template_mysql: String,
    /// The output type of this transform.
    pub output_type: TransformOutput,
}

impl Transform {
    /// Creates a new transform with the same SQL across all backends.
    pub fn new(
        name: impl Into<String>,
        sql_template: impl Into<String>,
        output_type: TransformOutput,
    ) -> Self {
        let template = sql_template.into();
        Self {
            name: name.into(),
            sql_template_pg: template.clone(),
            sql_template_sqlite: template.clone(),
            sql_template_mysql: template,
            output_type,
        }
    }

    /// Creates a new transform with per-backend SQL templates.
    pub fn with_backends(
        name: impl Into<String>,
        pg: impl Into<String>,
        sqlite: impl Into<String>,
        mysql: impl Into<String>,
        output_type: TransformOutput,
    ) -> Self {
        Self {
            name: name.into(),
            sql_template_pg: pg.into(),
            sql_template_sqlite: sqlite.into(),
            sql_template_mysql: mysql.into(),
            output_type,
        }
    }

    /// Returns the SQL template for the given backend.
    pub fn sql_template(&self, backend: DatabaseBackendType) -> &str {
        match backend {
            DatabaseBackendType::PostgreSQL => &self.sql_template_pg,
            DatabaseBackendType::SQLite => &self.sql_template_sqlite,
            DatabaseBackendType::MySQL => &self.sql_template_mysql,
        }
    }

    /// Applies this transform to compiled SQL.
    pub fn apply(&self, lhs_sql: &str, backend: DatabaseBackendType) -> String {
        self.sql_template(backend).replace("{column}", lhs_sql)
    }
}

/// A registry of custom lookups and transforms.
#[derive(Debug, Clone, Default)]
pub struct LookupRegistry {
    lookups: HashMap<String, CustomLookup>,
    transforms: HashMap<String, Transform>,
}

impl LookupRegistry {
    /// Creates a registry holding only the built-in lookups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry pre-populated with the standard transforms.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_transform(
            "lower",
            Transform::new("lower", "LOWER({column})", TransformOutput::String),
        );
        registry.register_transform(
            "upper",
            Transform::new("upper", "UPPER({column})", TransformOutput::String),
        );
        registry.register_transform(
            "length",
            Transform::with_backends(
                "length",
                "LENGTH({column})",
                "LENGTH({column})",
                "CHAR_LENGTH({column})",
                TransformOutput::Integer,
            ),
        );
        registry.register_transform(
            "trim",
            Transform::new("trim", "TRIM({column})", TransformOutput::String),
        );
        for (name, pg, sqlite, mysql) in [
            ("year", "YEAR", "%Y", "YEAR"),
            ("month", "MONTH", "%m", "MONTH"),
            ("day", "DAY", "%d", "DAY"),
        ] {
            registry.register_transform(
                name,
                Transform::with_backends(
                    name,
                    format!("EXTRACT({pg} FROM {{column}})"),
                    format!("CAST(strftime('{sqlite}', {{column}}) AS INTEGER)"),
                    format!("{mysql}({{column}})"),
                    TransformOutput::Integer,
                ),
            );
        }
        registry
    }

    /// Registers a custom lookup. Built-in names cannot be overridden.
    pub fn register_lookup(&mut self, name: impl Into<String>, lookup: CustomLookup) {
        let name = name.into();
        if BuiltinLookup::from_name(&name).is_some() {
            tracing::warn!(lookup = %name, "ignoring custom lookup shadowing a built-in");
            return;
        }
        self.lookups.insert(name, lookup);
    }

    /// Registers a transform.
    pub fn register_transform(&mut self, name: impl Into<String>, transform: Transform) {
        self.transforms.insert(name.into(), transform);
    }

    /// Resolves a lookup name, built-ins first.
    pub fn get_lookup(&self, name: &str) -> Option<LookupKind> {
        BuiltinLookup::from_name(name)
            .map(LookupKind::Builtin)
            .or_else(|| self.lookups.get(name).cloned().map(LookupKind::Custom))
    }

    /// Resolves a lookup usable on a relation field.
    pub fn get_related_lookup(&self, name: &str) -> Option<LookupKind> {
        BuiltinLookup::from_name(name)
            .filter(|l| l.is_related_lookup())
            .map(LookupKind::Builtin)
    }

    /// Returns a reference to a registered transform.
    pub fn get_transform(&self, name: &str) -> Option<&Transform> {
        self.transforms.get(name)
    }

    /// Returns true if a transform with the given name is registered.
    pub fn has_transform(&self, name: &str) -> bool {
        self.transforms.contains_key(name)
    }
}
