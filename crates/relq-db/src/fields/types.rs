//! Field type definitions.
//!
//! Each [`FieldType`] variant corresponds to a model field class and
//! [`FieldDef`] captures the metadata the query engine needs about a single
//! field: its name, column, nullability, and relation target.

/// The type of a model field.
///
/// Relational fields (`ForeignKey`, `OneToOneField`, `ManyToManyField`) carry
/// the label of their target model and the name used for the reverse relation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum FieldType {
    /// Auto-incrementing 32-bit integer primary key.
    AutoField,
    /// Auto-incrementing 64-bit integer primary key.
    BigAutoField,
    /// Variable-length string.
    CharField,
    /// Unlimited-length text.
    TextField,
    /// 32-bit signed integer.
    IntegerField,
    /// 64-bit signed integer.
    BigIntegerField,
    /// 64-bit floating-point number.
    FloatField,
    /// Fixed-precision decimal number.
    DecimalField {
        /// Maximum total digits.
        max_digits: u32,
        /// Digits after the decimal point.
        decimal_places: u32,
    },
    /// Boolean (true/false).
    BooleanField,
    /// Date without time.
    DateField,
    /// Date and time.
    DateTimeField,
    /// Time without date.
    TimeField,
    /// UUID field.
    UuidField,
    /// Raw binary data.
    BinaryField,
    /// JSON data.
    JsonField,
    /// Email address.
    EmailField,
    /// Slug (URL-friendly string).
    SlugField,
    /// Many-to-one relationship.
    ForeignKey {
        /// The target model label (e.g. "library.author").
        to: String,
        /// The name used for the reverse relation. A name ending in `+`
        /// hides the reverse relation.
        related_name: Option<String>,
        /// The target field; the target's primary key when unset.
        to_field: Option<String>,
    },
    /// One-to-one relationship.
    OneToOneField {
        /// The target model label.
        to: String,
        /// The name used for the reverse relation.
        related_name: Option<String>,
        /// Marks the link from a child model to its concrete parent.
        parent_link: bool,
    },
    /// Many-to-many relationship through an intermediate table.
    ManyToManyField {
        /// The target model label.
        to: String,
        /// Optional explicit intermediate ("through") model label.
        through: Option<String>,
        /// The name used for the reverse relation.
        related_name: Option<String>,
    },
}

impl FieldType {
    /// Returns `true` for relational field types.
    pub const fn is_relation(&self) -> bool {
        matches!(
            self,
            Self::ForeignKey { .. } | Self::OneToOneField { .. } | Self::ManyToManyField { .. }
        )
    }

    /// Returns the target model label of a relational field.
    pub fn related_model(&self) -> Option<&str> {
        match self {
            Self::ForeignKey { to, .. }
            | Self::OneToOneField { to, .. }
            | Self::ManyToManyField { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Returns the explicit reverse relation name, if any.
    pub fn related_name(&self) -> Option<&str> {
        match self {
            Self::ForeignKey { related_name, .. }
            | Self::OneToOneField { related_name, .. }
            | Self::ManyToManyField { related_name, .. } => related_name.as_deref(),
            _ => None,
        }
    }

    /// Returns `true` if the field stores text and so accepts the empty string
    /// as a distinct value.
    pub const fn empty_strings_allowed(&self) -> bool {
        matches!(
            self,
            Self::CharField | Self::TextField | Self::EmailField | Self::SlugField | Self::BinaryField
        )
    }

    /// Returns the name of the field class, used in error messages.
    pub const fn internal_type(&self) -> &'static str {
        match self {
            Self::AutoField => "AutoField",
            Self::BigAutoField => "BigAutoField",
            Self::CharField => "CharField",
            Self::TextField => "TextField",
            Self::IntegerField => "IntegerField",
            Self::BigIntegerField => "BigIntegerField",
            Self::FloatField => "FloatField",
            Self::DecimalField { .. } => "DecimalField",
            Self::BooleanField => "BooleanField",
            Self::DateField => "DateField",
            Self::DateTimeField => "DateTimeField",
            Self::TimeField => "TimeField",
            Self::UuidField => "UUIDField",
            Self::BinaryField => "BinaryField",
            Self::JsonField => "JSONField",
            Self::EmailField => "EmailField",
            Self::SlugField => "SlugField",
            Self::ForeignKey { .. } => "ForeignKey",
            Self::OneToOneField { .. } => "OneToOneField",
            Self::ManyToManyField { .. } => "ManyToManyField",
        }
    }
}

/// Definition of a model field.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FieldDef {
    /// The attribute name of this field.
    pub name: String,
    /// The database column name. Empty for many-to-many fields.
    pub column: String,
    /// The type of this field.
    pub field_type: FieldType,
    /// Whether this field is the primary key.
    pub primary_key: bool,
    /// Whether NULL is allowed in the database.
    pub null: bool,
    /// Whether a UNIQUE constraint is applied.
    pub unique: bool,
}

impl FieldDef {
    /// Creates a new `FieldDef`.
    ///
    /// Foreign keys and one-to-one fields get a `<name>_id` column; many-to-many
    /// fields have no column.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        let column = match field_type {
            FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. } => format!("{name}_id"),
            FieldType::ManyToManyField { .. } => String::new(),
            _ => name.clone(),
        };
        let unique = matches!(field_type, FieldType::OneToOneField { .. });
        Self {
            name,
            column,
            field_type,
            primary_key: false,
            null: false,
            unique,
        }
    }

    /// Shorthand for a `ForeignKey` to `to`.
    pub fn foreign_key(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::ForeignKey {
                to: to.into(),
                related_name: None,
                to_field: None,
            },
        )
    }

    /// Shorthand for a `ManyToManyField` to `to`.
    pub fn many_to_many(name: impl Into<String>, to: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldType::ManyToManyField {
                to: to.into(),
                through: None,
                related_name: None,
            },
        )
    }

    /// Sets the database column name.
    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    /// Marks this field as the primary key.
    #[must_use]
    pub const fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.unique = true;
        self
    }

    /// Allows NULL values in the database.
    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.null = true;
        self
    }

    /// Marks this field as having a UNIQUE constraint.
    #[must_use]
    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Sets the reverse relation name of a relational field.
    #[must_use]
    pub fn related_name(mut self, name: impl Into<String>) -> Self {
        match &mut self.field_type {
            FieldType::ForeignKey { related_name, .. }
            | FieldType::OneToOneField { related_name, .. }
            | FieldType::ManyToManyField { related_name, .. } => *related_name = Some(name.into()),
            _ => {}
        }
        self
    }

    /// Sets the explicit intermediate model of a many-to-many field.
    #[must_use]
    pub fn through(mut self, model: impl Into<String>) -> Self {
        if let FieldType::ManyToManyField { through, .. } = &mut self.field_type {
            *through = Some(model.into());
        }
        self
    }

    /// The attribute holding the raw column value (`author_id` for a foreign
    /// key named `author`).
    pub fn attname(&self) -> &str {
        match self.field_type {
            FieldType::ForeignKey { .. } | FieldType::OneToOneField { .. } => &self.column,
            _ => &self.name,
        }
    }

    /// Returns `true` if this field represents a relational field.
    pub const fn is_relation(&self) -> bool {
        self.field_type.is_relation()
    }

    /// Returns `true` if the field is backed by a column on its own table.
    pub const fn is_concrete(&self) -> bool {
        !matches!(self.field_type, FieldType::ManyToManyField { .. })
    }

    /// Returns `true` for a many-to-many field.
    pub const fn is_many_to_many(&self) -> bool {
        matches!(self.field_type, FieldType::ManyToManyField { .. })
    }

    /// Returns `true` for a one-to-one field.
    pub const fn one_to_one(&self) -> bool {
        matches!(self.field_type, FieldType::OneToOneField { .. })
    }

    /// Returns `true` if this one-to-one field links a child model to its parent.
    pub const fn is_parent_link(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::OneToOneField {
                parent_link: true,
                ..
            }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_def_new_defaults() {
        let f = FieldDef::new("title", FieldType::CharField);
        assert_eq!(f.name, "title");
        assert_eq!(f.column, "title");
        assert!(!f.primary_key);
        assert!(!f.null);
        assert!(!f.unique);
        assert!(f.is_concrete());
    }

    #[test]
    fn test_foreign_key_column() {
        let f = FieldDef::foreign_key("author", "library.author").nullable();
        assert_eq!(f.column, "author_id");
        assert_eq!(f.attname(), "author_id");
        assert!(f.null);
        assert!(f.is_relation());
        assert_eq!(f.field_type.related_model(), Some("library.author"));
    }

    #[test]
    fn test_many_to_many_has_no_column() {
        let f = FieldDef::many_to_many("tags", "library.tag").through("library.tagging");
        assert!(f.column.is_empty());
        assert!(!f.is_concrete());
        assert!(f.is_many_to_many());
        assert!(matches!(
            f.field_type,
            FieldType::ManyToManyField { through: Some(ref t), .. } if t == "library.tagging"
        ));
    }

    #[test]
    fn test_related_name_builder() {
        let f = FieldDef::foreign_key("editor", "library.author").related_name("edited");
        assert_eq!(f.field_type.related_name(), Some("edited"));

        let plain = FieldDef::new("name", FieldType::CharField).related_name("ignored");
        assert_eq!(plain.field_type.related_name(), None);
    }

    #[test]
    fn test_parent_link() {
        let f = FieldDef::new(
            "place_ptr",
            FieldType::OneToOneField {
                to: "places.place".into(),
                related_name: None,
                parent_link: true,
            },
        )
        .primary_key();
        assert!(f.is_parent_link());
        assert!(f.one_to_one());
        assert!(f.unique);
        assert_eq!(f.column, "place_ptr_id");
    }

    #[test]
    fn test_column_override() {
        let f = FieldDef::new("title", FieldType::CharField).column("book_title");
        assert_eq!(f.column, "book_title");
        assert_eq!(f.attname(), "title");
    }

    #[test]
    fn test_empty_strings_allowed() {
        assert!(FieldType::CharField.empty_strings_allowed());
        assert!(!FieldType::IntegerField.empty_strings_allowed());
        assert_eq!(FieldType::UuidField.internal_type(), "UUIDField");
    }
}
