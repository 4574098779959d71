//! Model metadata and the model registry.
//!
//! [`ModelMeta`] describes one model: its label, table, fields, and default
//! ordering. [`ModelRegistry`] holds every model of an application, validates
//! the relations between them, creates the implicit intermediate models of
//! many-to-many fields, and indexes reverse relations so that lookups can be
//! resolved from either side of a relation.

use std::collections::BTreeMap;
use std::sync::Arc;

use relq_core::{RelqError, RelqResult};

use crate::fields::{FieldDef, FieldType};

/// Metadata about a model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelMeta {
    /// Unique `app_label.model_name` label (e.g. "library.book").
    pub label: String,
    /// The application label (e.g. "library").
    pub app_label: String,
    /// The model name in lowercase (e.g. "book").
    pub model_name: String,
    /// The database table name.
    pub db_table: String,
    /// Field definitions declared on this model.
    pub fields: Vec<FieldDef>,
    /// Default ordering applied when a query has none, e.g. `["-published"]`.
    pub ordering: Vec<String>,
    /// Reverse relation name used when a relation pointing at another model
    /// declares none.
    pub default_related_name: Option<String>,
    /// Set for intermediate models created for many-to-many fields.
    pub auto_created: bool,
    pub(crate) pk_index: usize,
    pub(crate) reverse_relations: Vec<ReverseRelation>,
    pub(crate) m2m_links: BTreeMap<String, M2mLink>,
}

impl ModelMeta {
    /// Creates metadata for the model with the given `app.model` label.
    ///
    /// The table name defaults to `app_model`.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into().to_lowercase();
        let (app_label, model_name) = match label.split_once('.') {
            Some((app, model)) => (app.to_string(), model.to_string()),
            None => (String::new(), label.clone()),
        };
        let db_table = if app_label.is_empty() {
            model_name.clone()
        } else {
            format!("{app_label}_{model_name}")
        };
        Self {
            label,
            app_label,
            model_name,
            db_table,
            fields: Vec::new(),
            ordering: Vec::new(),
            default_related_name: None,
            auto_created: false,
            pk_index: 0,
            reverse_relations: Vec::new(),
            m2m_links: BTreeMap::new(),
        }
    }

    /// Sets the database table name.
    #[must_use]
    pub fn db_table(mut self, table: impl Into<String>) -> Self {
        self.db_table = table.into();
        self
    }

    /// Adds a field.
    #[must_use]
    pub fn field(mut self, field: FieldDef) -> Self {
        self.fields.push(field);
        self
    }

    /// Sets the default ordering.
    #[must_use]
    pub fn ordering(mut self, ordering: &[&str]) -> Self {
        self.ordering = ordering.iter().map(|s| (*s).to_string()).collect();
        self
    }

    /// Sets the default reverse relation name for relations declared here.
    #[must_use]
    pub fn default_related_name(mut self, name: impl Into<String>) -> Self {
        self.default_related_name = Some(name.into());
        self
    }

    /// Declares this model a child of `parent`, adding the
    /// `<parent>_ptr` primary key link.
    #[must_use]
    pub fn inherits(self, parent: impl Into<String>) -> Self {
        let parent = parent.into().to_lowercase();
        let parent_name = parent.rsplit('.').next().unwrap_or(&parent).to_string();
        let link = FieldDef::new(
            format!("{parent_name}_ptr"),
            FieldType::OneToOneField {
                to: parent,
                related_name: None,
                parent_link: true,
            },
        )
        .primary_key();
        self.field(link)
    }

    /// The primary key field.
    pub fn pk(&self) -> &FieldDef {
        &self.fields[self.pk_index]
    }

    /// Looks up a field declared directly on this model by name or attname.
    pub fn local_field(&self, name: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|f| f.name == name || (f.is_concrete() && f.attname() == name))
    }

    /// Fields with a column on this model's own table.
    pub fn concrete_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.fields.iter().filter(|f| f.is_concrete())
    }

    /// Labels of the concrete parents of this model.
    pub fn parents(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.is_parent_link())
            .filter_map(|f| f.field_type.related_model())
    }

    /// The link field pointing at the direct parent `parent`.
    pub fn parent_link(&self, parent: &str) -> Option<&FieldDef> {
        self.fields
            .iter()
            .find(|f| f.is_parent_link() && f.field_type.related_model() == Some(parent))
    }

    /// Reverse relations pointing at this model.
    pub fn related_objects(&self) -> &[ReverseRelation] {
        &self.reverse_relations
    }

    pub(crate) fn m2m_link(&self, field: &str) -> Option<&M2mLink> {
        self.m2m_links.get(field)
    }
}

/// The cardinality of a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    /// Many-to-one.
    ForeignKey,
    /// One-to-one.
    OneToOne,
    /// Many-to-many.
    ManyToMany,
}

/// A relation seen from the model it points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReverseRelation {
    /// The name used to traverse the relation in lookups.
    pub name: String,
    /// The model declaring the relation field.
    pub related_model: String,
    /// The relation field on `related_model`.
    pub field_name: String,
    /// Cardinality of the declaring field.
    pub kind: RelationKind,
    /// Set when `name` came from the declaring model's `default_related_name`.
    pub from_default_name: bool,
}

/// How a many-to-many field reaches its target through the intermediate model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct M2mLink {
    pub through: String,
    /// Foreign key on `through` pointing at the declaring model.
    pub source_fk: String,
    /// Foreign key on `through` pointing at the target model.
    pub target_fk: String,
}

/// A field found on a model: either declared (possibly on a parent) or the
/// reverse side of a relation declared elsewhere.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelField {
    /// A field declared on `owner`.
    Declared {
        /// The model declaring the field.
        owner: String,
        /// The field definition.
        field: FieldDef,
    },
    /// A relation declared on another model and pointing at `owner`.
    Reverse {
        /// The model the relation points at.
        owner: String,
        /// The reverse relation.
        relation: ReverseRelation,
    },
}

impl ModelField {
    /// The lookup name of the field.
    pub fn name(&self) -> &str {
        match self {
            Self::Declared { field, .. } => &field.name,
            Self::Reverse { relation, .. } => &relation.name,
        }
    }

    /// The model this field belongs to.
    pub fn owner(&self) -> &str {
        match self {
            Self::Declared { owner, .. } | Self::Reverse { owner, .. } => owner,
        }
    }

    /// Returns `true` for relation fields of either direction.
    pub fn is_relation(&self) -> bool {
        match self {
            Self::Declared { field, .. } => field.is_relation(),
            Self::Reverse { .. } => true,
        }
    }

    /// Returns `true` for fields declared on the model (as opposed to reverse
    /// relations).
    pub const fn concrete(&self) -> bool {
        matches!(self, Self::Declared { .. })
    }

    /// Returns `true` for many-to-many relations of either direction.
    pub fn many_to_many(&self) -> bool {
        match self {
            Self::Declared { field, .. } => field.is_many_to_many(),
            Self::Reverse { relation, .. } => relation.kind == RelationKind::ManyToMany,
        }
    }

    /// Returns `true` for one-to-one relations of either direction.
    pub fn one_to_one(&self) -> bool {
        match self {
            Self::Declared { field, .. } => field.one_to_one(),
            Self::Reverse { relation, .. } => relation.kind == RelationKind::OneToOne,
        }
    }

    /// The model on the other side of a relation.
    pub fn related_model(&self) -> Option<&str> {
        match self {
            Self::Declared { field, .. } => field.field_type.related_model(),
            Self::Reverse { relation, .. } => Some(&relation.related_model),
        }
    }

    /// The declared field definition, if any.
    pub const fn field_def(&self) -> Option<&FieldDef> {
        match self {
            Self::Declared { field, .. } => Some(field),
            Self::Reverse { .. } => None,
        }
    }

    /// Returns `true` for the reverse side of a one-to-one relation.
    pub fn is_reverse_one_to_one(&self) -> bool {
        matches!(self, Self::Reverse { relation, .. } if relation.kind == RelationKind::OneToOne)
    }

    /// Name of the field class, used in error messages.
    pub fn internal_type(&self) -> &'static str {
        match self {
            Self::Declared { field, .. } => field.field_type.internal_type(),
            Self::Reverse { relation, .. } => match relation.kind {
                RelationKind::ForeignKey => "ManyToOneRel",
                RelationKind::OneToOne => "OneToOneRel",
                RelationKind::ManyToMany => "ManyToManyRel",
            },
        }
    }
}

// ── Registry ────────────────────────────────────────────────────────

/// Collects model definitions before validation.
#[derive(Debug, Default)]
pub struct ModelRegistryBuilder {
    models: Vec<ModelMeta>,
}

impl ModelRegistryBuilder {
    /// Adds a model.
    #[must_use]
    pub fn model(mut self, meta: ModelMeta) -> Self {
        self.models.push(meta);
        self
    }

    /// Validates the models and builds the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::ConfigurationError`] for duplicate labels, multiple
    /// primary keys, relations to unknown models, or intermediate models
    /// lacking the required foreign keys.
    pub fn build(self) -> RelqResult<ModelRegistry> {
        let mut models: BTreeMap<String, ModelMeta> = BTreeMap::new();
        for meta in self.models {
            if models.contains_key(&meta.label) {
                return Err(RelqError::ConfigurationError(format!(
                    "Model '{}' is registered twice",
                    meta.label
                )));
            }
            models.insert(meta.label.clone(), meta);
        }

        for meta in models.values_mut() {
            resolve_self_references(meta);
            assign_primary_key(meta)?;
        }

        validate_targets(&models)?;
        create_through_models(&mut models)?;
        link_many_to_many(&mut models)?;
        index_reverse_relations(&mut models);

        tracing::debug!(models = models.len(), "model registry built");
        Ok(ModelRegistry {
            models: models
                .into_iter()
                .map(|(label, meta)| (label, Arc::new(meta)))
                .collect(),
        })
    }
}

/// Validated, immutable set of models.
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: BTreeMap<String, Arc<ModelMeta>>,
}

impl ModelRegistry {
    /// Starts a new registry builder.
    pub fn builder() -> ModelRegistryBuilder {
        ModelRegistryBuilder::default()
    }

    /// Looks up a model by label.
    pub fn get(&self, label: &str) -> Option<Arc<ModelMeta>> {
        self.models.get(&label.to_lowercase()).cloned()
    }

    /// Looks up a model by label, failing with a field error if missing.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] if the model is unknown.
    pub fn require(&self, label: &str) -> RelqResult<Arc<ModelMeta>> {
        self.get(label)
            .ok_or_else(|| RelqError::FieldError(format!("Unknown model '{label}'")))
    }

    /// Iterates over all registered models in label order.
    pub fn models(&self) -> impl Iterator<Item = &Arc<ModelMeta>> {
        self.models.values()
    }

    /// Finds a field on `opts` by name: declared fields (by name or attname),
    /// then reverse relations, then the fields of concrete parents.
    pub fn get_field(&self, opts: &ModelMeta, name: &str) -> Option<ModelField> {
        if let Some(field) = opts.local_field(name) {
            return Some(ModelField::Declared {
                owner: opts.label.clone(),
                field: field.clone(),
            });
        }
        if let Some(relation) = opts.reverse_relations.iter().find(|r| r.name == name) {
            return Some(ModelField::Reverse {
                owner: opts.label.clone(),
                relation: relation.clone(),
            });
        }
        opts.parents()
            .filter_map(|parent| self.get(parent))
            .find_map(|parent| self.get_field(&parent, name))
    }

    /// All names usable in a lookup on `opts`, sorted.
    pub fn field_names(&self, opts: &ModelMeta) -> Vec<String> {
        let mut names = Vec::new();
        self.collect_field_names(opts, &mut names);
        names.sort();
        names.dedup();
        names
    }

    fn collect_field_names(&self, opts: &ModelMeta, names: &mut Vec<String>) {
        for field in &opts.fields {
            names.push(field.name.clone());
            if field.is_concrete() && field.attname() != field.name {
                names.push(field.attname().to_string());
            }
        }
        names.extend(opts.reverse_relations.iter().map(|r| r.name.clone()));
        for parent in opts.parents().filter_map(|p| self.get(p)) {
            self.collect_field_names(&parent, names);
        }
    }

    /// The chain of parents leading from `opts` up to `ancestor`, excluding
    /// `opts` and including `ancestor`. Empty when `ancestor` is not a parent.
    pub fn base_chain(&self, opts: &ModelMeta, ancestor: &str) -> Vec<Arc<ModelMeta>> {
        for parent in opts.parents().filter_map(|p| self.get(p)) {
            if parent.label == ancestor {
                return vec![parent];
            }
            let rest = self.base_chain(&parent, ancestor);
            if !rest.is_empty() {
                let mut chain = vec![parent];
                chain.extend(rest);
                return chain;
            }
        }
        Vec::new()
    }

    /// Every concrete field available on `opts`, including inherited ones,
    /// paired with the model declaring it. Parents come first.
    pub fn all_concrete_fields(&self, opts: &ModelMeta) -> Vec<(Arc<ModelMeta>, FieldDef)> {
        let mut out = Vec::new();
        for parent in opts.parents().filter_map(|p| self.get(p)) {
            out.extend(self.all_concrete_fields(&parent));
        }
        if let Some(own) = self.get(&opts.label) {
            out.extend(opts.concrete_fields().map(|f| (Arc::clone(&own), f.clone())));
        }
        out
    }
}

// ── Build steps ─────────────────────────────────────────────────────

fn resolve_self_references(meta: &mut ModelMeta) {
    let label = meta.label.clone();
    for field in &mut meta.fields {
        match &mut field.field_type {
            FieldType::ForeignKey { to, .. } | FieldType::OneToOneField { to, .. } => {
                normalize_label(to, &label);
            }
            FieldType::ManyToManyField { to, through, .. } => {
                normalize_label(to, &label);
                if let Some(through) = through {
                    *through = through.to_lowercase();
                }
            }
            _ => {}
        }
    }
}

fn normalize_label(target: &mut String, own: &str) {
    if target == "self" {
        *target = own.to_string();
    } else {
        *target = target.to_lowercase();
    }
}

fn assign_primary_key(meta: &mut ModelMeta) -> RelqResult<()> {
    let pks: Vec<usize> = meta
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.primary_key)
        .map(|(i, _)| i)
        .collect();
    match pks.as_slice() {
        [] => {
            meta.fields
                .insert(0, FieldDef::new("id", FieldType::BigAutoField).primary_key());
            meta.pk_index = 0;
        }
        [index] => meta.pk_index = *index,
        _ => {
            return Err(RelqError::ConfigurationError(format!(
                "Model '{}' declares more than one primary key",
                meta.label
            )))
        }
    }
    Ok(())
}

fn validate_targets(models: &BTreeMap<String, ModelMeta>) -> RelqResult<()> {
    for meta in models.values() {
        for field in &meta.fields {
            let targets = field
                .field_type
                .related_model()
                .into_iter()
                .chain(match &field.field_type {
                    FieldType::ManyToManyField {
                        through: Some(through),
                        ..
                    } => Some(through.as_str()),
                    _ => None,
                });
            for target in targets {
                if !models.contains_key(&target.to_lowercase()) {
                    return Err(RelqError::ConfigurationError(format!(
                        "Field '{}.{}' relates to unknown model '{target}'",
                        meta.label, field.name
                    )));
                }
            }
        }
    }
    Ok(())
}

fn create_through_models(models: &mut BTreeMap<String, ModelMeta>) -> RelqResult<()> {
    let mut created = Vec::new();
    for meta in models.values_mut() {
        let (app_label, model_name, db_table) =
            (meta.app_label.clone(), meta.model_name.clone(), meta.db_table.clone());
        let label = meta.label.clone();
        for field in &mut meta.fields {
            let FieldType::ManyToManyField { to, through, .. } = &mut field.field_type else {
                continue;
            };
            if through.is_some() {
                continue;
            }
            let through_label = format!("{app_label}.{model_name}_{}", field.name);
            let target_name = to.rsplit('.').next().unwrap_or(to).to_string();
            let (from_name, to_name) = if *to == label {
                (format!("from_{model_name}"), format!("to_{model_name}"))
            } else {
                (model_name.clone(), target_name)
            };
            let hidden = format!("{model_name}_{}+", field.name);
            let mut through_meta = ModelMeta::new(&through_label)
                .db_table(format!("{db_table}_{}", field.name))
                .field(FieldDef::new("id", FieldType::BigAutoField).primary_key())
                .field(FieldDef::foreign_key(from_name, &label).related_name(&hidden))
                .field(FieldDef::foreign_key(to_name, to.as_str()).related_name(&hidden));
            through_meta.auto_created = true;
            *through = Some(through_label);
            created.push(through_meta);
        }
    }
    for meta in created {
        if models.contains_key(&meta.label) {
            return Err(RelqError::ConfigurationError(format!(
                "Intermediate model '{}' clashes with a registered model",
                meta.label
            )));
        }
        models.insert(meta.label.clone(), meta);
    }
    Ok(())
}

fn link_many_to_many(models: &mut BTreeMap<String, ModelMeta>) -> RelqResult<()> {
    let mut links = Vec::new();
    for meta in models.values() {
        for field in &meta.fields {
            let FieldType::ManyToManyField {
                to,
                through: Some(through),
                ..
            } = &field.field_type
            else {
                continue;
            };
            let through_meta = models.get(through).ok_or_else(|| {
                RelqError::ConfigurationError(format!("Unknown intermediate model '{through}'"))
            })?;
            let fk_to = |target: &str, skip: Option<&str>| {
                through_meta
                    .fields
                    .iter()
                    .filter(|f| matches!(f.field_type, FieldType::ForeignKey { .. }))
                    .find(|f| {
                        f.field_type.related_model() == Some(target)
                            && Some(f.name.as_str()) != skip
                    })
                    .map(|f| f.name.clone())
            };
            let missing = || {
                RelqError::ConfigurationError(format!(
                    "Intermediate model '{through}' of '{}.{}' needs foreign keys to both sides",
                    meta.label, field.name
                ))
            };
            let source_fk = fk_to(&meta.label, None).ok_or_else(missing)?;
            let target_fk = fk_to(to, Some(source_fk.as_str())).ok_or_else(missing)?;
            links.push((
                meta.label.clone(),
                field.name.clone(),
                M2mLink {
                    through: through.clone(),
                    source_fk,
                    target_fk,
                },
            ));
        }
    }
    for (label, field, link) in links {
        if let Some(meta) = models.get_mut(&label) {
            meta.m2m_links.insert(field, link);
        }
    }
    Ok(())
}

fn index_reverse_relations(models: &mut BTreeMap<String, ModelMeta>) {
    let mut reverse: Vec<(String, ReverseRelation)> = Vec::new();
    for meta in models.values() {
        for field in &meta.fields {
            let Some(target) = field.field_type.related_model() else {
                continue;
            };
            let kind = match field.field_type {
                FieldType::OneToOneField { .. } => RelationKind::OneToOne,
                FieldType::ManyToManyField { .. } => RelationKind::ManyToMany,
                _ => RelationKind::ForeignKey,
            };
            let (name, from_default_name) = match field.field_type.related_name() {
                Some(name) => (name.to_string(), false),
                None => match &meta.default_related_name {
                    Some(name) => (name.clone(), true),
                    None => (meta.model_name.clone(), false),
                },
            };
            if name.ends_with('+') {
                continue;
            }
            reverse.push((
                target.to_string(),
                ReverseRelation {
                    name,
                    related_model: meta.label.clone(),
                    field_name: field.name.clone(),
                    kind,
                    from_default_name,
                },
            ));
        }
    }
    for (target, relation) in reverse {
        if let Some(meta) = models.get_mut(&target) {
            meta.reverse_relations.push(relation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ModelRegistry {
        ModelRegistry::builder()
            .model(
                ModelMeta::new("library.author")
                    .field(FieldDef::new("name", FieldType::CharField))
                    .field(FieldDef::foreign_key("mentor", "self").nullable().related_name("mentees")),
            )
            .model(
                ModelMeta::new("library.book")
                    .field(FieldDef::new("title", FieldType::CharField))
                    .field(FieldDef::foreign_key("author", "library.author"))
                    .field(FieldDef::many_to_many("tags", "library.tag")),
            )
            .model(ModelMeta::new("library.tag").field(FieldDef::new("name", FieldType::CharField)))
            .model(ModelMeta::new("places.place").field(FieldDef::new("name", FieldType::CharField)))
            .model(
                ModelMeta::new("places.restaurant")
                    .inherits("places.place")
                    .field(FieldDef::new("serves_pizza", FieldType::BooleanField)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_model_meta_defaults() {
        let meta = ModelMeta::new("Library.Book");
        assert_eq!(meta.label, "library.book");
        assert_eq!(meta.app_label, "library");
        assert_eq!(meta.model_name, "book");
        assert_eq!(meta.db_table, "library_book");
    }

    #[test]
    fn test_auto_primary_key() {
        let reg = registry();
        let book = reg.get("library.book").unwrap();
        assert_eq!(book.pk().name, "id");
        assert!(book.pk().primary_key);
    }

    #[test]
    fn test_child_primary_key_is_parent_link() {
        let reg = registry();
        let restaurant = reg.get("places.restaurant").unwrap();
        assert_eq!(restaurant.pk().name, "place_ptr");
        assert_eq!(restaurant.parents().collect::<Vec<_>>(), vec!["places.place"]);
    }

    #[test]
    fn test_duplicate_primary_keys_rejected() {
        let result = ModelRegistry::builder()
            .model(
                ModelMeta::new("a.b")
                    .field(FieldDef::new("x", FieldType::IntegerField).primary_key())
                    .field(FieldDef::new("y", FieldType::IntegerField).primary_key()),
            )
            .build();
        assert!(matches!(result, Err(RelqError::ConfigurationError(_))));
    }

    #[test]
    fn test_unknown_target_rejected() {
        let result = ModelRegistry::builder()
            .model(ModelMeta::new("a.b").field(FieldDef::foreign_key("c", "a.missing")))
            .build();
        assert!(matches!(result, Err(RelqError::ConfigurationError(_))));
    }

    #[test]
    fn test_auto_through_model() {
        let reg = registry();
        let through = reg.get("library.book_tags").unwrap();
        assert!(through.auto_created);
        assert_eq!(through.db_table, "library_book_tags");
        assert!(through.local_field("book").is_some());
        assert!(through.local_field("tag_id").is_some());

        let book = reg.get("library.book").unwrap();
        let link = book.m2m_link("tags").unwrap();
        assert_eq!(link.through, "library.book_tags");
        assert_eq!(link.source_fk, "book");
        assert_eq!(link.target_fk, "tag");
    }

    #[test]
    fn test_reverse_relations() {
        let reg = registry();
        let author = reg.get("library.author").unwrap();
        let book_rel = reg.get_field(&author, "book").unwrap();
        assert!(!book_rel.concrete());
        assert!(book_rel.is_relation());
        assert_eq!(book_rel.related_model(), Some("library.book"));

        let mentees = reg.get_field(&author, "mentees").unwrap();
        assert_eq!(mentees.related_model(), Some("library.author"));

        let tag = reg.get("library.tag").unwrap();
        assert!(reg.get_field(&tag, "book").unwrap().many_to_many());
        // Through-model foreign keys stay hidden.
        assert!(reg.get_field(&tag, "book_tags").is_none());
    }

    #[test]
    fn test_get_field_by_attname() {
        let reg = registry();
        let book = reg.get("library.book").unwrap();
        let field = reg.get_field(&book, "author_id").unwrap();
        assert_eq!(field.name(), "author");
    }

    #[test]
    fn test_inherited_field_lookup() {
        let reg = registry();
        let restaurant = reg.get("places.restaurant").unwrap();
        let name = reg.get_field(&restaurant, "name").unwrap();
        assert_eq!(name.owner(), "places.place");

        let chain = reg.base_chain(&restaurant, "places.place");
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].label, "places.place");

        let fields = reg.all_concrete_fields(&restaurant);
        let names: Vec<_> = fields.iter().map(|(_, f)| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "name", "place_ptr", "serves_pizza"]);
    }

    #[test]
    fn test_field_names_sorted() {
        let reg = registry();
        let book = reg.get("library.book").unwrap();
        assert_eq!(
            reg.field_names(&book),
            vec!["author", "author_id", "id", "tags", "title"]
        );
    }
}
