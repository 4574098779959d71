//! Lookup path resolution.
//!
//! [`PathResolver`] walks the names of a lookup such as
//! `["author", "publisher", "name", "icontains"]` against the model registry
//! and produces the [`PathInfo`] hops needed to reach the final field. Names
//! that are not fields (lookups and transforms) are handed back unconsumed.
//!
//! Many-valued hops (reverse foreign keys and many-to-many relations) are
//! reported as [`PathResolution::RequiresSubquery`] when the caller cannot
//! allow them, so that an exclude over such a relation can be rewritten as a
//! subquery instead of a row-multiplying join.

use std::sync::Arc;

use relq_core::{RelqError, RelqResult};

use crate::fields::{FieldDef, FieldType};
use crate::model::{ModelField, ModelMeta, ModelRegistry, RelationKind};

/// The relation traversed by one join.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinField {
    /// The relation field name on the declaring model.
    pub name: String,
    /// The model declaring the foreign key.
    pub fk_model: String,
    /// The foreign key definition.
    pub field: FieldDef,
    /// Pairs of `(foreign key, referenced field)`.
    pub related_fields: Vec<(FieldDef, FieldDef)>,
    /// `true` when traversed from the declaring model.
    pub direct: bool,
}

impl JoinField {
    /// The ON clause columns as `(parent column, joined column)` pairs.
    pub fn join_cols(&self) -> Vec<(String, String)> {
        self.related_fields
            .iter()
            .map(|(fk, target)| {
                if self.direct {
                    (fk.column.clone(), target.column.clone())
                } else {
                    (target.column.clone(), fk.column.clone())
                }
            })
            .collect()
    }

    /// The fields referenced by the foreign key.
    pub fn foreign_related_fields(&self) -> Vec<&FieldDef> {
        self.related_fields.iter().map(|(_, target)| target).collect()
    }

    /// A stable identity used to decide join equivalence.
    pub fn identity(&self) -> String {
        if self.direct {
            format!("{}.{}", self.fk_model, self.name)
        } else {
            format!("{}.{}+reverse", self.fk_model, self.name)
        }
    }
}

/// One hop of a relation traversal.
#[derive(Debug, Clone, PartialEq)]
pub struct PathInfo {
    /// The model the hop starts from.
    pub from_opts: Arc<ModelMeta>,
    /// The model the hop arrives at.
    pub to_opts: Arc<ModelMeta>,
    /// The fields on `to_opts` carrying the joined value.
    pub target_fields: Vec<FieldDef>,
    /// The relation traversed.
    pub join_field: JoinField,
    /// Set for hops that can match several rows per source row.
    pub m2m: bool,
    /// Set when the hop follows a foreign key from its declaring side.
    pub direct: bool,
}

/// A fully resolved path.
#[derive(Debug, Clone)]
pub struct ResolvedPath {
    /// The hops, in traversal order.
    pub path: Vec<PathInfo>,
    /// The last field used: the relation of the last hop or the local field.
    pub final_field: ModelField,
    /// Fields guaranteed to hold the same value as `final_field`.
    pub targets: Vec<FieldDef>,
    /// The model the path ends on.
    pub opts: Arc<ModelMeta>,
    /// Names left unconsumed (lookups and transforms).
    pub rest: Vec<String>,
}

/// A many-valued hop reached while many-valued hops are not allowed.
#[derive(Debug, Clone)]
pub struct MultiJoin {
    /// Number of names consumed up to and including the many-valued relation.
    pub level: usize,
    /// The names consumed with the hops each produced.
    pub names_with_path: Vec<(String, Vec<PathInfo>)>,
}

/// The outcome of resolving a lookup path.
#[derive(Debug, Clone)]
pub enum PathResolution {
    /// Every name was resolved or left over as a lookup.
    Resolved(ResolvedPath),
    /// A many-valued relation was found and must be handled by a subquery.
    RequiresSubquery(MultiJoin),
}

/// Resolves lookup names against the model registry.
#[derive(Debug, Clone, Copy)]
pub struct PathResolver<'a> {
    registry: &'a ModelRegistry,
    annotations: &'a [String],
}

impl<'a> PathResolver<'a> {
    /// Creates a resolver. `annotations` are listed as valid choices in
    /// resolution errors.
    pub const fn new(registry: &'a ModelRegistry, annotations: &'a [String]) -> Self {
        Self {
            registry,
            annotations,
        }
    }

    /// Walks `names` starting from `opts`.
    ///
    /// With `fail_on_missing`, a name that is not a field, or a name following
    /// a non-relational field, is an error instead of being returned in
    /// [`ResolvedPath::rest`].
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for unknown names and for relations
    /// pointing at unknown models.
    pub fn resolve(
        &self,
        names: &[String],
        opts: &Arc<ModelMeta>,
        allow_many: bool,
        fail_on_missing: bool,
    ) -> RelqResult<PathResolution> {
        let mut opts = Arc::clone(opts);
        let mut path = Vec::new();
        let mut names_with_path: Vec<(String, Vec<PathInfo>)> = Vec::new();
        let mut final_field: Option<ModelField> = None;
        let mut targets: Vec<FieldDef> = Vec::new();
        let mut consumed = 0;

        for (pos, raw_name) in names.iter().enumerate() {
            let name = if raw_name == "pk" {
                opts.pk().name.clone()
            } else {
                raw_name.clone()
            };
            let mut cur_path = Vec::new();

            let field = match self.registry.get_field(&opts, &name) {
                Some(field) => Some(field),
                None if pos == 0 => self.default_related_name_shortcut(&opts, &name),
                None => None,
            };
            let Some(field) = field else {
                if pos == 0 || fail_on_missing {
                    return Err(self.unknown_field(&opts, &name));
                }
                break;
            };

            if field.owner() != opts.label {
                for parent in self.registry.base_chain(&opts, field.owner()) {
                    let link = opts.parent_link(&parent.label).cloned().ok_or_else(|| {
                        RelqError::FieldError(format!(
                            "Model '{}' has no parent link to '{}'",
                            opts.label, parent.label
                        ))
                    })?;
                    let info = self.forward(&opts, &link)?;
                    targets.clone_from(&info.target_fields);
                    final_field = Some(ModelField::Declared {
                        owner: opts.label.clone(),
                        field: link,
                    });
                    path.push(info.clone());
                    cur_path.push(info);
                    opts = parent;
                }
            }

            consumed = pos + 1;
            if field.is_relation() {
                let infos = self.path_infos(&field)?;
                if !allow_many {
                    if let Some(inner_pos) = infos.iter().position(|p| p.m2m) {
                        cur_path.extend(infos[..=inner_pos].iter().cloned());
                        names_with_path.push((name, cur_path));
                        tracing::trace!(level = pos + 1, "path requires a subquery");
                        return Ok(PathResolution::RequiresSubquery(MultiJoin {
                            level: pos + 1,
                            names_with_path,
                        }));
                    }
                }
                let Some(last) = infos.last().cloned() else {
                    break;
                };
                path.extend(infos.iter().cloned());
                opts = last.to_opts;
                targets = last.target_fields;
                final_field = Some(field);
                cur_path.extend(infos);
                names_with_path.push((name, cur_path));
            } else {
                let def = field.field_def().cloned();
                targets = def.into_iter().collect();
                final_field = Some(field);
                if fail_on_missing {
                    if let Some(next) = names.get(pos + 1) {
                        return Err(RelqError::FieldError(format!(
                            "Cannot resolve keyword '{next}' into field. Join on '{name}' not permitted."
                        )));
                    }
                }
                break;
            }
        }

        let Some(final_field) = final_field else {
            return Err(RelqError::FieldError(
                "Cannot resolve an empty lookup path".to_string(),
            ));
        };
        Ok(PathResolution::Resolved(ResolvedPath {
            path,
            final_field,
            targets,
            opts,
            rest: names[consumed..].to_vec(),
        }))
    }

    /// The hops needed to traverse a relation field.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] if the relation or its intermediate
    /// model cannot be found in the registry.
    pub fn path_infos(&self, field: &ModelField) -> RelqResult<Vec<PathInfo>> {
        match field {
            ModelField::Declared { owner, field } => {
                let owner = self.registry.require(owner)?;
                if field.is_many_to_many() {
                    let (through, source_fk, target_fk) = self.m2m_parts(&owner, &field.name)?;
                    Ok(vec![
                        self.reverse(&through, &source_fk)?,
                        self.forward(&through, &target_fk)?,
                    ])
                } else {
                    Ok(vec![self.forward(&owner, field)?])
                }
            }
            ModelField::Reverse { relation, .. } => {
                let declaring = self.registry.require(&relation.related_model)?;
                if relation.kind == RelationKind::ManyToMany {
                    let (through, source_fk, target_fk) =
                        self.m2m_parts(&declaring, &relation.field_name)?;
                    Ok(vec![
                        self.reverse(&through, &target_fk)?,
                        self.forward(&through, &source_fk)?,
                    ])
                } else {
                    let fk = declaring
                        .local_field(&relation.field_name)
                        .cloned()
                        .ok_or_else(|| missing_field(&declaring, &relation.field_name))?;
                    Ok(vec![self.reverse(&declaring, &fk)?])
                }
            }
        }
    }

    fn m2m_parts(
        &self,
        declaring: &ModelMeta,
        field_name: &str,
    ) -> RelqResult<(Arc<ModelMeta>, FieldDef, FieldDef)> {
        let link = declaring.m2m_link(field_name).ok_or_else(|| {
            RelqError::FieldError(format!(
                "Many-to-many field '{}.{field_name}' has no intermediate model",
                declaring.label
            ))
        })?;
        let through = self.registry.require(&link.through)?;
        let source_fk = through
            .local_field(&link.source_fk)
            .cloned()
            .ok_or_else(|| missing_field(&through, &link.source_fk))?;
        let target_fk = through
            .local_field(&link.target_fk)
            .cloned()
            .ok_or_else(|| missing_field(&through, &link.target_fk))?;
        Ok((through, source_fk, target_fk))
    }

    /// The field a foreign key points at on its target model.
    fn remote_target(&self, fk: &FieldDef) -> RelqResult<(Arc<ModelMeta>, FieldDef)> {
        let to = fk
            .field_type
            .related_model()
            .ok_or_else(|| RelqError::FieldError(format!("'{}' is not a relation", fk.name)))?;
        let to_opts = self.registry.require(to)?;
        let target = match &fk.field_type {
            FieldType::ForeignKey {
                to_field: Some(to_field),
                ..
            } => to_opts
                .local_field(to_field)
                .cloned()
                .ok_or_else(|| missing_field(&to_opts, to_field))?,
            _ => to_opts.pk().clone(),
        };
        Ok((to_opts, target))
    }

    fn forward(&self, from: &Arc<ModelMeta>, fk: &FieldDef) -> RelqResult<PathInfo> {
        let (to_opts, target) = self.remote_target(fk)?;
        Ok(PathInfo {
            from_opts: Arc::clone(from),
            to_opts,
            target_fields: vec![target.clone()],
            join_field: JoinField {
                name: fk.name.clone(),
                fk_model: from.label.clone(),
                field: fk.clone(),
                related_fields: vec![(fk.clone(), target)],
                direct: true,
            },
            m2m: false,
            direct: true,
        })
    }

    /// The hop from the model `fk` points at back to `declaring`.
    fn reverse(&self, declaring: &Arc<ModelMeta>, fk: &FieldDef) -> RelqResult<PathInfo> {
        let (from_opts, target) = self.remote_target(fk)?;
        Ok(PathInfo {
            from_opts,
            to_opts: Arc::clone(declaring),
            target_fields: vec![declaring.pk().clone()],
            join_field: JoinField {
                name: fk.name.clone(),
                fk_model: declaring.label.clone(),
                field: fk.clone(),
                related_fields: vec![(fk.clone(), target)],
                direct: false,
            },
            m2m: !fk.unique,
            direct: false,
        })
    }

    fn default_related_name_shortcut(&self, opts: &ModelMeta, name: &str) -> Option<ModelField> {
        let relation = opts.related_objects().iter().find(|rel| {
            rel.from_default_name
                && self
                    .registry
                    .get(&rel.related_model)
                    .is_some_and(|m| m.model_name == name)
        })?;
        tracing::warn!(
            lookup = %name,
            default_related_name = %relation.name,
            "query lookup by model name is deprecated in favor of default_related_name"
        );
        self.registry.get_field(opts, &relation.name)
    }

    fn unknown_field(&self, opts: &ModelMeta, name: &str) -> RelqError {
        let mut available = self.registry.field_names(opts);
        available.extend(self.annotations.iter().cloned());
        available.sort();
        RelqError::FieldError(format!(
            "Cannot resolve keyword '{name}' into field. Choices are: {}",
            available.join(", ")
        ))
    }
}

fn missing_field(opts: &ModelMeta, name: &str) -> RelqError {
    RelqError::FieldError(format!("{} has no field named '{name}'", opts.label))
}
