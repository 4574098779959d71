//! Filter construction.
//!
//! This module turns lookups such as `author__name__icontains` and trees of
//! [`Q`] objects into [`WhereNode`]s, setting up the joins each lookup needs
//! on the way. Joins are reused within a single `filter()` call, and
//! many-valued relations under negation are rewritten as subqueries so that
//! `exclude()` keeps its "no related row matches" meaning.

use std::collections::BTreeSet;
use std::sync::Arc;

use relq_core::{RelqError, RelqResult};

use crate::fields::{FieldDef, FieldType};
use crate::model::{ModelField, ModelMeta};
use crate::query::custom_lookups::{BuiltinLookup, LookupKind};
use crate::query::expressions::{Annotation, Col, Expression};
use crate::query::joins::{Join, JoinType};
use crate::query::lookups::{FilterValue, Q};
use crate::query::path::{MultiJoin, PathInfo, PathResolution, PathResolver};
use crate::query::promoter::JoinPromoter;
use crate::query::query::{split_lookup, Query, LOOKUP_SEP};
use crate::query::where_node::{Condition, Connector, LookupRhs, WhereChild, WhereNode};
use crate::value::Value;

/// The joins set up for a lookup path.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    /// The last field of the path.
    pub final_field: ModelField,
    /// The fields holding the value of `final_field`.
    pub targets: Vec<FieldDef>,
    /// The model the path ends on.
    pub opts: Arc<ModelMeta>,
    /// The aliases joined, starting with the alias the path started from.
    pub joins: Vec<String>,
    /// The hops traversed.
    pub path: Vec<PathInfo>,
}

/// The outcome of [`Query::setup_joins`].
#[derive(Debug, Clone)]
pub enum SetupJoins {
    /// Every hop was joined.
    Joined(JoinInfo),
    /// A many-valued hop was found while many-valued hops were not allowed.
    RequiresSubquery(MultiJoin),
}

/// Where in the filter tree a lookup is being built.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FilterScope {
    /// Some ancestor node is negated.
    pub branch_negated: bool,
    /// An odd number of ancestor nodes are negated.
    pub current_negated: bool,
    /// Joins may be created.
    pub allow_joins: bool,
    /// Negated many-valued lookups are rewritten as subqueries.
    pub split_subq: bool,
}

impl Default for FilterScope {
    fn default() -> Self {
        Self {
            branch_negated: false,
            current_negated: false,
            allow_joins: true,
            split_subq: true,
        }
    }
}

/// The result of [`Query::trim_start`].
#[derive(Debug, Clone)]
pub(crate) struct TrimmedStart {
    /// The lookup path, from the outer model, matching the selected column.
    pub prefix: String,
    /// A trimmed join was `LEFT OUTER`.
    pub contains_louter: bool,
    /// The model owning the selected column.
    pub select_model: String,
}

fn joined_refs_not_permitted() -> RelqError {
    RelqError::FieldError("Joined field references are not permitted in this query".into())
}

impl Query {
    // ── Joins ───────────────────────────────────────────────────────

    /// Joins every relation on the path `names`, starting from `alias`.
    ///
    /// Many-to-many hops only reuse aliases in `can_reuse`; other hops reuse
    /// any equivalent join.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for names that do not resolve.
    pub(crate) fn setup_joins(
        &mut self,
        names: &[String],
        opts: &Arc<ModelMeta>,
        alias: &str,
        can_reuse: Option<&BTreeSet<String>>,
        allow_many: bool,
    ) -> RelqResult<SetupJoins> {
        let annotation_names: Vec<String> = self.annotations.keys().cloned().collect();
        let resolved = match PathResolver::new(self.ctx.models(), &annotation_names)
            .resolve(names, opts, allow_many, true)?
        {
            PathResolution::Resolved(resolved) => resolved,
            PathResolution::RequiresSubquery(multi) => {
                return Ok(SetupJoins::RequiresSubquery(multi));
            }
        };

        let mut alias = alias.to_string();
        let mut joins = vec![alias.clone()];
        for info in &resolved.path {
            let nullable = if info.direct {
                self.is_nullable(&info.join_field.field)
            } else {
                true
            };
            let reuse = if info.m2m { can_reuse } else { None };
            let join = Join::new(
                info.to_opts.db_table.clone(),
                alias.clone(),
                info.join_field.join_cols(),
                info.join_field.identity(),
                nullable,
            );
            alias = self.alias_map.join(join, reuse);
            joins.push(alias.clone());
        }
        Ok(SetupJoins::Joined(JoinInfo {
            final_field: resolved.final_field,
            targets: resolved.targets,
            opts: resolved.opts,
            joins,
            path: resolved.path,
        }))
    }

    /// Drops trailing joins whose target columns are available on the
    /// previous table.
    ///
    /// `author__id` needs no join to the author table since `author_id` holds
    /// the same value. Returns the remaining targets, the alias they live on,
    /// and the remaining joins.
    pub(crate) fn trim_joins(
        &mut self,
        mut targets: Vec<FieldDef>,
        mut joins: Vec<String>,
        path: &[PathInfo],
    ) -> (Vec<FieldDef>, String, Vec<String>) {
        for info in path.iter().rev() {
            if joins.len() == 1 || !info.direct {
                break;
            }
            let join_targets: BTreeSet<&str> = info
                .join_field
                .foreign_related_fields()
                .into_iter()
                .map(|f| f.column.as_str())
                .collect();
            if !targets.iter().all(|t| join_targets.contains(t.column.as_str())) {
                break;
            }
            targets = targets
                .iter()
                .filter_map(|t| {
                    info.join_field
                        .related_fields
                        .iter()
                        .find(|(_, remote)| remote.column == t.column)
                        .map(|(local, _)| local.clone())
                })
                .collect();
            if let Some(last) = joins.pop() {
                self.alias_map.unref_alias(&last, 1);
            }
        }
        let alias = joins.last().cloned().unwrap_or_default();
        (targets, alias, joins)
    }

    // ── Lookups ─────────────────────────────────────────────────────

    /// Splits a lookup into its lookup names, its field path, and the
    /// annotation it refers to, if any.
    fn solve_lookup_type(
        &self,
        lookup: &str,
    ) -> RelqResult<(Vec<String>, Vec<String>, Option<Expression>)> {
        let parts = split_lookup(lookup);
        for n in 1..=parts.len() {
            let name = parts[..n].join(LOOKUP_SEP);
            if let Some((_, annotation)) = self.annotation_select().find(|(a, _)| **a == name) {
                return Ok((parts[n..].to_vec(), Vec::new(), Some(annotation.expr.clone())));
            }
        }
        let annotation_names: Vec<String> = self.annotations.keys().cloned().collect();
        let resolution = PathResolver::new(self.ctx.models(), &annotation_names)
            .resolve(&parts, &self.model, true, false)?;
        let rest = match resolution {
            PathResolution::Resolved(resolved) => resolved.rest,
            PathResolution::RequiresSubquery(_) => Vec::new(),
        };
        let field_parts = parts[..parts.len() - rest.len()].to_vec();
        if field_parts.is_empty() {
            return Err(RelqError::FieldError(format!(
                "Invalid lookup \"{lookup}\" for model {}",
                self.model.label
            )));
        }
        Ok((rest, field_parts, None))
    }

    /// Normalizes the right-hand side of a lookup and returns it with the
    /// aliases newly referenced by resolving it.
    fn prepare_lookup_value(
        &mut self,
        value: FilterValue,
        lookups: &mut Vec<String>,
        can_reuse: &mut BTreeSet<String>,
        allow_joins: bool,
    ) -> RelqResult<(FilterValue, BTreeSet<String>)> {
        if lookups.is_empty() {
            lookups.push(BuiltinLookup::Exact.name().to_string());
        }
        let last = lookups.len() - 1;
        let mut used_joins = BTreeSet::new();
        let value = match value {
            FilterValue::Value(Value::Null) => {
                if lookups[last] != "exact" && lookups[last] != "iexact" {
                    return Err(RelqError::InvalidValue(
                        "Cannot use None as a query value".into(),
                    ));
                }
                lookups[last] = BuiltinLookup::IsNull.name().to_string();
                FilterValue::Value(Value::Bool(true))
            }
            FilterValue::Value(v)
                if v.is_empty_string()
                    && lookups[last] == "exact"
                    && self.ctx.features().interprets_empty_strings_as_nulls =>
            {
                lookups[last] = BuiltinLookup::IsNull.name().to_string();
                FilterValue::Value(Value::Bool(true))
            }
            FilterValue::Expression(expr) => {
                let before = self.alias_map.refcounts();
                let expr = self.resolve_expression(expr, allow_joins, Some(can_reuse), false)?;
                used_joins = self
                    .alias_map
                    .refcounts()
                    .into_iter()
                    .filter(|(alias, count)| *count > before.get(alias).copied().unwrap_or(0))
                    .map(|(alias, _)| alias)
                    .collect();
                FilterValue::Expression(expr)
            }
            FilterValue::Query(query) => {
                let mut query = *query;
                query.bump_prefix(self)?;
                FilterValue::Query(Box::new(query))
            }
            other @ FilterValue::Value(_) => other,
        };
        Ok((value, used_joins))
    }

    /// The output type of an expression, following transforms and
    /// annotation references.
    pub(crate) fn expression_output(&self, expr: &Expression) -> Option<FieldType> {
        match expr {
            Expression::Transform { name, lhs } => self
                .ctx
                .lookups()
                .get_transform(name)
                .and_then(|t| t.output_type.field_type(self.expression_output(lhs))),
            Expression::Ref(name) => self
                .annotations
                .get(name)
                .and_then(|a| self.expression_output(&a.expr)),
            other => other.output_type(),
        }
    }

    fn try_transform(&self, lhs: Expression, name: &str) -> RelqResult<Expression> {
        if self.ctx.lookups().has_transform(name) {
            return Ok(Expression::Transform {
                name: name.to_string(),
                lhs: Box::new(lhs),
            });
        }
        let output = self
            .expression_output(&lhs)
            .map_or("Expression", |t| t.internal_type());
        Err(RelqError::FieldError(format!(
            "Unsupported lookup '{name}' for {output} or join on the field not permitted."
        )))
    }

    /// Applies transforms for every name but the last, which is the lookup.
    /// A last name that is a transform gets an implicit `exact`.
    fn build_lookup(
        &self,
        lookups: &[String],
        mut lhs: Expression,
        rhs: FilterValue,
    ) -> RelqResult<Condition> {
        let Some((last, transforms)) = lookups.split_last() else {
            return Err(RelqError::FieldError("Missing lookup".into()));
        };
        for name in transforms {
            lhs = self.try_transform(lhs, name)?;
        }
        let lookup = match self.ctx.lookups().get_lookup(last) {
            Some(lookup) => lookup,
            None => {
                lhs = self.try_transform(lhs, last)?;
                LookupKind::Builtin(BuiltinLookup::Exact)
            }
        };
        let rhs = lookup_rhs(&lookup, rhs)?;
        Ok(Condition { lhs, lookup, rhs })
    }

    // ── Filters ─────────────────────────────────────────────────────

    /// Builds the condition for one lookup, joining as needed.
    ///
    /// Returns the condition node and the aliases it needs as INNER joins.
    /// Under negation a lookup requires no INNER join, and a nullable target
    /// gets an extra `IS NOT NULL` guard so `NOT (col = x)` keeps rows where
    /// `col` is NULL out of the match.
    pub(crate) fn build_filter(
        &mut self,
        lookup: &str,
        value: FilterValue,
        scope: FilterScope,
        can_reuse: &mut BTreeSet<String>,
    ) -> RelqResult<(WhereNode, BTreeSet<String>)> {
        if lookup.is_empty() {
            return Err(RelqError::FieldError("Cannot parse keyword query ''".into()));
        }
        let original_value = value.clone();
        let (mut lookups, parts, reffed) = self.solve_lookup_type(lookup)?;
        if !scope.allow_joins && parts.len() > 1 {
            return Err(joined_refs_not_permitted());
        }
        let (value, mut used_joins) =
            self.prepare_lookup_value(value, &mut lookups, can_reuse, scope.allow_joins)?;

        let mut clause = WhereNode::default();
        if let Some(expr) = reffed {
            let condition = self.build_lookup(&lookups, expr, value)?;
            clause.add(WhereChild::Condition(condition), Connector::And);
            return Ok((clause, BTreeSet::new()));
        }

        let opts = Arc::clone(&self.model);
        let alias = self.get_initial_alias();
        let allow_many = !scope.branch_negated || !scope.split_subq;
        let info = match self.setup_joins(&parts, &opts, &alias, Some(&*can_reuse), allow_many)? {
            SetupJoins::Joined(info) => info,
            SetupJoins::RequiresSubquery(multi) => {
                let prefix = parts[..multi.level.min(parts.len())].join(LOOKUP_SEP);
                return self.split_exclude(
                    lookup,
                    original_value,
                    &prefix,
                    can_reuse,
                    &multi.names_with_path,
                );
            }
        };

        self.lookup_joins.clone_from(&info.joins);
        can_reuse.extend(info.joins.iter().cloned());
        used_joins.extend(info.joins.iter().cloned());
        let (targets, alias, join_list) = self.trim_joins(info.targets, info.joins, &info.path);
        let target = targets.into_iter().next().ok_or_else(|| {
            RelqError::FieldError(format!("Lookup '{lookup}' has no target column"))
        })?;
        let col = Col::new(alias, target.clone());

        let condition = if info.final_field.is_relation() {
            if lookups.len() > 1 {
                return Err(RelqError::FieldError(format!(
                    "Related Field got invalid lookup: {}",
                    lookups[0]
                )));
            }
            let name = &lookups[0];
            let kind = self.ctx.lookups().get_related_lookup(name).ok_or_else(|| {
                RelqError::FieldError(format!("Related Field got invalid lookup: {name}"))
            })?;
            let rhs = lookup_rhs(&kind, value)?;
            Condition {
                lhs: Expression::Col(col.clone()),
                lookup: kind,
                rhs,
            }
        } else {
            self.build_lookup(&lookups, Expression::Col(col.clone()), value)?
        };

        let is_isnull = condition.lookup.is_isnull();
        let isnull_value = condition.rhs.as_bool();
        clause.add(WhereChild::Condition(condition), Connector::And);

        let mut require_outer = is_isnull && isnull_value == Some(true) && !scope.current_negated;
        if scope.current_negated && (!is_isnull || isnull_value == Some(false)) {
            require_outer = true;
            if !is_isnull {
                let last_outer = join_list
                    .last()
                    .and_then(|a| self.alias_map.join_type(a))
                    == Some(JoinType::LeftOuter);
                if self.is_nullable(&target) || last_outer {
                    clause.add(WhereChild::Condition(Condition::isnull(col, false)), Connector::And);
                }
            }
        }
        let needed_inner = if require_outer {
            BTreeSet::new()
        } else {
            used_joins
        };
        Ok((clause, needed_inner))
    }

    /// ANDs a filter tree into the query.
    ///
    /// Joins that were INNER before the call stay INNER whatever the new
    /// tree votes: rows without a match were already filtered out.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] or [`RelqError::InvalidValue`] for
    /// lookups that cannot be resolved or values a lookup cannot take.
    pub fn add_q(&mut self, q: &Q) -> RelqResult<()> {
        let existing_inner: Vec<String> = self
            .alias_map
            .aliases()
            .into_iter()
            .filter(|a| self.alias_map.join_type(a) == Some(JoinType::Inner))
            .collect();
        let mut used_aliases = BTreeSet::new();
        let (clause, _) = self.add_q_inner(q, &mut used_aliases, FilterScope::default())?;
        if !clause.is_empty() {
            self.where_.add(WhereChild::Node(clause), Connector::And);
        }
        self.alias_map.demote_joins(existing_inner);
        Ok(())
    }

    /// Shorthand for [`add_q`](Self::add_q) with a single lookup.
    ///
    /// # Errors
    ///
    /// See [`add_q`](Self::add_q).
    pub fn add_filter(&mut self, lookup: &str, value: impl Into<FilterValue>) -> RelqResult<()> {
        self.add_q(&Q::filter(lookup, value))
    }

    fn add_q_inner(
        &mut self,
        q: &Q,
        can_reuse: &mut BTreeSet<String>,
        scope: FilterScope,
    ) -> RelqResult<(WhereNode, BTreeSet<String>)> {
        let (connector, negated, children) = q.as_node();
        let scope = FilterScope {
            branch_negated: scope.branch_negated || negated,
            current_negated: scope.current_negated ^ negated,
            ..scope
        };
        let mut target = WhereNode::new(connector, negated);
        let mut promoter = JoinPromoter::new(connector, children.len(), scope.current_negated);
        for child in children {
            let (child_clause, needed_inner) = match child {
                Q::Filter { lookup, value } => {
                    self.build_filter(lookup, value.clone(), scope, can_reuse)?
                }
                nested => self.add_q_inner(nested, can_reuse, scope)?,
            };
            promoter.add_votes(needed_inner);
            if !child_clause.is_empty() {
                target.add(WhereChild::Node(child_clause), connector);
            }
        }
        let needed_inner = promoter.update_join_types(&mut self.alias_map);
        Ok((target, needed_inner))
    }

    // ── Expressions ─────────────────────────────────────────────────

    /// Resolves a named reference to an annotation or a column.
    ///
    /// With `summarize`, annotations are referenced by name since the
    /// aggregate is computed over an inner query that selects them.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for unknown names, joined names when
    /// joins are not allowed, and multi-column targets.
    pub fn resolve_ref(
        &mut self,
        name: &str,
        allow_joins: bool,
        reuse: Option<&mut BTreeSet<String>>,
        summarize: bool,
    ) -> RelqResult<Expression> {
        if !allow_joins && name.contains(LOOKUP_SEP) {
            return Err(joined_refs_not_permitted());
        }
        if let Some(annotation) = self.annotations.get(name) {
            return Ok(if summarize {
                Expression::Ref(name.to_string())
            } else {
                annotation.expr.clone()
            });
        }
        let parts = split_lookup(name);
        let opts = Arc::clone(&self.model);
        let alias = self.get_initial_alias();
        let info = match self.setup_joins(&parts, &opts, &alias, reuse.as_deref(), true)? {
            SetupJoins::Joined(info) => info,
            SetupJoins::RequiresSubquery(_) => {
                return Err(RelqError::FieldError(format!(
                    "Cannot resolve expression '{name}'"
                )));
            }
        };
        let (targets, final_alias, join_list) =
            self.trim_joins(info.targets, info.joins, &info.path);
        if targets.len() > 1 {
            return Err(RelqError::FieldError(
                "Referencing multicolumn fields with F() objects isn't supported".into(),
            ));
        }
        if let Some(reuse) = reuse {
            reuse.extend(join_list);
        }
        let target = targets.into_iter().next().ok_or_else(|| {
            RelqError::FieldError(format!("Cannot resolve expression '{name}'"))
        })?;
        Ok(Expression::Col(Col::new(final_alias, target)))
    }

    /// Binds every named reference in `expr` to this query.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for unresolvable names and for an
    /// aggregate over another aggregate outside of `aggregate()`.
    pub fn resolve_expression(
        &mut self,
        expr: Expression,
        allow_joins: bool,
        mut reuse: Option<&mut BTreeSet<String>>,
        summarize: bool,
    ) -> RelqResult<Expression> {
        Ok(match expr {
            Expression::F(name) => self.resolve_ref(&name, allow_joins, reuse, summarize)?,
            Expression::Aggregate {
                func,
                expr,
                distinct,
            } => {
                let described = expr.describe();
                let inner =
                    self.resolve_expression(*expr, allow_joins, reuse.as_deref_mut(), summarize)?;
                if !summarize && inner.contains_aggregate() {
                    return Err(RelqError::FieldError(format!(
                        "Cannot compute {}('{described}'): '{described}' is an aggregate",
                        func.sql_name()
                    )));
                }
                Expression::Aggregate {
                    func,
                    expr: Box::new(inner),
                    distinct,
                }
            }
            Expression::Func { name, args, output } => {
                let mut resolved = Vec::with_capacity(args.len());
                for arg in args {
                    resolved.push(self.resolve_expression(
                        arg,
                        allow_joins,
                        reuse.as_deref_mut(),
                        summarize,
                    )?);
                }
                Expression::Func {
                    name,
                    args: resolved,
                    output,
                }
            }
            Expression::Transform { name, lhs } => Expression::Transform {
                name,
                lhs: Box::new(self.resolve_expression(*lhs, allow_joins, reuse, summarize)?),
            },
            Expression::Arithmetic { op, lhs, rhs } => {
                let lhs =
                    self.resolve_expression(*lhs, allow_joins, reuse.as_deref_mut(), summarize)?;
                let rhs = self.resolve_expression(*rhs, allow_joins, reuse, summarize)?;
                Expression::Arithmetic {
                    op,
                    lhs: Box::new(lhs),
                    rhs: Box::new(rhs),
                }
            }
            Expression::Subquery(query) => {
                let mut query = *query;
                query.bump_prefix(self)?;
                Expression::Subquery(Box::new(query))
            }
            other @ (Expression::Col(_)
            | Expression::Ref(_)
            | Expression::Value(_)
            | Expression::Star
            | Expression::RawSql { .. }) => other,
        })
    }

    /// Resolves `expr` and stores it as the annotation `alias`, selected in
    /// the results.
    ///
    /// # Errors
    ///
    /// See [`resolve_expression`](Self::resolve_expression).
    pub fn add_annotation(
        &mut self,
        expr: Expression,
        alias: &str,
        is_summary: bool,
    ) -> RelqResult<()> {
        let expr = self.resolve_expression(expr, true, None, is_summary)?;
        self.append_annotation_mask([alias]);
        self.annotations
            .insert(alias.to_string(), Annotation { expr, is_summary });
        Ok(())
    }

    // ── Subquery rewriting ──────────────────────────────────────────

    /// Rewrites a negated lookup over a many-valued relation as
    /// `pk NOT IN (SELECT ... WHERE lookup)`.
    fn split_exclude(
        &mut self,
        lookup: &str,
        value: FilterValue,
        prefix: &str,
        can_reuse: &mut BTreeSet<String>,
        names_with_path: &[(String, Vec<PathInfo>)],
    ) -> RelqResult<(WhereNode, BTreeSet<String>)> {
        let mut query = Self::for_model(Arc::clone(&self.ctx), Arc::clone(&self.model));
        query.add_filter(lookup, value)?;
        query.clear_ordering(true);
        let trimmed = query.trim_start(names_with_path)?;
        let col = query.select.first().cloned().ok_or_else(|| {
            RelqError::FieldError(format!("Cannot rewrite '{lookup}' as a subquery"))
        })?;
        if self.is_nullable(&col.target) {
            query.where_.add(
                WhereChild::Condition(Condition::isnull(col.clone(), false)),
                Connector::And,
            );
        }

        if can_reuse.contains(&col.alias) {
            let pk = self.ctx.models().require(&trimmed.select_model)?.pk().clone();
            query.bump_prefix(self)?;
            let inner_alias = query
                .select
                .first()
                .map(|c| c.alias.clone())
                .unwrap_or_default();
            query.where_.add(
                WhereChild::Condition(Condition::exact(
                    Expression::Col(Col::new(inner_alias, pk.clone())),
                    Expression::Col(Col::new(col.alias.clone(), pk)),
                )),
                Connector::And,
            );
            query.external_aliases.insert(col.alias.clone());
        }
        tracing::debug!(
            lookup = %lookup,
            prefix = %prefix,
            trimmed_prefix = %trimmed.prefix,
            "rewrote many-valued exclude as a subquery"
        );

        let scope = FilterScope {
            branch_negated: true,
            current_negated: true,
            allow_joins: true,
            split_subq: true,
        };
        let (mut condition, needed_inner) = self.build_filter(
            &format!("{}__in", trimmed.prefix),
            FilterValue::Query(Box::new(query)),
            scope,
            can_reuse,
        )?;
        if trimmed.contains_louter {
            let (or_null, _) = self.build_filter(
                &format!("{}__isnull", trimmed.prefix),
                FilterValue::Value(Value::Bool(true)),
                scope,
                can_reuse,
            )?;
            condition.add(WhereChild::Node(or_null), Connector::Or);
        }
        Ok((condition, needed_inner))
    }

    /// Drops the leading joins of a subquery built by
    /// [`split_exclude`](Self::split_exclude), up to the first many-valued
    /// hop, and selects the column the outer query is compared against.
    pub(crate) fn trim_start(
        &mut self,
        names_with_path: &[(String, Vec<PathInfo>)],
    ) -> RelqResult<TrimmedStart> {
        let all_paths: Vec<&PathInfo> = names_with_path.iter().flat_map(|(_, p)| p).collect();
        let base = self.alias_map.base_alias();
        let lookup_tables: Vec<String> = self
            .alias_map
            .aliases()
            .into_iter()
            .filter(|t| self.lookup_joins.contains(t) || base.as_ref() == Some(t))
            .collect();

        let mut contains_louter = false;
        let mut trimmed_paths = 0;
        let mut last_path = None;
        for (i, path) in all_paths.iter().enumerate() {
            trimmed_paths = i;
            last_path = Some(*path);
            if path.m2m {
                break;
            }
            if lookup_tables
                .get(i + 1)
                .and_then(|t| self.alias_map.join_type(t))
                == Some(JoinType::LeftOuter)
            {
                contains_louter = true;
            }
            if let Some(table) = lookup_tables.get(i) {
                self.alias_map.unref_alias(table, 1);
            }
        }
        let path = last_path
            .ok_or_else(|| RelqError::FieldError("Cannot trim an empty join path".into()))?;
        let join_field = &path.join_field;

        let mut paths_in_prefix = trimmed_paths;
        let mut prefix = Vec::new();
        for (name, path) in names_with_path {
            if paths_in_prefix < path.len() {
                break;
            }
            prefix.push(name.clone());
            paths_in_prefix -= path.len();
        }
        let target_name = join_field
            .foreign_related_fields()
            .first()
            .map(|f| f.name.clone())
            .ok_or_else(|| RelqError::FieldError(format!("'{}' has no target", join_field.name)))?;
        prefix.push(target_name);

        let next_table = lookup_tables.get(trimmed_paths + 1).cloned();
        let next_outer =
            next_table.as_deref().and_then(|t| self.alias_map.join_type(t)) == Some(JoinType::LeftOuter);
        let (select_fields, select_alias, select_model) = match next_table {
            Some(next) if !next_outer => {
                if let Some(table) = lookup_tables.get(trimmed_paths) {
                    self.alias_map.unref_alias(table, 1);
                }
                let fields: Vec<FieldDef> =
                    join_field.related_fields.iter().map(|(local, _)| local.clone()).collect();
                (fields, next, join_field.fk_model.clone())
            }
            _ => {
                let fields: Vec<FieldDef> =
                    join_field.related_fields.iter().map(|(_, remote)| remote.clone()).collect();
                let alias = lookup_tables
                    .get(trimmed_paths)
                    .cloned()
                    .unwrap_or_default();
                let model = if path.direct {
                    path.to_opts.label.clone()
                } else {
                    path.from_opts.label.clone()
                };
                (fields, alias, model)
            }
        };

        if let Some(first_active) = self
            .alias_map
            .aliases()
            .into_iter()
            .find(|t| self.alias_map.refcount(t) > 0)
        {
            self.alias_map.set_base(&first_active);
        }
        self.set_select(
            select_fields
                .into_iter()
                .map(|f| Col::new(select_alias.clone(), f))
                .collect(),
        );
        Ok(TrimmedStart {
            prefix: prefix.join(LOOKUP_SEP),
            contains_louter,
            select_model,
        })
    }
}

/// Shapes a prepared value into the right-hand side `lookup` expects.
fn lookup_rhs(lookup: &LookupKind, value: FilterValue) -> RelqResult<LookupRhs> {
    let builtin = match lookup {
        LookupKind::Builtin(b) => Some(*b),
        LookupKind::Custom(_) => None,
    };
    Ok(match (builtin, value) {
        (_, FilterValue::Expression(expr)) => LookupRhs::Expression(expr),
        (_, FilterValue::Query(query)) => {
            let mut query = *query;
            if !query.has_select_fields() {
                query.clear_select_clause();
                query.add_fields(&["pk".to_string()], true)?;
            }
            LookupRhs::Query(Box::new(query))
        }
        (Some(BuiltinLookup::In), FilterValue::Value(Value::List(items))) => LookupRhs::List(items),
        (Some(BuiltinLookup::In), FilterValue::Value(v)) => LookupRhs::List(vec![v]),
        (Some(BuiltinLookup::Range), FilterValue::Value(Value::List(items))) if items.len() == 2 => {
            let mut items = items.into_iter();
            match (items.next(), items.next()) {
                (Some(low), Some(high)) => LookupRhs::Range(low, high),
                _ => return Err(range_error()),
            }
        }
        (Some(BuiltinLookup::Range), FilterValue::Value(_)) => return Err(range_error()),
        (Some(BuiltinLookup::IsNull), FilterValue::Value(v)) => {
            let flag = match v {
                Value::Bool(b) => b,
                Value::Int(i) => i != 0,
                _ => {
                    return Err(RelqError::InvalidValue(
                        "The QuerySet value for an isnull lookup must be True or False.".into(),
                    ));
                }
            };
            LookupRhs::Value(Value::Bool(flag))
        }
        (_, FilterValue::Value(v)) => LookupRhs::Value(v),
    })
}

fn range_error() -> RelqError {
    RelqError::InvalidValue("The range lookup requires a pair of values".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::QueryContext;
    use crate::context::DatabaseFeatures;
    use crate::query::compiler::DatabaseBackendType;
    use crate::testing::{library_context, library_registry};

    fn book_query() -> Query {
        Query::new(library_context(), "library.book").unwrap()
    }

    fn author_query() -> Query {
        Query::new(library_context(), "library.author").unwrap()
    }

    fn only_condition(node: &WhereNode) -> &Condition {
        match node.children.as_slice() {
            [WhereChild::Condition(c)] => c,
            [WhereChild::Node(n)] => only_condition(n),
            other => panic!("expected a single condition, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_filter_has_no_joins() {
        let mut q = book_query();
        q.add_filter("title__icontains", "rust").unwrap();
        assert_eq!(q.alias_map().len(), 1);
        let cond = only_condition(q.where_node());
        assert_eq!(cond.lookup.name(), "icontains");
        assert_eq!(cond.lhs.cols()[0].alias, "library_book");
    }

    #[test]
    fn test_implicit_exact() {
        let mut q = book_query();
        q.add_filter("pages", 100).unwrap();
        assert_eq!(only_condition(q.where_node()).lookup.name(), "exact");
    }

    #[test]
    fn test_forward_fk_joins_are_reused_across_filters() {
        let mut q = book_query();
        q.add_filter("author__name", "Ann").unwrap();
        q.add_filter("author__age__gt", 30).unwrap();
        assert_eq!(q.alias_map().aliases_for_table("library_author").len(), 1);
        assert_eq!(q.alias_map().refcount("library_author"), 2);
    }

    #[test]
    fn test_fk_id_lookup_trims_join() {
        let mut q = book_query();
        q.add_filter("author__id", 1).unwrap();
        let cond = only_condition(q.where_node());
        assert_eq!(cond.lhs.cols()[0].alias, "library_book");
        assert_eq!(cond.lhs.cols()[0].column(), "author_id");
        assert_eq!(q.alias_map().refcount("library_author"), 0);
    }

    #[test]
    fn test_m2m_joins_reused_within_one_call_only() {
        let mut q = book_query();
        q.add_q(&(Q::filter("tags__name", "a") & Q::filter("tags__name", "b")))
            .unwrap();
        assert_eq!(q.alias_map().aliases_for_table("library_tag").len(), 1);

        let mut q = book_query();
        q.add_filter("tags__name", "a").unwrap();
        q.add_filter("tags__name", "b").unwrap();
        assert_eq!(q.alias_map().aliases_for_table("library_tag").len(), 2);
    }

    #[test]
    fn test_or_promotes_partial_joins() {
        let mut q = book_query();
        q.add_q(&(Q::filter("publisher__name", "Ace") | Q::filter("pages__gt", 100)))
            .unwrap();
        let publisher = &q.alias_map().aliases_for_table("library_publisher")[0];
        assert_eq!(q.alias_map().join_type(publisher), Some(JoinType::LeftOuter));
    }

    #[test]
    fn test_or_keeps_non_nullable_join_inner() {
        let mut q = book_query();
        q.add_q(&(Q::filter("author__name", "Ann") | Q::filter("pages__gt", 100)))
            .unwrap();
        assert_eq!(q.alias_map().join_type("library_author"), Some(JoinType::Inner));
    }

    #[test]
    fn test_or_demotes_unanimous_join() {
        let mut q = book_query();
        q.add_q(&(Q::filter("publisher__name", "Ace") | Q::filter("publisher__name", "Best")))
            .unwrap();
        assert_eq!(q.alias_map().join_type("library_publisher"), Some(JoinType::Inner));
    }

    #[test]
    fn test_later_and_filter_demotes_outer_join() {
        let mut q = book_query();
        q.add_q(&(Q::filter("publisher__name", "Ace") | Q::filter("pages__gt", 100)))
            .unwrap();
        assert_eq!(
            q.alias_map().join_type("library_publisher"),
            Some(JoinType::LeftOuter)
        );
        q.add_filter("publisher__name__startswith", "A").unwrap();
        assert_eq!(q.alias_map().join_type("library_publisher"), Some(JoinType::Inner));
    }

    #[test]
    fn test_existing_inner_join_survives_or() {
        let mut q = book_query();
        q.add_filter("publisher__name", "Ace").unwrap();
        q.add_q(&(Q::filter("publisher__name", "Best") | Q::filter("pages__gt", 100)))
            .unwrap();
        assert_eq!(q.alias_map().join_type("library_publisher"), Some(JoinType::Inner));
    }

    #[test]
    fn test_null_becomes_isnull() {
        let mut q = book_query();
        q.add_filter("rating", Value::Null).unwrap();
        let cond = only_condition(q.where_node());
        assert!(cond.lookup.is_isnull());
        assert_eq!(cond.rhs.as_bool(), Some(true));
    }

    #[test]
    fn test_null_with_other_lookup_is_rejected() {
        let mut q = book_query();
        let err = q.add_filter("rating__gt", Value::Null).unwrap_err();
        assert!(matches!(err, RelqError::InvalidValue(_)));
    }

    #[test]
    fn test_empty_string_as_null_backend() {
        let ctx = QueryContext::builder(library_registry())
            .features(DatabaseFeatures {
                backend: DatabaseBackendType::SQLite,
                interprets_empty_strings_as_nulls: true,
            })
            .build();
        let mut q = Query::new(ctx, "library.book").unwrap();
        q.add_filter("title", "").unwrap();
        assert!(only_condition(q.where_node()).lookup.is_isnull());

        let mut q = book_query();
        q.add_filter("title", "").unwrap();
        assert_eq!(only_condition(q.where_node()).lookup.name(), "exact");
    }

    #[test]
    fn test_isnull_value_must_be_boolean() {
        let mut q = book_query();
        assert!(q.add_filter("rating__isnull", "yes").is_err());
        let mut q = book_query();
        q.add_filter("rating__isnull", 0).unwrap();
        assert_eq!(only_condition(q.where_node()).rhs.as_bool(), Some(false));
    }

    #[test]
    fn test_range_requires_pair() {
        let mut q = book_query();
        assert!(q.add_filter("pages__range", Value::List(vec![1.into()])).is_err());
        let mut q = book_query();
        q.add_filter("pages__range", Value::List(vec![1.into(), 10.into()]))
            .unwrap();
        assert!(matches!(only_condition(q.where_node()).rhs, LookupRhs::Range(..)));
    }

    #[test]
    fn test_related_field_invalid_lookup() {
        let mut q = book_query();
        let err = q.add_filter("author__contains", "x").unwrap_err();
        assert!(err
            .to_string()
            .contains("Related Field got invalid lookup: contains"));
    }

    #[test]
    fn test_related_field_exact_compares_fk_column() {
        let mut q = book_query();
        q.add_filter("author", 3).unwrap();
        let cond = only_condition(q.where_node());
        assert_eq!(cond.lhs.cols()[0].column(), "author_id");
        assert_eq!(q.alias_map().count_active(), 1);
    }

    #[test]
    fn test_unsupported_lookup() {
        let mut q = book_query();
        let err = q.add_filter("title__foo", "x").unwrap_err();
        assert!(err.to_string().contains(
            "Unsupported lookup 'foo' for CharField or join on the field not permitted."
        ));
    }

    #[test]
    fn test_transform_then_lookup() {
        let mut q = book_query();
        q.add_filter("title__lower__startswith", "a").unwrap();
        let cond = only_condition(q.where_node());
        assert_eq!(cond.lookup.name(), "startswith");
        assert!(matches!(&cond.lhs, Expression::Transform { name, .. } if name == "lower"));

        let mut q = book_query();
        q.add_filter("title__lower", "a").unwrap();
        let cond = only_condition(q.where_node());
        assert_eq!(cond.lookup.name(), "exact");
        assert!(matches!(&cond.lhs, Expression::Transform { .. }));
    }

    #[test]
    fn test_f_expression_rhs_resolves_to_column() {
        let mut q = book_query();
        q.add_filter("author__age__gt", Expression::f("pages")).unwrap();
        let cond = only_condition(q.where_node());
        match &cond.rhs {
            LookupRhs::Expression(Expression::Col(col)) => {
                assert_eq!(col.alias, "library_book");
                assert_eq!(col.column(), "pages");
            }
            other => panic!("unexpected rhs {other:?}"),
        }
    }

    #[test]
    fn test_joined_refs_rejected_without_joins() {
        let mut q = book_query();
        let err = q.resolve_ref("author__name", false, None, false).unwrap_err();
        assert!(err.to_string().contains("Joined field references are not permitted"));
    }

    #[test]
    fn test_negated_nullable_join_gets_not_null_guard() {
        let mut q = book_query();
        q.add_q(&!Q::filter("publisher__name", "Ace")).unwrap();
        match &q.where_node().children[0] {
            WhereChild::Node(node) => {
                assert!(node.negated);
                assert_eq!(node.children.len(), 2);
                match &node.children[1] {
                    WhereChild::Condition(c) => {
                        assert!(c.lookup.is_isnull());
                        assert_eq!(c.rhs.as_bool(), Some(false));
                    }
                    other => panic!("expected guard, got {other:?}"),
                }
            }
            other => panic!("expected negated node, got {other:?}"),
        }
        assert_eq!(
            q.alias_map().join_type("library_publisher"),
            Some(JoinType::LeftOuter)
        );
    }

    #[test]
    fn test_negated_non_nullable_has_no_guard() {
        let mut q = book_query();
        q.add_q(&!Q::filter("pages", 10)).unwrap();
        match &q.where_node().children[0] {
            WhereChild::Node(node) => assert_eq!(node.children.len(), 1),
            other => panic!("expected negated node, got {other:?}"),
        }
    }

    #[test]
    fn test_exclude_over_m2m_becomes_subquery() {
        let mut q = book_query();
        q.add_q(&!Q::filter("tags__name", "draft")).unwrap();
        assert!(q.alias_map().aliases_for_table("library_tag").is_empty());
        let cond = only_condition(q.where_node());
        assert_eq!(cond.lookup.name(), "in");
        assert_eq!(cond.lhs.cols()[0].column(), "id");
        match &cond.rhs {
            LookupRhs::Query(inner) => {
                assert_eq!(inner.select()[0].column(), "book_id");
                assert!(inner.select()[0].alias.starts_with('U'));
                assert_eq!(inner.count_active_tables(), 2);
            }
            other => panic!("expected subquery, got {other:?}"),
        }
    }

    #[test]
    fn test_exclude_over_reverse_fk_becomes_subquery() {
        let mut q = author_query();
        q.add_q(&!Q::filter("book__title", "x")).unwrap();
        let cond = only_condition(q.where_node());
        match &cond.rhs {
            LookupRhs::Query(inner) => {
                assert_eq!(inner.select()[0].column(), "author_id");
                assert_eq!(inner.count_active_tables(), 1);
            }
            other => panic!("expected subquery, got {other:?}"),
        }
    }

    #[test]
    fn test_filter_over_m2m_joins_directly() {
        let mut q = book_query();
        q.add_filter("tags__name", "draft").unwrap();
        assert_eq!(q.alias_map().aliases_for_table("library_tag").len(), 1);
        assert_eq!(q.alias_map().aliases_for_table("library_book_tags").len(), 1);
    }

    #[test]
    fn test_query_value_selects_pk() {
        let mut inner = author_query();
        inner.add_filter("age__gt", 40).unwrap();
        let mut q = book_query();
        q.add_filter("author__in", inner).unwrap();
        let cond = only_condition(q.where_node());
        match &cond.rhs {
            LookupRhs::Query(inner) => {
                assert_eq!(inner.select().len(), 1);
                assert_eq!(inner.select()[0].column(), "id");
                assert_ne!(inner.alias_map().prefix(), q.alias_map().prefix());
            }
            other => panic!("expected subquery, got {other:?}"),
        }
    }

    #[test]
    fn test_annotation_filter_references_expression() {
        let mut q = book_query();
        q.add_annotation(Expression::count(Expression::f("tags")), "n_tags", false)
            .unwrap();
        q.add_filter("n_tags__gt", 1).unwrap();
        assert!(q.where_node().contains_aggregate());
    }

    #[test]
    fn test_aggregate_over_aggregate_rejected() {
        let mut q = book_query();
        q.add_annotation(Expression::count(Expression::f("tags")), "n_tags", false)
            .unwrap();
        let err = q
            .add_annotation(Expression::sum(Expression::f("n_tags")), "total", false)
            .unwrap_err();
        assert!(err.to_string().contains("is an aggregate"));
        q.add_annotation(Expression::sum(Expression::f("n_tags")), "total", true)
            .unwrap();
        assert!(matches!(
            &q.annotations()["total"].expr,
            Expression::Aggregate { expr, .. } if matches!(**expr, Expression::Ref(_))
        ));
    }

    #[test]
    fn test_count_over_m2m_trims_to_intermediate_table() {
        let mut q = book_query();
        q.add_annotation(Expression::count(Expression::f("tags")), "n_tags", false)
            .unwrap();
        let cols = q.annotations()["n_tags"].expr.cols().into_iter().cloned().collect::<Vec<_>>();
        assert_eq!(cols[0].alias, "library_book_tags");
        assert_eq!(cols[0].column(), "tag_id");
    }

    #[test]
    fn test_unknown_field_error() {
        let mut q = book_query();
        let err = q.add_filter("nope", 1).unwrap_err();
        assert!(err.to_string().contains("Cannot resolve keyword 'nope' into field."));
    }

    #[test]
    fn test_empty_not_is_skipped() {
        let mut q = book_query();
        q.add_q(&!Q::And(Vec::new())).unwrap();
        assert!(q.where_node().is_empty());
    }
}
