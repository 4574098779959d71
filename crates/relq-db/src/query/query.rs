//! The query intermediate representation.
//!
//! A [`Query`] holds everything needed to render one SELECT: the alias arena,
//! the filter tree, the select list, grouping, ordering, limits, annotations,
//! and the raw `extra()` pieces. Builders mutate a query in place; a caller
//! that still needs the original keeps a clone, which is a plain value copy
//! of the whole state.
//!
//! Filtering is implemented in [`filter`](super::filter), aggregation in
//! [`aggregation`](super::aggregation), and SQL generation in
//! [`compiler`](super::compiler).

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, OnceLock};

use indexmap::IndexMap;
use regex::Regex;
use relq_core::{RelqError, RelqResult};

use crate::context::QueryContext;
use crate::fields::FieldDef;
use crate::model::{ModelField, ModelMeta};
use crate::query::compiler::{CompiledQuery, DatabaseBackendType, SqlCompiler};
use crate::query::expressions::{Annotation, Col, Expression, OrderBy};
use crate::query::filter::SetupJoins;
use crate::query::joins::{AliasMap, JoinType};
use crate::query::promoter::JoinPromoter;
use crate::query::where_node::{Connector, ExtraWhere, WhereChild, WhereNode};
use crate::value::Value;

/// The separator between the parts of a lookup path.
pub const LOOKUP_SEP: &str = "__";

fn order_pattern() -> &'static Regex {
    static ORDER_PATTERN: OnceLock<Regex> = OnceLock::new();
    ORDER_PATTERN.get_or_init(|| Regex::new(r"^[-+]?[.\w]+$|^\?$").expect("valid regex"))
}

/// Splits a lookup path on [`LOOKUP_SEP`].
pub fn split_lookup(lookup: &str) -> Vec<String> {
    lookup.split(LOOKUP_SEP).map(String::from).collect()
}

/// The GROUP BY state of a query.
#[derive(Debug, Clone, Default)]
pub enum GroupBy {
    /// No grouping.
    #[default]
    None,
    /// Group by every selected column.
    All,
    /// Group by an explicit list, extended at compile time with the
    /// non-aggregate parts of the select list and ordering.
    Exprs(Vec<Expression>),
}

/// A nested set of relations to follow with `select_related`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelatedTree(pub BTreeMap<String, RelatedTree>);

/// The `select_related` state of a query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SelectRelated {
    /// Related objects are not selected.
    #[default]
    Off,
    /// Every non-null foreign key is followed, up to the query's maximum
    /// depth.
    All,
    /// Only the listed relation paths are followed.
    Fields(RelatedTree),
}

/// A raw SQL column added through `extra(select=...)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraSelect {
    /// The SQL fragment, with `%s` for each parameter.
    pub sql: String,
    /// Parameters bound in order.
    pub params: Vec<Value>,
}

/// Field names excluded from (`defer`) or exclusively loaded by (`only`)
/// the default select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredLoading {
    /// Field paths such as `"title"` or `"author__name"`.
    pub names: BTreeSet<String>,
    /// `true` when `names` are deferred, `false` when they are the only
    /// fields loaded.
    pub defer: bool,
}

impl Default for DeferredLoading {
    fn default() -> Self {
        Self {
            names: BTreeSet::new(),
            defer: true,
        }
    }
}

/// A single SQL query over one model.
#[derive(Debug, Clone)]
pub struct Query {
    pub(crate) ctx: Arc<QueryContext>,
    pub(crate) model: Arc<ModelMeta>,
    pub(crate) alias_map: AliasMap,
    pub(crate) external_aliases: BTreeSet<String>,
    pub(crate) default_cols: bool,
    pub(crate) default_ordering: bool,
    pub(crate) standard_ordering: bool,
    pub(crate) select: Vec<Col>,
    pub(crate) where_: WhereNode,
    pub(crate) group_by: GroupBy,
    pub(crate) order_by: Vec<OrderBy>,
    pub(crate) low_mark: usize,
    pub(crate) high_mark: Option<usize>,
    pub(crate) distinct: bool,
    pub(crate) distinct_fields: Vec<String>,
    pub(crate) select_for_update: bool,
    pub(crate) select_for_update_nowait: bool,
    pub(crate) select_for_update_skip_locked: bool,
    pub(crate) select_related: SelectRelated,
    pub(crate) max_depth: usize,
    pub(crate) values_select: Vec<String>,
    pub(crate) annotations: IndexMap<String, Annotation>,
    pub(crate) annotation_select_mask: Option<BTreeSet<String>>,
    pub(crate) extra: IndexMap<String, ExtraSelect>,
    pub(crate) extra_select_mask: Option<BTreeSet<String>>,
    pub(crate) extra_tables: Vec<String>,
    pub(crate) extra_order_by: Vec<String>,
    pub(crate) deferred_loading: DeferredLoading,
    pub(crate) lookup_joins: Vec<String>,
    /// The inner query of an aggregate wrapper: when set, the query selects
    /// its annotations `FROM (inner) subquery`.
    pub(crate) subquery: Option<Box<Query>>,
}

impl Query {
    /// Creates an empty query over the model registered as `label`.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] if the model is not registered.
    pub fn new(ctx: Arc<QueryContext>, label: &str) -> RelqResult<Self> {
        let model = ctx.models().require(label)?;
        Ok(Self::for_model(ctx, model))
    }

    /// Creates an empty query over `model`.
    pub fn for_model(ctx: Arc<QueryContext>, model: Arc<ModelMeta>) -> Self {
        Self {
            ctx,
            model,
            alias_map: AliasMap::new(),
            external_aliases: BTreeSet::new(),
            default_cols: true,
            default_ordering: true,
            standard_ordering: true,
            select: Vec::new(),
            where_: WhereNode::default(),
            group_by: GroupBy::None,
            order_by: Vec::new(),
            low_mark: 0,
            high_mark: None,
            distinct: false,
            distinct_fields: Vec::new(),
            select_for_update: false,
            select_for_update_nowait: false,
            select_for_update_skip_locked: false,
            select_related: SelectRelated::Off,
            max_depth: 5,
            values_select: Vec::new(),
            annotations: IndexMap::new(),
            annotation_select_mask: None,
            extra: IndexMap::new(),
            extra_select_mask: None,
            extra_tables: Vec::new(),
            extra_order_by: Vec::new(),
            deferred_loading: DeferredLoading::default(),
            lookup_joins: Vec::new(),
            subquery: None,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    /// The shared query configuration.
    pub fn context(&self) -> &Arc<QueryContext> {
        &self.ctx
    }

    /// The model being queried.
    pub fn get_meta(&self) -> &Arc<ModelMeta> {
        &self.model
    }

    /// The alias arena.
    pub const fn alias_map(&self) -> &AliasMap {
        &self.alias_map
    }

    /// The filter tree.
    pub const fn where_node(&self) -> &WhereNode {
        &self.where_
    }

    /// Explicitly selected columns.
    pub fn select(&self) -> &[Col] {
        &self.select
    }

    /// Whether the model's own columns are selected by default.
    pub const fn default_cols(&self) -> bool {
        self.default_cols
    }

    /// The GROUP BY state.
    pub const fn group_by(&self) -> &GroupBy {
        &self.group_by
    }

    /// The explicit ordering.
    pub fn order_by(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Whether the model's default ordering applies when no ordering is set.
    pub const fn default_ordering(&self) -> bool {
        self.default_ordering
    }

    /// The offset.
    pub const fn low_mark(&self) -> usize {
        self.low_mark
    }

    /// The exclusive upper bound, if any.
    pub const fn high_mark(&self) -> Option<usize> {
        self.high_mark
    }

    /// Whether `SELECT DISTINCT` is used.
    pub const fn is_distinct(&self) -> bool {
        self.distinct
    }

    /// The `DISTINCT ON` fields.
    pub fn distinct_fields(&self) -> &[String] {
        &self.distinct_fields
    }

    /// The `select_related` state.
    pub const fn select_related(&self) -> &SelectRelated {
        &self.select_related
    }

    /// Field names selected by `values()`.
    pub fn values_select(&self) -> &[String] {
        &self.values_select
    }

    /// All annotations, including masked ones.
    pub const fn annotations(&self) -> &IndexMap<String, Annotation> {
        &self.annotations
    }

    /// All `extra(select=...)` entries, including masked ones.
    pub const fn extra(&self) -> &IndexMap<String, ExtraSelect> {
        &self.extra
    }

    /// Tables added through `extra(tables=...)`.
    pub fn extra_tables(&self) -> &[String] {
        &self.extra_tables
    }

    /// The deferred-loading state.
    pub const fn deferred_loading(&self) -> &DeferredLoading {
        &self.deferred_loading
    }

    /// Aliases of an enclosing query referenced by this one.
    pub const fn external_aliases(&self) -> &BTreeSet<String> {
        &self.external_aliases
    }

    /// Whether `SELECT ... FOR UPDATE` is requested.
    pub const fn is_select_for_update(&self) -> bool {
        self.select_for_update
    }

    /// Returns `true` when the query has been nested in an aggregate wrapper.
    pub const fn is_aggregate_wrapper(&self) -> bool {
        self.subquery.is_some()
    }

    /// The wrapped inner query of an aggregate wrapper.
    pub fn inner_query(&self) -> Option<&Self> {
        self.subquery.as_deref()
    }

    /// Returns `true` if a column can hold NULL.
    ///
    /// On backends that store the empty string as NULL every text column is
    /// nullable.
    pub fn is_nullable(&self, field: &FieldDef) -> bool {
        (self.ctx.features().interprets_empty_strings_as_nulls
            && field.field_type.empty_strings_allowed())
            || field.null
    }

    /// Returns `true` if anything is selected explicitly.
    pub fn has_select_fields(&self) -> bool {
        !self.select.is_empty()
            || self.annotation_select_mask.as_ref().is_some_and(|m| !m.is_empty())
            || self.extra_select_mask.as_ref().is_some_and(|m| !m.is_empty())
    }

    // ── Aliases ─────────────────────────────────────────────────────

    /// Returns the base table alias, creating it on first use, and
    /// references it once more.
    pub fn get_initial_alias(&mut self) -> String {
        if let Some(base) = self.alias_map.base_alias() {
            self.alias_map.ref_alias(&base);
            base
        } else {
            self.alias_map.table_alias(&self.model.db_table, true).0
        }
    }

    /// Number of aliases still referenced.
    pub fn count_active_tables(&self) -> usize {
        self.alias_map.count_active()
    }

    /// Restores reference counts from a snapshot.
    pub fn reset_refcounts(&mut self, to: &BTreeMap<String, usize>) {
        self.alias_map.reset_refcounts(to);
    }

    fn relabel_references(&mut self, change_map: &BTreeMap<String, String>) {
        self.where_.relabel_aliases(change_map);
        for col in &mut self.select {
            *col = col.relabeled(change_map);
        }
        if let GroupBy::Exprs(exprs) = &mut self.group_by {
            for expr in exprs {
                *expr = expr.relabeled(change_map);
            }
        }
        for annotation in self.annotations.values_mut() {
            annotation.expr = annotation.expr.relabeled(change_map);
        }
        let rename = |alias: &String| change_map.get(alias).unwrap_or(alias).clone();
        self.external_aliases = self.external_aliases.iter().map(rename).collect();
        self.lookup_joins = self.lookup_joins.iter().map(rename).collect();
    }

    /// Renames aliases everywhere in the query.
    ///
    /// Old and new names must be disjoint so the rename is unambiguous.
    pub fn change_aliases(&mut self, change_map: &BTreeMap<String, String>) {
        debug_assert!(
            change_map.keys().all(|k| !change_map.values().any(|v| v == k)),
            "alias change map must not chain renames"
        );
        self.relabel_references(change_map);
        self.alias_map.relabel(change_map);
    }

    /// Returns a copy with aliases renamed through `change_map`.
    #[must_use]
    pub fn relabeled_clone(&self, change_map: &BTreeMap<String, String>) -> Self {
        let mut clone = self.clone();
        clone.change_aliases(change_map);
        clone
    }

    /// Renames references to aliases of an enclosing query. Aliases owned by
    /// this query are left alone.
    pub(crate) fn relabel_external(&mut self, change_map: &BTreeMap<String, String>) {
        let owned: BTreeSet<String> = self.alias_map.aliases().into_iter().collect();
        let external: BTreeMap<String, String> = change_map
            .iter()
            .filter(|(old, _)| !owned.contains(*old))
            .map(|(old, new)| (old.clone(), new.clone()))
            .collect();
        if !external.is_empty() {
            self.relabel_references(&external);
        }
    }

    /// Moves this query's aliases to a prefix not used by `outer` so it can
    /// be nested in it.
    ///
    /// Nothing happens when the prefixes already differ.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::AliasExhaustion`] when no free prefix is found
    /// within the configured number of attempts.
    pub fn bump_prefix(&mut self, outer: &mut Self) -> RelqResult<()> {
        if self.alias_map.prefix() != outer.alias_map.prefix() {
            return Ok(());
        }
        let limit = self.ctx.max_subquery_depth();
        let mut chosen = None;
        for (pos, prefix) in prefix_candidates(self.alias_map.prefix()).enumerate() {
            if !self.alias_map.subq_prefixes().contains(&prefix) {
                chosen = Some(prefix);
                break;
            }
            if pos > limit {
                return Err(RelqError::AliasExhaustion(pos));
            }
        }
        let Some(prefix) = chosen else {
            return Err(RelqError::AliasExhaustion(limit));
        };
        let change_map = self.alias_map.renumber(&prefix);
        outer.alias_map.add_subq_prefixes(self.alias_map.subq_prefixes());
        self.relabel_references(&change_map);
        tracing::debug!(prefix = %prefix, aliases = change_map.len(), "bumped subquery prefix");
        Ok(())
    }

    /// Reaches the table of an ancestor model through parent links,
    /// starting at `alias`. `seen` caches the alias of each ancestor
    /// already joined.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] if a parent link is missing.
    pub fn join_parent_model(
        &mut self,
        opts: &Arc<ModelMeta>,
        model: &str,
        alias: &str,
        seen: &mut BTreeMap<String, String>,
    ) -> RelqResult<String> {
        if let Some(alias) = seen.get(model) {
            return Ok(alias.clone());
        }
        let chain = self.ctx.models().base_chain(opts, model);
        if chain.is_empty() {
            return Ok(alias.to_string());
        }
        let mut curr_opts = Arc::clone(opts);
        let mut alias = alias.to_string();
        for int_model in chain {
            if let Some(known) = seen.get(&int_model.label) {
                alias = known.clone();
                curr_opts = int_model;
                continue;
            }
            let link = curr_opts
                .parent_link(&int_model.label)
                .map(|f| f.name.clone())
                .ok_or_else(|| {
                    RelqError::FieldError(format!(
                        "Model '{}' has no parent link to '{}'",
                        curr_opts.label, int_model.label
                    ))
                })?;
            let joined = match self.setup_joins(&[link], &curr_opts, &alias, None, true)? {
                SetupJoins::Joined(info) => info.joins.last().cloned().unwrap_or(alias),
                SetupJoins::RequiresSubquery(_) => alias,
            };
            seen.insert(int_model.label.clone(), joined.clone());
            alias = joined;
            curr_opts = int_model;
        }
        Ok(alias)
    }

    // ── Combination ─────────────────────────────────────────────────

    /// Merges `rhs` into this query under `connector`.
    ///
    /// Joins of `rhs` are added to this query (reused when the connector is
    /// OR and an equivalent join exists), its filter tree is relabeled and
    /// combined, and join types are recomputed from the INNER joins of both
    /// sides.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::IncompatibleQuery`] when the queries are over
    /// different models, either one is sliced, their distinct settings
    /// differ, or both carry `extra(select)` under OR.
    pub fn combine(&mut self, rhs: &Self, connector: Connector) -> RelqResult<()> {
        if self.model.label != rhs.model.label {
            return Err(RelqError::IncompatibleQuery(
                "Cannot combine queries on two different base models.".into(),
            ));
        }
        if !self.can_filter() || !rhs.can_filter() {
            return Err(RelqError::IncompatibleQuery(
                "Cannot combine queries once a slice has been taken.".into(),
            ));
        }
        if self.distinct != rhs.distinct {
            return Err(RelqError::IncompatibleQuery(
                "Cannot combine a unique query with a non-unique query.".into(),
            ));
        }
        if self.distinct_fields != rhs.distinct_fields {
            return Err(RelqError::IncompatibleQuery(
                "Cannot combine queries with different distinct fields.".into(),
            ));
        }
        if connector == Connector::Or && !self.extra.is_empty() && !rhs.extra.is_empty() {
            return Err(RelqError::IncompatibleQuery(
                "When merging querysets using 'or', you cannot have extra(select=...) on both sides."
                    .into(),
            ));
        }

        let mut reuse: BTreeSet<String> = match connector {
            Connector::And => BTreeSet::new(),
            Connector::Or => self.alias_map.aliases().into_iter().collect(),
        };
        let base = self.get_initial_alias();
        let mut promoter = JoinPromoter::new(connector, 2, false);
        promoter.add_votes(
            self.alias_map
                .aliases()
                .into_iter()
                .filter(|a| self.alias_map.join_type(a) == Some(JoinType::Inner)),
        );

        let mut change_map = BTreeMap::new();
        let rhs_aliases = rhs.alias_map.aliases();
        if let Some(rhs_base) = rhs_aliases.first() {
            if *rhs_base != base {
                change_map.insert(rhs_base.clone(), base.clone());
            }
        }
        let mut rhs_votes = BTreeSet::new();
        for alias in rhs_aliases.iter().skip(1) {
            let Some(join) = rhs.alias_map.get(alias) else {
                continue;
            };
            let join = join.relabeled(&change_map);
            let rhs_join_type = join.join_type;
            let before = self.alias_map.len();
            let new_alias = self.alias_map.join(join, Some(&reuse));
            let vote_type = if self.alias_map.len() > before {
                self.alias_map.join_type(&new_alias)
            } else {
                rhs_join_type
            };
            if vote_type == Some(JoinType::Inner) {
                rhs_votes.insert(new_alias.clone());
            }
            reuse.remove(&new_alias);
            if *alias != new_alias {
                change_map.insert(alias.clone(), new_alias.clone());
            }
            if rhs.alias_map.refcount(alias) == 0 {
                self.alias_map.unref_alias(&new_alias, 1);
            }
        }
        promoter.add_votes(rhs_votes);
        promoter.update_join_types(&mut self.alias_map);

        let rhs_where = rhs.where_.relabeled_clone(&change_map);
        self.where_.add(WhereChild::Node(rhs_where), connector);

        self.select = rhs.select.iter().map(|c| c.relabeled(&change_map)).collect();
        if !rhs.select.is_empty() {
            self.default_cols = rhs.default_cols;
        }

        for (name, extra) in &rhs.extra {
            self.extra.insert(name.clone(), extra.clone());
        }
        let mut extra_mask: BTreeSet<String> = BTreeSet::new();
        if let Some(mask) = &self.extra_select_mask {
            extra_mask.extend(mask.iter().cloned());
        }
        if let Some(mask) = &rhs.extra_select_mask {
            extra_mask.extend(mask.iter().cloned());
        }
        if !extra_mask.is_empty() {
            self.extra_select_mask = Some(extra_mask);
        }
        self.extra_tables.extend(rhs.extra_tables.iter().cloned());

        if !rhs.order_by.is_empty() {
            self.order_by.clone_from(&rhs.order_by);
        }
        if !rhs.extra_order_by.is_empty() {
            self.extra_order_by.clone_from(&rhs.extra_order_by);
        }
        tracing::debug!(?connector, relabeled = change_map.len(), "combined queries");
        Ok(())
    }

    // ── Limits ──────────────────────────────────────────────────────

    /// Narrows the slice of results, relative to the current one.
    ///
    /// Both bounds are offsets into the current slice and are clamped to its
    /// end. An empty slice makes the query match nothing.
    pub fn set_limits(&mut self, low: Option<usize>, high: Option<usize>) {
        if let Some(high) = high {
            let new_high = self.low_mark.saturating_add(high);
            self.high_mark = Some(self.high_mark.map_or(new_high, |h| h.min(new_high)));
        }
        if let Some(low) = low {
            let new_low = self.low_mark.saturating_add(low);
            self.low_mark = self.high_mark.map_or(new_low, |h| h.min(new_low));
        }
        if Some(self.low_mark) == self.high_mark {
            self.set_empty();
        }
    }

    /// Removes any slice.
    pub fn clear_limits(&mut self) {
        self.low_mark = 0;
        self.high_mark = None;
    }

    /// Returns `true` while no slice has been taken.
    pub const fn can_filter(&self) -> bool {
        self.low_mark == 0 && self.high_mark.is_none()
    }

    /// Returns `true` once a slice has been taken.
    pub const fn is_sliced(&self) -> bool {
        !self.can_filter()
    }

    /// Makes the query match no rows.
    pub fn set_empty(&mut self) {
        self.where_.add(WhereChild::Nothing, Connector::And);
    }

    /// Returns `true` if the query can match no rows.
    pub fn is_empty(&self) -> bool {
        self.where_
            .children
            .iter()
            .any(|c| matches!(c, WhereChild::Nothing))
    }

    // ── Select list ─────────────────────────────────────────────────

    /// Removes every selected column, annotation, and extra select.
    pub fn clear_select_clause(&mut self) {
        self.select.clear();
        self.default_cols = false;
        self.select_related = SelectRelated::Off;
        self.set_extra_mask(Some(BTreeSet::new()));
        self.set_annotation_mask(Some(BTreeSet::new()));
    }

    /// Removes the selected columns but keeps annotations and extra selects.
    pub fn clear_select_fields(&mut self) {
        self.select.clear();
        self.values_select.clear();
    }

    /// Selects one more column.
    pub fn add_select(&mut self, col: Col) {
        self.default_cols = false;
        self.select.push(col);
    }

    /// Replaces the selected columns.
    pub fn set_select(&mut self, cols: Vec<Col>) {
        self.default_cols = false;
        self.select = cols;
    }

    /// Applies `DISTINCT ON` the given field paths.
    pub fn add_distinct_fields(&mut self, names: &[&str]) {
        self.distinct_fields = names.iter().map(|n| (*n).to_string()).collect();
        self.distinct = true;
    }

    /// Selects the columns reached by the given field paths, joining as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for unknown names, and for paths
    /// crossing a many-to-many relation when `allow_m2m` is off.
    pub fn add_fields(&mut self, names: &[String], allow_m2m: bool) -> RelqResult<()> {
        let alias = self.get_initial_alias();
        let opts = Arc::clone(&self.model);
        for name in names {
            let parts = split_lookup(name);
            let setup = match self.setup_joins(&parts, &opts, &alias, None, allow_m2m) {
                Ok(setup) => setup,
                Err(RelqError::FieldError(_)) if !name.contains(LOOKUP_SEP) => {
                    let mut choices = self.ctx.models().field_names(&opts);
                    choices.extend(self.extra.keys().cloned());
                    choices.extend(self.annotations.keys().cloned());
                    choices.sort();
                    return Err(RelqError::FieldError(format!(
                        "Cannot resolve keyword '{name}' into field. Choices are: {}",
                        choices.join(", ")
                    )));
                }
                Err(err) => return Err(err),
            };
            let info = match setup {
                SetupJoins::Joined(info) => info,
                SetupJoins::RequiresSubquery(_) => {
                    return Err(RelqError::FieldError(format!("Invalid field name: '{name}'")));
                }
            };
            let (targets, final_alias, _) = self.trim_joins(info.targets, info.joins, &info.path);
            for target in targets {
                self.add_select(Col::new(final_alias.clone(), target));
            }
        }
        Ok(())
    }

    // ── Ordering and grouping ───────────────────────────────────────

    /// Appends ordering items.
    ///
    /// Names must look like field paths (optionally prefixed by `-` or `+`)
    /// or be `?` for random order. An empty list disables the model's
    /// default ordering.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for malformed names and for
    /// aggregates that were not added as annotations first.
    pub fn add_ordering(&mut self, items: Vec<OrderBy>) -> RelqResult<()> {
        let mut errors = Vec::new();
        for item in &items {
            match item {
                OrderBy::Name(name) => {
                    if !order_pattern().is_match(name) {
                        errors.push(name.clone());
                    }
                }
                OrderBy::Expression { expr, .. } => {
                    if expr.contains_aggregate() {
                        return Err(RelqError::FieldError(format!(
                            "Using an aggregate in order_by() without also including it in annotate() is not allowed: {}",
                            expr.describe()
                        )));
                    }
                }
            }
        }
        if !errors.is_empty() {
            return Err(RelqError::FieldError(format!(
                "Invalid order_by arguments: {errors:?}"
            )));
        }
        if items.is_empty() {
            self.default_ordering = false;
        } else {
            self.order_by.extend(items);
        }
        Ok(())
    }

    /// Removes the ordering. With `force_empty` the model's default ordering
    /// is disabled as well.
    pub fn clear_ordering(&mut self, force_empty: bool) {
        self.order_by.clear();
        self.extra_order_by.clear();
        if force_empty {
            self.default_ordering = false;
        }
    }

    /// Flips the direction of every ordering item.
    pub fn reverse_ordering(&mut self) {
        self.standard_ordering = !self.standard_ordering;
    }

    /// Groups by the selected columns and the non-aggregate parts of the
    /// selected annotations.
    pub fn set_group_by(&mut self) {
        let mut group_by: Vec<Expression> =
            self.select.iter().cloned().map(Expression::Col).collect();
        for (_, annotation) in self.annotation_select() {
            group_by.extend(annotation.expr.group_by_cols());
        }
        self.group_by = GroupBy::Exprs(group_by);
    }

    /// Adds relation paths to follow with `select_related`.
    pub fn add_select_related(&mut self, paths: &[&str]) {
        let mut tree = match std::mem::take(&mut self.select_related) {
            SelectRelated::Fields(tree) => tree,
            SelectRelated::Off | SelectRelated::All => RelatedTree::default(),
        };
        for path in paths {
            let mut node = &mut tree;
            for part in path.split(LOOKUP_SEP) {
                node = node.0.entry(part.to_string()).or_default();
            }
        }
        self.select_related = SelectRelated::Fields(tree);
    }

    /// Follows every non-null foreign key with `select_related`.
    pub fn set_select_related_all(&mut self) {
        self.select_related = SelectRelated::All;
    }

    /// Requests `SELECT ... FOR UPDATE`.
    pub fn set_select_for_update(&mut self, nowait: bool, skip_locked: bool) {
        self.select_for_update = true;
        self.select_for_update_nowait = nowait;
        self.select_for_update_skip_locked = skip_locked;
    }

    /// Sets `SELECT DISTINCT`.
    pub fn set_distinct(&mut self, distinct: bool) {
        self.distinct = distinct;
    }

    // ── Extra ───────────────────────────────────────────────────────

    /// Adds raw SQL pieces.
    ///
    /// `select` pairs an alias with a fragment; `select_params` are handed out
    /// to the fragments in order, one per `%s`. `where_sql` fragments are
    /// ANDed to the filter tree with `params`.
    pub fn add_extra(
        &mut self,
        select: Vec<(String, String)>,
        select_params: Vec<Value>,
        where_sql: Vec<String>,
        params: Vec<Value>,
        tables: Vec<String>,
        order_by: Vec<String>,
    ) {
        let mut select_params = select_params.into_iter();
        for (name, sql) in select {
            let count = count_placeholders(&sql);
            let params = select_params.by_ref().take(count).collect();
            self.extra.insert(name, ExtraSelect { sql, params });
        }
        if !where_sql.is_empty() || !params.is_empty() {
            self.where_.add(
                WhereChild::Extra(ExtraWhere {
                    sqls: where_sql,
                    params,
                }),
                Connector::And,
            );
        }
        self.extra_tables.extend(tables);
        if !order_by.is_empty() {
            self.extra_order_by = order_by;
        }
    }

    // ── Masks ───────────────────────────────────────────────────────

    /// Restricts the annotations that are selected. `None` selects all.
    pub fn set_annotation_mask(&mut self, names: Option<BTreeSet<String>>) {
        self.annotation_select_mask = names;
    }

    /// Adds names to an existing annotation mask.
    pub fn append_annotation_mask<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if let Some(mask) = &mut self.annotation_select_mask {
            mask.extend(names.into_iter().map(Into::into));
        }
    }

    /// Restricts the extra selects that are selected. `None` selects all.
    pub fn set_extra_mask(&mut self, names: Option<BTreeSet<String>>) {
        self.extra_select_mask = names;
    }

    /// The selected annotations, in insertion order.
    pub fn annotation_select(&self) -> impl Iterator<Item = (&String, &Annotation)> + '_ {
        self.annotations.iter().filter(move |(name, _)| {
            self.annotation_select_mask
                .as_ref()
                .map_or(true, |mask| mask.contains(*name))
        })
    }

    /// The selected extra columns, in insertion order.
    pub fn extra_select(&self) -> impl Iterator<Item = (&String, &ExtraSelect)> + '_ {
        self.extra.iter().filter(move |(name, _)| {
            self.extra_select_mask
                .as_ref()
                .map_or(true, |mask| mask.contains(*name))
        })
    }

    /// Selects the given names for `values()`: fields, annotations, and
    /// extra selects. An empty list selects every concrete field.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for unknown field names.
    pub fn set_values(&mut self, fields: &[String]) -> RelqResult<()> {
        self.select_related = SelectRelated::Off;
        self.clear_deferred_loading();
        self.clear_select_fields();

        if matches!(self.group_by, GroupBy::All) {
            let names = self.concrete_attnames();
            self.add_fields(&names, false)?;
            self.set_group_by();
            self.clear_select_fields();
        }

        let field_names = if fields.is_empty() {
            self.concrete_attnames()
        } else if self.extra.is_empty() && self.annotations.is_empty() {
            fields.to_vec()
        } else {
            self.default_cols = false;
            let mut field_names = Vec::new();
            let mut extra_names = BTreeSet::new();
            let mut annotation_names = BTreeSet::new();
            for name in fields {
                if self.extra.contains_key(name) {
                    extra_names.insert(name.clone());
                } else if self.annotations.contains_key(name) {
                    annotation_names.insert(name.clone());
                } else {
                    field_names.push(name.clone());
                }
            }
            self.set_extra_mask(Some(extra_names));
            self.set_annotation_mask(Some(annotation_names));
            field_names
        };
        self.values_select.clone_from(&field_names);
        self.add_fields(&field_names, true)
    }

    fn concrete_attnames(&self) -> Vec<String> {
        self.ctx
            .models()
            .all_concrete_fields(&self.model)
            .into_iter()
            .map(|(_, f)| f.attname().to_string())
            .collect()
    }

    // ── Deferred loading ────────────────────────────────────────────

    /// Loads every field again.
    pub fn clear_deferred_loading(&mut self) {
        self.deferred_loading = DeferredLoading::default();
    }

    /// Excludes fields from loading (`defer()`).
    ///
    /// In `only()` mode the names are removed from the loaded set instead.
    pub fn add_deferred_loading<S: AsRef<str>>(&mut self, names: &[S]) {
        let names = names.iter().map(|n| n.as_ref().to_string());
        if self.deferred_loading.defer {
            self.deferred_loading.names.extend(names);
        } else {
            for name in names {
                self.deferred_loading.names.remove(&name);
            }
        }
    }

    /// Loads only the given fields (`only()`); `pk` stands for the primary
    /// key.
    ///
    /// Names already deferred stay deferred.
    pub fn add_immediate_loading<S: AsRef<str>>(&mut self, names: &[S]) {
        let pk_name = self.model.pk().name.clone();
        let names: BTreeSet<String> = names
            .iter()
            .map(|n| {
                let n = n.as_ref();
                if n == "pk" {
                    pk_name.clone()
                } else {
                    n.to_string()
                }
            })
            .collect();
        let names = if self.deferred_loading.defer {
            names
                .difference(&self.deferred_loading.names)
                .cloned()
                .collect()
        } else {
            names
        };
        self.deferred_loading = DeferredLoading {
            names,
            defer: false,
        };
    }

    /// The attnames to load per model label, or an empty map when every
    /// field is loaded.
    ///
    /// The primary key of every model reached and the relation fields used to
    /// reach it are always included. In `only()` mode the concrete parents of
    /// the queried model are listed as well, possibly with no fields.
    ///
    /// # Errors
    ///
    /// Returns [`RelqError::FieldError`] for unknown names.
    pub fn get_loaded_field_names(&self) -> RelqResult<BTreeMap<String, BTreeSet<String>>> {
        let DeferredLoading { names, defer } = &self.deferred_loading;
        if names.is_empty() {
            return Ok(BTreeMap::new());
        }
        let registry = self.ctx.models();
        let orig_opts = &self.model;
        let mut seen: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut must_include: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        must_include
            .entry(orig_opts.label.clone())
            .or_default()
            .insert(orig_opts.pk().attname().to_string());

        for field_name in names {
            let parts = split_lookup(field_name);
            let mut opts = Arc::clone(orig_opts);
            let mut cur_model = opts.label.clone();
            let Some((last, relations)) = parts.split_last() else {
                continue;
            };
            for name in relations {
                let old_model = cur_model.clone();
                let source = registry
                    .get_field(&opts, name)
                    .ok_or_else(|| unknown_field(&opts, name))?;
                cur_model = source
                    .related_model()
                    .ok_or_else(|| unknown_field(&opts, name))?
                    .to_string();
                opts = registry.require(&cur_model)?;
                if !source.is_reverse_one_to_one() {
                    if let Some(def) = source.field_def() {
                        must_include
                            .entry(old_model)
                            .or_default()
                            .insert(def.attname().to_string());
                    }
                }
                must_include
                    .entry(cur_model.clone())
                    .or_default()
                    .insert(opts.pk().attname().to_string());
            }
            let field = registry
                .get_field(&opts, last)
                .ok_or_else(|| unknown_field(&opts, last))?;
            let model = match &field {
                ModelField::Reverse { relation, .. } => relation.related_model.clone(),
                ModelField::Declared { owner, .. } if *owner == opts.label => cur_model.clone(),
                ModelField::Declared { owner, .. } => owner.clone(),
            };
            if let Some(def) = field.field_def() {
                seen.entry(model)
                    .or_default()
                    .insert(def.attname().to_string());
            }
        }

        if *defer {
            let mut workset: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
            for (model, values) in &seen {
                let opts = registry.require(model)?;
                for (owner, field) in registry.all_concrete_fields(&opts) {
                    if values.contains(field.attname()) {
                        continue;
                    }
                    workset
                        .entry(owner.label.clone())
                        .or_default()
                        .insert(field.attname().to_string());
                }
            }
            for (model, values) in must_include {
                if let Some(set) = workset.get_mut(&model) {
                    set.extend(values);
                }
            }
            Ok(workset)
        } else {
            for (model, values) in must_include {
                seen.entry(model).or_default().extend(values);
            }
            for parent in ancestors(self, orig_opts) {
                seen.entry(parent).or_default();
            }
            Ok(seen)
        }
    }

    // ── Compilation ─────────────────────────────────────────────────

    /// A compiler for `backend`, working on a copy of the query.
    pub fn get_compiler(&self, backend: DatabaseBackendType) -> SqlCompiler {
        SqlCompiler::new(self.clone(), backend)
    }

    /// Compiles the query for the configured backend.
    ///
    /// # Errors
    ///
    /// Returns an error if ordering or select-related paths cannot be
    /// resolved, or the backend lacks a requested feature.
    pub fn sql_with_params(&self) -> RelqResult<CompiledQuery> {
        self.get_compiler(self.ctx.features().backend).as_sql()
    }
}

fn unknown_field(opts: &ModelMeta, name: &str) -> RelqError {
    RelqError::FieldError(format!("{} has no field named '{name}'", opts.label))
}

fn ancestors(query: &Query, opts: &ModelMeta) -> Vec<String> {
    let mut out = Vec::new();
    for parent in opts.parents().filter_map(|p| query.ctx.models().get(p)) {
        out.push(parent.label.clone());
        out.extend(ancestors(query, &parent));
    }
    out
}

/// Counts `%s` placeholders, ignoring escaped `%%`.
pub(crate) fn count_placeholders(sql: &str) -> usize {
    let mut count = 0;
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.next() {
                Some('s') => count += 1,
                Some(_) | None => {}
            }
        }
    }
    count
}

/// Alias prefixes to try after `current`: the next letter, then every
/// sequence of one or more letters in order, starting the single letters at
/// the next one.
///
/// After `Z` there is no next letter, so the sequence starts over at `A`.
/// Prefixes already in use are skipped by the caller.
fn prefix_candidates(current: &str) -> impl Iterator<Item = String> {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let next = current
        .bytes()
        .next()
        .and_then(|c| ALPHABET.iter().position(|&a| a == c))
        .map(|i| i + 1)
        .filter(|&i| i < ALPHABET.len());
    let first = next.map(|i| char::from(ALPHABET[i]).to_string());
    let mut start = next.unwrap_or(0);
    first.into_iter().chain((1_u32..).flat_map(move |len| {
        let seq = &ALPHABET[start..];
        start = 0;
        let total = seq.len().checked_pow(len).unwrap_or(usize::MAX);
        (0..total).map(move |mut index| {
            let mut out = vec![0_u8; len as usize];
            for slot in out.iter_mut().rev() {
                *slot = seq[index % seq.len()];
                index /= seq.len();
            }
            String::from_utf8_lossy(&out).into_owned()
        })
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::lookups::Q;
    use crate::testing::{library_context, places_context};

    fn book_query() -> Query {
        Query::new(library_context(), "library.book").unwrap()
    }

    #[test]
    fn test_prefix_candidates() {
        let first: Vec<String> = prefix_candidates("T").take(8).collect();
        assert_eq!(first, vec!["U", "U", "V", "W", "X", "Y", "Z", "AA"]);
        let after_z: Vec<String> = prefix_candidates("Z").take(28).collect();
        assert_eq!(after_z[..2], ["A", "B"]);
        assert_eq!(after_z[25..], ["Z", "AA", "AB"]);
    }

    #[test]
    fn test_count_placeholders() {
        assert_eq!(count_placeholders("a = %s AND b = %s"), 2);
        assert_eq!(count_placeholders("a LIKE '100%%' AND b = %s"), 1);
        assert_eq!(count_placeholders("1"), 0);
    }

    #[test]
    fn test_initial_alias_is_table_name() {
        let mut q = book_query();
        assert_eq!(q.get_initial_alias(), "library_book");
        assert_eq!(q.get_initial_alias(), "library_book");
        assert_eq!(q.alias_map().refcount("library_book"), 2);
    }

    #[test]
    fn test_clone_isolation() {
        let mut original = book_query();
        original.add_filter("title", "Dune").unwrap();
        let snapshot_aliases = original.alias_map().aliases();
        let snapshot_children = original.where_node().children.len();

        let mut clone = original.clone();
        clone.add_filter("author__name", "Frank").unwrap();
        clone.set_limits(Some(1), Some(5));
        clone.add_fields(&["title".to_string()], false).unwrap();

        assert_eq!(original.alias_map().aliases(), snapshot_aliases);
        assert_eq!(original.where_node().children.len(), snapshot_children);
        assert_eq!(original.low_mark(), 0);
        assert_eq!(original.high_mark(), None);
        assert!(original.select().is_empty());
        assert!(original.default_cols());
    }

    #[test]
    fn test_set_limits_relative_and_clamped() {
        let mut q = book_query();
        q.set_limits(Some(5), Some(20));
        assert_eq!((q.low_mark(), q.high_mark()), (5, Some(20)));
        q.set_limits(Some(2), Some(100));
        assert_eq!((q.low_mark(), q.high_mark()), (7, Some(20)));
        assert!(q.is_sliced());
        assert!(!q.is_empty());
    }

    #[test]
    fn test_set_limits_idempotent_for_unbounded_zero() {
        let mut q = book_query();
        q.set_limits(Some(0), None);
        let once = (q.low_mark(), q.high_mark());
        q.set_limits(Some(0), None);
        assert_eq!((q.low_mark(), q.high_mark()), once);
        assert!(q.can_filter());
    }

    #[test]
    fn test_set_limits_saturates_on_huge_bounds() {
        let mut q = book_query();
        q.set_limits(Some(10), None);
        q.set_limits(None, Some(usize::MAX));
        assert_eq!((q.low_mark(), q.high_mark()), (10, Some(usize::MAX)));
        q.set_limits(Some(usize::MAX), None);
        assert_eq!((q.low_mark(), q.high_mark()), (usize::MAX, Some(usize::MAX)));
        assert!(q.is_empty());
    }

    #[test]
    fn test_equal_limits_make_query_empty() {
        let mut q = book_query();
        q.set_limits(Some(3), Some(3));
        assert!(q.is_empty());
    }

    #[test]
    fn test_bump_prefix_gives_disjoint_aliases() {
        let mut outer = book_query();
        outer.add_filter("author__name", "x").unwrap();
        let mut inner = book_query();
        inner.add_filter("author__age__gt", 30).unwrap();
        inner.bump_prefix(&mut outer).unwrap();

        let outer_aliases: BTreeSet<String> = outer.alias_map().aliases().into_iter().collect();
        for alias in inner.alias_map().aliases() {
            assert!(!outer_aliases.contains(&alias), "alias {alias} collides");
            assert!(alias.starts_with('U'));
        }
        assert!(outer.alias_map().subq_prefixes().contains("U"));
        let cols: Vec<String> = inner.where_node().children.iter().filter_map(|c| match c {
            WhereChild::Condition(cond) => cond.lhs.cols().first().map(|c| c.alias.clone()),
            _ => None,
        }).collect();
        assert_eq!(cols, vec!["U1"]);
    }

    #[test]
    fn test_bump_prefix_noop_when_prefixes_differ() {
        let mut outer = book_query();
        let mut inner = book_query();
        inner.get_initial_alias();
        inner.bump_prefix(&mut outer).unwrap();
        let aliases = inner.alias_map().aliases();
        inner.bump_prefix(&mut outer).unwrap();
        assert_eq!(inner.alias_map().aliases(), aliases);
    }

    #[test]
    fn test_bump_prefix_exhaustion() {
        let ctx = QueryContext::builder(crate::testing::library_registry())
            .max_subquery_depth(3)
            .build();
        let mut outer = Query::new(Arc::clone(&ctx), "library.book").unwrap();
        let mut inner = Query::new(ctx, "library.book").unwrap();
        inner.get_initial_alias();
        let taken: Vec<String> = ["U", "V", "W", "X", "Y", "Z"].iter().map(|s| s.to_string()).collect();
        inner.alias_map.add_subq_prefixes(&taken);
        let err = inner.bump_prefix(&mut outer).unwrap_err();
        assert!(matches!(err, RelqError::AliasExhaustion(_)));
    }

    #[test]
    fn test_combine_rejects_different_models() {
        let mut q = book_query();
        let other = Query::new(library_context(), "library.author").unwrap();
        let err = q.combine(&other, Connector::And).unwrap_err();
        assert!(err.to_string().contains("two different base models"));
    }

    #[test]
    fn test_combine_rejects_sliced_and_distinct_mismatch() {
        let mut q = book_query();
        let mut sliced = book_query();
        sliced.set_limits(None, Some(2));
        assert!(matches!(
            q.combine(&sliced, Connector::Or),
            Err(RelqError::IncompatibleQuery(_))
        ));
        let mut distinct = book_query();
        distinct.set_distinct(true);
        assert!(q
            .combine(&distinct, Connector::Or)
            .unwrap_err()
            .to_string()
            .contains("unique query"));
    }

    #[test]
    fn test_combine_or_reuses_joins_and_promotes() {
        let mut lhs = book_query();
        lhs.add_filter("publisher__name", "Ace").unwrap();
        let mut rhs = book_query();
        rhs.add_filter("editor__name", "Ann").unwrap();
        lhs.combine(&rhs, Connector::Or).unwrap();

        assert_eq!(lhs.where_node().connector, Connector::Or);
        let publisher = lhs.alias_map().aliases_for_table("library_publisher");
        let editor = lhs.alias_map().aliases_for_table("library_author");
        assert_eq!(publisher.len(), 1);
        assert_eq!(editor.len(), 1);
        assert_eq!(lhs.alias_map().join_type(&publisher[0]), Some(JoinType::LeftOuter));
        assert_eq!(lhs.alias_map().join_type(&editor[0]), Some(JoinType::LeftOuter));
    }

    #[test]
    fn test_combine_and_keeps_separate_joins() {
        let mut lhs = book_query();
        lhs.add_filter("tags__name", "a").unwrap();
        let mut rhs = book_query();
        rhs.add_filter("tags__name", "b").unwrap();
        lhs.combine(&rhs, Connector::And).unwrap();
        assert_eq!(lhs.alias_map().aliases_for_table("library_tag").len(), 2);
    }

    #[test]
    fn test_change_aliases_and_relabeled_clone() {
        let mut q = book_query();
        q.add_filter("author__name", "x").unwrap();
        let mut change = BTreeMap::new();
        change.insert("library_author".to_string(), "A1".to_string());
        let relabeled = q.relabeled_clone(&change);
        assert!(relabeled.alias_map().contains("A1"));
        assert!(q.alias_map().contains("library_author"));
    }

    #[test]
    fn test_add_ordering_validation() {
        let mut q = book_query();
        q.add_ordering(vec!["-title".into(), "author__name".into(), "?".into()])
            .unwrap();
        assert_eq!(q.order_by().len(), 3);

        let err = q.add_ordering(vec!["title; DROP".into()]).unwrap_err();
        assert!(err.to_string().contains("Invalid order_by arguments"));

        let err = q
            .add_ordering(vec![OrderBy::asc(Expression::count_all())])
            .unwrap_err();
        assert!(err.to_string().contains("aggregate in order_by()"));
    }

    #[test]
    fn test_empty_ordering_disables_default() {
        let mut q = book_query();
        q.add_ordering(Vec::new()).unwrap();
        assert!(!q.default_ordering());
        q.default_ordering = true;
        q.clear_ordering(false);
        assert!(q.default_ordering());
        q.clear_ordering(true);
        assert!(!q.default_ordering());
    }

    #[test]
    fn test_add_fields_errors() {
        let mut q = book_query();
        let err = q.add_fields(&["nope".to_string()], false).unwrap_err();
        assert!(err.to_string().contains("Choices are"));
        let err = q.add_fields(&["tags__name".to_string()], false).unwrap_err();
        assert!(err.to_string().contains("Invalid field name: 'tags__name'"));
    }

    #[test]
    fn test_add_fields_trims_fk_join() {
        let mut q = book_query();
        q.add_fields(&["author__id".to_string()], false).unwrap();
        assert_eq!(q.select()[0].alias, "library_book");
        assert_eq!(q.select()[0].column(), "author_id");
        assert_eq!(q.count_active_tables(), 1);
    }

    #[test]
    fn test_select_related_tree() {
        let mut q = book_query();
        q.add_select_related(&["author", "publisher__country"]);
        q.add_select_related(&["publisher"]);
        match q.select_related() {
            SelectRelated::Fields(tree) => {
                assert!(tree.0.contains_key("author"));
                assert!(tree.0["publisher"].0.contains_key("country"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_add_extra_pairs_params() {
        let mut q = book_query();
        q.add_extra(
            vec![
                ("a".into(), "pages > %s".into()),
                ("b".into(), "pages + %s + %s".into()),
            ],
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
            vec!["pages < %s".into()],
            vec![Value::Int(9)],
            Vec::new(),
            vec!["-a".into()],
        );
        assert_eq!(q.extra()["a"].params, vec![Value::Int(1)]);
        assert_eq!(q.extra()["b"].params, vec![Value::Int(2), Value::Int(3)]);
        assert!(matches!(q.where_node().children[0], WhereChild::Extra(_)));
    }

    #[test]
    fn test_masks() {
        let mut q = book_query();
        q.add_annotation(Expression::count(Expression::f("tags")), "n_tags", false)
            .unwrap();
        q.add_annotation(Expression::max(Expression::f("pages")), "most", false)
            .unwrap();
        assert_eq!(q.annotation_select().count(), 2);
        q.set_annotation_mask(Some(BTreeSet::from(["most".to_string()])));
        let names: Vec<&String> = q.annotation_select().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["most"]);
        q.append_annotation_mask(["n_tags"]);
        assert_eq!(q.annotation_select().count(), 2);
    }

    #[test]
    fn test_set_values_splits_names() {
        let mut q = book_query();
        q.add_annotation(Expression::count(Expression::f("tags")), "n_tags", false)
            .unwrap();
        q.set_values(&["title".to_string(), "n_tags".to_string()]).unwrap();
        assert_eq!(q.values_select(), ["title".to_string()]);
        assert_eq!(q.annotation_select().count(), 1);
        assert_eq!(q.select().len(), 1);
        assert!(!q.default_cols());
    }

    #[test]
    fn test_deferred_loading_modes() {
        let mut q = book_query();
        q.add_deferred_loading(&["title", "pages"]);
        assert!(q.deferred_loading().defer);
        q.add_immediate_loading(&["pk", "title", "rating"]);
        let loading = q.deferred_loading();
        assert!(!loading.defer);
        assert!(loading.names.contains("id"));
        assert!(loading.names.contains("rating"));
        assert!(!loading.names.contains("title"));

        q.add_deferred_loading(&["rating"]);
        assert!(!q.deferred_loading().names.contains("rating"));
    }

    #[test]
    fn test_loaded_field_names_defer() {
        let mut q = book_query();
        q.add_deferred_loading(&["title", "author__age"]);
        let loaded = q.get_loaded_field_names().unwrap();
        let book = &loaded["library.book"];
        assert!(!book.contains("title"));
        assert!(book.contains("id"));
        assert!(book.contains("pages"));
        let author = &loaded["library.author"];
        assert!(!author.contains("age"));
        assert!(author.contains("id"));
        assert!(author.contains("name"));
    }

    #[test]
    fn test_loaded_field_names_only() {
        let mut q = book_query();
        q.add_immediate_loading(&["title", "author__name"]);
        let loaded = q.get_loaded_field_names().unwrap();
        assert_eq!(
            loaded["library.book"],
            BTreeSet::from(["id".to_string(), "title".to_string(), "author_id".to_string()])
        );
        assert_eq!(
            loaded["library.author"],
            BTreeSet::from(["id".to_string(), "name".to_string()])
        );
    }

    #[test]
    fn test_loaded_field_names_only_lists_parents() {
        let mut q = Query::new(places_context(), "places.restaurant").unwrap();
        q.add_immediate_loading(&["serves_pizza"]);
        let loaded = q.get_loaded_field_names().unwrap();
        assert!(loaded.contains_key("places.place"));
        assert!(loaded["places.restaurant"].contains("serves_pizza"));
    }

    #[test]
    fn test_is_nullable_with_empty_string_backend() {
        let q = book_query();
        let title = q.get_meta().local_field("title").unwrap().clone();
        assert!(!q.is_nullable(&title));

        let ctx = QueryContext::builder(crate::testing::library_registry())
            .features(crate::context::DatabaseFeatures {
                backend: DatabaseBackendType::SQLite,
                interprets_empty_strings_as_nulls: true,
            })
            .build();
        let q = Query::new(ctx, "library.book").unwrap();
        assert!(q.is_nullable(&title));
    }

    #[test]
    fn test_join_parent_model() {
        let mut q = Query::new(places_context(), "places.restaurant").unwrap();
        let base = q.get_initial_alias();
        let opts = Arc::clone(q.get_meta());
        let mut seen = BTreeMap::new();
        let alias = q
            .join_parent_model(&opts, "places.place", &base, &mut seen)
            .unwrap();
        assert_eq!(alias, "places_place");
        assert_eq!(seen["places.place"], "places_place");
        let again = q
            .join_parent_model(&opts, "places.place", &base, &mut seen)
            .unwrap();
        assert_eq!(again, alias);
        assert_eq!(q.alias_map().len(), 2);
    }

    #[test]
    fn test_has_select_fields() {
        let mut q = book_query();
        assert!(!q.has_select_fields());
        q.add_q(&Q::filter("pages__gt", 1)).unwrap();
        assert!(!q.has_select_fields());
        q.add_fields(&["title".to_string()], false).unwrap();
        assert!(q.has_select_fields());
    }
}
