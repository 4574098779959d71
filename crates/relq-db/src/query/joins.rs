//! Table aliases and joins.
//!
//! [`AliasMap`] is the arena of every table a query touches. Entries keep
//! insertion order (the FROM clause is rendered in that order), carry a
//! reference count (an alias with count zero is omitted from the SQL), and
//! hold the [`Join`] descriptor connecting the alias to its parent.
//!
//! Alias names are derived from an entry's label: the first use of a table is
//! aliased by the table name itself, later uses get `<prefix><n>` where `n`
//! is the arena size at creation time. The prefix starts as `T` and is bumped
//! when the query is nested inside another one.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// The kind of SQL join.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinType {
    /// `INNER JOIN`
    Inner,
    /// `LEFT OUTER JOIN`
    LeftOuter,
}

impl JoinType {
    /// Returns the SQL keyword.
    pub const fn sql_keyword(self) -> &'static str {
        match self {
            Self::Inner => "INNER JOIN",
            Self::LeftOuter => "LEFT OUTER JOIN",
        }
    }
}

/// How an alias is connected to the query.
///
/// A base table has no parent and no join type. Every other entry joins
/// `table_name` to `parent_alias` on `join_cols` pairs of
/// `(parent column, joined column)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    /// The joined table.
    pub table_name: String,
    /// The alias this join hangs off; `None` for a base table.
    pub parent_alias: Option<String>,
    /// `None` for a base table.
    pub join_type: Option<JoinType>,
    /// Column pairs `(parent column, joined column)`.
    pub join_cols: Vec<(String, String)>,
    /// Identity of the relation traversed by the join.
    pub join_field: String,
    /// Whether the join may find no matching row.
    pub nullable: bool,
}

impl Join {
    /// A base table entry.
    pub fn base(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            parent_alias: None,
            join_type: None,
            join_cols: Vec::new(),
            join_field: String::new(),
            nullable: false,
        }
    }

    /// A join to `table_name` from `parent_alias`. The join type is decided
    /// when the join is added to an [`AliasMap`].
    pub fn new(
        table_name: impl Into<String>,
        parent_alias: impl Into<String>,
        join_cols: Vec<(String, String)>,
        join_field: impl Into<String>,
        nullable: bool,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            parent_alias: Some(parent_alias.into()),
            join_type: Some(JoinType::Inner),
            join_cols,
            join_field: join_field.into(),
            nullable,
        }
    }

    /// Returns `true` for a base table entry.
    pub const fn is_base(&self) -> bool {
        self.parent_alias.is_none()
    }

    /// Two joins are interchangeable when they connect the same table to the
    /// same parent through the same relation; the join type does not matter.
    /// Base tables are never interchangeable.
    pub fn equivalent(&self, other: &Self) -> bool {
        !self.is_base()
            && !other.is_base()
            && self.table_name == other.table_name
            && self.parent_alias == other.parent_alias
            && self.join_cols == other.join_cols
            && self.join_field == other.join_field
    }

    /// Returns a copy with the parent alias renamed through `change_map`.
    #[must_use]
    pub fn relabeled(&self, change_map: &BTreeMap<String, String>) -> Self {
        let mut join = self.clone();
        if let Some(parent) = &self.parent_alias {
            if let Some(new) = change_map.get(parent) {
                join.parent_alias = Some(new.clone());
            }
        }
        join
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AliasLabel {
    /// The table name itself.
    Table,
    /// `<prefix><n>`
    Numbered(usize),
    /// A name assigned by relabeling.
    Named(String),
}

#[derive(Debug, Clone)]
struct AliasEntry {
    label: AliasLabel,
    join: Join,
    refcount: usize,
}

/// The alias arena of a query.
#[derive(Debug, Clone)]
pub struct AliasMap {
    entries: Vec<AliasEntry>,
    prefix: String,
    subq_prefixes: BTreeSet<String>,
}

impl Default for AliasMap {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            prefix: "T".to_string(),
            subq_prefixes: std::iter::once("T".to_string()).collect(),
        }
    }
}

impl AliasMap {
    /// Creates an empty arena with prefix `T`.
    pub fn new() -> Self {
        Self::default()
    }

    fn name_of(&self, entry: &AliasEntry) -> String {
        match &entry.label {
            AliasLabel::Table => entry.join.table_name.clone(),
            AliasLabel::Numbered(n) => format!("{}{n}", self.prefix),
            AliasLabel::Named(name) => name.clone(),
        }
    }

    fn is_named(&self, entry: &AliasEntry, alias: &str) -> bool {
        match &entry.label {
            AliasLabel::Table => entry.join.table_name == alias,
            AliasLabel::Numbered(n) => alias
                .strip_prefix(self.prefix.as_str())
                .filter(|digits| !digits.starts_with('0') && digits.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|digits| digits.parse::<usize>().ok())
                == Some(*n),
            AliasLabel::Named(name) => name == alias,
        }
    }

    fn position(&self, alias: &str) -> Option<usize> {
        self.entries.iter().position(|e| self.is_named(e, alias))
    }

    fn entry_mut(&mut self, alias: &str) -> Option<&mut AliasEntry> {
        self.position(alias).map(|i| &mut self.entries[i])
    }

    /// Number of aliases, including unreferenced ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no alias exists yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Alias names in insertion order.
    pub fn aliases(&self) -> Vec<String> {
        self.entries.iter().map(|e| self.name_of(e)).collect()
    }

    /// Returns `true` if the alias exists.
    pub fn contains(&self, alias: &str) -> bool {
        self.position(alias).is_some()
    }

    /// The join descriptor of an alias.
    pub fn get(&self, alias: &str) -> Option<&Join> {
        self.position(alias).map(|i| &self.entries[i].join)
    }

    /// The join type of an alias; `None` for base tables and unknown aliases.
    pub fn join_type(&self, alias: &str) -> Option<JoinType> {
        self.get(alias).and_then(|j| j.join_type)
    }

    /// The reference count of an alias (zero for unknown aliases).
    pub fn refcount(&self, alias: &str) -> usize {
        self.position(alias).map_or(0, |i| self.entries[i].refcount)
    }

    /// The first alias, which is the query's base table.
    pub fn base_alias(&self) -> Option<String> {
        self.entries.first().map(|e| self.name_of(e))
    }

    /// Aliases of a table, in creation order.
    pub fn aliases_for_table(&self, table: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.join.table_name == table)
            .map(|e| self.name_of(e))
            .collect()
    }

    /// Current reference counts.
    pub fn refcounts(&self) -> BTreeMap<String, usize> {
        self.entries
            .iter()
            .map(|e| (self.name_of(e), e.refcount))
            .collect()
    }

    /// Number of aliases with a positive reference count.
    pub fn count_active(&self) -> usize {
        self.entries.iter().filter(|e| e.refcount > 0).count()
    }

    /// The prefix used for numbered aliases.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Prefixes already taken by this query and the subqueries nested in it.
    pub fn subq_prefixes(&self) -> &BTreeSet<String> {
        &self.subq_prefixes
    }

    pub(crate) fn add_subq_prefixes<'a>(&mut self, prefixes: impl IntoIterator<Item = &'a String>) {
        self.subq_prefixes.extend(prefixes.into_iter().cloned());
    }

    fn allocate(&mut self, join: Join) -> String {
        debug_assert!(
            join.parent_alias.as_ref().map_or(true, |p| self.contains(p)),
            "join parent must already be registered"
        );
        let label = if self.aliases_for_table(&join.table_name).is_empty() {
            AliasLabel::Table
        } else {
            AliasLabel::Numbered(self.entries.len() + 1)
        };
        self.entries.push(AliasEntry {
            label,
            join,
            refcount: 1,
        });
        let entry = &self.entries[self.entries.len() - 1];
        self.name_of(entry)
    }

    /// Returns an alias for `table_name` and whether it was newly created.
    ///
    /// Without `create` the first existing alias of the table is reused and
    /// referenced once more. A created alias is a standalone base entry.
    pub fn table_alias(&mut self, table_name: &str, create: bool) -> (String, bool) {
        if !create {
            if let Some(alias) = self.aliases_for_table(table_name).into_iter().next() {
                self.ref_alias(&alias);
                return (alias, false);
            }
        }
        (self.allocate(Join::base(table_name)), true)
    }

    /// Increases the reference count of an alias.
    pub fn ref_alias(&mut self, alias: &str) {
        if let Some(entry) = self.entry_mut(alias) {
            entry.refcount += 1;
        }
    }

    /// Decreases the reference count of an alias by `amount`, saturating at
    /// zero.
    pub fn unref_alias(&mut self, alias: &str, amount: usize) {
        if let Some(entry) = self.entry_mut(alias) {
            entry.refcount = entry.refcount.saturating_sub(amount);
        }
    }

    /// Resets every reference count to the given snapshot; aliases missing
    /// from it drop to zero.
    pub fn reset_refcounts(&mut self, to: &BTreeMap<String, usize>) {
        let names = self.aliases();
        for (entry, name) in self.entries.iter_mut().zip(names) {
            entry.refcount = to.get(&name).copied().unwrap_or(0);
        }
    }

    /// Adds a join, reusing an equivalent one when allowed.
    ///
    /// `reuse` of `None` allows reusing any equivalent alias; otherwise only
    /// aliases in the set qualify. A reused alias is referenced once more. A
    /// new join is `LEFT OUTER` when its parent is `LEFT OUTER` or the join is
    /// nullable, `INNER` otherwise.
    pub fn join(&mut self, mut join: Join, reuse: Option<&BTreeSet<String>>) -> String {
        let reusable = self.entries.iter().find(|e| {
            e.join.equivalent(&join) && reuse.map_or(true, |r| r.contains(&self.name_of(e)))
        });
        if let Some(entry) = reusable {
            let alias = self.name_of(entry);
            self.ref_alias(&alias);
            tracing::trace!(alias = %alias, "reusing join");
            return alias;
        }

        if join.join_type.is_some() {
            let parent_outer = join
                .parent_alias
                .as_deref()
                .and_then(|p| self.join_type(p))
                == Some(JoinType::LeftOuter);
            join.join_type = Some(if parent_outer || join.nullable {
                JoinType::LeftOuter
            } else {
                JoinType::Inner
            });
        }
        let join_type = join.join_type;
        let alias = self.allocate(join);
        tracing::trace!(alias = %alias, ?join_type, "new join");
        alias
    }

    /// Promotes joins to `LEFT OUTER`.
    ///
    /// A join is promoted when it is nullable or its parent is `LEFT OUTER`.
    /// Promotion cascades to every join hanging off a promoted alias so a
    /// chain never has an `INNER` join after a `LEFT OUTER` one.
    pub fn promote_joins(&mut self, aliases: impl IntoIterator<Item = String>) {
        let mut queue: VecDeque<String> = aliases.into_iter().collect();
        while let Some(alias) = queue.pop_front() {
            let Some(join) = self.get(&alias) else {
                continue;
            };
            let Some(join_type) = join.join_type else {
                continue;
            };
            let parent_outer = join
                .parent_alias
                .as_deref()
                .and_then(|p| self.join_type(p))
                == Some(JoinType::LeftOuter);
            let already_outer = join_type == JoinType::LeftOuter;
            if (join.nullable || parent_outer) && !already_outer {
                if let Some(entry) = self.entry_mut(&alias) {
                    entry.join.join_type = Some(JoinType::LeftOuter);
                }
                tracing::trace!(alias = %alias, "promoted to LEFT OUTER");
                for child in self.children_of(&alias) {
                    if !queue.contains(&child) {
                        queue.push_back(child);
                    }
                }
            }
        }
    }

    /// Demotes `LEFT OUTER` joins to `INNER`.
    ///
    /// A demoted join whose parent is `INNER` queues the parent as well.
    pub fn demote_joins(&mut self, aliases: impl IntoIterator<Item = String>) {
        let mut queue: VecDeque<String> = aliases.into_iter().collect();
        while let Some(alias) = queue.pop_front() {
            if self.join_type(&alias) != Some(JoinType::LeftOuter) {
                continue;
            }
            let parent = match self.entry_mut(&alias) {
                Some(entry) => {
                    entry.join.join_type = Some(JoinType::Inner);
                    entry.join.parent_alias.clone()
                }
                None => None,
            };
            tracing::trace!(alias = %alias, "demoted to INNER");
            if let Some(parent) = parent {
                if self.join_type(&parent) == Some(JoinType::Inner) {
                    queue.push_back(parent);
                }
            }
        }
    }

    fn children_of(&self, alias: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.join.parent_alias.as_deref() == Some(alias))
            .map(|e| self.name_of(e))
            .collect()
    }

    /// Turns an alias into a base table, keeping its name.
    pub(crate) fn set_base(&mut self, alias: &str) {
        if let Some(entry) = self.entry_mut(alias) {
            entry.join.parent_alias = None;
            entry.join.join_type = None;
            entry.join.join_cols.clear();
            entry.join.nullable = false;
        }
    }

    /// Renames aliases through `change_map`, including parent references.
    pub(crate) fn relabel(&mut self, change_map: &BTreeMap<String, String>) {
        let names = self.aliases();
        for (entry, name) in self.entries.iter_mut().zip(names) {
            if let Some(new) = change_map.get(&name) {
                entry.label = AliasLabel::Named(new.clone());
            }
            entry.join = entry.join.relabeled(change_map);
        }
    }

    /// Switches to `prefix` and renames every alias to `<prefix><position>`.
    /// Returns the old-to-new name map.
    pub(crate) fn renumber(&mut self, prefix: &str) -> BTreeMap<String, String> {
        let old = self.aliases();
        self.prefix = prefix.to_string();
        self.subq_prefixes.insert(prefix.to_string());
        let change_map: BTreeMap<String, String> = old
            .iter()
            .enumerate()
            .map(|(pos, alias)| (alias.clone(), format!("{prefix}{pos}")))
            .collect();
        for (pos, entry) in self.entries.iter_mut().enumerate() {
            entry.label = AliasLabel::Numbered(pos);
            entry.join = entry.join.relabeled(&change_map);
        }
        change_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fk_join(table: &str, parent: &str, col: &str, nullable: bool) -> Join {
        Join::new(
            table,
            parent,
            vec![(col.to_string(), "id".to_string())],
            format!("{parent}.{col}"),
            nullable,
        )
    }

    #[test]
    fn test_first_alias_is_table_name() {
        let mut map = AliasMap::new();
        let (alias, created) = map.table_alias("book", true);
        assert_eq!(alias, "book");
        assert!(created);
        assert_eq!(map.refcount("book"), 1);
    }

    #[test]
    fn test_second_alias_is_numbered() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let author = map.join(fk_join("author", "book", "author_id", false), None);
        let editor = map.join(fk_join("author", "book", "editor_id", true), None);
        assert_eq!(author, "author");
        assert_eq!(editor, "T3");
        assert_eq!(map.aliases_for_table("author"), vec!["author", "T3"]);
    }

    #[test]
    fn test_numbered_alias_lookup_is_exact() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        map.join(fk_join("author", "book", "author_id", false), None);
        map.join(fk_join("author", "book", "editor_id", true), None);
        assert!(map.contains("T3"));
        assert_eq!(map.refcount("T3"), 1);
        for near_miss in ["T03", "T+3", "T", "U3", "T30"] {
            assert!(!map.contains(near_miss), "{near_miss}");
        }
        map.ref_alias("T3");
        assert_eq!(map.refcount("T3"), 2);
        assert_eq!(map.refcount("author"), 1);
    }

    #[test]
    fn test_table_alias_without_create_reuses() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let (alias, created) = map.table_alias("book", false);
        assert_eq!(alias, "book");
        assert!(!created);
        assert_eq!(map.refcount("book"), 2);
    }

    #[test]
    fn test_join_reuse_respects_reuse_set() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let first = map.join(fk_join("author", "book", "author_id", false), None);
        let again = map.join(fk_join("author", "book", "author_id", false), None);
        assert_eq!(first, again);
        assert_eq!(map.refcount(&first), 2);

        let empty = BTreeSet::new();
        let fresh = map.join(fk_join("author", "book", "author_id", false), Some(&empty));
        assert_ne!(first, fresh);
    }

    #[test]
    fn test_base_tables_never_reused_by_join() {
        let base = Join::base("book");
        assert!(!base.equivalent(&base.clone()));
    }

    #[test]
    fn test_join_type_from_nullability() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let inner = map.join(fk_join("author", "book", "author_id", false), None);
        let outer = map.join(fk_join("publisher", "book", "publisher_id", true), None);
        assert_eq!(map.join_type(&inner), Some(JoinType::Inner));
        assert_eq!(map.join_type(&outer), Some(JoinType::LeftOuter));

        // Children of an outer join are outer as well.
        let country = map.join(fk_join("country", &outer, "country_id", false), None);
        assert_eq!(map.join_type(&country), Some(JoinType::LeftOuter));
    }

    #[test]
    fn test_promote_cascades_to_children() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let publisher = map.join(fk_join("publisher", "book", "publisher_id", true), None);
        let country = map.join(fk_join("country", &publisher, "country_id", false), None);
        map.demote_joins([publisher.clone(), country.clone()]);
        assert_eq!(map.join_type(&publisher), Some(JoinType::Inner));
        assert_eq!(map.join_type(&country), Some(JoinType::Inner));

        map.promote_joins([publisher.clone()]);
        assert_eq!(map.join_type(&publisher), Some(JoinType::LeftOuter));
        assert_eq!(map.join_type(&country), Some(JoinType::LeftOuter));
    }

    #[test]
    fn test_promote_skips_non_nullable() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let author = map.join(fk_join("author", "book", "author_id", false), None);
        map.promote_joins([author.clone(), "book".to_string()]);
        assert_eq!(map.join_type(&author), Some(JoinType::Inner));
        assert_eq!(map.join_type("book"), None);
    }

    #[test]
    fn test_unref_saturates() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        map.unref_alias("book", 5);
        assert_eq!(map.refcount("book"), 0);
        assert_eq!(map.count_active(), 0);
    }

    #[test]
    fn test_renumber() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        map.join(fk_join("author", "book", "author_id", false), None);
        let change = map.renumber("U");
        assert_eq!(change.get("book").map(String::as_str), Some("U0"));
        assert_eq!(change.get("author").map(String::as_str), Some("U1"));
        assert_eq!(map.aliases(), vec!["U0", "U1"]);
        assert_eq!(map.get("U1").unwrap().parent_alias.as_deref(), Some("U0"));
        assert!(map.subq_prefixes().contains("U"));
    }

    #[test]
    fn test_relabel_and_set_base() {
        let mut map = AliasMap::new();
        map.table_alias("book", true);
        let author = map.join(fk_join("author", "book", "author_id", false), None);
        map.set_base(&author);
        assert!(map.get("author").unwrap().is_base());

        let mut change = BTreeMap::new();
        change.insert("book".to_string(), "b".to_string());
        map.relabel(&change);
        assert_eq!(map.aliases(), vec!["b", "author"]);
    }
}
