//! Expressions: column references, aggregates, functions, and arithmetic.
//!
//! User code builds expressions with named references ([`Expression::F`]);
//! the query resolves those into [`Col`]s bound to a table alias before
//! compilation. Everything that holds a `Col` can be relabeled when the
//! owning query renames its aliases.

use std::collections::BTreeMap;
use std::ops;

use crate::fields::{FieldDef, FieldType};
use crate::query::query::Query;
use crate::value::Value;

/// A column of a joined table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Col {
    /// The table alias.
    pub alias: String,
    /// The field whose column is referenced.
    pub target: FieldDef,
}

impl Col {
    /// Creates a column reference.
    pub fn new(alias: impl Into<String>, target: FieldDef) -> Self {
        Self {
            alias: alias.into(),
            target,
        }
    }

    /// The column name.
    pub fn column(&self) -> &str {
        &self.target.column
    }

    /// Returns a copy with the alias renamed through `change_map`.
    #[must_use]
    pub fn relabeled(&self, change_map: &BTreeMap<String, String>) -> Self {
        match change_map.get(&self.alias) {
            Some(alias) => Self::new(alias.clone(), self.target.clone()),
            None => self.clone(),
        }
    }
}

/// SQL aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateFunc {
    /// `COUNT`
    Count,
    /// `SUM`
    Sum,
    /// `AVG`
    Avg,
    /// `MIN`
    Min,
    /// `MAX`
    Max,
    /// Population standard deviation.
    StdDev,
    /// Population variance.
    Variance,
}

impl AggregateFunc {
    /// The SQL function name.
    pub const fn sql_name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
            Self::StdDev => "STDDEV_POP",
            Self::Variance => "VAR_POP",
        }
    }
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
}

impl ArithOp {
    /// The SQL operator.
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
        }
    }
}

/// An SQL expression.
#[derive(Debug, Clone)]
pub enum Expression {
    /// A named reference to a field or annotation (`F("price")`), resolved
    /// against the query before compilation.
    F(String),
    /// A resolved column.
    Col(Col),
    /// A reference to a selected alias (an annotation or an inner-query column).
    Ref(String),
    /// A literal bound as a parameter.
    Value(Value),
    /// `*`
    Star,
    /// An aggregate call.
    Aggregate {
        /// The aggregate function.
        func: AggregateFunc,
        /// The aggregated expression.
        expr: Box<Expression>,
        /// Whether `DISTINCT` is applied to the argument.
        distinct: bool,
    },
    /// A plain SQL function call such as `COALESCE(a, b)`.
    Func {
        /// The SQL function name.
        name: String,
        /// The arguments.
        args: Vec<Expression>,
        /// The output type, when known.
        output: Option<FieldType>,
    },
    /// A registered transform applied to an expression.
    Transform {
        /// The transform name.
        name: String,
        /// The transformed expression.
        lhs: Box<Expression>,
    },
    /// Binary arithmetic.
    Arithmetic {
        /// The operator.
        op: ArithOp,
        /// Left operand.
        lhs: Box<Expression>,
        /// Right operand.
        rhs: Box<Expression>,
    },
    /// Raw SQL with its own parameters.
    RawSql {
        /// The SQL fragment, with `%s` for each parameter.
        sql: String,
        /// Parameters bound in order.
        params: Vec<Value>,
    },
    /// A scalar subquery.
    Subquery(Box<Query>),
}

impl Expression {
    /// `F(name)`
    pub fn f(name: impl Into<String>) -> Self {
        Self::F(name.into())
    }

    /// A literal value.
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    /// Raw SQL.
    pub fn raw(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::RawSql {
            sql: sql.into(),
            params,
        }
    }

    /// A function call.
    pub fn func(name: impl Into<String>, args: Vec<Self>) -> Self {
        Self::Func {
            name: name.into(),
            args,
            output: None,
        }
    }

    fn aggregate(func: AggregateFunc, expr: Self) -> Self {
        Self::Aggregate {
            func,
            expr: Box::new(expr),
            distinct: false,
        }
    }

    /// `COUNT(expr)`
    pub fn count(expr: Self) -> Self {
        Self::aggregate(AggregateFunc::Count, expr)
    }

    /// `COUNT(*)`
    pub fn count_all() -> Self {
        Self::aggregate(AggregateFunc::Count, Self::Star)
    }

    /// `SUM(expr)`
    pub fn sum(expr: Self) -> Self {
        Self::aggregate(AggregateFunc::Sum, expr)
    }

    /// `AVG(expr)`
    pub fn avg(expr: Self) -> Self {
        Self::aggregate(AggregateFunc::Avg, expr)
    }

    /// `MIN(expr)`
    pub fn min(expr: Self) -> Self {
        Self::aggregate(AggregateFunc::Min, expr)
    }

    /// `MAX(expr)`
    pub fn max(expr: Self) -> Self {
        Self::aggregate(AggregateFunc::Max, expr)
    }

    /// Applies `DISTINCT` to an aggregate's argument. No-op on other
    /// expressions.
    #[must_use]
    pub fn distinct(mut self) -> Self {
        if let Self::Aggregate { distinct, .. } = &mut self {
            *distinct = true;
        }
        self
    }

    /// Returns `true` if an aggregate appears anywhere in the tree.
    pub fn contains_aggregate(&self) -> bool {
        match self {
            Self::Aggregate { .. } => true,
            Self::Func { args, .. } => args.iter().any(Self::contains_aggregate),
            Self::Transform { lhs, .. } => lhs.contains_aggregate(),
            Self::Arithmetic { lhs, rhs, .. } => lhs.contains_aggregate() || rhs.contains_aggregate(),
            Self::F(_)
            | Self::Col(_)
            | Self::Ref(_)
            | Self::Value(_)
            | Self::Star
            | Self::RawSql { .. }
            | Self::Subquery(_) => false,
        }
    }

    /// Returns a copy with every column alias renamed through `change_map`.
    #[must_use]
    pub fn relabeled(&self, change_map: &BTreeMap<String, String>) -> Self {
        match self {
            Self::Col(col) => Self::Col(col.relabeled(change_map)),
            Self::Aggregate {
                func,
                expr,
                distinct,
            } => Self::Aggregate {
                func: *func,
                expr: Box::new(expr.relabeled(change_map)),
                distinct: *distinct,
            },
            Self::Func { name, args, output } => Self::Func {
                name: name.clone(),
                args: args.iter().map(|a| a.relabeled(change_map)).collect(),
                output: output.clone(),
            },
            Self::Transform { name, lhs } => Self::Transform {
                name: name.clone(),
                lhs: Box::new(lhs.relabeled(change_map)),
            },
            Self::Arithmetic { op, lhs, rhs } => Self::Arithmetic {
                op: *op,
                lhs: Box::new(lhs.relabeled(change_map)),
                rhs: Box::new(rhs.relabeled(change_map)),
            },
            Self::Subquery(query) => {
                let mut query = query.clone();
                query.relabel_external(change_map);
                Self::Subquery(query)
            }
            Self::F(_) | Self::Ref(_) | Self::Value(_) | Self::Star | Self::RawSql { .. } => {
                self.clone()
            }
        }
    }

    /// The non-aggregate columns this expression needs in a GROUP BY.
    pub fn group_by_cols(&self) -> Vec<Self> {
        match self {
            Self::Col(_) | Self::Ref(_) => vec![self.clone()],
            Self::Func { args, .. } => args.iter().flat_map(Self::group_by_cols).collect(),
            Self::Transform { lhs, .. } => lhs.group_by_cols(),
            Self::Arithmetic { lhs, rhs, .. } => {
                let mut cols = lhs.group_by_cols();
                cols.extend(rhs.group_by_cols());
                cols
            }
            Self::Aggregate { .. }
            | Self::F(_)
            | Self::Value(_)
            | Self::Star
            | Self::RawSql { .. }
            | Self::Subquery(_) => Vec::new(),
        }
    }

    /// Every column referenced by the expression.
    pub fn cols(&self) -> Vec<&Col> {
        match self {
            Self::Col(col) => vec![col],
            Self::Aggregate { expr, .. } => expr.cols(),
            Self::Func { args, .. } => args.iter().flat_map(Self::cols).collect(),
            Self::Transform { lhs, .. } => lhs.cols(),
            Self::Arithmetic { lhs, rhs, .. } => {
                let mut cols = lhs.cols();
                cols.extend(rhs.cols());
                cols
            }
            Self::F(_)
            | Self::Ref(_)
            | Self::Value(_)
            | Self::Star
            | Self::RawSql { .. }
            | Self::Subquery(_) => Vec::new(),
        }
    }

    /// The field type of the expression's result, when it can be inferred
    /// without the lookup registry.
    pub fn output_type(&self) -> Option<FieldType> {
        match self {
            Self::Col(col) => Some(col.target.field_type.clone()),
            Self::Aggregate { func, expr, .. } => match func {
                AggregateFunc::Count => Some(FieldType::BigIntegerField),
                AggregateFunc::Avg | AggregateFunc::StdDev | AggregateFunc::Variance => {
                    Some(FieldType::FloatField)
                }
                AggregateFunc::Sum | AggregateFunc::Min | AggregateFunc::Max => expr.output_type(),
            },
            Self::Func { output, .. } => output.clone(),
            Self::Arithmetic { lhs, rhs, .. } => lhs.output_type().or_else(|| rhs.output_type()),
            Self::F(_)
            | Self::Ref(_)
            | Self::Value(_)
            | Self::Star
            | Self::Transform { .. }
            | Self::RawSql { .. }
            | Self::Subquery(_) => None,
        }
    }

    /// A short description for error messages.
    pub fn describe(&self) -> String {
        match self {
            Self::F(name) => format!("F({name})"),
            Self::Col(col) => format!("{}.{}", col.alias, col.column()),
            Self::Ref(name) => name.clone(),
            Self::Value(v) => v.to_string(),
            Self::Star => "*".to_string(),
            Self::Aggregate { func, expr, .. } => {
                format!("{}({})", func.sql_name(), expr.describe())
            }
            Self::Func { name, .. } => format!("{name}(...)"),
            Self::Transform { name, lhs } => format!("{}__{name}", lhs.describe()),
            Self::Arithmetic { op, lhs, rhs } => {
                format!("{} {} {}", lhs.describe(), op.sql(), rhs.describe())
            }
            Self::RawSql { sql, .. } => sql.clone(),
            Self::Subquery(_) => "Subquery(...)".to_string(),
        }
    }
}

macro_rules! arith_impl {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait for Expression {
            type Output = Self;

            fn $method(self, rhs: Self) -> Self::Output {
                Self::Arithmetic {
                    op: $op,
                    lhs: Box::new(self),
                    rhs: Box::new(rhs),
                }
            }
        }
    };
}

arith_impl!(Add, add, ArithOp::Add);
arith_impl!(Sub, sub, ArithOp::Sub);
arith_impl!(Mul, mul, ArithOp::Mul);
arith_impl!(Div, div, ArithOp::Div);

/// An ORDER BY item.
#[derive(Debug, Clone)]
pub enum OrderBy {
    /// A field name, annotation name, `table.column`, or `?` for random
    /// order; a leading `-` sorts descending.
    Name(String),
    /// An expression with an explicit direction.
    Expression {
        /// The ordered expression.
        expr: Expression,
        /// Sort descending.
        descending: bool,
    },
}

impl OrderBy {
    /// Ascending order by an expression.
    pub const fn asc(expr: Expression) -> Self {
        Self::Expression {
            expr,
            descending: false,
        }
    }

    /// Descending order by an expression.
    pub const fn desc(expr: Expression) -> Self {
        Self::Expression {
            expr,
            descending: true,
        }
    }
}

impl From<&str> for OrderBy {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<String> for OrderBy {
    fn from(name: String) -> Self {
        Self::Name(name)
    }
}

/// A named expression attached to a query.
#[derive(Debug, Clone)]
pub struct Annotation {
    /// The resolved expression.
    pub expr: Expression,
    /// Set for aggregates requested by `aggregate()` rather than `annotate()`:
    /// they summarize the whole result instead of each row.
    pub is_summary: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(alias: &str, name: &str) -> Expression {
        Expression::Col(Col::new(alias, FieldDef::new(name, FieldType::IntegerField)))
    }

    #[test]
    fn test_contains_aggregate() {
        assert!(Expression::count_all().contains_aggregate());
        assert!((Expression::sum(col("b", "x")) + Expression::value(1)).contains_aggregate());
        assert!(!col("b", "x").contains_aggregate());
        assert!(!Expression::func("COALESCE", vec![col("b", "x")]).contains_aggregate());
    }

    #[test]
    fn test_relabeled() {
        let mut map = BTreeMap::new();
        map.insert("book".to_string(), "U0".to_string());
        let expr = Expression::max(col("book", "pages")) * col("author", "age");
        let relabeled = expr.relabeled(&map);
        let aliases: Vec<_> = relabeled.cols().iter().map(|c| c.alias.clone()).collect();
        assert_eq!(aliases, vec!["U0", "author"]);
    }

    #[test]
    fn test_group_by_cols_skip_aggregates() {
        let expr = Expression::sum(col("b", "x")) + col("b", "y");
        let cols = expr.group_by_cols();
        assert_eq!(cols.len(), 1);
        assert!(matches!(&cols[0], Expression::Col(c) if c.column() == "y"));
    }

    #[test]
    fn test_output_types() {
        assert_eq!(
            Expression::count(col("b", "x")).output_type(),
            Some(FieldType::BigIntegerField)
        );
        assert_eq!(
            Expression::avg(col("b", "x")).output_type(),
            Some(FieldType::FloatField)
        );
        assert_eq!(
            Expression::max(col("b", "x")).output_type(),
            Some(FieldType::IntegerField)
        );
        assert_eq!(Expression::value(1).output_type(), None);
    }

    #[test]
    fn test_distinct_only_on_aggregates() {
        assert!(matches!(
            Expression::count(Expression::f("id")).distinct(),
            Expression::Aggregate { distinct: true, .. }
        ));
        assert!(matches!(Expression::f("id").distinct(), Expression::F(_)));
    }

    #[test]
    fn test_order_by_from_str() {
        assert!(matches!(OrderBy::from("-title"), OrderBy::Name(ref n) if n == "-title"));
    }
}
