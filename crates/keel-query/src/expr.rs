//! Dialect-independent expression tree.
//!
//! [`Expr`] is a closed sum type over every node the compiler understands.
//! Nodes are plain values: composing two nodes consumes or clones them and
//! yields a new node; nothing is ever mutated in place.

use crate::join::Join;
use crate::select::Select;
use crate::statement::{Delete, Insert, Update};
use keel_core::{SqlType, Value};
use std::ops;

/// A named relation, optionally aliased.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Table {
    pub name: String,
    pub alias: Option<String>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name used to qualify columns: the alias when present.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }

    /// Untyped column of this table.
    pub fn column(&self, name: impl Into<String>) -> Column {
        Column {
            table: Some(self.clone()),
            name: name.into(),
            ty: None,
        }
    }

    /// Typed column of this table. Parameters compared against it are
    /// coerced to `ty`.
    pub fn typed(&self, name: impl Into<String>, ty: SqlType) -> Column {
        self.column(name).with_type(ty)
    }
}

/// A column reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Column {
    pub table: Option<Table>,
    pub name: String,
    pub ty: Option<SqlType>,
}

impl Column {
    /// A column with no table qualifier.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            table: None,
            name: name.into(),
            ty: None,
        }
    }

    pub fn with_type(mut self, ty: SqlType) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn expr(self) -> Expr {
        Expr::Column(self)
    }
}

macro_rules! column_delegates {
    ($($name:ident($($arg:ident: $ty:ty),*)),* $(,)?) => {
        impl Column {
            $(
                pub fn $name(self $(, $arg: $ty)*) -> Expr {
                    Expr::Column(self).$name($($arg),*)
                }
            )*
        }
    };
}

column_delegates!(
    eq(other: impl Into<Expr>),
    ne(other: impl Into<Expr>),
    lt(other: impl Into<Expr>),
    le(other: impl Into<Expr>),
    gt(other: impl Into<Expr>),
    ge(other: impl Into<Expr>),
    is_null(),
    is_not_null(),
    in_list(values: Vec<Expr>),
    like(pattern: impl Into<Expr>),
    ilike(pattern: impl Into<Expr>),
    asc(),
    desc(),
    cast(ty: SqlType),
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl ArithOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
        }
    }

    pub(crate) const fn precedence(self) -> u8 {
        match self {
            ArithOp::Add | ArithOp::Sub => 5,
            ArithOp::Mul | ArithOp::Div | ArithOp::Mod => 6,
        }
    }
}

/// An expression or statement node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(Column),
    Table(Table),
    /// Bound parameter
    Param(Value),
    /// Boolean literal rendered with the dialect's spelling
    Bool(bool),
    /// SQL `NULL` literal
    Null,
    /// Absent clause or value
    Undef,
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Vec<Expr>),
    Or(Vec<Expr>),
    Not(Box<Expr>),
    IsNull(Box<Expr>),
    IsNotNull(Box<Expr>),
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        case_insensitive: bool,
    },
    Func {
        name: String,
        args: Vec<Expr>,
    },
    /// `COUNT(*)`
    CountAll,
    Asc(Box<Expr>),
    Desc(Box<Expr>),
    Cast {
        expr: Box<Expr>,
        ty: SqlType,
    },
    Join(Box<Join>),
    Select(Box<Select>),
    Insert(Box<Insert>),
    Update(Box<Update>),
    Delete(Box<Delete>),
}

impl Expr {
    /// Bound parameter.
    pub fn param(value: impl Into<Value>) -> Self {
        Expr::Param(value.into())
    }

    /// Conjunction of every expression in `exprs`.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Self {
        Expr::And(exprs.into_iter().collect())
    }

    /// Disjunction of every expression in `exprs`.
    pub fn any(exprs: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Or(exprs.into_iter().collect())
    }

    pub fn func(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Func {
            name: name.into(),
            args,
        }
    }

    pub fn is_undef(&self) -> bool {
        matches!(self, Expr::Undef)
    }

    fn compare(self, op: CompareOp, other: Expr) -> Self {
        Expr::Compare {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// Equality. Comparing with NULL yields `IS NULL`.
    pub fn eq(self, other: impl Into<Expr>) -> Self {
        match other.into() {
            Expr::Null | Expr::Param(Value::Null) => Expr::IsNull(Box::new(self)),
            other => self.compare(CompareOp::Eq, other),
        }
    }

    /// Inequality. Comparing with NULL yields `IS NOT NULL`.
    pub fn ne(self, other: impl Into<Expr>) -> Self {
        match other.into() {
            Expr::Null | Expr::Param(Value::Null) => Expr::IsNotNull(Box::new(self)),
            other => self.compare(CompareOp::Ne, other),
        }
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Lt, other.into())
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Le, other.into())
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Gt, other.into())
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.compare(CompareOp::Ge, other.into())
    }

    /// Logical AND, flattening nested conjunctions.
    pub fn and(self, other: impl Into<Expr>) -> Self {
        let other = other.into();
        match (self, other) {
            (Expr::Undef, e) | (e, Expr::Undef) => e,
            (Expr::And(mut a), Expr::And(b)) => {
                a.extend(b);
                Expr::And(a)
            }
            (Expr::And(mut a), e) => {
                a.push(e);
                Expr::And(a)
            }
            (e, Expr::And(mut b)) => {
                b.insert(0, e);
                Expr::And(b)
            }
            (a, b) => Expr::And(vec![a, b]),
        }
    }

    /// Logical OR, flattening nested disjunctions.
    pub fn or(self, other: impl Into<Expr>) -> Self {
        let other = other.into();
        match (self, other) {
            (Expr::Undef, e) | (e, Expr::Undef) => e,
            (Expr::Or(mut a), Expr::Or(b)) => {
                a.extend(b);
                Expr::Or(a)
            }
            (Expr::Or(mut a), e) => {
                a.push(e);
                Expr::Or(a)
            }
            (e, Expr::Or(mut b)) => {
                b.insert(0, e);
                Expr::Or(b)
            }
            (a, b) => Expr::Or(vec![a, b]),
        }
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull(Box::new(self))
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNotNull(Box::new(self))
    }

    pub fn in_list(self, values: Vec<Expr>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values,
        }
    }

    pub fn like(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            case_insensitive: false,
        }
    }

    /// Case-insensitive LIKE; only dialects with `ILIKE` can render it.
    pub fn ilike(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            case_insensitive: true,
        }
    }

    pub fn asc(self) -> Self {
        Expr::Asc(Box::new(self))
    }

    pub fn desc(self) -> Self {
        Expr::Desc(Box::new(self))
    }

    pub fn cast(self, ty: SqlType) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            ty,
        }
    }

    pub fn count(self) -> Self {
        Expr::func("COUNT", vec![self])
    }

    pub fn max(self) -> Self {
        Expr::func("MAX", vec![self])
    }

    pub fn min(self) -> Self {
        Expr::func("MIN", vec![self])
    }

    pub fn avg(self) -> Self {
        Expr::func("AVG", vec![self])
    }

    pub fn sum(self) -> Self {
        Expr::func("SUM", vec![self])
    }

    fn arith(self, op: ArithOp, other: Expr) -> Self {
        Expr::Arith {
            op,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// Short name of the node kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Expr::Column(_) => "Column",
            Expr::Table(_) => "Table",
            Expr::Param(_) => "Param",
            Expr::Bool(_) => "Bool",
            Expr::Null => "Null",
            Expr::Undef => "Undef",
            Expr::Compare { .. } => "Compare",
            Expr::Arith { .. } => "Arith",
            Expr::And(_) => "And",
            Expr::Or(_) => "Or",
            Expr::Not(_) => "Not",
            Expr::IsNull(_) => "IsNull",
            Expr::IsNotNull(_) => "IsNotNull",
            Expr::In { .. } => "In",
            Expr::Like { .. } => "Like",
            Expr::Func { .. } => "Func",
            Expr::CountAll => "CountAll",
            Expr::Asc(_) => "Asc",
            Expr::Desc(_) => "Desc",
            Expr::Cast { .. } => "Cast",
            Expr::Join(_) => "Join",
            Expr::Select(_) => "Select",
            Expr::Insert(_) => "Insert",
            Expr::Update(_) => "Update",
            Expr::Delete(_) => "Delete",
        }
    }
}

impl ops::BitAnd for Expr {
    type Output = Expr;

    fn bitand(self, rhs: Expr) -> Expr {
        self.and(rhs)
    }
}

impl ops::BitOr for Expr {
    type Output = Expr;

    fn bitor(self, rhs: Expr) -> Expr {
        self.or(rhs)
    }
}

impl ops::Not for Expr {
    type Output = Expr;

    fn not(self) -> Expr {
        Expr::Not(Box::new(self))
    }
}

macro_rules! arith_ops {
    ($($trait:ident, $method:ident, $op:ident;)*) => {
        $(
            impl<T: Into<Expr>> ops::$trait<T> for Expr {
                type Output = Expr;

                fn $method(self, rhs: T) -> Expr {
                    self.arith(ArithOp::$op, rhs.into())
                }
            }

            impl<T: Into<Expr>> ops::$trait<T> for Column {
                type Output = Expr;

                fn $method(self, rhs: T) -> Expr {
                    Expr::Column(self).arith(ArithOp::$op, rhs.into())
                }
            }
        )*
    };
}

arith_ops! {
    Add, add, Add;
    Sub, sub, Sub;
    Mul, mul, Mul;
    Div, div, Div;
    Rem, rem, Mod;
}

impl From<Column> for Expr {
    fn from(c: Column) -> Self {
        Expr::Column(c)
    }
}

impl From<Table> for Expr {
    fn from(t: Table) -> Self {
        Expr::Table(t)
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Param(v)
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Bool(b)
    }
}

macro_rules! param_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Expr {
                fn from(v: $ty) -> Self {
                    Expr::Param(Value::from(v))
                }
            }
        )*
    };
}

param_from!(i32, i64, f64, &str, String);

impl From<Select> for Expr {
    fn from(s: Select) -> Self {
        Expr::Select(Box::new(s))
    }
}

impl From<Insert> for Expr {
    fn from(s: Insert) -> Self {
        Expr::Insert(Box::new(s))
    }
}

impl From<Update> for Expr {
    fn from(s: Update) -> Self {
        Expr::Update(Box::new(s))
    }
}

impl From<Delete> for Expr {
    fn from(s: Delete) -> Self {
        Expr::Delete(Box::new(s))
    }
}

impl From<Join> for Expr {
    fn from(j: Join) -> Self {
        Expr::Join(Box::new(j))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person() -> Table {
        Table::new("person")
    }

    #[test]
    fn test_composition_leaves_operands_untouched() {
        let a = person().column("a").eq(1);
        let b = person().column("b").eq(2);
        let both = a.clone() & b.clone();
        assert_eq!(both, Expr::And(vec![a.clone(), b.clone()]));
        assert!(matches!(a, Expr::Compare { op: CompareOp::Eq, .. }));
    }

    #[test]
    fn test_and_or_flatten() {
        let c = |n: &str| person().column(n).is_null();
        let e = c("a").and(c("b")).and(c("c"));
        match e {
            Expr::And(items) => assert_eq!(items.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
        let e = c("a") | (c("b") | c("c"));
        match e {
            Expr::Or(items) => assert_eq!(items.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_and_with_undef_is_identity() {
        let e = person().column("a").eq(1);
        assert_eq!(Expr::Undef.and(e.clone()), e);
        assert_eq!(e.clone().or(Expr::Undef), e);
    }

    #[test]
    fn test_eq_null_becomes_is_null() {
        let col = person().column("parent_id");
        assert!(matches!(col.clone().eq(Value::Null), Expr::IsNull(_)));
        assert!(matches!(col.ne(Expr::Null), Expr::IsNotNull(_)));
    }

    #[test]
    fn test_operator_overloads() {
        let age = person().typed("age", SqlType::Int);
        let e = age.clone() + 1;
        assert!(matches!(e, Expr::Arith { op: ArithOp::Add, .. }));
        let e = Expr::from(age) % 2;
        assert!(matches!(e, Expr::Arith { op: ArithOp::Mod, .. }));
        let e = !Expr::Bool(true);
        assert_eq!(e, Expr::Not(Box::new(Expr::Bool(true))));
    }

    #[test]
    fn test_table_reference_prefers_alias() {
        let t = person().alias("p");
        assert_eq!(t.reference(), "p");
        assert_eq!(person().reference(), "person");
        assert_eq!(t.column("id").table.unwrap().alias.as_deref(), Some("p"));
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(Expr::CountAll.kind(), "CountAll");
        assert_eq!(person().column("a").ilike("x%").kind(), "Like");
    }
}
