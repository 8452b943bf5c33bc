//! JOIN clause types.

use crate::expr::{Expr, Table};

/// A join between a left relation (table or nested join) and a table.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub kind: JoinKind,
    pub left: Expr,
    pub right: Table,
    /// ON condition; `None` renders no ON clause.
    pub on: Option<Expr>,
}

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

impl JoinKind {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinKind::Inner => "JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Full => "FULL JOIN",
        }
    }
}

impl Join {
    fn new(kind: JoinKind, left: impl Into<Expr>, right: Table, on: Expr) -> Self {
        Self {
            kind,
            left: left.into(),
            right,
            on: Some(on),
        }
    }

    pub fn inner(left: impl Into<Expr>, right: Table, on: Expr) -> Self {
        Self::new(JoinKind::Inner, left, right, on)
    }

    pub fn left(left: impl Into<Expr>, right: Table, on: Expr) -> Self {
        Self::new(JoinKind::Left, left, right, on)
    }

    pub fn right(left: impl Into<Expr>, right: Table, on: Expr) -> Self {
        Self::new(JoinKind::Right, left, right, on)
    }

    /// FULL OUTER JOIN; not every dialect can render it.
    pub fn full(left: impl Into<Expr>, right: Table, on: Expr) -> Self {
        Self::new(JoinKind::Full, left, right, on)
    }

    /// Tables reachable from this join, leftmost first.
    pub fn tables(&self) -> Vec<&Table> {
        let mut out = match &self.left {
            Expr::Table(t) => vec![t],
            Expr::Join(j) => j.tables(),
            _ => Vec::new(),
        };
        out.push(&self.right);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_kind_keywords() {
        assert_eq!(JoinKind::Inner.as_str(), "JOIN");
        assert_eq!(JoinKind::Full.as_str(), "FULL JOIN");
    }

    #[test]
    fn test_nested_join_tables() {
        let a = Table::new("a");
        let b = Table::new("b");
        let c = Table::new("c").alias("cc");
        let ab = Join::inner(a.clone(), b.clone(), a.column("id").eq(b.column("a_id")));
        let abc = Join::left(ab, c.clone(), b.column("id").eq(c.column("b_id")));
        let names: Vec<_> = abc.tables().iter().map(|t| t.reference()).collect();
        assert_eq!(names, vec!["a", "b", "cc"]);
    }
}
