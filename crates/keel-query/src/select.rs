//! SELECT statement node.

use crate::expr::{Expr, Table};
use crate::join::Join;

/// A SELECT statement.
///
/// When `from` is empty the compiler derives it from the tables of the
/// columns referenced anywhere in the statement, in order of appearance.
#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub columns: Vec<Expr>,
    /// Tables and joins
    pub from: Vec<Expr>,
    pub where_clause: Expr,
    pub group_by: Vec<Expr>,
    pub having: Expr,
    pub order_by: Vec<Expr>,
    pub distinct: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl Select {
    /// Create a SELECT of the given columns.
    pub fn new(columns: impl IntoIterator<Item = Expr>) -> Self {
        Self {
            columns: columns.into_iter().collect(),
            from: Vec::new(),
            where_clause: Expr::Undef,
            group_by: Vec::new(),
            having: Expr::Undef,
            order_by: Vec::new(),
            distinct: false,
            limit: None,
            offset: None,
        }
    }

    pub fn from(mut self, table: Table) -> Self {
        self.from.push(Expr::Table(table));
        self
    }

    pub fn join(mut self, join: Join) -> Self {
        self.from.push(Expr::Join(Box::new(join)));
        self
    }

    /// Add a WHERE condition, AND-ed with any existing one.
    pub fn filter(mut self, expr: Expr) -> Self {
        let existing = std::mem::replace(&mut self.where_clause, Expr::Undef);
        self.where_clause = existing.and(expr);
        self
    }

    pub fn group_by(mut self, expr: impl Into<Expr>) -> Self {
        self.group_by.push(expr.into());
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        let existing = std::mem::replace(&mut self.having, Expr::Undef);
        self.having = existing.and(expr);
        self
    }

    /// Add an ORDER BY term; bare expressions sort ascending.
    pub fn order_by(mut self, expr: impl Into<Expr>) -> Self {
        self.order_by.push(expr.into());
        self
    }

    pub fn distinct(mut self, distinct: bool) -> Self {
        self.distinct = distinct;
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filters_are_conjoined() {
        let t = Table::new("person");
        let s = Select::new([t.column("id").expr()])
            .filter(t.column("a").eq(1))
            .filter(t.column("b").eq(2));
        match s.where_clause {
            Expr::And(items) => assert_eq!(items.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_builder_sets_clauses() {
        let t = Table::new("person");
        let s = Select::new([Expr::CountAll])
            .from(t.clone())
            .group_by(t.column("name"))
            .having(Expr::CountAll.gt(1))
            .order_by(t.column("name").desc())
            .distinct(true)
            .limit(10)
            .offset(5);
        assert_eq!(s.from, vec![Expr::Table(t)]);
        assert_eq!(s.group_by.len(), 1);
        assert!(!s.having.is_undef());
        assert!(s.distinct);
        assert_eq!((s.limit, s.offset), (Some(10), Some(5)));
    }
}
