//! INSERT, UPDATE and DELETE statement nodes.

use crate::expr::{Column, Expr, Table};
use keel_core::Value;

/// A single-row INSERT.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    pub table: Table,
    pub columns: Vec<Column>,
    pub values: Vec<Expr>,
    /// Columns to read back with `RETURNING`.
    pub returning: Vec<Column>,
}

impl Insert {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            columns: Vec::new(),
            values: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// Add one column/value pair.
    pub fn value(mut self, column: Column, value: impl Into<Expr>) -> Self {
        self.columns.push(column);
        self.values.push(value.into());
        self
    }

    pub fn returning(mut self, column: Column) -> Self {
        self.returning.push(column);
        self
    }
}

/// An UPDATE.
///
/// With `where_clause` undefined the statement is pinned to the primary key
/// given in `key`; with neither it addresses the whole table.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    pub table: Table,
    pub set: Vec<(Column, Expr)>,
    pub where_clause: Expr,
    pub key: Vec<(Column, Value)>,
}

impl Update {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            set: Vec::new(),
            where_clause: Expr::Undef,
            key: Vec::new(),
        }
    }

    pub fn set(mut self, column: Column, value: impl Into<Expr>) -> Self {
        self.set.push((column, value.into()));
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        let existing = std::mem::replace(&mut self.where_clause, Expr::Undef);
        self.where_clause = existing.and(expr);
        self
    }

    /// Pin the statement to one primary-key column value.
    pub fn by_key(mut self, column: Column, value: impl Into<Value>) -> Self {
        self.key.push((column, value.into()));
        self
    }
}

/// A DELETE, with the same WHERE defaulting rules as [`Update`].
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    pub table: Table,
    pub where_clause: Expr,
    pub key: Vec<(Column, Value)>,
}

impl Delete {
    pub fn new(table: Table) -> Self {
        Self {
            table,
            where_clause: Expr::Undef,
            key: Vec::new(),
        }
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        let existing = std::mem::replace(&mut self.where_clause, Expr::Undef);
        self.where_clause = existing.and(expr);
        self
    }

    pub fn by_key(mut self, column: Column, value: impl Into<Value>) -> Self {
        self.key.push((column, value.into()));
        self
    }
}

/// Equality over `key`, or `Undef` when there is none.
pub(crate) fn key_predicate(key: &[(Column, Value)]) -> Expr {
    let mut terms: Vec<Expr> = key
        .iter()
        .map(|(col, value)| col.clone().eq(Expr::Param(value.clone())))
        .collect();
    match terms.len() {
        0 => Expr::Undef,
        1 => terms.remove(0),
        _ => Expr::And(terms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::SqlType;

    #[test]
    fn test_insert_pairs_columns_and_values() {
        let t = Table::new("person");
        let ins = Insert::new(t.clone())
            .value(t.column("name"), "Ada")
            .returning(t.typed("id", SqlType::Int));
        assert_eq!(ins.columns.len(), ins.values.len());
        assert_eq!(ins.returning[0].name, "id");
    }

    #[test]
    fn test_key_predicate_shapes() {
        let t = Table::new("person");
        assert!(key_predicate(&[]).is_undef());
        let one = key_predicate(&[(t.column("id"), Value::Int(1))]);
        assert!(matches!(one, Expr::Compare { .. }));
        let two = key_predicate(&[
            (t.column("a"), Value::Int(1)),
            (t.column("b"), Value::Int(2)),
        ]);
        assert!(matches!(two, Expr::And(ref v) if v.len() == 2));
    }

    #[test]
    fn test_update_filter_overrides_nothing() {
        let t = Table::new("person");
        let upd = Update::new(t.clone())
            .set(t.column("name"), "x")
            .by_key(t.column("id"), 3i64);
        assert!(upd.where_clause.is_undef());
        assert_eq!(upd.key.len(), 1);
        let del = Delete::new(t.clone()).filter(t.column("id").gt(3));
        assert!(!del.where_clause.is_undef());
    }
}
