//! Lazy, chainable queries over one entity or a tuple of entities.

use crate::arena::ObjectId;
use crate::matcher;
use crate::object::Lifecycle;
use crate::store::{Store, column_of};
use keel_core::{Connection, EntitySchema, Error, Result, SqlType, Value, Variable};
use keel_query::{Column, Delete, Expr, Select, Table, Update};
use std::sync::Arc;

/// A query over one entity that runs when a terminal method is called.
///
/// Every terminal method flushes first when autoflush is on.
pub struct ResultSet<'a, C: Connection> {
    store: &'a mut Store<C>,
    schema: Arc<EntitySchema>,
    table: Table,
    /// FROM items given through [`Store::using`]; empty for the entity's
    /// own table.
    tables: Vec<Expr>,
    predicate: Expr,
    order_by: Vec<Expr>,
    distinct: bool,
    offset: Option<u64>,
    limit: Option<u64>,
}

impl<'a, C: Connection> ResultSet<'a, C> {
    pub(crate) fn new(store: &'a mut Store<C>, schema: Arc<EntitySchema>, predicate: Expr) -> Self {
        let table = Table::new(schema.table.clone());
        Self {
            store,
            schema,
            table,
            tables: Vec::new(),
            predicate,
            order_by: Vec::new(),
            distinct: false,
            offset: None,
            limit: None,
        }
    }

    pub(crate) fn using(mut self, tables: Vec<Expr>) -> Self {
        self.tables = tables;
        self
    }

    fn reject_custom_tables(&self, operation: &str) -> Result<()> {
        if !self.tables.is_empty() {
            return Err(Error::Feature(format!(
                "{} is not supported on a find with custom tables",
                operation
            )));
        }
        Ok(())
    }

    /// AND another condition onto the predicate.
    pub fn filter(mut self, expr: Expr) -> Self {
        let existing = std::mem::replace(&mut self.predicate, Expr::Undef);
        self.predicate = existing.and(expr);
        self
    }

    /// Replace the ordering. Not allowed once the set is sliced.
    pub fn order_by(mut self, terms: impl IntoIterator<Item = Expr>) -> Result<Self> {
        if self.is_sliced() {
            return Err(Error::Feature(
                "cannot reorder a result set after slicing it".to_string(),
            ));
        }
        self.order_by = terms.into_iter().collect();
        Ok(self)
    }

    pub fn config(mut self, distinct: bool, offset: Option<u64>, limit: Option<u64>) -> Self {
        self.distinct = distinct;
        self.offset = offset;
        self.limit = limit;
        self
    }

    /// Restrict to rows `start..end` of the current window.
    pub fn slice(mut self, start: u64, end: Option<u64>) -> Self {
        let base = self.offset.unwrap_or(0);
        let offset = base + start;
        let mut limit = end.map(|end| end.saturating_sub(start));
        if let Some(previous) = self.limit {
            let remaining = previous.saturating_sub(start);
            limit = Some(limit.map_or(remaining, |l| l.min(remaining)));
        }
        self.offset = (offset > 0).then_some(offset);
        self.limit = limit;
        self
    }

    fn is_sliced(&self) -> bool {
        self.offset.is_some() || self.limit.is_some()
    }

    fn reject_sliced(&self, operation: &str) -> Result<()> {
        if self.is_sliced() {
            return Err(Error::Feature(format!(
                "{} is not supported on a sliced result set",
                operation
            )));
        }
        Ok(())
    }

    fn all_columns(&self) -> Vec<usize> {
        (0..self.schema.columns.len()).collect()
    }

    fn select(&self, columns: impl IntoIterator<Item = Expr>) -> Select {
        let mut select = Select::new(columns)
            .filter(self.predicate.clone())
            .distinct(self.distinct);
        select.from = if self.tables.is_empty() {
            vec![Expr::Table(self.table.clone())]
        } else {
            self.tables.clone()
        };
        select.order_by.clone_from(&self.order_by);
        select.offset = self.offset;
        select.limit = self.limit;
        select
    }

    fn entity_select(&self) -> Select {
        self.select(
            self.all_columns()
                .into_iter()
                .map(|i| column_of(&self.schema, i).expr()),
        )
    }

    fn load(&mut self, select: Select) -> Result<Vec<ObjectId>> {
        let rows = self.store.run_expr(&Expr::from(select))?.rows;
        let indices = self.all_columns();
        let mut found = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(id) = self.store.materialize(&self.schema, &indices, row)? {
                found.push(id);
            }
        }
        Ok(found)
    }

    /// Every matching object.
    #[tracing::instrument(level = "debug", skip(self), fields(entity = %self.schema.name))]
    pub fn all(mut self) -> Result<Vec<ObjectId>> {
        self.store.autoflush()?;
        let select = self.entity_select();
        self.load(select)
    }

    /// The only matching object; `None` when nothing matches and
    /// `NotOne` when more than one does.
    #[tracing::instrument(level = "debug", skip(self), fields(entity = %self.schema.name))]
    pub fn one(mut self) -> Result<Option<ObjectId>> {
        self.store.autoflush()?;
        let mut select = self.entity_select();
        select.limit = Some(self.limit.map_or(2, |l| l.min(2)));
        let found = self.load(select)?;
        match found.len() {
            0 => Ok(None),
            1 => Ok(found.first().copied()),
            n => Err(Error::NotOne(n)),
        }
    }

    /// First object in the requested order.
    pub fn first(mut self) -> Result<Option<ObjectId>> {
        if self.order_by.is_empty() {
            return Err(Error::Unordered);
        }
        self.store.autoflush()?;
        let mut select = self.entity_select();
        select.limit = Some(1);
        Ok(self.load(select)?.first().copied())
    }

    /// Last object in the requested order, found by reversing it.
    pub fn last(mut self) -> Result<Option<ObjectId>> {
        if self.order_by.is_empty() {
            return Err(Error::Unordered);
        }
        self.reject_sliced("last()")?;
        self.store.autoflush()?;
        let mut select = self.entity_select();
        select.order_by = self.order_by.iter().cloned().map(reverse).collect();
        select.limit = Some(1);
        Ok(self.load(select)?.first().copied())
    }

    /// Whether any row matches.
    pub fn any(mut self) -> Result<bool> {
        self.store.autoflush()?;
        let mut select = self.select([Expr::Bool(true)]);
        select.order_by.clear();
        select.limit = Some(1);
        Ok(!self.store.run_expr(&Expr::from(select))?.rows.is_empty())
    }

    pub fn is_empty(self) -> Result<bool> {
        self.any().map(|found| !found)
    }

    /// Number of matching rows.
    #[tracing::instrument(level = "debug", skip(self), fields(entity = %self.schema.name))]
    pub fn count(mut self) -> Result<u64> {
        self.reject_sliced("count()")?;
        self.store.autoflush()?;
        let mut select = self.select([Expr::CountAll]);
        select.order_by.clear();
        select.distinct = false;
        let result = self.store.run_expr(&Expr::from(select))?;
        match result.scalar() {
            Some(Value::Int(n)) => Ok(u64::try_from(*n).unwrap_or(0)),
            Some(Value::Null) | None => Ok(0),
            Some(other) => Err(Error::type_mismatch(SqlType::Int, other.describe())),
        }
    }

    fn aggregate(mut self, name: &str, expr: Expr) -> Result<Value> {
        self.reject_sliced(name)?;
        self.store.autoflush()?;
        let mut select = self.select([expr]);
        select.order_by.clear();
        let result = self.store.run_expr(&Expr::from(select))?;
        Ok(result.scalar().cloned().unwrap_or(Value::Null))
    }

    pub fn max(self, expr: impl Into<Expr>) -> Result<Value> {
        self.aggregate("max()", expr.into().max())
    }

    pub fn min(self, expr: impl Into<Expr>) -> Result<Value> {
        self.aggregate("min()", expr.into().min())
    }

    pub fn avg(self, expr: impl Into<Expr>) -> Result<Value> {
        self.aggregate("avg()", expr.into().avg())
    }

    pub fn sum(self, expr: impl Into<Expr>) -> Result<Value> {
        self.aggregate("sum()", expr.into().sum())
    }

    /// Raw column values of every matching row, decoded through each
    /// column's type when it is known.
    pub fn values(mut self, columns: &[Column]) -> Result<Vec<Vec<Value>>> {
        self.store.autoflush()?;
        let select = self.select(columns.iter().cloned().map(Column::expr));
        let rows = self.store.run_expr(&Expr::from(select))?.rows;
        rows.into_iter()
            .map(|row| {
                row.into_values()
                    .into_iter()
                    .zip(columns)
                    .map(|(wire, column)| match column.ty {
                        Some(ty) => Variable::new(ty)
                            .decode(wire)
                            .map_err(|e| e.in_column(&column.name)),
                        None => Ok(wire),
                    })
                    .collect()
            })
            .collect()
    }

    fn matching_keys(&mut self) -> Result<Vec<Vec<Value>>> {
        let pk = self.schema.primary_key_indices();
        let select = self.select(pk.iter().map(|&i| column_of(&self.schema, i).expr()));
        let rows = self.store.run_expr(&Expr::from(select))?.rows;
        rows.into_iter()
            .map(|row| {
                row.into_values()
                    .into_iter()
                    .zip(&pk)
                    .map(|(wire, &i)| {
                        let def = &self.schema.columns[i];
                        def.variable().decode(wire).map_err(|e| e.in_column(&def.name))
                    })
                    .collect()
            })
            .collect()
    }

    /// Live objects of this entity that match the predicate, without a
    /// query. Only the predicate applies; ordering and slicing do not.
    pub fn cached(mut self) -> Result<Vec<ObjectId>> {
        self.reject_custom_tables("cached()")?;
        self.store.autoflush()?;
        let mut found = Vec::new();
        for (id, info) in self.store.objects.iter() {
            if info.schema.name != self.schema.name || info.lifecycle != Lifecycle::Persistent {
                continue;
            }
            if matcher::matches(&self.predicate, info)? {
                found.push(id);
            }
        }
        Ok(found)
    }

    fn live(&self, key: Vec<Value>) -> Option<ObjectId> {
        let ident = crate::identity_map::IdentityKey::new(self.schema.name.clone(), key);
        self.store.identity.get(&ident)
    }

    /// Delete every matching row in one statement. Tracked objects for the
    /// deleted rows leave the identity map.
    #[tracing::instrument(level = "debug", skip(self), fields(entity = %self.schema.name))]
    pub fn remove(mut self) -> Result<u64> {
        self.reject_sliced("remove()")?;
        self.reject_custom_tables("remove()")?;
        self.store.autoflush()?;
        let keys = self.matching_keys()?;
        let delete = Delete::new(self.table.clone()).filter(self.predicate.clone());
        let affected = self.store.run_expr(&Expr::from(delete))?.row_count;
        for key in keys {
            if let Some(id) = self.live(key) {
                self.store.evict_deleted(id);
            }
        }
        Ok(affected)
    }

    /// Assign columns on every matching row in one statement, mirroring the
    /// values into tracked objects.
    #[tracing::instrument(level = "debug", skip(self, assignments), fields(entity = %self.schema.name))]
    pub fn set(mut self, assignments: &[(&str, Value)]) -> Result<u64> {
        self.reject_sliced("set()")?;
        self.reject_custom_tables("set()")?;
        let mut resolved = Vec::with_capacity(assignments.len());
        for (name, value) in assignments {
            let idx = self.schema.require_column(name)?;
            if self.schema.is_primary_key(idx) {
                return Err(Error::Feature(format!(
                    "bulk set() cannot assign primary-key column '{}'",
                    name
                )));
            }
            let mut var = self.schema.columns[idx].variable();
            var.set(value.clone()).map_err(|e| e.in_column(name))?;
            resolved.push((idx, var));
        }
        if resolved.is_empty() {
            return Ok(0);
        }
        self.store.autoflush()?;
        let keys = self.matching_keys()?;
        let mut update = Update::new(self.table.clone()).filter(self.predicate.clone());
        for (idx, var) in &resolved {
            let value = var.get().cloned().unwrap_or(Value::Null);
            update = update.set(column_of(&self.schema, *idx), Expr::Param(value));
        }
        let affected = self.store.run_expr(&Expr::from(update))?.row_count;

        for key in keys {
            let Some(id) = self.live(key) else {
                continue;
            };
            let Some(info) = self.store.objects.get_mut(id) else {
                continue;
            };
            if info.lifecycle != Lifecycle::Persistent {
                continue;
            }
            info.snapshot();
            for (idx, var) in &resolved {
                info.committed[*idx] = var.clone();
                info.pending[*idx] = var.clone();
                let name = info.schema.columns[*idx].name.clone();
                info.forget_references_on(&name);
            }
        }
        Ok(affected)
    }
}

/// A find whose FROM clause is fixed up front, usually to a join.
///
/// Obtained from [`Store::using`].
pub struct TableSet<'a, C: Connection> {
    store: &'a mut Store<C>,
    tables: Vec<Expr>,
}

impl<'a, C: Connection> TableSet<'a, C> {
    pub(crate) fn new(store: &'a mut Store<C>, tables: Vec<Expr>) -> Self {
        Self { store, tables }
    }

    /// Objects of `entity` from rows of the given tables.
    pub fn find(self, entity: &str, predicate: impl Into<Expr>) -> Result<ResultSet<'a, C>> {
        let Self { store, tables } = self;
        Ok(store.find(entity, predicate)?.using(tables))
    }

    /// Tuples of objects, one per entity, from rows of the given tables.
    pub fn find_tuple(
        self,
        entities: &[&str],
        predicate: impl Into<Expr>,
    ) -> Result<TupleResultSet<'a, C>> {
        let Self { store, tables } = self;
        Ok(store.find_tuple(entities, predicate)?.using(tables))
    }
}

/// A query loading several entities from each row.
///
/// Each row becomes one tuple with a slot per entity. A slot is `None` when
/// the entity's key columns are all NULL, as on the missing side of an
/// outer join.
pub struct TupleResultSet<'a, C: Connection> {
    store: &'a mut Store<C>,
    schemas: Vec<Arc<EntitySchema>>,
    tables: Vec<Expr>,
    predicate: Expr,
    order_by: Vec<Expr>,
    distinct: bool,
    offset: Option<u64>,
    limit: Option<u64>,
}

impl<'a, C: Connection> TupleResultSet<'a, C> {
    pub(crate) fn new(
        store: &'a mut Store<C>,
        schemas: Vec<Arc<EntitySchema>>,
        predicate: Expr,
    ) -> Self {
        Self {
            store,
            schemas,
            tables: Vec::new(),
            predicate,
            order_by: Vec::new(),
            distinct: false,
            offset: None,
            limit: None,
        }
    }

    pub(crate) fn using(mut self, tables: Vec<Expr>) -> Self {
        self.tables = tables;
        self
    }

    pub fn filter(mut self, expr: Expr) -> Self {
        let existing = std::mem::replace(&mut self.predicate, Expr::Undef);
        self.predicate = existing.and(expr);
        self
    }

    pub fn order_by(mut self, terms: impl IntoIterator<Item = Expr>) -> Self {
        self.order_by = terms.into_iter().collect();
        self
    }

    pub fn config(mut self, distinct: bool, offset: Option<u64>, limit: Option<u64>) -> Self {
        self.distinct = distinct;
        self.offset = offset;
        self.limit = limit;
        self
    }

    fn select(&self) -> Select {
        let columns = self.schemas.iter().flat_map(|schema| {
            (0..schema.columns.len()).map(move |i| column_of(schema, i).expr())
        });
        let mut select = Select::new(columns)
            .filter(self.predicate.clone())
            .distinct(self.distinct);
        select.from = if self.tables.is_empty() {
            let mut from: Vec<Expr> = Vec::new();
            for schema in &self.schemas {
                let table = Expr::Table(Table::new(schema.table.clone()));
                if !from.contains(&table) {
                    from.push(table);
                }
            }
            from
        } else {
            self.tables.clone()
        };
        select.order_by.clone_from(&self.order_by);
        select.offset = self.offset;
        select.limit = self.limit;
        select
    }

    fn load(&mut self, select: Select) -> Result<Vec<Vec<Option<ObjectId>>>> {
        let rows = self.store.run_expr(&Expr::from(select))?.rows;
        let mut tuples = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut offset = 0;
            let mut tuple = Vec::with_capacity(self.schemas.len());
            for schema in &self.schemas {
                let indices: Vec<usize> = (0..schema.columns.len()).collect();
                tuple.push(self.store.materialize_at(schema, &indices, row, offset)?);
                offset += indices.len();
            }
            tuples.push(tuple);
        }
        Ok(tuples)
    }

    /// Every matching tuple.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.schemas.len()))]
    pub fn all(mut self) -> Result<Vec<Vec<Option<ObjectId>>>> {
        self.store.autoflush()?;
        let select = self.select();
        self.load(select)
    }

    /// The only matching tuple; `NotOne` when several match.
    pub fn one(mut self) -> Result<Option<Vec<Option<ObjectId>>>> {
        self.store.autoflush()?;
        let mut select = self.select();
        select.limit = Some(self.limit.map_or(2, |l| l.min(2)));
        let mut found = self.load(select)?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(Error::NotOne(n)),
        }
    }

    /// First tuple in the requested order.
    pub fn first(mut self) -> Result<Option<Vec<Option<ObjectId>>>> {
        if self.order_by.is_empty() {
            return Err(Error::Unordered);
        }
        self.store.autoflush()?;
        let mut select = self.select();
        select.limit = Some(1);
        Ok(self.load(select)?.into_iter().next())
    }
}

fn reverse(term: Expr) -> Expr {
    match term {
        Expr::Desc(inner) => Expr::Asc(inner),
        Expr::Asc(inner) => Expr::Desc(inner),
        other => Expr::Desc(Box::new(other)),
    }
}
