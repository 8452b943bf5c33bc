//! Lowering of expression trees to parameterized SQL.
//!
//! The renderer walks the tree depth-first and appends text and bound
//! parameters in a single pass, so parameter order always matches the order
//! of placeholders in the output. The same walk runs in a params-only mode
//! for the cached path in [`Compiler`], which guarantees both paths bind the
//! same values in the same order.

use crate::cache::{StatementCache, shape_key};
use crate::expr::{Column, Expr, Table};
use crate::join::{Join, JoinKind};
use crate::select::Select;
use crate::statement::{Delete, Insert, Update, key_predicate};
use keel_core::error::CompileError;
use keel_core::{DialectProfile, Error, KeyStrategy, Result, Value, native_to_wire};

/// SQL text plus the wire values bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Compile `expr` for `dialect` with the reference renderer.
pub fn compile(expr: &Expr, dialect: &DialectProfile) -> Result<Compiled> {
    let mut r = Renderer::new(dialect, true);
    r.statement(expr)?;
    Ok(Compiled {
        sql: r.sql.unwrap_or_default(),
        params: r.params,
    })
}

/// Bound parameters of `expr` without building any SQL text.
pub(crate) fn collect_params(expr: &Expr, dialect: &DialectProfile) -> Result<Vec<Value>> {
    let mut r = Renderer::new(dialect, false);
    r.statement(expr)?;
    Ok(r.params)
}

/// Dialect-bound compiler with an optional statement cache.
///
/// With a cache, SQL text is rendered once per distinct tree shape and
/// later compilations only collect parameters.
#[derive(Debug)]
pub struct Compiler {
    dialect: DialectProfile,
    cache: Option<StatementCache>,
}

impl Compiler {
    /// Reference compiler without caching.
    pub fn new(dialect: DialectProfile) -> Self {
        Self {
            dialect,
            cache: None,
        }
    }

    /// Compiler that caches rendered SQL for up to `capacity` shapes.
    pub fn cached(dialect: DialectProfile, capacity: usize) -> Self {
        Self {
            dialect,
            cache: Some(StatementCache::new(capacity)),
        }
    }

    pub fn dialect(&self) -> &DialectProfile {
        &self.dialect
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    pub fn compile(&mut self, expr: &Expr) -> Result<Compiled> {
        let Some(cache) = self.cache.as_mut() else {
            return compile(expr, &self.dialect);
        };
        let key = shape_key(expr);
        if let Some(sql) = cache.get(&key) {
            tracing::trace!(shape_len = key.len(), "statement cache hit");
            let sql = sql.to_string();
            let params = collect_params(expr, &self.dialect)?;
            return Ok(Compiled { sql, params });
        }
        let compiled = compile(expr, &self.dialect)?;
        tracing::trace!(sql = %compiled.sql, "statement cache miss");
        cache.insert(key, compiled.sql.clone());
        Ok(compiled)
    }
}

const PREC_OR: u8 = 1;
const PREC_AND: u8 = 2;
const PREC_NOT: u8 = 3;
const PREC_PREDICATE: u8 = 4;
const PREC_ATOM: u8 = 10;

fn precedence(expr: &Expr) -> u8 {
    match expr {
        Expr::And(items) | Expr::Or(items) if items.is_empty() => PREC_ATOM,
        Expr::And(items) | Expr::Or(items) if items.len() == 1 => precedence(&items[0]),
        Expr::Or(_) => PREC_OR,
        Expr::And(_) => PREC_AND,
        Expr::Not(_) => PREC_NOT,
        Expr::Compare { .. }
        | Expr::IsNull(_)
        | Expr::IsNotNull(_)
        | Expr::In { .. }
        | Expr::Like { .. } => PREC_PREDICATE,
        Expr::Arith { op, .. } => op.precedence(),
        _ => PREC_ATOM,
    }
}

fn typed_column(expr: &Expr) -> Option<&Column> {
    match expr {
        Expr::Column(c) if c.ty.is_some() => Some(c),
        _ => None,
    }
}

#[derive(Clone, Copy)]
struct Ctx<'a> {
    /// Render columns as `table.column`
    qualify: bool,
    /// Typed column that bound parameters are coerced through
    hint: Option<&'a Column>,
}

const QUALIFIED: Ctx<'static> = Ctx {
    qualify: true,
    hint: None,
};
const BARE: Ctx<'static> = Ctx {
    qualify: false,
    hint: None,
};

impl<'a> Ctx<'a> {
    fn hinted(self, hint: Option<&'a Column>) -> Ctx<'a> {
        Ctx { hint, ..self }
    }
}

struct Renderer<'d> {
    dialect: &'d DialectProfile,
    sql: Option<String>,
    params: Vec<Value>,
}

impl<'d> Renderer<'d> {
    fn new(dialect: &'d DialectProfile, emit_sql: bool) -> Self {
        Self {
            dialect,
            sql: emit_sql.then(String::new),
            params: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        if let Some(sql) = self.sql.as_mut() {
            sql.push_str(text);
        }
    }

    fn ident(&mut self, name: &str) {
        let dialect = self.dialect;
        if let Some(sql) = self.sql.as_mut() {
            sql.push_str(&dialect.quote_identifier(name));
        }
    }

    fn fail(&self, node: &str, message: impl Into<String>) -> Error {
        Error::Compile(CompileError {
            node: node.to_string(),
            dialect: self.dialect.name.clone(),
            message: Some(message.into()),
        })
    }

    fn bind(&mut self, value: &Value, hint: Option<&Column>) -> Result<()> {
        let native = match hint.and_then(|c| c.ty.map(|ty| (c, ty))) {
            Some((col, ty)) => ty
                .coerce(value.clone(), false)
                .map_err(|e| e.in_column(&col.name))?,
            None => value.clone(),
        };
        self.params.push(native_to_wire(&native));
        if self.sql.is_some() {
            let placeholder = self.dialect.placeholder(self.params.len());
            self.push(&placeholder);
        }
        Ok(())
    }

    fn list<'e>(
        &mut self,
        items: impl IntoIterator<Item = &'e Expr>,
        separator: &str,
        ctx: Ctx<'_>,
    ) -> Result<()> {
        for (i, item) in items.into_iter().enumerate() {
            if i > 0 {
                self.push(separator);
            }
            self.expr(item, ctx)?;
        }
        Ok(())
    }

    fn operand(&mut self, expr: &Expr, parent: u8, strict: bool, ctx: Ctx<'_>) -> Result<()> {
        let p = precedence(expr);
        if p < parent || (strict && p == parent) {
            self.push("(");
            self.expr(expr, ctx)?;
            self.push(")");
            Ok(())
        } else {
            self.expr(expr, ctx)
        }
    }

    fn statement(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Select(s) => self.select(s),
            Expr::Insert(i) => self.insert(i),
            Expr::Update(u) => self.update(u),
            Expr::Delete(d) => self.delete(d),
            other => self.expr(other, QUALIFIED),
        }
    }

    fn column(&mut self, col: &Column, qualify: bool) {
        if qualify {
            if let Some(table) = &col.table {
                self.ident(table.reference());
                self.push(".");
            }
        }
        self.ident(&col.name);
    }

    fn connective(&mut self, items: &[Expr], and: bool, ctx: Ctx<'_>) -> Result<()> {
        match items {
            [] => {
                let literal = self.dialect.bool_literal(and).to_string();
                self.push(&literal);
                Ok(())
            }
            [single] => self.expr(single, ctx),
            _ => {
                let (prec, sep) = if and {
                    (PREC_AND, " AND ")
                } else {
                    (PREC_OR, " OR ")
                };
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.push(sep);
                    }
                    self.operand(item, prec, false, ctx)?;
                }
                Ok(())
            }
        }
    }

    fn expr(&mut self, expr: &Expr, ctx: Ctx<'_>) -> Result<()> {
        match expr {
            Expr::Column(c) => {
                self.column(c, ctx.qualify);
                Ok(())
            }
            Expr::Param(v) => self.bind(v, ctx.hint),
            Expr::Bool(b) => {
                let literal = self.dialect.bool_literal(*b).to_string();
                self.push(&literal);
                Ok(())
            }
            Expr::Null => {
                self.push("NULL");
                Ok(())
            }
            Expr::Compare { op, left, right } => {
                self.operand(left, PREC_PREDICATE, true, ctx.hinted(typed_column(right)))?;
                self.push(" ");
                self.push(op.as_str());
                self.push(" ");
                self.operand(right, PREC_PREDICATE, true, ctx.hinted(typed_column(left)))
            }
            Expr::Arith { op, left, right } => {
                let p = op.precedence();
                self.operand(left, p, false, ctx.hinted(typed_column(right)))?;
                self.push(" ");
                self.push(op.as_str());
                self.push(" ");
                self.operand(right, p, true, ctx.hinted(typed_column(left)))
            }
            Expr::And(items) => self.connective(items, true, ctx.hinted(None)),
            Expr::Or(items) => self.connective(items, false, ctx.hinted(None)),
            Expr::Not(inner) => {
                self.push("NOT ");
                self.operand(inner, PREC_NOT, false, ctx.hinted(None))
            }
            Expr::IsNull(inner) => {
                self.operand(inner, PREC_PREDICATE, true, ctx.hinted(None))?;
                self.push(" IS NULL");
                Ok(())
            }
            Expr::IsNotNull(inner) => {
                self.operand(inner, PREC_PREDICATE, true, ctx.hinted(None))?;
                self.push(" IS NOT NULL");
                Ok(())
            }
            Expr::In { expr, values } => self.in_list(expr, values, ctx),
            Expr::Like {
                expr,
                pattern,
                case_insensitive,
            } => {
                if *case_insensitive && !self.dialect.supports_ilike {
                    return Err(self.fail("ILike", "case-insensitive LIKE is not available"));
                }
                self.operand(expr, PREC_PREDICATE, true, ctx.hinted(None))?;
                self.push(if *case_insensitive { " ILIKE " } else { " LIKE " });
                self.operand(pattern, PREC_PREDICATE, true, ctx.hinted(None))
            }
            Expr::Func { name, args } => {
                self.push(name);
                self.push("(");
                self.list(args, ", ", ctx.hinted(None))?;
                self.push(")");
                Ok(())
            }
            Expr::CountAll => {
                self.push("COUNT(*)");
                Ok(())
            }
            Expr::Asc(inner) => {
                self.expr(inner, ctx.hinted(None))?;
                self.push(" ASC");
                Ok(())
            }
            Expr::Desc(inner) => {
                self.expr(inner, ctx.hinted(None))?;
                self.push(" DESC");
                Ok(())
            }
            Expr::Cast { expr, ty } => {
                let Some(type_name) = self.dialect.type_name(*ty).map(str::to_string) else {
                    return Err(self.fail("Cast", format!("no type name for {}", ty.name())));
                };
                self.push("CAST(");
                self.expr(expr, ctx.hinted(None))?;
                self.push(" AS ");
                self.push(&type_name);
                self.push(")");
                Ok(())
            }
            Expr::Select(s) => {
                self.push("(");
                self.select(s)?;
                self.push(")");
                Ok(())
            }
            Expr::Undef => Err(self.fail("Undef", "undefined value in expression")),
            Expr::Table(_) | Expr::Join(_) | Expr::Insert(_) | Expr::Update(_) | Expr::Delete(_) => {
                Err(self.fail(expr.kind(), "not usable as a scalar expression"))
            }
        }
    }

    fn in_list(&mut self, expr: &Expr, values: &[Expr], ctx: Ctx<'_>) -> Result<()> {
        if values.is_empty() {
            let literal = self.dialect.bool_literal(false).to_string();
            self.push(&literal);
            return Ok(());
        }
        self.operand(expr, PREC_PREDICATE, true, ctx.hinted(None))?;
        if let [Expr::Select(sub)] = values {
            self.push(" IN (");
            self.select(sub)?;
            self.push(")");
            return Ok(());
        }
        self.push(" IN (");
        self.list(values, ", ", ctx.hinted(typed_column(expr)))?;
        self.push(")");
        Ok(())
    }

    fn table(&mut self, table: &Table) {
        self.ident(&table.name);
        if let Some(alias) = &table.alias {
            self.push(" AS ");
            self.ident(alias);
        }
    }

    fn join(&mut self, join: &Join) -> Result<()> {
        if join.kind == JoinKind::Full && !self.dialect.supports_full_join {
            return Err(self.fail("FullJoin", "FULL JOIN is not available"));
        }
        match &join.left {
            Expr::Table(t) => self.table(t),
            Expr::Join(inner) => self.join(inner)?,
            other => return Err(self.fail(other.kind(), "not usable as a join operand")),
        }
        self.push(" ");
        self.push(join.kind.as_str());
        self.push(" ");
        self.table(&join.right);
        if let Some(on) = &join.on {
            self.push(" ON ");
            self.expr(on, QUALIFIED)?;
        }
        Ok(())
    }

    fn select(&mut self, select: &Select) -> Result<()> {
        let ctx = QUALIFIED;
        self.push("SELECT ");
        if select.distinct {
            self.push("DISTINCT ");
        }
        if select.columns.is_empty() {
            self.push("*");
        } else {
            self.list(&select.columns, ", ", ctx)?;
        }

        if select.from.is_empty() {
            let tables = implied_tables(select);
            for (i, table) in tables.iter().enumerate() {
                self.push(if i == 0 { " FROM " } else { ", " });
                self.table(table);
            }
        } else {
            for (i, item) in select.from.iter().enumerate() {
                self.push(if i == 0 { " FROM " } else { ", " });
                match item {
                    Expr::Table(t) => self.table(t),
                    Expr::Join(j) => self.join(j)?,
                    other => return Err(self.fail(other.kind(), "not usable in FROM")),
                }
            }
        }

        if !select.where_clause.is_undef() {
            self.push(" WHERE ");
            self.expr(&select.where_clause, ctx)?;
        }
        if !select.group_by.is_empty() {
            self.push(" GROUP BY ");
            self.list(&select.group_by, ", ", ctx)?;
        }
        if !select.having.is_undef() {
            self.push(" HAVING ");
            self.expr(&select.having, ctx)?;
        }
        if !select.order_by.is_empty() {
            self.push(" ORDER BY ");
            self.list(&select.order_by, ", ", ctx)?;
        }
        match (select.limit, select.offset) {
            (Some(limit), offset) => {
                self.push(&format!(" LIMIT {}", limit));
                if let Some(offset) = offset {
                    self.push(&format!(" OFFSET {}", offset));
                }
            }
            (None, Some(offset)) => {
                if let Some(unbounded) = self.dialect.unbounded_limit.clone() {
                    self.push(&format!(" LIMIT {}", unbounded));
                }
                self.push(&format!(" OFFSET {}", offset));
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn insert(&mut self, insert: &Insert) -> Result<()> {
        if !insert.returning.is_empty() && self.dialect.key_strategy == KeyStrategy::LastInsertId {
            return Err(self.fail("Returning", "dialect retrieves keys with last-insert-id"));
        }
        if insert.columns.len() != insert.values.len() {
            return Err(self.fail(
                "Insert",
                format!(
                    "{} columns but {} values",
                    insert.columns.len(),
                    insert.values.len()
                ),
            ));
        }
        self.push("INSERT INTO ");
        self.ident(&insert.table.name);
        if insert.columns.is_empty() {
            if !self.dialect.supports_default_values {
                return Err(self.fail("Insert", "no columns and no DEFAULT VALUES form"));
            }
            self.push(" DEFAULT VALUES");
        } else {
            self.push(" (");
            for (i, col) in insert.columns.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.column(col, false);
            }
            self.push(") VALUES (");
            for (i, (col, value)) in insert.columns.iter().zip(&insert.values).enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.expr(value, BARE.hinted(Some(col)))?;
            }
            self.push(")");
        }
        if !insert.returning.is_empty() {
            self.push(" RETURNING ");
            for (i, col) in insert.returning.iter().enumerate() {
                if i > 0 {
                    self.push(", ");
                }
                self.column(col, false);
            }
        }
        Ok(())
    }

    fn filter(&mut self, where_clause: &Expr, key: &[(Column, Value)]) -> Result<()> {
        if !where_clause.is_undef() {
            self.push(" WHERE ");
            return self.expr(where_clause, BARE);
        }
        let by_key = key_predicate(key);
        if !by_key.is_undef() {
            self.push(" WHERE ");
            self.expr(&by_key, BARE)?;
        }
        Ok(())
    }

    fn update(&mut self, update: &Update) -> Result<()> {
        if update.set.is_empty() {
            return Err(self.fail("Update", "no columns to set"));
        }
        self.push("UPDATE ");
        self.ident(&update.table.name);
        self.push(" SET ");
        for (i, (col, value)) in update.set.iter().enumerate() {
            if i > 0 {
                self.push(", ");
            }
            self.column(col, false);
            self.push(" = ");
            self.expr(value, BARE.hinted(Some(col)))?;
        }
        self.filter(&update.where_clause, &update.key)
    }

    fn delete(&mut self, delete: &Delete) -> Result<()> {
        self.push("DELETE FROM ");
        self.ident(&delete.table.name);
        self.filter(&delete.where_clause, &delete.key)
    }
}

/// Tables referenced by columns of `select`, in order of first appearance.
fn implied_tables(select: &Select) -> Vec<&Table> {
    fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a Table>) {
        match expr {
            Expr::Column(c) => {
                if let Some(t) = &c.table {
                    if !out.contains(&t) {
                        out.push(t);
                    }
                }
            }
            Expr::Compare { left, right, .. } | Expr::Arith { left, right, .. } => {
                walk(left, out);
                walk(right, out);
            }
            Expr::And(items) | Expr::Or(items) | Expr::Func { args: items, .. } => {
                items.iter().for_each(|e| walk(e, out));
            }
            Expr::Not(e)
            | Expr::IsNull(e)
            | Expr::IsNotNull(e)
            | Expr::Asc(e)
            | Expr::Desc(e)
            | Expr::Cast { expr: e, .. } => walk(e, out),
            Expr::In { expr, values } => {
                walk(expr, out);
                values.iter().for_each(|e| walk(e, out));
            }
            Expr::Like { expr, pattern, .. } => {
                walk(expr, out);
                walk(pattern, out);
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    for e in select
        .columns
        .iter()
        .chain(std::iter::once(&select.where_clause))
        .chain(&select.group_by)
        .chain(std::iter::once(&select.having))
        .chain(&select.order_by)
    {
        walk(e, &mut out);
    }
    out
}
