//! Statement caching for compiled SQL.
//!
//! Compiled SQL text is keyed by the expression tree's shape: everything
//! that influences the rendered text, and nothing that only influences bound
//! parameter values. The key holds the full shape encoding, not a digest of
//! it, so two different shapes never share an entry.

use crate::expr::{Column, Expr};
use crate::join::Join;
use crate::select::Select;
use keel_core::Value;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem;

/// A cached compiled SQL statement.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    pub sql: String,
    /// Access tick of the last lookup or insert.
    pub last_used: u64,
    /// Number of times this statement has been reused.
    pub hit_count: u64,
}

/// LRU-style cache for compiled SQL statements.
///
/// When the cache exceeds `max_size`, the least-recently-used entry is
/// evicted.
///
/// # Example
///
/// ```
/// use keel_query::cache::StatementCache;
///
/// let mut cache: StatementCache<u64> = StatementCache::new(100);
/// cache.insert(12345, "SELECT person.id FROM person".to_string());
/// assert_eq!(cache.get(&12345), Some("SELECT person.id FROM person"));
/// assert_eq!(cache.get(&1), None);
/// ```
#[derive(Debug)]
pub struct StatementCache<K = ShapeKey> {
    cache: HashMap<K, CachedStatement>,
    max_size: usize,
    tick: u64,
}

impl<K: Hash + Eq + Clone> StatementCache<K> {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size: max_size.max(1),
            tick: 0,
        }
    }

    /// Look up a statement, marking it as recently used.
    pub fn get(&mut self, key: &K) -> Option<&str> {
        self.tick += 1;
        let entry = self.cache.get_mut(key)?;
        entry.last_used = self.tick;
        entry.hit_count += 1;
        Some(&entry.sql)
    }

    /// Store a statement, evicting the least-recently-used one when full.
    pub fn insert(&mut self, key: K, sql: String) {
        if !self.cache.contains_key(&key) && self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.tick += 1;
        self.cache.insert(
            key,
            CachedStatement {
                sql,
                last_used: self.tick,
                hit_count: 0,
            },
        );
    }

    pub fn contains(&self, key: &K) -> bool {
        self.cache.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    fn evict_lru(&mut self) {
        if let Some((lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            let lru_key = lru_key.clone();
            self.cache.remove(&lru_key);
        }
    }
}

impl<K: Hash + Eq + Clone> Default for StatementCache<K> {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Encoded shape of an expression tree; equal keys render equal SQL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShapeKey(Vec<u8>);

impl ShapeKey {
    /// Length of the encoding in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// Records every byte fed to it instead of digesting them.
#[derive(Default)]
struct ShapeWriter(Vec<u8>);

impl Hasher for ShapeWriter {
    fn write(&mut self, bytes: &[u8]) {
        self.0.extend_from_slice(bytes);
    }

    fn finish(&self) -> u64 {
        self.0.len() as u64
    }
}

/// Cache key for the SQL text `expr` renders to.
pub fn shape_key(expr: &Expr) -> ShapeKey {
    let mut writer = ShapeWriter::default();
    hash_expr(expr, &mut writer);
    ShapeKey(writer.0)
}

fn hash_list<H: Hasher>(items: &[Expr], h: &mut H) {
    items.len().hash(h);
    for item in items {
        hash_expr(item, h);
    }
}

fn hash_columns<H: Hasher>(columns: &[Column], h: &mut H) {
    columns.len().hash(h);
    for c in columns {
        c.hash(h);
    }
}

fn hash_expr<H: Hasher>(expr: &Expr, h: &mut H) {
    mem::discriminant(expr).hash(h);
    match expr {
        Expr::Column(c) => c.hash(h),
        Expr::Table(t) => t.hash(h),
        // Values are bound, never rendered.
        Expr::Param(_) | Expr::Null | Expr::Undef | Expr::CountAll => {}
        Expr::Bool(b) => b.hash(h),
        Expr::Compare { op, left, right } => {
            op.hash(h);
            hash_expr(left, h);
            hash_expr(right, h);
        }
        Expr::Arith { op, left, right } => {
            op.hash(h);
            hash_expr(left, h);
            hash_expr(right, h);
        }
        Expr::And(items) | Expr::Or(items) => hash_list(items, h),
        Expr::Not(e) | Expr::IsNull(e) | Expr::IsNotNull(e) | Expr::Asc(e) | Expr::Desc(e) => {
            hash_expr(e, h);
        }
        Expr::In { expr, values } => {
            hash_expr(expr, h);
            hash_list(values, h);
        }
        Expr::Like {
            expr,
            pattern,
            case_insensitive,
        } => {
            case_insensitive.hash(h);
            hash_expr(expr, h);
            hash_expr(pattern, h);
        }
        Expr::Func { name, args } => {
            name.hash(h);
            hash_list(args, h);
        }
        Expr::Cast { expr, ty } => {
            ty.hash(h);
            hash_expr(expr, h);
        }
        Expr::Join(j) => hash_join(j, h),
        Expr::Select(s) => hash_select(s, h),
        Expr::Insert(i) => {
            i.table.hash(h);
            hash_columns(&i.columns, h);
            hash_list(&i.values, h);
            hash_columns(&i.returning, h);
        }
        Expr::Update(u) => {
            u.table.hash(h);
            u.set.len().hash(h);
            for (col, value) in &u.set {
                col.hash(h);
                hash_expr(value, h);
            }
            hash_expr(&u.where_clause, h);
            hash_key(&u.key, h);
        }
        Expr::Delete(d) => {
            d.table.hash(h);
            hash_expr(&d.where_clause, h);
            hash_key(&d.key, h);
        }
    }
}

// A NULL key value renders as IS NULL, so nullness is part of the shape.
fn hash_key<H: Hasher>(key: &[(Column, Value)], h: &mut H) {
    key.len().hash(h);
    for (col, value) in key {
        col.hash(h);
        value.is_null().hash(h);
    }
}

fn hash_join<H: Hasher>(join: &Join, h: &mut H) {
    join.kind.hash(h);
    hash_expr(&join.left, h);
    join.right.hash(h);
    match &join.on {
        Some(on) => {
            true.hash(h);
            hash_expr(on, h);
        }
        None => false.hash(h),
    }
}

fn hash_select<H: Hasher>(select: &Select, h: &mut H) {
    hash_list(&select.columns, h);
    hash_list(&select.from, h);
    hash_expr(&select.where_clause, h);
    hash_list(&select.group_by, h);
    hash_expr(&select.having, h);
    hash_list(&select.order_by, h);
    select.distinct.hash(h);
    select.limit.hash(h);
    select.offset.hash(h);
}
