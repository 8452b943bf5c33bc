//! The Store: object tracking and the flush/commit engine.

use crate::arena::{Arena, ObjectId, StoreId};
use crate::config::StoreConfig;
use crate::flush::{self, Dependency, EdgeKind, FlushPlan, FlushStep, OpKind, PendingOp};
use crate::identity_map::{IdentityKey, IdentityMap};
use crate::object::{Lifecycle, Object, ObjectInfo, ObjectState};
use crate::result_set::{ResultSet, TableSet, TupleResultSet};
use keel_core::{
    Cardinality, Connection, ConnectionError, ConnectionErrorKind, DialectProfile, EntitySchema,
    Error, ExecResult, KeyStrategy, NotLoadedError, QueryError, QueryErrorKind, Result, Row,
    SchemaRegistry, SqlType, StaleObjectError, Value, native_to_wire,
};
use keel_query::{Column, Compiler, Delete, Expr, Insert, Select, Table, Update};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Transaction state of a Store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Nothing flushed in the current transaction (one may be open for reads).
    Idle,
    /// A flush is executing.
    Flushing,
    /// At least one flush succeeded; the transaction is open.
    Flushed,
    /// The last transaction committed.
    Committed,
    /// The connection failed; everything but `rollback` is refused.
    Failed,
}

/// What a flush did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Objects whose UPDATE matched no row.
    pub unmatched: Vec<ObjectId>,
}

impl FlushReport {
    /// Number of statements that wrote objects.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Count of pending operations by type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    /// Objects pending INSERT.
    pub new: usize,
    /// Objects pending UPDATE.
    pub dirty: usize,
    /// Objects pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.new + self.dirty + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateOutcome {
    Skipped,
    Matched,
    Unmatched,
}

/// In-memory state saved before a flush executes.
struct Checkpoint {
    objects: Vec<(ObjectId, ObjectInfo)>,
    identity: IdentityMap,
    removed: usize,
}

/// The unit of work.
///
/// A Store owns one [`Connection`], an [`IdentityMap`] and every object it
/// tracks. Objects are addressed through [`ObjectId`] handles; attribute
/// reads and writes go through the Store so that it can track changes and
/// load undefined values on demand.
///
/// ```ignore
/// let mut store = Store::new(conn, registry, StoreConfig::default());
/// let ada = store.add(store.object("person")?.with("name", "Ada")?)?;
/// store.flush()?;                       // INSERT INTO person (name) VALUES (?)
/// store.set_value(ada, "name", "Ada L.")?;
/// store.commit()?;                      // UPDATE person SET name = ? WHERE id = ?
/// ```
pub struct Store<C: Connection> {
    pub(crate) id: StoreId,
    pub(crate) conn: C,
    pub(crate) registry: Arc<SchemaRegistry>,
    pub(crate) config: StoreConfig,
    pub(crate) compiler: Compiler,
    pub(crate) objects: Arena<ObjectInfo>,
    pub(crate) identity: IdentityMap,
    /// Objects that may hold pending work, in first-touch order.
    touched: Vec<ObjectId>,
    touched_set: HashSet<ObjectId>,
    /// Objects deleted in the open transaction; freed at commit.
    removed: Vec<ObjectId>,
    hints: Vec<(ObjectId, ObjectId)>,
    tx: TxState,
    in_transaction: bool,
    closed: bool,
}

impl<C: Connection> std::fmt::Debug for Store<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("objects", &self.objects.len())
            .field("identity", &self.identity.len())
            .field("tx", &self.tx)
            .field("in_transaction", &self.in_transaction)
            .finish_non_exhaustive()
    }
}

impl<C: Connection> Store<C> {
    /// Create a Store over `conn`. The dialect comes from the connection.
    pub fn new(conn: C, registry: Arc<SchemaRegistry>, config: StoreConfig) -> Self {
        let dialect = conn.dialect_profile();
        let compiler = if config.fast_compiler {
            Compiler::cached(dialect, config.statement_cache_size)
        } else {
            Compiler::new(dialect)
        };
        let id = StoreId::next();
        Self {
            id,
            conn,
            registry,
            config,
            compiler,
            objects: Arena::new(id),
            identity: IdentityMap::new(),
            touched: Vec::new(),
            touched_set: HashSet::new(),
            removed: Vec::new(),
            hints: Vec::new(),
            tx: TxState::Idle,
            in_transaction: false,
            closed: false,
        }
    }

    pub fn id(&self) -> StoreId {
        self.id
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    pub fn dialect(&self) -> &DialectProfile {
        self.compiler.dialect()
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn tx_state(&self) -> TxState {
        self.tx
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    /// Number of objects the Store tracks.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    // ------------------------------------------------------------------
    // Schema helpers
    // ------------------------------------------------------------------

    pub fn schema(&self, entity: &str) -> Result<Arc<EntitySchema>> {
        self.registry.get(entity).map(Arc::clone)
    }

    /// A detached object of `entity`, ready to be filled and added.
    pub fn object(&self, entity: &str) -> Result<Object> {
        Ok(Object::new(self.schema(entity)?))
    }

    /// The entity's table, for building predicates.
    pub fn table(&self, entity: &str) -> Result<Table> {
        Ok(Table::new(self.schema(entity)?.table.clone()))
    }

    /// A typed column of `entity`, for building predicates.
    pub fn column(&self, entity: &str, name: &str) -> Result<Column> {
        let schema = self.schema(entity)?;
        let idx = schema.require_column(name)?;
        Ok(column_of(&schema, idx))
    }

    // ------------------------------------------------------------------
    // Object access
    // ------------------------------------------------------------------

    fn check_store(&self, id: ObjectId) -> Result<()> {
        if id.store() == self.id {
            Ok(())
        } else {
            Err(Error::WrongStore(format!(
                "object {} is tracked by another store",
                id
            )))
        }
    }

    /// Tracking state of a live object.
    pub fn info(&self, id: ObjectId) -> Result<&ObjectInfo> {
        self.check_store(id)?;
        match self.objects.get(id) {
            Some(info) if info.lifecycle != Lifecycle::Removed => Ok(info),
            _ => Err(Error::Detached(format!("object {} is no longer tracked", id))),
        }
    }

    pub(crate) fn info_mut(&mut self, id: ObjectId) -> Result<&mut ObjectInfo> {
        self.check_store(id)?;
        match self.objects.get_mut(id) {
            Some(info) if info.lifecycle != Lifecycle::Removed => Ok(info),
            _ => Err(Error::Detached(format!("object {} is no longer tracked", id))),
        }
    }

    pub fn entity_of(&self, id: ObjectId) -> Result<&str> {
        self.info(id).map(ObjectInfo::entity)
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.info(id).is_ok()
    }

    pub(crate) fn touch(&mut self, id: ObjectId) {
        if self.touched_set.insert(id) {
            self.touched.push(id);
        }
    }

    fn untouch(&mut self, id: ObjectId) {
        if self.touched_set.remove(&id) {
            self.touched.retain(|t| *t != id);
        }
    }

    /// Track a new object. It is inserted on the next flush.
    pub fn add(&mut self, object: Object) -> Result<ObjectId> {
        self.ensure_open()?;
        let registered = self.registry.get(object.entity())?;
        if !Arc::ptr_eq(registered, object.schema()) && **registered != **object.schema() {
            return Err(Error::schema(
                Some(object.entity()),
                "object was built from a descriptor that differs from the registered one",
            ));
        }
        let id = self.objects.insert(ObjectInfo::added(object));
        self.touch(id);
        tracing::debug!(object = %id, entity = %self.objects.get(id).map_or("", ObjectInfo::entity), "Added object");
        Ok(id)
    }

    /// Mark an object for deletion. A never-flushed object is evicted
    /// immediately.
    pub fn remove(&mut self, id: ObjectId) -> Result<()> {
        self.ensure_open()?;
        let info = self.info_mut(id)?;
        match info.lifecycle {
            Lifecycle::New => {
                self.objects.remove(id);
                self.untouch(id);
                self.hints.retain(|(a, b)| *a != id && *b != id);
                tracing::debug!(object = %id, "Evicted unsaved object");
            }
            Lifecycle::Persistent => {
                info.lifecycle = Lifecycle::Removing;
                self.touch(id);
            }
            Lifecycle::Removing | Lifecycle::Removed => {}
        }
        Ok(())
    }

    /// Read an attribute, loading it from the backend if it is undefined.
    pub fn get_value(&mut self, id: ObjectId, column: &str) -> Result<Value> {
        let info = self.info(id)?;
        let idx = info.schema.require_column(column)?;
        if let Some(value) = info.pending[idx].get() {
            return Ok(value.clone());
        }
        self.lazy_load(id, column)?;
        let info = self.info(id)?;
        info.pending[idx].get().cloned().ok_or_else(|| {
            Error::NotLoaded(NotLoadedError {
                entity: info.schema.name.clone(),
                column: column.to_string(),
            })
        })
    }

    /// Assign an attribute. The value is coerced to the column type.
    pub fn set_value(&mut self, id: ObjectId, column: &str, value: impl Into<Value>) -> Result<()> {
        let info = self.info_mut(id)?;
        let idx = info.schema.require_column(column)?;
        info.pending[idx]
            .set(value)
            .map_err(|e| e.in_column(column))?;
        info.forget_references_on(column);
        self.touch(id);
        Ok(())
    }

    pub fn object_state(&self, id: ObjectId) -> ObjectState {
        if id.store() != self.id {
            return ObjectState::Detached;
        }
        self.objects
            .get(id)
            .map_or(ObjectState::Detached, ObjectInfo::state)
    }

    pub fn is_dirty(&self, id: ObjectId) -> Result<bool> {
        self.info(id).map(ObjectInfo::is_dirty)
    }

    /// Names of the columns with unflushed changes.
    pub fn changed_columns(&self, id: ObjectId) -> Result<Vec<String>> {
        let info = self.info(id)?;
        Ok(info
            .changed()
            .into_iter()
            .map(|i| info.schema.columns[i].name.clone())
            .collect())
    }

    pub fn pending_counts(&self) -> PendingCounts {
        let mut counts = PendingCounts::default();
        for id in &self.touched {
            match self.objects.get(*id).map(|info| (info.lifecycle, info.has_changes())) {
                Some((Lifecycle::New, _)) => counts.new += 1,
                Some((Lifecycle::Removing, _)) => counts.deleted += 1,
                Some((Lifecycle::Persistent, true)) => counts.dirty += 1,
                _ => {}
            }
        }
        counts
    }

    /// Execute `before`'s pending statement ahead of `after`'s on the next
    /// flush.
    pub fn add_flush_order(&mut self, before: ObjectId, after: ObjectId) -> Result<()> {
        self.info(before)?;
        self.info(after)?;
        if !self.hints.contains(&(before, after)) {
            self.hints.push((before, after));
        }
        Ok(())
    }

    pub fn remove_flush_order(&mut self, before: ObjectId, after: ObjectId) -> Result<()> {
        self.info(before)?;
        self.info(after)?;
        self.hints.retain(|pair| *pair != (before, after));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backend access
    // ------------------------------------------------------------------

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::BackendUnavailable(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                message: "store is closed".to_string(),
                source: None,
            }));
        }
        if self.tx == TxState::Failed {
            return Err(Error::BackendUnavailable(ConnectionError {
                kind: ConnectionErrorKind::StoreFailed,
                message: "connection failed earlier; call rollback()".to_string(),
                source: None,
            }));
        }
        Ok(())
    }

    fn note_failure(&mut self, err: &Error) {
        if err.is_backend_unavailable() {
            tracing::warn!(error = %err, "Backend unavailable; store marked failed");
            self.tx = TxState::Failed;
        }
    }

    fn begin_if_needed(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        if let Err(err) = self.conn.begin() {
            self.note_failure(&err);
            return Err(err);
        }
        tracing::debug!("Transaction started");
        self.in_transaction = true;
        if self.tx == TxState::Committed {
            self.tx = TxState::Idle;
        }
        Ok(())
    }

    pub(crate) fn run(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.begin_if_needed()?;
        tracing::debug!(sql = %sql, params = params.len(), "Executing statement");
        let result = self.conn.execute(sql, params);
        if let Err(err) = &result {
            self.note_failure(err);
        }
        result
    }

    pub(crate) fn run_expr(&mut self, expr: &Expr) -> Result<ExecResult> {
        let compiled = self.compiler.compile(expr)?;
        self.run(&compiled.sql, &compiled.params)
    }

    pub(crate) fn autoflush(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.config.autoflush {
            self.flush()?;
        }
        Ok(())
    }

    /// Run a statement after flushing pending changes.
    pub fn execute(&mut self, expr: &Expr) -> Result<ExecResult> {
        self.autoflush()?;
        self.run_expr(expr)
    }

    /// Run raw SQL after flushing pending changes.
    pub fn execute_raw(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        self.autoflush()?;
        let params: Vec<Value> = params.iter().map(native_to_wire).collect();
        self.run(sql, &params)
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Query `entity` rows matching `predicate` (`Expr::Undef` for all).
    pub fn find(&mut self, entity: &str, predicate: impl Into<Expr>) -> Result<ResultSet<'_, C>> {
        let schema = self.schema(entity)?;
        Ok(ResultSet::new(self, schema, predicate.into()))
    }

    /// Query tuples of `entities`, one object per entity from each row.
    pub fn find_tuple(
        &mut self,
        entities: &[&str],
        predicate: impl Into<Expr>,
    ) -> Result<TupleResultSet<'_, C>> {
        if entities.is_empty() {
            return Err(Error::Feature(
                "a tuple find needs at least one entity".to_string(),
            ));
        }
        let schemas = entities
            .iter()
            .map(|name| self.schema(name))
            .collect::<Result<Vec<_>>>()?;
        Ok(TupleResultSet::new(self, schemas, predicate.into()))
    }

    /// Finds over an explicit FROM clause: tables and joins, in order.
    pub fn using(&mut self, tables: impl IntoIterator<Item = impl Into<Expr>>) -> TableSet<'_, C> {
        let tables = tables.into_iter().map(Into::into).collect();
        TableSet::new(self, tables)
    }

    /// Look up an object by primary key: from the identity map when it is
    /// live, otherwise from the backend.
    #[tracing::instrument(level = "debug", skip(self, key))]
    pub fn get(&mut self, entity: &str, key: &[Value]) -> Result<Option<ObjectId>> {
        self.ensure_open()?;
        let schema = self.schema(entity)?;
        let ident = identity_for(&schema, key)?;
        if let Some(id) = self.lookup(&ident) {
            tracing::trace!("Identity map hit");
            return Ok(id);
        }
        self.autoflush()?;
        if let Some(id) = self.lookup(&ident) {
            return Ok(id);
        }
        let predicate = key_filter(&schema, ident.values());
        let all: Vec<usize> = (0..schema.columns.len()).collect();
        let rows = self.select_rows(&schema, &all, predicate, None)?;
        match rows.first() {
            Some(row) => self.materialize(&schema, &all, row),
            None => Ok(None),
        }
    }

    fn lookup(&self, ident: &IdentityKey) -> Option<Option<ObjectId>> {
        let id = self.identity.get(ident)?;
        match self.objects.get(id).map(|info| info.lifecycle) {
            Some(Lifecycle::Persistent) => Some(Some(id)),
            Some(Lifecycle::Removing) => Some(None),
            _ => None,
        }
    }

    /// SELECT the given columns of `schema`'s table.
    pub(crate) fn select_rows(
        &mut self,
        schema: &EntitySchema,
        indices: &[usize],
        predicate: Expr,
        limit: Option<u64>,
    ) -> Result<Vec<Row>> {
        let table = Table::new(schema.table.clone());
        let mut select = Select::new(indices.iter().map(|&i| column_of(schema, i).expr()))
            .from(table)
            .filter(predicate);
        select.limit = limit;
        Ok(self.run_expr(&Expr::from(select))?.rows)
    }

    /// Resolve a row holding `indices` columns (in that order) to its
    /// object, creating one when the key is not live. Live objects only
    /// have their undefined columns filled.
    pub(crate) fn materialize(
        &mut self,
        schema: &Arc<EntitySchema>,
        indices: &[usize],
        row: &Row,
    ) -> Result<Option<ObjectId>> {
        self.materialize_at(schema, indices, row, 0)
    }

    /// [`Store::materialize`] over the row's values starting at `offset`.
    /// A row whose key columns are all NULL (the missing side of an outer
    /// join) resolves to `None`.
    pub(crate) fn materialize_at(
        &mut self,
        schema: &Arc<EntitySchema>,
        indices: &[usize],
        row: &Row,
        offset: usize,
    ) -> Result<Option<ObjectId>> {
        let mut vars: Vec<_> = schema.columns.iter().map(|c| c.variable()).collect();
        for (pos, &idx) in indices.iter().enumerate() {
            let wire = row.get(offset + pos).cloned().unwrap_or(Value::Null);
            vars[idx]
                .set_wire(wire)
                .map_err(|e| e.in_column(&schema.columns[idx].name))?;
        }
        let key: Option<Vec<Value>> = schema
            .primary_key_indices()
            .into_iter()
            .map(|i| vars[i].get().cloned())
            .collect();
        let key = key.ok_or_else(|| {
            Error::schema(Some(&schema.name), "row does not carry the primary key")
        })?;
        if key.iter().all(Value::is_null) {
            return Ok(None);
        }
        let ident = IdentityKey::new(schema.name.clone(), key);

        let objects = &mut self.objects;
        let (id, created) = self.identity.get_or_create(ident.clone(), || {
            Ok::<_, Error>(objects.insert(ObjectInfo::loaded(Arc::clone(schema), vars.clone())))
        })?;
        if created {
            return Ok(Some(id));
        }
        match self.objects.get_mut(id) {
            Some(info) => {
                for &idx in indices {
                    if !info.committed[idx].is_defined() {
                        info.committed[idx] = vars[idx].clone();
                    }
                    if !info.pending[idx].is_defined() {
                        info.pending[idx] = vars[idx].clone();
                    }
                }
                Ok(Some(id))
            }
            None => {
                let id = self
                    .objects
                    .insert(ObjectInfo::loaded(Arc::clone(schema), vars));
                self.identity.insert(ident, id);
                Ok(Some(id))
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn lazy_load(&mut self, id: ObjectId, column: &str) -> Result<()> {
        let not_loaded = |info: &ObjectInfo| {
            Error::NotLoaded(NotLoadedError {
                entity: info.schema.name.clone(),
                column: column.to_string(),
            })
        };
        if self.info(id)?.lifecycle == Lifecycle::New {
            if !self.config.autoflush {
                return Err(not_loaded(self.info(id)?));
            }
            self.flush()?;
            let info = self.info(id)?;
            if info.schema.column_index(column).is_some_and(|i| info.pending[i].is_defined()) {
                return Ok(());
            }
        }
        self.ensure_open()?;
        let info = self.info(id)?;
        let schema = Arc::clone(&info.schema);
        let missing: Vec<usize> = (0..schema.columns.len())
            .filter(|&i| !info.pending[i].is_defined())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        let key = info
            .committed_key()
            .ok_or_else(|| Error::NotFlushed(info.describe()))?;
        let rows = self.select_rows(&schema, &missing, key_filter(&schema, &key), None)?;
        let Some(row) = rows.first() else {
            return Err(Error::Detached(format!(
                "row for {} no longer exists",
                self.info(id)?.describe()
            )));
        };
        tracing::debug!(columns = missing.len(), "Loaded undefined columns");
        let info = self.info_mut(id)?;
        for (pos, &idx) in missing.iter().enumerate() {
            let wire = row.get(pos).cloned().unwrap_or(Value::Null);
            let mut var = schema.columns[idx].variable();
            var.set_wire(wire)
                .map_err(|e| e.in_column(&schema.columns[idx].name))?;
            if !info.committed[idx].is_defined() {
                info.committed[idx] = var.clone();
            }
            info.pending[idx] = var;
        }
        Ok(())
    }

    /// Re-fetch every column, discarding pending changes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reload(&mut self, id: ObjectId) -> Result<()> {
        self.ensure_open()?;
        let info = self.info(id)?;
        if info.lifecycle == Lifecycle::New {
            return Err(Error::NotFlushed(info.describe()));
        }
        let schema = Arc::clone(&info.schema);
        let key = info
            .committed_key()
            .ok_or_else(|| Error::NotFlushed(info.describe()))?;
        let all: Vec<usize> = (0..schema.columns.len()).collect();
        let rows = self.select_rows(&schema, &all, key_filter(&schema, &key), None)?;
        let Some(row) = rows.first() else {
            return Err(Error::Detached(format!(
                "row for {} no longer exists",
                self.info(id)?.describe()
            )));
        };
        let mut vars: Vec<_> = schema.columns.iter().map(|c| c.variable()).collect();
        for (idx, var) in vars.iter_mut().enumerate() {
            var.set_wire(row.get(idx).cloned().unwrap_or(Value::Null))
                .map_err(|e| e.in_column(&schema.columns[idx].name))?;
        }
        let info = self.info_mut(id)?;
        info.committed.clone_from(&vars);
        info.pending = vars;
        info.ref_cache.clear();
        info.links.clear();
        Ok(())
    }

    /// Mark the object's non-key columns undefined so the next read loads
    /// them again. Unflushed changes are kept.
    pub fn invalidate(&mut self, id: ObjectId) -> Result<()> {
        let info = self.info_mut(id)?;
        if info.lifecycle == Lifecycle::New {
            return Ok(());
        }
        let changed: HashSet<usize> = info.changed().into_iter().collect();
        for idx in 0..info.schema.columns.len() {
            if info.schema.is_primary_key(idx) {
                continue;
            }
            info.committed[idx].unset();
            if !changed.contains(&idx) {
                info.pending[idx].unset();
            }
        }
        info.ref_cache.clear();
        Ok(())
    }

    /// [`Store::invalidate`] every tracked object.
    pub fn invalidate_all(&mut self) -> Result<()> {
        let live: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, info)| info.lifecycle != Lifecycle::Removed)
            .map(|(id, _)| id)
            .collect();
        for id in live {
            self.invalidate(id)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    /// Write pending changes without ending the transaction.
    ///
    /// On failure every object and the identity map are restored to their
    /// state before the call; the backend transaction stays open.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&mut self) -> Result<FlushReport> {
        self.ensure_open()?;
        let plan = self.plan()?;
        if plan.is_empty() {
            self.touched.clear();
            self.touched_set.clear();
            return Ok(FlushReport::default());
        }
        self.begin_if_needed()?;

        let checkpoint = self.checkpoint(&plan);
        self.tx = TxState::Flushing;
        tracing::info!(steps = plan.len(), "Flushing pending changes");

        match self.execute_plan(&plan) {
            Ok(report) => {
                self.tx = TxState::Flushed;
                self.touched.clear();
                self.touched_set.clear();
                self.hints.clear();
                tracing::info!(
                    inserted = report.inserted,
                    updated = report.updated,
                    deleted = report.deleted,
                    unmatched = report.unmatched.len(),
                    "Flush complete"
                );
                Ok(report)
            }
            Err(err) => {
                self.restore(checkpoint);
                if self.tx != TxState::Failed {
                    self.tx = TxState::Idle;
                }
                tracing::warn!(error = %err, "Flush failed; restored in-memory state");
                Err(err)
            }
        }
    }

    fn plan(&self) -> Result<FlushPlan> {
        let mut ops: Vec<PendingOp> = Vec::new();
        let mut index: HashMap<ObjectId, usize> = HashMap::new();
        for &id in &self.touched {
            let Some(info) = self.objects.get(id) else {
                continue;
            };
            let kind = match info.lifecycle {
                Lifecycle::New => OpKind::Insert,
                Lifecycle::Removing => OpKind::Delete,
                Lifecycle::Persistent if info.has_changes() => OpKind::Update,
                _ => continue,
            };
            index.insert(id, ops.len());
            ops.push(PendingOp { id, kind });
        }

        let mut deps: Vec<Dependency> = Vec::new();
        for (pos, op) in ops.iter().enumerate() {
            let Some(info) = self.objects.get(op.id) else {
                continue;
            };
            match op.kind {
                OpKind::Insert | OpKind::Update => {
                    for (name, target) in &info.links {
                        let Some(&t) = index.get(target) else {
                            continue;
                        };
                        if ops[t].kind != OpKind::Insert {
                            continue;
                        }
                        let nullable = info.schema.reference_def(name).is_some_and(|r| {
                            r.local.iter().all(|c| {
                                info.schema.column_def(c).is_some_and(|d| d.nullable)
                            })
                        });
                        let kind = if op.kind == OpKind::Insert && nullable {
                            EdgeKind::Nullable(name.clone())
                        } else {
                            EdgeKind::Hard
                        };
                        deps.push(Dependency {
                            before: t,
                            after: pos,
                            kind,
                        });
                    }
                }
                OpKind::Delete => {
                    for t in self.referenced_deletes(info, &index, &ops) {
                        if t != pos {
                            deps.push(Dependency {
                                before: pos,
                                after: t,
                                kind: EdgeKind::Soft,
                            });
                        }
                    }
                }
            }
        }
        for (before, after) in &self.hints {
            if let (Some(&b), Some(&a)) = (index.get(before), index.get(after)) {
                deps.push(Dependency {
                    before: b,
                    after: a,
                    kind: EdgeKind::Hard,
                });
            }
        }

        flush::order(&ops, &deps, |id| {
            self.objects
                .get(id)
                .map_or_else(|| id.to_string(), ObjectInfo::describe)
        })
    }

    /// Positions of pending deletes that `info` references by key.
    fn referenced_deletes(
        &self,
        info: &ObjectInfo,
        index: &HashMap<ObjectId, usize>,
        ops: &[PendingOp],
    ) -> Vec<usize> {
        let mut found = Vec::new();
        for r in &info.schema.references {
            if r.cardinality != Cardinality::OneToOne {
                continue;
            }
            let Ok(target) = self.registry.get(&r.target) else {
                continue;
            };
            if r.remote != target.primary_key {
                continue;
            }
            let values: Option<Vec<Value>> = r
                .local
                .iter()
                .map(|c| {
                    let idx = info.schema.column_index(c)?;
                    info.committed[idx].get().filter(|v| !v.is_null()).cloned()
                })
                .collect();
            let Some(values) = values else {
                continue;
            };
            let ident = IdentityKey::new(target.name.clone(), values);
            if let Some(&t) = self.identity.get(&ident).and_then(|id| index.get(&id)) {
                if ops[t].kind == OpKind::Delete {
                    found.push(t);
                }
            }
        }
        found
    }

    fn checkpoint(&self, plan: &FlushPlan) -> Checkpoint {
        let mut seen = HashSet::new();
        let objects = plan
            .steps
            .iter()
            .map(FlushStep::id)
            .filter(|id| seen.insert(*id))
            .filter_map(|id| self.objects.get(id).map(|info| (id, info.clone())))
            .collect();
        Checkpoint {
            objects,
            identity: self.identity.clone(),
            removed: self.removed.len(),
        }
    }

    fn restore(&mut self, checkpoint: Checkpoint) {
        for (id, saved) in checkpoint.objects {
            if let Some(info) = self.objects.get_mut(id) {
                *info = saved;
            }
        }
        self.identity = checkpoint.identity;
        self.removed.truncate(checkpoint.removed);
    }

    fn execute_plan(&mut self, plan: &FlushPlan) -> Result<FlushReport> {
        let mut report = FlushReport::default();
        for step in &plan.steps {
            match step {
                FlushStep::Insert { id, null_refs } => {
                    self.flush_insert(*id, null_refs)?;
                    report.inserted += 1;
                }
                FlushStep::Update { id } => match self.flush_update(*id)? {
                    UpdateOutcome::Skipped => {}
                    UpdateOutcome::Matched => report.updated += 1,
                    UpdateOutcome::Unmatched => {
                        report.updated += 1;
                        report.unmatched.push(*id);
                    }
                },
                FlushStep::Delete { id } => {
                    self.flush_delete(*id)?;
                    report.deleted += 1;
                }
                FlushStep::Patch { id, reference } => {
                    tracing::debug!(object = %id, reference = %reference, "Patching deferred reference");
                    if self.flush_update(*id)? == UpdateOutcome::Unmatched
                        && !report.unmatched.contains(id)
                    {
                        report.unmatched.push(*id);
                    }
                }
            }
        }
        Ok(report)
    }

    /// Copy the keys of linked objects into the local foreign-key columns.
    fn resolve_links(&mut self, id: ObjectId, skip: &[String]) -> Result<()> {
        let info = self.info(id)?;
        let links: Vec<(String, ObjectId)> = info
            .links
            .iter()
            .filter(|(name, _)| !skip.contains(name))
            .map(|(name, target)| (name.clone(), *target))
            .collect();
        for (name, target) in links {
            let schema = Arc::clone(&self.info(id)?.schema);
            let Some(def) = schema.reference_def(&name) else {
                continue;
            };
            let Ok(target_info) = self.info(target) else {
                tracing::warn!(object = %id, reference = %name, "Linked object is gone; dropping reference");
                self.info_mut(id)?.links.remove(&name);
                continue;
            };
            let values: Option<Vec<Value>> = def
                .remote
                .iter()
                .map(|c| {
                    let idx = target_info.schema.column_index(c)?;
                    target_info.pending[idx].get().cloned()
                })
                .collect();
            let Some(values) = values else {
                continue;
            };
            let info = self.info_mut(id)?;
            for (col, value) in def.local.iter().zip(&values) {
                let idx = schema.require_column(col)?;
                info.pending[idx]
                    .set(value.clone())
                    .map_err(|e| e.in_column(col))?;
            }
            info.links.remove(&name);
            info.ref_cache.insert(name, (values, target));
        }
        Ok(())
    }

    fn flush_insert(&mut self, id: ObjectId, null_refs: &[String]) -> Result<()> {
        self.resolve_links(id, null_refs)?;
        let strategy = self.compiler.dialect().key_strategy;
        let info = self.info(id)?;
        let schema = Arc::clone(&info.schema);

        let null_cols: HashSet<usize> = null_refs
            .iter()
            .filter_map(|name| schema.reference_def(name))
            .flat_map(|r| r.local.iter().filter_map(|c| schema.column_index(c)))
            .collect();

        let mut insert = Insert::new(Table::new(schema.table.clone()));
        for (idx, var) in info.pending.iter().enumerate() {
            if null_cols.contains(&idx) {
                insert = insert.value(column_of(&schema, idx), Expr::Param(Value::Null));
            } else if let Some(value) = var.get() {
                insert = insert.value(column_of(&schema, idx), Expr::Param(value.clone()));
            }
        }
        let missing: Vec<usize> = schema
            .primary_key_indices()
            .into_iter()
            .filter(|&i| !info.pending[i].is_defined())
            .collect();
        if !missing.is_empty() {
            match strategy {
                KeyStrategy::Returning => {
                    for &idx in &missing {
                        insert = insert.returning(column_of(&schema, idx));
                    }
                }
                KeyStrategy::LastInsertId => {
                    if missing.len() != 1 || schema.columns[missing[0]].sql_type != SqlType::Int {
                        return Err(Error::Feature(format!(
                            "{}: only a single integer key can be generated without RETURNING",
                            schema.name
                        )));
                    }
                }
            }
        }

        let result = self.run_expr(&Expr::from(insert))?;
        let generated: Vec<Value> = if missing.is_empty() {
            Vec::new()
        } else {
            match strategy {
                KeyStrategy::Returning => result
                    .rows
                    .first()
                    .map(|row| row.values().to_vec())
                    .unwrap_or_default(),
                KeyStrategy::LastInsertId => result.generated_keys.clone(),
            }
        };
        if generated.len() < missing.len() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: None,
                message: format!("backend reported no generated key for {}", schema.name),
                source: None,
            }));
        }

        let info = self.info_mut(id)?;
        info.snapshot();
        for (&idx, wire) in missing.iter().zip(generated) {
            info.pending[idx]
                .set_wire(wire)
                .map_err(|e| e.in_column(&schema.columns[idx].name))?;
        }
        for idx in 0..schema.columns.len() {
            if null_cols.contains(&idx) {
                let mut var = schema.columns[idx].variable();
                var.set_wire(Value::Null)?;
                info.committed[idx] = var;
            } else {
                info.committed[idx] = info.pending[idx].clone();
            }
        }
        info.lifecycle = Lifecycle::Persistent;
        let ident = info.committed_identity();
        if let Some(ident) = ident {
            if let Some(previous) = self.identity.insert(ident, id) {
                if previous != id {
                    tracing::warn!(object = %id, replaced = %previous, "Insert replaced a stale identity entry");
                }
            }
        }
        tracing::trace!(object = %id, "Inserted");
        Ok(())
    }

    fn flush_update(&mut self, id: ObjectId) -> Result<UpdateOutcome> {
        self.resolve_links(id, &[])?;
        let info = self.info(id)?;
        let changed = info.changed();
        if changed.is_empty() {
            return Ok(UpdateOutcome::Skipped);
        }
        let schema = Arc::clone(&info.schema);
        let key = info
            .committed_key()
            .ok_or_else(|| Error::NotFlushed(info.describe()))?;

        let mut update = Update::new(Table::new(schema.table.clone()));
        for &idx in &changed {
            let value = info.pending[idx].get().cloned().unwrap_or(Value::Null);
            update = update.set(column_of(&schema, idx), Expr::Param(value));
        }
        for (idx, value) in schema.primary_key_indices().into_iter().zip(&key) {
            update = update.by_key(column_of(&schema, idx), value.clone());
        }

        let result = self.run_expr(&Expr::from(update))?;
        let matched = result.row_count > 0;
        if !matched {
            if self.config.optimistic_lock {
                return Err(Error::StaleObject(StaleObjectError {
                    entity: schema.name.clone(),
                    key,
                }));
            }
            tracing::warn!(object = %self.info(id)?.describe(), "UPDATE matched no row");
        }

        let info = self.info_mut(id)?;
        info.snapshot();
        let old = info.committed_identity();
        for &idx in &changed {
            info.committed[idx] = info.pending[idx].clone();
        }
        let new = info.committed_identity();
        if old != new {
            if let Some(old) = old {
                self.identity.remove(&old, id);
            }
            if let Some(new) = new {
                self.identity.insert(new, id);
            }
        }
        Ok(if matched {
            UpdateOutcome::Matched
        } else {
            UpdateOutcome::Unmatched
        })
    }

    fn flush_delete(&mut self, id: ObjectId) -> Result<()> {
        let info = self.info(id)?;
        let schema = Arc::clone(&info.schema);
        let key = info
            .committed_key()
            .ok_or_else(|| Error::NotFlushed(info.describe()))?;
        let mut delete = Delete::new(Table::new(schema.table.clone()));
        for (idx, value) in schema.primary_key_indices().into_iter().zip(&key) {
            delete = delete.by_key(column_of(&schema, idx), value.clone());
        }
        let result = self.run_expr(&Expr::from(delete))?;
        if result.row_count == 0 {
            tracing::debug!(object = %id, "DELETE matched no row");
        }
        self.evict_deleted(id);
        Ok(())
    }

    /// Take a deleted object out of the identity map. It stays in the arena
    /// until commit so that a rollback can restore it.
    pub(crate) fn evict_deleted(&mut self, id: ObjectId) {
        let Some(info) = self.objects.get_mut(id) else {
            return;
        };
        info.snapshot();
        info.lifecycle = Lifecycle::Removed;
        info.ref_cache.clear();
        info.links.clear();
        if let Some(ident) = info.committed_identity() {
            self.identity.remove(&ident, id);
        }
        self.removed.push(id);
    }

    // ------------------------------------------------------------------
    // Transaction boundaries
    // ------------------------------------------------------------------

    /// Flush, then commit the backend transaction. On failure the Store
    /// rolls back and the error is returned.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<FlushReport> {
        self.ensure_open()?;
        let result = match self.flush() {
            Ok(report) => {
                if self.in_transaction {
                    match self.conn.commit() {
                        Ok(()) => Ok(report),
                        Err(err) => {
                            self.note_failure(&err);
                            Err(err)
                        }
                    }
                } else {
                    Ok(report)
                }
            }
            Err(err) => Err(err),
        };

        match result {
            Ok(report) => {
                self.in_transaction = false;
                for id in std::mem::take(&mut self.removed) {
                    self.objects.remove(id);
                }
                for id in self.objects.ids() {
                    if let Some(info) = self.objects.get_mut(id) {
                        info.durable = None;
                    }
                }
                self.tx = TxState::Committed;
                tracing::info!("Transaction committed");
                Ok(report)
            }
            Err(err) => {
                tracing::warn!(error = %err, "Commit failed; rolling back");
                if let Err(rollback_err) = self.rollback() {
                    tracing::warn!(error = %rollback_err, "Rollback after failed commit also failed");
                }
                Err(err)
            }
        }
    }

    /// Discard the transaction and every unflushed change.
    ///
    /// Objects return to their last committed state; objects added or first
    /// inserted in the transaction are evicted; objects deleted in it are
    /// tracked again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return self.ensure_open();
        }
        let mut backend_err = None;
        if self.in_transaction {
            if let Err(err) = self.conn.rollback() {
                if err.is_backend_unavailable() {
                    tracing::warn!(error = %err, "Backend rollback failed; connection is gone");
                } else {
                    backend_err = Some(err);
                }
            }
            self.in_transaction = false;
        }

        let mut evicted = 0usize;
        for id in self.objects.ids() {
            let evict = {
                let Some(info) = self.objects.get_mut(id) else {
                    continue;
                };
                let evict = match info.durable.take() {
                    Some(durable) if durable.lifecycle == Lifecycle::New => true,
                    Some(durable) => {
                        info.committed = durable.committed;
                        info.lifecycle = Lifecycle::Persistent;
                        false
                    }
                    None => match info.lifecycle {
                        Lifecycle::New => true,
                        Lifecycle::Removing | Lifecycle::Removed => {
                            info.lifecycle = Lifecycle::Persistent;
                            false
                        }
                        Lifecycle::Persistent => false,
                    },
                };
                if !evict {
                    info.pending.clone_from(&info.committed);
                    info.links.clear();
                    info.ref_cache.clear();
                }
                evict
            };
            if evict {
                self.objects.remove(id);
                evicted += 1;
            }
        }
        self.rebuild_identity();
        self.touched.clear();
        self.touched_set.clear();
        self.removed.clear();
        self.hints.clear();
        self.tx = TxState::Idle;
        tracing::info!(evicted, "Transaction rolled back");
        backend_err.map_or(Ok(()), Err)
    }

    fn rebuild_identity(&mut self) {
        self.identity.clear();
        let entries: Vec<(IdentityKey, ObjectId)> = self
            .objects
            .iter()
            .filter(|(_, info)| info.lifecycle == Lifecycle::Persistent)
            .filter_map(|(id, info)| info.committed_identity().map(|k| (k, id)))
            .collect();
        for (ident, id) in entries {
            self.identity.insert(ident, id);
        }
    }

    /// Roll back any open transaction, evict every object and release the
    /// connection.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.in_transaction {
            if let Err(err) = self.conn.rollback() {
                tracing::warn!(error = %err, "Rollback on close failed");
            }
            self.in_transaction = false;
        }
        self.objects.clear();
        self.identity.clear();
        self.touched.clear();
        self.touched_set.clear();
        self.removed.clear();
        self.hints.clear();
        self.closed = true;
        tracing::debug!("Store closed");
        self.conn.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// Typed column `idx` of `schema`'s table.
pub(crate) fn column_of(schema: &EntitySchema, idx: usize) -> Column {
    let def = &schema.columns[idx];
    Table::new(schema.table.clone()).typed(def.name.clone(), def.sql_type)
}

/// Primary-key equality over `key`, in key order.
pub(crate) fn key_filter(schema: &EntitySchema, key: &[Value]) -> Expr {
    schema
        .primary_key_indices()
        .into_iter()
        .zip(key)
        .map(|(idx, value)| column_of(schema, idx).eq(Expr::Param(value.clone())))
        .fold(Expr::Undef, |acc, e| acc.and(e))
}

/// Identity of `entity` under a key given by the application.
fn identity_for(schema: &EntitySchema, key: &[Value]) -> Result<IdentityKey> {
    let pk = schema.primary_key_indices();
    if pk.len() != key.len() {
        return Err(Error::schema(
            Some(&schema.name),
            format!("expected {} key values, got {}", pk.len(), key.len()),
        ));
    }
    let values = pk
        .into_iter()
        .zip(key)
        .map(|(idx, value)| {
            let def = &schema.columns[idx];
            def.variable()
                .encode(value)
                .and_then(|wire| def.variable().decode(wire))
                .map_err(|e| e.in_column(&def.name))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(IdentityKey::new(schema.name.clone(), values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockConnection;
    use keel_core::{ColumnDef, ReferenceDef};

    fn registry() -> Arc<SchemaRegistry> {
        let person = EntitySchema::new("person")
            .column(ColumnDef::new("id", SqlType::Int).not_null())
            .column(ColumnDef::new("name", SqlType::Text))
            .column(ColumnDef::new("manager_id", SqlType::Int))
            .primary_key(&["id"])
            .reference(ReferenceDef::one("manager", &["manager_id"], "person", &["id"]))
            .reference(ReferenceDef::many("reports", &["id"], "person", &["manager_id"]));
        let left = EntitySchema::new("left_side")
            .column(ColumnDef::new("id", SqlType::Int).not_null())
            .column(ColumnDef::new("right_id", SqlType::Int).not_null())
            .primary_key(&["id"])
            .reference(ReferenceDef::one("right", &["right_id"], "right_side", &["id"]));
        let right = EntitySchema::new("right_side")
            .column(ColumnDef::new("id", SqlType::Int).not_null())
            .column(ColumnDef::new("left_id", SqlType::Int).not_null())
            .primary_key(&["id"])
            .reference(ReferenceDef::one("left", &["left_id"], "left_side", &["id"]));
        Arc::new(SchemaRegistry::from_entities([person, left, right]).unwrap())
    }

    const PERSON: &[&str] = &["id", "name", "manager_id"];

    fn store_with(conn: MockConnection, config: StoreConfig) -> Store<MockConnection> {
        Store::new(conn, registry(), config)
    }

    fn store() -> Store<MockConnection> {
        store_with(MockConnection::sqlite(), StoreConfig::default())
    }

    fn add_person(store: &mut Store<MockConnection>, name: &str) -> ObjectId {
        let obj = store.object("person").unwrap().with("name", name).unwrap();
        store.add(obj).unwrap()
    }

    /// Load person `id` through `get`, answering the SELECT with one row.
    fn load_person(
        store: &mut Store<MockConnection>,
        id: i64,
        name: &str,
        manager: Option<i64>,
    ) -> ObjectId {
        store.connection_mut().push_rows(
            PERSON,
            vec![vec![Value::Int(id), Value::from(name), Value::from(manager)]],
        );
        store.get("person", &[Value::Int(id)]).unwrap().unwrap()
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn test_flush_inserts_and_reads_back_generated_key() {
        let mut store = store();
        let ada = add_person(&mut store, "Ada");
        assert_eq!(store.object_state(ada), ObjectState::New);

        let report = store.flush().unwrap();
        assert_eq!(report.inserted, 1);
        let conn = store.connection();
        assert_eq!(
            conn.executed[0],
            (
                "INSERT INTO person (name) VALUES (?) RETURNING id".to_string(),
                vec![text("Ada")]
            )
        );
        assert_eq!(conn.tx_log, vec!["BEGIN"]);
        assert_eq!(store.get_value(ada, "id").unwrap(), Value::Int(1));
        assert_eq!(store.object_state(ada), ObjectState::Clean);
        assert_eq!(store.tx_state(), TxState::Flushed);
    }

    #[test]
    fn test_last_insert_id_strategy() {
        let mut store = store_with(
            MockConnection::last_insert_id().next_key(41),
            StoreConfig::default(),
        );
        let ada = add_person(&mut store, "Ada");
        store.flush().unwrap();
        assert_eq!(
            store.connection().sql(),
            vec!["INSERT INTO person (name) VALUES (?)"]
        );
        assert_eq!(store.get_value(ada, "id").unwrap(), Value::Int(41));
        assert_eq!(
            store.get("person", &[Value::Int(41)]).unwrap(),
            Some(ada)
        );
    }

    #[test]
    fn test_update_writes_only_changed_columns() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.connection_mut().clear();

        store.set_value(ada, "name", "Ada L.").unwrap();
        assert_eq!(store.object_state(ada), ObjectState::Dirty);
        assert_eq!(store.changed_columns(ada).unwrap(), vec!["name"]);

        let report = store.flush().unwrap();
        assert_eq!(report.updated, 1);
        assert_eq!(
            store.connection().executed,
            vec![(
                "UPDATE person SET name = ? WHERE id = ?".to_string(),
                vec![text("Ada L."), Value::Int(1)]
            )]
        );
        assert_eq!(store.object_state(ada), ObjectState::Clean);
    }

    #[test]
    fn test_setting_the_same_value_is_not_a_change() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.set_value(ada, "name", "Ada").unwrap();
        assert!(!store.is_dirty(ada).unwrap());
        store.connection_mut().clear();
        assert_eq!(store.flush().unwrap(), FlushReport::default());
        assert!(store.connection().executed.is_empty());
    }

    #[test]
    fn test_flush_is_idempotent() {
        let mut store = store();
        add_person(&mut store, "Ada");
        store.flush().unwrap();
        store.connection_mut().clear();
        let report = store.flush().unwrap();
        assert_eq!(report.total(), 0);
        assert!(store.connection().executed.is_empty());
        assert!(store.pending_counts().is_empty());
    }

    #[test]
    fn test_identity_map_returns_the_same_handle() {
        let mut store = store();
        let first = load_person(&mut store, 7, "Ada", None);
        let selects = store.connection().executed.len();
        let again = store.get("person", &[Value::Int(7)]).unwrap();
        assert_eq!(again, Some(first));
        assert_eq!(store.connection().executed.len(), selects);

        // Keys are coerced to the column type before lookup.
        let coerced = store.get("person", &[Value::Float(7.0)]).unwrap();
        assert_eq!(coerced, Some(first));
    }

    #[test]
    fn test_find_reuses_live_objects_without_clobbering_changes() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.set_value(ada, "name", "Changed").unwrap();
        store
            .connection_mut()
            .push_rows(PERSON, vec![vec![Value::Int(1), text("Ada"), Value::Null]]);
        let config = StoreConfig::default().autoflush(false);
        store.config = config;
        let found = store.find("person", Expr::Undef).unwrap().all().unwrap();
        assert_eq!(found, vec![ada]);
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Changed"));
    }

    #[test]
    fn test_stores_are_isolated() {
        let mut one = store();
        let mut two = store();
        let a = load_person(&mut one, 1, "Ada", None);
        let b = load_person(&mut two, 1, "Ada", None);
        assert_ne!(a, b);
        assert!(matches!(two.info(a), Err(Error::WrongStore(_))));
        assert_eq!(two.object_state(a), ObjectState::Detached);
    }

    #[test]
    fn test_remove_then_commit_forgets_the_object() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.remove(ada).unwrap();
        assert_eq!(store.object_state(ada), ObjectState::Deleted);
        // A pending delete hides the key from lookups.
        assert_eq!(store.get("person", &[Value::Int(1)]).unwrap(), None);

        store.commit().unwrap();
        assert!(store.connection().sql().contains(&"DELETE FROM person WHERE id = ?"));
        assert_eq!(store.connection().tx_log, vec!["BEGIN", "COMMIT"]);
        assert_eq!(store.object_state(ada), ObjectState::Detached);
        assert!(matches!(store.get_value(ada, "name"), Err(Error::Detached(_))));

        let fresh = load_person(&mut store, 1, "Ada", None);
        assert_ne!(fresh, ada);
    }

    #[test]
    fn test_removing_an_unsaved_object_evicts_it() {
        let mut store = store();
        let ada = add_person(&mut store, "Ada");
        store.remove(ada).unwrap();
        assert_eq!(store.object_state(ada), ObjectState::Detached);
        assert!(store.flush().unwrap().total() == 0);
        assert!(store.connection().executed.is_empty());
    }

    #[test]
    fn test_referenced_object_is_inserted_first() {
        let mut store = store();
        let a = add_person(&mut store, "A");
        let b = add_person(&mut store, "B");
        store.set_reference(a, "manager", Some(b)).unwrap();

        store.flush().unwrap();
        let executed = &store.connection().executed;
        assert_eq!(executed[0].1, vec![text("B")]);
        assert_eq!(
            executed[1],
            (
                "INSERT INTO person (name, manager_id) VALUES (?, ?) RETURNING id".to_string(),
                vec![text("A"), Value::Int(1)]
            )
        );
        assert_eq!(store.reference(a, "manager").unwrap(), Some(b));
    }

    #[test]
    fn test_flush_order_hint() {
        let mut store = store();
        let a = add_person(&mut store, "A");
        let b = add_person(&mut store, "B");
        store.add_flush_order(b, a).unwrap();
        store.flush().unwrap();
        assert_eq!(store.connection().executed[0].1, vec![text("B")]);

        // Hints are consumed by the flush that honoured them.
        let c = add_person(&mut store, "C");
        let d = add_person(&mut store, "D");
        store.add_flush_order(d, c).unwrap();
        store.remove_flush_order(d, c).unwrap();
        store.connection_mut().clear();
        store.flush().unwrap();
        assert_eq!(store.connection().executed[0].1, vec![text("C")]);
    }

    #[test]
    fn test_nullable_cycle_is_patched_after_insert() {
        let mut store = store();
        let a = add_person(&mut store, "A");
        let b = add_person(&mut store, "B");
        store.set_reference(a, "manager", Some(b)).unwrap();
        store.set_reference(b, "manager", Some(a)).unwrap();

        let report = store.flush().unwrap();
        assert_eq!(report.inserted, 2);
        let sql = store.connection().sql();
        assert_eq!(sql.len(), 3);
        assert!(sql[0].starts_with("INSERT"));
        assert!(sql[1].starts_with("INSERT"));
        assert_eq!(sql[2], "UPDATE person SET manager_id = ? WHERE id = ?");

        let a_id = store.get_value(a, "id").unwrap();
        let b_id = store.get_value(b, "id").unwrap();
        assert_eq!(store.get_value(a, "manager_id").unwrap(), b_id);
        assert_eq!(store.get_value(b, "manager_id").unwrap(), a_id);
        assert!(!store.is_dirty(a).unwrap());
        assert!(!store.is_dirty(b).unwrap());
    }

    #[test]
    fn test_zero_row_patch_is_unmatched() {
        let mut store = store();
        let a = add_person(&mut store, "A");
        let b = add_person(&mut store, "B");
        store.set_reference(a, "manager", Some(b)).unwrap();
        store.set_reference(b, "manager", Some(a)).unwrap();
        store.connection_mut().push_affected(0);

        let report = store.flush().unwrap();
        assert_eq!(report.inserted, 2);
        assert_eq!(report.unmatched.len(), 1);
        assert!(report.unmatched[0] == a || report.unmatched[0] == b);
    }

    #[test]
    fn test_non_nullable_cycle_fails_without_writing() {
        let mut store = store();
        let left = store.add(store.object("left_side").unwrap()).unwrap();
        let right = store.add(store.object("right_side").unwrap()).unwrap();
        store.set_reference(left, "right", Some(right)).unwrap();
        store.set_reference(right, "left", Some(left)).unwrap();

        let err = store.flush().unwrap_err();
        match err {
            Error::FlushCycle(cycle) => assert_eq!(cycle.objects.len(), 2),
            other => panic!("expected FlushCycle, got {other:?}"),
        }
        assert!(store.connection().executed.is_empty());
        assert_eq!(store.object_state(left), ObjectState::New);
    }

    #[test]
    fn test_rollback_restores_committed_values() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.set_value(ada, "name", "Grace").unwrap();
        store.flush().unwrap();
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Grace"));

        store.rollback().unwrap();
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Ada"));
        assert_eq!(store.object_state(ada), ObjectState::Clean);
        assert_eq!(store.connection().tx_log, vec!["BEGIN", "ROLLBACK"]);
        assert_eq!(store.tx_state(), TxState::Idle);
    }

    #[test]
    fn test_rollback_evicts_new_and_restores_deleted() {
        let mut store = store();
        let ada = load_person(&mut store, 50, "Ada", None);
        let grace = add_person(&mut store, "Grace");
        let unsaved = add_person(&mut store, "Unsaved");
        store.flush().unwrap();
        store.set_value(unsaved, "name", "Still unsaved").unwrap();
        store.remove(ada).unwrap();
        store.flush().unwrap();
        assert_eq!(store.object_state(ada), ObjectState::Detached);

        store.rollback().unwrap();
        assert_eq!(store.object_state(grace), ObjectState::Detached);
        assert_eq!(store.object_state(unsaved), ObjectState::Detached);
        assert_eq!(store.object_state(ada), ObjectState::Clean);
        let executed = store.connection().executed.len();
        assert_eq!(store.get("person", &[Value::Int(50)]).unwrap(), Some(ada));
        assert_eq!(store.connection().executed.len(), executed);
    }

    #[test]
    fn test_failed_flush_restores_in_memory_state() {
        let mut store = store();
        let ada = load_person(&mut store, 50, "Ada", None);
        store.set_value(ada, "name", "Ada L.").unwrap();
        let grace = add_person(&mut store, "Grace");
        store.connection_mut().fail_at(1, false);

        let err = store.flush().unwrap_err();
        assert!(matches!(err, Error::Query(_)));
        assert_eq!(store.object_state(grace), ObjectState::New);
        assert_eq!(store.object_state(ada), ObjectState::Dirty);
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Ada L."));
        assert_eq!(store.tx_state(), TxState::Idle);
        assert_eq!(store.identity.len(), 1);

        let report = store.flush().unwrap();
        assert_eq!((report.inserted, report.updated), (1, 1));
    }

    #[test]
    fn test_lost_connection_fails_the_store() {
        let mut store = store();
        add_person(&mut store, "Ada");
        store.connection_mut().fail_at(0, true);
        assert!(store.flush().unwrap_err().is_backend_unavailable());
        assert_eq!(store.tx_state(), TxState::Failed);

        match store.flush() {
            Err(Error::BackendUnavailable(e)) => {
                assert_eq!(e.kind, ConnectionErrorKind::StoreFailed);
            }
            other => panic!("expected StoreFailed, got {other:?}"),
        }
        store.rollback().unwrap();
        assert_eq!(store.tx_state(), TxState::Idle);
        assert!(store.is_empty());
    }

    #[test]
    fn test_failed_commit_rolls_back() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.set_value(ada, "name", "Grace").unwrap();
        store.connection_mut().fail_at(0, false);
        assert!(store.commit().is_err());
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Ada"));
        assert_eq!(store.connection().tx_log.last(), Some(&"ROLLBACK"));
    }

    #[test]
    fn test_zero_row_update() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.set_value(ada, "name", "Grace").unwrap();
        store.connection_mut().push_affected(0);
        let report = store.flush().unwrap();
        assert_eq!(report.unmatched, vec![ada]);

        let mut locked = store_with(
            MockConnection::sqlite(),
            StoreConfig::default().optimistic_lock(true),
        );
        let ada = load_person(&mut locked, 1, "Ada", None);
        locked.set_value(ada, "name", "Grace").unwrap();
        locked.connection_mut().push_affected(0);
        match locked.flush() {
            Err(Error::StaleObject(stale)) => {
                assert_eq!(stale.entity, "person");
                assert_eq!(stale.key, vec![Value::Int(1)]);
            }
            other => panic!("expected StaleObject, got {other:?}"),
        }
        assert!(locked.is_dirty(ada).unwrap());
    }

    #[test]
    fn test_lazy_load_after_invalidate() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.invalidate(ada).unwrap();
        store.connection_mut().clear();
        store
            .connection_mut()
            .push_rows(&["name", "manager_id"], vec![vec![text("Ada K."), Value::Null]]);

        assert_eq!(store.get_value(ada, "id").unwrap(), Value::Int(1));
        assert!(store.connection().executed.is_empty());
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Ada K."));
        assert_eq!(store.connection().executed.len(), 1);
        assert_eq!(store.connection().executed[0].1, vec![Value::Int(1)]);
        assert!(!store.is_dirty(ada).unwrap());
    }

    #[test]
    fn test_invalidate_all_skips_removed_objects() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        let grace = load_person(&mut store, 2, "Grace", None);
        store.remove(grace).unwrap();
        store.flush().unwrap();

        store.invalidate_all().unwrap();
        store.connection_mut().clear();
        store
            .connection_mut()
            .push_rows(&["name", "manager_id"], vec![vec![text("Ada K."), Value::Null]]);
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Ada K."));
        assert_eq!(store.object_state(grace), ObjectState::Detached);
    }

    #[test]
    fn test_unsaved_attribute_without_autoflush() {
        let mut store = store_with(
            MockConnection::sqlite(),
            StoreConfig::default().autoflush(false),
        );
        let ada = add_person(&mut store, "Ada");
        assert!(matches!(store.get_value(ada, "id"), Err(Error::NotLoaded(_))));
        assert!(store.connection().executed.is_empty());

        let mut eager = self::store();
        let ada = add_person(&mut eager, "Ada");
        assert_eq!(eager.get_value(ada, "id").unwrap(), Value::Int(1));
    }

    #[test]
    fn test_reload_discards_changes() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.set_value(ada, "name", "Local").unwrap();
        store
            .connection_mut()
            .push_rows(PERSON, vec![vec![Value::Int(1), text("Remote"), Value::Null]]);
        store.reload(ada).unwrap();
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Remote"));
        assert!(!store.is_dirty(ada).unwrap());

        let unsaved = add_person(&mut store, "New");
        assert!(matches!(store.reload(unsaved), Err(Error::NotFlushed(_))));
    }

    #[test]
    fn test_reference_is_cached_until_key_changes() {
        let mut store = store();
        let boss = load_person(&mut store, 1, "Boss", None);
        let ada = load_person(&mut store, 2, "Ada", Some(1));
        let executed = store.connection().executed.len();

        assert_eq!(store.reference(ada, "manager").unwrap(), Some(boss));
        assert_eq!(store.reference(ada, "manager").unwrap(), Some(boss));
        assert_eq!(store.connection().executed.len(), executed);

        store.set_value(ada, "manager_id", Value::Null).unwrap();
        assert_eq!(store.reference(ada, "manager").unwrap(), None);

        store.set_reference(ada, "manager", Some(boss)).unwrap();
        assert_eq!(store.get_value(ada, "manager_id").unwrap(), Value::Int(1));
        assert!(matches!(
            store.related(ada, "manager"),
            Err(Error::Feature(_))
        ));
    }

    #[test]
    fn test_related_runs_a_query() {
        let mut store = store();
        let boss = load_person(&mut store, 1, "Boss", None);
        store.connection_mut().clear();
        store.connection_mut().push_rows(
            PERSON,
            vec![
                vec![Value::Int(2), text("Ada"), Value::Int(1)],
                vec![Value::Int(3), text("Grace"), Value::Int(1)],
            ],
        );
        let reports = store.related(boss, "reports").unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(store.connection().executed[0].1, vec![Value::Int(1)]);
        assert_eq!(store.get_value(reports[1], "name").unwrap(), text("Grace"));
    }

    #[test]
    fn test_result_set_terminals() {
        let mut store = store();
        let name = store.column("person", "name").unwrap();

        store.connection_mut().push_rows(&["count"], vec![vec![Value::Int(3)]]);
        assert_eq!(store.find("person", Expr::Undef).unwrap().count().unwrap(), 3);

        assert!(matches!(
            store.find("person", Expr::Undef).unwrap().first(),
            Err(Error::Unordered)
        ));

        store.connection_mut().push_rows(
            PERSON,
            vec![
                vec![Value::Int(1), text("Ada"), Value::Null],
                vec![Value::Int(2), text("Ada"), Value::Null],
            ],
        );
        let one = store
            .find("person", name.clone().eq("Ada"))
            .unwrap()
            .one();
        assert!(matches!(one, Err(Error::NotOne(2))));

        let sliced = store
            .find("person", Expr::Undef)
            .unwrap()
            .slice(1, Some(3))
            .count();
        assert!(matches!(sliced, Err(Error::Feature(_))));

        store.connection_mut().clear();
        store.connection_mut().push_rows(&["1"], vec![vec![Value::Int(1)]]);
        assert!(store.find("person", name.eq("Ada")).unwrap().any().unwrap());
        assert!(store.connection().sql()[0].ends_with("LIMIT 1"));
    }

    #[test]
    fn test_tuple_find_over_outer_join() {
        let mut store = store();
        let left = Table::new("left_side");
        let right = Table::new("right_side");
        let join = keel_query::Join::left(
            left.clone(),
            right.clone(),
            left.column("right_id").eq(right.column("id")),
        );
        store.connection_mut().push_rows(
            &["id", "right_id", "id", "left_id"],
            vec![
                vec![Value::Int(1), Value::Int(10), Value::Int(10), Value::Int(1)],
                vec![Value::Int(2), Value::Int(20), Value::Null, Value::Null],
            ],
        );
        let tuples = store
            .using([join])
            .find_tuple(&["left_side", "right_side"], Expr::Undef)
            .unwrap()
            .all()
            .unwrap();

        assert!(store.connection().sql()[0].contains(" LEFT JOIN "));
        assert_eq!(tuples.len(), 2);
        let matched = tuples[0][1].unwrap();
        assert_eq!(store.entity_of(matched).unwrap(), "right_side");
        assert_eq!(store.get_value(matched, "id").unwrap(), Value::Int(10));
        assert!(tuples[1][0].is_some());
        assert_eq!(tuples[1][1], None);
        // The NULL side created nothing.
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_using_rejects_bulk_and_cached() {
        let mut store = store();
        let person = Table::new("person");
        let removed = store
            .using([person.clone()])
            .find("person", Expr::Undef)
            .unwrap()
            .remove();
        assert!(matches!(removed, Err(Error::Feature(_))));
        let cached = store
            .using([person])
            .find("person", Expr::Undef)
            .unwrap()
            .cached();
        assert!(matches!(cached, Err(Error::Feature(_))));
        assert!(store.connection().executed.is_empty());
    }

    #[test]
    fn test_cached_matches_live_objects_only() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        let grace = load_person(&mut store, 2, "Grace", Some(1));
        store.connection_mut().clear();
        let name = store.column("person", "name").unwrap();
        let manager = store.column("person", "manager_id").unwrap();

        let found = store
            .find("person", name.eq("Ada"))
            .unwrap()
            .cached()
            .unwrap();
        assert_eq!(found, vec![ada]);
        let found = store
            .find("person", manager.eq(1))
            .unwrap()
            .cached()
            .unwrap();
        assert_eq!(found, vec![grace]);
        assert_eq!(
            store.find("person", Expr::Undef).unwrap().cached().unwrap(),
            vec![ada, grace]
        );
        assert!(store.connection().executed.is_empty());
    }

    #[test]
    fn test_bulk_set_updates_tracked_objects() {
        let mut store = store();
        let ada = load_person(&mut store, 1, "Ada", None);
        store.connection_mut().clear();
        store.connection_mut().push_rows(&["id"], vec![vec![Value::Int(1)]]);
        store.connection_mut().push_affected(1);
        let id = store.column("person", "id").unwrap();
        let affected = store
            .find("person", id.eq(1))
            .unwrap()
            .set(&[("name", text("Renamed"))])
            .unwrap();
        assert_eq!(affected, 1);
        assert_eq!(
            store.connection().sql()[1],
            "UPDATE person SET name = ? WHERE id = ?"
        );
        assert_eq!(store.get_value(ada, "name").unwrap(), text("Renamed"));
        assert!(!store.is_dirty(ada).unwrap());

        let err = store
            .find("person", Expr::Undef)
            .unwrap()
            .set(&[("id", Value::Int(9))])
            .unwrap_err();
        assert!(matches!(err, Error::Feature(_)));
    }

    #[test]
    fn test_close_refuses_further_work() {
        let mut store = store();
        load_person(&mut store, 1, "Ada", None);
        store.close().unwrap();
        assert!(store.is_closed());
        assert_eq!(store.connection().tx_log.last(), Some(&"ROLLBACK"));
        assert!(store.flush().unwrap_err().is_backend_unavailable());
        assert!(store.is_empty());
    }
}
