//! Per-object tracking state.
//!
//! Every tracked object carries two rows of [`Variable`]s: `committed` holds
//! what the backend has as of the last flush and `pending` holds the
//! in-memory state the application sees. An object is dirty when a defined
//! pending variable differs from its committed counterpart.

use crate::arena::ObjectId;
use crate::identity_map::{IdentityKey, same_value};
use keel_core::{EntitySchema, Error, NotLoadedError, Result, Value, Variable};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Observable state of a tracked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectState {
    /// Added, not yet inserted.
    New,
    /// Persisted and unmodified.
    Clean,
    /// Persisted with pending changes.
    Dirty,
    /// Marked for deletion on the next flush.
    Deleted,
    /// No longer tracked by the Store.
    Detached,
}

/// Where an object stands relative to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    New,
    Persistent,
    /// Persistent and marked for deletion.
    Removing,
    /// DELETE executed in the open transaction.
    Removed,
}

/// Committed state at the start of the open transaction.
#[derive(Debug, Clone)]
pub(crate) struct Durable {
    pub committed: Vec<Variable>,
    pub lifecycle: Lifecycle,
}

/// An object that is not tracked by any Store yet.
///
/// Attributes can be set before [`Store::add`](crate::Store::add); reading
/// one that was never set is `NotLoaded`, since there is no Store to fetch
/// it from.
#[derive(Debug, Clone)]
pub struct Object {
    schema: Arc<EntitySchema>,
    values: Vec<Variable>,
}

impl Object {
    pub fn new(schema: Arc<EntitySchema>) -> Self {
        let values = schema.columns.iter().map(|c| c.variable()).collect();
        Self { schema, values }
    }

    pub fn entity(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    /// Assign a column, coercing the value to the column's type.
    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> Result<()> {
        let idx = self.schema.require_column(column)?;
        self.values[idx]
            .set(value)
            .map_err(|e| e.in_column(column))
    }

    /// Builder form of [`Object::set`].
    pub fn with(mut self, column: &str, value: impl Into<Value>) -> Result<Self> {
        self.set(column, value)?;
        Ok(self)
    }

    pub fn get(&self, column: &str) -> Result<&Value> {
        let idx = self.schema.require_column(column)?;
        self.values[idx].get().ok_or_else(|| {
            Error::NotLoaded(NotLoadedError {
                entity: self.schema.name.clone(),
                column: column.to_string(),
            })
        })
    }

    pub fn is_set(&self, column: &str) -> bool {
        self.schema
            .column_index(column)
            .is_some_and(|idx| self.values[idx].is_defined())
    }

    pub(crate) fn into_parts(self) -> (Arc<EntitySchema>, Vec<Variable>) {
        (self.schema, self.values)
    }
}

/// Tracking state for one object inside a Store.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub(crate) schema: Arc<EntitySchema>,
    pub(crate) committed: Vec<Variable>,
    pub(crate) pending: Vec<Variable>,
    pub(crate) lifecycle: Lifecycle,
    /// Snapshot for rollback, taken the first time a flush touches the
    /// object in the open transaction.
    pub(crate) durable: Option<Durable>,
    /// One-to-one references resolved earlier, keyed by reference name,
    /// with the foreign-key values they were resolved from.
    pub(crate) ref_cache: HashMap<String, (Vec<Value>, ObjectId)>,
    /// References assigned to objects that have no key yet.
    pub(crate) links: BTreeMap<String, ObjectId>,
}

impl ObjectInfo {
    /// Tracking state for an object added by the application.
    pub(crate) fn added(object: Object) -> Self {
        let (schema, pending) = object.into_parts();
        let committed = schema.columns.iter().map(|c| c.variable()).collect();
        Self {
            schema,
            committed,
            pending,
            lifecycle: Lifecycle::New,
            durable: None,
            ref_cache: HashMap::new(),
            links: BTreeMap::new(),
        }
    }

    /// Tracking state for an object materialized from a row.
    pub(crate) fn loaded(schema: Arc<EntitySchema>, committed: Vec<Variable>) -> Self {
        Self {
            schema,
            pending: committed.clone(),
            committed,
            lifecycle: Lifecycle::Persistent,
            durable: None,
            ref_cache: HashMap::new(),
            links: BTreeMap::new(),
        }
    }

    pub fn entity(&self) -> &str {
        &self.schema.name
    }

    pub fn schema(&self) -> &Arc<EntitySchema> {
        &self.schema
    }

    pub fn state(&self) -> ObjectState {
        match self.lifecycle {
            Lifecycle::New => ObjectState::New,
            Lifecycle::Removing => ObjectState::Deleted,
            Lifecycle::Removed => ObjectState::Detached,
            Lifecycle::Persistent if self.has_changes() => ObjectState::Dirty,
            Lifecycle::Persistent => ObjectState::Clean,
        }
    }

    /// Indices of columns whose pending value differs from the committed one.
    pub fn changed(&self) -> Vec<usize> {
        self.pending
            .iter()
            .zip(&self.committed)
            .enumerate()
            .filter(|(_, (p, c))| match (p.get(), c.get()) {
                (Some(p), Some(c)) => !same_value(p, c),
                (p, _) => p.is_some(),
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn has_changes(&self) -> bool {
        !self.changed().is_empty() || !self.links.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        match self.lifecycle {
            Lifecycle::New | Lifecycle::Removing => true,
            Lifecycle::Persistent => self.has_changes(),
            Lifecycle::Removed => false,
        }
    }

    /// Wire values of the given variables' key columns, or `None` if any is
    /// undefined.
    fn key_of(&self, vars: &[Variable]) -> Option<Vec<Value>> {
        self.schema
            .primary_key_indices()
            .into_iter()
            .map(|i| vars[i].get().cloned())
            .collect()
    }

    /// Identity under the last flushed key.
    pub(crate) fn committed_identity(&self) -> Option<IdentityKey> {
        self.key_of(&self.committed)
            .map(|key| IdentityKey::new(self.schema.name.clone(), key))
    }

    /// Primary key as the application currently sees it.
    pub fn pending_key(&self) -> Option<Vec<Value>> {
        self.key_of(&self.pending)
    }

    pub(crate) fn committed_key(&self) -> Option<Vec<Value>> {
        self.key_of(&self.committed)
    }

    /// Take a rollback snapshot unless one exists for this transaction.
    pub(crate) fn snapshot(&mut self) {
        if self.durable.is_none() {
            self.durable = Some(Durable {
                committed: self.committed.clone(),
                lifecycle: self.lifecycle,
            });
        }
    }

    /// Forget cached references and links that involve `column`.
    pub(crate) fn forget_references_on(&mut self, column: &str) {
        let names: Vec<String> = self
            .schema
            .references
            .iter()
            .filter(|r| r.local.iter().any(|c| c == column))
            .map(|r| r.name.clone())
            .collect();
        for name in names {
            self.ref_cache.remove(&name);
            self.links.remove(&name);
        }
    }

    /// Short description for logs and errors, e.g. `person(1)`.
    pub fn describe(&self) -> String {
        let key = self
            .pending_key()
            .or_else(|| self.committed_key())
            .map(|k| {
                k.iter()
                    .map(Value::describe)
                    .collect::<Vec<_>>()
                    .join(", ")
            })
            .unwrap_or_else(|| "new".to_string());
        format!("{}({})", self.schema.name, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ColumnDef, SqlType};

    fn person() -> Arc<EntitySchema> {
        Arc::new(
            EntitySchema::new("person")
                .column(ColumnDef::new("id", SqlType::Int).not_null())
                .column(ColumnDef::new("name", SqlType::Text))
                .primary_key(&["id"]),
        )
    }

    #[test]
    fn test_detached_object_reads() {
        let obj = Object::new(person()).with("name", "Ada").unwrap();
        assert_eq!(obj.get("name").unwrap(), &Value::Text("Ada".to_string()));
        assert!(matches!(obj.get("id"), Err(Error::NotLoaded(_))));
        assert!(matches!(obj.get("nope"), Err(Error::Schema(_))));
        assert!(!obj.is_set("id"));
    }

    #[test]
    fn test_detached_object_coerces() {
        let mut obj = Object::new(person());
        let err = obj.set("id", "abc").unwrap_err();
        assert!(err.to_string().contains("column 'id'"));
        assert!(obj.set("id", Value::Null).is_err());
    }

    #[test]
    fn test_state_follows_changes() {
        let schema = person();
        let committed = vec![
            schema.columns[0].variable().with_value(1).unwrap(),
            schema.columns[1].variable().with_value("Ada").unwrap(),
        ];
        let mut info = ObjectInfo::loaded(schema, committed);
        assert_eq!(info.state(), ObjectState::Clean);
        info.pending[1].set("Grace").unwrap();
        assert_eq!(info.state(), ObjectState::Dirty);
        assert_eq!(info.changed(), vec![1]);
        info.pending[1].set("Ada").unwrap();
        assert_eq!(info.state(), ObjectState::Clean);
        assert_eq!(info.describe(), "person(int 1)");
    }

    #[test]
    fn test_nan_matching_committed_is_clean() {
        let schema = Arc::new(
            EntitySchema::new("sample")
                .column(ColumnDef::new("id", SqlType::Int).not_null())
                .column(ColumnDef::new("x", SqlType::Float))
                .primary_key(&["id"]),
        );
        let committed = vec![
            schema.columns[0].variable().with_value(1).unwrap(),
            schema.columns[1].variable().with_value(f64::NAN).unwrap(),
        ];
        let mut info = ObjectInfo::loaded(schema, committed);
        assert_eq!(info.state(), ObjectState::Clean);
        info.pending[1].set(0.5).unwrap();
        assert_eq!(info.changed(), vec![1]);
        info.pending[1].set(f64::NAN).unwrap();
        assert!(info.changed().is_empty());
    }

    #[test]
    fn test_undefined_pending_is_not_a_change() {
        let schema = person();
        let committed = vec![
            schema.columns[0].variable().with_value(1).unwrap(),
            schema.columns[1].variable(),
        ];
        let info = ObjectInfo::loaded(schema, committed);
        assert!(info.changed().is_empty());
        assert_eq!(info.committed_key(), Some(vec![Value::Int(1)]));
    }
}
