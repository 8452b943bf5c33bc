//! Identity Map pattern for tracking unique object instances per primary key.
//!
//! The Identity Map ensures that each database row corresponds to exactly one
//! object instance within a Store. This provides:
//!
//! - **Uniqueness**: the same key always resolves to the same [`ObjectId`]
//! - **Cache**: lookups by key avoid a round trip to the backend
//! - **Consistency**: changes to an object are visible through every handle
//!
//! # Design
//!
//! The map does not own objects. It stores handles into the Store's arena,
//! and the Store evicts entries explicitly when an object is deleted, rolled
//! back or the Store is closed.

use crate::arena::ObjectId;
use keel_core::Value;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// `(entity, primary key)` pair identifying one row.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    entity: String,
    key: Vec<Value>,
}

impl IdentityKey {
    pub fn new(entity: impl Into<String>, key: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            key,
        }
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn values(&self) -> &[Value] {
        &self.key
    }
}

// Floats compare by bit pattern so that equality agrees with `Value`'s hash.
pub(crate) fn same_value(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Float(x), Value::Float(y)) => x.to_bits() == y.to_bits(),
        _ => a == b,
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity
            && self.key.len() == other.key.len()
            && self.key.iter().zip(&other.key).all(|(a, b)| same_value(a, b))
    }
}

impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.key.hash(state);
    }
}

/// Maps `(entity, primary key)` to exactly one live object.
#[derive(Debug, Clone, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, ObjectId>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<ObjectId> {
        self.entries.get(key).copied()
    }

    pub fn contains(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Register `id` under `key`, returning the object previously there.
    pub fn insert(&mut self, key: IdentityKey, id: ObjectId) -> Option<ObjectId> {
        self.entries.insert(key, id)
    }

    /// Remove `key` only if it still maps to `id`.
    pub fn remove(&mut self, key: &IdentityKey, id: ObjectId) -> bool {
        if self.entries.get(key) == Some(&id) {
            self.entries.remove(key);
            true
        } else {
            false
        }
    }

    /// Return the registered object, or materialize one with `loader` and
    /// register it.
    pub fn get_or_create<E>(
        &mut self,
        key: IdentityKey,
        loader: impl FnOnce() -> Result<ObjectId, E>,
    ) -> Result<(ObjectId, bool), E> {
        if let Some(id) = self.entries.get(&key) {
            return Ok((*id, false));
        }
        let id = loader()?;
        self.entries.insert(key, id);
        Ok((id, true))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&IdentityKey, ObjectId)> {
        self.entries.iter().map(|(k, id)| (k, *id))
    }
}
