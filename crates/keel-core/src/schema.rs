//! Resolved mapping descriptors.
//!
//! A mapping layer outside this crate produces one [`EntitySchema`] per
//! mapped entity: its table, ordered columns, primary key and references.
//! Descriptors can be built in code or deserialized from JSON, and are
//! validated when registered in a [`SchemaRegistry`].

use crate::error::{Error, Result};
use crate::types::SqlType;
use crate::variable::Variable;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

fn default_true() -> bool {
    true
}

/// A mapped column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: SqlType,
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Accept lossy coercions when the application assigns values.
    #[serde(default)]
    pub lossy: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: true,
            lossy: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn lossy(mut self) -> Self {
        self.lossy = true;
        self
    }

    /// Create an undefined [`Variable`] for this column.
    pub fn variable(&self) -> Variable {
        let var = Variable::new(self.sql_type).lossy(self.lossy);
        if self.nullable { var } else { var.not_null() }
    }
}

/// Reference cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// Local foreign-key columns point at one target row.
    OneToOne,
    /// Target rows point back at the local key.
    OneToMany,
}

/// Foreign-key backed relationship between two entities.
///
/// For [`Cardinality::OneToOne`], `local` are foreign-key columns on this
/// entity and `remote` the target's key columns. For
/// [`Cardinality::OneToMany`], `local` are this entity's key columns and
/// `remote` the target's foreign-key columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDef {
    pub name: String,
    pub local: Vec<String>,
    pub target: String,
    pub remote: Vec<String>,
    pub cardinality: Cardinality,
}

impl ReferenceDef {
    pub fn one(
        name: impl Into<String>,
        local: &[&str],
        target: impl Into<String>,
        remote: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            local: local.iter().map(|s| (*s).to_string()).collect(),
            target: target.into(),
            remote: remote.iter().map(|s| (*s).to_string()).collect(),
            cardinality: Cardinality::OneToOne,
        }
    }

    pub fn many(
        name: impl Into<String>,
        local: &[&str],
        target: impl Into<String>,
        remote: &[&str],
    ) -> Self {
        Self {
            cardinality: Cardinality::OneToMany,
            ..Self::one(name, local, target, remote)
        }
    }
}

/// Resolved descriptor for one mapped entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchema {
    pub name: String,
    pub table: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub references: Vec<ReferenceDef>,
}

impl EntitySchema {
    /// Start a descriptor whose table has the same name as the entity.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            columns: Vec::new(),
            primary_key: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|s| (*s).to_string()).collect();
        self
    }

    pub fn reference(mut self, reference: ReferenceDef) -> Self {
        self.references.push(reference);
        self
    }

    /// Position of a column in declaration order.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_def(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Indices of the primary-key columns, in key order.
    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.primary_key
            .iter()
            .filter_map(|name| self.column_index(name))
            .collect()
    }

    pub fn is_primary_key(&self, index: usize) -> bool {
        self.primary_key
            .iter()
            .any(|name| self.column_index(name) == Some(index))
    }

    pub fn reference_def(&self, name: &str) -> Option<&ReferenceDef> {
        self.references.iter().find(|r| r.name == name)
    }

    /// Column index or a schema error naming the entity.
    pub fn require_column(&self, name: &str) -> Result<usize> {
        self.column_index(name).ok_or_else(|| {
            Error::schema(Some(&self.name), format!("unknown column '{}'", name))
        })
    }

    fn validate_self(&self) -> Result<()> {
        let fail = |msg: String| Err(Error::schema(Some(&self.name), msg));
        if self.columns.is_empty() {
            return fail("entity has no columns".to_string());
        }
        for (i, col) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return fail(format!("duplicate column '{}'", col.name));
            }
        }
        if self.primary_key.is_empty() {
            return fail("primary key is empty".to_string());
        }
        for pk in &self.primary_key {
            if self.column_index(pk).is_none() {
                return fail(format!("primary key column '{}' does not exist", pk));
            }
        }
        for r in &self.references {
            if r.local.is_empty() || r.local.len() != r.remote.len() {
                return fail(format!(
                    "reference '{}' has mismatched column lists",
                    r.name
                ));
            }
            for col in &r.local {
                if self.column_index(col).is_none() {
                    return fail(format!(
                        "reference '{}' uses unknown column '{}'",
                        r.name, col
                    ));
                }
            }
        }
        Ok(())
    }
}

/// The set of entity descriptors a Store works with.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, Arc<EntitySchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a validated registry from a list of descriptors.
    pub fn from_entities(entities: impl IntoIterator<Item = EntitySchema>) -> Result<Self> {
        let mut registry = Self::new();
        for entity in entities {
            registry.insert_unchecked(entity)?;
        }
        registry.validate_references()?;
        Ok(registry)
    }

    /// Load a registry from a JSON array of descriptors.
    pub fn from_json(json: &str) -> Result<Self> {
        let entities: Vec<EntitySchema> = serde_json::from_str(json)?;
        Self::from_entities(entities)
    }

    /// Add one descriptor. References must point at registered entities or
    /// at the entity itself.
    pub fn register(&mut self, entity: EntitySchema) -> Result<()> {
        let name = entity.name.clone();
        self.insert_unchecked(entity)?;
        if let Err(err) = self.validate_references() {
            self.entities.remove(&name);
            return Err(err);
        }
        Ok(())
    }

    fn insert_unchecked(&mut self, entity: EntitySchema) -> Result<()> {
        entity.validate_self()?;
        if self.entities.contains_key(&entity.name) {
            return Err(Error::schema(
                Some(&entity.name),
                "entity is already registered",
            ));
        }
        self.entities.insert(entity.name.clone(), Arc::new(entity));
        Ok(())
    }

    fn validate_references(&self) -> Result<()> {
        for entity in self.entities.values() {
            for r in &entity.references {
                let Some(target) = self.entities.get(&r.target) else {
                    return Err(Error::schema(
                        Some(&entity.name),
                        format!("reference '{}' targets unknown entity '{}'", r.name, r.target),
                    ));
                };
                for col in &r.remote {
                    if target.column_index(col).is_none() {
                        return Err(Error::schema(
                            Some(&entity.name),
                            format!(
                                "reference '{}' uses unknown column '{}.{}'",
                                r.name, r.target, col
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<&Arc<EntitySchema>> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::schema(None, format!("unknown entity '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
