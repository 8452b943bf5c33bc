//! Reference resolution between tracked objects.
//!
//! A one-to-one reference is backed by local foreign-key columns. The first
//! read resolves it through the target entity's key and caches the handle on
//! the source object together with the key values it came from, so a later
//! change to those columns is noticed. Assigning an object that has no key
//! yet records a link instead; the flush copies the key once the target is
//! inserted.

use crate::arena::ObjectId;
use crate::object::Lifecycle;
use crate::store::Store;
use keel_core::{Cardinality, Connection, Error, ReferenceDef, Result, Value};
use keel_query::{Expr, Table};

impl<C: Connection> Store<C> {
    fn reference_of(
        &self,
        id: ObjectId,
        name: &str,
        cardinality: Cardinality,
    ) -> Result<ReferenceDef> {
        let info = self.info(id)?;
        let def = info.schema.reference_def(name).ok_or_else(|| {
            Error::schema(
                Some(&info.schema.name),
                format!("no reference named '{}'", name),
            )
        })?;
        if def.cardinality != cardinality {
            let wanted = match cardinality {
                Cardinality::OneToOne => "reference()/set_reference()",
                Cardinality::OneToMany => "related()",
            };
            return Err(Error::Feature(format!(
                "'{}' has the wrong cardinality for {}",
                name, wanted
            )));
        }
        Ok(def.clone())
    }

    fn is_live(&self, id: ObjectId) -> bool {
        self.info(id)
            .is_ok_and(|info| info.lifecycle != Lifecycle::Removing)
    }

    /// Resolve a one-to-one reference. `None` when any foreign-key column is
    /// NULL or no target row exists.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn reference(&mut self, id: ObjectId, name: &str) -> Result<Option<ObjectId>> {
        let def = self.reference_of(id, name, Cardinality::OneToOne)?;
        if let Some(&target) = self.info(id)?.links.get(name) {
            if self.is_live(target) {
                return Ok(Some(target));
            }
        }

        let mut local = Vec::with_capacity(def.local.len());
        for column in &def.local {
            let value = self.get_value(id, column)?;
            if value.is_null() {
                return Ok(None);
            }
            local.push(value);
        }

        if let Some((values, target)) = self.info(id)?.ref_cache.get(name) {
            if *values == local && self.is_live(*target) {
                tracing::trace!(reference = %name, "Reference cache hit");
                return Ok(Some(*target));
            }
        }

        let target_schema = self.schema(&def.target)?;
        let found = if def.remote == target_schema.primary_key {
            self.get(&def.target, &local)?
        } else {
            let table = Table::new(target_schema.table.clone());
            let predicate = def
                .remote
                .iter()
                .zip(&local)
                .map(|(column, value)| {
                    let ty = target_schema
                        .column_def(column)
                        .map(|c| c.sql_type);
                    let col = match ty {
                        Some(ty) => table.typed(column.clone(), ty),
                        None => table.column(column.clone()),
                    };
                    col.eq(Expr::Param(value.clone()))
                })
                .fold(Expr::Undef, |acc, e| acc.and(e));
            self.find(&def.target, predicate)?.one()?
        };

        let info = self.info_mut(id)?;
        match found {
            Some(target) => {
                info.ref_cache.insert(name.to_string(), (local, target));
            }
            None => {
                info.ref_cache.remove(name);
            }
        }
        Ok(found)
    }

    /// Point a one-to-one reference at `target`, or clear it with `None`.
    ///
    /// The foreign-key columns are copied from the target's key when it has
    /// one; otherwise they are filled in when the target is flushed.
    pub fn set_reference(
        &mut self,
        id: ObjectId,
        name: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let def = self.reference_of(id, name, Cardinality::OneToOne)?;
        let Some(target) = target else {
            for column in &def.local {
                self.set_value(id, column, Value::Null)?;
            }
            return Ok(());
        };

        let target_info = self.info(target).map_err(|e| match e {
            Error::WrongStore(_) => Error::WrongStore(format!(
                "cannot reference {} from another store",
                target
            )),
            other => other,
        })?;
        if target_info.entity() != def.target {
            return Err(Error::schema(
                Some(target_info.entity()),
                format!("reference '{}' expects {}", name, def.target),
            ));
        }
        let known: Option<Vec<Value>> = def
            .remote
            .iter()
            .map(|column| {
                let idx = target_info.schema.column_index(column)?;
                target_info.pending[idx].get().cloned()
            })
            .collect();
        let target_new = target_info.lifecycle == Lifecycle::New;

        match known {
            Some(values) if !target_new => {
                for (column, value) in def.local.iter().zip(&values) {
                    self.set_value(id, column, value.clone())?;
                }
                self.info_mut(id)?
                    .ref_cache
                    .insert(name.to_string(), (values, target));
            }
            _ => {
                let info = self.info_mut(id)?;
                info.ref_cache.remove(name);
                info.links.insert(name.to_string(), target);
                self.touch(id);
                tracing::debug!(object = %id, target = %target, reference = %name, "Linked to unsaved object");
            }
        }
        Ok(())
    }

    /// Objects on the many side of a one-to-many reference. Not cached.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn related(&mut self, id: ObjectId, name: &str) -> Result<Vec<ObjectId>> {
        let def = self.reference_of(id, name, Cardinality::OneToMany)?;
        let mut local = Vec::with_capacity(def.local.len());
        for column in &def.local {
            let value = self.get_value(id, column)?;
            if value.is_null() {
                return Ok(Vec::new());
            }
            local.push(value);
        }
        let target_schema = self.schema(&def.target)?;
        let table = Table::new(target_schema.table.clone());
        let mut predicate = Expr::Undef;
        for (column, value) in def.remote.iter().zip(local) {
            let idx = target_schema.require_column(column)?;
            let ty = target_schema.columns[idx].sql_type;
            predicate = predicate.and(table.typed(column.clone(), ty).eq(Expr::Param(value)));
        }
        self.find(&def.target, predicate)?.all()
    }
}
