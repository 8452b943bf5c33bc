//! Typed attribute access on top of the untyped Store API.
//!
//! [`entity!`](crate::entity) declares a handle type per entity with one
//! [`Attr`] per column:
//!
//! ```ignore
//! keel_store::entity! {
//!     pub struct Person("person") {
//!         id: i64,
//!         name: String,
//!         manager_id: Option<i64>,
//!     }
//! }
//!
//! let ada = Person::cast(&store, id)?;
//! let name: String = Person::name().get(&mut store, ada)?;
//! Person::name().set(&mut store, ada, "Ada L.".to_string())?;
//! ```

use crate::arena::ObjectId;
use crate::object::Object;
use crate::store::Store;
use keel_core::{Connection, Error, FromValue, Result, Value};
use std::marker::PhantomData;

/// A column of an entity, read and written as `T`.
pub struct Attr<T> {
    column: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Attr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Attr<T> {}

impl<T> std::fmt::Debug for Attr<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Attr").field(&self.column).finish()
    }
}

impl<T: FromValue + Into<Value>> Attr<T> {
    pub const fn new(column: &'static str) -> Self {
        Self {
            column,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.column
    }

    /// Read through the Store, loading the column if needed.
    pub fn get<C: Connection>(&self, store: &mut Store<C>, id: impl Into<ObjectId>) -> Result<T> {
        let value = store.get_value(id.into(), self.column)?;
        T::from_value(&value).map_err(|e| e.in_column(self.column))
    }

    pub fn set<C: Connection>(
        &self,
        store: &mut Store<C>,
        id: impl Into<ObjectId>,
        value: T,
    ) -> Result<()> {
        store.set_value(id.into(), self.column, value)
    }

    /// Read from an object that is not tracked yet.
    pub fn read(&self, object: &Object) -> Result<T> {
        T::from_value(object.get(self.column)?).map_err(|e| e.in_column(self.column))
    }

    pub fn assign(&self, object: &mut Object, value: T) -> Result<()> {
        object.set(self.column, value)
    }
}

/// A handle type bound to one entity.
pub trait TypedObject: Copy + Into<ObjectId> {
    /// Registered entity name.
    const ENTITY: &'static str;

    #[doc(hidden)]
    fn from_id_unchecked(id: ObjectId) -> Self;

    fn object_id(self) -> ObjectId {
        self.into()
    }

    /// Wrap `id` after checking that it is a live object of this entity.
    fn cast<C: Connection>(store: &Store<C>, id: ObjectId) -> Result<Self> {
        let entity = store.entity_of(id)?;
        if entity != Self::ENTITY {
            return Err(Error::schema(
                Some(entity),
                format!("expected an object of {}", Self::ENTITY),
            ));
        }
        Ok(Self::from_id_unchecked(id))
    }

    /// A blank detached object of this entity.
    fn blank<C: Connection>(store: &Store<C>) -> Result<Object> {
        store.object(Self::ENTITY)
    }
}

/// Declare a typed handle for an entity registered under `$entity`.
///
/// Each field becomes an associated function returning an [`Attr`] for the
/// column of the same name.
#[macro_export]
macro_rules! entity {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident($entity:literal) {
            $($field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        $vis struct $name($crate::ObjectId);

        impl $name {
            $(
                #[allow(dead_code)]
                pub fn $field() -> $crate::Attr<$ty> {
                    $crate::Attr::new(stringify!($field))
                }
            )*
        }

        impl $crate::TypedObject for $name {
            const ENTITY: &'static str = $entity;

            fn from_id_unchecked(id: $crate::ObjectId) -> Self {
                $name(id)
            }
        }

        impl From<$name> for $crate::ObjectId {
            fn from(handle: $name) -> Self {
                handle.0
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ColumnDef, EntitySchema, SqlType};
    use std::sync::Arc;

    crate::entity! {
        struct Person("person") {
            id: i64,
            name: String,
            nickname: Option<String>,
        }
    }

    fn person() -> Arc<EntitySchema> {
        Arc::new(
            EntitySchema::new("person")
                .column(ColumnDef::new("id", SqlType::Int).not_null())
                .column(ColumnDef::new("name", SqlType::Text))
                .column(ColumnDef::new("nickname", SqlType::Text))
                .primary_key(&["id"]),
        )
    }

    #[test]
    fn test_attr_on_detached_object() {
        let mut obj = Object::new(person());
        Person::name().assign(&mut obj, "Ada".to_string()).unwrap();
        Person::nickname().assign(&mut obj, None).unwrap();
        assert_eq!(Person::name().read(&obj).unwrap(), "Ada");
        assert_eq!(Person::nickname().read(&obj).unwrap(), None);
        assert!(matches!(Person::id().read(&obj), Err(Error::NotLoaded(_))));
    }

    #[test]
    fn test_attr_reports_column_on_mismatch() {
        let obj = Object::new(person()).with("name", "Ada").unwrap();
        let wrong: Attr<i64> = Attr::new("name");
        let err = wrong.read(&obj).unwrap_err();
        assert!(err.to_string().contains("name"));
        assert_eq!(Person::ENTITY, "person");
        assert_eq!(Person::name().name(), "name");
    }
}
