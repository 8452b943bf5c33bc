//! keel - an object tracking and flush engine for relational databases.
//!
//! Application code works with tracked objects in a [`Store`]; the Store
//! keeps one live object per primary key, records attribute changes, and on
//! flush writes them back as INSERT, UPDATE and DELETE statements ordered
//! over foreign-key references. Statements are built as [`Expr`] trees and
//! compiled for the connection's [`DialectProfile`].
//!
//! # Quick Start
//!
//! ```ignore
//! use keel::prelude::*;
//!
//! let registry = SchemaRegistry::from_entities([EntitySchema::new("person")
//!     .column(ColumnDef::new("id", SqlType::Int).not_null())
//!     .column(ColumnDef::new("name", SqlType::Text))
//!     .primary_key(&["id"])])?;
//!
//! let conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT)")?;
//! let mut store = Store::new(conn, Arc::new(registry), StoreConfig::default());
//!
//! // INSERT INTO person (name) VALUES (?) RETURNING id
//! let ada = store.add(store.object("person")?.with("name", "Ada")?)?;
//! store.flush()?;
//!
//! // UPDATE person SET name = ? WHERE id = ?
//! store.set_value(ada, "name", "Ada L.")?;
//! store.commit()?;
//!
//! let name = store.column("person", "name")?;
//! let found = store.find("person", name.eq("Ada L."))?.one()?;
//! assert_eq!(found, Some(ada));
//! ```
//!
//! # Crates
//!
//! - `keel-core`: values, variables, schema descriptors, errors and the
//!   [`Connection`] trait.
//! - `keel-query`: the expression tree and the SQL compiler.
//! - `keel-store`: the identity map, change tracking and the flush engine.
//! - `keel-sqlite` (feature `sqlite`, on by default): a SQLite backend.

pub use keel_core::{
    Cardinality, ColumnDef, ColumnInfo, Connection, ConnectionError, ConnectionErrorKind,
    DialectProfile, EntitySchema, Error, ExecResult, FromValue, KeyStrategy, PlaceholderStyle,
    QueryError, QueryErrorKind, ReferenceDef, Result, Row, SchemaRegistry, SqlType, Value,
    Variable,
};

pub use keel_query::{
    Column, Compiled, Compiler, Delete, Expr, Insert, Join, JoinKind, Select, Table, Update,
    compile,
};

pub use keel_store::{
    Attr, FlushReport, Object, ObjectId, ObjectState, PendingCounts, ResultSet, Store,
    StoreConfig, TableSet, TupleResultSet, TxState, TypedObject, entity,
};

#[cfg(feature = "sqlite")]
pub use keel_sqlite::{OpenFlags, SqliteConfig, SqliteConnection};

/// Open a SQLite database and wrap it in a Store.
#[cfg(feature = "sqlite")]
pub fn open_sqlite(
    sqlite: &SqliteConfig,
    registry: std::sync::Arc<SchemaRegistry>,
    config: StoreConfig,
) -> Result<Store<SqliteConnection>> {
    let conn = SqliteConnection::open(sqlite)?;
    Ok(Store::new(conn, registry, config))
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use keel::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Attr, Column, ColumnDef, Connection, EntitySchema, Error, Expr, ObjectId, ObjectState,
        ReferenceDef, Result, SchemaRegistry, SqlType, Store, StoreConfig, Table, TxState,
        TypedObject, Value, entity,
    };
    pub use std::sync::Arc;

    #[cfg(feature = "sqlite")]
    pub use crate::{SqliteConfig, SqliteConnection};
}
