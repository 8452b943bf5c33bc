//! Core types and traits for keel.
//!
//! This crate provides the foundations shared by the query compiler, the
//! Store and the backends:
//!
//! - [`Value`] and [`Variable`] for typed, nullable, possibly-undefined values
//! - [`SqlType`] coercion rules and wire codecs
//! - [`DialectProfile`] describing how a backend family spells SQL
//! - [`EntitySchema`] / [`SchemaRegistry`] mapping descriptors
//! - the synchronous [`Connection`] trait

pub mod codec;
pub mod connection;
pub mod dialect;
pub mod error;
pub mod row;
pub mod schema;
pub mod types;
pub mod value;
pub mod variable;

pub use connection::{Connection, ExecResult};
pub use dialect::{DialectProfile, KeyStrategy, PlaceholderStyle};
pub use error::{
    CompileError, ConnectionError, ConnectionErrorKind, Error, FlushCycleError, NotLoadedError,
    QueryError, QueryErrorKind, Result, SchemaError, StaleObjectError, TypeMismatchError,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use schema::{Cardinality, ColumnDef, EntitySchema, ReferenceDef, SchemaRegistry};
pub use types::SqlType;
pub use value::Value;
pub use variable::{Variable, native_to_wire};
