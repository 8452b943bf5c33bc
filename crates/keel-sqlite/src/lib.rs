//! SQLite backend for keel.
//!
//! [`SqliteConnection`] implements the synchronous
//! [`Connection`](keel_core::Connection) trait over libsqlite3, so a
//! `Store` can run on it directly.
//!
//! # Example
//!
//! ```rust,ignore
//! use keel_core::{Connection, Value};
//! use keel_sqlite::SqliteConnection;
//!
//! let mut conn = SqliteConnection::open_memory()?;
//! conn.execute_raw("CREATE TABLE person (id INTEGER PRIMARY KEY, name TEXT)")?;
//!
//! let result = conn.execute(
//!     "INSERT INTO person (name) VALUES (?) RETURNING id",
//!     &[Value::Text("Ada".into())],
//! )?;
//! assert_eq!(result.scalar(), Some(&Value::Int(1)));
//! ```
//!
//! # Type Mapping
//!
//! Parameters arrive as wire values:
//!
//! | Wire value | SQLite storage class |
//! |------------|----------------------|
//! | `Bool` | INTEGER (0/1) |
//! | `Int` | INTEGER |
//! | `Float` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Null` | NULL |
//!
//! Dates, times, decimals, UUIDs and JSON are stored as TEXT in their
//! canonical encodings. Results come back as `Int`, `Float`, `Text`, `Bytes`
//! or `Null`; the column's `Variable` decodes them.

#![allow(unsafe_code)]

pub mod connection;
pub mod ffi;
pub mod types;

pub use connection::{OpenFlags, SqliteConfig, SqliteConnection};

/// Version string of the linked SQLite library.
pub fn sqlite_version() -> &'static str {
    ffi::version()
}

pub fn sqlite_version_number() -> i32 {
    ffi::version_number()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlite_version() {
        let version = sqlite_version();
        assert!(
            version.starts_with('3'),
            "Expected SQLite 3.x, got {}",
            version
        );
        // RETURNING needs 3.35
        assert!(sqlite_version_number() >= 3_035_000);
    }
}
