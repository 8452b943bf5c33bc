//! SQLite connection implementation.
//!
//! [`SqliteConnection`] owns one `sqlite3` handle and implements the
//! synchronous [`Connection`] trait: every call prepares, binds and steps a
//! single statement, collecting result rows as wire values.

// FFI code has to match C integer types exactly
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::borrow_as_ptr)]
#![allow(clippy::result_large_err)]

use crate::ffi;
use crate::types;
use keel_core::{
    ColumnInfo, Connection, ConnectionError, ConnectionErrorKind, DialectProfile, Error,
    ExecResult, KeyStrategy, QueryError, QueryErrorKind, Result, Row, Value,
};
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString, c_int};
use std::ptr;
use std::sync::Arc;
use std::time::Instant;

/// Configuration for opening SQLite connections.
///
/// ```
/// use keel_sqlite::SqliteConfig;
///
/// let config = SqliteConfig::from_json(r#"{"path": "app.db"}"#).unwrap();
/// assert_eq!(config.path, "app.db");
/// assert!(config.foreign_keys);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:".
    pub path: String,
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds; 0 disables it.
    pub busy_timeout_ms: u32,
    /// Run `PRAGMA foreign_keys = ON` after opening.
    pub foreign_keys: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    pub read_only: bool,
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Interpret the path as a URI.
    pub uri: bool,
    pub no_mutex: bool,
    pub full_mutex: bool,
}

impl OpenFlags {
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Read-write access to an existing database.
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }
        if self.no_mutex {
            flags |= ffi::SQLITE_OPEN_NOMUTEX;
        }
        if self.full_mutex {
            flags |= ffi::SQLITE_OPEN_FULLMUTEX;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
        }
    }
}

impl SqliteConfig {
    /// Config for a file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn memory() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn foreign_keys(mut self, enabled: bool) -> Self {
        self.foreign_keys = enabled;
        self
    }
}

/// A connection to a SQLite database.
///
/// Inserts report generated keys through `RETURNING` by default; switch to
/// [`KeyStrategy::LastInsertId`] with [`with_key_strategy`](Self::with_key_strategy)
/// to have `execute` fill `generated_keys` from `sqlite3_last_insert_rowid`.
pub struct SqliteConnection {
    /// Null once closed.
    db: *mut ffi::sqlite3,
    path: String,
    dialect: DialectProfile,
    in_transaction: bool,
}

// SAFETY: the handle is owned exclusively and only used through `&mut self`
// or read-only calls; SQLite's default serialized threading mode allows
// moving a connection between threads.
unsafe impl Send for SqliteConnection {}

/// A prepared statement, finalized on drop.
struct Statement {
    raw: *mut ffi::sqlite3_stmt,
}

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: raw came from sqlite3_prepare_v2 and is finalized once
        unsafe {
            ffi::sqlite3_finalize(self.raw);
        }
    }
}

impl SqliteConnection {
    /// Open a connection with the given configuration.
    pub fn open(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::BackendUnavailable(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: "invalid path: contains null byte".to_string(),
                source: None,
            })
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: valid pointers; the result code is checked below
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let message = if db.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: sqlite3_open_v2 allocates a handle even on failure;
                // it must be closed after reading the message
                unsafe {
                    let message = errmsg(db);
                    ffi::sqlite3_close(db);
                    message
                }
            };
            tracing::warn!(path = %config.path, error = %message, "Failed to open SQLite database");
            return Err(Error::BackendUnavailable(ConnectionError {
                kind: ConnectionErrorKind::Connect,
                message: format!("failed to open database '{}': {}", config.path, message),
                source: None,
            }));
        }

        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX));
            }
        }

        let conn = Self {
            db,
            path: config.path.clone(),
            dialect: DialectProfile::sqlite(),
            in_transaction: false,
        };
        if config.foreign_keys {
            conn.execute_raw("PRAGMA foreign_keys = ON")?;
        }
        tracing::debug!(path = %conn.path, version = ffi::version(), "Opened SQLite database");
        Ok(conn)
    }

    pub fn open_memory() -> Result<Self> {
        Self::open(&SqliteConfig::memory())
    }

    pub fn open_file(path: impl Into<String>) -> Result<Self> {
        Self::open(&SqliteConfig::file(path))
    }

    /// Report generated keys with `strategy` instead of `RETURNING`.
    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.dialect = self.dialect.clone().with_key_strategy(strategy);
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        !self.db.is_null()
    }

    fn handle(&self) -> Result<*mut ffi::sqlite3> {
        if self.db.is_null() {
            return Err(Error::BackendUnavailable(ConnectionError {
                kind: ConnectionErrorKind::Closed,
                message: format!("connection to '{}' is closed", self.path),
                source: None,
            }));
        }
        Ok(self.db)
    }

    /// Execute one or more statements without parameters (DDL, pragmas).
    pub fn execute_raw(&self, sql: &str) -> Result<()> {
        let db = self.handle()?;
        let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
        let mut message: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: all pointers are valid for the duration of the call
        let rc = unsafe { ffi::sqlite3_exec(db, c_sql.as_ptr(), None, ptr::null_mut(), &mut message) };

        if rc != ffi::SQLITE_OK {
            let message = if message.is_null() {
                ffi::error_string(rc).to_string()
            } else {
                // SAFETY: message was allocated by sqlite3_exec and is freed once
                unsafe {
                    let text = CStr::from_ptr(message).to_string_lossy().into_owned();
                    ffi::sqlite3_free(message.cast());
                    text
                }
            };
            return Err(sqlite_error(rc, message, Some(sql)));
        }
        Ok(())
    }

    /// Rowid of the most recent successful INSERT.
    pub fn last_insert_rowid(&self) -> Result<i64> {
        let db = self.handle()?;
        // SAFETY: db is valid
        Ok(unsafe { ffi::sqlite3_last_insert_rowid(db) })
    }

    /// Rows changed by the most recent INSERT, UPDATE or DELETE.
    pub fn changes(&self) -> Result<u64> {
        let db = self.handle()?;
        // SAFETY: db is valid
        let n = unsafe { ffi::sqlite3_changes(db) };
        Ok(u64::try_from(n).unwrap_or(0))
    }

    fn prepare(&self, db: *mut ffi::sqlite3, sql: &str) -> Result<Option<Statement>> {
        let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
        let mut raw: *mut ffi::sqlite3_stmt = ptr::null_mut();

        // SAFETY: all pointers are valid
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                c_sql.as_ptr(),
                c_int::try_from(c_sql.as_bytes().len()).unwrap_or(c_int::MAX),
                &mut raw,
                ptr::null_mut(),
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(last_error(db, rc, sql));
        }
        // Whitespace or a bare comment compiles to no statement
        Ok((!raw.is_null()).then_some(Statement { raw }))
    }
}

impl Drop for SqliteConnection {
    fn drop(&mut self) {
        if !self.db.is_null() {
            // SAFETY: db is valid and not used after this point
            unsafe {
                ffi::sqlite3_close_v2(self.db);
            }
        }
    }
}

impl Connection for SqliteConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        let start = Instant::now();
        let db = self.handle()?;
        let Some(stmt) = self.prepare(db, sql)? else {
            return Ok(ExecResult::default());
        };

        // SAFETY: stmt is valid
        let expected = unsafe { ffi::sqlite3_bind_parameter_count(stmt.raw) };
        if usize::try_from(expected).unwrap_or(0) != params.len() {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: Some(sql.to_string()),
                message: format!("expected {} parameters, got {}", expected, params.len()),
                source: None,
            }));
        }
        for (i, param) in params.iter().enumerate() {
            let index = c_int::try_from(i + 1).unwrap_or(c_int::MAX);
            // SAFETY: stmt is valid and index is within the parameter count
            let rc = unsafe { types::bind_value(stmt.raw, index, param) };
            if rc != ffi::SQLITE_OK {
                return Err(last_error(db, rc, sql));
            }
        }

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.raw) };
        let columns = if col_count > 0 {
            let names = (0..col_count)
                // SAFETY: i is a valid column index
                .map(|i| unsafe { types::column_name(stmt.raw, i) }.unwrap_or_else(|| format!("col{}", i)))
                .collect();
            Some(Arc::new(ColumnInfo::new(names)))
        } else {
            None
        };

        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            let rc = unsafe { ffi::sqlite3_step(stmt.raw) };
            match rc {
                ffi::SQLITE_ROW => {
                    let values = (0..col_count)
                        // SAFETY: the statement is positioned on a row
                        .map(|i| unsafe { types::read_column(stmt.raw, i) })
                        .collect();
                    if let Some(columns) = &columns {
                        rows.push(Row::with_columns(Arc::clone(columns), values));
                    }
                }
                ffi::SQLITE_DONE => break,
                _ => return Err(last_error(db, rc, sql)),
            }
        }

        // SAFETY: stmt is valid
        let read_only = unsafe { ffi::sqlite3_stmt_readonly(stmt.raw) } != 0;
        drop(stmt);

        let mut result = ExecResult::with_rows(rows);
        if !read_only {
            result.row_count = self.changes()?;
            if self.dialect.key_strategy == KeyStrategy::LastInsertId && is_insert(sql) {
                result.generated_keys.push(Value::Int(self.last_insert_rowid()?));
            }
        }

        tracing::trace!(
            sql = %sql,
            params = params.len(),
            rows = result.rows.len(),
            affected = result.row_count,
            elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX),
            "SQLite statement"
        );
        Ok(result)
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: None,
                message: "already in a transaction".to_string(),
                source: None,
            }));
        }
        self.execute_raw("BEGIN")?;
        self.in_transaction = true;
        tracing::debug!(path = %self.path, "BEGIN");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Err(Error::Query(QueryError {
                kind: QueryErrorKind::Database,
                sql: None,
                message: "not in a transaction".to_string(),
                source: None,
            }));
        }
        self.execute_raw("COMMIT")?;
        self.in_transaction = false;
        tracing::debug!(path = %self.path, "COMMIT");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        let db = self.handle()?;
        self.in_transaction = false;
        // SQLite rolls back by itself after some errors; ROLLBACK would then
        // fail with "no transaction is active"
        // SAFETY: db is valid
        if unsafe { ffi::sqlite3_get_autocommit(db) } != 0 {
            tracing::debug!(path = %self.path, "No transaction to roll back");
            return Ok(());
        }
        self.execute_raw("ROLLBACK")?;
        tracing::debug!(path = %self.path, "ROLLBACK");
        Ok(())
    }

    fn dialect_profile(&self) -> DialectProfile {
        self.dialect.clone()
    }

    fn close(&mut self) -> Result<()> {
        if self.db.is_null() {
            return Ok(());
        }
        // SAFETY: db is valid; close_v2 defers the real close until every
        // statement is finalized
        let rc = unsafe { ffi::sqlite3_close_v2(self.db) };
        self.db = ptr::null_mut();
        self.in_transaction = false;
        if rc != ffi::SQLITE_OK {
            return Err(sqlite_error(rc, ffi::error_string(rc).to_string(), None));
        }
        tracing::debug!(path = %self.path, "Closed SQLite database");
        Ok(())
    }
}

fn is_insert(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("insert"))
}

fn null_byte(sql: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Syntax,
        sql: Some(sql.to_string()),
        message: "SQL contains null byte".to_string(),
        source: None,
    })
}

/// # Safety
/// `db` must be a valid handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: sqlite3_errmsg never returns null for a valid handle
    unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)).to_string_lossy().into_owned() }
}

fn last_error(db: *mut ffi::sqlite3, rc: c_int, sql: &str) -> Error {
    // SAFETY: callers pass the handle the failing call ran on
    let message = unsafe { errmsg(db) };
    let code = if rc == ffi::SQLITE_OK || rc == ffi::SQLITE_ROW {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_errcode(db) }
    } else {
        rc
    };
    sqlite_error(code, message, Some(sql))
}

/// Map a SQLite result code to the error taxonomy. Codes meaning the
/// database file itself is unusable become `BackendUnavailable`.
fn sqlite_error(code: c_int, message: String, sql: Option<&str>) -> Error {
    let kind = match ffi::primary_code(code) {
        ffi::SQLITE_CANTOPEN | ffi::SQLITE_NOTADB | ffi::SQLITE_IOERR | ffi::SQLITE_CORRUPT => {
            return Error::BackendUnavailable(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message,
                source: None,
            });
        }
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        ffi::SQLITE_BUSY | ffi::SQLITE_LOCKED => QueryErrorKind::Busy,
        ffi::SQLITE_NOTFOUND => QueryErrorKind::NotFound,
        ffi::SQLITE_ERROR if message.contains("syntax error") => QueryErrorKind::Syntax,
        ffi::SQLITE_ERROR if message.starts_with("no such") => QueryErrorKind::NotFound,
        _ => QueryErrorKind::Database,
    };
    Error::Query(QueryError {
        kind,
        sql: sql.map(str::to_string),
        message,
        source: None,
    })
}
