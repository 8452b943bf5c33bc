//! The subset of libsqlite3 used by the driver.
//!
//! Bindings come from `libsqlite3-sys`; this module narrows them to what the
//! connection needs and adds a few safe helpers.

use std::ffi::{CStr, c_int};

pub use libsqlite3_sys::{
    SQLITE_BLOB, SQLITE_BUSY, SQLITE_CANTOPEN, SQLITE_CONSTRAINT, SQLITE_CORRUPT, SQLITE_DONE,
    SQLITE_ERROR, SQLITE_FLOAT, SQLITE_INTEGER, SQLITE_IOERR, SQLITE_LOCKED, SQLITE_MISUSE,
    SQLITE_NOTADB, SQLITE_NOTFOUND, SQLITE_NULL, SQLITE_OK, SQLITE_OPEN_CREATE,
    SQLITE_OPEN_FULLMUTEX, SQLITE_OPEN_NOMUTEX, SQLITE_OPEN_READONLY, SQLITE_OPEN_READWRITE,
    SQLITE_OPEN_URI, SQLITE_RANGE, SQLITE_ROW, SQLITE_TEXT, SQLITE_TRANSIENT, sqlite3,
    sqlite3_bind_blob, sqlite3_bind_double, sqlite3_bind_int64, sqlite3_bind_null,
    sqlite3_bind_parameter_count, sqlite3_bind_text, sqlite3_busy_timeout, sqlite3_changes,
    sqlite3_close, sqlite3_column_blob, sqlite3_column_bytes,
    sqlite3_column_count, sqlite3_column_double, sqlite3_column_int64, sqlite3_column_name,
    sqlite3_column_text, sqlite3_column_type, sqlite3_errcode, sqlite3_errmsg, sqlite3_errstr,
    sqlite3_exec, sqlite3_finalize, sqlite3_free, sqlite3_get_autocommit,
    sqlite3_last_insert_rowid, sqlite3_libversion, sqlite3_libversion_number, sqlite3_open_v2,
    sqlite3_prepare_v2, sqlite3_step, sqlite3_stmt, sqlite3_stmt_readonly,
};

// libsqlite3-sys does not export `sqlite3_close_v2`; the symbol is provided by
// the linked (bundled) SQLite library.
unsafe extern "C" {
    pub fn sqlite3_close_v2(db: *mut sqlite3) -> c_int;
}

/// Version string of the linked SQLite library.
pub fn version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a pointer to a static string
    unsafe {
        CStr::from_ptr(sqlite3_libversion())
            .to_str()
            .unwrap_or("unknown")
    }
}

/// Version number of the linked SQLite library, e.g. 3045000 for 3.45.0.
pub fn version_number() -> i32 {
    // SAFETY: no arguments, always safe to call
    unsafe { sqlite3_libversion_number() }
}

/// English description of a result code.
pub fn error_string(code: c_int) -> &'static str {
    // SAFETY: sqlite3_errstr returns a static string for every code
    unsafe {
        CStr::from_ptr(sqlite3_errstr(code))
            .to_str()
            .unwrap_or("unknown error")
    }
}

/// Primary result code with the extended bits stripped.
pub fn primary_code(code: c_int) -> c_int {
    code & 0xff
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        let v = version();
        assert!(v.starts_with('3'));
        assert!(version_number() >= 3_000_000);
    }

    #[test]
    fn test_error_string() {
        assert_eq!(error_string(SQLITE_OK), "not an error");
        assert_eq!(error_string(SQLITE_BUSY), "database is locked");
        assert_eq!(error_string(SQLITE_CONSTRAINT), "constraint failed");
    }

    #[test]
    fn test_primary_code() {
        // SQLITE_CONSTRAINT_UNIQUE
        assert_eq!(primary_code(2067), SQLITE_CONSTRAINT);
        assert_eq!(primary_code(SQLITE_ROW), SQLITE_ROW);
    }
}
