//! Moving wire values in and out of prepared statements.
//!
//! SQLite has five storage classes (INTEGER, REAL, TEXT, BLOB, NULL). The
//! wire forms produced by `Variable::wire` already fit them; anything richer
//! is passed through `native_to_wire` first.

#![allow(clippy::cast_possible_truncation)]

use crate::ffi;
use keel_core::{Value, native_to_wire};
use std::ffi::{CStr, c_int};

/// Bind one parameter and return the SQLite result code.
///
/// # Safety
/// `stmt` must be a valid prepared statement and `index` a 1-based
/// parameter index.
pub unsafe fn bind_value(stmt: *mut ffi::sqlite3_stmt, index: c_int, value: &Value) -> c_int {
    // SAFETY: the caller guarantees stmt and index; SQLITE_TRANSIENT makes
    // SQLite copy text and blob buffers before this function returns
    unsafe {
        match value {
            Value::Null => ffi::sqlite3_bind_null(stmt, index),
            Value::Bool(b) => ffi::sqlite3_bind_int64(stmt, index, i64::from(*b)),
            Value::Int(v) => ffi::sqlite3_bind_int64(stmt, index, *v),
            Value::Float(v) => ffi::sqlite3_bind_double(stmt, index, *v),
            Value::Text(s) => ffi::sqlite3_bind_text(
                stmt,
                index,
                s.as_ptr().cast(),
                s.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            ),
            Value::Bytes(b) => ffi::sqlite3_bind_blob(
                stmt,
                index,
                b.as_ptr().cast(),
                b.len() as c_int,
                ffi::SQLITE_TRANSIENT(),
            ),
            native => bind_value(stmt, index, &native_to_wire(native)),
        }
    }
}

/// Read column `index` of the current row.
///
/// # Safety
/// `stmt` must be a valid statement positioned on a row by `sqlite3_step`.
pub unsafe fn read_column(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Value {
    // SAFETY: guaranteed by the caller; pointers returned by SQLite stay valid
    // until the next step, and are copied out here
    unsafe {
        match ffi::sqlite3_column_type(stmt, index) {
            ffi::SQLITE_INTEGER => Value::Int(ffi::sqlite3_column_int64(stmt, index)),
            ffi::SQLITE_FLOAT => Value::Float(ffi::sqlite3_column_double(stmt, index)),
            ffi::SQLITE_TEXT => {
                let ptr = ffi::sqlite3_column_text(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() || len <= 0 {
                    Value::Text(String::new())
                } else {
                    let slice = std::slice::from_raw_parts(ptr, len as usize);
                    Value::Text(String::from_utf8_lossy(slice).into_owned())
                }
            }
            ffi::SQLITE_BLOB => {
                let ptr = ffi::sqlite3_column_blob(stmt, index);
                let len = ffi::sqlite3_column_bytes(stmt, index);
                if ptr.is_null() || len <= 0 {
                    Value::Bytes(Vec::new())
                } else {
                    let slice = std::slice::from_raw_parts(ptr.cast::<u8>(), len as usize);
                    Value::Bytes(slice.to_vec())
                }
            }
            _ => Value::Null,
        }
    }
}

/// Name of result column `index`.
///
/// # Safety
/// `stmt` must be a valid prepared statement.
pub unsafe fn column_name(stmt: *mut ffi::sqlite3_stmt, index: c_int) -> Option<String> {
    // SAFETY: guaranteed by the caller
    unsafe {
        let ptr = ffi::sqlite3_column_name(stmt, index);
        if ptr.is_null() {
            None
        } else {
            CStr::from_ptr(ptr).to_str().ok().map(String::from)
        }
    }
}
