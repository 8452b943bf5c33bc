//! In-memory evaluation of predicates against tracked objects.
//!
//! Used by [`ResultSet::cached`](crate::ResultSet::cached) to answer a find
//! from live objects alone. Comparisons follow SQL three-valued logic: any
//! comparison with NULL is unknown, and unknown never matches. An undefined
//! column reads as NULL.

use crate::object::ObjectInfo;
use keel_core::{Error, Result, SqlType, Value};
use keel_query::{Column, CompareOp, Expr};
use std::cmp::Ordering;

/// Whether the pending values of `info` satisfy `predicate`.
pub(crate) fn matches(predicate: &Expr, info: &ObjectInfo) -> Result<bool> {
    Ok(truth(predicate, info)? == Some(true))
}

fn truth(expr: &Expr, info: &ObjectInfo) -> Result<Option<bool>> {
    match expr {
        Expr::Undef => Ok(Some(true)),
        Expr::Bool(b) => Ok(Some(*b)),
        Expr::And(items) => {
            let mut out = Some(true);
            for item in items {
                match truth(item, info)? {
                    Some(false) => return Ok(Some(false)),
                    None => out = None,
                    Some(true) => {}
                }
            }
            Ok(out)
        }
        Expr::Or(items) => {
            let mut out = Some(false);
            for item in items {
                match truth(item, info)? {
                    Some(true) => return Ok(Some(true)),
                    None => out = None,
                    Some(false) => {}
                }
            }
            Ok(out)
        }
        Expr::Not(inner) => Ok(truth(inner, info)?.map(|b| !b)),
        Expr::IsNull(inner) => Ok(Some(value(inner, info, None)?.is_null())),
        Expr::IsNotNull(inner) => Ok(Some(!value(inner, info, None)?.is_null())),
        Expr::Compare { op, left, right } => {
            let l = value(left, info, column_type(right, info))?;
            let r = value(right, info, column_type(left, info))?;
            Ok(compare(&l, &r).map(|ord| match op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::Ne => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::Le => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::Ge => ord != Ordering::Less,
            }))
        }
        Expr::In { expr, values } => {
            let target = value(expr, info, None)?;
            if target.is_null() {
                return Ok(None);
            }
            let hint = column_type(expr, info);
            let mut unknown = false;
            for candidate in values {
                match compare(&target, &value(candidate, info, hint)?) {
                    Some(Ordering::Equal) => return Ok(Some(true)),
                    Some(_) => {}
                    None => unknown = true,
                }
            }
            Ok(if unknown { None } else { Some(false) })
        }
        Expr::Like {
            expr,
            pattern,
            case_insensitive,
        } => match (value(expr, info, None)?, value(pattern, info, None)?) {
            (Value::Null, _) | (_, Value::Null) => Ok(None),
            (Value::Text(text), Value::Text(pattern)) if *case_insensitive => Ok(Some(
                like(&text.to_lowercase(), &pattern.to_lowercase()),
            )),
            (Value::Text(text), Value::Text(pattern)) => Ok(Some(like(&text, &pattern))),
            _ => Err(Error::Feature(
                "LIKE on non-text values cannot be evaluated in memory".to_string(),
            )),
        },
        other => Err(unsupported(other)),
    }
}

/// Value of a scalar node. Parameters compared with a typed column are
/// coerced to `hint` first.
fn value(expr: &Expr, info: &ObjectInfo, hint: Option<SqlType>) -> Result<Value> {
    match expr {
        Expr::Column(column) => {
            let idx = resolve(column, info)?;
            Ok(info.pending[idx].get().cloned().unwrap_or(Value::Null))
        }
        Expr::Param(v) => match hint {
            Some(ty) => ty.coerce(v.clone(), false),
            None => Ok(v.clone()),
        },
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        other => Err(unsupported(other)),
    }
}

fn resolve(column: &Column, info: &ObjectInfo) -> Result<usize> {
    let schema = &info.schema;
    if let Some(table) = &column.table {
        if table.name != schema.table {
            return Err(Error::Feature(format!(
                "column {}.{} does not belong to '{}'",
                table.reference(),
                column.name,
                schema.name
            )));
        }
    }
    schema.require_column(&column.name)
}

fn column_type(expr: &Expr, info: &ObjectInfo) -> Option<SqlType> {
    match expr {
        Expr::Column(column) => resolve(column, info)
            .ok()
            .map(|idx| info.schema.columns[idx].sql_type),
        _ => None,
    }
}

fn unsupported(expr: &Expr) -> Error {
    Error::Feature(format!(
        "{} cannot be evaluated against cached objects",
        expr.kind()
    ))
}

#[allow(clippy::cast_precision_loss)]
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
        (Value::Int(x), Value::Float(y)) => (*x as f64).partial_cmp(y),
        (Value::Float(x), Value::Int(y)) => x.partial_cmp(&(*y as f64)),
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(y),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Text(x), Value::Text(y)) => Some(x.cmp(y)),
        (Value::Decimal(x), Value::Decimal(y)) => {
            let x: f64 = x.parse().ok()?;
            let y: f64 = y.parse().ok()?;
            x.partial_cmp(&y)
        }
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::Date(x), Value::Date(y)) => Some(x.cmp(y)),
        (Value::Time(x), Value::Time(y)) | (Value::DateTime(x), Value::DateTime(y)) => {
            Some(x.cmp(y))
        }
        (Value::Uuid(x), Value::Uuid(y)) => Some(x.cmp(y)),
        (Value::Json(x), Value::Json(y)) => (x == y).then_some(Ordering::Equal),
        _ => None,
    }
}

// `%` matches any run of characters, `_` exactly one.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, from)) = backtrack {
            p = star + 1;
            t = from + 1;
            backtrack = Some((star, from + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == '%')
}
