//! Semantic column types and value coercion.

use crate::codec;
use crate::error::{Error, Result, TypeMismatchError};
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Semantic type tag of a column or [`Variable`](crate::Variable).
///
/// This is the backend-independent type; each dialect maps it to a concrete
/// type name for CAST rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlType {
    Bool,
    Int,
    Float,
    Decimal,
    Text,
    Bytes,
    Date,
    Time,
    DateTime,
    Uuid,
    Json,
}

impl SqlType {
    /// All semantic types, in declaration order.
    pub const ALL: [SqlType; 11] = [
        SqlType::Bool,
        SqlType::Int,
        SqlType::Float,
        SqlType::Decimal,
        SqlType::Text,
        SqlType::Bytes,
        SqlType::Date,
        SqlType::Time,
        SqlType::DateTime,
        SqlType::Uuid,
        SqlType::Json,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            SqlType::Bool => "bool",
            SqlType::Int => "int",
            SqlType::Float => "float",
            SqlType::Decimal => "decimal",
            SqlType::Text => "text",
            SqlType::Bytes => "bytes",
            SqlType::Date => "date",
            SqlType::Time => "time",
            SqlType::DateTime => "datetime",
            SqlType::Uuid => "uuid",
            SqlType::Json => "json",
        }
    }

    /// Normalize `value` to this type's canonical native form.
    ///
    /// Lossless conversions (int into float, integral float into int, 0/1
    /// into bool, well-formed text into temporal, uuid and decimal types) are
    /// always accepted. Anything that drops information or parses free-form
    /// text needs `lossy`. NULL passes through; nullability is the caller's
    /// concern.
    pub fn coerce(&self, value: Value, lossy: bool) -> Result<Value> {
        if value.is_null() {
            return Ok(Value::Null);
        }
        let described = value.describe();
        let coerced = match (self, value) {
            (SqlType::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
            (SqlType::Bool, Value::Int(i @ (0 | 1))) => Some(Value::Bool(i == 1)),
            (SqlType::Bool, Value::Int(i)) if lossy => Some(Value::Bool(i != 0)),
            (SqlType::Bool, Value::Text(s)) if lossy => parse_bool(&s).map(Value::Bool),

            (SqlType::Int, Value::Int(i)) => Some(Value::Int(i)),
            (SqlType::Int, Value::Float(f)) if f.fract() == 0.0 && fits_i64(f) => {
                Some(Value::Int(f as i64))
            }
            (SqlType::Int, Value::Float(f)) if lossy && f.is_finite() && fits_i64(f.trunc()) => {
                tracing::trace!(value = f, "truncating float into int variable");
                Some(Value::Int(f.trunc() as i64))
            }
            (SqlType::Int, Value::Bool(b)) if lossy => Some(Value::Int(i64::from(b))),
            (SqlType::Int, Value::Decimal(s) | Value::Text(s)) if lossy => {
                s.trim().parse::<i64>().ok().map(Value::Int)
            }

            (SqlType::Float, Value::Float(f)) => Some(Value::Float(f)),
            (SqlType::Float, Value::Int(i)) => Some(Value::Float(i as f64)),
            (SqlType::Float, Value::Decimal(s)) => s.parse::<f64>().ok().map(Value::Float),
            (SqlType::Float, Value::Text(s)) if lossy => {
                s.trim().parse::<f64>().ok().map(Value::Float)
            }

            (SqlType::Decimal, Value::Decimal(s) | Value::Text(s)) => {
                codec::canonical_decimal(&s).map(Value::Decimal)
            }
            (SqlType::Decimal, Value::Int(i)) => Some(Value::Decimal(i.to_string())),
            (SqlType::Decimal, Value::Float(f)) if lossy && f.is_finite() => {
                codec::canonical_decimal(&f.to_string()).map(Value::Decimal)
            }

            (SqlType::Text, Value::Text(s)) => Some(Value::Text(s)),
            (SqlType::Text, Value::Uuid(u)) if lossy => Some(Value::Text(codec::format_uuid(&u))),
            (SqlType::Text, Value::Decimal(s)) if lossy => Some(Value::Text(s)),
            (SqlType::Text, Value::Int(i)) if lossy => Some(Value::Text(i.to_string())),
            (SqlType::Text, Value::Float(f)) if lossy => Some(Value::Text(f.to_string())),
            (SqlType::Text, Value::Bool(b)) if lossy => Some(Value::Text(b.to_string())),

            (SqlType::Bytes, Value::Bytes(b)) => Some(Value::Bytes(b)),
            (SqlType::Bytes, Value::Text(s)) if lossy => Some(Value::Bytes(s.into_bytes())),

            (SqlType::Date, Value::Date(d)) if codec::date_in_range(d) => Some(Value::Date(d)),
            (SqlType::Date, Value::Text(s)) => codec::parse_date(s.trim()).map(Value::Date),
            (SqlType::Date, Value::DateTime(ts)) if lossy && codec::datetime_in_range(ts) => {
                i32::try_from(ts.div_euclid(codec::MICROS_PER_DAY))
                    .ok()
                    .map(Value::Date)
            }

            (SqlType::Time, Value::Time(t)) if codec::time_in_range(t) => Some(Value::Time(t)),
            (SqlType::Time, Value::Text(s)) => codec::parse_time(s.trim()).map(Value::Time),
            (SqlType::Time, Value::DateTime(ts)) if lossy => {
                Some(Value::Time(ts.rem_euclid(codec::MICROS_PER_DAY)))
            }

            (SqlType::DateTime, Value::DateTime(ts)) if codec::datetime_in_range(ts) => {
                Some(Value::DateTime(ts))
            }
            (SqlType::DateTime, Value::Date(d)) if codec::date_in_range(d) => {
                Some(Value::DateTime(i64::from(d) * codec::MICROS_PER_DAY))
            }
            (SqlType::DateTime, Value::Text(s)) => {
                codec::parse_datetime(s.trim()).map(Value::DateTime)
            }

            (SqlType::Uuid, Value::Uuid(u)) => Some(Value::Uuid(u)),
            (SqlType::Uuid, Value::Text(s)) => codec::parse_uuid(s.trim()).map(Value::Uuid),
            (SqlType::Uuid, Value::Bytes(b)) => <[u8; 16]>::try_from(b.as_slice())
                .ok()
                .map(Value::Uuid),

            (SqlType::Json, Value::Json(j)) => Some(Value::Json(j)),
            (SqlType::Json, Value::Bool(b)) => Some(Value::Json(serde_json::Value::Bool(b))),
            (SqlType::Json, Value::Int(i)) => Some(Value::Json(serde_json::Value::from(i))),
            (SqlType::Json, Value::Float(f)) => {
                serde_json::Number::from_f64(f).map(|n| Value::Json(serde_json::Value::Number(n)))
            }
            (SqlType::Json, Value::Text(s)) if lossy => {
                serde_json::from_str(&s).ok().map(Value::Json)
            }

            _ => None,
        };
        coerced.ok_or_else(|| {
            Error::TypeMismatch(TypeMismatchError {
                expected: *self,
                actual: described,
                column: None,
                detail: (!lossy).then(|| "lossy conversion not enabled".to_string()),
            })
        })
    }
}

pub(crate) fn fits_i64(f: f64) -> bool {
    f >= i64::MIN as f64 && f < i64::MAX as f64
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" | "1" => Some(true),
        "false" | "f" | "no" | "0" => Some(false),
        _ => None,
    }
}
