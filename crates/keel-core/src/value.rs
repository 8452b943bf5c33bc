//! Dynamic SQL values.

use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A dynamically-typed SQL value.
///
/// Used both as the canonical in-memory ("native") form held by a
/// [`Variable`](crate::Variable) and as the wire form exchanged with a
/// [`Connection`](crate::Connection). Wire values are restricted to the
/// portable subset reported by [`Value::is_wire`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 64-bit signed integer
    Int(i64),

    /// 64-bit floating point
    Float(f64),

    /// Arbitrary precision decimal (canonical text)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Date (days since 1970-01-01)
    Date(i32),

    /// Time of day (microseconds since midnight)
    Time(i64),

    /// Timestamp without zone (microseconds since the Unix epoch)
    DateTime(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON document
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Bytes(_) => "bytes",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::DateTime(_) => "datetime",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
        }
    }

    /// Is this value in the portable wire subset?
    pub const fn is_wire(&self) -> bool {
        matches!(
            self,
            Value::Null
                | Value::Bool(_)
                | Value::Int(_)
                | Value::Float(_)
                | Value::Text(_)
                | Value::Bytes(_)
        )
    }

    /// Short description used in error messages, e.g. `text 'abc'`.
    pub fn describe(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Bool(b) => format!("bool {}", b),
            Value::Int(i) => format!("int {}", i),
            Value::Float(f) => format!("float {}", f),
            Value::Decimal(d) => format!("decimal {}", d),
            Value::Text(s) if s.len() > 32 => format!("text '{}...'", truncate(s, 32)),
            Value::Text(s) => format!("text '{}'", s),
            Value::Bytes(b) => format!("bytes[{}]", b.len()),
            other => other.type_name().to_string(),
        }
    }

    /// Try to convert this value to a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to convert this value to an f64.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::Decimal(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) | Value::Decimal(s) => Some(s),
            _ => None,
        }
    }

    /// Try to get this value as a byte slice.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Text(s) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// Values are used inside identity keys. Floats hash by bit pattern.
impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                3u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Decimal(s) => {
                4u8.hash(state);
                s.hash(state);
            }
            Value::Text(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                6u8.hash(state);
                b.hash(state);
            }
            Value::Date(d) => {
                7u8.hash(state);
                d.hash(state);
            }
            Value::Time(t) => {
                8u8.hash(state);
                t.hash(state);
            }
            Value::DateTime(ts) => {
                9u8.hash(state);
                ts.hash(state);
            }
            Value::Uuid(u) => {
                10u8.hash(state);
                u.hash(state);
            }
            Value::Json(j) => {
                11u8.hash(state);
                j.to_string().hash(state);
            }
        }
    }
}

// Conversion implementations
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

// TryFrom implementations for extracting values

use crate::error::Error;
use crate::types::SqlType;

impl TryFrom<Value> for bool {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        value
            .as_bool()
            .ok_or_else(|| Error::type_mismatch(SqlType::Bool, value.describe()))
    }
}

impl TryFrom<Value> for i64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(v) => Ok(v),
            other => Err(Error::type_mismatch(SqlType::Int, other.describe())),
        }
    }
}

impl TryFrom<Value> for i32 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(v) => i32::try_from(v).map_err(|_| {
                let mut err = Error::type_mismatch(SqlType::Int, format!("int {}", v));
                if let Error::TypeMismatch(e) = &mut err {
                    e.detail = Some("out of range for i32".to_string());
                }
                err
            }),
            other => Err(Error::type_mismatch(SqlType::Int, other.describe())),
        }
    }
}

impl TryFrom<Value> for f64 {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Float(v) => Ok(v),
            Value::Int(v) => Ok(v as f64),
            other => Err(Error::type_mismatch(SqlType::Float, other.describe())),
        }
    }
}

impl TryFrom<Value> for String {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s),
            other => Err(Error::type_mismatch(SqlType::Text, other.describe())),
        }
    }
}

impl TryFrom<Value> for Vec<u8> {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Bytes(b) => Ok(b),
            other => Err(Error::type_mismatch(SqlType::Bytes, other.describe())),
        }
    }
}

impl TryFrom<Value> for serde_json::Value {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Json(j) => Ok(j),
            other => Err(Error::type_mismatch(SqlType::Json, other.describe())),
        }
    }
}

impl TryFrom<Value> for [u8; 16] {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Uuid(u) => Ok(u),
            other => Err(Error::type_mismatch(SqlType::Uuid, other.describe())),
        }
    }
}

/// TryFrom for `Option<T>` - returns None for Null, tries to convert otherwise
impl<T> TryFrom<Value> for Option<T>
where
    T: TryFrom<Value, Error = Error>,
{
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Null => Ok(None),
            v => T::try_from(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of(v: &Value) -> u64 {
        let mut h = DefaultHasher::new();
        v.hash(&mut h);
        h.finish()
    }

    #[test]
    fn test_from_integers_widen_to_int() {
        assert_eq!(Value::from(7i8), Value::Int(7));
        assert_eq!(Value::from(7u32), Value::Int(7));
        assert_eq!(Value::from(-3i64), Value::Int(-3));
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_string()));
    }

    #[test]
    fn test_wire_subset() {
        assert!(Value::Text("a".into()).is_wire());
        assert!(Value::Null.is_wire());
        assert!(!Value::Date(0).is_wire());
        assert!(!Value::Uuid([0; 16]).is_wire());
    }

    #[test]
    fn test_describe_truncates_long_text() {
        let long = "x".repeat(100);
        let d = Value::Text(long).describe();
        assert!(d.ends_with("...'"));
        assert!(d.len() < 50);
    }

    #[test]
    fn test_hash_distinguishes_variants() {
        assert_ne!(hash_of(&Value::Int(1)), hash_of(&Value::Bool(true)));
        assert_ne!(
            hash_of(&Value::Text("1".into())),
            hash_of(&Value::Decimal("1".into()))
        );
        assert_eq!(hash_of(&Value::Int(5)), hash_of(&Value::Int(5)));
    }

    #[test]
    fn test_try_from_roundtrip_natives() {
        assert_eq!(i64::try_from(Value::Int(42)).unwrap(), 42);
        assert_eq!(String::try_from(Value::from("hi")).unwrap(), "hi");
        assert!(bool::try_from(Value::Int(1)).unwrap());
        assert_eq!(Option::<i64>::try_from(Value::Null).unwrap(), None);
        assert_eq!(Option::<i64>::try_from(Value::Int(3)).unwrap(), Some(3));
    }

    #[test]
    fn test_try_from_mismatch() {
        let err = i64::try_from(Value::from("abc")).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
        let err = i32::try_from(Value::Int(i64::MAX)).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }
}
