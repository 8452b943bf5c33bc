//! Typed, nullable value holders.
//!
//! A [`Variable`] normalizes values between their canonical in-memory form
//! and the portable wire form a [`Connection`](crate::Connection) exchanges
//! with the backend. Its "undefined" state is distinct from NULL: it means
//! the value is not known yet (server-assigned, not fetched, ...).

use crate::codec;
use crate::error::{Error, Result, TypeMismatchError};
use crate::types::{SqlType, fits_i64};
use crate::value::Value;

/// A typed, nullable scalar that may be undefined.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    ty: SqlType,
    nullable: bool,
    allow_lossy: bool,
    /// `None` means undefined.
    value: Option<Value>,
}

impl Variable {
    /// Create an undefined, nullable variable of the given type.
    pub fn new(ty: SqlType) -> Self {
        Self {
            ty,
            nullable: true,
            allow_lossy: false,
            value: None,
        }
    }

    /// Reject NULL assignments.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Allow lossy coercions on assignment.
    pub fn lossy(mut self, allow: bool) -> Self {
        self.allow_lossy = allow;
        self
    }

    /// Builder form of [`Variable::set`].
    pub fn with_value(mut self, value: impl Into<Value>) -> Result<Self> {
        self.set(value)?;
        Ok(self)
    }

    pub fn sql_type(&self) -> SqlType {
        self.ty
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn allows_lossy(&self) -> bool {
        self.allow_lossy
    }

    pub fn is_defined(&self) -> bool {
        self.value.is_some()
    }

    /// Current native value, or `None` while undefined.
    pub fn get(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Assign a native value, coercing it to the declared type.
    pub fn set(&mut self, value: impl Into<Value>) -> Result<()> {
        let native = self.coerce(value.into())?;
        self.value = Some(native);
        Ok(())
    }

    /// Assign a value read from the backend.
    ///
    /// NULL is accepted even for non-nullable variables; outer joins and
    /// aggregates legitimately produce it.
    pub fn set_wire(&mut self, wire: Value) -> Result<()> {
        let native = self.decode(wire)?;
        self.value = Some(native);
        Ok(())
    }

    /// Return to the undefined state.
    pub fn unset(&mut self) {
        self.value = None;
    }

    /// Take the value out, leaving the variable undefined.
    pub fn take(&mut self) -> Option<Value> {
        self.value.take()
    }

    /// Wire form of the current value, or `None` while undefined.
    pub fn wire(&self) -> Option<Value> {
        self.value.as_ref().map(native_to_wire)
    }

    /// Convert a native value to its wire representation.
    ///
    /// Fails with `TypeMismatch` when `native` cannot be coerced to the
    /// declared type.
    pub fn encode(&self, native: &Value) -> Result<Value> {
        let native = self.coerce(native.clone())?;
        Ok(native_to_wire(&native))
    }

    /// Convert a wire value back to the canonical native form.
    pub fn decode(&self, wire: Value) -> Result<Value> {
        if wire.is_null() {
            return Ok(Value::Null);
        }
        let described = wire.describe();
        decode_wire(self.ty, wire).ok_or_else(|| {
            Error::TypeMismatch(TypeMismatchError {
                expected: self.ty,
                actual: described,
                column: None,
                detail: Some("undecodable backend value".to_string()),
            })
        })
    }

    fn coerce(&self, value: Value) -> Result<Value> {
        if value.is_null() && !self.nullable {
            return Err(Error::TypeMismatch(TypeMismatchError {
                expected: self.ty,
                actual: "null".to_string(),
                column: None,
                detail: Some("column is not nullable".to_string()),
            }));
        }
        self.ty.coerce(value, self.allow_lossy)
    }
}

/// Wire form of a canonical native value. Wire values pass through.
pub fn native_to_wire(native: &Value) -> Value {
    match native {
        Value::Decimal(s) => Value::Text(s.clone()),
        Value::Date(d) => Value::Text(codec::format_date(*d)),
        Value::Time(t) => Value::Text(codec::format_time(*t)),
        Value::DateTime(ts) => Value::Text(codec::format_datetime(*ts)),
        Value::Uuid(u) => Value::Text(codec::format_uuid(u)),
        Value::Json(j) => Value::Text(j.to_string()),
        other => other.clone(),
    }
}

// Backends report values in their own storage classes, so decoding is more
// permissive than assignment: SQLite hands back 0/1 for booleans, REAL for
// NUMERIC columns, and so on.
fn decode_wire(ty: SqlType, wire: Value) -> Option<Value> {
    match (ty, wire) {
        (SqlType::Bool, Value::Bool(b)) => Some(Value::Bool(b)),
        (SqlType::Bool, Value::Int(i)) => Some(Value::Bool(i != 0)),
        (SqlType::Bool, Value::Text(s)) => match s.as_str() {
            "t" | "true" | "1" => Some(Value::Bool(true)),
            "f" | "false" | "0" => Some(Value::Bool(false)),
            _ => None,
        },

        (SqlType::Int, Value::Int(i)) => Some(Value::Int(i)),
        (SqlType::Int, Value::Bool(b)) => Some(Value::Int(i64::from(b))),
        (SqlType::Int, Value::Float(f)) if f.fract() == 0.0 && fits_i64(f) => {
            Some(Value::Int(f as i64))
        }
        (SqlType::Int, Value::Text(s)) => s.parse().ok().map(Value::Int),

        (SqlType::Float, Value::Float(f)) => Some(Value::Float(f)),
        (SqlType::Float, Value::Int(i)) => Some(Value::Float(i as f64)),
        (SqlType::Float, Value::Text(s)) => s.parse().ok().map(Value::Float),

        (SqlType::Decimal, Value::Text(s) | Value::Decimal(s)) => {
            codec::canonical_decimal(&s).map(Value::Decimal)
        }
        (SqlType::Decimal, Value::Int(i)) => Some(Value::Decimal(i.to_string())),
        (SqlType::Decimal, Value::Float(f)) if f.is_finite() => {
            codec::canonical_decimal(&f.to_string()).map(Value::Decimal)
        }

        (SqlType::Text, Value::Text(s)) => Some(Value::Text(s)),
        (SqlType::Text, Value::Int(i)) => Some(Value::Text(i.to_string())),
        (SqlType::Text, Value::Float(f)) => Some(Value::Text(f.to_string())),

        (SqlType::Bytes, Value::Bytes(b)) => Some(Value::Bytes(b)),
        (SqlType::Bytes, Value::Text(s)) => Some(Value::Bytes(s.into_bytes())),

        (SqlType::Date, Value::Text(s)) => codec::parse_date(&s).map(Value::Date),
        (SqlType::Date, Value::Date(d)) => Some(Value::Date(d)),
        (SqlType::Time, Value::Text(s)) => codec::parse_time(&s).map(Value::Time),
        (SqlType::Time, Value::Time(t)) => Some(Value::Time(t)),
        (SqlType::DateTime, Value::Text(s)) => codec::parse_datetime(&s).map(Value::DateTime),
        (SqlType::DateTime, Value::DateTime(ts)) => Some(Value::DateTime(ts)),

        (SqlType::Uuid, Value::Text(s)) => codec::parse_uuid(&s).map(Value::Uuid),
        (SqlType::Uuid, Value::Bytes(b)) => <[u8; 16]>::try_from(b.as_slice())
            .ok()
            .map(Value::Uuid),
        (SqlType::Uuid, Value::Uuid(u)) => Some(Value::Uuid(u)),

        (SqlType::Json, Value::Text(s)) => serde_json::from_str(&s).ok().map(Value::Json),
        (SqlType::Json, Value::Json(j)) => Some(Value::Json(j)),
        (SqlType::Json, Value::Int(i)) => Some(Value::Json(serde_json::Value::from(i))),
        (SqlType::Json, Value::Bool(b)) => Some(Value::Json(serde_json::Value::Bool(b))),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_new_variable_is_undefined() {
        let var = Variable::new(SqlType::Int);
        assert!(!var.is_defined());
        assert_eq!(var.get(), None);
        assert_eq!(var.wire(), None);
    }

    #[test]
    fn test_undefined_differs_from_null() {
        let mut var = Variable::new(SqlType::Text);
        var.set(Value::Null).unwrap();
        assert!(var.is_defined());
        assert_eq!(var.get(), Some(&Value::Null));
        var.unset();
        assert!(!var.is_defined());
    }

    #[test]
    fn test_not_null_rejects_null() {
        let mut var = Variable::new(SqlType::Text).not_null();
        let err = var.set(Value::Null).unwrap_err();
        assert!(err.to_string().contains("not nullable"));
        assert!(!var.is_defined());
    }

    #[test]
    fn test_set_failure_keeps_previous_value() {
        let mut var = Variable::new(SqlType::Int).with_value(7).unwrap();
        assert!(var.set("seven").is_err());
        assert_eq!(var.get(), Some(&Value::Int(7)));
    }

    #[test]
    fn test_lossy_flag_enables_parsing() {
        let mut var = Variable::new(SqlType::Int).lossy(true);
        var.set("42").unwrap();
        assert_eq!(var.get(), Some(&Value::Int(42)));
    }

    #[test]
    fn test_encode_uses_text_for_temporal_and_uuid() {
        let var = Variable::new(SqlType::Date);
        assert_eq!(
            var.encode(&Value::Date(0)).unwrap(),
            Value::Text("1970-01-01".into())
        );
        let var = Variable::new(SqlType::Uuid);
        assert_eq!(
            var.encode(&Value::Uuid([0xab; 16])).unwrap(),
            Value::Text("abababab-abab-abab-abab-abababababab".into())
        );
    }

    #[test]
    fn test_encode_rejects_invalid_native() {
        let var = Variable::new(SqlType::Int);
        assert!(matches!(
            var.encode(&Value::from("not a number")),
            Err(Error::TypeMismatch(_))
        ));
    }

    #[test]
    fn test_decode_is_permissive_about_storage_class() {
        let var = Variable::new(SqlType::Bool);
        assert_eq!(var.decode(Value::Int(1)).unwrap(), Value::Bool(true));
        let var = Variable::new(SqlType::Decimal);
        assert_eq!(
            var.decode(Value::Float(12.5)).unwrap(),
            Value::Decimal("12.5".into())
        );
        let var = Variable::new(SqlType::Int).not_null();
        assert_eq!(var.decode(Value::Null).unwrap(), Value::Null);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let var = Variable::new(SqlType::Date);
        let err = var.decode(Value::from("31/12/2024")).unwrap_err();
        assert!(err.to_string().contains("undecodable"));
    }

    #[test]
    fn test_decode_rejects_float_outside_int_range() {
        let var = Variable::new(SqlType::Int);
        let err = var.decode(Value::Float(1e30)).unwrap_err();
        assert!(matches!(err, Error::TypeMismatch(_)));
        assert_eq!(var.decode(Value::Float(-42.0)).unwrap(), Value::Int(-42));
    }

    fn scalar_strategy() -> impl Strategy<Value = (SqlType, Value)> {
        prop_oneof![
            any::<bool>().prop_map(|b| (SqlType::Bool, Value::Bool(b))),
            any::<i64>().prop_map(|i| (SqlType::Int, Value::Int(i))),
            (-1.0e12f64..1.0e12).prop_map(|f| (SqlType::Float, Value::Float(f))),
            (any::<i64>(), 0u32..6).prop_map(|(i, scale)| {
                let raw = i.to_string();
                let text = if scale == 0 {
                    raw
                } else {
                    format!("{}.{}", raw, "5".repeat(scale as usize))
                };
                (SqlType::Decimal, Value::Decimal(text))
            }),
            ".*".prop_map(|s| (SqlType::Text, Value::Text(s))),
            proptest::collection::vec(any::<u8>(), 0..32)
                .prop_map(|b| (SqlType::Bytes, Value::Bytes(b))),
        ]
    }

    fn textual_strategy() -> impl Strategy<Value = (SqlType, Value)> {
        prop_oneof![
            (codec::MIN_DATE_DAYS..=codec::MAX_DATE_DAYS)
                .prop_map(|d| (SqlType::Date, Value::Date(d))),
            (0..codec::MICROS_PER_DAY).prop_map(|t| (SqlType::Time, Value::Time(t))),
            (i64::from(codec::MIN_DATE_DAYS) * codec::MICROS_PER_DAY
                ..i64::from(codec::MAX_DATE_DAYS) * codec::MICROS_PER_DAY)
                .prop_map(|ts| (SqlType::DateTime, Value::DateTime(ts))),
            any::<[u8; 16]>().prop_map(|u| (SqlType::Uuid, Value::Uuid(u))),
            (any::<i32>(), "[a-z]{0,8}").prop_map(|(i, s)| {
                (
                    SqlType::Json,
                    Value::Json(serde_json::json!({ "n": i, "s": s, "flag": i % 2 == 0 })),
                )
            }),
        ]
    }

    fn native_strategy() -> impl Strategy<Value = (SqlType, Value)> {
        prop_oneof![scalar_strategy(), textual_strategy()]
    }

    proptest! {
        #[test]
        fn prop_decode_encode_roundtrip((ty, native) in native_strategy()) {
            let var = Variable::new(ty);
            let wire = var.encode(&native).unwrap();
            prop_assert!(wire.is_wire());
            prop_assert_eq!(var.decode(wire).unwrap(), native);
        }

        #[test]
        fn prop_non_numeric_text_rejected_by_int(s in "[a-zA-Z ]{1,12}") {
            let mut var = Variable::new(SqlType::Int);
            prop_assert!(matches!(var.set(s.as_str()), Err(Error::TypeMismatch(_))));
        }
    }
}
