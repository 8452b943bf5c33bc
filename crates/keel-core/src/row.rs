//! Database row representation.

use crate::Result;
use crate::error::Error;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared by all rows of one result.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row of wire values returned by a [`Connection`](crate::Connection).
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a row that shares column metadata with its siblings.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Get a value by column name, converting it with [`FromValue`].
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Query(crate::error::QueryError {
                kind: crate::error::QueryErrorKind::NotFound,
                sql: None,
                message: format!("column '{}' not in result", name),
                source: None,
            })
        })?;
        T::from_value(value).map_err(|e| e.in_column(name))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Conversion from a borrowed [`Value`] into a Rust type.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

macro_rules! from_value_via_try_from {
    ($($ty:ty),* $(,)?) => {
        $(
            impl FromValue for $ty {
                fn from_value(value: &Value) -> Result<Self> {
                    <$ty>::try_from(value.clone())
                }
            }
        )*
    };
}

from_value_via_try_from!(bool, i32, i64, f64, String, Vec<u8>, serde_json::Value, [u8; 16]);

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            v => T::from_value(v).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access_by_name_and_index() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int(1), Value::from("Ada")],
        );
        assert_eq!(row.len(), 2);
        assert_eq!(row.get(0), Some(&Value::Int(1)));
        assert_eq!(row.get_by_name("name"), Some(&Value::from("Ada")));
        assert_eq!(row.get_named::<String>("name").unwrap(), "Ada");
        assert_eq!(row.column_names().collect::<Vec<_>>(), vec!["id", "name"]);
    }

    #[test]
    fn test_get_named_reports_column_on_mismatch() {
        let row = Row::new(vec!["age".into()], vec![Value::from("old")]);
        let err = row.get_named::<i64>("age").unwrap_err();
        assert!(err.to_string().contains("'age'"));
        assert!(row.get_named::<i64>("missing").is_err());
    }

    #[test]
    fn test_optional_conversion() {
        let row = Row::new(vec!["x".into()], vec![Value::Null]);
        assert_eq!(row.get_named::<Option<i64>>("x").unwrap(), None);
    }

    #[test]
    fn test_shared_column_info() {
        let cols = Arc::new(ColumnInfo::new(vec!["a".into()]));
        let r1 = Row::with_columns(Arc::clone(&cols), vec![Value::Int(1)]);
        let r2 = Row::with_columns(cols, vec![Value::Int(2)]);
        assert_eq!(r1.get_by_name("a"), Some(&Value::Int(1)));
        assert_eq!(r2.into_values(), vec![Value::Int(2)]);
    }
}
