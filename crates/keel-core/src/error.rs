//! Error types for keel operations.

use crate::types::SqlType;
use crate::value::Value;
use std::fmt;

/// The primary error type for all keel operations.
#[derive(Debug)]
pub enum Error {
    /// A value could not be coerced to a Variable's declared type
    TypeMismatch(TypeMismatchError),
    /// An expression node cannot be rendered for the target dialect
    Compile(CompileError),
    /// Pending inserts reference each other in an unbreakable cycle
    FlushCycle(FlushCycleError),
    /// Optimistic-lock check failed: an UPDATE matched no row
    StaleObject(StaleObjectError),
    /// Connection or transport failure; the owning Store is marked failed
    BackendUnavailable(ConnectionError),
    /// Attribute read before materialization with no Store to fetch from
    NotLoaded(NotLoadedError),
    /// The backend rejected a statement (constraint, syntax, ...)
    Query(QueryError),
    /// Invalid schema descriptor or unknown entity/column
    Schema(SchemaError),
    /// Object is tracked by a different Store
    WrongStore(String),
    /// Handle refers to an object that was evicted
    Detached(String),
    /// Operation needs a persisted object but it was never flushed
    NotFlushed(String),
    /// `one()` found more than one row
    NotOne(usize),
    /// Positional access on a result set with no ordering
    Unordered,
    /// Operation is not supported in this configuration
    Feature(String),
    /// Serialization/deserialization errors
    Serde(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMismatchError {
    pub expected: SqlType,
    pub actual: String,
    pub column: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileError {
    /// Kind of the node that could not be rendered
    pub node: String,
    /// Name of the dialect profile
    pub dialect: String,
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushCycleError {
    /// Human-readable description of each object on the cycle
    pub objects: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StaleObjectError {
    pub entity: String,
    pub key: Vec<Value>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection was closed by the application
    Closed,
    /// Store refuses work until rollback
    StoreFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotLoadedError {
    pub entity: String,
    pub column: String,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Database busy or locked
    Busy,
    /// Other database error
    Database,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaError {
    pub entity: Option<String>,
    pub message: String,
}

impl Error {
    pub fn type_mismatch(expected: SqlType, actual: impl Into<String>) -> Self {
        Error::TypeMismatch(TypeMismatchError {
            expected,
            actual: actual.into(),
            column: None,
            detail: None,
        })
    }

    pub fn compile(node: impl Into<String>, dialect: impl Into<String>) -> Self {
        Error::Compile(CompileError {
            node: node.into(),
            dialect: dialect.into(),
            message: None,
        })
    }

    pub fn schema(entity: Option<&str>, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Error::BackendUnavailable(ConnectionError {
            kind: ConnectionErrorKind::Disconnected,
            message: message.into(),
            source: None,
        })
    }

    /// Attach the column name to a `TypeMismatch`; other errors pass through.
    pub fn in_column(self, column: &str) -> Self {
        match self {
            Error::TypeMismatch(mut e) => {
                if e.column.is_none() {
                    e.column = Some(column.to_string());
                }
                Error::TypeMismatch(e)
            }
            other => other,
        }
    }

    /// Did the backend connection go away?
    pub fn is_backend_unavailable(&self) -> bool {
        matches!(self, Error::BackendUnavailable(_))
    }

    /// Is this a programmer error rather than a data or backend problem?
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::NotLoaded(_)
                | Error::WrongStore(_)
                | Error::Detached(_)
                | Error::NotFlushed(_)
                | Error::Unordered
                | Error::Feature(_)
        )
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::TypeMismatch(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type mismatch in column '{}': expected {}, found {}",
                        col,
                        e.expected.name(),
                        e.actual
                    )?;
                } else {
                    write!(
                        f,
                        "Type mismatch: expected {}, found {}",
                        e.expected.name(),
                        e.actual
                    )?;
                }
                if let Some(detail) = &e.detail {
                    write!(f, " ({})", detail)?;
                }
                Ok(())
            }
            Error::Compile(e) => {
                write!(
                    f,
                    "Compile error: {} is not supported by dialect '{}'",
                    e.node, e.dialect
                )?;
                if let Some(msg) = &e.message {
                    write!(f, ": {}", msg)?;
                }
                Ok(())
            }
            Error::FlushCycle(e) => {
                write!(f, "Flush cycle between {}", e.objects.join(" -> "))
            }
            Error::StaleObject(e) => write!(
                f,
                "Stale object: {} with key {:?} no longer matches a row",
                e.entity, e.key
            ),
            Error::BackendUnavailable(e) => write!(f, "Backend unavailable: {}", e.message),
            Error::NotLoaded(e) => write!(
                f,
                "Attribute '{}.{}' is not loaded and no store is attached",
                e.entity, e.column
            ),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Schema(e) => match &e.entity {
                Some(entity) => write!(f, "Schema error in '{}': {}", entity, e.message),
                None => write!(f, "Schema error: {}", e.message),
            },
            Error::WrongStore(msg) => write!(f, "Object belongs to another store: {}", msg),
            Error::Detached(msg) => write!(f, "Object is no longer tracked: {}", msg),
            Error::NotFlushed(msg) => write!(f, "Object was never flushed: {}", msg),
            Error::NotOne(n) => write!(f, "Expected at most one row, found {}", n),
            Error::Unordered => write!(f, "Result set has no ordering"),
            Error::Feature(msg) => write!(f, "Unsupported operation: {}", msg),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::BackendUnavailable(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for keel operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_mismatch_display_mentions_column() {
        let err = Error::type_mismatch(SqlType::Int, "text 'abc'").in_column("age");
        assert_eq!(
            err.to_string(),
            "Type mismatch in column 'age': expected int, found text 'abc'"
        );
    }

    #[test]
    fn test_in_column_keeps_first_column() {
        let err = Error::type_mismatch(SqlType::Int, "bool")
            .in_column("a")
            .in_column("b");
        match err {
            Error::TypeMismatch(e) => assert_eq!(e.column.as_deref(), Some("a")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_compile_error_names_node_and_dialect() {
        let err = Error::compile("FullJoin", "mysql");
        let msg = err.to_string();
        assert!(msg.contains("FullJoin"));
        assert!(msg.contains("mysql"));
    }

    #[test]
    fn test_classification() {
        assert!(Error::disconnected("socket closed").is_backend_unavailable());
        assert!(Error::Unordered.is_usage_error());
        assert!(!Error::NotOne(2).is_usage_error());
        assert!(!Error::Unordered.is_backend_unavailable());
    }

    #[test]
    fn test_query_error_exposes_sql() {
        let err = Error::Query(QueryError {
            kind: QueryErrorKind::Constraint,
            sql: Some("INSERT INTO person (id) VALUES (?)".to_string()),
            message: "UNIQUE constraint failed".to_string(),
            source: None,
        });
        assert_eq!(err.sql(), Some("INSERT INTO person (id) VALUES (?)"));
    }
}
