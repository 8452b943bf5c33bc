//! Backend connection abstraction.
//!
//! A [`Connection`] executes one SQL statement at a time with positional
//! parameters and exposes explicit transaction control. Stores own exactly one
//! connection and talk to it synchronously.

use crate::dialect::DialectProfile;
use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// Outcome of executing one statement.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// Result rows (SELECT, or INSERT/UPDATE/DELETE with RETURNING).
    pub rows: Vec<Row>,
    /// Rows affected by a modification; 0 for pure queries.
    pub row_count: u64,
    /// Keys generated by an INSERT, in key-column order. Only filled by
    /// backends whose profile uses the last-insert-id strategy.
    pub generated_keys: Vec<Value>,
}

impl ExecResult {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Self::default()
        }
    }

    pub fn affected(row_count: u64) -> Self {
        Self {
            row_count,
            ..Self::default()
        }
    }

    /// First column of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|r| r.get(0))
    }
}

/// A live session with one backend.
///
/// Parameters are always wire values (`Null`, `Bool`, `Int`, `Float`, `Text`,
/// `Bytes`). Transport failures surface as
/// [`Error::BackendUnavailable`](crate::Error::BackendUnavailable);
/// statement failures as [`Error::Query`](crate::Error::Query).
pub trait Connection {
    /// Execute one statement.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult>;

    /// Run the query and return only its rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.execute(sql, params).map(|r| r.rows)
    }

    /// Open a transaction.
    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Syntactic profile for SQL sent to this connection.
    fn dialect_profile(&self) -> DialectProfile;

    /// Release the underlying handle. Later calls fail with
    /// `BackendUnavailable`.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<C: Connection + ?Sized> Connection for Box<C> {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        (**self).execute(sql, params)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn dialect_profile(&self) -> DialectProfile {
        (**self).dialect_profile()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo {
        begun: u32,
    }

    impl Connection for Echo {
        fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
            Ok(ExecResult::with_rows(vec![Row::new(
                vec!["sql".into(), "n".into()],
                vec![Value::from(sql), Value::from(params.len() as i64)],
            )]))
        }
        fn begin(&mut self) -> Result<()> {
            self.begun += 1;
            Ok(())
        }
        fn commit(&mut self) -> Result<()> {
            Ok(())
        }
        fn rollback(&mut self) -> Result<()> {
            Ok(())
        }
        fn dialect_profile(&self) -> DialectProfile {
            DialectProfile::sqlite()
        }
    }

    #[test]
    fn test_query_default_returns_rows() {
        let mut conn = Echo { begun: 0 };
        let rows = conn.query("SELECT 1", &[Value::Int(1)]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get_by_name("n"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_boxed_connection_delegates() {
        let mut conn: Box<dyn Connection> = Box::new(Echo { begun: 0 });
        conn.begin().unwrap();
        let res = conn.execute("SELECT 2", &[]).unwrap();
        assert_eq!(res.scalar(), Some(&Value::from("SELECT 2")));
        assert_eq!(conn.dialect_profile().name, "sqlite");
        assert!(conn.close().is_ok());
    }

    #[test]
    fn test_exec_result_constructors() {
        assert_eq!(ExecResult::affected(3).row_count, 3);
        assert!(ExecResult::default().scalar().is_none());
    }
}
