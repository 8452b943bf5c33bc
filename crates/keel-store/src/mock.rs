//! Recording connection used by the Store tests.

use keel_core::{
    Connection, DialectProfile, Error, ExecResult, KeyStrategy, QueryError, QueryErrorKind,
    Result, Row, Value,
};
use std::collections::VecDeque;

#[derive(Debug)]
pub(crate) struct MockConnection {
    dialect: DialectProfile,
    /// Every statement, in issue order.
    pub executed: Vec<(String, Vec<Value>)>,
    /// BEGIN / COMMIT / ROLLBACK calls.
    pub tx_log: Vec<&'static str>,
    next_key: i64,
    /// Rows handed out to SELECTs, front first.
    selects: VecDeque<Vec<Row>>,
    /// Affected-row counts for UPDATE / DELETE, front first; default 1.
    affected: VecDeque<u64>,
    /// Fail the statement with this index (into `executed`).
    fail_at: Option<(usize, bool)>,
    disconnected: bool,
}

impl MockConnection {
    pub(crate) fn new(dialect: DialectProfile) -> Self {
        Self {
            dialect,
            executed: Vec::new(),
            tx_log: Vec::new(),
            next_key: 1,
            selects: VecDeque::new(),
            affected: VecDeque::new(),
            fail_at: None,
            disconnected: false,
        }
    }

    pub(crate) fn sqlite() -> Self {
        Self::new(DialectProfile::sqlite())
    }

    pub(crate) fn last_insert_id() -> Self {
        Self::new(DialectProfile::sqlite().with_key_strategy(KeyStrategy::LastInsertId))
    }

    pub(crate) fn next_key(mut self, key: i64) -> Self {
        self.next_key = key;
        self
    }

    pub(crate) fn push_rows(&mut self, columns: &[&str], rows: Vec<Vec<Value>>) {
        let names: Vec<String> = columns.iter().map(|c| (*c).to_string()).collect();
        self.selects.push_back(
            rows.into_iter()
                .map(|values| Row::new(names.clone(), values))
                .collect(),
        );
    }

    pub(crate) fn push_affected(&mut self, count: u64) {
        self.affected.push_back(count);
    }

    /// Fail the `index`-th statement from now; with `disconnect` the
    /// connection is lost, otherwise it is a constraint violation.
    pub(crate) fn fail_at(&mut self, index: usize, disconnect: bool) {
        self.fail_at = Some((self.executed.len() + index, disconnect));
    }

    pub(crate) fn sql(&self) -> Vec<&str> {
        self.executed.iter().map(|(sql, _)| sql.as_str()).collect()
    }

    pub(crate) fn clear(&mut self) {
        self.executed.clear();
        self.tx_log.clear();
        self.fail_at = None;
    }
}

impl Connection for MockConnection {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<ExecResult> {
        if self.disconnected {
            return Err(Error::disconnected("mock connection lost"));
        }
        self.executed.push((sql.to_string(), params.to_vec()));
        if let Some((at, disconnect)) = self.fail_at {
            if at + 1 == self.executed.len() {
                self.fail_at = None;
                if disconnect {
                    self.disconnected = true;
                    return Err(Error::disconnected("mock connection lost"));
                }
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Constraint,
                    sql: Some(sql.to_string()),
                    message: "constraint failed".to_string(),
                    source: None,
                }));
            }
        }

        if sql.starts_with("SELECT") {
            return Ok(ExecResult::with_rows(
                self.selects.pop_front().unwrap_or_default(),
            ));
        }
        if sql.starts_with("INSERT") {
            let mut result = ExecResult::affected(1);
            if let Some(pos) = sql.find(" RETURNING ") {
                let names: Vec<String> = sql[pos + 11..]
                    .split(", ")
                    .map(str::to_string)
                    .collect();
                let values = names
                    .iter()
                    .map(|_| {
                        let key = self.next_key;
                        self.next_key += 1;
                        Value::Int(key)
                    })
                    .collect();
                result.rows.push(Row::new(names, values));
            } else if self.dialect.key_strategy == KeyStrategy::LastInsertId {
                result.generated_keys.push(Value::Int(self.next_key));
                self.next_key += 1;
            }
            return Ok(result);
        }
        Ok(ExecResult::affected(self.affected.pop_front().unwrap_or(1)))
    }

    fn begin(&mut self) -> Result<()> {
        if self.disconnected {
            return Err(Error::disconnected("mock connection lost"));
        }
        self.tx_log.push("BEGIN");
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.disconnected {
            return Err(Error::disconnected("mock connection lost"));
        }
        self.tx_log.push("COMMIT");
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.disconnected {
            return Err(Error::disconnected("mock connection lost"));
        }
        self.tx_log.push("ROLLBACK");
        Ok(())
    }

    fn dialect_profile(&self) -> DialectProfile {
        self.dialect.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.disconnected = true;
        Ok(())
    }
}
