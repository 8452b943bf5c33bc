//! Dialect profiles.
//!
//! A [`DialectProfile`] is plain data describing how a backend family spells
//! SQL: identifier quoting, placeholders, boolean literals, how generated
//! keys come back, reserved words and type names. Compilers and Stores take a
//! profile by value; nothing is looked up from global state.

use crate::types::SqlType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

static PLAIN_IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Parameter placeholder syntax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceholderStyle {
    /// `?`
    QuestionMark,
    /// `$1`, `$2`, ...
    Dollar,
    /// `?1`, `?2`, ...
    NumberedQuestion,
}

/// How the backend reports server-generated keys after an INSERT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// `INSERT ... RETURNING <key columns>`
    Returning,
    /// Separate last-insert-id query after the INSERT; single integer keys only.
    LastInsertId,
}

/// Syntactic profile of one backend family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialectProfile {
    pub name: String,
    /// Character used to quote identifiers; doubled when embedded.
    pub quote: char,
    pub placeholder: PlaceholderStyle,
    pub true_literal: String,
    pub false_literal: String,
    pub key_strategy: KeyStrategy,
    /// Upper-case reserved words that must be quoted when used as identifiers.
    pub reserved_words: BTreeSet<String>,
    /// CAST target names; a missing entry means the dialect cannot cast to it.
    pub type_names: BTreeMap<SqlType, String>,
    pub supports_ilike: bool,
    pub supports_full_join: bool,
    /// `INSERT INTO t DEFAULT VALUES`
    pub supports_default_values: bool,
    /// LIMIT value to render when only OFFSET is given; `None` if OFFSET may
    /// appear alone.
    pub unbounded_limit: Option<String>,
}

const COMMON_RESERVED: &[&str] = &[
    "ALL", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN", "CONSTRAINT",
    "CREATE", "CROSS", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE", "END",
    "EXISTS", "FALSE", "FOREIGN", "FROM", "FULL", "GROUP", "HAVING", "IN", "INDEX", "INNER",
    "INSERT", "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "NOT", "NULL", "OFFSET",
    "ON", "OR", "ORDER", "OUTER", "PRIMARY", "REFERENCES", "RIGHT", "SELECT", "SET", "TABLE",
    "THEN", "TO", "TRUE", "UNION", "UNIQUE", "UPDATE", "USING", "VALUES", "WHEN", "WHERE",
    "WITH",
];

fn reserved(extra: &[&str]) -> BTreeSet<String> {
    COMMON_RESERVED
        .iter()
        .chain(extra)
        .map(|w| (*w).to_string())
        .collect()
}

fn type_names(pairs: &[(SqlType, &str)]) -> BTreeMap<SqlType, String> {
    pairs.iter().map(|(t, n)| (*t, (*n).to_string())).collect()
}

impl DialectProfile {
    /// SQLite 3.35+ profile. Uses RETURNING for generated keys.
    pub fn sqlite() -> Self {
        Self {
            name: "sqlite".to_string(),
            quote: '"',
            placeholder: PlaceholderStyle::QuestionMark,
            true_literal: "1".to_string(),
            false_literal: "0".to_string(),
            key_strategy: KeyStrategy::Returning,
            reserved_words: reserved(&["ABORT", "AUTOINCREMENT", "GLOB", "PRAGMA", "REPLACE"]),
            type_names: type_names(&[
                (SqlType::Bool, "INTEGER"),
                (SqlType::Int, "INTEGER"),
                (SqlType::Float, "REAL"),
                (SqlType::Decimal, "NUMERIC"),
                (SqlType::Text, "TEXT"),
                (SqlType::Bytes, "BLOB"),
                (SqlType::Date, "TEXT"),
                (SqlType::Time, "TEXT"),
                (SqlType::DateTime, "TEXT"),
                (SqlType::Uuid, "TEXT"),
                (SqlType::Json, "TEXT"),
            ]),
            supports_ilike: false,
            supports_full_join: true,
            supports_default_values: true,
            unbounded_limit: Some("-1".to_string()),
        }
    }

    pub fn postgres() -> Self {
        Self {
            name: "postgres".to_string(),
            quote: '"',
            placeholder: PlaceholderStyle::Dollar,
            true_literal: "TRUE".to_string(),
            false_literal: "FALSE".to_string(),
            key_strategy: KeyStrategy::Returning,
            reserved_words: reserved(&["ANALYSE", "ANALYZE", "ARRAY", "ILIKE", "RETURNING", "USER"]),
            type_names: type_names(&[
                (SqlType::Bool, "BOOLEAN"),
                (SqlType::Int, "BIGINT"),
                (SqlType::Float, "DOUBLE PRECISION"),
                (SqlType::Decimal, "NUMERIC"),
                (SqlType::Text, "TEXT"),
                (SqlType::Bytes, "BYTEA"),
                (SqlType::Date, "DATE"),
                (SqlType::Time, "TIME"),
                (SqlType::DateTime, "TIMESTAMP"),
                (SqlType::Uuid, "UUID"),
                (SqlType::Json, "JSONB"),
            ]),
            supports_ilike: true,
            supports_full_join: true,
            supports_default_values: true,
            unbounded_limit: None,
        }
    }

    /// MySQL profile. Generated keys come from `LAST_INSERT_ID()`.
    pub fn mysql() -> Self {
        Self {
            name: "mysql".to_string(),
            quote: '`',
            placeholder: PlaceholderStyle::QuestionMark,
            true_literal: "TRUE".to_string(),
            false_literal: "FALSE".to_string(),
            key_strategy: KeyStrategy::LastInsertId,
            reserved_words: reserved(&["DATABASE", "DIV", "INTERVAL", "KEYS", "RANGE", "REGEXP"]),
            type_names: type_names(&[
                (SqlType::Int, "SIGNED"),
                (SqlType::Float, "DOUBLE"),
                (SqlType::Decimal, "DECIMAL(65, 30)"),
                (SqlType::Text, "CHAR"),
                (SqlType::Bytes, "BINARY"),
                (SqlType::Date, "DATE"),
                (SqlType::Time, "TIME"),
                (SqlType::DateTime, "DATETIME"),
                (SqlType::Json, "JSON"),
            ]),
            supports_ilike: false,
            supports_full_join: false,
            supports_default_values: false,
            unbounded_limit: Some("18446744073709551615".to_string()),
        }
    }

    pub fn with_key_strategy(mut self, strategy: KeyStrategy) -> Self {
        self.key_strategy = strategy;
        self
    }

    pub fn is_reserved(&self, word: &str) -> bool {
        self.reserved_words.contains(&word.to_ascii_uppercase())
    }

    /// Quote `name` only when it is a reserved word or not a plain identifier.
    pub fn quote_identifier(&self, name: &str) -> String {
        if PLAIN_IDENTIFIER.is_match(name) && !self.is_reserved(name) {
            return name.to_string();
        }
        let q = self.quote;
        let escaped = name.replace(q, &format!("{q}{q}"));
        format!("{q}{escaped}{q}")
    }

    /// Placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self.placeholder {
            PlaceholderStyle::QuestionMark => "?".to_string(),
            PlaceholderStyle::Dollar => format!("${}", index),
            PlaceholderStyle::NumberedQuestion => format!("?{}", index),
        }
    }

    pub fn bool_literal(&self, value: bool) -> &str {
        if value {
            &self.true_literal
        } else {
            &self.false_literal
        }
    }

    pub fn type_name(&self, ty: SqlType) -> Option<&str> {
        self.type_names.get(&ty).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_identifiers_stay_bare() {
        let d = DialectProfile::sqlite();
        assert_eq!(d.quote_identifier("person"), "person");
        assert_eq!(d.quote_identifier("parent_id"), "parent_id");
    }

    #[test]
    fn test_reserved_words_quoted_case_insensitively() {
        let d = DialectProfile::postgres();
        assert_eq!(d.quote_identifier("order"), "\"order\"");
        assert_eq!(d.quote_identifier("User"), "\"User\"");
        let m = DialectProfile::mysql();
        assert_eq!(m.quote_identifier("order"), "`order`");
    }

    #[test]
    fn test_embedded_quotes_doubled() {
        let d = DialectProfile::sqlite();
        assert_eq!(d.quote_identifier("we\"ird"), "\"we\"\"ird\"");
        let m = DialectProfile::mysql();
        assert_eq!(m.quote_identifier("a`b"), "`a``b`");
        assert_eq!(m.quote_identifier("with space"), "`with space`");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(DialectProfile::sqlite().placeholder(3), "?");
        assert_eq!(DialectProfile::postgres().placeholder(3), "$3");
        let mut d = DialectProfile::sqlite();
        d.placeholder = PlaceholderStyle::NumberedQuestion;
        assert_eq!(d.placeholder(2), "?2");
    }

    #[test]
    fn test_bool_literals_and_types() {
        assert_eq!(DialectProfile::sqlite().bool_literal(true), "1");
        assert_eq!(DialectProfile::postgres().bool_literal(false), "FALSE");
        assert_eq!(DialectProfile::mysql().type_name(SqlType::Uuid), None);
        assert_eq!(
            DialectProfile::postgres().type_name(SqlType::Json),
            Some("JSONB")
        );
    }

    #[test]
    fn test_key_strategy_override_and_serde() {
        let d = DialectProfile::sqlite().with_key_strategy(KeyStrategy::LastInsertId);
        assert_eq!(d.key_strategy, KeyStrategy::LastInsertId);
        let json = serde_json::to_string(&d).unwrap();
        let back: DialectProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }
}
