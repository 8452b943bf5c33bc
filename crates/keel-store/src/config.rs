//! Store configuration.

use keel_core::Result;
use serde::{Deserialize, Serialize};

/// Configuration for Store behavior.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use keel_store::StoreConfig;
///
/// let config = StoreConfig::from_json(r#"{"optimistic_lock": true}"#).unwrap();
/// assert!(config.optimistic_lock);
/// assert!(config.autoflush);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Fail with `StaleObjectError` when an UPDATE matches no row.
    pub optimistic_lock: bool,
    /// Flush before queries, key lookups and lazy loads of unsaved objects.
    pub autoflush: bool,
    /// Reuse compiled SQL for statements of the same shape.
    pub fast_compiler: bool,
    /// Capacity of the compiled statement cache.
    pub statement_cache_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            optimistic_lock: false,
            autoflush: true,
            fast_compiler: true,
            statement_cache_size: 256,
        }
    }
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn optimistic_lock(mut self, enabled: bool) -> Self {
        self.optimistic_lock = enabled;
        self
    }

    pub fn autoflush(mut self, enabled: bool) -> Self {
        self.autoflush = enabled;
        self
    }

    pub fn fast_compiler(mut self, enabled: bool) -> Self {
        self.fast_compiler = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert!(!config.optimistic_lock);
        assert!(config.autoflush);
        assert!(config.fast_compiler);
        assert_eq!(config.statement_cache_size, 256);
    }

    #[test]
    fn test_partial_json() {
        let config =
            StoreConfig::from_json(r#"{"autoflush": false, "statement_cache_size": 8}"#).unwrap();
        assert!(!config.autoflush);
        assert_eq!(config.statement_cache_size, 8);
        assert!(config.fast_compiler);
    }

    #[test]
    fn test_bad_json_is_serde_error() {
        let err = StoreConfig::from_json(r#"{"autoflush": "yes"}"#).unwrap_err();
        assert!(matches!(err, keel_core::Error::Serde(_)));
    }
}
