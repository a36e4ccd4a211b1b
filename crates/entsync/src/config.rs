//! Data manager configuration.

use entsync_core::{Error, Result};
use entsync_query::{DEFAULT_MAX_BATCH_SIZE, LoaderConfig};
use entsync_session::{CoordinatorConfig, DEFAULT_UNIQUE_CONSTRAINT_PATTERN, FlushMode};
use serde::{Deserialize, Serialize};

/// Default number of entries kept by the shared result cache.
pub const DEFAULT_CACHE_CAPACITY: usize = 1024;

/// Configuration for a [`DataManager`](crate::DataManager).
///
/// Every field has a default, so a configuration file only needs the keys it
/// changes:
///
/// ```ignore
/// let config = PersistenceConfig::from_json(r#"{ "flush_mode": "commit", "max_batch_size": 500 }"#)?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Whether cacheable queries use the shared result cache.
    pub cache_enabled: bool,
    /// Entries kept by the result cache before least recently used ones go.
    pub cache_capacity: usize,
    /// Identifiers per query when loading by identifier batch.
    pub max_batch_size: usize,
    /// Bound on traversal rounds per flush or commit pass.
    pub max_flush_iterations: usize,
    /// Regex with one capture group extracting the constraint name from
    /// session errors.
    pub unique_constraint_pattern: String,
    /// Whether removals of soft-deletable entities are soft by default.
    pub soft_deletion: bool,
    pub flush_mode: FlushMode,
    /// User recorded in `deleted_by` on soft deletion.
    pub deleted_by: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            max_flush_iterations: 100,
            unique_constraint_pattern: DEFAULT_UNIQUE_CONSTRAINT_PATTERN.to_string(),
            soft_deletion: true,
            flush_mode: FlushMode::Auto,
            deleted_by: None,
        }
    }
}

impl PersistenceConfig {
    /// Create a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document, filling missing keys with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid persistence configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Enable or disable the shared result cache (builder pattern).
    #[must_use]
    pub fn with_cache_enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    /// Set the result cache capacity (builder pattern).
    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Set the identifier batch size (builder pattern).
    #[must_use]
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the traversal round limit (builder pattern).
    #[must_use]
    pub fn with_max_flush_iterations(mut self, n: usize) -> Self {
        self.max_flush_iterations = n;
        self
    }

    /// Set the unique constraint extraction pattern (builder pattern).
    #[must_use]
    pub fn with_unique_constraint_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.unique_constraint_pattern = pattern.into();
        self
    }

    /// Set the default removal mode for soft-deletable entities (builder pattern).
    #[must_use]
    pub fn with_soft_deletion(mut self, enabled: bool) -> Self {
        self.soft_deletion = enabled;
        self
    }

    /// Set the default flush mode of new transactions (builder pattern).
    #[must_use]
    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    /// Set the user recorded on soft deletion (builder pattern).
    #[must_use]
    pub fn with_deleted_by(mut self, user: impl Into<String>) -> Self {
        self.deleted_by = Some(user.into());
        self
    }

    /// Reject settings no component can work with.
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".to_string()));
        }
        if self.max_flush_iterations == 0 {
            return Err(Error::Config(
                "max_flush_iterations must be at least 1".to_string(),
            ));
        }
        if self.cache_enabled && self.cache_capacity == 0 {
            return Err(Error::Config(
                "cache_capacity must be at least 1 when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_flush_iterations: self.max_flush_iterations,
            unique_constraint_pattern: self.unique_constraint_pattern.clone(),
            deleted_by: self.deleted_by.clone(),
            flush_mode: self.flush_mode,
            soft_deletion: self.soft_deletion,
        }
    }

    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig::default()
            .with_cache_enabled(self.cache_enabled)
            .with_max_batch_size(self.max_batch_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PersistenceConfig::default();
        assert!(config.cache_enabled);
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.max_flush_iterations, 100);
        assert_eq!(config.flush_mode, FlushMode::Auto);
        assert!(config.soft_deletion);
        assert!(config.deleted_by.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = PersistenceConfig::new()
            .with_cache_enabled(false)
            .with_max_batch_size(50)
            .with_flush_mode(FlushMode::Commit)
            .with_deleted_by("admin");

        let coordinator = config.coordinator_config();
        assert_eq!(coordinator.flush_mode, FlushMode::Commit);
        assert_eq!(coordinator.deleted_by.as_deref(), Some("admin"));

        let loader = config.loader_config();
        assert!(!loader.cache_enabled);
        assert_eq!(loader.max_batch_size, 50);
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let config =
            PersistenceConfig::from_json(r#"{ "flush_mode": "commit", "cache_capacity": 8 }"#)
                .unwrap();
        assert_eq!(config.flush_mode, FlushMode::Commit);
        assert_eq!(config.cache_capacity, 8);
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
        assert_eq!(
            config.unique_constraint_pattern,
            DEFAULT_UNIQUE_CONSTRAINT_PATTERN
        );
    }

    #[test]
    fn test_from_json_rejects_bad_input() {
        assert!(matches!(
            PersistenceConfig::from_json(r#"{ "flush_mode": "sometimes" }"#),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            PersistenceConfig::from_json(r#"{ "max_batch_size": 0 }"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_disabled_cache_allows_zero_capacity() {
        let config = PersistenceConfig::new()
            .with_cache_enabled(false)
            .with_cache_capacity(0);
        assert!(config.validate().is_ok());
    }
}
