//! # Pipeline Configuration
//!
//! YAML-loadable settings for the queue, dispatcher, bulk migration and
//! supervisor, plus the handler bindings.
//!
//! ```yaml
//! queue:
//!   capacity: 1000
//! dispatcher:
//!   shutdown_timeout_ms: 30000
//! migration:
//!   batch_size: ${MIGRATION_BATCH_SIZE:-1000}
//! bindings:
//!   - entity_type: users
//!     handler: warehouse
//!     table: dim_users
//!     fields: [id, email]
//! ```
//!
//! `${VAR}` and `${VAR:-default}` are expanded from the environment before
//! parsing.

use crate::common::{CdcError, Result, DEFAULT_QUEUE_CAPACITY};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use validator::Validate;

/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    #[serde(default)]
    #[validate(nested)]
    pub queue: QueueConfig,

    #[serde(default)]
    #[validate(nested)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    #[validate(nested)]
    pub migration: MigrationConfig,

    #[serde(default)]
    #[validate(nested)]
    pub supervisor: SupervisorConfig,

    /// Handler bindings, resolved by name at startup
    #[serde(default)]
    #[validate(nested)]
    pub bindings: Vec<BindingConfig>,
}

/// Bounded change queue settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct QueueConfig {
    #[serde(default = "default_capacity")]
    #[validate(range(min = 1, max = 1_000_000))]
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
        }
    }
}

/// Dispatcher worker pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct DispatcherConfig {
    /// Worker count; defaults to one per subscribed entity type
    #[serde(default)]
    #[validate(range(min = 1, max = 1024))]
    pub workers: Option<usize>,

    /// How long an idle worker blocks on dequeue before re-checking
    #[serde(default = "default_dequeue_timeout_ms")]
    #[validate(range(min = 1))]
    pub dequeue_timeout_ms: u64,

    /// Grace period for in-flight events on shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl DispatcherConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: None,
            dequeue_timeout_ms: default_dequeue_timeout_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

/// Bulk migration settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct MigrationConfig {
    /// Run bulk migration for types without a resume position
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Rows per scan page
    #[serde(default = "default_batch_size")]
    #[validate(range(min = 1, max = 100_000))]
    pub batch_size: usize,

    /// Attempts per page before the migration fails
    #[serde(default = "default_max_retries")]
    #[validate(range(min = 1, max = 20))]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// How long startup waits for the live queue to drain
    #[serde(default = "default_drain_timeout_ms")]
    #[validate(range(min = 1))]
    pub drain_timeout_ms: u64,
}

impl MigrationConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based), doubling each time.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

/// Liveness supervisor settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct SupervisorConfig {
    #[serde(default = "default_check_interval_ms")]
    #[validate(range(min = 10))]
    pub check_interval_ms: u64,

    /// Restart tracker and dispatcher when the pipeline is not live
    #[serde(default = "default_true")]
    pub auto_restart: bool,
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            auto_restart: true,
        }
    }
}

/// One handler binding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct BindingConfig {
    #[validate(length(min = 1))]
    pub entity_type: String,

    /// Name of a handler supplied by the hosting process
    #[validate(length(min = 1))]
    pub handler: String,

    #[validate(length(min = 1))]
    pub table: String,

    /// Projected fields (empty = all)
    #[serde(default)]
    pub fields: Vec<String>,
}

impl BindingConfig {
    pub fn new(
        entity_type: impl Into<String>,
        handler: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            handler: handler.into(),
            table: table.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = fields.into_iter().map(Into::into).collect();
        self
    }
}

fn default_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_dequeue_timeout_ms() -> u64 {
    86_400_000
}

fn default_shutdown_timeout_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_drain_timeout_ms() -> u64 {
    300_000
}

fn default_check_interval_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    /// Preset for large backlogs: deep queue, big scan pages.
    pub fn high_throughput() -> Self {
        Self {
            queue: QueueConfig { capacity: 10_000 },
            migration: MigrationConfig {
                batch_size: 5_000,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Preset for constrained hosts: shallow queue, small scan pages.
    pub fn low_memory() -> Self {
        Self {
            queue: QueueConfig { capacity: 100 },
            migration: MigrationConfig {
                batch_size: 200,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Parse and validate YAML, expanding environment variables first.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate field ranges and binding uniqueness.
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self)?;

        let mut seen = HashSet::new();
        for binding in &self.bindings {
            if !seen.insert((binding.entity_type.as_str(), binding.handler.as_str())) {
                return Err(CdcError::config(format!(
                    "handler '{}' bound twice to '{}'",
                    binding.handler, binding.entity_type
                )));
            }
        }
        Ok(())
    }

    /// Distinct entity types named by the bindings, sorted.
    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .bindings
            .iter()
            .map(|b| b.entity_type.clone())
            .collect();
        types.sort();
        types.dedup();
        types
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug, Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

impl PipelineConfigBuilder {
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue.capacity = capacity;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.dispatcher.workers = Some(workers);
        self
    }

    pub fn dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatcher.dequeue_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.dispatcher.shutdown_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn migration_enabled(mut self, enabled: bool) -> Self {
        self.config.migration.enabled = enabled;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.migration.batch_size = size;
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.migration.max_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.migration.retry_backoff_ms = saturating_millis(backoff);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.migration.drain_timeout_ms = saturating_millis(timeout);
        self
    }

    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.config.supervisor.check_interval_ms = saturating_millis(interval);
        self
    }

    pub fn auto_restart(mut self, enabled: bool) -> Self {
        self.config.supervisor.auto_restart = enabled;
        self
    }

    pub fn binding(mut self, binding: BindingConfig) -> Self {
        self.config.bindings.push(binding);
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<PipelineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.queue.capacity, 1000);
        assert_eq!(config.dispatcher.workers, None);
        assert_eq!(config.dispatcher.dequeue_timeout(), Duration::from_secs(86_400));
        assert_eq!(config.dispatcher.shutdown_timeout(), Duration::from_secs(30));
        assert!(config.migration.enabled);
        assert_eq!(config.migration.drain_timeout(), Duration::from_secs(300));
        assert!(config.supervisor.auto_restart);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_yaml_with_defaults() {
        let config = PipelineConfig::from_yaml_str(
            r#"
queue:
  capacity: 2
bindings:
  - entity_type: users
    handler: warehouse
    table: dim_users
    fields: [id, email]
  - entity_type: orders
    handler: warehouse
    table: fact_orders
"#,
        )
        .unwrap();

        assert_eq!(config.queue.capacity, 2);
        assert_eq!(config.migration.batch_size, 1000);
        assert_eq!(config.bindings[0].fields, vec!["id", "email"]);
        assert!(config.bindings[1].fields.is_empty());
        assert_eq!(config.entity_types(), vec!["orders", "users"]);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("SLUICE_TEST_BATCH", "250");
        let config = PipelineConfig::from_yaml_str(
            r#"
migration:
  batch_size: ${SLUICE_TEST_BATCH}
  max_retries: ${SLUICE_TEST_UNSET_RETRIES:-5}
"#,
        )
        .unwrap();

        assert_eq!(config.migration.batch_size, 250);
        assert_eq!(config.migration.max_retries, 5);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = PipelineConfig::from_yaml_str("queue:\n  capacity: 0\n").unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));

        let err = PipelineConfig::builder()
            .binding(BindingConfig::new("", "h", "t"))
            .build()
            .unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));

        let err = PipelineConfig::builder()
            .binding(BindingConfig::new("users", "h", "a"))
            .binding(BindingConfig::new("users", "h", "b"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("bound twice"));
    }

    #[test]
    fn test_malformed_yaml() {
        let err = PipelineConfig::from_yaml_str("queue: [").unwrap_err();
        assert!(matches!(err, CdcError::Serialization(_)));
    }

    #[test]
    fn test_builder_durations_saturate() {
        let config = PipelineConfig::builder()
            .dequeue_timeout(Duration::MAX)
            .drain_timeout(Duration::MAX)
            .retry_backoff(Duration::MAX)
            .build()
            .unwrap();

        assert_eq!(config.dispatcher.dequeue_timeout_ms, u64::MAX);
        assert_eq!(config.migration.drain_timeout_ms, u64::MAX);
        assert_eq!(config.migration.retry_backoff_ms, u64::MAX);
    }

    #[test]
    fn test_retry_delay_doubles_and_saturates() {
        let mut migration = MigrationConfig {
            retry_backoff_ms: 100,
            ..Default::default()
        };
        assert_eq!(migration.retry_delay(1), Duration::from_millis(200));
        assert_eq!(migration.retry_delay(3), Duration::from_millis(800));

        migration.retry_backoff_ms = u64::MAX / 2;
        assert_eq!(migration.retry_delay(2), Duration::from_millis(u64::MAX));
    }

    #[test]
    fn test_builder_and_presets() {
        let config = PipelineConfig::builder()
            .queue_capacity(2)
            .workers(3)
            .shutdown_timeout(Duration::from_secs(1))
            .migration_enabled(false)
            .check_interval(Duration::from_millis(50))
            .build()
            .unwrap();

        assert_eq!(config.queue.capacity, 2);
        assert_eq!(config.dispatcher.workers, Some(3));
        assert_eq!(config.dispatcher.shutdown_timeout_ms, 1_000);
        assert!(!config.migration.enabled);
        assert_eq!(config.supervisor.check_interval(), Duration::from_millis(50));

        assert!(PipelineConfig::high_throughput().validate().is_ok());
        assert!(PipelineConfig::low_memory().queue.capacity < DEFAULT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "supervisor:\n  auto_restart: false").unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert!(!config.supervisor.auto_restart);

        assert!(PipelineConfig::from_file("/nonexistent/sluice.yaml").is_err());
    }
}
