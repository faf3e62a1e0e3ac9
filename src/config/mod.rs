//! Library configuration.
//!
//! Aggregates the settings of every component into a single `CarrierConfig`
//! that can be loaded from YAML files or environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::storage::{StorageConfig, StorageOptions};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "carrier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CARRIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CARRIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CARRIER_LOG";

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration.
///
/// Durations are written in (possibly fractional) seconds, e.g.
/// `failed_retry_interval_secs: 0.5`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CarrierConfig {
    /// Consumer group used when a subscriber names none.
    pub default_group_name: String,
    /// Appended to every group as `"{group}.{version}"`.
    pub version: String,
    /// Prepended to every topic as `"{prefix}.{topic}"`.
    pub topic_name_prefix: Option<String>,
    /// Retry ceiling per message.
    pub failed_retry_count: u32,
    /// Pause between retry sweeps.
    #[serde(rename = "failed_retry_interval_secs", with = "secs")]
    pub failed_retry_interval: Duration,
    /// Rows younger than this are left to the happy path.
    #[serde(rename = "retry_min_age_secs", with = "secs")]
    pub retry_min_age: Duration,
    /// Rows fetched per retry sweep and kind.
    pub retry_batch_size: u32,
    /// Retention of `Succeeded` rows.
    #[serde(rename = "succeed_message_expired_after_secs", with = "secs")]
    pub succeed_message_expired_after: Duration,
    /// Pause between expiry sweeps.
    #[serde(rename = "collector_interval_secs", with = "secs")]
    pub collector_interval: Duration,
    /// Rows deleted per `delete_expired` call.
    pub collector_batch_size: u32,
    /// Concurrent handler invocations per consumer group.
    pub consumer_thread_count: usize,
    /// Outbound workers draining the dispatch queue.
    pub producer_workers: usize,
    /// Capacity of the outbound dispatch queue.
    pub producer_queue_capacity: usize,
    /// Upper bound on graceful shutdown.
    #[serde(rename = "shutdown_timeout_secs", with = "secs")]
    pub shutdown_timeout: Duration,
    /// Snowflake worker id (10 bits).
    pub worker_id: u16,
    /// Storage backend selection.
    pub storage: StorageConfig,
}

impl Default for CarrierConfig {
    fn default() -> Self {
        Self {
            default_group_name: "carrier.queue".to_string(),
            version: "v1".to_string(),
            topic_name_prefix: None,
            failed_retry_count: 50,
            failed_retry_interval: Duration::from_secs(60),
            retry_min_age: Duration::from_secs(10),
            retry_batch_size: 200,
            succeed_message_expired_after: Duration::from_secs(24 * 3600),
            collector_interval: Duration::from_secs(300),
            collector_batch_size: 1000,
            consumer_thread_count: 1,
            producer_workers: 1,
            producer_queue_capacity: 5000,
            shutdown_timeout: Duration::from_secs(60),
            worker_id: 0,
            storage: StorageConfig::default(),
        }
    }
}

impl CarrierConfig {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `carrier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: CarrierConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_group_name.is_empty() {
            return Err(ConfigError::Invalid(
                "default_group_name must not be empty".to_string(),
            ));
        }
        if self.version.is_empty() {
            return Err(ConfigError::Invalid("version must not be empty".to_string()));
        }
        if self.consumer_thread_count == 0 {
            return Err(ConfigError::Invalid(
                "consumer_thread_count must be at least 1".to_string(),
            ));
        }
        if self.producer_workers == 0 || self.producer_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "producer_workers and producer_queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.retry_batch_size == 0 || self.collector_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "batch sizes must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Retry and retention parameters for the store.
    pub fn storage_options(&self) -> StorageOptions {
        StorageOptions {
            failed_retry_count: self.failed_retry_count,
            retry_min_age: self.retry_min_age,
            retry_batch_size: self.retry_batch_size,
            succeed_expired_after: self.succeed_message_expired_after,
        }
    }

    /// Group and topic naming rules.
    pub fn naming(&self) -> Naming {
        Naming {
            default_group: self.default_group_name.clone(),
            version: self.version.clone(),
            topic_prefix: self
                .topic_name_prefix
                .clone()
                .filter(|prefix| !prefix.is_empty()),
        }
    }
}

/// How logical topic and group names map to broker names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    default_group: String,
    version: String,
    topic_prefix: Option<String>,
}

impl Naming {
    /// Fully-qualified group: `"{group}.{version}"`, defaulting the group.
    pub fn group(&self, group: Option<&str>) -> String {
        format!("{}.{}", group.unwrap_or(&self.default_group), self.version)
    }

    /// Broker topic for a logical name.
    pub fn topic(&self, name: &str) -> String {
        match &self.topic_prefix {
            Some(prefix) => format!("{}.{}", prefix, name),
            None => name.to_string(),
        }
    }
}

impl Default for Naming {
    fn default() -> Self {
        CarrierConfig::default().naming()
    }
}

/// Serde adapter for durations written as seconds.
mod secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
