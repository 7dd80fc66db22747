//! Stage configuration
//!
//! Configuration is plain serde data with sensible defaults. It can be
//! loaded from a TOML file, from `TROUPE_*` environment variables, or from a
//! file with environment overrides layered on top. Every loading path runs
//! [`Validate::validate`] before handing the configuration out.

use crate::{
    error::ConfigError,
    eviction::DirectoryEvictionConfiguration,
    supervision::SupervisionStrategy,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default environment variable prefix
pub const ENV_PREFIX: &str = "TROUPE";

/// Configuration validation trait
pub trait Validate {
    fn validate(&self) -> Result<(), ConfigError>;
}

/// Complete configuration of a [`Stage`](crate::stage::Stage)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Directory partitioning
    pub directory: DirectoryConfig,
    /// Stored eviction configuration; `None` disables eviction unless forced
    pub eviction: Option<DirectoryEvictionConfiguration>,
    /// Dispatcher thread pool
    pub dispatcher: DispatcherConfig,
    /// Number of addresses in the eventual-result pool
    pub completes_pool_size: usize,
    /// How many times stop polls the directory for stragglers
    pub stop_drain_retries: u32,
    /// Pause between stop drain polls
    pub stop_drain_interval: Duration,
    /// Strategy of the stage default supervisor
    pub default_supervision: SupervisionStrategy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            directory: DirectoryConfig::default(),
            eviction: None,
            dispatcher: DispatcherConfig::default(),
            completes_pool_size: 10,
            stop_drain_retries: 10,
            stop_drain_interval: Duration::from_millis(10),
            default_supervision: SupervisionStrategy::default(),
        }
    }
}

/// Directory partitioning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Number of independently locked buckets
    pub buckets: usize,
    /// Initial capacity of each bucket
    pub initial_capacity: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            buckets: 32,
            initial_capacity: 32,
        }
    }
}

/// What a sender experiences when the dispatcher is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureStrategy {
    /// Reject immediately with `MailboxOverflow`
    Fail,
    /// Wait up to `block_timeout` for space, then reject
    Block,
}

impl FromStr for BackpressureStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail" => Ok(BackpressureStrategy::Fail),
            "block" => Ok(BackpressureStrategy::Block),
            other => Err(format!("unknown backpressure strategy '{other}'")),
        }
    }
}

/// Dispatcher thread pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of dispatch threads
    pub pool_size: usize,
    /// Bound on undelivered user messages across all actors
    pub queue_capacity: usize,
    /// Wake idle threads on every send
    pub notify_on_send: bool,
    /// Spin/yield rounds before an idle thread parks
    pub throttling_count: u32,
    /// Park duration of an idle thread
    pub backoff_timeout: Duration,
    /// Maximum user messages handled per actor turn
    pub throughput: usize,
    /// Behavior when `queue_capacity` is exhausted
    pub backpressure: BackpressureStrategy,
    /// Longest wait under [`BackpressureStrategy::Block`]
    pub block_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            queue_capacity: 65_536,
            notify_on_send: true,
            throttling_count: 10,
            backoff_timeout: Duration::from_millis(10),
            throughput: 8,
            backpressure: BackpressureStrategy::Fail,
            block_timeout: Duration::from_millis(100),
        }
    }
}

impl Validate for DirectoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.buckets == 0 {
            return Err(invalid("directory.buckets", "must be greater than 0"));
        }
        if self.initial_capacity == 0 {
            return Err(invalid("directory.initial_capacity", "must be greater than 0"));
        }
        Ok(())
    }
}

impl Validate for DispatcherConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(invalid("dispatcher.pool_size", "must be greater than 0"));
        }
        if self.queue_capacity == 0 {
            return Err(invalid("dispatcher.queue_capacity", "must be greater than 0"));
        }
        if self.throughput == 0 {
            return Err(invalid("dispatcher.throughput", "must be greater than 0"));
        }
        if self.backoff_timeout.is_zero() {
            return Err(invalid("dispatcher.backoff_timeout", "must be non-zero"));
        }
        Ok(())
    }
}

impl Validate for StageConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.directory.validate()?;
        self.dispatcher.validate()?;
        if let Some(eviction) = &self.eviction {
            eviction.validate()?;
        }
        if self.completes_pool_size == 0 {
            return Err(invalid("completes_pool_size", "must be greater than 0"));
        }
        if self.default_supervision.period.is_zero() {
            return Err(invalid("default_supervision.period", "must be non-zero"));
        }
        Ok(())
    }
}

pub(crate) fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

impl StageConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path.as_ref()).map_err(|_| ConfigError::FileNotFound {
                path: path.as_ref().display().to_string(),
            })?;

        let config: StageConfig = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults with `TROUPE_*` environment overrides
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let mut config = StageConfig::default();
        config.apply_env_overrides(ENV_PREFIX)?;
        config.validate()?;
        Ok(config)
    }

    /// File configuration with environment overrides under `env_prefix`
    pub fn load_with_overrides<P: AsRef<Path>>(
        path: P,
        env_prefix: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides(env_prefix.unwrap_or(ENV_PREFIX))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `{prefix}_*` environment variables on top of this configuration
    pub fn apply_env_overrides(&mut self, prefix: &str) -> Result<(), ConfigError> {
        let dispatcher = &mut self.dispatcher;
        if let Some(v) = env_value(prefix, "POOL_SIZE")? {
            dispatcher.pool_size = v;
        }
        if let Some(v) = env_value(prefix, "QUEUE_CAPACITY")? {
            dispatcher.queue_capacity = v;
        }
        if let Some(v) = env_value(prefix, "NOTIFY_ON_SEND")? {
            dispatcher.notify_on_send = v;
        }
        if let Some(v) = env_value(prefix, "THROTTLING_COUNT")? {
            dispatcher.throttling_count = v;
        }
        if let Some(v) = env_value::<u64>(prefix, "BACKOFF_TIMEOUT_MS")? {
            dispatcher.backoff_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_value(prefix, "THROUGHPUT")? {
            dispatcher.throughput = v;
        }
        if let Some(v) = env_value(prefix, "BACKPRESSURE")? {
            dispatcher.backpressure = v;
        }
        if let Some(v) = env_value::<u64>(prefix, "BLOCK_TIMEOUT_MS")? {
            dispatcher.block_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_value(prefix, "DIRECTORY_BUCKETS")? {
            self.directory.buckets = v;
        }
        if let Some(v) = env_value(prefix, "DIRECTORY_INITIAL_CAPACITY")? {
            self.directory.initial_capacity = v;
        }
        if let Some(v) = env_value(prefix, "COMPLETES_POOL_SIZE")? {
            self.completes_pool_size = v;
        }
        if let Some(enabled) = env_value::<bool>(prefix, "EVICTION_ENABLED")? {
            self.eviction
                .get_or_insert_with(DirectoryEvictionConfiguration::default)
                .enabled = enabled;
        }
        Ok(())
    }
}

fn env_value<T>(prefix: &str, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: ToString,
{
    let var = format!("{prefix}_{key}");
    match std::env::var(&var) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::EnvVarError {
                var,
                reason: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervision::SupervisionScope;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_stage_config_defaults() {
        let config = StageConfig::default();
        assert_eq!(config.directory.buckets, 32);
        assert_eq!(config.directory.initial_capacity, 32);
        assert_eq!(config.dispatcher.queue_capacity, 65_536);
        assert!(config.dispatcher.notify_on_send);
        assert_eq!(config.dispatcher.throttling_count, 10);
        assert_eq!(config.dispatcher.backoff_timeout, Duration::from_millis(10));
        assert_eq!(config.dispatcher.backpressure, BackpressureStrategy::Fail);
        assert_eq!(config.completes_pool_size, 10);
        assert_eq!(config.stop_drain_retries, 10);
        assert_eq!(config.default_supervision.intensity, 1);
        assert_eq!(config.default_supervision.period, Duration::from_secs(5));
        assert_eq!(config.default_supervision.scope, SupervisionScope::One);
        assert!(config.eviction.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_pool() {
        let mut config = StageConfig::default();
        config.dispatcher.pool_size = 0;
        match config.validate() {
            Err(ConfigError::ValidationError { field, .. }) => {
                assert_eq!(field, "dispatcher.pool_size")
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
completes_pool_size = 4

[dispatcher]
pool_size = 2
throughput = 16
backpressure = "block"

[eviction]
enabled = true
full_ratio_high_mark = 0.5
"#
        )
        .unwrap();

        let config = StageConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.completes_pool_size, 4);
        assert_eq!(config.dispatcher.pool_size, 2);
        assert_eq!(config.dispatcher.throughput, 16);
        assert_eq!(config.dispatcher.backpressure, BackpressureStrategy::Block);
        assert_eq!(config.dispatcher.queue_capacity, 65_536);
        let eviction = config.eviction.unwrap();
        assert!(eviction.enabled);
        assert_eq!(eviction.full_ratio_high_mark, 0.5);
        assert_eq!(eviction.lru_threshold, Duration::from_secs(120));
    }

    #[test]
    fn test_missing_file() {
        let err = StageConfig::load_from_file("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "dispatcher = 12").unwrap();
        let err = StageConfig::load_from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher]\npool_size = 3").unwrap();

        std::env::set_var("TROUPE_CFG_TEST_POOL_SIZE", "5");
        std::env::set_var("TROUPE_CFG_TEST_BACKPRESSURE", "block");
        std::env::set_var("TROUPE_CFG_TEST_EVICTION_ENABLED", "true");
        let config = StageConfig::load_with_overrides(file.path(), Some("TROUPE_CFG_TEST")).unwrap();
        assert_eq!(config.dispatcher.pool_size, 5);
        assert_eq!(config.dispatcher.backpressure, BackpressureStrategy::Block);
        assert!(config.eviction.map(|e| e.enabled).unwrap_or(false));

        std::env::set_var("TROUPE_CFG_BAD_THROUGHPUT", "lots");
        let mut config = StageConfig::default();
        let err = config.apply_env_overrides("TROUPE_CFG_BAD").unwrap_err();
        assert!(matches!(err, ConfigError::EnvVarError { ref var, .. } if var == "TROUPE_CFG_BAD_THROUGHPUT"));
    }
}
