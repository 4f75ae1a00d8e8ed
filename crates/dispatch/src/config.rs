//! Dispatcher configuration
//!
//! The configuration surface is keyed by transformation type name: the key
//! set of [`DispatcherConfig::transformations`] is the closed set of types
//! the dispatcher knows about. Unknown types at bootstrap are fatal.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::reliability::DEFAULT_RETRY_CEILING;

/// Default mailbox capacity per worker.
pub const DEFAULT_MAILBOX_CAPACITY: usize = 64;

/// Default number of workers per transformation type.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default backoff slot time.
pub const DEFAULT_BACKOFF_SLOT_TIME: Duration = Duration::from_secs(1);

/// Default backoff minimum delay (the floor added to every wait).
pub const DEFAULT_BACKOFF_MINIMUM_DELAY: Duration = Duration::from_millis(100);

/// Deployment settings for a transformation type
///
/// Describes the libraries a driver stages into its working area when it
/// receives a deploy command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploySettings {
    /// Library URIs to stage
    pub libs: Vec<String>,

    /// Whether archives among `libs` are unpacked after staging
    pub unpack: bool,

    /// Target location the libraries are staged into
    pub location: String,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            libs: vec![],
            unpack: false,
            location: "/tmp/viewflow/libs".to_string(),
        }
    }
}

impl DeploySettings {
    /// Create deployment settings with the given target location
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            ..Default::default()
        }
    }

    /// Add a library URI
    pub fn with_lib(mut self, uri: impl Into<String>) -> Self {
        self.libs.push(uri.into());
        self
    }

    /// Set whether archives are unpacked after staging
    pub fn with_unpack(mut self, unpack: bool) -> Self {
        self.unpack = unpack;
        self
    }
}

/// Per-transformation-type configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformationTypeConfig {
    /// Number of workers in the type's pool
    pub concurrency: usize,

    /// Backoff slot time (base unit of the exponential wait)
    #[serde(with = "duration_millis")]
    pub backoff_slot_time: Duration,

    /// Backoff minimum delay (floor added to every wait)
    #[serde(with = "duration_millis")]
    pub backoff_minimum_delay: Duration,

    /// Consecutive retries before the backoff resets
    pub retry_ceiling: u32,

    /// Upper bound on a single transformation run (unbounded if absent)
    #[serde(default, with = "opt_duration_millis")]
    pub run_timeout: Option<Duration>,

    /// Library deployment settings for this type's drivers
    #[serde(default)]
    pub deploy: DeploySettings,
}

impl Default for TransformationTypeConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            backoff_slot_time: DEFAULT_BACKOFF_SLOT_TIME,
            backoff_minimum_delay: DEFAULT_BACKOFF_MINIMUM_DELAY,
            retry_ceiling: DEFAULT_RETRY_CEILING,
            run_timeout: None,
            deploy: DeploySettings::default(),
        }
    }
}

impl TransformationTypeConfig {
    /// Create a configuration with the given concurrency
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Set the backoff slot time
    pub fn with_backoff_slot_time(mut self, slot: Duration) -> Self {
        self.backoff_slot_time = slot;
        self
    }

    /// Set the backoff minimum delay
    pub fn with_backoff_minimum_delay(mut self, delay: Duration) -> Self {
        self.backoff_minimum_delay = delay;
        self
    }

    /// Set the retry ceiling
    pub fn with_retry_ceiling(mut self, ceiling: u32) -> Self {
        self.retry_ceiling = ceiling.max(1);
        self
    }

    /// Set the run timeout
    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }

    /// Set the deployment settings
    pub fn with_deploy(mut self, deploy: DeploySettings) -> Self {
        self.deploy = deploy;
        self
    }
}

/// Shutdown drain behavior
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Abandon queued and in-flight commands at the next opportunity
    Drop,

    /// Complete the command currently being executed before stopping
    #[default]
    FinishInFlight,
}

/// Top-level dispatcher configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use viewflow_dispatch::{DispatcherConfig, TransformationTypeConfig};
///
/// let config = DispatcherConfig::new()
///     .with_transformation(
///         "hive",
///         TransformationTypeConfig::new(4)
///             .with_backoff_slot_time(Duration::from_millis(100)),
///     )
///     .with_transformation("filesystem", TransformationTypeConfig::new(2));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatcherConfig {
    /// Known transformation types and their pool settings
    ///
    /// The key set is the closed set of routable type names.
    pub transformations: BTreeMap<String, TransformationTypeConfig>,

    /// Mailbox capacity per worker
    pub mailbox_capacity: usize,

    /// Shutdown drain behavior
    #[serde(default)]
    pub shutdown: ShutdownMode,

    /// Seed for the per-worker backoff RNGs (entropy-seeded if absent)
    #[serde(default)]
    pub backoff_seed: Option<u64>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            transformations: BTreeMap::new(),
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            shutdown: ShutdownMode::default(),
            backoff_seed: None,
        }
    }
}

impl DispatcherConfig {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a transformation type
    pub fn with_transformation(
        mut self,
        type_name: impl Into<String>,
        config: TransformationTypeConfig,
    ) -> Self {
        self.transformations.insert(type_name.into(), config);
        self
    }

    /// Set the per-worker mailbox capacity
    pub fn with_mailbox_capacity(mut self, capacity: usize) -> Self {
        self.mailbox_capacity = capacity;
        self
    }

    /// Set the shutdown drain behavior
    pub fn with_shutdown(mut self, mode: ShutdownMode) -> Self {
        self.shutdown = mode;
        self
    }

    /// Seed the backoff RNGs for deterministic waits
    pub fn with_backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_seed = Some(seed);
        self
    }

    /// Validate the numeric constraints of this configuration
    ///
    /// Cross-checks against the driver registry (every configured type must
    /// have a registered factory) happen at dispatcher bootstrap.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidMailboxCapacity);
        }
        for (type_name, config) in &self.transformations {
            if config.concurrency == 0 {
                return Err(ConfigError::InvalidConcurrency {
                    type_name: type_name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Errors raised while validating configuration at bootstrap
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A transformation type has no registered driver factory
    #[error("no driver factory registered for transformation type: {type_name}")]
    UnknownTransformationType {
        /// The offending type name
        type_name: String,
    },

    /// Pool concurrency must be at least 1
    #[error("concurrency for transformation type {type_name} must be at least 1")]
    InvalidConcurrency {
        /// The offending type name
        type_name: String,
    },

    /// Mailbox capacity must be at least 1
    #[error("mailbox capacity must be at least 1")]
    InvalidMailboxCapacity,
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_config_defaults() {
        let config = TransformationTypeConfig::default();
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.backoff_slot_time, DEFAULT_BACKOFF_SLOT_TIME);
        assert_eq!(config.backoff_minimum_delay, DEFAULT_BACKOFF_MINIMUM_DELAY);
        assert_eq!(config.retry_ceiling, DEFAULT_RETRY_CEILING);
        assert!(config.run_timeout.is_none());
    }

    #[test]
    fn test_type_config_builder() {
        let config = TransformationTypeConfig::new(2)
            .with_backoff_slot_time(Duration::from_millis(100))
            .with_backoff_minimum_delay(Duration::from_millis(50))
            .with_retry_ceiling(3)
            .with_run_timeout(Duration::from_secs(30));

        assert_eq!(config.concurrency, 2);
        assert_eq!(config.backoff_slot_time, Duration::from_millis(100));
        assert_eq!(config.backoff_minimum_delay, Duration::from_millis(50));
        assert_eq!(config.retry_ceiling, 3);
        assert_eq!(config.run_timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_retry_ceiling_floor() {
        let config = TransformationTypeConfig::new(1).with_retry_ceiling(0);
        assert_eq!(config.retry_ceiling, 1);
    }

    #[test]
    fn test_deploy_settings_builder() {
        let deploy = DeploySettings::new("hdfs:///warehouse/libs")
            .with_lib("hdfs:///artifacts/udfs.jar")
            .with_unpack(true);

        assert_eq!(deploy.location, "hdfs:///warehouse/libs");
        assert_eq!(deploy.libs, vec!["hdfs:///artifacts/udfs.jar"]);
        assert!(deploy.unpack);
    }

    #[test]
    fn test_dispatcher_config_builder() {
        let config = DispatcherConfig::new()
            .with_transformation("hive", TransformationTypeConfig::new(4))
            .with_transformation("filesystem", TransformationTypeConfig::new(2))
            .with_mailbox_capacity(16)
            .with_shutdown(ShutdownMode::Drop);

        assert_eq!(config.transformations.len(), 2);
        assert!(config.transformations.contains_key("hive"));
        assert_eq!(config.mailbox_capacity, 16);
        assert_eq!(config.shutdown, ShutdownMode::Drop);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let config = DispatcherConfig::new()
            .with_transformation("hive", TransformationTypeConfig::new(0));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConcurrency { type_name }) if type_name == "hive"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_mailbox_capacity() {
        let config = DispatcherConfig::new().with_mailbox_capacity(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMailboxCapacity)
        ));
    }

    #[test]
    fn test_serialization_round_trip() {
        let config = DispatcherConfig::new()
            .with_transformation(
                "hive",
                TransformationTypeConfig::new(4)
                    .with_run_timeout(Duration::from_secs(600))
                    .with_deploy(DeploySettings::new("/srv/libs").with_lib("a.jar")),
            )
            .with_backoff_seed(7);

        let json = serde_json::to_string(&config).expect("should serialize");
        let parsed: DispatcherConfig = serde_json::from_str(&json).expect("should deserialize");

        assert_eq!(config, parsed);
    }
}
