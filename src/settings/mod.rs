//! Loading and validation of settings.
//!
//! Values defined in the configuration file can be overridden by environment variables with the
//! prefix `FL`, where nested sections are separated by `__`. An example configuration file can
//! be found in the `configs/` directory located in the repository root.

use std::{fmt, path::Path, time::Duration};

use config::{Config, ConfigError, Environment};
use redis::{ConnectionInfo, IntoConnectionInfo};
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationError, ValidationErrors};

use crate::{
    aggregator::WeightingStrategy,
    crypto::DEFAULT_FRESHNESS_WINDOW,
    storage::redis::RetryPolicy,
};

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Validate, Deserialize)]
/// The combined settings.
///
/// Each section in the configuration file corresponds to the identically named settings field.
pub struct Settings {
    pub log: LoggingSettings,
    #[serde(default)]
    pub store: StoreSettings,
    pub redis: RedisSettings,
    #[validate]
    pub security: SecuritySettings,
    #[validate]
    pub aggregation: AggregationSettings,
    #[serde(default)]
    #[validate]
    pub retention: RetentionSettings,
}

impl Settings {
    /// Loads and validates the settings via a configuration file.
    ///
    /// # Errors
    /// Fails when the loading of the configuration file or its validation failed.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let settings: Settings = Self::load(path)?;
        settings.validate()?;
        Ok(settings)
    }

    fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                Environment::with_prefix("FL")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()
    }
}

/// The key-value store backend.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// A Redis server, see [`RedisSettings`].
    Redis,
    /// An in-process store. Its state is lost when the process exits and is invisible to other
    /// processes, so it is only usable by an application that embeds the coordinator library.
    Memory,
}

impl StoreBackend {
    /// Whether separate coordinator processes see the same state through this backend.
    pub fn is_shared(&self) -> bool {
        match self {
            StoreBackend::Redis => true,
            StoreBackend::Memory => false,
        }
    }
}

/// Store settings.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct StoreSettings {
    /// The store backend.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [store]
    /// backend = "redis"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_STORE__BACKEND=memory
    /// ```
    pub backend: StoreBackend,
    /// The number of times a store request is retried after a transient failure.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// The delay before the first retry in milliseconds. It doubles with every retry.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl StoreSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Redis,
            retries: default_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

fn default_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    50
}

/// A secret that is never printed.
#[derive(Deserialize, Clone, PartialEq, Eq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret([redacted])")
    }
}

/// Security settings.
#[derive(Debug, Validate, Deserialize, Clone)]
#[validate(schema(function = "validate_security"))]
pub struct SecuritySettings {
    /// The shared secret that sites sign their updates with.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [security]
    /// hmac_secret = "change-me"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_SECURITY__HMAC_SECRET=change-me
    /// ```
    pub hmac_secret: Secret,
    /// How far the timestamp of an update may be away from the server time, in milliseconds.
    /// Nonces are remembered for the same duration.
    #[serde(default = "default_freshness_window_ms")]
    #[validate(range(min = 1))]
    pub freshness_window_ms: u64,
    /// The maximal size of a raw update in bytes.
    #[serde(default = "default_max_payload_bytes")]
    #[validate(range(min = 1))]
    pub max_payload_bytes: usize,
}

impl SecuritySettings {
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }
}

fn validate_security(s: &SecuritySettings) -> Result<(), ValidationError> {
    if s.hmac_secret.is_empty() {
        Err(ValidationError::new("empty hmac secret"))
    } else {
        Ok(())
    }
}

fn default_freshness_window_ms() -> u64 {
    DEFAULT_FRESHNESS_WINDOW
}

fn default_max_payload_bytes() -> usize {
    5 * 1024 * 1024
}

/// Aggregation settings.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
#[validate(schema(function = "validate_aggregation"))]
pub struct AggregationSettings {
    /// The minimal number of updates a round aggregates. Rounds with fewer updates return
    /// them to the pending state.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [aggregation]
    /// min_participants = 3
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_AGGREGATION__MIN_PARTICIPANTS=3
    /// ```
    #[validate(range(min = 1))]
    pub min_participants: u64,
    /// The number of pending updates at which the scheduler triggers a round. Must not be
    /// smaller than `min_participants`.
    pub threshold: u64,
    /// How the weight of a participant is derived from its update.
    ///
    /// One of `data_size`, `uniform` or `data_quality`.
    #[serde(default)]
    pub weighting: WeightingStrategy,
    /// The interval of the scheduler in seconds.
    #[serde(default = "default_interval_secs")]
    #[validate(range(min = 1))]
    pub interval_secs: u64,
    /// The time limit of a single request in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    #[validate(range(min = 1))]
    pub request_timeout_ms: u64,
}

impl AggregationSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn validate_aggregation(s: &AggregationSettings) -> Result<(), ValidationError> {
    // the validate attribute only accepts literals, therefore we check the invariant here
    if s.min_participants <= s.threshold {
        Ok(())
    } else {
        Err(ValidationError::new("threshold below min_participants"))
    }
}

fn default_interval_secs() -> u64 {
    30
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

/// Retention settings. All durations are in seconds.
#[derive(Debug, Validate, Deserialize, Clone, Copy)]
pub struct RetentionSettings {
    /// The time to live of a pending or processing update.
    #[validate(range(min = 1))]
    pub pending_ttl_secs: u64,
    /// The time to live of a model version.
    #[validate(range(min = 1))]
    pub version_ttl_secs: u64,
    /// The time to live of the latest model pointer.
    #[validate(range(min = 1))]
    pub latest_ttl_secs: u64,
    /// The number of version ids kept in the history of a model.
    #[validate(range(min = 1))]
    pub history_len: usize,
    /// The time to live of the round lock. A round must finish within it.
    #[validate(range(min = 1))]
    pub lock_ttl_secs: u64,
}

impl RetentionSettings {
    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn version_ttl(&self) -> Duration {
        Duration::from_secs(self.version_ttl_secs)
    }

    pub fn latest_ttl(&self) -> Duration {
        Duration::from_secs(self.latest_ttl_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            pending_ttl_secs: 3600,
            version_ttl_secs: 604_800,
            latest_ttl_secs: 86_400,
            history_len: 10,
            lock_ttl_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize)]
/// Redis settings.
pub struct RedisSettings {
    /// The URL where Redis is running.
    ///
    /// The format of the URL is `redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]`.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [redis]
    /// url = "redis://127.0.0.1/"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_REDIS__URL=redis://127.0.0.1/
    /// ```
    #[serde(deserialize_with = "deserialize_redis_url")]
    pub url: ConnectionInfo,
}

fn deserialize_redis_url<'de, D>(deserializer: D) -> Result<ConnectionInfo, D::Error>
where
    D: Deserializer<'de>,
{
    struct ConnectionInfoVisitor;

    impl<'de> Visitor<'de> for ConnectionInfoVisitor {
        type Value = ConnectionInfo;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(
                formatter,
                "redis://[<username>][:<passwd>@]<hostname>[:port][/<db>]"
            )
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            value
                .into_connection_info()
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(ConnectionInfoVisitor)
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives. More information about logging directives
    /// can be found [here].
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FL_LOG__FILTER=info
    /// ```
    ///
    /// [here]: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive: https://docs.rs/tracing-subscriber/0.3/tracing_subscriber/filter/struct.EnvFilter.html#directives")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}
