//! Application configuration.
//!
//! Aggregates broker, resilience and connection settings into a single
//! `Config` that can be loaded from YAML files and environment variables.

use std::time::Duration;

use serde::Deserialize;

use crate::broker::BrokerConfig;
use crate::channel::ChannelBinding;
use crate::resilience::ResilienceConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "conveyor.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CONVEYOR_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "CONVEYOR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CONVEYOR_LOG";

const DEFAULT_PERFORMERS: usize = 1;
const DEFAULT_TIMEOUT_MS: u64 = 1000;
const DEFAULT_REQUEUE_LIMIT: u32 = 3;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub resilience: ResilienceConfig,
    /// Queue subscriptions, started in this order.
    pub connections: Vec<ConnectionConfig>,
}

/// One named queue subscription.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionConfig {
    /// Unique name used to shut and reopen the connection.
    pub name: String,
    pub queue: String,
    pub routing_key: String,
    /// Key into the message mapper registry.
    pub request_type: String,
    /// Concurrent performers pumping this queue.
    #[serde(default = "default_performers")]
    pub performers: usize,
    /// Longest a performer blocks in a single receive.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Requeues allowed for a transiently failing message before it is
    /// rejected.
    #[serde(default = "default_requeue_limit")]
    pub requeue_limit: u32,
}

fn default_performers() -> usize {
    DEFAULT_PERFORMERS
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_requeue_limit() -> u32 {
    DEFAULT_REQUEUE_LIMIT
}

impl ConnectionConfig {
    pub fn new(
        name: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
        request_type: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            request_type: request_type.into(),
            performers: DEFAULT_PERFORMERS,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            requeue_limit: DEFAULT_REQUEUE_LIMIT,
        }
    }

    pub fn with_performers(mut self, performers: usize) -> Self {
        self.performers = performers;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_requeue_limit(mut self, requeue_limit: u32) -> Self {
        self.requeue_limit = requeue_limit;
        self
    }

    pub fn binding(&self) -> ChannelBinding {
        ChannelBinding::new(self.queue.clone(), self.routing_key.clone())
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `conveyor.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
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

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that do not need a mapper registry. The dispatcher builder
    /// validates the rest.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for connection in &self.connections {
            if connection.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "connection on queue '{}' has no name",
                    connection.queue
                )));
            }
            if connection.timeout_ms == 0 {
                return Err(ConfigError::Invalid(format!(
                    "connection '{}' has a zero receive timeout",
                    connection.name
                )));
            }
        }
        Ok(())
    }
}
