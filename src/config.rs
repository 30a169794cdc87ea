//! Configuration loader and validator for the outbox relay.
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub database: Database,
    #[serde(default)]
    pub worker: WorkerOptions,
    pub dispatcher: DispatcherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Database {
    pub url: String,
}

/// Longest lease a worker may take (one day).
pub const MAX_LEASE_DURATION_MS: u64 = 24 * 60 * 60 * 1000;

/// Polling worker settings. Every field falls back to its default when
/// omitted from the file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerOptions {
    /// Number of worker tasks sharing the store.
    pub instances: usize,
    pub poll_interval_ms: u64,
    pub max_batch_size: usize,
    /// Must exceed the worst-case dispatch latency, or live work is reclaimed.
    pub lease_duration_ms: u64,
    /// Attempts allowed before a message is failed for good; 0 disables the ceiling.
    pub max_retry_count: u32,
    /// Pause after a cycle broke down unexpectedly.
    pub recovery_delay_ms: u64,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            instances: 1,
            poll_interval_ms: 10_000,
            max_batch_size: 10,
            lease_duration_ms: 30_000,
            max_retry_count: 5,
            recovery_delay_ms: 15_000,
        }
    }
}

impl WorkerOptions {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instances == 0 {
            return Err(ConfigError::Invalid("worker.instances must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("worker.poll_interval_ms must be > 0"));
        }
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("worker.max_batch_size must be > 0"));
        }
        if self.lease_duration_ms == 0 {
            return Err(ConfigError::Invalid("worker.lease_duration_ms must be > 0"));
        }
        if self.lease_duration_ms > MAX_LEASE_DURATION_MS {
            return Err(ConfigError::Invalid(
                "worker.lease_duration_ms must be at most one day",
            ));
        }
        if self.recovery_delay_ms < self.poll_interval_ms {
            return Err(ConfigError::Invalid(
                "worker.recovery_delay_ms must be >= worker.poll_interval_ms",
            ));
        }
        Ok(())
    }
}

/// Where reserved messages are delivered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatcherConfig {
    Webhook(WebhookConfig),
    /// Log each message and treat it as delivered.
    Log,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_content_type() -> String {
    "application/json".to_string()
}

impl Config {
    /// `DATABASE_URL` wins over `database.url` when set.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| self.database.url.clone())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.database.url.trim().is_empty() {
        return Err(ConfigError::Invalid("database.url must be non-empty"));
    }
    cfg.worker.validate()?;

    if let DispatcherConfig::Webhook(hook) = &cfg.dispatcher {
        if Url::parse(&hook.url).is_err() {
            return Err(ConfigError::Invalid("dispatcher.url must be a valid URL"));
        }
        if hook.timeout_ms == 0 {
            return Err(ConfigError::Invalid("dispatcher.timeout_ms must be > 0"));
        }
        // A lease shorter than the request timeout hands live work to another worker.
        if hook.timeout_ms >= cfg.worker.lease_duration_ms {
            return Err(ConfigError::Invalid(
                "dispatcher.timeout_ms must be < worker.lease_duration_ms",
            ));
        }
    }
    Ok(())
}

/// Returns a complete example configuration file.
pub fn example() -> &'static str {
    r#"database:
  url: "sqlite://./data/outbox.db"

worker:
  instances: 2
  poll_interval_ms: 10000
  max_batch_size: 10
  lease_duration_ms: 30000
  max_retry_count: 5
  recovery_delay_ms: 15000

dispatcher:
  kind: webhook
  url: "http://localhost:8080/events"
  timeout_ms: 5000
  content_type: "application/json"
  bearer_token: null
"#
}
