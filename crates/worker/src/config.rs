//! Worker configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use messaging::{QueueSettings, RetryPolicy};
use saga::{CoordinatorConfig, PublishPolicies, PublishPolicy};

use crate::error::{Result, WorkerError};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{other}' (expected text or json)")),
        }
    }
}

/// Worker configuration with defaults.
///
/// Reads from environment variables:
/// - `HOST`, `PORT`: ops listener (default `0.0.0.0:3000`)
/// - `RUST_LOG`: tracing filter directive (default `info`)
/// - `LOG_FORMAT`: `text` or `json` (default `text`)
/// - `PUBLISH_MAX_ATTEMPTS`, `PUBLISH_BASE_DELAY_MS`, `PUBLISH_CONFIRM_TIMEOUT_MS`
/// - `PREPARE_TIMEOUT_SECS`
/// - `QUEUE_MESSAGE_TTL_MS`, `QUEUE_DELIVERY_LIMIT`
/// - `TRANSACTION_EVENT_POLICY`, `BALANCE_EVENT_POLICY`, `NOTIFICATION_EVENT_POLICY`
/// - `EXPIRY_SWEEP_INTERVAL_MS`: how often expired messages are dead-lettered (positive)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub retry: RetryPolicy,
    pub coordinator: CoordinatorConfig,
    pub queues: QueueSettings,
    pub policies: PublishPolicies,
    pub expiry_sweep_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            retry: RetryPolicy::default(),
            coordinator: CoordinatorConfig::default(),
            queues: QueueSettings::default(),
            policies: PublishPolicies::default(),
            expiry_sweep_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through `lookup`, falling back to defaults for
    /// unset keys. Set but unparsable values are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env { lookup: &lookup };

        let retry = RetryPolicy {
            max_attempts: env.parse("PUBLISH_MAX_ATTEMPTS")?.unwrap_or(defaults.retry.max_attempts),
            base_delay: env
                .millis("PUBLISH_BASE_DELAY_MS")?
                .unwrap_or(defaults.retry.base_delay),
            confirm_timeout: env
                .millis("PUBLISH_CONFIRM_TIMEOUT_MS")?
                .unwrap_or(defaults.retry.confirm_timeout),
        };
        if retry.max_attempts == 0 {
            return Err(WorkerError::InvalidConfig {
                key: "PUBLISH_MAX_ATTEMPTS",
                value: "0".to_string(),
                reason: "at least one attempt is required".to_string(),
            });
        }

        let expiry_sweep_interval = env
            .millis("EXPIRY_SWEEP_INTERVAL_MS")?
            .unwrap_or(defaults.expiry_sweep_interval);
        if expiry_sweep_interval.is_zero() {
            return Err(WorkerError::InvalidConfig {
                key: "EXPIRY_SWEEP_INTERVAL_MS",
                value: "0".to_string(),
                reason: "the sweep interval must be positive".to_string(),
            });
        }

        Ok(Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: env.parse("PORT")?.unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: env.parse("LOG_FORMAT")?.unwrap_or(defaults.log_format),
            retry,
            coordinator: CoordinatorConfig {
                prepare_timeout: env
                    .parse::<u64>("PREPARE_TIMEOUT_SECS")?
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.coordinator.prepare_timeout),
            },
            queues: QueueSettings {
                message_ttl: env
                    .millis("QUEUE_MESSAGE_TTL_MS")?
                    .unwrap_or(defaults.queues.message_ttl),
                delivery_limit: env
                    .parse("QUEUE_DELIVERY_LIMIT")?
                    .unwrap_or(defaults.queues.delivery_limit),
            },
            policies: PublishPolicies {
                transaction: env
                    .parse::<PublishPolicy>("TRANSACTION_EVENT_POLICY")?
                    .unwrap_or(defaults.policies.transaction),
                balance: env
                    .parse::<PublishPolicy>("BALANCE_EVENT_POLICY")?
                    .unwrap_or(defaults.policies.balance),
                notification: env
                    .parse::<PublishPolicy>("NOTIFICATION_EVENT_POLICY")?
                    .unwrap_or(defaults.policies.notification),
            },
            expiry_sweep_interval,
        })
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &'static str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(value) = (self.lookup)(key) else {
            return Ok(None);
        };
        value
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| WorkerError::InvalidConfig {
                key,
                reason: e.to_string(),
                value,
            })
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }
}
