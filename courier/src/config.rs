use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::jobs::{BackoffPolicy, StoreSettings, WorkerOptions};
#[cfg(feature = "redis")]
use crate::jobs::{JobError, RedisStore};

pub use config::ConfigError;

/// Load any deserializable struct from environment variables.
///
/// Field names map to upper-case variables (`smtp_host` ← `SMTP_HOST`); with a
/// prefix, `COURIER` + `max_attempts` ← `COURIER_MAX_ATTEMPTS`.
pub trait EnvConfig: Sized {
    fn from_env() -> Result<Self, ConfigError>;
    fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError>;
}

impl<D> EnvConfig for D
where
    D: DeserializeOwned,
{
    fn from_env() -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize()
    }

    fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(config::Environment::with_prefix(prefix))
            .build()?
            .try_deserialize()
    }
}

/// Queue, worker and transport settings for an
/// [`EmailService`](crate::EmailService).
///
/// | Variable | Default |
/// |----------|---------|
/// | `COURIER_CONCURRENCY` | 5 |
/// | `COURIER_MAX_ATTEMPTS` | 3 |
/// | `COURIER_BACKOFF_BASE_MS` | 2000 |
/// | `COURIER_BACKOFF_MAX_MS` | 300000 |
/// | `COURIER_VISIBILITY_TIMEOUT_MS` | 30000 |
/// | `COURIER_STALL_CHECK_INTERVAL_MS` | 5000 |
/// | `COURIER_POLL_INTERVAL_MS` | 1000 |
/// | `COURIER_REMOVE_ON_COMPLETE` | false |
/// | `COURIER_RETENTION_SECS` | unset (keep forever) |
/// | `COURIER_MAX_CONNECTIONS` | 5 |
/// | `COURIER_MIN_SEND_INTERVAL_MS` | 100 |
/// | `COURIER_FROM` | `noreply@localhost` |
/// | `COURIER_APP_NAME` | `Courier` |
/// | `COURIER_REDIS_URL` | unset |
#[derive(Debug, Clone, Deserialize)]
pub struct CourierConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_visibility_timeout_ms")]
    pub visibility_timeout_ms: u64,
    #[serde(default = "default_stall_check_interval_ms")]
    pub stall_check_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub remove_on_complete: bool,
    #[serde(default)]
    pub retention_secs: Option<u64>,
    /// Upper bound on simultaneous SMTP sends.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
    /// Default sender address.
    #[serde(default = "default_from")]
    pub from: String,
    /// Brand shown in the layout header and footer.
    #[serde(default = "default_app_name")]
    pub app_name: String,
    #[serde(default)]
    pub redis_url: Option<String>,
}

fn default_concurrency() -> usize {
    5
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    2000
}

fn default_backoff_max_ms() -> u64 {
    300_000
}

fn default_visibility_timeout_ms() -> u64 {
    30_000
}

fn default_stall_check_interval_ms() -> u64 {
    5000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_connections() -> u32 {
    5
}

fn default_min_send_interval_ms() -> u64 {
    100
}

fn default_from() -> String {
    "noreply@localhost".to_string()
}

fn default_app_name() -> String {
    "Courier".to_string()
}

impl Default for CourierConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            visibility_timeout_ms: default_visibility_timeout_ms(),
            stall_check_interval_ms: default_stall_check_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            remove_on_complete: false,
            retention_secs: None,
            max_connections: default_max_connections(),
            min_send_interval_ms: default_min_send_interval_ms(),
            from: default_from(),
            app_name: default_app_name(),
            redis_url: None,
        }
    }
}

impl CourierConfig {
    /// Load `COURIER_*` variables, reading a `.env` file first if present.
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_with_prefix("COURIER")
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
        )
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            backoff: self.backoff(),
            visibility_timeout: Duration::from_millis(self.visibility_timeout_ms),
            remove_on_complete: self.remove_on_complete,
        }
    }

    pub fn worker_options(&self) -> WorkerOptions {
        WorkerOptions {
            concurrency: self.concurrency.max(1),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            stall_check_interval: Duration::from_millis(self.stall_check_interval_ms),
            retention: self.retention_secs.map(Duration::from_secs),
        }
    }

    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }

    /// The durable store at `redis_url`, or `None` when no URL is configured.
    #[cfg(feature = "redis")]
    pub fn redis_store(&self) -> Result<Option<RedisStore>, JobError> {
        self.redis_url
            .as_deref()
            .map(|url| RedisStore::new(url, None, self.store_settings()))
            .transpose()
    }
}
