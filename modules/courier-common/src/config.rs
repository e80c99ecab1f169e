use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::CourierError;

/// Tenant used for events that carry no tenant of their own.
pub const DEFAULT_TENANT: &str = "default";

/// Delivery tuning shared by the unit of work and the projector.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxConfig {
    /// Failed projector publishes before a row goes terminal (`ERR`).
    pub max_retry: u32,
    /// Rows claimed per projector cycle.
    pub batch_size: usize,

    // Immediate publish after commit
    pub publish_attempts: u32,
    pub publish_backoff_base: Duration,
    pub publish_backoff_multiplier: f64,
    pub publish_backoff_max: Duration,

    // Projector pacing
    pub poll_interval_busy: Duration,
    pub poll_interval_idle: Duration,
    pub publish_timeout: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_retry: 5,
            batch_size: 200,
            publish_attempts: 3,
            publish_backoff_base: Duration::from_millis(100),
            publish_backoff_multiplier: 2.0,
            publish_backoff_max: Duration::from_secs(2),
            poll_interval_busy: Duration::from_millis(100),
            poll_interval_idle: Duration::from_secs(2),
            publish_timeout: Duration::from_secs(10),
        }
    }
}

impl OutboxConfig {
    /// Load from `COURIER_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, CourierError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CourierError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            max_retry: parsed(&lookup, "COURIER_MAX_RETRY", defaults.max_retry)?,
            batch_size: parsed(&lookup, "COURIER_BATCH_SIZE", defaults.batch_size)?,
            publish_attempts: parsed(&lookup, "COURIER_PUBLISH_ATTEMPTS", defaults.publish_attempts)?,
            publish_backoff_base: millis(&lookup, "COURIER_PUBLISH_BACKOFF_MS", defaults.publish_backoff_base)?,
            publish_backoff_multiplier: parsed(
                &lookup,
                "COURIER_PUBLISH_BACKOFF_MULTIPLIER",
                defaults.publish_backoff_multiplier,
            )?,
            publish_backoff_max: millis(&lookup, "COURIER_PUBLISH_BACKOFF_MAX_MS", defaults.publish_backoff_max)?,
            poll_interval_busy: millis(&lookup, "COURIER_POLL_BUSY_MS", defaults.poll_interval_busy)?,
            poll_interval_idle: millis(&lookup, "COURIER_POLL_IDLE_MS", defaults.poll_interval_idle)?,
            publish_timeout: millis(&lookup, "COURIER_PUBLISH_TIMEOUT_MS", defaults.publish_timeout)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CourierError> {
        if self.max_retry == 0 {
            return Err(CourierError::Config("COURIER_MAX_RETRY must be at least 1".into()));
        }
        if i32::try_from(self.max_retry).is_err() {
            return Err(CourierError::Config(format!(
                "COURIER_MAX_RETRY must be at most {}",
                i32::MAX
            )));
        }
        if self.batch_size == 0 {
            return Err(CourierError::Config("COURIER_BATCH_SIZE must be at least 1".into()));
        }
        if self.publish_backoff_multiplier < 1.0 {
            return Err(CourierError::Config(
                "COURIER_PUBLISH_BACKOFF_MULTIPLIER must be >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Settings for the relay binary.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub database_url: String,
    pub tenants: Vec<String>,
    pub workers_per_tenant: usize,
    pub webhook_url: Option<String>,
    pub outbox: OutboxConfig,
}

impl RelayConfig {
    pub fn from_env() -> Result<Self, CourierError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, CourierError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .ok_or_else(|| CourierError::Config("DATABASE_URL environment variable is required".into()))?;

        let tenants: Vec<String> = lookup("COURIER_TENANTS")
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let tenants = if tenants.is_empty() {
            vec![DEFAULT_TENANT.to_string()]
        } else {
            tenants
        };

        let workers_per_tenant = parsed(&lookup, "COURIER_WORKERS_PER_TENANT", 1usize)?;
        if workers_per_tenant == 0 {
            return Err(CourierError::Config(
                "COURIER_WORKERS_PER_TENANT must be at least 1".into(),
            ));
        }

        Ok(Self {
            database_url,
            tenants,
            workers_per_tenant,
            webhook_url: lookup("COURIER_WEBHOOK_URL").filter(|u| !u.is_empty()),
            outbox: OutboxConfig::from_lookup(&lookup)?,
        })
    }

    /// Log the effective configuration with credentials stripped.
    pub fn log_redacted(&self) {
        info!(
            database_url = %redact_url(&self.database_url),
            tenants = ?self.tenants,
            workers_per_tenant = self.workers_per_tenant,
            webhook = self.webhook_url.is_some(),
            max_retry = self.outbox.max_retry,
            batch_size = self.outbox.batch_size,
            "Relay configuration"
        );
    }
}

fn redact_url(raw: &str) -> String {
    match url::Url::parse(raw) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("***"));
            }
            parsed.to_string()
        }
        Err(_) => "<unparseable>".to_string(),
    }
}

fn parsed<T, F>(lookup: &F, key: &str, default: T) -> Result<T, CourierError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CourierError::Config(format!("{key} has an invalid value: {raw:?}"))),
    }
}

fn millis<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, CourierError>
where
    F: Fn(&str) -> Option<String>,
{
    let ms: u64 = parsed(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
