//! Service configuration.
//!
//! Loaded from environment variables. The database URL is held as a
//! `SecretString` and redacted in Debug output.

use common::secret::{redacted_url, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

use crate::actors::attachments::UploadSettings;
use crate::actors::calls::CallSettings;

pub const DEFAULT_HEALTH_BIND_ADDRESS: &str = "0.0.0.0:8081";
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_DB_QUERY_TIMEOUT_SECONDS: u64 = 8;
pub const DEFAULT_CALL_PENDING_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_CALL_MAX_RESTARTS: u32 = 10;
pub const DEFAULT_UPLOAD_INACTIVITY_TIMEOUT_SECONDS: u64 = 15;
pub const DEFAULT_UPLOAD_SWEEP_INTERVAL_SECONDS: u64 = 15;
pub const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Database query timeouts are bounded to this range (seconds).
const DB_QUERY_TIMEOUT_RANGE: std::ops::RangeInclusive<u64> = 1..=8;

#[derive(Clone)]
pub struct Config {
    /// Postgres connection URL.
    pub database_url: SecretString,

    /// Health and metrics bind address.
    pub health_bind_address: String,

    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
    /// Upper bound on any single persistence call made by an actor.
    pub db_query_timeout: Duration,

    pub call_pending_timeout: Duration,
    /// Restarts allowed for the call coordinator before it stops for good.
    pub call_max_restarts: u32,

    pub upload_inactivity_timeout: Duration,
    pub upload_sweep_interval: Duration,

    /// Per-connection outbound queue depth before events are dropped.
    pub outbound_queue_capacity: usize,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &redacted_url(&self.database_url))
            .field("health_bind_address", &self.health_bind_address)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_acquire_timeout", &self.db_acquire_timeout)
            .field("db_query_timeout", &self.db_query_timeout)
            .field("call_pending_timeout", &self.call_pending_timeout)
            .field("call_max_restarts", &self.call_max_restarts)
            .field("upload_inactivity_timeout", &self.upload_inactivity_timeout)
            .field("upload_sweep_interval", &self.upload_sweep_interval)
            .field("outbound_queue_capacity", &self.outbound_queue_capacity)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let vars: HashMap<String, String> = env::vars().collect();
        Self::from_vars(&vars)
    }

    /// Load configuration from a map of variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a required variable is missing or a value
    /// does not parse.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_url = SecretString::from(
            vars.get("DATABASE_URL")
                .ok_or_else(|| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?
                .clone(),
        );

        let health_bind_address = vars
            .get("RTC_HEALTH_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_HEALTH_BIND_ADDRESS.to_string());

        let db_max_connections =
            parse_var(vars, "RTC_DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)?;
        let db_acquire_timeout = seconds_var(
            vars,
            "RTC_DB_ACQUIRE_TIMEOUT_SECONDS",
            DEFAULT_DB_ACQUIRE_TIMEOUT_SECONDS,
        )?;

        let db_query_timeout_seconds = parse_var(
            vars,
            "RTC_DB_QUERY_TIMEOUT_SECONDS",
            DEFAULT_DB_QUERY_TIMEOUT_SECONDS,
        )?;
        if !DB_QUERY_TIMEOUT_RANGE.contains(&db_query_timeout_seconds) {
            return Err(ConfigError::InvalidValue(
                "RTC_DB_QUERY_TIMEOUT_SECONDS".to_string(),
                format!("{db_query_timeout_seconds} is outside 1..=8"),
            ));
        }

        let call_pending_timeout = seconds_var(
            vars,
            "RTC_CALL_PENDING_TIMEOUT_SECONDS",
            DEFAULT_CALL_PENDING_TIMEOUT_SECONDS,
        )?;
        let call_max_restarts =
            parse_var(vars, "RTC_CALL_MAX_RESTARTS", DEFAULT_CALL_MAX_RESTARTS)?;

        let upload_inactivity_timeout = seconds_var(
            vars,
            "RTC_UPLOAD_INACTIVITY_TIMEOUT_SECONDS",
            DEFAULT_UPLOAD_INACTIVITY_TIMEOUT_SECONDS,
        )?;
        let upload_sweep_interval = seconds_var(
            vars,
            "RTC_UPLOAD_SWEEP_INTERVAL_SECONDS",
            DEFAULT_UPLOAD_SWEEP_INTERVAL_SECONDS,
        )?;
        if upload_sweep_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "RTC_UPLOAD_SWEEP_INTERVAL_SECONDS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let outbound_queue_capacity = parse_var(
            vars,
            "RTC_OUTBOUND_QUEUE_CAPACITY",
            DEFAULT_OUTBOUND_QUEUE_CAPACITY,
        )?;
        if outbound_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "RTC_OUTBOUND_QUEUE_CAPACITY".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        Ok(Config {
            database_url,
            health_bind_address,
            db_max_connections,
            db_acquire_timeout,
            db_query_timeout: Duration::from_secs(db_query_timeout_seconds),
            call_pending_timeout,
            call_max_restarts,
            upload_inactivity_timeout,
            upload_sweep_interval,
            outbound_queue_capacity,
        })
    }

    /// Timing and restart settings for the call coordinator.
    #[must_use]
    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            pending_timeout: self.call_pending_timeout,
        }
    }

    /// Timing settings for the attachment upload engine.
    #[must_use]
    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            inactivity_timeout: self.upload_inactivity_timeout,
            sweep_interval: self.upload_sweep_interval,
            db_timeout: self.db_query_timeout,
        }
    }
}

fn parse_var<T: FromStr>(
    vars: &HashMap<String, String>,
    name: &str,
    default: T,
) -> Result<T, ConfigError> {
    match vars.get(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string(), raw.clone())),
    }
}

fn seconds_var(
    vars: &HashMap<String, String>,
    name: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    parse_var(vars, name, default).map(Duration::from_secs)
}
