// ABOUTME: Configuration loading for the fieldsync client.
// ABOUTME: Reads FIELDSYNC_* environment variables and turns them into paths, endpoints, and a RetryPolicy.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fieldsync_core::RetryPolicy;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid number: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("FIELDSYNC_MAX_ATTEMPTS must be at least 1")]
    ZeroAttempts,
}

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub home: PathBuf,
    pub remote_url: Option<String>,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub request_timeout: Duration,
    pub start_online: bool,
}

impl SyncConfig {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - FIELDSYNC_HOME: data directory (default: ~/.fieldsync)
    /// - FIELDSYNC_REMOTE_URL: base URL of the record service (optional)
    /// - FIELDSYNC_MAX_ATTEMPTS: failed attempts before a change is abandoned (default: 3)
    /// - FIELDSYNC_BACKOFF_BASE_MS: first retry delay (default: 2000)
    /// - FIELDSYNC_BACKOFF_MAX_MS: retry delay cap (default: 300000)
    /// - FIELDSYNC_REQUEST_TIMEOUT_SECS: per-call timeout (default: 30)
    /// - FIELDSYNC_START_ONLINE: assume the remote is reachable at startup (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("FIELDSYNC_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                std::env::var("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from("/tmp"))
                    .join(".fieldsync")
            });

        let remote_url = std::env::var("FIELDSYNC_REMOTE_URL")
            .ok()
            .filter(|u| !u.is_empty());

        let max_attempts: u32 = number("FIELDSYNC_MAX_ATTEMPTS", 3)?;
        if max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }

        let backoff_base = Duration::from_millis(number("FIELDSYNC_BACKOFF_BASE_MS", 2_000)?);
        let backoff_max = Duration::from_millis(number("FIELDSYNC_BACKOFF_MAX_MS", 300_000)?);
        let request_timeout = Duration::from_secs(number("FIELDSYNC_REQUEST_TIMEOUT_SECS", 30)?);

        let start_online = std::env::var("FIELDSYNC_START_ONLINE")
            .map(|v| !(v == "false" || v == "0" || v == "no"))
            .unwrap_or(true);

        Ok(Self {
            home,
            remote_url,
            max_attempts,
            backoff_base,
            backoff_max,
            request_timeout,
            start_online,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max.max(self.backoff_base),
            request_timeout: self.request_timeout,
        }
    }
}

fn number<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        _ => Ok(default),
    }
}
