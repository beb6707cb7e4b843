//! Configuration management for the client.

use aquapin_engine::SyncConfig;
use std::env;
use std::time::Duration;

/// Client configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Backend base URL used when no server override is stored
    pub api_url: String,
    /// SQLite connection URL for the durable store
    pub database_url: String,
    /// Timeout for each HTTP request
    pub request_timeout: Duration,
    /// Timeout for the connectivity probe
    pub probe_timeout: Duration,
    /// Rejections before a queued action is set aside; 0 retries forever
    pub max_sync_attempts: u32,
    /// How long a server copy of a pond is served without refetching
    pub pond_fresh_for: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url =
            env::var("AQUAPIN_API_URL").unwrap_or_else(|_| "http://127.0.0.1:8000".to_string());

        let database_url = env::var("AQUAPIN_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://aquapin.db?mode=rwc".to_string());

        let request_timeout = Duration::from_secs(number("AQUAPIN_REQUEST_TIMEOUT_SECS", 10)?);
        let probe_timeout = Duration::from_millis(number("AQUAPIN_PROBE_TIMEOUT_MS", 1500)?);
        let max_sync_attempts = number("AQUAPIN_MAX_SYNC_ATTEMPTS", 5)?;
        let pond_fresh_for = Duration::from_secs(number("AQUAPIN_POND_FRESH_SECS", 300)?);

        if !api_url.starts_with("http://") && !api_url.starts_with("https://") {
            return Err(ConfigError::InvalidApiUrl(api_url));
        }

        Ok(Self {
            api_url,
            database_url,
            request_timeout,
            probe_timeout,
            max_sync_attempts,
            pond_fresh_for,
        })
    }

    /// Engine settings derived from this configuration.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            request_timeout: self.request_timeout,
            max_attempts: self.max_sync_attempts,
            pond_fresh_for: self.pond_fresh_for,
            ..SyncConfig::default()
        }
    }
}

fn number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("AQUAPIN_API_URL must be an http(s) URL, got '{0}'")]
    InvalidApiUrl(String),

    #[error("{var} must be a non-negative integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_carries_timeouts() {
        let config = Config {
            api_url: "http://127.0.0.1:8000".into(),
            database_url: "sqlite::memory:".into(),
            request_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_millis(200),
            max_sync_attempts: 2,
            pond_fresh_for: Duration::from_secs(60),
        };

        let sync = config.sync_config();
        assert_eq!(sync.request_timeout, Duration::from_secs(3));
        assert_eq!(sync.max_attempts, 2);
        assert_eq!(sync.pond_fresh_for, Duration::from_secs(60));
        assert_eq!(sync.reference_fields, SyncConfig::default().reference_fields);
    }

    #[test]
    fn bad_number_names_variable() {
        let err = ConfigError::InvalidNumber {
            var: "AQUAPIN_MAX_SYNC_ATTEMPTS",
            value: "many".into(),
        };
        assert_eq!(
            err.to_string(),
            "AQUAPIN_MAX_SYNC_ATTEMPTS must be a non-negative integer, got 'many'"
        );
    }
}
