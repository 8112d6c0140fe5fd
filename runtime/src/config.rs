//! Configuration for the event log.
//!
//! Loads configuration from environment variables with sensible defaults:
//!
//! | variable                           | default |
//! |------------------------------------|---------|
//! | `CHARTLOG_APPEND_MAX_RETRIES`      | 3       |
//! | `CHARTLOG_APPEND_RETRY_INITIAL_MS` | 10      |
//! | `CHARTLOG_APPEND_RETRY_MAX_MS`     | 1000    |
//! | `CHARTLOG_APPEND_TIMEOUT_MS`       | 5000    |

use crate::retry::RetryPolicy;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A variable is set but does not parse.
    #[error("Failed to parse {key}: {value:?}")]
    ParseError {
        /// Variable name.
        key: &'static str,
        /// Offending value.
        value: String,
    },
    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Runtime configuration of [`EventLog`](crate::EventLog).
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogConfig {
    /// Retry policy for appends that lose a sequence race.
    pub retry: RetryPolicy,
    /// Upper bound on one append, retries included.
    pub append_timeout: Duration,
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            append_timeout: Duration::from_secs(5),
        }
    }
}

impl EventLogConfig {
    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// See [`EventLogConfig::from_lookup`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    ///
    /// # Errors
    ///
    /// `ParseError` for a malformed value, `ValidationError` when the result
    /// fails [`EventLogConfig::validate`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let max_retries = parse_or(&lookup, "CHARTLOG_APPEND_MAX_RETRIES", defaults.retry.max_retries)?;
        let initial_ms = parse_or(
            &lookup,
            "CHARTLOG_APPEND_RETRY_INITIAL_MS",
            millis(defaults.retry.initial_delay),
        )?;
        let max_ms = parse_or(
            &lookup,
            "CHARTLOG_APPEND_RETRY_MAX_MS",
            millis(defaults.retry.max_delay),
        )?;
        let timeout_ms = parse_or(
            &lookup,
            "CHARTLOG_APPEND_TIMEOUT_MS",
            millis(defaults.append_timeout),
        )?;

        let config = Self {
            retry: RetryPolicy::builder()
                .max_retries(max_retries)
                .initial_delay(Duration::from_millis(initial_ms))
                .max_delay(Duration::from_millis(max_ms))
                .build(),
            append_timeout: Duration::from_millis(timeout_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.append_timeout.is_zero() {
            return Err(ConfigError::ValidationError(
                "append timeout must be greater than 0".to_string(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::ValidationError(
                "retry initial delay cannot exceed max delay".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(ConfigError::ValidationError(
                "retry jitter must be between 0 and 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConfigError::ValidationError(
                "retry multiplier must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::ParseError { key, value }),
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = EventLogConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EventLogConfig::default());
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.append_timeout, Duration::from_secs(5));
    }

    #[test]
    fn variables_override_defaults() {
        let config = EventLogConfig::from_lookup(lookup(&[
            ("CHARTLOG_APPEND_MAX_RETRIES", "7"),
            ("CHARTLOG_APPEND_RETRY_INITIAL_MS", "25"),
            ("CHARTLOG_APPEND_RETRY_MAX_MS", "400"),
            ("CHARTLOG_APPEND_TIMEOUT_MS", "1500"),
        ]))
        .unwrap();

        assert_eq!(config.retry.max_retries, 7);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(25));
        assert_eq!(config.retry.max_delay, Duration::from_millis(400));
        assert_eq!(config.append_timeout, Duration::from_millis(1500));
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = EventLogConfig::from_lookup(lookup(&[("CHARTLOG_APPEND_MAX_RETRIES", "many")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::ParseError {
                key: "CHARTLOG_APPEND_MAX_RETRIES",
                value: "many".to_string()
            }
        );
    }

    #[test]
    fn invalid_combinations_fail_validation() {
        let zero_timeout = EventLogConfig::from_lookup(lookup(&[("CHARTLOG_APPEND_TIMEOUT_MS", "0")]));
        assert!(matches!(zero_timeout, Err(ConfigError::ValidationError(_))));

        let inverted = EventLogConfig::from_lookup(lookup(&[
            ("CHARTLOG_APPEND_RETRY_INITIAL_MS", "500"),
            ("CHARTLOG_APPEND_RETRY_MAX_MS", "100"),
        ]));
        assert!(matches!(inverted, Err(ConfigError::ValidationError(_))));
    }
}
