//! Session engine configuration.

use std::env;

use thiserror::Error;

/// Access token lifetime: 1 hour.
pub const DEFAULT_ACCESS_TOKEN_VALIDITY_SECS: i64 = 3600;

/// Refresh token lifetime: 100 days.
pub const DEFAULT_REFRESH_TOKEN_VALIDITY_MINS: i64 = 144_000;

/// Dynamic signing keys are replaced weekly.
pub const DEFAULT_DYNAMIC_KEY_UPDATE_INTERVAL_HOURS: i64 = 168;

/// A new dynamic key is published this long before it starts signing.
pub const DEFAULT_DYNAMIC_KEY_OVERLAP_MS: i64 = 60_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Read-only inputs to the session engine. All durations are milliseconds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionConfig {
    pub access_token_validity_ms: i64,
    pub refresh_token_validity_ms: i64,
    pub dynamic_key_update_interval_ms: i64,
    pub dynamic_key_overlap_ms: i64,
    /// Sign with dynamic keys unless a session asks for the static key.
    pub access_token_signing_key_dynamic: bool,
    /// Always consult the store on verify, even when the caller does not ask.
    pub access_token_blacklisting: bool,
    /// Anti-CSRF for sessions whose creator did not say either way.
    pub anti_csrf: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            access_token_validity_ms: DEFAULT_ACCESS_TOKEN_VALIDITY_SECS * 1000,
            refresh_token_validity_ms: DEFAULT_REFRESH_TOKEN_VALIDITY_MINS * 60 * 1000,
            dynamic_key_update_interval_ms: DEFAULT_DYNAMIC_KEY_UPDATE_INTERVAL_HOURS * 3600 * 1000,
            dynamic_key_overlap_ms: DEFAULT_DYNAMIC_KEY_OVERLAP_MS,
            access_token_signing_key_dynamic: true,
            access_token_blacklisting: false,
            anti_csrf: true,
        }
    }
}

impl SessionConfig {
    /// Reads configuration from environment variables with sensible defaults.
    ///
    /// | Variable                                            | Unit    | Default  |
    /// |-----------------------------------------------------|---------|----------|
    /// | `ACCESS_TOKEN_VALIDITY`                             | seconds | `3600`   |
    /// | `REFRESH_TOKEN_VALIDITY`                            | minutes | `144000` |
    /// | `ACCESS_TOKEN_DYNAMIC_SIGNING_KEY_UPDATE_INTERVAL`  | hours   | `168`    |
    /// | `ACCESS_TOKEN_SIGNING_KEY_DYNAMIC`                  | bool    | `true`   |
    /// | `ACCESS_TOKEN_BLACKLISTING`                         | bool    | `false`  |
    /// | `ANTI_CSRF`                                         | bool    | `true`   |
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            access_token_validity_ms: env_i64("ACCESS_TOKEN_VALIDITY")?
                .map_or(defaults.access_token_validity_ms, |s| s * 1000),
            refresh_token_validity_ms: env_i64("REFRESH_TOKEN_VALIDITY")?
                .map_or(defaults.refresh_token_validity_ms, |m| m * 60 * 1000),
            dynamic_key_update_interval_ms: env_i64(
                "ACCESS_TOKEN_DYNAMIC_SIGNING_KEY_UPDATE_INTERVAL",
            )?
            .map_or(defaults.dynamic_key_update_interval_ms, |h| h * 3600 * 1000),
            dynamic_key_overlap_ms: defaults.dynamic_key_overlap_ms,
            access_token_signing_key_dynamic: env_bool("ACCESS_TOKEN_SIGNING_KEY_DYNAMIC")?
                .unwrap_or(defaults.access_token_signing_key_dynamic),
            access_token_blacklisting: env_bool("ACCESS_TOKEN_BLACKLISTING")?
                .unwrap_or(defaults.access_token_blacklisting),
            anti_csrf: env_bool("ANTI_CSRF")?.unwrap_or(defaults.anti_csrf),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject durations that would make tokens unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.access_token_validity_ms <= 0 {
            return Err(ConfigError::ValidationError(
                "access token validity must be positive".into(),
            ));
        }
        if self.refresh_token_validity_ms <= self.access_token_validity_ms {
            return Err(ConfigError::ValidationError(
                "refresh token validity must be longer than access token validity".into(),
            ));
        }
        if self.dynamic_key_update_interval_ms <= 0 {
            return Err(ConfigError::ValidationError(
                "dynamic signing key update interval must be positive".into(),
            ));
        }
        if self.dynamic_key_overlap_ms < 0 {
            return Err(ConfigError::ValidationError(
                "dynamic signing key overlap must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// Overlap actually applied; never more than a fifth of the update interval.
    pub fn effective_key_overlap_ms(&self) -> i64 {
        self.dynamic_key_overlap_ms
            .min(self.dynamic_key_update_interval_ms / 5)
    }

    /// How long a dynamic key stays usable for verification after creation.
    pub fn dynamic_key_lifetime_ms(&self) -> i64 {
        self.dynamic_key_update_interval_ms + 2 * self.access_token_validity_ms
    }
}

fn env_i64(key: &str) -> Result<Option<i64>, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        _ => Ok(None),
    }
}

fn env_bool(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(value) if !value.trim().is_empty() => match value.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(Some(true)),
            "false" | "0" | "no" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        },
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SessionConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.access_token_validity_ms, 3_600_000);
        assert_eq!(config.effective_key_overlap_ms(), 60_000);
    }

    #[test]
    fn overlap_is_capped_for_short_intervals() {
        let config = SessionConfig {
            dynamic_key_update_interval_ms: 10_000,
            ..SessionConfig::default()
        };
        assert_eq!(config.effective_key_overlap_ms(), 2_000);
    }

    #[test]
    fn refresh_shorter_than_access_is_rejected() {
        let config = SessionConfig {
            refresh_token_validity_ms: 1_000,
            ..SessionConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));
    }

    #[test]
    fn key_lifetime_covers_two_access_token_validities() {
        let config = SessionConfig {
            access_token_validity_ms: 1_000,
            dynamic_key_update_interval_ms: 10_000,
            ..SessionConfig::default()
        };
        assert_eq!(config.dynamic_key_lifetime_ms(), 12_000);
    }
}
