//! Repository and sweeper configuration, read from the environment.

use std::time::Duration;

use chrono::TimeDelta;
use thiserror::Error;

/// Sliding expiry of cached aggregates, in seconds.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;

/// Period between sweeps, in seconds.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Invalid configuration value.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A duration variable was not a positive whole number of seconds.
    #[error("{name} must be a positive number of seconds, got {value:?}")]
    InvalidSeconds {
        /// Environment variable name.
        name: &'static str,
        /// The rejected value.
        value: String,
    },
}

fn read_secs(
    name: &'static str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: u64,
) -> Result<u64, ConfigError> {
    let Some(value) = lookup(name) else {
        return Ok(default);
    };
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(secs),
        _ => Err(ConfigError::InvalidSeconds { name, value }),
    }
}

/// Settings of an [`AggregateRepository`](crate::AggregateRepository).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// How long a cached aggregate stays live after its last access.
    pub cache_ttl: TimeDelta,
}

impl RepositoryConfig {
    /// Reads `CAIRN_CACHE_TTL_SECS`, falling back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSeconds` if the variable is set but not a
    /// positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSeconds` for a malformed value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        const NAME: &str = "CAIRN_CACHE_TTL_SECS";
        let secs = read_secs(NAME, &lookup, DEFAULT_CACHE_TTL_SECS)?;
        let cache_ttl = i64::try_from(secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| ConfigError::InvalidSeconds {
                name: NAME,
                value: secs.to_string(),
            })?;
        Ok(Self { cache_ttl })
    }
}

impl Default for RepositoryConfig {
    #[allow(clippy::cast_possible_wrap)]
    fn default() -> Self {
        Self {
            cache_ttl: TimeDelta::seconds(DEFAULT_CACHE_TTL_SECS as i64),
        }
    }
}

/// Settings of a [`Sweeper`](crate::Sweeper).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweeperConfig {
    /// Period between two sweeps.
    pub interval: Duration,
}

impl SweeperConfig {
    /// Reads `CAIRN_SWEEP_INTERVAL_SECS`, falling back to the defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSeconds` if the variable is set but not a
    /// positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env) but reads variables through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidSeconds` for a malformed value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secs = read_secs("CAIRN_SWEEP_INTERVAL_SECS", &lookup, DEFAULT_SWEEP_INTERVAL_SECS)?;
        Ok(Self {
            interval: Duration::from_secs(secs),
        })
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}
