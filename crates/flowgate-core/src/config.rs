//! Engine Configuration
//!
//! Every timing and buffer threshold used by the engine lives here, with
//! the reference defaults. Durations are written in milliseconds when
//! loaded from a file.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Too many filter slots: {0} (max {MAX_FILTER_SLOTS})")]
    TooManySlots(usize),
}

/// Hard ceiling on the registry size.
pub const MAX_FILTER_SLOTS: usize = 64;

/// Idle-flow reclamation thresholds (connectionless flows only).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    /// How long queued data may wait for a verdict
    #[serde(with = "millis")]
    pub action_timeout: Duration,
    /// How often the reclaimer wakes up
    #[serde(with = "millis")]
    pub interval: Duration,
    /// Buffer bytes a flow may hold per direction before tail drop
    pub max_buffer_bytes: u64,
    /// Buffers a flow may hold per direction before tail drop
    pub max_buffer_count: u64,
    /// Flows reclaimed per pass
    pub max_flows_per_run: usize,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            action_timeout: Duration::from_secs(10),
            interval: Duration::from_secs(1),
            max_buffer_bytes: 2 * 1024 * 1024,
            max_buffer_count: 1024,
            max_flows_per_run: 100,
        }
    }
}

/// Periodic stats reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Shortest reporting interval a filter may request
    #[serde(with = "millis")]
    pub min_interval: Duration,
    /// Flows examined per pass
    pub max_flows_per_run: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(500),
            max_flows_per_run: 50,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of filter slots (units 1..=max_filters)
    pub max_filters: usize,
    /// Bound on a graceful close wait
    #[serde(with = "millis")]
    pub close_wait_timeout: Duration,
    pub reclaim: ReclaimConfig,
    pub stats: StatsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_filters: 8,
            close_wait_timeout: Duration::from_millis(1000),
            reclaim: ReclaimConfig::default(),
            stats: StatsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_filters == 0 {
            return Err(ConfigError::Zero("max_filters"));
        }
        if self.max_filters > MAX_FILTER_SLOTS {
            return Err(ConfigError::TooManySlots(self.max_filters));
        }
        if self.close_wait_timeout.is_zero() {
            return Err(ConfigError::Zero("close_wait_timeout"));
        }
        if self.reclaim.action_timeout.is_zero() {
            return Err(ConfigError::Zero("reclaim.action_timeout"));
        }
        if self.reclaim.interval.is_zero() {
            return Err(ConfigError::Zero("reclaim.interval"));
        }
        if self.reclaim.max_buffer_bytes == 0 {
            return Err(ConfigError::Zero("reclaim.max_buffer_bytes"));
        }
        if self.reclaim.max_buffer_count == 0 {
            return Err(ConfigError::Zero("reclaim.max_buffer_count"));
        }
        if self.reclaim.max_flows_per_run == 0 {
            return Err(ConfigError::Zero("reclaim.max_flows_per_run"));
        }
        if self.stats.min_interval.is_zero() {
            return Err(ConfigError::Zero("stats.min_interval"));
        }
        if self.stats.max_flows_per_run == 0 {
            return Err(ConfigError::Zero("stats.max_flows_per_run"));
        }
        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.reclaim.action_timeout, Duration::from_secs(10));
        assert_eq!(config.stats.min_interval, Duration::from_millis(500));
    }

    #[test]
    fn test_rejects_zero_thresholds() {
        let mut config = EngineConfig::default();
        config.reclaim.max_buffer_count = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Zero("reclaim.max_buffer_count"))
        ));

        let config = EngineConfig {
            max_filters: MAX_FILTER_SLOTS + 1,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::TooManySlots(_))));
    }

    #[test]
    fn test_toml_in_milliseconds() {
        let config: EngineConfig = toml::from_str(
            r#"
            close_wait_timeout = 250

            [reclaim]
            action_timeout = 3000
            "#,
        )
        .unwrap();
        assert_eq!(config.close_wait_timeout, Duration::from_millis(250));
        assert_eq!(config.reclaim.action_timeout, Duration::from_secs(3));
        assert_eq!(config.reclaim.max_flows_per_run, 100);
        assert_eq!(config.max_filters, 8);
    }
}
