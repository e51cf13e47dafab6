use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration settings for an embedded broker.
///
/// Includes the broker's resource bounds and the logging level.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub logging: LoggingSettings,
}

/// Resource bounds and policy switches for the broker.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    /// Retained topics kept before LRU eviction; `0` disables retention.
    pub max_retained: usize,
    pub max_message_size: usize,
    pub max_payload_size: usize,
    /// Messages admitted per publisher per window.
    pub rate_limit: u32,
    pub rate_limit_window_ms: u64,
    pub cleanup_interval_ms: u64,
    pub allow_global_wildcard: bool,
    pub default_request_timeout_ms: u64,
}

impl BrokerSettings {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms.max(1))
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.default_request_timeout_ms)
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            max_retained: 1000,
            max_message_size: 1_048_576,
            max_payload_size: 524_288,
            rate_limit: 1000,
            rate_limit_window_ms: 1000,
            cleanup_interval_ms: 30_000,
            allow_global_wildcard: true,
            default_request_timeout_ms: 5000,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values can be filled using defaults.
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub logging: Option<PartialLoggingSettings>,
}

/// Partial broker settings.
#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub max_retained: Option<usize>,
    pub max_message_size: Option<usize>,
    pub max_payload_size: Option<usize>,
    pub rate_limit: Option<u32>,
    pub rate_limit_window_ms: Option<u64>,
    pub cleanup_interval_ms: Option<u64>,
    pub allow_global_wildcard: Option<bool>,
    pub default_request_timeout_ms: Option<u64>,
}

/// Partial logging settings.
#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

/// Provides default values for `Settings`.
///
/// Ensures the broker has sensible bounds if no configuration is provided.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}
