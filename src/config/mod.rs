mod settings;

use crate::config::settings::{PartialBrokerSettings, PartialLoggingSettings, PartialSettings};
use config::{Config, ConfigError, Environment, File};

pub use settings::{BrokerSettings, LoggingSettings, Settings};

/// Environment variable prefix, e.g. `BUSLINE_BROKER__MAX_RETAINED=10`.
pub const ENV_PREFIX: &str = "BUSLINE";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct containing the broker and logging configurations
pub fn load_config() -> Result<Settings, ConfigError> {
    // a missing .env file is fine
    let _ = dotenvy::dotenv();

    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(merge(partial))
}

fn merge(partial: PartialSettings) -> Settings {
    let default = Settings::default();
    let broker = partial.broker.unwrap_or_default();
    let logging = partial.logging.unwrap_or_default();

    Settings {
        broker: merge_broker(broker, default.broker),
        logging: merge_logging(logging, default.logging),
    }
}

fn merge_broker(partial: PartialBrokerSettings, default: BrokerSettings) -> BrokerSettings {
    BrokerSettings {
        max_retained: partial.max_retained.unwrap_or(default.max_retained),
        max_message_size: partial.max_message_size.unwrap_or(default.max_message_size),
        max_payload_size: partial.max_payload_size.unwrap_or(default.max_payload_size),
        rate_limit: partial.rate_limit.unwrap_or(default.rate_limit),
        rate_limit_window_ms: partial
            .rate_limit_window_ms
            .unwrap_or(default.rate_limit_window_ms),
        cleanup_interval_ms: partial
            .cleanup_interval_ms
            .unwrap_or(default.cleanup_interval_ms),
        allow_global_wildcard: partial
            .allow_global_wildcard
            .unwrap_or(default.allow_global_wildcard),
        default_request_timeout_ms: partial
            .default_request_timeout_ms
            .unwrap_or(default.default_request_timeout_ms),
    }
}

fn merge_logging(partial: PartialLoggingSettings, default: LoggingSettings) -> LoggingSettings {
    LoggingSettings {
        level: partial.level.unwrap_or(default.level),
    }
}
