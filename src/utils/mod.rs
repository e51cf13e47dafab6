//! The `utils` module provides the pieces shared by every part of `busline`:
//! the error taxonomy and logging setup.

pub mod error;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::error::{ErrorCode, ErrorEvent, PublishError, SubscribeError, ValidationError};
    use super::logging;
    use crate::config::LoggingSettings;
    use serde_json::json;
    use tracing::level_filters::LevelFilter;

    #[test]
    fn log_levels_parse_with_aliases() {
        assert_eq!(logging::parse_level("DEBUG"), Some(LevelFilter::DEBUG));
        assert_eq!(logging::parse_level(" warning "), Some(LevelFilter::WARN));
        assert_eq!(logging::parse_level("off"), Some(LevelFilter::OFF));
        assert_eq!(logging::parse_level("loud"), None);
    }

    #[test]
    fn logging_installs_once() {
        let settings = LoggingSettings {
            level: "nonsense".to_string(),
        };
        // another test may have installed it first
        logging::init_from(&settings);
        assert!(!logging::init_from(&settings));
        assert!(!logging::init("debug"));
    }

    #[test]
    fn error_codes_serialize_screaming_snake_case() {
        let event = ErrorEvent::new(
            ErrorCode::RateLimitExceeded,
            "too many",
            json!({ "publisher": "p1" }),
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(value["details"]["publisher"], "p1");
        assert_eq!(ErrorCode::SubscriptionInvalid.to_string(), "SUBSCRIPTION_INVALID");
    }

    #[test]
    fn publish_errors_map_to_codes() {
        let invalid = PublishError::from(ValidationError::EmptyTopic);
        assert_eq!(invalid.code(), ErrorCode::MessageInvalid);

        let limited = PublishError::RateLimited {
            publisher: "p".into(),
            limit: 1,
            window_ms: 1000,
        };
        assert_eq!(limited.code(), ErrorCode::RateLimitExceeded);
        assert_eq!(SubscribeError::NoPatterns.code(), ErrorCode::SubscriptionInvalid);
    }
}
