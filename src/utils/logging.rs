//! Log output for applications embedding the broker.
//!
//! The broker itself only emits `tracing` events. Hosts that have no
//! subscriber of their own can install a plain fmt one from the
//! `[logging]` section of their [`Settings`](crate::config::Settings).

use tracing::level_filters::LevelFilter;
use tracing::warn;

use crate::config::LoggingSettings;

/// Parse a configured level. Accepts the `tracing` names (any case), `off`,
/// and `warning` as an alias of `warn`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    let name = name.trim();
    if name.eq_ignore_ascii_case("warning") {
        return Some(LevelFilter::WARN);
    }
    name.parse().ok()
}

/// Install a fmt subscriber at the configured level. An unknown level falls
/// back to `info`. Returns false when a global subscriber was already set.
pub fn init_from(settings: &LoggingSettings) -> bool {
    let level = parse_level(&settings.level);
    let installed = tracing_subscriber::fmt()
        .with_max_level(level.unwrap_or(LevelFilter::INFO))
        .with_target(false)
        .try_init()
        .is_ok();
    if level.is_none() {
        warn!("unknown log level '{}', using info", settings.level);
    }
    installed
}

/// Shorthand for [`init_from`] with just a level name.
pub fn init(level: &str) -> bool {
    init_from(&LoggingSettings {
        level: level.to_string(),
    })
}
