//! Topic names and subscription patterns
//!
//! Topics are dot-segmented, case-sensitive strings such as `users.item.42`.
//! A pattern is a topic in which any segment may be exactly `*`, matching one
//! segment; the pattern `*` on its own matches every topic. There is no
//! multi-segment wildcard and no partial-segment wildcard.
//!
//! Names under [`RESERVED_PREFIX`] belong to the broker (readiness signal,
//! error channel, statistics, private reply topics) and are reachable only
//! through the broker's dedicated APIs.

/// Single-segment wildcard and, alone, the global wildcard.
pub const WILDCARD: &str = "*";

/// First segment of every broker-internal topic.
pub const RESERVED_NAMESPACE: &str = "_bus";
pub const RESERVED_PREFIX: &str = "_bus.";

pub const READY_TOPIC: &str = "_bus.ready";
pub const ERROR_TOPIC: &str = "_bus.error";
pub const STATS_TOPIC: &str = "_bus.stats";
pub const REPLY_PREFIX: &str = "_bus.reply.";

pub const MAX_TOPIC_LENGTH: usize = 256;

/// Decide whether `topic` is matched by `pattern`.
pub fn matches(topic: &str, pattern: &str) -> bool {
    if pattern == WILDCARD {
        return true;
    }

    let mut topic_segments = topic.split('.');
    let mut pattern_segments = pattern.split('.');
    loop {
        match (topic_segments.next(), pattern_segments.next()) {
            (None, None) => return true,
            (Some(t), Some(p)) => {
                if p != WILDCARD && p != t {
                    return false;
                }
            }
            // segment counts differ
            _ => return false,
        }
    }
}

pub fn is_reserved(topic: &str) -> bool {
    topic == RESERVED_NAMESPACE || topic.starts_with(RESERVED_PREFIX)
}

/// True for a pattern that could match a reserved topic by its first segment.
pub fn targets_reserved(pattern: &str) -> bool {
    pattern.split('.').next() == Some(RESERVED_NAMESPACE)
}

fn is_topic_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '@' | '/')
}

/// Check the shape of a concrete topic. Returns the reason on failure.
pub fn validate_topic(topic: &str) -> Result<(), String> {
    check_segments(topic, false)
}

/// Check the shape of a subscription pattern. Returns the reason on failure.
pub fn validate_pattern(pattern: &str) -> Result<(), String> {
    if pattern == WILDCARD {
        return Ok(());
    }
    check_segments(pattern, true)
}

fn check_segments(name: &str, allow_wildcard: bool) -> Result<(), String> {
    if name.is_empty() {
        return Err("empty".to_string());
    }
    if name.len() > MAX_TOPIC_LENGTH {
        return Err(format!("longer than {MAX_TOPIC_LENGTH} bytes"));
    }
    for segment in name.split('.') {
        if segment.is_empty() {
            return Err("empty segment".to_string());
        }
        if segment == WILDCARD {
            if allow_wildcard {
                continue;
            }
            return Err("wildcards are only allowed in subscription patterns".to_string());
        }
        if segment.contains('*') {
            return Err(format!(
                "wildcard must be a whole segment, found '{segment}'"
            ));
        }
        if let Some(bad) = segment.chars().find(|c| !is_topic_char(*c)) {
            return Err(format!("disallowed character {bad:?}"));
        }
    }
    Ok(())
}
