//! The `error` module defines the error types used across `busline`.
//!
//! Errors fall into two groups. Publish-side failures (validation, rate
//! limiting) are reported through the broker's error channel as an
//! [`ErrorEvent`] and returned inside a `PublishStatus`, never raised.
//! Subscribe and request failures are returned to the caller as a typed
//! `Result` because they change what the caller believes about its own state.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Reasons a message is refused before it reaches any subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("topic must not be empty")]
    EmptyTopic,

    #[error("invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("topic '{topic}' is in the reserved broker namespace")]
    ReservedTopic { topic: String },

    #[error("payload is not serializable at {path}: {kind} values carry no data")]
    NotSerializable { path: String, kind: String },

    #[error("payload contains a cyclic reference at {path}")]
    CyclicReference { path: String },

    #[error("payload is {size} bytes, limit is {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("message is {size} bytes, limit is {max}")]
    MessageTooLarge { size: usize, max: usize },
}

/// Why a publish was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),

    #[error("publisher '{publisher}' exceeded {limit} messages per {window_ms}ms")]
    RateLimited {
        publisher: String,
        limit: u32,
        window_ms: u64,
    },

    #[error("message has no reply_to/correlation_id to answer")]
    NotARequest,
}

impl PublishError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PublishError::RateLimited { .. } => ErrorCode::RateLimitExceeded,
            PublishError::Invalid(_) | PublishError::NotARequest => ErrorCode::MessageInvalid,
        }
    }
}

/// Why a subscription was refused. Always surfaced synchronously.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscribeError {
    #[error("a subscription needs at least one pattern")]
    NoPatterns,

    #[error("invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("pattern '{pattern}' targets the reserved broker namespace")]
    ReservedTopic { pattern: String },

    #[error("global wildcard subscriptions are disabled")]
    GlobalWildcardDisabled,
}

/// Coarse reason attached to a rejected subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubscriptionRejectReason {
    NoPatterns,
    InvalidPattern,
    ReservedTopic,
    GlobalWildcardDisabled,
}

impl SubscribeError {
    pub fn reason(&self) -> SubscriptionRejectReason {
        match self {
            SubscribeError::NoPatterns => SubscriptionRejectReason::NoPatterns,
            SubscribeError::InvalidPattern { .. } => SubscriptionRejectReason::InvalidPattern,
            SubscribeError::ReservedTopic { .. } => SubscriptionRejectReason::ReservedTopic,
            SubscribeError::GlobalWildcardDisabled => {
                SubscriptionRejectReason::GlobalWildcardDisabled
            }
        }
    }

    pub fn code(&self) -> ErrorCode {
        ErrorCode::SubscriptionInvalid
    }
}

/// Failure of a request/reply exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("request could not be published: {0}")]
    Publish(#[from] PublishError),

    #[error("no reply on '{topic}' within {timeout_ms}ms (correlation id {correlation_id})")]
    Timeout {
        topic: String,
        correlation_id: String,
        timeout_ms: u64,
    },

    #[error("request was abandoned before a reply arrived")]
    Closed,
}

/// Codes carried by events on the error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimitExceeded,
    MessageInvalid,
    SubscriptionInvalid,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            ErrorCode::MessageInvalid => "MESSAGE_INVALID",
            ErrorCode::SubscriptionInvalid => "SUBSCRIPTION_INVALID",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error or drop notification published on the error channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
}

impl ErrorEvent {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
        }
    }
}
