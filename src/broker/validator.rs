//! Message validation
//!
//! Runs before a message is admitted. Checks topic shape, the reserved
//! namespace, payload serializability and size limits. Validation never
//! mutates the message; on success it returns the payload's plain-data
//! snapshot so the engine can freeze it.

use serde_json::Value;

use crate::broker::message::Message;
use crate::broker::topic::{self, REPLY_PREFIX};
use crate::utils::error::ValidationError;

/// Fixed allowance for field names and punctuation of the message envelope.
const ENVELOPE_OVERHEAD: usize = 128;

/// Who is asking for a message to be validated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Ordinary `publish` calls; the reserved namespace is off limits.
    Producer,
    /// Replies sent through the request/reply API; only reply topics are open.
    Responder,
    /// The broker itself.
    Internal,
}

#[derive(Debug, Clone)]
pub struct MessageValidator {
    pub max_payload_size: usize,
    pub max_message_size: usize,
}

impl MessageValidator {
    pub fn new(max_payload_size: usize, max_message_size: usize) -> Self {
        Self {
            max_payload_size,
            max_message_size,
        }
    }

    /// Validate `message` on behalf of `origin`, returning the payload as JSON.
    pub fn validate(&self, message: &Message, origin: Origin) -> Result<Value, ValidationError> {
        self.check_topic(&message.topic, origin)?;

        let payload = message.payload.to_json()?;
        let payload_size = serde_json::to_vec(&payload)
            .map(|bytes| bytes.len())
            .map_err(|e| ValidationError::NotSerializable {
                path: "$".to_string(),
                kind: e.to_string(),
            })?;
        if payload_size > self.max_payload_size {
            return Err(ValidationError::PayloadTooLarge {
                size: payload_size,
                max: self.max_payload_size,
            });
        }

        let message_size = payload_size + metadata_size(message);
        if message_size > self.max_message_size {
            return Err(ValidationError::MessageTooLarge {
                size: message_size,
                max: self.max_message_size,
            });
        }

        Ok(payload)
    }

    fn check_topic(&self, name: &str, origin: Origin) -> Result<(), ValidationError> {
        if name.is_empty() {
            return Err(ValidationError::EmptyTopic);
        }
        topic::validate_topic(name).map_err(|reason| ValidationError::InvalidTopic {
            topic: name.to_string(),
            reason,
        })?;

        let allowed = match origin {
            Origin::Producer => !topic::is_reserved(name),
            Origin::Responder => !topic::is_reserved(name) || name.starts_with(REPLY_PREFIX),
            Origin::Internal => true,
        };
        if !allowed {
            return Err(ValidationError::ReservedTopic {
                topic: name.to_string(),
            });
        }
        Ok(())
    }
}

fn metadata_size(message: &Message) -> usize {
    let headers: usize = message
        .headers
        .iter()
        .flatten()
        .map(|(k, v)| k.len() + v.len() + 6)
        .sum();
    ENVELOPE_OVERHEAD
        + message.topic.len()
        + message.id.len()
        + message.reply_to.as_ref().map_or(0, String::len)
        + message.correlation_id.as_ref().map_or(0, String::len)
        + headers
}
