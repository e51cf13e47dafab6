//! The `broker` module holds the delivery engine and everything it owns:
//! topic matching, message validation, the retained store, per-publisher
//! rate limiting, the subscription registry, request/reply correlation and
//! statistics.

pub mod engine;
pub mod message;
pub mod rate_limit;
pub mod registry;
pub mod request;
pub mod retained;
pub mod stats;
pub mod topic;
pub mod validator;

pub use engine::{Broker, MaintenanceReport, PublishStatus, Publisher};
pub use message::{Message, Opaque, Payload, SharedPayload};
pub use registry::{SubscribeOptions, SubscriptionId};
pub use request::{PendingReply, RequestOptions};
pub use stats::StatsSnapshot;

#[cfg(test)]
mod tests;
