//! # Busline
//!
//! `busline` is an in-process publish/subscribe message broker: one shared
//! bus that decouples the parts of an application which produce events from
//! the parts which react to them.
//!
//! Topics are dot-separated names (`users.item.42`). Subscriptions use
//! patterns where `*` matches exactly one segment, or a lone `*` matches
//! every ordinary topic. On top of plain fan-out the broker keeps the last
//! retained message per topic (bounded, least recently used first out),
//! rate limits each publisher, validates and freezes payloads, correlates
//! request/reply exchanges with timeouts, and reports every rejection on an
//! error channel.
//!
//! ## Core Modules
//!
//! - `broker`: The delivery engine and the state it owns.
//! - `client`: An owning context whose lifetime bounds its subscriptions.
//! - `config`: Layered settings from defaults, a config file and the environment.
//! - `transport`: How a matched message reaches a subscriber's handler.
//! - `utils`: Error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod transport;
pub mod utils;

pub use broker::{
    Broker, Message, Payload, PendingReply, PublishStatus, Publisher, RequestOptions,
    StatsSnapshot, SubscribeOptions, SubscriptionId,
};
pub use client::Client;
pub use config::{BrokerSettings, Settings, load_config};
pub use transport::{DeliveryError, MessageQueue, Transport};
pub use utils::error::{ErrorCode, ErrorEvent, PublishError, RequestError, SubscribeError};
