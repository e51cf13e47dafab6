//! The `client` module defines the owning context of subscriptions.
//!
//! It provides the `Client` struct, which gives a subscriber a stable
//! identifier and a liveness signal the broker can poll without keeping the
//! subscriber alive.

pub mod pubsub_client;
pub use pubsub_client::Client;
