//! The `transport` module is the boundary between the broker and whatever
//! actually carries a message to a subscriber's handler.
//!
//! It defines the `TransportAdapter` contract the broker calls for every
//! matched subscriber, the closed set of `Transport` variants offered out of
//! the box, and the `MessageQueue` handle used by pull-based consumers.

pub mod adapter;
pub mod queue;

pub use adapter::{Callback, DeliveryError, Transport, TransportAdapter};
pub use queue::MessageQueue;

#[cfg(test)]
mod tests;
