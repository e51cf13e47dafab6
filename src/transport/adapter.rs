//! Transport adapter
//!
//! The broker hands every matched message to a subscriber through a
//! [`TransportAdapter`]. Deployments pick one of the [`Transport`] variants:
//! a direct closure, a tokio channel, a bounded pull queue, or a custom
//! adapter. The adapter reports per-delivery failures and whether the
//! receiving side still exists; the broker counts the former and reclaims
//! subscriptions on the latter.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::broker::message::Message;
use crate::broker::registry::SubscriptionId;
use crate::transport::queue::MessageQueue;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("receiver is gone")]
    Closed,

    #[error("queue is full ({capacity} messages)")]
    QueueFull { capacity: usize },

    #[error("handler failed: {0}")]
    Handler(String),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

/// Carries a message from the broker to one subscriber.
pub trait TransportAdapter: Send + Sync {
    fn deliver(&self, subscription: SubscriptionId, message: &Arc<Message>)
    -> Result<(), DeliveryError>;

    /// Whether the receiving side still exists. Consulted by liveness sweeps.
    fn is_alive(&self) -> bool {
        true
    }
}

pub type Callback = Arc<dyn Fn(&Arc<Message>) -> Result<(), DeliveryError> + Send + Sync>;

#[derive(Clone)]
pub enum Transport {
    Callback(Callback),
    Channel(UnboundedSender<Arc<Message>>),
    Queue(MessageQueue),
    Custom(Arc<dyn TransportAdapter>),
}

impl Transport {
    /// A handler that cannot fail.
    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&Arc<Message>) + Send + Sync + 'static,
    {
        Transport::Callback(Arc::new(move |msg| {
            f(msg);
            Ok(())
        }))
    }

    /// A handler that reports its own failures.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&Arc<Message>) -> Result<(), DeliveryError> + Send + Sync + 'static,
    {
        Transport::Callback(Arc::new(f))
    }

    pub fn channel() -> (Self, UnboundedReceiver<Arc<Message>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Transport::Channel(tx), rx)
    }

    pub fn queue(capacity: usize) -> (Self, MessageQueue) {
        let queue = MessageQueue::new(capacity);
        (Transport::Queue(queue.clone()), queue)
    }

    pub fn custom(adapter: impl TransportAdapter + 'static) -> Self {
        Transport::Custom(Arc::new(adapter))
    }
}

impl TransportAdapter for Transport {
    fn deliver(
        &self,
        subscription: SubscriptionId,
        message: &Arc<Message>,
    ) -> Result<(), DeliveryError> {
        match self {
            Transport::Callback(f) => f(message),
            Transport::Channel(tx) => tx.send(message.clone()).map_err(|_| DeliveryError::Closed),
            Transport::Queue(queue) => queue.push(message.clone()),
            Transport::Custom(adapter) => adapter.deliver(subscription, message),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            Transport::Callback(_) => true,
            Transport::Channel(tx) => !tx.is_closed(),
            Transport::Queue(queue) => !queue.is_closed(),
            Transport::Custom(adapter) => adapter.is_alive(),
        }
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Callback(_) => f.write_str("Transport::Callback"),
            Transport::Channel(_) => f.write_str("Transport::Channel"),
            Transport::Queue(q) => write!(f, "Transport::Queue({})", q.capacity()),
            Transport::Custom(_) => f.write_str("Transport::Custom"),
        }
    }
}
