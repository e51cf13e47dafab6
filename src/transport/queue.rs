//! Bounded pull queue
//!
//! `MessageQueue` is the handle side of [`Transport::Queue`]: the broker
//! pushes into it and the consumer pops at its own pace, synchronously or by
//! awaiting [`MessageQueue::recv`]. A full queue rejects the delivery rather
//! than growing.
//!
//! [`Transport::Queue`]: crate::transport::Transport::Queue

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::broker::message::Message;
use crate::transport::adapter::DeliveryError;

#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    capacity: usize,
    items: Mutex<VecDeque<Arc<Message>>>,
    closed: AtomicBool,
    notify: Notify,
}

impl MessageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                capacity,
                items: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn push(&self, message: Arc<Message>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        {
            let mut items = self.inner.items.lock().unwrap_or_else(PoisonError::into_inner);
            if items.len() >= self.inner.capacity {
                return Err(DeliveryError::QueueFull {
                    capacity: self.inner.capacity,
                });
            }
            items.push_back(message);
        }
        self.inner.notify.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<Arc<Message>> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn drain(&self) -> Vec<Arc<Message>> {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect()
    }

    /// Wait for the next message. Returns `None` once the queue is closed and
    /// empty.
    pub async fn recv(&self) -> Option<Arc<Message>> {
        loop {
            if let Some(message) = self.try_pop() {
                return Some(message);
            }
            if self.is_closed() {
                return None;
            }
            self.inner.notify.notified().await;
        }
    }

    /// Stop accepting messages. The broker's liveness sweep will then drop
    /// the subscription feeding this queue.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        self.inner.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }
}

impl fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageQueue")
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
