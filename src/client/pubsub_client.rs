//! Client representation
//!
//! `Client` models the context that owns a set of subscriptions, such as a
//! UI component or a connection. The broker never holds the client itself;
//! subscriptions created with `SubscribeOptions::owned_by` carry only the
//! client's id and a liveness check. Closing or dropping the client flips the
//! check, and the next liveness sweep reclaims everything it owned even if
//! `unsubscribe` was never called.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;

use crate::broker::registry::Liveness;

#[derive(Debug)]
pub struct Client {
    pub id: String,
    alive: Arc<AtomicBool>,
}

impl Client {
    /// Create a new live client. The `id` is a UUID used to identify the
    /// client across broker operations.
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            alive: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Mark the client as torn down.
    pub fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Check handed to the registry; holds only the flag, not the client.
    pub fn liveness(&self) -> Liveness {
        let alive = self.alive.clone();
        Arc::new(move || alive.load(Ordering::SeqCst))
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close();
    }
}
