//! Broker statistics
//!
//! Counters are plain atomics so that reading a snapshot never contends with
//! publish or subscribe. `retained`, `subscriptions` and `pending_requests`
//! are gauges; everything else only grows.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct StatsCollector {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    retained: AtomicU64,
    retained_evicted: AtomicU64,
    subscriptions: AtomicU64,
    errors: AtomicU64,
    delivery_failures: AtomicU64,
    pending_requests: AtomicU64,
}

/// Point-in-time copy of the broker counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub retained: u64,
    pub retained_evicted: u64,
    pub subscriptions: u64,
    pub errors: u64,
    pub delivery_failures: u64,
    pub pending_requests: u64,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A failed hand-off counts both as a delivery failure and as an error.
    pub fn record_delivery_failure(&self) {
        self.delivery_failures.fetch_add(1, Ordering::Relaxed);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evicted(&self) {
        self.retained_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_retained(&self, count: usize) {
        self.retained.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_subscriptions(&self, count: usize) {
        self.subscriptions.store(count as u64, Ordering::Relaxed);
    }

    pub fn set_pending_requests(&self, count: usize) {
        self.pending_requests.store(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            retained: self.retained.load(Ordering::Relaxed),
            retained_evicted: self.retained_evicted.load(Ordering::Relaxed),
            subscriptions: self.subscriptions.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            pending_requests: self.pending_requests.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges() {
        let stats = StatsCollector::new();
        stats.record_published();
        stats.record_published();
        stats.record_delivered();
        stats.record_delivery_failure();
        stats.set_subscriptions(4);
        stats.set_subscriptions(3);

        let snap = stats.snapshot();
        assert_eq!(snap.published, 2);
        assert_eq!(snap.delivered, 1);
        assert_eq!(snap.delivery_failures, 1);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.subscriptions, 3);
    }

    #[test]
    fn snapshot_serializes() {
        let value = serde_json::to_value(StatsCollector::new().snapshot()).unwrap();
        assert_eq!(value["retained_evicted"], 0);
        assert_eq!(value["published"], 0);
    }
}
