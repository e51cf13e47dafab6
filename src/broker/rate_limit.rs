//! Per-publisher fixed-window rate limiting
//!
//! Each publisher identity owns a window that starts at its first admitted
//! message. Up to `capacity` messages are admitted per window; the count
//! resets once `window_ms` has elapsed. Publishers never share a window, so
//! one flooding publisher cannot consume another's quota.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    pub window_start: i64,
    pub count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window_ms: u64,
    windows: HashMap<String, RateWindow>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window_ms: u64) -> Self {
        Self {
            capacity,
            window_ms,
            windows: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }

    /// Count one message from `publisher` at `now` (ms). Returns `false` when
    /// the publisher's quota for the current window is already used up.
    pub fn admit(&mut self, publisher: &str, now: i64) -> bool {
        let window_ms = self.span();
        let window = self
            .windows
            .entry(publisher.to_string())
            .or_insert(RateWindow {
                window_start: now,
                count: 0,
            });

        // a clock stepping backwards keeps counting against the current window
        if now.saturating_sub(window.window_start) >= window_ms {
            window.window_start = now;
            window.count = 0;
        }

        if window.count >= self.capacity {
            return false;
        }
        window.count += 1;
        true
    }

    /// Forget windows that have been idle for at least one full window.
    pub fn prune(&mut self, now: i64) -> usize {
        let window_ms = self.span();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.saturating_sub(window.window_start) < window_ms);
        before - self.windows.len()
    }

    fn span(&self) -> i64 {
        i64::try_from(self.window_ms).unwrap_or(i64::MAX)
    }

    pub fn window(&self, publisher: &str) -> Option<RateWindow> {
        self.windows.get(publisher).copied()
    }

    pub fn tracked_publishers(&self) -> usize {
        self.windows.len()
    }
}
