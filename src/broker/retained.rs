//! Retained last-value store
//!
//! Keeps the most recent retained message per exact topic, bounded by
//! `max_retained`. Recency is refreshed by `set` and by replay reads; plain
//! `get` is a peek and leaves the order alone. When the bound is exceeded the
//! least recently touched entry is evicted.
//!
//! Concurrency note: the store is not synchronized; the engine keeps it
//! behind a mutex and takes that lock before the registry lock.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::trace;

use crate::broker::message::Message;
use crate::broker::topic;

#[derive(Debug)]
pub struct RetainedStore {
    // None when retention is disabled (max_retained = 0)
    entries: Option<LruCache<String, Arc<Message>>>,
    evicted: u64,
}

/// Outcome of [`RetainedStore::set`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetOutcome {
    Inserted,
    Replaced,
    /// Inserted and pushed out the named topic.
    Evicted(String),
    /// Retention is disabled.
    Discarded,
}

impl RetainedStore {
    pub fn new(max_retained: usize) -> Self {
        Self {
            entries: NonZeroUsize::new(max_retained).map(LruCache::new),
            evicted: 0,
        }
    }

    /// Insert or replace the retained message for its topic.
    pub fn set(&mut self, message: Arc<Message>) -> SetOutcome {
        let Some(entries) = self.entries.as_mut() else {
            return SetOutcome::Discarded;
        };
        let topic = message.topic.clone();
        match entries.push(topic.clone(), message) {
            None => SetOutcome::Inserted,
            Some((old_topic, _)) if old_topic == topic => SetOutcome::Replaced,
            Some((old_topic, _)) => {
                self.evicted += 1;
                trace!("evicted retained message for {old_topic}");
                SetOutcome::Evicted(old_topic)
            }
        }
    }

    /// Look up the retained message for `topic` without touching recency.
    pub fn get(&self, topic: &str) -> Option<Arc<Message>> {
        self.entries.as_ref()?.peek(topic).cloned()
    }

    /// Iterate retained messages whose topic matches `pattern`, oldest touch
    /// first. Each yielded entry becomes the most recently touched.
    pub fn replay_matching(&mut self, pattern: &str) -> Replay<'_> {
        self.replay_matching_any(&[pattern])
    }

    /// Like [`replay_matching`](Self::replay_matching) for a set of patterns.
    /// The order is fixed before anything is touched, and a topic matching
    /// several patterns is yielded once.
    pub fn replay_matching_any<P: AsRef<str>>(&mut self, patterns: &[P]) -> Replay<'_> {
        let topics = match self.entries.as_ref() {
            Some(entries) => entries
                .iter()
                .rev()
                .filter(|(t, _)| patterns.iter().any(|p| topic::matches(t, p.as_ref())))
                .map(|(t, _)| t.clone())
                .collect(),
            None => Vec::new(),
        };
        Replay {
            store: self,
            topics: topics.into_iter(),
        }
    }

    /// Remove entries matching `pattern`, or everything when `None`.
    /// Returns how many entries were removed.
    pub fn clear(&mut self, pattern: Option<&str>) -> usize {
        let Some(entries) = self.entries.as_mut() else {
            return 0;
        };
        match pattern {
            None => {
                let removed = entries.len();
                entries.clear();
                removed
            }
            Some(pattern) => {
                let doomed: Vec<String> = entries
                    .iter()
                    .filter(|(t, _)| topic::matches(t, pattern))
                    .map(|(t, _)| t.clone())
                    .collect();
                for t in &doomed {
                    entries.pop(t);
                }
                doomed.len()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, LruCache::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total evictions since the store was created.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Topics from least to most recently touched.
    pub fn topics(&self) -> Vec<String> {
        self.entries
            .as_ref()
            .map(|entries| entries.iter().rev().map(|(t, _)| t.clone()).collect())
            .unwrap_or_default()
    }
}

/// Lazy replay over matching retained entries.
pub struct Replay<'a> {
    store: &'a mut RetainedStore,
    topics: std::vec::IntoIter<String>,
}

impl Iterator for Replay<'_> {
    type Item = Arc<Message>;

    fn next(&mut self) -> Option<Self::Item> {
        let entries = self.store.entries.as_mut()?;
        for topic in self.topics.by_ref() {
            // `get` promotes the entry to most recently used
            if let Some(message) = entries.get(&topic) {
                return Some(message.clone());
            }
        }
        None
    }
}
