//! Subscription registry
//!
//! Owns every live subscription: its patterns, its transport, and the
//! signals that end it (explicit unsubscribe, a cancellation token, or a
//! liveness check reporting the owning context gone).
//!
//! Concurrency note: the registry itself is unsynchronized and lives behind
//! the engine's registry lock. A `Subscription` is shared as an `Arc` so the
//! engine can deliver to it after releasing that lock; its `active` flag and
//! replay gate are synchronized on their own. Liveness checks run under the
//! registry lock and must not call back into the broker.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::broker::message::Message;
use crate::broker::topic::{self, WILDCARD};
use crate::client::Client;
use crate::transport::{Transport, TransportAdapter};
use crate::utils::error::SubscribeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Reports whether the context owning a subscription still exists.
pub type Liveness = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Replay matching retained messages before live delivery starts.
    pub wants_retained: bool,
    /// Identifier of the owning context, used by `unsubscribe_owner`.
    pub owner: Option<String>,
    pub liveness: Option<Liveness>,
    pub cancel: Option<CancellationToken>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retained(mut self) -> Self {
        self.wants_retained = true;
        self
    }

    /// Tie the subscription to `client`: its id becomes the owner and its
    /// liveness becomes the subscription's.
    pub fn owned_by(mut self, client: &Client) -> Self {
        self.owner = Some(client.id.clone());
        self.liveness = Some(client.liveness());
        self
    }

    pub fn with_liveness<F>(mut self, check: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.liveness = Some(Arc::new(check));
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("wants_retained", &self.wants_retained)
            .field("owner", &self.owner)
            .field("liveness", &self.liveness.is_some())
            .field("cancel", &self.cancel.is_some())
            .finish()
    }
}

/// Buffers live deliveries while retained replay is still being handed over.
#[derive(Debug, Default)]
struct Gate {
    live: bool,
    backlog: VecDeque<Arc<Message>>,
}

pub struct Subscription {
    pub id: SubscriptionId,
    pub patterns: Vec<String>,
    pub owner: Option<String>,
    pub wants_retained: bool,
    internal: bool,
    transport: Transport,
    liveness: Option<Liveness>,
    cancel: Option<CancellationToken>,
    active: AtomicBool,
    retired: CancellationToken,
    gate: Mutex<Gate>,
}

impl Subscription {
    /// Whether this subscription receives `topic`. Ordinary subscriptions
    /// never see the reserved namespace, not even through `*`.
    pub fn matches(&self, name: &str) -> bool {
        if topic::is_reserved(name) && !self.internal {
            return false;
        }
        self.patterns.iter().any(|p| topic::matches(name, p))
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Returns true only for the call that actually deactivated it.
    pub(crate) fn deactivate(&self) -> bool {
        let was_active = self.active.swap(false, Ordering::SeqCst);
        self.retired.cancel();
        was_active
    }

    /// Cancelled once the subscription leaves the registry.
    pub(crate) fn retired(&self) -> CancellationToken {
        self.retired.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    /// False once cancelled, once the owner reports gone, or once the
    /// transport has lost its receiving side.
    pub fn is_alive(&self) -> bool {
        !self.is_cancelled()
            && self.liveness.as_ref().is_none_or(|check| check())
            && self.transport.is_alive()
    }

    pub fn is_internal(&self) -> bool {
        self.internal
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// True if `message` may be handed over now; otherwise it was buffered
    /// behind the pending replay.
    pub(crate) fn admit_or_buffer(&self, message: &Arc<Message>) -> bool {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        if gate.live {
            return true;
        }
        gate.backlog.push_back(message.clone());
        false
    }

    /// Pop the next buffered message, or open the gate when none is left.
    pub(crate) fn next_buffered_or_open(&self) -> Option<Arc<Message>> {
        let mut gate = self.gate.lock().unwrap_or_else(PoisonError::into_inner);
        let next = gate.backlog.pop_front();
        if next.is_none() {
            gate.live = true;
        }
        next
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("patterns", &self.patterns)
            .field("owner", &self.owner)
            .field("internal", &self.internal)
            .field("active", &self.is_active())
            .finish()
    }
}

#[derive(Debug)]
pub struct SubscriptionRegistry {
    subscriptions: BTreeMap<SubscriptionId, Arc<Subscription>>,
    next_id: u64,
    allow_global_wildcard: bool,
}

impl SubscriptionRegistry {
    pub fn new(allow_global_wildcard: bool) -> Self {
        Self {
            subscriptions: BTreeMap::new(),
            next_id: 1,
            allow_global_wildcard,
        }
    }

    /// Validate the request and build a subscription with a fresh id. The
    /// subscription is not registered until [`insert`](Self::insert).
    pub fn prepare(
        &mut self,
        patterns: &[String],
        transport: Transport,
        options: SubscribeOptions,
        internal: bool,
    ) -> Result<Arc<Subscription>, SubscribeError> {
        if patterns.is_empty() {
            return Err(SubscribeError::NoPatterns);
        }
        let mut unique: Vec<String> = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            topic::validate_pattern(pattern).map_err(|reason| SubscribeError::InvalidPattern {
                pattern: pattern.clone(),
                reason,
            })?;
            if pattern == WILDCARD && !self.allow_global_wildcard && !internal {
                return Err(SubscribeError::GlobalWildcardDisabled);
            }
            if topic::targets_reserved(pattern) && !internal {
                return Err(SubscribeError::ReservedTopic {
                    pattern: pattern.clone(),
                });
            }
            if !unique.contains(pattern) {
                unique.push(pattern.clone());
            }
        }

        let id = SubscriptionId(self.next_id);
        self.next_id += 1;

        Ok(Arc::new(Subscription {
            id,
            patterns: unique,
            owner: options.owner,
            wants_retained: options.wants_retained,
            internal,
            transport,
            liveness: options.liveness,
            cancel: options.cancel,
            active: AtomicBool::new(true),
            retired: CancellationToken::new(),
            gate: Mutex::new(Gate {
                live: !options.wants_retained,
                backlog: VecDeque::new(),
            }),
        }))
    }

    pub fn insert(&mut self, subscription: Arc<Subscription>) {
        debug!(
            "registered {} for {:?}",
            subscription.id, subscription.patterns
        );
        self.subscriptions.insert(subscription.id, subscription);
    }

    /// Remove a subscription. Removing an unknown or already removed id is a
    /// no-op returning `None`.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let removed = self.subscriptions.remove(&id)?;
        removed.deactivate();
        debug!("removed {id}");
        Some(removed)
    }

    /// Remove every subscription owned by `owner`.
    pub fn remove_owner(&mut self, owner: &str) -> Vec<Arc<Subscription>> {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|s| s.owner.as_deref() == Some(owner))
            .map(|s| s.id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Ids of active subscriptions matching `topic`.
    pub fn match_all(&self, topic: &str) -> Vec<SubscriptionId> {
        self.matching(topic).into_iter().map(|s| s.id).collect()
    }

    /// Active, uncancelled subscriptions matching `topic`, each at most once.
    pub fn matching(&self, topic: &str) -> Vec<Arc<Subscription>> {
        self.subscriptions
            .values()
            .filter(|s| s.is_active() && !s.is_cancelled() && s.matches(topic))
            .cloned()
            .collect()
    }

    /// Remove subscriptions whose owner, transport or token says they are
    /// gone. Returns the reclaimed subscriptions.
    pub fn sweep_dead(&mut self) -> Vec<Arc<Subscription>> {
        let dead: Vec<SubscriptionId> = self
            .subscriptions
            .values()
            .filter(|s| !s.is_alive())
            .map(|s| s.id)
            .collect();
        dead.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.get(&id).cloned()
    }

    pub fn contains(&self, id: SubscriptionId) -> bool {
        self.subscriptions.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }
}
