use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::json;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broker::message::{Message, Payload};
use crate::broker::rate_limit::RateLimiter;
use crate::broker::registry::{SubscribeOptions, Subscription, SubscriptionId, SubscriptionRegistry};
use crate::broker::request::{PendingReply, RequestOptions, RequestReplyCoordinator};
use crate::broker::retained::{RetainedStore, SetOutcome};
use crate::broker::stats::{StatsCollector, StatsSnapshot};
use crate::broker::topic::{self, ERROR_TOPIC, READY_TOPIC, STATS_TOPIC};
use crate::broker::validator::{MessageValidator, Origin};
use crate::config::BrokerSettings;
use crate::transport::{DeliveryError, Transport, TransportAdapter};
use crate::utils::error::{ErrorCode, ErrorEvent, PublishError, SubscribeError};

/// Publisher id used when a message is published without a [`Publisher`] handle.
pub const DEFAULT_PUBLISHER: &str = "anonymous";

/// The in-process message broker.
///
/// A `Broker` is a cheap handle around shared state; clone it freely and hand
/// the clones to whatever publishes or subscribes. Publishing never raises:
/// the outcome is a [`PublishStatus`], and every rejection is also announced
/// on the error channel (`_bus.error`).
///
/// Lock order, when more than one is held: retained store, system retained
/// map, registry. No lock is held while a transport is called.
#[derive(Clone)]
pub struct Broker {
    pub(crate) inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    pub(crate) settings: BrokerSettings,
    validator: MessageValidator,
    retained: Mutex<RetainedStore>,
    // control topics, kept apart from the producer-facing LRU
    system_retained: Mutex<HashMap<String, Arc<Message>>>,
    registry: Mutex<SubscriptionRegistry>,
    limiter: Mutex<RateLimiter>,
    pub(crate) requests: RequestReplyCoordinator,
    pub(crate) stats: StatsCollector,
}

/// Outcome of a publish.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishStatus {
    /// Handed to `recipients` subscriptions before `publish` returned.
    Delivered { id: String, recipients: usize },
    /// Accepted while a delivery pass was running on this thread; it is
    /// delivered once that pass reaches it.
    Deferred { id: String },
    Rejected(PublishError),
}

impl PublishStatus {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, PublishStatus::Rejected(_))
    }

    /// Id assigned to the message, if it was accepted.
    pub fn id(&self) -> Option<&str> {
        match self {
            PublishStatus::Delivered { id, .. } | PublishStatus::Deferred { id } => Some(id),
            PublishStatus::Rejected(_) => None,
        }
    }

    pub fn recipients(&self) -> usize {
        match self {
            PublishStatus::Delivered { recipients, .. } => *recipients,
            _ => 0,
        }
    }

    pub fn error(&self) -> Option<&PublishError> {
        match self {
            PublishStatus::Rejected(err) => Some(err),
            _ => None,
        }
    }
}

/// Work done by one [`Broker::run_maintenance`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub reclaimed_subscriptions: usize,
    pub expired_requests: usize,
    pub pruned_rate_windows: usize,
}

/// A broker handle that publishes under a fixed publisher id, which is the
/// key its messages are rate limited by.
#[derive(Clone, Debug)]
pub struct Publisher {
    broker: Broker,
    id: String,
}

impl Publisher {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn publish(&self, message: Message) -> PublishStatus {
        self.broker.publish_with(&self.id, message, Origin::Producer)
    }

    pub fn reply(&self, request: &Message, payload: impl Into<Payload>) -> PublishStatus {
        self.broker.reply_as(&self.id, request, payload)
    }

    pub fn request(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: RequestOptions,
    ) -> Result<PendingReply, crate::utils::error::RequestError> {
        let options = RequestOptions {
            publisher: Some(self.id.clone()),
            ..options
        };
        self.broker.request(topic, payload, options)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A message bound for a fixed set of subscriptions.
struct Fanout {
    broker: Broker,
    message: Arc<Message>,
    targets: Vec<Arc<Subscription>>,
}

impl Fanout {
    fn run(self) -> usize {
        self.targets
            .iter()
            .filter(|sub| self.broker.deliver_to(sub, &self.message))
            .count()
    }
}

#[derive(Default)]
struct DispatchState {
    delivering: bool,
    queue: VecDeque<Fanout>,
}

thread_local! {
    static DISPATCH: RefCell<DispatchState> = RefCell::new(DispatchState::default());
}

/// Clears the per-thread delivery pass when it ends.
struct PassGuard;

impl Drop for PassGuard {
    fn drop(&mut self) {
        let _ = DISPATCH.try_with(|state| {
            let mut state = state.borrow_mut();
            state.delivering = false;
            state.queue.clear();
        });
    }
}

/// Deliver `fanout` now, or queue it behind the pass already running on this
/// thread. Returns the recipient count when delivered now.
fn dispatch(fanout: Fanout) -> Option<usize> {
    let first = DISPATCH.with(|state| {
        let mut state = state.borrow_mut();
        if state.delivering {
            state.queue.push_back(fanout);
            None
        } else {
            state.delivering = true;
            Some(fanout)
        }
    })?;
    Some(run_pass(|| first.run()))
}

/// Run `f` as a delivery pass unless one is already running on this thread.
fn with_pass(f: impl FnOnce()) {
    let entered = DISPATCH.with(|state| {
        let mut state = state.borrow_mut();
        !std::mem::replace(&mut state.delivering, true)
    });
    if entered { run_pass(f) } else { f() }
}

/// Run `f`, then everything it queued. The caller owns the pass.
fn run_pass<R>(f: impl FnOnce() -> R) -> R {
    let _pass = PassGuard;
    let out = f();
    while let Some(next) = DISPATCH.with(|state| state.borrow_mut().queue.pop_front()) {
        next.run();
    }
    out
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl Broker {
    pub fn new() -> Self {
        Self::with_settings(BrokerSettings::default())
    }

    /// Creates a broker bounded by `settings` and announces readiness on
    /// `_bus.ready`.
    pub fn with_settings(settings: BrokerSettings) -> Self {
        let inner = BrokerInner {
            validator: MessageValidator::new(settings.max_payload_size, settings.max_message_size),
            retained: Mutex::new(RetainedStore::new(settings.max_retained)),
            system_retained: Mutex::new(HashMap::new()),
            registry: Mutex::new(SubscriptionRegistry::new(settings.allow_global_wildcard)),
            limiter: Mutex::new(RateLimiter::new(
                settings.rate_limit,
                settings.rate_limit_window_ms,
            )),
            requests: RequestReplyCoordinator::new(),
            stats: StatsCollector::new(),
            settings,
        };
        let broker = Self {
            inner: Arc::new(inner),
        };

        let started_at = now_ms();
        let ready = Message::new(
            READY_TOPIC,
            Payload::map([
                ("status", Payload::from("ready")),
                ("started_at", Payload::from(started_at)),
            ]),
        )
        .retained();
        broker.publish_internal(ready);
        info!(
            "broker ready (max_retained={}, rate_limit={}/{}ms)",
            broker.inner.settings.max_retained,
            broker.inner.settings.rate_limit,
            broker.inner.settings.rate_limit_window_ms
        );
        broker
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.inner.settings
    }

    /// A handle publishing as `id`.
    pub fn publisher(&self, id: impl Into<String>) -> Publisher {
        Publisher {
            broker: self.clone(),
            id: id.into(),
        }
    }

    /// Publishes `message` as [`DEFAULT_PUBLISHER`].
    pub fn publish(&self, message: Message) -> PublishStatus {
        self.publish_with(DEFAULT_PUBLISHER, message, Origin::Producer)
    }

    /// Validate, rate limit, retain and fan out one message.
    pub(crate) fn publish_with(
        &self,
        publisher: &str,
        mut message: Message,
        origin: Origin,
    ) -> PublishStatus {
        stamp(&mut message);

        let frozen = match self.inner.validator.validate(&message, origin) {
            Ok(frozen) => frozen,
            Err(err) => return self.reject(publisher, &message, PublishError::Invalid(err)),
        };

        if !lock(&self.inner.limiter).admit(publisher, now_ms()) {
            let err = PublishError::RateLimited {
                publisher: publisher.to_string(),
                limit: self.inner.settings.rate_limit,
                window_ms: self.inner.settings.rate_limit_window_ms,
            };
            return self.reject(publisher, &message, err);
        }

        // subscribers only ever see the validated snapshot
        message.payload = Payload::from(frozen);
        let message = Arc::new(message);
        if !topic::is_reserved(&message.topic) {
            self.inner.stats.record_published();
        }

        let targets = if message.retain {
            let mut retained = lock(&self.inner.retained);
            match retained.set(message.clone()) {
                SetOutcome::Evicted(old) => {
                    self.inner.stats.record_evicted();
                    debug!("retained store full, evicted {old}");
                }
                SetOutcome::Discarded => trace!("retention disabled, not retaining {}", message.topic),
                SetOutcome::Inserted | SetOutcome::Replaced => {}
            }
            self.inner.stats.set_retained(retained.len());
            lock(&self.inner.registry).matching(&message.topic)
        } else {
            lock(&self.inner.registry).matching(&message.topic)
        };

        trace!(
            "publishing {} on '{}' from {publisher} to {} subscription(s)",
            message.id,
            message.topic,
            targets.len()
        );
        self.fan_out(message, targets)
    }

    /// Publish broker-originated control traffic. Skips validation and rate
    /// limiting; retained control messages go to the system map.
    fn publish_internal(&self, mut message: Message) -> PublishStatus {
        stamp(&mut message);
        let message = Arc::new(message);
        let targets = if message.retain {
            let mut system = lock(&self.inner.system_retained);
            system.insert(message.topic.clone(), message.clone());
            lock(&self.inner.registry).matching(&message.topic)
        } else {
            lock(&self.inner.registry).matching(&message.topic)
        };
        self.fan_out(message, targets)
    }

    fn fan_out(&self, message: Arc<Message>, targets: Vec<Arc<Subscription>>) -> PublishStatus {
        let id = message.id.clone();
        let fanout = Fanout {
            broker: self.clone(),
            message,
            targets,
        };
        match dispatch(fanout) {
            Some(recipients) => PublishStatus::Delivered { id, recipients },
            None => PublishStatus::Deferred { id },
        }
    }

    /// Deliver to one subscription, or buffer behind its retained replay.
    /// True when the subscription counts as a recipient.
    fn deliver_to(&self, subscription: &Arc<Subscription>, message: &Arc<Message>) -> bool {
        if !subscription.is_active() {
            if subscription.is_internal() && message.topic.starts_with(topic::REPLY_PREFIX) {
                debug!(
                    "dropping late or duplicate reply {} for {}",
                    message.id,
                    message.correlation_id.as_deref().unwrap_or("-")
                );
            }
            return false;
        }
        if subscription.is_cancelled() {
            self.unsubscribe(subscription.id);
            return false;
        }
        if !subscription.admit_or_buffer(message) {
            trace!("{} buffered {} behind replay", subscription.id, message.id);
            return true;
        }
        self.hand_off(subscription, message)
    }

    /// Call the transport. A failing or panicking handler only affects its
    /// own subscription.
    fn hand_off(&self, subscription: &Subscription, message: &Arc<Message>) -> bool {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            subscription.transport().deliver(subscription.id, message)
        }));
        let result = outcome.unwrap_or_else(|panic| {
            Err(DeliveryError::Panicked(panic_message(&*panic)))
        });

        match result {
            Ok(()) => {
                if !topic::is_reserved(&message.topic) {
                    self.inner.stats.record_delivered();
                }
                true
            }
            Err(err) => {
                self.inner.stats.record_delivery_failure();
                warn!(
                    "delivery of {} on '{}' to {} failed: {err}",
                    message.id, message.topic, subscription.id
                );
                false
            }
        }
    }

    fn reject(&self, publisher: &str, message: &Message, err: PublishError) -> PublishStatus {
        self.inner.stats.record_dropped();
        self.inner.stats.record_error();
        warn!(
            "dropped message {} on '{}' from {publisher}: {err}",
            message.id, message.topic
        );
        let event = ErrorEvent::new(
            err.code(),
            err.to_string(),
            json!({
                "topic": message.topic,
                "message_id": message.id,
                "publisher": publisher,
            }),
        );
        self.emit_error(event);
        PublishStatus::Rejected(err)
    }

    fn emit_error(&self, event: ErrorEvent) {
        let payload = serde_json::to_value(&event)
            .map(Payload::from)
            .unwrap_or_default();
        let message = Message::new(ERROR_TOPIC, payload).with_header("code", event.code.as_str());
        self.publish_internal(message);
    }

    /// Register `transport` for every topic matching any of `patterns`.
    ///
    /// With `wants_retained`, matching retained messages are handed over
    /// first, oldest first, and live traffic arriving meanwhile is held back
    /// until the replay is done. Each message reaches the subscription once.
    pub fn subscribe<P: AsRef<str>>(
        &self,
        patterns: &[P],
        transport: Transport,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe_with(patterns, transport, options, false)
    }

    /// Subscribe a closure.
    pub fn subscribe_fn<P, F>(
        &self,
        patterns: &[P],
        options: SubscribeOptions,
        handler: F,
    ) -> Result<SubscriptionId, SubscribeError>
    where
        P: AsRef<str>,
        F: Fn(&Arc<Message>) + Send + Sync + 'static,
    {
        self.subscribe(patterns, Transport::callback(handler), options)
    }

    /// Subscribe through an unbounded channel. The subscription is reclaimed
    /// once the receiver is dropped.
    pub fn subscribe_channel<P: AsRef<str>>(
        &self,
        patterns: &[P],
        options: SubscribeOptions,
    ) -> Result<
        (
            SubscriptionId,
            tokio::sync::mpsc::UnboundedReceiver<Arc<Message>>,
        ),
        SubscribeError,
    > {
        let (transport, rx) = Transport::channel();
        let id = self.subscribe(patterns, transport, options)?;
        Ok((id, rx))
    }

    pub(crate) fn subscribe_with<P: AsRef<str>>(
        &self,
        patterns: &[P],
        transport: Transport,
        options: SubscribeOptions,
        internal: bool,
    ) -> Result<SubscriptionId, SubscribeError> {
        let patterns: Vec<String> = patterns.iter().map(|p| p.as_ref().to_string()).collect();
        let cancel = options.cancel.clone();

        let prepared = {
            let mut retained = options.wants_retained.then(|| lock(&self.inner.retained));
            let system =
                (options.wants_retained && internal).then(|| lock(&self.inner.system_retained));
            let mut registry = lock(&self.inner.registry);

            registry
                .prepare(&patterns, transport, options, internal)
                .map(|subscription| {
                    let mut replay = Vec::new();
                    if subscription.is_cancelled() {
                        // never registered, so nothing can reach it
                        subscription.deactivate();
                        return (subscription, replay);
                    }
                    if let Some(store) = retained.as_mut() {
                        replay.extend(
                            store
                                .replay_matching_any(&subscription.patterns)
                                .filter(|m| subscription.matches(&m.topic)),
                        );
                    }
                    if let Some(system) = system.as_ref() {
                        replay.extend(
                            system
                                .values()
                                .filter(|m| subscription.matches(&m.topic))
                                .cloned(),
                        );
                    }
                    registry.insert(subscription.clone());
                    self.inner.stats.set_subscriptions(registry.len());
                    (subscription, replay)
                })
        };

        let (subscription, replay) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                self.report_subscribe_error(&patterns, &err);
                return Err(err);
            }
        };

        if !subscription.is_active() {
            debug!("{} cancelled before it was registered", subscription.id);
            return Ok(subscription.id);
        }

        if let Some(token) = cancel {
            self.watch_cancellation(&subscription, token);
        }

        if subscription.wants_retained {
            debug!(
                "replaying {} retained message(s) to {}",
                replay.len(),
                subscription.id
            );
            with_pass(|| {
                for message in &replay {
                    if !subscription.is_active() || subscription.is_cancelled() {
                        break;
                    }
                    self.hand_off(&subscription, message);
                }
                while let Some(message) = subscription.next_buffered_or_open() {
                    if subscription.is_active() && !subscription.is_cancelled() {
                        self.hand_off(&subscription, &message);
                    }
                }
                if subscription.is_cancelled() {
                    self.unsubscribe(subscription.id);
                }
            });
        }

        Ok(subscription.id)
    }

    /// Unsubscribe as soon as `token` fires, when a runtime is around to
    /// watch it. Without one the token is still honoured at delivery time.
    fn watch_cancellation(
        &self,
        subscription: &Subscription,
        token: tokio_util::sync::CancellationToken,
    ) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let retired = subscription.retired();
        let id = subscription.id;
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    if let Some(inner) = weak.upgrade() {
                        Broker { inner }.unsubscribe(id);
                    }
                }
                _ = retired.cancelled() => {}
            }
        });
    }

    fn report_subscribe_error(&self, patterns: &[String], err: &SubscribeError) {
        self.inner.stats.record_error();
        warn!("subscription for {patterns:?} rejected: {err}");
        let event = ErrorEvent::new(
            ErrorCode::SubscriptionInvalid,
            err.to_string(),
            json!({ "patterns": patterns, "reason": err.reason() }),
        );
        self.emit_error(event);
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut registry = lock(&self.inner.registry);
        let removed = registry.remove(id).is_some();
        self.inner.stats.set_subscriptions(registry.len());
        removed
    }

    /// Remove every subscription owned by `owner`.
    pub fn unsubscribe_owner(&self, owner: &str) -> usize {
        let mut registry = lock(&self.inner.registry);
        let removed = registry.remove_owner(owner).len();
        self.inner.stats.set_subscriptions(registry.len());
        if removed > 0 {
            debug!("removed {removed} subscription(s) owned by {owner}");
        }
        removed
    }

    /// Ids of the subscriptions a message on `topic` would reach.
    pub fn match_all(&self, topic: &str) -> Vec<SubscriptionId> {
        lock(&self.inner.registry).match_all(topic)
    }

    /// Reclaim subscriptions whose owner or receiving side is gone.
    pub fn sweep_dead(&self) -> usize {
        let mut registry = lock(&self.inner.registry);
        let reclaimed = registry.sweep_dead();
        self.inner.stats.set_subscriptions(registry.len());
        for subscription in &reclaimed {
            info!(
                "reclaimed dead subscription {} ({:?})",
                subscription.id, subscription.patterns
            );
        }
        reclaimed.len()
    }

    /// Current retained message for `topic`, without touching its recency.
    pub fn retained(&self, topic: &str) -> Option<Arc<Message>> {
        lock(&self.inner.retained).get(topic)
    }

    /// Retained topics, least recently touched first.
    pub fn retained_topics(&self) -> Vec<String> {
        lock(&self.inner.retained).topics()
    }

    /// Drop retained messages whose topic matches `pattern`, or all of them.
    pub fn clear_retained(&self, pattern: Option<&str>) -> usize {
        let mut retained = lock(&self.inner.retained);
        let cleared = retained.clear(pattern);
        self.inner.stats.set_retained(retained.len());
        if cleared > 0 {
            info!("cleared {cleared} retained message(s)");
        }
        cleared
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Receive every [`ErrorEvent`] as JSON on `_bus.error`.
    pub fn subscribe_errors(&self, transport: Transport) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe_with(&[ERROR_TOPIC], transport, SubscribeOptions::new(), true)
    }

    /// Receive the readiness announcement; it is replayed to late subscribers.
    pub fn subscribe_ready(&self, transport: Transport) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe_with(
            &[READY_TOPIC],
            transport,
            SubscribeOptions::new().with_retained(),
            true,
        )
    }

    /// Receive stats snapshots written by [`publish_stats`](Self::publish_stats),
    /// starting with the latest one.
    pub fn subscribe_stats(&self, transport: Transport) -> Result<SubscriptionId, SubscribeError> {
        self.subscribe_with(
            &[STATS_TOPIC],
            transport,
            SubscribeOptions::new().with_retained(),
            true,
        )
    }

    /// Publish the current snapshot on `_bus.stats` and return it.
    pub fn publish_stats(&self) -> StatsSnapshot {
        let snapshot = self.stats();
        let payload = serde_json::to_value(snapshot)
            .map(Payload::from)
            .unwrap_or_default();
        self.publish_internal(Message::new(STATS_TOPIC, payload).retained());
        snapshot
    }

    /// One housekeeping pass: reclaim dead subscriptions, expire overdue
    /// requests and forget idle rate windows.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let report = MaintenanceReport {
            reclaimed_subscriptions: self.sweep_dead(),
            expired_requests: self.expire_overdue_requests(),
            pruned_rate_windows: lock(&self.inner.limiter).prune(now_ms()),
        };
        if report != MaintenanceReport::default() {
            debug!("maintenance: {report:?}");
        }
        report
    }

    /// Run [`run_maintenance`](Self::run_maintenance) every
    /// `cleanup_interval_ms` until the last broker handle is dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start_maintenance_loop(&self) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("broker dropped, stopping maintenance loop");
                    break;
                };
                Broker { inner }.run_maintenance();
            }
        })
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("settings", &self.inner.settings)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Assign id and timestamp when the producer left them unset.
fn stamp(message: &mut Message) {
    if message.id.is_empty() {
        message.id = Uuid::new_v4().to_string();
    }
    if message.timestamp == 0 {
        message.timestamp = now_ms();
    }
}
