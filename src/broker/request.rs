//! Request/reply over pub/sub
//!
//! A request is an ordinary publish carrying `reply_to` and
//! `correlation_id`. The requester listens on a private `_bus.reply.*` topic
//! and the first reply carrying its correlation id completes the request.
//!
//! Exactly one of {reply, timeout, cancellation} settles a pending request:
//! whoever takes its entry out of the coordinator owns the outcome.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::FusedFuture;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broker::engine::{Broker, DEFAULT_PUBLISHER, PublishStatus, lock};
use crate::broker::message::{Message, Payload};
use crate::broker::registry::{SubscribeOptions, SubscriptionId};
use crate::broker::topic::REPLY_PREFIX;
use crate::broker::validator::Origin;
use crate::transport::Transport;
use crate::utils::error::{PublishError, RequestError};

type ReplyResult = Result<Arc<Message>, RequestError>;

#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Falls back to the broker's `default_request_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Rate limit key for the request message.
    pub publisher: Option<String>,
    pub headers: Option<HashMap<String, String>>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub topic: String,
    pub correlation_id: String,
    pub reply_topic: String,
    pub subscription: SubscriptionId,
    pub timeout: Duration,
    pub deadline: Instant,
    resolver: oneshot::Sender<ReplyResult>,
}

impl PendingRequest {
    fn timeout_error(&self) -> RequestError {
        RequestError::Timeout {
            topic: self.topic.clone(),
            correlation_id: self.correlation_id.clone(),
            timeout_ms: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    fn settle(self, outcome: ReplyResult) {
        // the requester may already be gone
        let _ = self.resolver.send(outcome);
    }
}

/// Pending requests keyed by correlation id.
#[derive(Debug, Default)]
pub struct RequestReplyCoordinator {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl RequestReplyCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, request: PendingRequest) -> usize {
        let mut pending = lock(&self.pending);
        pending.insert(request.correlation_id.clone(), request);
        pending.len()
    }

    /// Take the entry out; only the caller that gets `Some` may settle it.
    fn take(&self, correlation_id: &str) -> Option<(PendingRequest, usize)> {
        let mut pending = lock(&self.pending);
        let request = pending.remove(correlation_id)?;
        Some((request, pending.len()))
    }

    fn take_overdue(&self, now: Instant) -> (Vec<PendingRequest>, usize) {
        let mut pending = lock(&self.pending);
        let overdue: Vec<String> = pending
            .values()
            .filter(|r| r.deadline <= now)
            .map(|r| r.correlation_id.clone())
            .collect();
        let taken = overdue
            .iter()
            .filter_map(|cid| pending.remove(cid))
            .collect();
        (taken, pending.len())
    }

    /// Requests still waiting for a reply.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Future returned by [`Broker::request`]. Resolves with the first reply, or
/// with [`RequestError::Timeout`]. Dropping it abandons the request.
#[must_use = "a request is abandoned when its PendingReply is dropped"]
pub struct PendingReply {
    broker: Broker,
    correlation_id: String,
    deadline: Instant,
    reply: oneshot::Receiver<ReplyResult>,
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }
}

impl Future for PendingReply {
    type Output = ReplyResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Err(RequestError::Closed));
        }

        if let Poll::Ready(outcome) = Pin::new(&mut this.reply).poll(cx) {
            this.done = true;
            return Poll::Ready(outcome.unwrap_or(Err(RequestError::Closed)));
        }

        let deadline = this.deadline;
        let sleep = this
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        this.done = true;
        let outcome = match this.broker.settle_timeout(&this.correlation_id) {
            Some(err) => Err(err),
            // a reply or the sweeper got there first
            None => this.reply.try_recv().unwrap_or(Err(RequestError::Closed)),
        };
        Poll::Ready(outcome)
    }
}

impl FusedFuture for PendingReply {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        if !self.done {
            self.broker.cancel_request(&self.correlation_id);
        }
    }
}

impl std::fmt::Debug for PendingReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingReply")
            .field("correlation_id", &self.correlation_id)
            .field("deadline", &self.deadline)
            .field("done", &self.done)
            .finish()
    }
}

impl Broker {
    /// Publish a request on `topic` and wait for the first reply.
    ///
    /// The reply subscription is in place before the request is published,
    /// so a responder answering synchronously is never missed.
    pub fn request(
        &self,
        topic: &str,
        payload: impl Into<Payload>,
        options: RequestOptions,
    ) -> Result<PendingReply, RequestError> {
        let correlation_id = Uuid::new_v4().to_string();
        let reply_topic = format!("{REPLY_PREFIX}{}", Uuid::new_v4().simple());
        let timeout = options
            .timeout
            .unwrap_or_else(|| self.inner.settings.default_request_timeout());

        let weak = Arc::downgrade(&self.inner);
        let listener = Transport::callback(move |reply| {
            if let Some(inner) = weak.upgrade() {
                Broker { inner }.complete_request(reply);
            }
        });
        // reply topics are always valid internal patterns
        let subscription = self
            .subscribe_with(&[reply_topic.as_str()], listener, SubscribeOptions::new(), true)
            .map_err(|_| RequestError::Closed)?;

        let (resolver, reply) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let pending = self.inner.requests.register(PendingRequest {
            topic: topic.to_string(),
            correlation_id: correlation_id.clone(),
            reply_topic: reply_topic.clone(),
            subscription,
            timeout,
            deadline,
            resolver,
        });
        self.inner.stats.set_pending_requests(pending);

        let mut message = Message::new(topic, payload)
            .with_reply_to(reply_topic)
            .with_correlation_id(correlation_id.clone());
        message.headers = options.headers;

        let publisher = options.publisher.as_deref().unwrap_or(DEFAULT_PUBLISHER);
        if let PublishStatus::Rejected(err) =
            self.publish_with(publisher, message, Origin::Producer)
        {
            self.cancel_request(&correlation_id);
            return Err(RequestError::Publish(err));
        }

        debug!("request {correlation_id} on '{topic}' waiting up to {timeout:?}");
        Ok(PendingReply {
            broker: self.clone(),
            correlation_id,
            deadline,
            reply,
            sleep: None,
            done: false,
        })
    }

    /// Answer `request` on its `reply_to` topic, echoing its correlation id.
    pub fn reply(&self, request: &Message, payload: impl Into<Payload>) -> PublishStatus {
        self.reply_as(DEFAULT_PUBLISHER, request, payload)
    }

    pub(crate) fn reply_as(
        &self,
        publisher: &str,
        request: &Message,
        payload: impl Into<Payload>,
    ) -> PublishStatus {
        let (Some(reply_to), Some(correlation_id)) = (&request.reply_to, &request.correlation_id)
        else {
            warn!("{publisher} replied to {} which is not a request", request.id);
            return PublishStatus::Rejected(PublishError::NotARequest);
        };
        let message = Message::new(reply_to.clone(), payload).with_correlation_id(correlation_id.clone());
        self.publish_with(publisher, message, Origin::Responder)
    }

    /// Route a reply to its pending request. Late or duplicate replies are
    /// dropped.
    fn complete_request(&self, reply: &Arc<Message>) {
        let Some(correlation_id) = reply.correlation_id.as_deref() else {
            debug!("ignoring reply {} without correlation id", reply.id);
            return;
        };
        match self.take_request(correlation_id) {
            Some(request) => {
                debug!(
                    "request {correlation_id} answered on {} by {}",
                    request.reply_topic, reply.id
                );
                request.settle(Ok(reply.clone()));
            }
            None => debug!("ignoring late or duplicate reply for {correlation_id}"),
        }
    }

    /// Claim a request for timing out. `None` means something else settled it.
    fn settle_timeout(&self, correlation_id: &str) -> Option<RequestError> {
        let request = self.take_request(correlation_id)?;
        let err = request.timeout_error();
        warn!("{err}");
        Some(err)
    }

    pub(crate) fn cancel_request(&self, correlation_id: &str) {
        if self.take_request(correlation_id).is_some() {
            debug!("request {correlation_id} abandoned");
        }
    }

    /// Take a pending request and drop its reply subscription.
    fn take_request(&self, correlation_id: &str) -> Option<PendingRequest> {
        let (request, remaining) = self.inner.requests.take(correlation_id)?;
        self.inner.stats.set_pending_requests(remaining);
        self.unsubscribe(request.subscription);
        Some(request)
    }

    /// Time out every request past its deadline. Returns how many expired.
    pub(crate) fn expire_overdue_requests(&self) -> usize {
        let (overdue, remaining) = self.inner.requests.take_overdue(Instant::now());
        self.inner.stats.set_pending_requests(remaining);
        let expired = overdue.len();
        for request in overdue {
            self.unsubscribe(request.subscription);
            let err = request.timeout_error();
            warn!("{err}");
            request.settle(Err(err));
        }
        expired
    }

    /// Requests still waiting for a reply.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.len()
    }
}
