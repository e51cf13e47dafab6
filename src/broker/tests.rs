use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use super::message::{Message, Opaque, Payload};
use super::registry::SubscribeOptions;
use super::request::RequestOptions;
use super::{Broker, PublishStatus};
use crate::client::Client;
use crate::config::BrokerSettings;
use crate::transport::Transport;
use crate::utils::error::{PublishError, RequestError, SubscribeError, ValidationError};

type Seen = Arc<Mutex<Vec<String>>>;

/// Subscribe a handler that records the topic of everything it receives.
fn record(broker: &Broker, patterns: &[&str], options: SubscribeOptions) -> Seen {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    broker
        .subscribe_fn(patterns, options, move |m| {
            sink.lock().unwrap().push(m.topic.clone());
        })
        .unwrap();
    seen
}

fn topics(seen: &Seen) -> Vec<String> {
    seen.lock().unwrap().clone()
}

fn drain(rx: &mut UnboundedReceiver<Arc<Message>>) -> Vec<Arc<Message>> {
    let mut out = Vec::new();
    while let Ok(m) = rx.try_recv() {
        out.push(m);
    }
    out
}

fn error_codes(rx: &mut UnboundedReceiver<Arc<Message>>) -> Vec<String> {
    drain(rx)
        .iter()
        .filter_map(|m| m.payload.get("code").and_then(Payload::as_str).map(str::to_string))
        .collect()
}

fn broker_with(settings: BrokerSettings) -> Broker {
    Broker::with_settings(settings)
}

#[test]
fn test_single_segment_wildcard_fan_out() {
    let broker = Broker::new();
    let wildcard = record(&broker, &["users.*"], SubscribeOptions::new());
    let exact = record(&broker, &["users.item"], SubscribeOptions::new());

    let status = broker.publish(Message::new("users.item", 1));
    assert_eq!(status.recipients(), 2);
    broker.publish(Message::new("users.item.42", 2));
    broker.publish(Message::new("orders.item", 3));

    assert_eq!(topics(&wildcard), vec!["users.item"]);
    assert_eq!(topics(&exact), vec!["users.item"]);
}

#[test]
fn test_overlapping_patterns_deliver_once() {
    let broker = Broker::new();
    let seen = record(&broker, &["a.*", "a.b", "*"], SubscribeOptions::new());
    assert_eq!(broker.publish(Message::new("a.b", 1)).recipients(), 1);
    assert_eq!(topics(&seen), vec!["a.b"]);
}

#[test]
fn test_global_wildcard_skips_control_topics() {
    let broker = Broker::new();
    let (errors, mut error_rx) = Transport::channel();
    broker.subscribe_errors(errors).unwrap();
    let all = record(&broker, &["*"], SubscribeOptions::new().with_retained());

    broker.publish(Message::new("anything.at.all", 1));
    broker.publish(Message::new("", 1));

    assert_eq!(topics(&all), vec!["anything.at.all"]);
    assert_eq!(error_codes(&mut error_rx), vec!["MESSAGE_INVALID"]);
}

#[test]
fn test_global_wildcard_can_be_disabled() {
    let broker = broker_with(BrokerSettings {
        allow_global_wildcard: false,
        ..BrokerSettings::default()
    });
    let (errors, mut error_rx) = Transport::channel();
    broker.subscribe_errors(errors).unwrap();

    let err = broker
        .subscribe_fn(&["*"], SubscribeOptions::new(), |_| {})
        .unwrap_err();
    assert_eq!(err, SubscribeError::GlobalWildcardDisabled);

    let events = drain(&mut error_rx);
    assert_eq!(events.len(), 1);
    let reason = events[0]
        .payload
        .get("details")
        .and_then(|d| d.get("reason"))
        .and_then(Payload::as_str);
    assert_eq!(reason, Some("GlobalWildcardDisabled"));
    assert_eq!(broker.stats().errors, 1);
}

#[test]
fn test_invalid_subscriptions_are_rejected() {
    let broker = Broker::new();
    let none: [&str; 0] = [];
    assert_eq!(
        broker.subscribe_fn(&none, SubscribeOptions::new(), |_| {}),
        Err(SubscribeError::NoPatterns)
    );
    assert!(matches!(
        broker.subscribe_fn(&["users.it*"], SubscribeOptions::new(), |_| {}),
        Err(SubscribeError::InvalidPattern { .. })
    ));
    assert!(matches!(
        broker.subscribe_fn(&["_bus.*"], SubscribeOptions::new(), |_| {}),
        Err(SubscribeError::ReservedTopic { .. })
    ));
}

#[test]
fn test_producers_cannot_publish_control_topics() {
    let broker = Broker::new();
    let status = broker.publish(Message::new("_bus.ready", "fake"));
    assert!(matches!(
        status,
        PublishStatus::Rejected(PublishError::Invalid(ValidationError::ReservedTopic { .. }))
    ));
}

#[test]
fn test_retained_replay_in_recency_order_then_live() {
    let broker = Broker::new();
    broker.publish(Message::new("cfg.one", 1).retained());
    broker.publish(Message::new("cfg.two", 2).retained());
    broker.publish(Message::new("cfg.three", 3).retained());
    broker.publish(Message::new("cfg.one", 11).retained());

    let late = record(&broker, &["cfg.*"], SubscribeOptions::new().with_retained());
    let plain = record(&broker, &["cfg.*"], SubscribeOptions::new());
    broker.publish(Message::new("cfg.four", 4));

    assert_eq!(
        topics(&late),
        vec!["cfg.two", "cfg.three", "cfg.one", "cfg.four"]
    );
    assert_eq!(topics(&plain), vec!["cfg.four"]);
    assert_eq!(
        broker.retained("cfg.one").unwrap().payload.as_i64(),
        Some(11)
    );
    assert_eq!(broker.stats().retained, 3);
}

#[test]
fn test_retained_replay_keeps_recency_order_across_patterns() {
    let broker = Broker::new();
    broker.publish(Message::new("a.1", 1).retained());
    broker.publish(Message::new("b.1", 2).retained());

    let seen = record(&broker, &["b.*", "a.*"], SubscribeOptions::new().with_retained());

    assert_eq!(topics(&seen), vec!["a.1", "b.1"]);
    assert_eq!(broker.retained_topics(), vec!["a.1", "b.1"]);
}

#[test]
fn test_retained_store_is_lru_bounded() {
    let broker = broker_with(BrokerSettings {
        max_retained: 3,
        ..BrokerSettings::default()
    });
    for i in 0..5 {
        broker.publish(Message::new(format!("cfg.{i}"), i).retained());
    }

    assert_eq!(broker.retained_topics(), vec!["cfg.2", "cfg.3", "cfg.4"]);
    assert!(broker.retained("cfg.0").is_none());
    let stats = broker.stats();
    assert_eq!(stats.retained, 3);
    assert_eq!(stats.retained_evicted, 2);
}

#[test]
fn test_zero_max_retained_disables_retention() {
    let broker = broker_with(BrokerSettings {
        max_retained: 0,
        ..BrokerSettings::default()
    });
    let seen = record(&broker, &["cfg.*"], SubscribeOptions::new());
    broker.publish(Message::new("cfg.a", 1).retained());

    assert_eq!(topics(&seen), vec!["cfg.a"]);
    assert!(broker.retained("cfg.a").is_none());
    assert_eq!(broker.stats().retained, 0);
}

#[test]
fn test_clear_retained_by_pattern() {
    let broker = Broker::new();
    broker.publish(Message::new("cfg.a", 1).retained());
    broker.publish(Message::new("cfg.b", 1).retained());
    broker.publish(Message::new("other", 1).retained());

    assert_eq!(broker.clear_retained(Some("cfg.*")), 2);
    assert_eq!(broker.retained_topics(), vec!["other"]);
    assert_eq!(broker.clear_retained(None), 1);
    assert_eq!(broker.stats().retained, 0);
}

#[test]
fn test_rate_limit_drops_excess_and_reports_each() {
    let broker = broker_with(BrokerSettings {
        rate_limit: 5,
        rate_limit_window_ms: 60_000,
        ..BrokerSettings::default()
    });
    let (errors, mut error_rx) = Transport::channel();
    broker.subscribe_errors(errors).unwrap();
    let seen = record(&broker, &["metrics.*"], SubscribeOptions::new());

    let sensor = broker.publisher("sensor-1");
    let statuses: Vec<PublishStatus> = (0..8)
        .map(|i| sensor.publish(Message::new("metrics.tick", i)))
        .collect();

    assert_eq!(statuses.iter().filter(|s| s.is_accepted()).count(), 5);
    assert!(statuses[5..].iter().all(|s| matches!(
        s,
        PublishStatus::Rejected(PublishError::RateLimited { limit: 5, .. })
    )));
    assert_eq!(topics(&seen).len(), 5);
    assert_eq!(error_codes(&mut error_rx), vec!["RATE_LIMIT_EXCEEDED"; 3]);
    assert_eq!(broker.stats().dropped, 3);

    // other publishers have their own window
    assert!(broker
        .publisher("sensor-2")
        .publish(Message::new("metrics.tick", 0))
        .is_accepted());
}

#[test]
fn test_cyclic_payload_is_rejected() {
    let broker = Broker::new();
    let (errors, mut error_rx) = Transport::channel();
    broker.subscribe_errors(errors).unwrap();
    let seen = record(&broker, &["graph.*"], SubscribeOptions::new());

    let (payload, node) = Payload::shared(Payload::map([("name", "loop")]));
    let self_ref = payload.clone();
    node.update(|inner| {
        if let Payload::Map(entries) = inner {
            entries.insert("me".to_string(), self_ref);
        }
    });

    let status = broker.publish(Message::new("graph.node", payload));
    assert!(matches!(
        status,
        PublishStatus::Rejected(PublishError::Invalid(ValidationError::CyclicReference { .. }))
    ));
    assert!(topics(&seen).is_empty());
    assert_eq!(error_codes(&mut error_rx), vec!["MESSAGE_INVALID"]);
    let stats = broker.stats();
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.published, 0);
}

#[test]
fn test_oversized_and_opaque_payloads_are_rejected() {
    let broker = broker_with(BrokerSettings {
        max_payload_size: 16,
        ..BrokerSettings::default()
    });
    assert!(matches!(
        broker.publish(Message::new("big", "x".repeat(100))),
        PublishStatus::Rejected(PublishError::Invalid(ValidationError::PayloadTooLarge { .. }))
    ));
    assert!(matches!(
        broker.publish(Message::new("fn", Opaque::function())),
        PublishStatus::Rejected(PublishError::Invalid(ValidationError::NotSerializable { .. }))
    ));
}

#[test]
fn test_subscribers_receive_a_frozen_snapshot() {
    let broker = Broker::new();
    let (_, mut rx) = broker
        .subscribe_channel(&["state.counter"], SubscribeOptions::new())
        .unwrap();

    let (payload, node) = Payload::shared(Payload::map([("count", 1)]));
    broker.publish(Message::new("state.counter", payload).retained());
    node.update(|inner| {
        if let Payload::Map(entries) = inner {
            entries.insert("count".to_string(), Payload::from(99));
        }
    });

    let got = rx.try_recv().unwrap();
    assert_eq!(got.payload.get("count").and_then(Payload::as_i64), Some(1));
    let kept = broker.retained("state.counter").unwrap();
    assert_eq!(kept.payload.get("count").and_then(Payload::as_i64), Some(1));
    assert!(!got.id.is_empty());
    assert!(got.timestamp > 0);
}

#[test]
fn test_unsubscribe_is_idempotent() {
    let broker = Broker::new();
    let id = broker
        .subscribe_fn(&["a"], SubscribeOptions::new(), |_| {})
        .unwrap();
    assert!(broker.unsubscribe(id));
    assert!(!broker.unsubscribe(id));
    assert_eq!(broker.publish(Message::new("a", 1)).recipients(), 0);
}

#[test]
fn test_unsubscribe_owner_removes_all_of_them() {
    let broker = Broker::new();
    let panel = Client::with_id("panel");
    let a = record(&broker, &["a"], SubscribeOptions::new().owned_by(&panel));
    let b = record(&broker, &["b"], SubscribeOptions::new().owned_by(&panel));
    let other = record(&broker, &["a"], SubscribeOptions::new());

    assert_eq!(broker.unsubscribe_owner("panel"), 2);
    broker.publish(Message::new("a", 1));
    broker.publish(Message::new("b", 1));

    assert!(topics(&a).is_empty());
    assert!(topics(&b).is_empty());
    assert_eq!(topics(&other), vec!["a"]);
}

#[test]
fn test_dead_subscribers_are_reclaimed() {
    let broker = Broker::new();
    let client = Client::new();
    broker
        .subscribe_fn(&["news.*"], SubscribeOptions::new().owned_by(&client), |_| {})
        .unwrap();
    let (_, rx) = broker
        .subscribe_channel(&["news.*"], SubscribeOptions::new())
        .unwrap();
    let keeper = record(&broker, &["news.*"], SubscribeOptions::new());
    assert_eq!(broker.sweep_dead(), 0);

    drop(client);
    drop(rx);
    assert_eq!(broker.sweep_dead(), 2);
    assert_eq!(broker.match_all("news.today").len(), 1);
    assert_eq!(broker.stats().subscriptions, 1);

    broker.publish(Message::new("news.today", 1));
    assert_eq!(topics(&keeper), vec!["news.today"]);
}

#[test]
fn test_cancelled_token_stops_delivery() {
    let broker = Broker::new();
    let token = CancellationToken::new();
    let (transport, mut rx) = Transport::channel();
    let id = broker
        .subscribe(
            &["jobs.*"],
            transport,
            SubscribeOptions::new().with_cancellation(token.clone()),
        )
        .unwrap();

    broker.publish(Message::new("jobs.a", 1));
    token.cancel();
    assert_eq!(broker.publish(Message::new("jobs.b", 2)).recipients(), 0);

    let got: Vec<String> = drain(&mut rx).iter().map(|m| m.topic.clone()).collect();
    assert_eq!(got, vec!["jobs.a"]);
    assert!(!broker.unsubscribe(id));
}

#[test]
fn test_already_cancelled_token_gets_no_replay() {
    let broker = Broker::new();
    broker.publish(Message::new("cfg.a", 1).retained());
    let token = CancellationToken::new();
    token.cancel();

    let seen = record(
        &broker,
        &["cfg.*"],
        SubscribeOptions::new()
            .with_retained()
            .with_cancellation(token),
    );
    broker.publish(Message::new("cfg.b", 2));

    assert!(topics(&seen).is_empty());
    assert!(broker.match_all("cfg.a").is_empty());
    assert_eq!(broker.stats().subscriptions, 0);
}

#[test]
fn test_cancelled_token_hides_subscription_from_match_all() {
    let broker = Broker::new();
    let token = CancellationToken::new();
    broker
        .subscribe_fn(
            &["jobs.*"],
            SubscribeOptions::new().with_cancellation(token.clone()),
            |_| {},
        )
        .unwrap();

    // no runtime, so no watcher task removes it
    token.cancel();
    assert!(broker.match_all("jobs.x").is_empty());
}

#[tokio::test]
async fn test_cancellation_unsubscribes_without_a_publish() {
    let broker = Broker::new();
    let token = CancellationToken::new();
    broker
        .subscribe_fn(
            &["jobs.*"],
            SubscribeOptions::new().with_cancellation(token.clone()),
            |_| {},
        )
        .unwrap();
    assert_eq!(broker.match_all("jobs.x").len(), 1);

    token.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(broker.match_all("jobs.x").is_empty());
}

#[test]
fn test_reentrant_publish_is_delivered_after_current_pass() {
    let broker = Broker::new();
    let log = record(&broker, &["chain.*"], SubscribeOptions::new());

    let inner = broker.clone();
    let nested: Arc<Mutex<Vec<PublishStatus>>> = Arc::default();
    let statuses = nested.clone();
    broker
        .subscribe_fn(&["chain.start"], SubscribeOptions::new(), move |_| {
            let status = inner.publish(Message::new("chain.next", 1));
            statuses.lock().unwrap().push(status);
        })
        .unwrap();
    let tail = record(&broker, &["chain.start"], SubscribeOptions::new());

    let status = broker.publish(Message::new("chain.start", 0));
    assert_eq!(status.recipients(), 3);
    // the nested publish waits for chain.start to reach every subscriber
    assert_eq!(topics(&log), vec!["chain.start", "chain.next"]);
    assert_eq!(topics(&tail), vec!["chain.start"]);
    assert!(matches!(
        nested.lock().unwrap()[0],
        PublishStatus::Deferred { .. }
    ));
}

#[test]
fn test_failing_handler_does_not_affect_others() {
    let broker = Broker::new();
    broker
        .subscribe_fn(&["work"], SubscribeOptions::new(), |_| panic!("boom"))
        .unwrap();
    let healthy = record(&broker, &["work"], SubscribeOptions::new());

    let status = broker.publish(Message::new("work", 1));
    assert_eq!(status.recipients(), 1);
    assert_eq!(topics(&healthy), vec!["work"]);

    let stats = broker.stats();
    assert_eq!(stats.delivery_failures, 1);
    assert_eq!(stats.delivered, 1);

    // the panic did not leave the thread stuck inside a delivery pass
    assert!(matches!(
        broker.publish(Message::new("work", 2)),
        PublishStatus::Delivered { .. }
    ));
}

#[test]
fn test_bounded_queue_transport_reports_overflow() {
    let broker = Broker::new();
    let (transport, queue) = Transport::queue(1);
    broker
        .subscribe(&["q"], transport, SubscribeOptions::new())
        .unwrap();

    broker.publish(Message::new("q", 1));
    broker.publish(Message::new("q", 2));

    assert_eq!(queue.len(), 1);
    assert_eq!(queue.try_pop().unwrap().payload.as_i64(), Some(1));
    assert_eq!(broker.stats().delivery_failures, 1);
}

#[test]
fn test_ready_is_replayed_to_late_subscribers() {
    let broker = Broker::new();
    let (transport, mut rx) = Transport::channel();
    broker.subscribe_ready(transport).unwrap();

    let ready = rx.try_recv().unwrap();
    assert_eq!(ready.topic, "_bus.ready");
    assert_eq!(ready.payload.get("status").and_then(Payload::as_str), Some("ready"));
    assert!(broker.retained_topics().is_empty());
}

#[test]
fn test_stats_snapshot_and_channel() {
    let broker = Broker::new();
    let seen = record(&broker, &["a"], SubscribeOptions::new());
    broker.publish(Message::new("a", 1));
    broker.publish(Message::new("a", 2));
    assert_eq!(topics(&seen).len(), 2);

    let (transport, mut rx) = Transport::channel();
    broker.subscribe_stats(transport).unwrap();
    assert!(rx.try_recv().is_err());

    let snapshot = broker.publish_stats();
    assert_eq!(snapshot.published, 2);
    assert_eq!(snapshot.delivered, 2);
    assert_eq!(snapshot.subscriptions, 2);

    let published = rx.try_recv().unwrap();
    assert_eq!(
        published.payload.get("published").and_then(Payload::as_i64),
        Some(2)
    );
    // control traffic is not counted
    assert_eq!(broker.stats().published, 2);
}

#[test]
fn test_concurrent_publishers() {
    let broker = broker_with(BrokerSettings {
        rate_limit: 10_000,
        ..BrokerSettings::default()
    });
    let count = Arc::new(AtomicUsize::new(0));
    let counter = count.clone();
    broker
        .subscribe_fn(&["load.*"], SubscribeOptions::new(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let publisher = broker.publisher(format!("worker-{t}"));
            thread::spawn(move || {
                for i in 0..250 {
                    publisher.publish(Message::new(format!("load.t{t}"), i));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(count.load(Ordering::SeqCst), 1000);
    let stats = broker.stats();
    assert_eq!(stats.published, 1000);
    assert_eq!(stats.delivered, 1000);
}

#[test]
fn test_retained_replay_races_live_publishes_exactly_once() {
    let broker = broker_with(BrokerSettings {
        rate_limit: 10_000,
        ..BrokerSettings::default()
    });
    let writer = broker.clone();
    let handle = thread::spawn(move || {
        for i in 0..500i64 {
            writer.publish(Message::new("race.value", i).retained());
        }
    });

    let seen: Arc<Mutex<Vec<i64>>> = Arc::default();
    let sink = seen.clone();
    broker
        .subscribe_fn(
            &["race.value"],
            SubscribeOptions::new().with_retained(),
            move |m| {
                if let Some(v) = m.payload.as_i64() {
                    sink.lock().unwrap().push(v);
                }
            },
        )
        .unwrap();
    handle.join().unwrap();

    let seen = seen.lock().unwrap();
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "duplicate or reordered: {seen:?}");
    assert_eq!(seen.last(), Some(&499));
}

#[tokio::test]
async fn test_request_reply_round_trip() {
    let broker = Broker::new();
    let responder = broker.clone();
    broker
        .subscribe_fn(&["math.double"], SubscribeOptions::new(), move |req| {
            let n = req.payload.as_i64().unwrap_or_default();
            responder.reply(req, n * 2);
        })
        .unwrap();

    let reply = broker
        .request(
            "math.double",
            21,
            RequestOptions::new().with_timeout(Duration::from_secs(1)),
        )
        .unwrap()
        .await
        .unwrap();

    assert_eq!(reply.payload.as_i64(), Some(42));
    assert!(reply.correlation_id.is_some());
    assert_eq!(broker.pending_requests(), 0);
    assert_eq!(broker.stats().pending_requests, 0);
}

#[tokio::test]
async fn test_duplicate_replies_are_ignored() {
    let broker = Broker::new();
    let responder = broker.publisher("responder");
    broker
        .subscribe_fn(&["echo"], SubscribeOptions::new(), move |req| {
            responder.reply(req, "first");
            responder.reply(req, "second");
        })
        .unwrap();

    let reply = broker
        .request("echo", 1, RequestOptions::new())
        .unwrap()
        .await
        .unwrap();
    assert_eq!(reply.payload.as_str(), Some("first"));
    assert_eq!(broker.pending_requests(), 0);

    let stats = broker.stats();
    assert_eq!(stats.delivery_failures, 0);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.pending_requests, 0);
    assert_eq!(stats.subscriptions, 1);
}

#[tokio::test]
async fn test_request_times_out() {
    let broker = Broker::new();
    let started = tokio::time::Instant::now();
    let err = broker
        .request(
            "nobody.home",
            1,
            RequestOptions::new().with_timeout(Duration::from_millis(200)),
        )
        .unwrap()
        .await
        .unwrap_err();

    assert!(started.elapsed() >= Duration::from_millis(200));
    match err {
        RequestError::Timeout {
            topic, timeout_ms, ..
        } => {
            assert_eq!(topic, "nobody.home");
            assert_eq!(timeout_ms, 200);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(broker.pending_requests(), 0);
    assert_eq!(broker.stats().subscriptions, 0);
}

#[tokio::test]
async fn test_dropping_a_request_cancels_it() {
    let broker = Broker::new();
    let pending = broker.request("slow", 1, RequestOptions::new()).unwrap();
    assert_eq!(broker.pending_requests(), 1);
    assert_eq!(broker.stats().subscriptions, 1);

    drop(pending);
    assert_eq!(broker.pending_requests(), 0);
    assert_eq!(broker.stats().subscriptions, 0);
}

#[tokio::test]
async fn test_rejected_request_is_not_left_pending() {
    let broker = Broker::new();
    let err = broker
        .request("bad topic", 1, RequestOptions::new())
        .unwrap_err();
    assert!(matches!(err, RequestError::Publish(PublishError::Invalid(_))));
    assert_eq!(broker.pending_requests(), 0);
}

#[test]
fn test_reply_to_a_plain_message_is_rejected() {
    let broker = Broker::new();
    assert_eq!(
        broker.reply(&Message::new("plain", 1), 2),
        PublishStatus::Rejected(PublishError::NotARequest)
    );
}

#[tokio::test]
async fn test_maintenance_expires_overdue_requests() {
    let broker = Broker::new();
    let pending = broker
        .request(
            "slow",
            1,
            RequestOptions::new().with_timeout(Duration::from_millis(10)),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = broker.run_maintenance();
    assert_eq!(report.expired_requests, 1);
    assert!(matches!(pending.await, Err(RequestError::Timeout { .. })));
}

#[tokio::test]
async fn test_maintenance_loop_reclaims_and_stops_with_broker() {
    let broker = broker_with(BrokerSettings {
        cleanup_interval_ms: 20,
        ..BrokerSettings::default()
    });
    let handle = broker.start_maintenance_loop();

    let client = Client::new();
    broker
        .subscribe_fn(&["news.*"], SubscribeOptions::new().owned_by(&client), |_| {})
        .unwrap();
    client.close();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(broker.match_all("news.x").is_empty());

    drop(broker);
    assert!(
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_concurrent_requests_get_their_own_replies() {
    let broker = Broker::new();
    let responder = broker.clone();
    broker
        .subscribe_fn(&["math.square"], SubscribeOptions::new(), move |req| {
            let n = req.payload.as_i64().unwrap_or_default();
            responder.reply(req, n * n);
        })
        .unwrap();

    let requests: Vec<_> = (1..=10i64)
        .map(|n| broker.request("math.square", n, RequestOptions::new()).unwrap())
        .collect();
    let replies = futures::future::join_all(requests).await;

    let squares: Vec<i64> = replies
        .into_iter()
        .map(|r| r.unwrap().payload.as_i64().unwrap())
        .collect();
    assert_eq!(squares, (1..=10).map(|n| n * n).collect::<Vec<i64>>());
    assert_eq!(broker.pending_requests(), 0);
}
