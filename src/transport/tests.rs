use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{DeliveryError, MessageQueue, Transport, TransportAdapter};
use crate::broker::message::Message;
use crate::broker::registry::SubscriptionId;

fn msg(topic: &str) -> Arc<Message> {
    Arc::new(Message::new(topic, "hello"))
}

#[test]
fn test_callback_transport_invokes_handler() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let transport = Transport::callback(move |m| {
        assert_eq!(m.topic, "a.b");
        seen.fetch_add(1, Ordering::SeqCst);
    });

    transport.deliver(SubscriptionId(1), &msg("a.b")).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(transport.is_alive());
}

#[test]
fn test_fallible_callback_reports_errors() {
    let transport = Transport::fallible(|_| Err(DeliveryError::Handler("nope".into())));
    assert_eq!(
        transport.deliver(SubscriptionId(1), &msg("a")),
        Err(DeliveryError::Handler("nope".into()))
    );
}

#[test]
fn test_channel_transport_liveness_follows_receiver() {
    let (transport, mut rx) = Transport::channel();
    transport.deliver(SubscriptionId(7), &msg("t")).unwrap();
    assert_eq!(rx.try_recv().unwrap().topic, "t");
    assert!(transport.is_alive());

    // Drop the receiver to close the channel
    drop(rx);
    assert!(!transport.is_alive());
    assert_eq!(
        transport.deliver(SubscriptionId(7), &msg("t")),
        Err(DeliveryError::Closed)
    );
}

#[test]
fn test_queue_transport_is_bounded() {
    let (transport, queue) = Transport::queue(2);
    transport.deliver(SubscriptionId(1), &msg("1")).unwrap();
    transport.deliver(SubscriptionId(1), &msg("2")).unwrap();
    assert_eq!(
        transport.deliver(SubscriptionId(1), &msg("3")),
        Err(DeliveryError::QueueFull { capacity: 2 })
    );

    assert_eq!(queue.try_pop().unwrap().topic, "1");
    assert_eq!(queue.drain().len(), 1);
    assert!(queue.is_empty());

    queue.close();
    assert!(!transport.is_alive());
}

#[test]
fn test_custom_adapter_is_consulted() {
    struct Counting(AtomicUsize);

    impl TransportAdapter for Counting {
        fn deliver(&self, _: SubscriptionId, _: &Arc<Message>) -> Result<(), DeliveryError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn is_alive(&self) -> bool {
            false
        }
    }

    let transport = Transport::custom(Counting(AtomicUsize::new(0)));
    assert!(transport.deliver(SubscriptionId(3), &msg("x")).is_ok());
    assert!(!transport.is_alive());
}

#[tokio::test]
async fn test_queue_recv_waits_for_push() {
    let queue = MessageQueue::new(4);
    let producer = queue.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        producer.push(msg("late")).unwrap();
    });

    let received = queue.recv().await.unwrap();
    assert_eq!(received.topic, "late");

    queue.close();
    assert!(queue.recv().await.is_none());
}
