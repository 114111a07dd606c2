//! ---
//! atelier_section: "02-realtime-messaging"
//! atelier_subsection: "tests"
//! atelier_type: "source"
//! atelier_scope: "test"
//! atelier_description: "Cross-instance scenarios for the pub/sub adapters."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use atelier_pubsub::channels::{
    all_users_pattern, broadcast_channel, canvas_channel, system_events_channel, user_channel,
};
use atelier_pubsub::{
    handler, DistributedAdapter, Envelope, InMemoryBroker, LocalAdapter, MessageHandler,
    PubSubAdapter, SharedAdapter,
};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

const WINDOW: Duration = Duration::from_secs(2);

fn forward(tx: UnboundedSender<Envelope>) -> MessageHandler {
    handler(move |envelope| {
        let _ = tx.send(envelope);
        Ok(())
    })
}

async fn instance(broker: &InMemoryBroker) -> Arc<DistributedAdapter> {
    let adapter = DistributedAdapter::new(Arc::new(broker.clone()), "atelier:");
    adapter.connect().await.expect("connect");
    Arc::new(adapter)
}

async fn next(rx: &mut UnboundedReceiver<Envelope>) -> Envelope {
    timeout(WINDOW, rx.recv())
        .await
        .expect("delivery within window")
        .expect("channel open")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn message_published_on_one_instance_reaches_the_other() {
    let broker = InMemoryBroker::new();
    let a = instance(&broker).await;
    let b = instance(&broker).await;
    assert_ne!(a.instance_id(), b.instance_id());

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.subscribe(&user_channel("42"), forward(tx)).await.unwrap();
    b.publish(&user_channel("42"), json!({"greeting": "hi"}), None)
        .await
        .unwrap();

    let envelope = next(&mut rx).await;
    assert_eq!(envelope.channel, "user:42");
    assert_eq!(envelope.payload, json!({"greeting": "hi"}));
    assert_eq!(envelope.sender_id, b.instance_id());
    assert!(envelope.timestamp > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn publisher_does_not_hear_itself_but_peers_do() {
    let broker = InMemoryBroker::new();
    let a = instance(&broker).await;
    let b = instance(&broker).await;
    let closer = instance(&broker).await;

    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    a.subscribe(&broadcast_channel(), forward(a_tx)).await.unwrap();
    b.subscribe(&broadcast_channel(), forward(b_tx)).await.unwrap();

    a.publish(&broadcast_channel(), json!("from a"), None)
        .await
        .unwrap();
    b.publish(&broadcast_channel(), json!("from b"), None)
        .await
        .unwrap();
    // Published last, so each instance sees it after any echo of its own.
    closer
        .publish(&broadcast_channel(), json!("end"), None)
        .await
        .unwrap();

    assert_eq!(next(&mut a_rx).await.payload, json!("from b"));
    assert_eq!(next(&mut a_rx).await.payload, json!("end"));
    assert_eq!(next(&mut b_rx).await.payload, json!("from a"));
    assert_eq!(next(&mut b_rx).await.payload, json!("end"));
    assert!(a_rx.try_recv().is_err());
    assert!(b_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pattern_subscription_spans_instances() {
    let broker = InMemoryBroker::new();
    let listener = instance(&broker).await;
    let producer = instance(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    listener
        .pattern_subscribe(&all_users_pattern(), forward(tx))
        .await
        .unwrap();

    producer
        .publish(&canvas_channel("c1"), json!("ignored"), None)
        .await
        .unwrap();
    producer
        .publish(&user_channel("7"), json!("seen"), None)
        .await
        .unwrap();

    let envelope = next(&mut rx).await;
    assert_eq!(envelope.channel, "user:7");
    assert_eq!(envelope.payload, json!("seen"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_handler_does_not_stop_later_deliveries() {
    let broker = InMemoryBroker::new();
    let listener = instance(&broker).await;
    let producer = instance(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    listener
        .subscribe(
            &system_events_channel(),
            handler(move |envelope| {
                if envelope.payload == json!("explode") {
                    panic!("consumer bug");
                }
                let _ = tx.send(envelope);
                Ok(())
            }),
        )
        .await
        .unwrap();

    producer
        .publish(&system_events_channel(), json!("explode"), None)
        .await
        .unwrap();
    producer
        .publish(&system_events_channel(), json!("after"), None)
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await.payload, json!("after"));
    assert!(listener.is_ready());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsubscribed_instance_stops_receiving() {
    let broker = InMemoryBroker::new();
    let listener = instance(&broker).await;
    let producer = instance(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    listener.subscribe("c", forward(tx.clone())).await.unwrap();
    listener.subscribe("sentinel", forward(tx)).await.unwrap();
    listener.unsubscribe("c").await.unwrap();

    producer.publish("c", json!("dropped"), None).await.unwrap();
    producer
        .publish("sentinel", json!("done"), None)
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await.channel, "sentinel");
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn consumers_are_indifferent_to_the_adapter_kind() {
    async fn exercise(adapter: SharedAdapter) -> Envelope {
        let (tx, mut rx) = mpsc::unbounded_channel();
        adapter
            .subscribe(&canvas_channel("doc"), forward(tx))
            .await
            .unwrap();
        adapter
            .publish(&canvas_channel("doc"), json!({"op": "insert"}), Some("editor"))
            .await
            .unwrap();
        let envelope = next(&mut rx).await;
        adapter.close().await.unwrap();
        assert!(!adapter.is_ready());
        envelope
    }

    let local = exercise(Arc::new(LocalAdapter::new())).await;
    assert_eq!(local.sender_id, "editor");

    let broker = InMemoryBroker::new();
    let distributed = exercise(instance(&broker).await).await;
    assert_eq!(distributed.sender_id, "editor");
    assert_eq!(distributed.payload, local.payload);
    assert_eq!(distributed.channel, local.channel);
}
