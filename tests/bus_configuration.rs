//! ---
//! atelier_section: "15-testing-qa"
//! atelier_subsection: "integration-tests"
//! atelier_type: "source"
//! atelier_scope: "code"
//! atelier_description: "Configuration to adapter selection to delivery."
//! atelier_version: "v0.1.0"
//! atelier_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use atelier_common::config::{AdapterMode, AppConfig};
use atelier_pubsub::channels::canvas_channel;
use atelier_pubsub::{
    connect_adapter, connect_adapter_with_broker, handler, InMemoryBroker, PubSubAdapter,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn read(path: &str) -> String {
    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let full = Path::new(manifest_dir).join("..").join(path);
    fs::read_to_string(&full)
        .unwrap_or_else(|err| panic!("failed to read {}: {}", full.display(), err))
}

#[test]
fn reference_configuration_is_valid() {
    let config = AppConfig::from_str(&read("configs/atelier.example.toml"))
        .expect("reference configuration parses");
    assert_eq!(config.pubsub.mode, AdapterMode::Distributed);
    assert!(config.pubsub.url.is_some());
    assert_eq!(config.pubsub.namespace, "atelier:");
}

#[tokio::test]
async fn empty_configuration_runs_locally() {
    let config = AppConfig::from_str("").unwrap();
    let adapter = connect_adapter(&config.pubsub).await.unwrap();
    assert_eq!(adapter.name(), "local");

    let (tx, mut rx) = mpsc::unbounded_channel();
    adapter
        .subscribe(
            &canvas_channel("board"),
            handler(move |envelope| {
                let _ = tx.send(envelope);
                Ok(())
            }),
        )
        .await
        .unwrap();
    adapter
        .publish(&canvas_channel("board"), json!({"stroke": 1}), None)
        .await
        .unwrap();

    // Local delivery completes inside publish.
    let envelope = rx.try_recv().expect("delivered synchronously");
    assert_eq!(envelope.sender_id, adapter.instance_id());
    adapter.close().await.unwrap();
}

#[tokio::test]
async fn distributed_configuration_shares_a_broker_across_instances() {
    let mut config = AppConfig::from_str("").unwrap();
    config
        .apply_overrides(|key| match key {
            AppConfig::ENV_PUBSUB_MODE => Some("distributed".to_owned()),
            AppConfig::ENV_PUBSUB_URL => Some("redis://unused:6379".to_owned()),
            AppConfig::ENV_PUBSUB_NAMESPACE => Some("it:".to_owned()),
            _ => None,
        })
        .unwrap();

    let broker = InMemoryBroker::new();
    let a = connect_adapter_with_broker(&config.pubsub, Arc::new(broker.clone()))
        .await
        .unwrap();
    let b = connect_adapter_with_broker(&config.pubsub, Arc::new(broker.clone()))
        .await
        .unwrap();
    assert_eq!(broker.subscriber_connections(), 2);

    let (tx, mut rx) = mpsc::unbounded_channel();
    a.subscribe(
        &canvas_channel("board"),
        handler(move |envelope| {
            let _ = tx.send(envelope);
            Ok(())
        }),
    )
    .await
    .unwrap();
    b.publish(&canvas_channel("board"), json!({"stroke": 2}), None)
        .await
        .unwrap();

    let envelope = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("delivery within window")
        .expect("channel open");
    assert_eq!(envelope.channel, "canvas:board");
    assert_eq!(envelope.sender_id, b.instance_id());

    a.close().await.unwrap();
    b.close().await.unwrap();
    assert_eq!(broker.subscriber_connections(), 0);
}
