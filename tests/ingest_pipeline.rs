//! Ingestion pipeline integration tests over the in-process broker.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use sensorium::{
    ConnectionState, Endpoint, FieldValue, IngestError, IngestionPipeline, LiveFilter, LiveHub,
    LocalBroker, PipelineOptions, StorageHandles, SubscriptionChange,
};

const TOPIC: &str = "Chicago/home_001/weather";
const PAYLOAD: &str = r#"{"fields": {"timestamp": 1700000000, "temperature": 21.5, "humidity": 40},
                          "tags": {"home_id": "home_001"}}"#;

struct Harness {
    broker: LocalBroker,
    hub: LiveHub,
    pipeline: IngestionPipeline,
    storage: StorageHandles,
}

async fn harness() -> Harness {
    harness_with(common::memory_storage().await)
}

fn harness_with(storage: StorageHandles) -> Harness {
    let broker = LocalBroker::new();
    let hub = LiveHub::new(64);
    let pipeline = IngestionPipeline::new(
        Arc::new(broker.clone()),
        storage.writer.clone(),
        hub.clone(),
        PipelineOptions::default(),
    );
    Harness {
        broker,
        hub,
        pipeline,
        storage,
    }
}

fn endpoint() -> Endpoint {
    Endpoint::new("broker.local", 1883)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_connect_fails_when_broker_unreachable() {
    let h = harness().await;
    h.broker.set_available(false);

    let err = h.pipeline.connect(&endpoint()).await.err().unwrap();
    assert!(matches!(err, IngestError::Connectivity { .. }));
    assert!(!h.pipeline.is_connected());
    assert!(matches!(
        h.pipeline.subscribe(TOPIC).await,
        Err(IngestError::NotConnected)
    ));
}

#[tokio::test]
async fn test_subscribe_twice_keeps_one_entry() {
    let h = harness().await;
    let conn = h.pipeline.connect(&endpoint()).await.unwrap();

    assert_eq!(conn.subscribe(TOPIC).await.unwrap(), SubscriptionChange::Applied);
    assert_eq!(
        conn.subscribe(TOPIC).await.unwrap(),
        SubscriptionChange::Unchanged
    );
    assert_eq!(h.pipeline.list_subscriptions().await, vec![TOPIC]);

    assert_eq!(
        conn.unsubscribe("never/subscribed").await.unwrap(),
        SubscriptionChange::Unchanged
    );
}

#[tokio::test]
async fn test_concurrent_subscribes_apply_once() {
    let h = harness().await;
    h.pipeline.connect(&endpoint()).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = h.pipeline.clone();
            tokio::spawn(async move { pipeline.subscribe(TOPIC).await.unwrap() })
        })
        .collect();

    let mut applied = 0;
    for task in tasks {
        if task.await.unwrap().is_changed() {
            applied += 1;
        }
    }
    assert_eq!(applied, 1);
    assert_eq!(h.pipeline.list_subscriptions().await.len(), 1);
}

#[tokio::test]
async fn test_published_message_reaches_store_and_hub() {
    let h = harness().await;
    let conn = h.pipeline.connect(&endpoint()).await.unwrap();
    conn.subscribe(TOPIC).await.unwrap();
    let mut rx = h.hub.subscribe(LiveFilter::topic(TOPIC));

    assert_eq!(h.broker.publish(TOPIC, PAYLOAD), 1);

    let mut live_fields = Vec::new();
    for _ in 0..2 {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.payload["measurement"], TOPIC);
        assert_eq!(msg.payload["tags"]["home_id"], "home_001");
        if let Some(humidity) = msg.payload["fields"].get("humidity") {
            assert!(humidity.is_i64(), "integer field widened: {humidity}");
        }
        live_fields.extend(msg.payload["fields"].as_object().unwrap().keys().cloned());
    }
    live_fields.sort();
    assert_eq!(live_fields, vec!["humidity", "temperature"]);

    h.storage.writer.flush().await.unwrap();
    let stored = h
        .storage
        .facade
        .scan(TOPIC, DateTime::UNIX_EPOCH)
        .await
        .unwrap();
    assert_eq!(stored.len(), 2);

    let expected_ts = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    assert!(stored.iter().all(|p| p.timestamp == expected_ts));
    assert!(stored.iter().all(|p| p.tags.get("home_id").map(String::as_str) == Some("home_001")));
    let temperature = stored
        .iter()
        .find_map(|p| p.fields.get("temperature"))
        .unwrap();
    assert_eq!(temperature, &FieldValue::Number(21.5));
    let humidity = stored
        .iter()
        .find_map(|p| p.fields.get("humidity"))
        .unwrap();
    assert_eq!(humidity, &FieldValue::Integer(40));
}

#[tokio::test]
async fn test_store_failure_still_reaches_hub() {
    let (store, storage) = common::controlled_storage().await;
    store.fail_writes(true);
    let h = harness_with(storage);
    let conn = h.pipeline.connect(&endpoint()).await.unwrap();
    conn.subscribe(TOPIC).await.unwrap();
    let mut rx = h.hub.subscribe(LiveFilter::topic(TOPIC));

    assert_eq!(h.broker.publish(TOPIC, PAYLOAD), 1);

    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload["measurement"], TOPIC);

    h.storage.writer.flush().await.unwrap();
    assert!(h.storage.writer.stats().failed >= 1);
    assert_eq!(h.storage.writer.stats().written, 0);
}

#[tokio::test]
async fn test_malformed_payload_is_dropped() {
    let h = harness().await;
    let conn = h.pipeline.connect(&endpoint()).await.unwrap();
    conn.subscribe(TOPIC).await.unwrap();
    let mut rx = h.hub.subscribe(LiveFilter::topic(TOPIC));

    h.broker.publish(TOPIC, "definitely not json");
    h.broker.publish(TOPIC, r#"{"fields": {"temperature": 19}}"#);

    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.payload["fields"]["temperature"], 19);

    assert!(h.pipeline.is_connected());
    assert_eq!(h.pipeline.list_subscriptions().await, vec![TOPIC]);
    let stats = h.pipeline.stats();
    assert_eq!(stats.messages, 2);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.readings, 1);
}

#[tokio::test]
async fn test_transport_drop_is_observable_and_reconnect_restores_topics() {
    let h = harness().await;
    let conn = h.pipeline.connect(&endpoint()).await.unwrap();
    conn.subscribe(TOPIC).await.unwrap();

    h.broker.drop_connections("network unreachable");
    let pipeline = h.pipeline.clone();
    wait_until(move || !pipeline.is_connected()).await;

    assert_eq!(h.pipeline.state(), ConnectionState::Disconnected);
    assert_eq!(h.pipeline.list_subscriptions().await, vec![TOPIC]);
    assert_eq!(h.pipeline.stats().transport_drops, 1);
    assert!(matches!(
        h.pipeline.subscribe("other/topic").await,
        Err(IngestError::NotConnected)
    ));

    h.pipeline.connect(&endpoint()).await.unwrap();
    assert!(h.broker.active_filters().contains(TOPIC));

    let mut rx = h.hub.subscribe(LiveFilter::topic(TOPIC));
    assert_eq!(h.broker.publish(TOPIC, PAYLOAD), 1);
    assert!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn test_disconnect_clears_and_is_idempotent() {
    let h = harness().await;
    let conn = h.pipeline.connect(&endpoint()).await.unwrap();
    conn.subscribe(TOPIC).await.unwrap();
    conn.subscribe("Chicago/home_002/energy").await.unwrap();

    conn.disconnect().await;
    assert!(!conn.is_connected());
    assert!(h.pipeline.list_subscriptions().await.is_empty());
    assert_eq!(h.broker.session_count(), 0);

    h.pipeline.disconnect().await;
    assert_eq!(h.pipeline.state(), ConnectionState::Disconnected);
    assert!(h.pipeline.endpoint().await.is_none());

    h.pipeline.connect(&endpoint()).await.unwrap();
    assert!(h.broker.active_filters().is_empty());
}
