//! Streaming query manager integration tests.

mod common;

use std::time::{Duration, Instant};

use chrono::Utc;
use sensorium::{
    Aggregation, LiveFilter, LiveHub, Point, QuerySpec, StorageHandles, StreamError,
    StreamOptions, StreamingQueryManager, TimeRange,
};

fn spec(measurement: &str) -> QuerySpec {
    QuerySpec::new([measurement], TimeRange::LastHour, Aggregation::Average)
}

async fn seed(storage: &StorageHandles) {
    let at = Utc::now() - chrono::Duration::minutes(10);
    storage
        .facade
        .write_points(&[
            Point::new("a").with_field("v", 1.0).at(at),
            Point::new("b").with_field("v", 2.0).at(at),
        ])
        .await
        .unwrap();
}

fn manager(storage: &StorageHandles, hub: &LiveHub, options: StreamOptions) -> StreamingQueryManager {
    StreamingQueryManager::new(storage.facade.clone(), hub.clone(), options)
}

fn fast() -> StreamOptions {
    StreamOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_stop_timeout(Duration::from_secs(2))
}

#[tokio::test]
async fn test_concurrent_starts_leave_one_loop() {
    let storage = common::memory_storage().await;
    seed(&storage).await;
    let hub = LiveHub::new(64);
    let manager = manager(&storage, &hub, fast());

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let manager = manager.clone();
            let measurement = if i % 2 == 0 { "a" } else { "b" };
            tokio::spawn(async move { manager.start("s1", spec(measurement)).await.unwrap() })
        })
        .collect();

    let mut fresh = 0;
    let mut run_ids = Vec::new();
    for task in tasks {
        let outcome = task.await.unwrap();
        assert!(outcome.accepted);
        if !outcome.replaced {
            fresh += 1;
        }
        run_ids.push(outcome.run_id);
    }

    assert_eq!(fresh, 1);
    assert_eq!(manager.active_count().await, 1);
    let survivor = manager.lookup("s1").await.unwrap();
    assert!(run_ids.contains(&survivor.run_id));

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_superseded_loop_publishes_nothing_after_replacement() {
    let storage = common::memory_storage().await;
    seed(&storage).await;
    let hub = LiveHub::new(64);
    let manager = manager(&storage, &hub, fast());

    manager.start("s1", spec("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    manager.start("s1", spec("b")).await.unwrap();

    let mut rx = hub.subscribe(LiveFilter::section("s1"));
    for _ in 0..3 {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let rows = msg.payload.as_array().unwrap();
        assert!(!rows.is_empty());
        assert!(rows.iter().all(|row| row["measurement"] == "b"));
    }

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sections_are_independent() {
    let storage = common::memory_storage().await;
    seed(&storage).await;
    let hub = LiveHub::new(64);
    let manager = manager(&storage, &hub, fast());

    manager.start("s1", spec("a")).await.unwrap();
    manager.start("s2", spec("b")).await.unwrap();
    assert!(manager.stop("s1").await.unwrap());

    let mut rx = hub.subscribe(LiveFilter::section("s2"));
    let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(msg.channel.event_name(), "dataUpdate_s2");
    assert_eq!(manager.active_count().await, 1);

    manager.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_interrupts_long_interval() {
    let storage = common::memory_storage().await;
    let hub = LiveHub::new(64);
    let manager = manager(
        &storage,
        &hub,
        StreamOptions::default().with_interval(Duration::from_secs(30)),
    );

    manager.start("s1", spec("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    assert!(manager.stop("s1").await.unwrap());
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_read_failures_do_not_end_loop() {
    let (store, storage) = common::controlled_storage().await;
    let hub = LiveHub::new(64);
    let manager = manager(&storage, &hub, fast());
    store.fail_reads(true);

    manager.start("s1", spec("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(450)).await;

    let info = manager.lookup("s1").await.unwrap();
    assert!(info.failed_ticks >= 2, "failed ticks: {}", info.failed_ticks);
    assert_eq!(info.published, 0);

    store.fail_reads(false);
    seed(&storage).await;
    let mut rx = hub.subscribe(LiveFilter::section("s1"));
    assert!(
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .is_some()
    );

    manager.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unresponsive_loop_reports_lifecycle_timeout() {
    let (store, storage) = common::controlled_storage().await;
    let hub = LiveHub::new(64);
    let manager = manager(
        &storage,
        &hub,
        fast().with_stop_timeout(Duration::from_millis(200)),
    );

    store.stall_next_read(Duration::from_millis(1500));
    manager.start("s1", spec("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    match manager.stop("s1").await {
        Err(StreamError::LifecycleTimeout { section_id, waited }) => {
            assert_eq!(section_id, "s1");
            assert_eq!(waited, Duration::from_millis(200));
        }
        other => panic!("expected lifecycle timeout, got {other:?}"),
    }
    assert_eq!(manager.active_count().await, 0);

    manager.start("s1", spec("a")).await.unwrap();
    assert_eq!(manager.active_count().await, 1);
    manager.shutdown().await.unwrap();
}
