//! Write actor behaviour against a misbehaving store.

mod common;

use std::time::{Duration, Instant};

use sensorium::Point;

#[tokio::test]
async fn test_stalled_store_fails_batch_once() {
    let (store, storage) = common::controlled_storage_with(|b| {
        b.write_timeout(Duration::from_millis(100))
            .batch_size(100)
            .batch_flush_interval(Duration::from_secs(30))
    })
    .await;
    store.stall_writes(Some(Duration::from_secs(5)));

    for i in 0..20 {
        storage
            .writer
            .submit(Point::new("t1").with_field("v", f64::from(i)))
            .unwrap();
    }

    let started = Instant::now();
    storage.writer.flush().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    assert_eq!(store.write_calls(), 1);
    let stats = storage.writer.stats();
    assert_eq!(stats.failed, 20);
    assert_eq!(stats.written, 0);

    // The actor keeps working once the store recovers.
    store.stall_writes(None);
    storage.writer.submit(Point::new("t1").with_field("v", 1.0)).unwrap();
    storage.writer.flush().await.unwrap();
    assert_eq!(storage.writer.stats().written, 1);
    assert_eq!(store.write_calls(), 2);
}

#[tokio::test]
async fn test_rejected_batch_is_retried_point_by_point() {
    let (store, storage) = common::controlled_storage_with(|b| {
        b.batch_size(100)
            .batch_flush_interval(Duration::from_secs(30))
    })
    .await;
    store.fail_writes(true);

    for i in 0..3 {
        storage
            .writer
            .submit(Point::new("t1").with_field("v", f64::from(i)))
            .unwrap();
    }
    storage.writer.flush().await.unwrap();

    // One batch attempt plus one per point.
    assert_eq!(store.write_calls(), 4);
    assert_eq!(storage.writer.stats().failed, 3);
}
