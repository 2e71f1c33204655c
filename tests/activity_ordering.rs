//! Storage-key ordering and retention behavior of the activity log.

use chrono::{Duration as ChronoDuration, Utc};
use mcpproxy::activity::{ActivityFilter, ActivityRecorder, InvocationRecord, RecorderSettings};
use mcpproxy::bus::EventBus;
use mcpproxy::store::{BUCKET_ACTIVITY, DB_FILE, Store};
use std::sync::Arc;
use std::time::Duration;

fn recorder(store: Arc<Store>) -> ActivityRecorder {
    ActivityRecorder::new(
        store,
        EventBus::new(),
        RecorderSettings {
            max_response_size: 4096,
            retention_days: 30,
            max_records: 100,
            cleanup_interval: Duration::from_secs(3600),
            queue_capacity: 256,
        },
    )
}

#[tokio::test]
async fn storage_order_is_chronological() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
    let recorder = recorder(store.clone());

    let base = Utc::now();
    // insert out of order; storage must sort by (timestamp, id)
    for offset in [5i64, 1, 4, 2, 3] {
        let mut record = InvocationRecord::tool_call("s", "t", String::new());
        record.timestamp = base + ChronoDuration::milliseconds(offset);
        record.response_text = format!("m{}", offset);
        recorder.record(record);
    }
    recorder.flush();

    let keys: Vec<String> = store
        .range(BUCKET_ACTIVITY, "")
        .unwrap()
        .into_iter()
        .map(|(key, _)| key)
        .collect();
    let mut sorted = keys.clone();
    sorted.sort();
    assert_eq!(keys, sorted, "bucket iteration must already be sorted");

    let (page, _) = recorder.list(&ActivityFilter::default(), 10, 0).unwrap();
    let texts: Vec<_> = page.iter().map(|r| r.response_text.as_str()).collect();
    assert_eq!(texts, vec!["m5", "m4", "m3", "m2", "m1"]);
}

#[tokio::test]
async fn records_are_immutable_in_storage() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
    let recorder = recorder(store.clone());

    let record = InvocationRecord::tool_call("s", "t", "{\"x\":1}".into());
    let id = record.id.clone();
    recorder.record(record);
    recorder.flush();

    let (page, total) = recorder.list(&ActivityFilter::default(), 10, 0).unwrap();
    assert_eq!(total, 1);
    assert_eq!(page[0].id, id);
    assert_eq!(page[0].arguments_json, "{\"x\":1}");
}

#[tokio::test]
async fn stream_cancellation_stops_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path().join(DB_FILE)).unwrap());
    let recorder = recorder(store);
    for _ in 0..10 {
        recorder.record(InvocationRecord::tool_call("s", "t", String::new()));
    }
    recorder.flush();

    let mut rx = recorder.stream(ActivityFilter::default());
    let first = rx.recv().await;
    assert!(first.is_some());
    drop(rx); // caller walks away; the producer task must not wedge anything

    let (_, total) = recorder.list(&ActivityFilter::default(), 100, 0).unwrap();
    assert_eq!(total, 10);
}
