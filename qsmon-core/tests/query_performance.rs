//! Timing laws for the buffer index and the query path. Margins are the
//! contract numbers; they hold comfortably even in debug builds.

mod support;

use std::time::Instant;

use qsmon_core::buffer::TimeIndexedBuffer;
use qsmon_core::config::CacheConfig;
use qsmon_core::model::{CachedEvent, ControlValue, EventQuery};

use support::{batch, full_range_query, test_manager};

fn synthetic_event(seq: u64, ts_ms: u64) -> CachedEvent {
    CachedEvent {
        group_id: "perf".into(),
        control_name: format!("Ctrl{}", seq % 30),
        timestamp_ns: ts_ms * 1_000_000,
        timestamp_ms: ts_ms,
        value: ControlValue::Float(seq as f64),
        string_repr: seq.to_string(),
        previous_value: None,
        previous_string: None,
        delta: None,
        duration_ms: None,
        sequence_number: seq,
        event_type: None,
        compressed: false,
    }
}

#[test]
fn indexed_range_query_on_100k_buffer_is_fast() {
    let mut buffer = TimeIndexedBuffer::new(100_000, u64::MAX);
    for i in 0..100_000u64 {
        buffer.add(synthetic_event(i, i));
    }

    // 100-event window out of 100k.
    let started = Instant::now();
    let hits: Vec<&CachedEvent> = buffer.query_time_range(50_000_000_000, 50_099_000_000).collect();
    let elapsed = started.elapsed();

    assert_eq!(hits.len(), 100);
    assert!(
        elapsed.as_millis() < 10,
        "range query took {elapsed:?}, expected < 10ms"
    );
}

#[tokio::test]
async fn ten_thousand_event_query_completes_under_100ms() {
    let manager = test_manager(CacheConfig::default());
    for i in 0..100_000u64 {
        manager
            .ingest_batch(&batch(
                "perf",
                1_000 + i,
                vec![("Ctrl", ControlValue::Float(i as f64))],
            ))
            .unwrap();
    }

    let query = EventQuery {
        group_id: Some("perf".into()),
        start_time_ms: Some(1_000),
        end_time_ms: Some(10_999),
        limit: Some(10_000),
        ..Default::default()
    };

    let started = Instant::now();
    let response = manager.query(&query).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.events.len(), 10_000);
    assert!(
        elapsed.as_millis() < 100,
        "10k-event query took {elapsed:?}, expected < 100ms"
    );
}

#[tokio::test]
async fn cache_hit_returns_under_one_millisecond() {
    let manager = test_manager(CacheConfig::default());
    for i in 0..100u64 {
        manager
            .ingest_batch(&batch(
                "perf",
                1_000 + i,
                vec![("Ctrl", ControlValue::Float(i as f64))],
            ))
            .unwrap();
    }

    let query = full_range_query("perf");
    manager.query(&query).await.unwrap();

    let started = Instant::now();
    let response = manager.query(&query).await.unwrap();
    let elapsed = started.elapsed();

    assert!(response.from_cache);
    assert!(
        elapsed.as_micros() < 1_000,
        "cache hit took {elapsed:?}, expected < 1ms"
    );
}

#[tokio::test]
async fn sustained_poll_rate_is_stored_without_loss() {
    // 33 Hz x 30 controls for 60 simulated seconds: 1980 batches of 30.
    let manager = test_manager(CacheConfig::default());
    let controls: Vec<String> = (0..30).map(|i| format!("Ctrl{i}")).collect();

    let mut expected = 0usize;
    for tick in 0..1_980u64 {
        let ts_ms = 1_000 + tick * 30;
        let changes: Vec<(&str, ControlValue)> = controls
            .iter()
            .map(|name| (name.as_str(), ControlValue::Float(tick as f64)))
            .collect();
        expected += changes.len();
        manager.ingest_batch(&batch("poll", ts_ms, changes)).unwrap();
    }

    assert_eq!(expected, 59_400);
    let stats = manager.group_stats("poll").unwrap();
    assert_eq!(stats.buffered_events, 59_400);
    assert_eq!(stats.events_ingested, 59_400);

    let totals = manager.statistics().await;
    assert_eq!(totals.total_events_ingested, 59_400);
}
