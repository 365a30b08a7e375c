#![allow(dead_code)]

use std::sync::Once;

use qsmon_core::config::{CacheConfig, Environment};
use qsmon_core::manager::EventCacheManager;
use qsmon_core::model::{
    CacheNotification, ChangeBatch, ControlChange, ControlValue, EventQuery,
};
use tokio::sync::broadcast;

static TRACING: Once = Once::new();

/// Honor `RUST_LOG` when debugging a test run.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Build a manager under the test environment so fixture configs with tiny
/// limits are accepted.
pub fn test_manager(mut config: CacheConfig) -> EventCacheManager {
    init_tracing();
    config.skip_validation = true;
    EventCacheManager::new_with_environment(config, Environment::Test)
        .expect("test manager construction")
}

pub fn batch(
    group_id: &str,
    timestamp_ms: u64,
    changes: Vec<(&str, ControlValue)>,
) -> ChangeBatch {
    ChangeBatch {
        group_id: group_id.to_string(),
        changes: changes
            .into_iter()
            .map(|(name, value)| ControlChange {
                name: name.to_string(),
                value,
                string_repr: None,
            })
            .collect(),
        timestamp_ns: timestamp_ms * 1_000_000,
        timestamp_ms,
        sequence_number: 0,
    }
}

/// Drain everything currently buffered on a notification receiver,
/// tolerating lag from high-volume ingest runs.
pub fn drain_notifications(
    rx: &mut broadcast::Receiver<CacheNotification>,
) -> Vec<CacheNotification> {
    let mut drained = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(notification) => drained.push(notification),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    drained
}

/// Query covering every event ever stored for a group.
pub fn full_range_query(group_id: &str) -> EventQuery {
    EventQuery {
        group_id: Some(group_id.to_string()),
        start_time_ms: Some(0),
        end_time_ms: Some(u64::MAX / 2),
        limit: Some(10_000),
        ..Default::default()
    }
}
