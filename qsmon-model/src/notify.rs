use serde::{Deserialize, Serialize};

/// Severity of a memory-pressure crossing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    High,
    Critical,
}

/// Notifications fanned out by the cache to in-process observers.
///
/// Consumers subscribe through the core's event bus; payload field names are
/// part of the wire contract with the tool layer and the audit logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CacheNotification {
    #[serde(rename_all = "snake_case")]
    EventsStored {
        group_id: String,
        count: usize,
        total_events: usize,
    },
    #[serde(rename_all = "snake_case")]
    GroupCleared { group_id: String },
    #[serde(rename_all = "snake_case")]
    MemoryPressure { level: PressureLevel, percent: f64 },
    #[serde(rename_all = "snake_case")]
    Compression {
        group_id: String,
        before: usize,
        after: usize,
        bytes_reclaimed: usize,
    },
    #[serde(rename_all = "snake_case")]
    DiskSpillover {
        group_id: String,
        event_count: usize,
        file_path: String,
    },
    #[serde(rename_all = "snake_case")]
    Error {
        message: String,
        context: String,
        timestamp_ms: u64,
    },
}

impl CacheNotification {
    /// Group this notification concerns, when scoped to one.
    pub fn group_id(&self) -> Option<&str> {
        match self {
            CacheNotification::EventsStored { group_id, .. }
            | CacheNotification::GroupCleared { group_id }
            | CacheNotification::Compression { group_id, .. }
            | CacheNotification::DiskSpillover { group_id, .. } => Some(group_id),
            _ => None,
        }
    }
}
