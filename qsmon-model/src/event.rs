use serde::{Deserialize, Serialize};

use crate::value::ControlValue;

/// Classification assigned to an event at ingest, immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Change,
    StateTransition,
    SignificantChange,
    ThresholdCrossed,
}

/// A single control observation as stored by the cache.
///
/// Immutable once stored; compression may only flip the `compressed` marker
/// when an event is promoted through a retention tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEvent {
    pub group_id: String,
    pub control_name: String,
    /// Monotonic nanoseconds, authoritative for ordering and indexing.
    /// Rendered as a decimal string on the wire so 64-bit precision
    /// survives JSON consumers that parse numbers as doubles.
    #[serde(with = "ns_string")]
    pub timestamp_ns: u64,
    /// Wall-clock milliseconds, exposed to user queries and windowing.
    pub timestamp_ms: u64,
    pub value: ControlValue,
    pub string_repr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<ControlValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_string: Option<String>,
    /// `value - previous_value`, defined only when both are numeric.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    /// Wall-clock ms since the previous change of this control.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub sequence_number: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub compressed: bool,
}

/// Baseline per-event heap footprint before string payloads.
const EVENT_BASE_BYTES: usize = 200;

/// String bytes below this length are assumed covered by the baseline.
const INLINE_STRING_ALLOWANCE: usize = 32;

impl CachedEvent {
    /// Approximate resident size of this event, used for the global memory
    /// budget. Deterministic so the budget can be re-derived in tests.
    pub fn estimated_size(&self) -> usize {
        let mut size = EVENT_BASE_BYTES;
        for s in [&self.group_id, &self.control_name, &self.string_repr] {
            size += s.len().saturating_sub(INLINE_STRING_ALLOWANCE);
        }
        if let Some(prev) = &self.previous_string {
            size += prev.len().saturating_sub(INLINE_STRING_ALLOWANCE);
        }
        if let ControlValue::String(s) = &self.value {
            size += s.len().saturating_sub(INLINE_STRING_ALLOWANCE);
        }
        size
    }
}

/// One changed control inside a polled batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlChange {
    pub name: String,
    pub value: ControlValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub string_repr: Option<String>,
}

/// A polled change-group batch as delivered by the upstream adapter.
///
/// All changes in a batch share the capture timestamps; the producer
/// guarantees per-group time order but its sequence numbers are advisory
/// and re-keyed at ingest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub group_id: String,
    pub changes: Vec<ControlChange>,
    #[serde(with = "ns_string")]
    pub timestamp_ns: u64,
    pub timestamp_ms: u64,
    pub sequence_number: u64,
}

/// Serialize a `u64` nanosecond timestamp as a decimal string, accepting
/// either shape on the way back in.
pub mod ns_string {
    use serde::de;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ns: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(ns)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(ns) => Ok(ns),
            Raw::Str(s) => s.parse::<u64>().map_err(de::Error::custom),
        }
    }
}
