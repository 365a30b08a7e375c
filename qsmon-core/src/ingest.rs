//! Event enrichment at ingest: previous values, deltas, durations, and
//! event-type classification. Classification happens exactly once here;
//! compression and queries consume the stored type without re-deriving it.

use std::collections::HashMap;

use qsmon_model::{CachedEvent, ControlChange, ControlValue, EventType};

use crate::config::ThresholdConfig;

/// Most recent observation of a control within a group, kept for derived
/// field computation on the next change.
#[derive(Debug, Clone)]
pub struct LastValue {
    pub value: ControlValue,
    pub string_repr: String,
    pub timestamp_ms: u64,
}

/// Per-group map from control name to its last observation.
pub type LastValues = HashMap<String, LastValue>;

/// Stateless enrichment rules shared by every group.
#[derive(Debug, Clone)]
pub struct EventEnricher {
    thresholds: ThresholdConfig,
    significant_change_percent: f64,
    lowered_patterns: Vec<String>,
}

impl EventEnricher {
    pub fn new(thresholds: ThresholdConfig, significant_change_percent: f64) -> Self {
        let lowered_patterns = thresholds
            .control_name_patterns
            .iter()
            .map(|p| p.to_lowercase())
            .collect();
        Self {
            thresholds,
            significant_change_percent,
            lowered_patterns,
        }
    }

    /// Build the cached event for one change, deriving previous value,
    /// delta, duration, and classification from the last observation.
    pub fn enrich(
        &self,
        group_id: &str,
        change: &ControlChange,
        timestamp_ns: u64,
        timestamp_ms: u64,
        sequence_number: u64,
        previous: Option<&LastValue>,
    ) -> CachedEvent {
        let string_repr = change
            .string_repr
            .clone()
            .unwrap_or_else(|| change.value.to_string());

        let (previous_value, previous_string, delta, duration_ms, event_type) =
            match previous {
                Some(last) => {
                    let delta = match (last.value.as_f64(), change.value.as_f64()) {
                        (Some(prev), Some(curr)) => Some(curr - prev),
                        _ => None,
                    };
                    let duration_ms =
                        Some(timestamp_ms.saturating_sub(last.timestamp_ms));
                    let event_type = self.detect_event_type(
                        &last.value,
                        &change.value,
                        &change.name,
                    );
                    (
                        Some(last.value.clone()),
                        Some(last.string_repr.clone()),
                        delta,
                        duration_ms,
                        event_type,
                    )
                }
                None => (None, None, None, None, EventType::Change),
            };

        CachedEvent {
            group_id: group_id.to_string(),
            control_name: change.name.clone(),
            timestamp_ns,
            timestamp_ms,
            value: change.value.clone(),
            string_repr,
            previous_value,
            previous_string,
            delta,
            duration_ms,
            sequence_number,
            event_type: Some(event_type),
            compressed: false,
        }
    }

    /// Deterministic classification from `(previous, current, control_name)`.
    ///
    /// Precedence: state transition, then threshold crossing, then
    /// significant numeric change, then plain change.
    pub fn detect_event_type(
        &self,
        previous: &ControlValue,
        current: &ControlValue,
        control_name: &str,
    ) -> EventType {
        if is_state_transition(previous, current) {
            return EventType::StateTransition;
        }

        if let (Some(prev), Some(curr)) = (previous.as_f64(), current.as_f64()) {
            if self.is_level_control(control_name) && self.crosses_threshold(prev, curr)
            {
                return EventType::ThresholdCrossed;
            }

            if is_significant(prev, curr, self.significant_change_percent) {
                return EventType::SignificantChange;
            }
        }

        EventType::Change
    }

    fn is_level_control(&self, control_name: &str) -> bool {
        let lowered = control_name.to_lowercase();
        self.lowered_patterns.iter().any(|p| lowered.contains(p))
    }

    fn crosses_threshold(&self, prev: f64, curr: f64) -> bool {
        // 0 dB and -60 dB are always part of the ladder, whatever the
        // configured set says.
        self.thresholds
            .db_thresholds
            .iter()
            .copied()
            .chain([0.0, -60.0])
            .any(|t| crosses(prev, curr, t))
    }
}

fn crosses(prev: f64, curr: f64, threshold: f64) -> bool {
    (prev < threshold && curr >= threshold) || (prev >= threshold && curr < threshold)
}

/// A transition is a change of discrete identity: bool flips, string
/// changes, or any change of value type.
fn is_state_transition(previous: &ControlValue, current: &ControlValue) -> bool {
    match (previous, current) {
        (ControlValue::Bool(a), ControlValue::Bool(b)) => a != b,
        (ControlValue::String(a), ControlValue::String(b)) => a != b,
        (ControlValue::Float(_), ControlValue::Float(_)) => false,
        // Mixed tags: the control's identity changed shape.
        (a, b) => !a.loose_eq(b),
    }
}

fn is_significant(prev: f64, curr: f64, percent: f64) -> bool {
    if prev == 0.0 {
        return curr != 0.0;
    }
    ((curr - prev).abs() / prev.abs()) * 100.0 >= percent
}
