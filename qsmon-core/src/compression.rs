//! Tiered retention for aging events.
//!
//! Events are partitioned by age into recent / medium / ancient bands with
//! progressively stricter keep rules. Survivors of the medium and ancient
//! bands are marked `compressed`; sequence numbers and timestamps are never
//! touched, so a second pass over unchanged input is a no-op.

use qsmon_model::{CachedEvent, EventType};
use tracing::debug;

use crate::buffer::TimeIndexedBuffer;
use crate::config::CompressionConfig;

/// Result of one compression run over a group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionOutcome {
    pub before: usize,
    pub after: usize,
    pub bytes_reclaimed: usize,
}

impl CompressionOutcome {
    pub fn removed(&self) -> usize {
        self.before - self.after
    }
}

/// Apply the tiered retention policy to one group's buffer.
pub fn compress_group(
    buffer: &mut TimeIndexedBuffer,
    config: &CompressionConfig,
    now_ms: u64,
) -> CompressionOutcome {
    let mut last_kept_ms: Option<u64> = None;

    let (before, after, bytes_reclaimed) = buffer.compact(|event| {
        let age = now_ms.saturating_sub(event.timestamp_ms);

        if age <= config.recent_window_ms {
            // Recent tier: keep everything untouched.
            last_kept_ms = Some(event.timestamp_ms);
            return true;
        }

        let keep = if age <= config.medium_window_ms {
            keep_in_medium_tier(event, config, last_kept_ms)
        } else if age <= config.ancient_window_ms {
            matches!(
                event.event_type,
                Some(EventType::StateTransition | EventType::ThresholdCrossed)
            )
        } else {
            false
        };

        if keep {
            last_kept_ms = Some(event.timestamp_ms);
            event.compressed = true;
        }
        keep
    });

    if before != after {
        debug!(before, after, bytes_reclaimed, "compressed group buffer");
    }

    CompressionOutcome {
        before,
        after,
        bytes_reclaimed,
    }
}

fn keep_in_medium_tier(
    event: &CachedEvent,
    config: &CompressionConfig,
    last_kept_ms: Option<u64>,
) -> bool {
    if matches!(
        event.event_type,
        Some(
            EventType::StateTransition
                | EventType::ThresholdCrossed
                | EventType::SignificantChange
        )
    ) {
        return true;
    }

    if significant_delta(event, config.significant_change_percent) {
        return true;
    }

    match last_kept_ms {
        Some(last) => {
            event.timestamp_ms.saturating_sub(last) >= config.min_time_between_events_ms
        }
        None => true,
    }
}

fn significant_delta(event: &CachedEvent, percent: f64) -> bool {
    let (Some(delta), Some(prev)) = (
        event.delta,
        event.previous_value.as_ref().and_then(|v| v.as_f64()),
    ) else {
        return false;
    };
    if prev == 0.0 {
        return delta != 0.0;
    }
    delta.abs() >= (percent / 100.0) * prev.abs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsmon_model::ControlValue;

    const NOW: u64 = 10_000_000;

    fn config() -> CompressionConfig {
        CompressionConfig {
            enabled: true,
            recent_window_ms: 60_000,
            medium_window_ms: 600_000,
            ancient_window_ms: 3_600_000,
            significant_change_percent: 5.0,
            min_time_between_events_ms: 100,
            check_interval_ms: 60_000,
        }
    }

    fn event(seq: u64, age_ms: u64, event_type: EventType) -> CachedEvent {
        let timestamp_ms = NOW - age_ms;
        CachedEvent {
            group_id: "g".into(),
            control_name: "Gain.gain".into(),
            timestamp_ns: timestamp_ms * 1_000_000,
            timestamp_ms,
            value: ControlValue::Float(seq as f64),
            string_repr: seq.to_string(),
            previous_value: Some(ControlValue::Float(seq as f64)),
            previous_string: Some(seq.to_string()),
            delta: Some(0.0),
            duration_ms: Some(30),
            sequence_number: seq,
            event_type: Some(event_type),
            compressed: false,
        }
    }

    fn buffer_of(events: Vec<CachedEvent>) -> TimeIndexedBuffer {
        let mut buffer = TimeIndexedBuffer::new(10_000, u64::MAX);
        for event in events {
            buffer.add(event);
        }
        buffer
    }

    #[test]
    fn recent_events_are_untouched() {
        let mut buffer = buffer_of(vec![
            event(1, 30_000, EventType::Change),
            event(2, 10_000, EventType::Change),
        ]);
        let outcome = compress_group(&mut buffer, &config(), NOW);
        assert_eq!(outcome.before, 2);
        assert_eq!(outcome.after, 2);
        assert!(buffer.get_all().all(|ev| !ev.compressed));
    }

    #[test]
    fn medium_tier_keeps_marked_event_types() {
        let mut buffer = buffer_of(vec![
            event(1, 300_000, EventType::StateTransition),
            event(2, 299_950, EventType::Change),
            event(3, 299_900, EventType::SignificantChange),
        ]);
        let outcome = compress_group(&mut buffer, &config(), NOW);
        // The plain change 50ms after a kept event loses on every rule.
        assert_eq!(outcome.after, 2);
        let kept: Vec<u64> = buffer.get_all().map(|ev| ev.sequence_number).collect();
        assert_eq!(kept, vec![1, 3]);
        assert!(buffer.get_all().all(|ev| ev.compressed));
    }

    #[test]
    fn medium_tier_preserves_minimum_spacing() {
        let mut buffer = buffer_of(vec![
            event(1, 300_000, EventType::Change),
            event(2, 299_850, EventType::Change),
            event(3, 299_820, EventType::Change),
        ]);
        let outcome = compress_group(&mut buffer, &config(), NOW);
        // 1 kept (first), 2 kept (150ms later), 3 dropped (30ms gap).
        assert_eq!(outcome.after, 2);
        let kept: Vec<u64> = buffer.get_all().map(|ev| ev.sequence_number).collect();
        assert_eq!(kept, vec![1, 2]);
    }

    #[test]
    fn ancient_tier_keeps_only_transitions_and_crossings() {
        let mut buffer = buffer_of(vec![
            event(1, 1_000_000, EventType::SignificantChange),
            event(2, 999_000, EventType::StateTransition),
            event(3, 998_000, EventType::ThresholdCrossed),
            event(4, 997_000, EventType::Change),
        ]);
        let outcome = compress_group(&mut buffer, &config(), NOW);
        assert_eq!(outcome.after, 2);
        let kept: Vec<u64> = buffer.get_all().map(|ev| ev.sequence_number).collect();
        assert_eq!(kept, vec![2, 3]);
    }

    #[test]
    fn beyond_ancient_is_dropped() {
        let mut buffer = buffer_of(vec![event(1, 3_700_000, EventType::StateTransition)]);
        let outcome = compress_group(&mut buffer, &config(), NOW);
        assert_eq!(outcome.after, 0);
        assert!(outcome.bytes_reclaimed > 0);
    }

    #[test]
    fn second_pass_is_a_no_op() {
        let mut buffer = buffer_of(vec![
            event(4, 1_000_000, EventType::ThresholdCrossed),
            event(1, 300_000, EventType::StateTransition),
            event(2, 299_950, EventType::Change),
            event(3, 299_800, EventType::Change),
        ]);
        let first = compress_group(&mut buffer, &config(), NOW);
        let survivors: Vec<u64> = buffer.get_all().map(|ev| ev.sequence_number).collect();

        let second = compress_group(&mut buffer, &config(), NOW);
        assert_eq!(second.before, first.after);
        assert_eq!(second.after, first.after);
        assert_eq!(second.bytes_reclaimed, 0);
        let after_second: Vec<u64> =
            buffer.get_all().map(|ev| ev.sequence_number).collect();
        assert_eq!(survivors, after_second);
    }
}
