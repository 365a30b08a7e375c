//! Query execution over merged memory and disk event streams: value
//! filtering, aggregation, ordering, and pagination.

use std::collections::HashMap;

use ordered_float::OrderedFloat;
use qsmon_model::{
    Aggregation, CachedEvent, ControlValue, FilterOp, FilterValue, NormalizedQuery,
    OrderBy, OrderDirection, ValueFilter,
};
use regex::Regex;

use crate::error::{CacheError, Result};

/// A normalized query plus its compiled pieces, ready to run.
#[derive(Debug)]
pub struct QueryPlan {
    pub query: NormalizedQuery,
    regex: Option<Regex>,
}

impl QueryPlan {
    /// Compile the plan; an invalid regex pattern is a caller error.
    pub fn new(query: NormalizedQuery) -> Result<Self> {
        let regex = match &query.value_filter {
            Some(ValueFilter {
                op: FilterOp::Regex,
                value: FilterValue::One(ControlValue::String(pattern)),
                ..
            }) => Some(Regex::new(pattern).map_err(|err| {
                CacheError::QueryInvalid(format!("bad regex pattern: {err}"))
            })?),
            _ => None,
        };
        Ok(Self { query, regex })
    }

    /// Run filtering, aggregation, ordering, and pagination over candidate
    /// events already narrowed to the query's time range.
    pub fn execute(&self, mut events: Vec<CachedEvent>) -> Vec<CachedEvent> {
        events.retain(|ev| {
            self.query.matches_control(&ev.control_name)
                && self
                    .query
                    .value_filter
                    .as_ref()
                    .is_none_or(|f| self.matches_filter(ev, f))
        });

        let mut events = apply_aggregation(events, self.query.aggregation);

        sort_events(&mut events, self.query.order_by, self.query.order_direction);

        if self.query.offset > 0 {
            if self.query.offset >= events.len() {
                events.clear();
            } else {
                events.drain(..self.query.offset);
            }
        }
        events.truncate(self.query.limit);
        events
    }

    fn matches_filter(&self, event: &CachedEvent, filter: &ValueFilter) -> bool {
        let scalar = match &filter.value {
            FilterValue::One(v) => Some(v),
            FilterValue::Many(_) => None,
        };

        match filter.op {
            FilterOp::Eq => scalar.is_some_and(|t| event.value.loose_eq(t)),
            FilterOp::Neq => scalar.is_some_and(|t| !event.value.loose_eq(t)),
            FilterOp::Gt => numeric(event, scalar, |ord| ord.is_gt()),
            FilterOp::Gte => numeric(event, scalar, |ord| ord.is_ge()),
            FilterOp::Lt => numeric(event, scalar, |ord| ord.is_lt()),
            FilterOp::Lte => numeric(event, scalar, |ord| ord.is_le()),
            FilterOp::Contains => scalar.is_some_and(|t| match t {
                ControlValue::String(needle) => event.string_repr.contains(needle),
                _ => false,
            }),
            FilterOp::ChangedTo => scalar.is_some_and(|t| {
                event.value.loose_eq(t)
                    && event
                        .previous_value
                        .as_ref()
                        .is_some_and(|prev| !prev.loose_eq(t))
            }),
            FilterOp::ChangedFrom => scalar.is_some_and(|t| {
                !event.value.loose_eq(t)
                    && event
                        .previous_value
                        .as_ref()
                        .is_some_and(|prev| prev.loose_eq(t))
            }),
            FilterOp::Between => {
                let (Some(lo), Some(hi)) = (scalar, filter.value2.as_ref()) else {
                    return false;
                };
                matches!(event.value.numeric_cmp(lo), Some(ord) if ord.is_ge())
                    && matches!(event.value.numeric_cmp(hi), Some(ord) if ord.is_le())
            }
            FilterOp::In => match &filter.value {
                FilterValue::Many(candidates) => {
                    candidates.iter().any(|c| event.value.loose_eq(c))
                }
                FilterValue::One(c) => event.value.loose_eq(c),
            },
            FilterOp::Regex => self
                .regex
                .as_ref()
                .is_some_and(|re| re.is_match(&event.string_repr)),
        }
    }
}

fn numeric(
    event: &CachedEvent,
    scalar: Option<&ControlValue>,
    pred: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    scalar
        .and_then(|t| event.value.numeric_cmp(t))
        .is_some_and(pred)
}

/// Merge two time-ordered streams into one, stable on
/// `(timestamp_ms, sequence_number)` so batch ties keep ingest order.
pub fn merge_by_time(disk: Vec<CachedEvent>, memory: Vec<CachedEvent>) -> Vec<CachedEvent> {
    if disk.is_empty() {
        return memory;
    }
    if memory.is_empty() {
        return disk;
    }

    let mut merged = Vec::with_capacity(disk.len() + memory.len());
    let mut a = disk.into_iter().peekable();
    let mut b = memory.into_iter().peekable();

    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                let pick_a = (x.timestamp_ms, x.sequence_number)
                    <= (y.timestamp_ms, y.sequence_number);
                if pick_a {
                    merged.push(a.next().expect("peeked"));
                } else {
                    merged.push(b.next().expect("peeked"));
                }
            }
            (Some(_), None) => {
                merged.extend(a);
                break;
            }
            (None, Some(_)) => {
                merged.extend(b);
                break;
            }
            (None, None) => break,
        }
    }
    merged
}

fn apply_aggregation(events: Vec<CachedEvent>, aggregation: Aggregation) -> Vec<CachedEvent> {
    match aggregation {
        Aggregation::Raw => events,
        Aggregation::ChangesOnly => events
            .into_iter()
            .filter(|ev| match &ev.previous_value {
                Some(prev) => !ev.value.loose_eq(prev),
                None => true,
            })
            .collect(),
        Aggregation::Summary => summarize_latest(events),
        Aggregation::Statistics => synthesize_statistics(events),
    }
}

/// One event per control: its most recent observation in the window.
fn summarize_latest(events: Vec<CachedEvent>) -> Vec<CachedEvent> {
    let mut latest: HashMap<String, CachedEvent> = HashMap::new();
    for event in events {
        match latest.get(&event.control_name) {
            Some(existing)
                if (existing.timestamp_ms, existing.sequence_number)
                    >= (event.timestamp_ms, event.sequence_number) => {}
            _ => {
                latest.insert(event.control_name.clone(), event);
            }
        }
    }
    latest.into_values().collect()
}

/// One synthetic event per control carrying count/min/max/avg for numeric
/// controls (count only otherwise) in its string rendering.
fn synthesize_statistics(events: Vec<CachedEvent>) -> Vec<CachedEvent> {
    #[derive(Default)]
    struct Acc {
        count: usize,
        min: Option<f64>,
        max: Option<f64>,
        sum: f64,
        numeric: usize,
        latest: Option<CachedEvent>,
    }

    let mut per_control: HashMap<String, Acc> = HashMap::new();
    for event in events {
        let acc = per_control.entry(event.control_name.clone()).or_default();
        acc.count += 1;
        if let Some(v) = event.value.as_f64() {
            acc.numeric += 1;
            acc.sum += v;
            acc.min = Some(acc.min.map_or(v, |m| m.min(v)));
            acc.max = Some(acc.max.map_or(v, |m| m.max(v)));
        }
        let replace = match &acc.latest {
            Some(latest) => {
                (event.timestamp_ms, event.sequence_number)
                    > (latest.timestamp_ms, latest.sequence_number)
            }
            None => true,
        };
        if replace {
            acc.latest = Some(event);
        }
    }

    per_control
        .into_values()
        .filter_map(|acc| {
            let mut event = acc.latest?;
            let stats = if acc.numeric > 0 {
                let avg = acc.sum / acc.numeric as f64;
                event.value = ControlValue::Float(avg);
                serde_json::json!({
                    "count": acc.count,
                    "min": acc.min,
                    "max": acc.max,
                    "avg": avg,
                })
            } else {
                serde_json::json!({ "count": acc.count })
            };
            event.string_repr = stats.to_string();
            event.event_type = None;
            Some(event)
        })
        .collect()
}

/// Sort key giving a total order across value tags: bools, then numbers,
/// then strings.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
enum SortValue {
    Bool(bool),
    Num(OrderedFloat<f64>),
    Str(String),
}

fn sort_value(value: &ControlValue) -> SortValue {
    match value {
        ControlValue::Bool(b) => SortValue::Bool(*b),
        ControlValue::Float(f) => SortValue::Num(OrderedFloat(*f)),
        ControlValue::String(s) => SortValue::Str(s.clone()),
    }
}

fn sort_events(events: &mut [CachedEvent], order_by: OrderBy, direction: OrderDirection) {
    match order_by {
        OrderBy::Timestamp => {
            events.sort_by_key(|ev| (ev.timestamp_ms, ev.sequence_number))
        }
        OrderBy::ControlName => events.sort_by(|a, b| {
            (&a.control_name, a.timestamp_ms, a.sequence_number).cmp(&(
                &b.control_name,
                b.timestamp_ms,
                b.sequence_number,
            ))
        }),
        OrderBy::Value => events.sort_by(|a, b| {
            sort_value(&a.value)
                .cmp(&sort_value(&b.value))
                .then_with(|| {
                    (a.timestamp_ms, a.sequence_number)
                        .cmp(&(b.timestamp_ms, b.sequence_number))
                })
        }),
    }
    if direction == OrderDirection::Desc {
        events.reverse();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qsmon_model::EventQuery;

    fn event(seq: u64, ts_ms: u64, control: &str, value: ControlValue) -> CachedEvent {
        CachedEvent {
            group_id: "g".into(),
            control_name: control.into(),
            timestamp_ns: ts_ms * 1_000_000,
            timestamp_ms: ts_ms,
            string_repr: value.to_string(),
            value,
            previous_value: None,
            previous_string: None,
            delta: None,
            duration_ms: None,
            sequence_number: seq,
            event_type: None,
            compressed: false,
        }
    }

    fn with_previous(mut ev: CachedEvent, prev: ControlValue) -> CachedEvent {
        ev.previous_string = Some(prev.to_string());
        ev.previous_value = Some(prev);
        ev
    }

    fn plan(query: EventQuery) -> QueryPlan {
        QueryPlan::new(query.normalize(1_000_000).unwrap()).unwrap()
    }

    fn filter(op: FilterOp, value: ControlValue) -> Option<ValueFilter> {
        Some(ValueFilter {
            op,
            value: FilterValue::One(value),
            value2: None,
        })
    }

    #[test]
    fn ordering_comparisons_reject_type_mismatches() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            value_filter: filter(FilterOp::Gt, ControlValue::Float(0.0)),
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "a", ControlValue::Float(1.0)),
            event(2, 20, "b", ControlValue::Bool(true)),
            event(3, 30, "c", ControlValue::String("5".into())),
        ];
        let out = plan.execute(events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 1);
    }

    #[test]
    fn changed_to_requires_an_actual_transition() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            value_filter: filter(FilterOp::ChangedTo, ControlValue::Bool(true)),
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "Mute", ControlValue::Bool(false)),
            with_previous(
                event(2, 20, "Mute", ControlValue::Bool(true)),
                ControlValue::Bool(false),
            ),
            with_previous(
                event(3, 30, "Mute", ControlValue::Bool(false)),
                ControlValue::Bool(true),
            ),
        ];
        let out = plan.execute(events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 2);
        assert_eq!(out[0].previous_value, Some(ControlValue::Bool(false)));
    }

    #[test]
    fn changed_from_matches_the_departing_value() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            value_filter: filter(FilterOp::ChangedFrom, ControlValue::Bool(true)),
            ..Default::default()
        });
        let events = vec![
            with_previous(
                event(1, 10, "Mute", ControlValue::Bool(false)),
                ControlValue::Bool(true),
            ),
            with_previous(
                event(2, 20, "Mute", ControlValue::Bool(true)),
                ControlValue::Bool(true),
            ),
        ];
        let out = plan.execute(events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 1);
    }

    #[test]
    fn between_is_inclusive_and_numeric_only() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            value_filter: Some(ValueFilter {
                op: FilterOp::Between,
                value: FilterValue::One(ControlValue::Float(-20.0)),
                value2: Some(ControlValue::Float(-6.0)),
            }),
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "a", ControlValue::Float(-20.0)),
            event(2, 20, "a", ControlValue::Float(-6.0)),
            event(3, 30, "a", ControlValue::Float(-5.9)),
            event(4, 40, "a", ControlValue::Bool(true)),
        ];
        let out = plan.execute(events);
        let seqs: Vec<u64> = out.iter().map(|ev| ev.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn in_matches_any_candidate() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            value_filter: Some(ValueFilter {
                op: FilterOp::In,
                value: FilterValue::Many(vec![
                    ControlValue::Float(1.0),
                    ControlValue::String("idle".into()),
                ]),
                value2: None,
            }),
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "a", ControlValue::Float(1.0)),
            event(2, 20, "a", ControlValue::Float(2.0)),
            event(3, 30, "a", ControlValue::String("idle".into())),
        ];
        let seqs: Vec<u64> = plan
            .execute(events)
            .iter()
            .map(|ev| ev.sequence_number)
            .collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn regex_matches_string_rendering() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            value_filter: filter(FilterOp::Regex, ControlValue::String("^-?\\d+\\.5$".into())),
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "a", ControlValue::Float(-3.5)),
            event(2, 20, "a", ControlValue::Float(2.0)),
        ];
        let out = plan.execute(events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 1);
    }

    #[test]
    fn bad_regex_is_rejected_at_plan_time() {
        let query = EventQuery {
            value_filter: filter(FilterOp::Regex, ControlValue::String("(".into())),
            ..Default::default()
        };
        let normalized = query.normalize(0).unwrap();
        assert!(matches!(
            QueryPlan::new(normalized),
            Err(CacheError::QueryInvalid(_))
        ));
    }

    #[test]
    fn changes_only_drops_unchanged_repeats() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            aggregation: Aggregation::ChangesOnly,
            ..Default::default()
        });
        let events = vec![
            event(1, 1_000, "Ctrl0", ControlValue::Float(0.0)),
            with_previous(
                event(2, 1_500, "Ctrl0", ControlValue::Float(0.0)),
                ControlValue::Float(0.0),
            ),
        ];
        let out = plan.execute(events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sequence_number, 1);
    }

    #[test]
    fn summary_returns_latest_per_control() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            aggregation: Aggregation::Summary,
            order_by: OrderBy::ControlName,
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "a", ControlValue::Float(1.0)),
            event(2, 20, "b", ControlValue::Float(5.0)),
            event(3, 30, "a", ControlValue::Float(2.0)),
        ];
        let out = plan.execute(events);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].sequence_number, 3);
        assert_eq!(out[1].sequence_number, 2);
    }

    #[test]
    fn statistics_synthesizes_numeric_rollups() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            aggregation: Aggregation::Statistics,
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "a", ControlValue::Float(1.0)),
            event(2, 20, "a", ControlValue::Float(3.0)),
        ];
        let out = plan.execute(events);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, ControlValue::Float(2.0));
        let stats: serde_json::Value = serde_json::from_str(&out[0].string_repr).unwrap();
        assert_eq!(stats["count"], 2);
        assert_eq!(stats["min"], 1.0);
        assert_eq!(stats["max"], 3.0);
    }

    #[test]
    fn offset_and_limit_page_through_ordered_results() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            limit: Some(2),
            offset: 1,
            order_direction: OrderDirection::Desc,
            ..Default::default()
        });
        let events = (0..5)
            .map(|i| event(i, i * 10, "a", ControlValue::Float(i as f64)))
            .collect();
        let out = plan.execute(events);
        let seqs: Vec<u64> = out.iter().map(|ev| ev.sequence_number).collect();
        assert_eq!(seqs, vec![3, 2]);
    }

    #[test]
    fn merge_is_stable_on_timestamp_ties() {
        let disk = vec![
            event(1, 10, "a", ControlValue::Float(1.0)),
            event(3, 20, "a", ControlValue::Float(3.0)),
        ];
        let memory = vec![
            event(2, 10, "a", ControlValue::Float(2.0)),
            event(4, 20, "a", ControlValue::Float(4.0)),
        ];
        let merged = merge_by_time(disk, memory);
        let seqs: Vec<u64> = merged.iter().map(|ev| ev.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[test]
    fn value_ordering_is_total_across_types() {
        let plan = plan(EventQuery {
            start_time_ms: Some(0),
            order_by: OrderBy::Value,
            ..Default::default()
        });
        let events = vec![
            event(1, 10, "a", ControlValue::String("zz".into())),
            event(2, 20, "a", ControlValue::Float(-5.0)),
            event(3, 30, "a", ControlValue::Bool(true)),
            event(4, 40, "a", ControlValue::Float(7.0)),
        ];
        let out = plan.execute(events);
        let seqs: Vec<u64> = out.iter().map(|ev| ev.sequence_number).collect();
        assert_eq!(seqs, vec![3, 2, 4, 1]);
    }
}
