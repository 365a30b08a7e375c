use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::value::ControlValue;

/// Default lookback window when a query omits its time range.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;
pub const DEFAULT_LIMIT: usize = 1_000;
pub const MAX_LIMIT: usize = 10_000;

/// Comparison operator applied by a [`ValueFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    ChangedTo,
    ChangedFrom,
    Between,
    In,
    Regex,
}

/// Operand of a value filter: a scalar for most operators, a list for `in`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(ControlValue),
    Many(Vec<ControlValue>),
}

/// Value predicate applied to each candidate event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueFilter {
    pub op: FilterOp,
    pub value: FilterValue,
    /// Inclusive upper bound, used by `between` only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value2: Option<ControlValue>,
}

impl ValueFilter {
    pub fn validate(&self) -> Result<()> {
        match self.op {
            FilterOp::Between => {
                let FilterValue::One(lo) = &self.value else {
                    return Err(ModelError::InvalidFilter(
                        "between requires a scalar lower bound".into(),
                    ));
                };
                let Some(hi) = &self.value2 else {
                    return Err(ModelError::InvalidFilter(
                        "between requires value2 as upper bound".into(),
                    ));
                };
                if !lo.is_numeric() || !hi.is_numeric() {
                    return Err(ModelError::InvalidFilter(
                        "between bounds must be numeric".into(),
                    ));
                }
            }
            FilterOp::In => {
                if !matches!(self.value, FilterValue::Many(_)) {
                    return Err(ModelError::InvalidFilter(
                        "in requires a list operand".into(),
                    ));
                }
            }
            FilterOp::Regex | FilterOp::Contains => {
                let FilterValue::One(ControlValue::String(_)) = &self.value else {
                    return Err(ModelError::InvalidFilter(format!(
                        "{:?} requires a string operand",
                        self.op
                    )));
                };
            }
            op => {
                if !matches!(self.value, FilterValue::One(_)) {
                    return Err(ModelError::InvalidFilter(format!(
                        "{op:?} requires a scalar operand"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// How matching events are reduced before ordering and pagination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    #[default]
    Raw,
    ChangesOnly,
    Summary,
    Statistics,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    Timestamp,
    ControlName,
    Value,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// A user query as received from the tool layer. All fields optional;
/// [`EventQuery::normalize`] applies defaults and clamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventQuery {
    pub group_id: Option<String>,
    pub start_time_ms: Option<u64>,
    pub end_time_ms: Option<u64>,
    pub control_names: Option<Vec<String>>,
    pub value_filter: Option<ValueFilter>,
    pub aggregation: Aggregation,
    pub order_by: OrderBy,
    pub order_direction: OrderDirection,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl EventQuery {
    /// Apply defaults and validate, producing the canonical form used for
    /// execution and cache keying. `now_ms` anchors the default window.
    pub fn normalize(&self, now_ms: u64) -> Result<NormalizedQuery> {
        let end_time_ms = self.end_time_ms.unwrap_or(now_ms);
        let start_time_ms = self
            .start_time_ms
            .unwrap_or_else(|| end_time_ms.saturating_sub(DEFAULT_WINDOW_MS));

        if start_time_ms > end_time_ms {
            return Err(ModelError::InvalidTimeRange(format!(
                "start {start_time_ms} is after end {end_time_ms}"
            )));
        }

        if let Some(filter) = &self.value_filter {
            filter.validate()?;
        }

        let limit = self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);

        let control_names = self.control_names.as_ref().and_then(|names| {
            let set: BTreeSet<String> = names.iter().cloned().collect();
            if set.is_empty() { None } else { Some(set) }
        });

        Ok(NormalizedQuery {
            group_id: self.group_id.clone(),
            start_time_ms,
            end_time_ms,
            control_names,
            value_filter: self.value_filter.clone(),
            aggregation: self.aggregation,
            order_by: self.order_by,
            order_direction: self.order_direction,
            limit,
            offset: self.offset,
        })
    }
}

/// Canonical query: defaults filled, names deduplicated and sorted.
/// Logically equal queries serialize to the same cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedQuery {
    pub group_id: Option<String>,
    pub start_time_ms: u64,
    pub end_time_ms: u64,
    pub control_names: Option<BTreeSet<String>>,
    pub value_filter: Option<ValueFilter>,
    pub aggregation: Aggregation,
    pub order_by: OrderBy,
    pub order_direction: OrderDirection,
    pub limit: usize,
    pub offset: usize,
}

impl NormalizedQuery {
    /// Stable serialization used as the query-cache key. Struct field order
    /// and the sorted name set make this deterministic.
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).expect("normalized query is always serializable")
    }

    pub fn matches_control(&self, control_name: &str) -> bool {
        match &self.control_names {
            Some(names) => names.contains(control_name),
            None => true,
        }
    }
}
