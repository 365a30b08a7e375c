use std::fmt;

use serde::{Deserialize, Serialize};

/// A Q-SYS control value as reported by the poller.
///
/// Controls carry one of three wire shapes (number, boolean, string); the
/// untagged representation keeps spill files and notifications identical to
/// what the upstream adapter produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Float(f64),
    String(String),
}

impl ControlValue {
    /// Numeric view of the value. Booleans are intentionally *not* coerced;
    /// a mute flip is a state transition, never a delta.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ControlValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ControlValue::Float(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, ControlValue::Bool(_))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ControlValue::Bool(_) => "bool",
            ControlValue::Float(_) => "number",
            ControlValue::String(_) => "string",
        }
    }

    /// Tag-aware equality used by filter operators. Values of different
    /// types never compare equal.
    pub fn loose_eq(&self, other: &ControlValue) -> bool {
        match (self, other) {
            (ControlValue::Bool(a), ControlValue::Bool(b)) => a == b,
            (ControlValue::Float(a), ControlValue::Float(b)) => a == b,
            (ControlValue::String(a), ControlValue::String(b)) => a == b,
            _ => false,
        }
    }

    /// Numeric ordering used by `gt`/`gte`/`lt`/`lte`/`between`. Returns
    /// `None` on any non-numeric operand, which filter evaluation treats
    /// as "does not match".
    pub fn numeric_cmp(&self, other: &ControlValue) -> Option<std::cmp::Ordering> {
        let a = self.as_f64()?;
        let b = other.as_f64()?;
        a.partial_cmp(&b)
    }
}

impl fmt::Display for ControlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlValue::Bool(v) => write!(f, "{v}"),
            ControlValue::Float(v) => write!(f, "{v}"),
            ControlValue::String(v) => f.write_str(v),
        }
    }
}

impl From<f64> for ControlValue {
    fn from(v: f64) -> Self {
        ControlValue::Float(v)
    }
}

impl From<bool> for ControlValue {
    fn from(v: bool) -> Self {
        ControlValue::Bool(v)
    }
}

impl From<&str> for ControlValue {
    fn from(v: &str) -> Self {
        ControlValue::String(v.to_string())
    }
}

impl From<String> for ControlValue {
    fn from(v: String) -> Self {
        ControlValue::String(v)
    }
}
