use std::fmt;

/// Validation failures raised while normalizing model types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    InvalidTimeRange(String),
    InvalidFilter(String),
    InvalidLimit(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidTimeRange(msg) => {
                write!(f, "invalid time range: {msg}")
            }
            ModelError::InvalidFilter(msg) => {
                write!(f, "invalid value filter: {msg}")
            }
            ModelError::InvalidLimit(msg) => write!(f, "invalid limit: {msg}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
