use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("invalid query: {0}")]
    QueryInvalid(String),

    #[error("query deadline exceeded after {elapsed_ms}ms")]
    QueryTimeout { elapsed_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("query failed ({context}): {source}")]
    QueryFailed {
        context: String,
        #[source]
        source: Box<CacheError>,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("memory critical: {0}")]
    MemoryCritical(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    /// Short label used when recording the error in statistics.
    pub fn context_label(&self) -> &'static str {
        match self {
            CacheError::ConfigInvalid(_) => "config",
            CacheError::QueryInvalid(_) => "query-invalid",
            CacheError::QueryTimeout { .. } => "query-timeout",
            CacheError::Io(_) => "io",
            CacheError::QueryFailed { .. } => "query-failed",
            CacheError::Serialization(_) => "serialization",
            CacheError::MemoryCritical(_) => "memory-critical",
            CacheError::Internal(_) => "internal",
        }
    }

    /// Wrap an error with the operation that surfaced it.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        CacheError::QueryFailed {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

impl From<qsmon_model::ModelError> for CacheError {
    fn from(err: qsmon_model::ModelError) -> Self {
        CacheError::QueryInvalid(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
