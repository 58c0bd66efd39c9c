use thiserror::Error;

/// Engine-wide error type.
///
/// The variants map to distinct handling policies: `Validation` is rejected
/// synchronously and never retried, `Transient` may be retried with backoff
/// on the ingestion path, `Consistency` is always surfaced to the caller,
/// and `NotFound` is kept distinct from validation failures.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("{service} unavailable: {detail}")]
    Transient { service: &'static str, detail: String },

    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn internal<E: std::fmt::Display>(err: E) -> Self {
        EngineError::Internal(err.to_string())
    }

    pub fn transient<E: std::fmt::Display>(service: &'static str, err: E) -> Self {
        EngineError::Transient {
            service,
            detail: err.to_string(),
        }
    }

    /// Whether the ingestion path may retry this error.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient { .. })
    }
}
