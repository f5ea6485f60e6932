use std::time::Duration;

/// Failure of a single exchange with the model API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("model API rate limited: {0}")]
    RateLimited(String),

    #[error("model API rejected credential: {0}")]
    Auth(String),

    #[error("transient model API failure: {0}")]
    Transient(String),

    #[error("malformed model response: {0}")]
    Malformed(String),
}

impl ModelError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::Auth(_) => FailureKind::Auth,
            Self::Transient(_) => FailureKind::Transient,
            Self::Malformed(_) => FailureKind::Malformed,
        }
    }
}

/// Failure category reported back to the key pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    RateLimited,
    Auth,
    Transient,
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    /// Every credential is cooling down or revoked. `retry_after` is `None`
    /// when no credential will ever recover in this run.
    #[error("all API keys are unavailable{}", retry_hint(.retry_after))]
    PoolExhausted { retry_after: Option<Duration> },

    #[error("generation failed after {attempts} attempt(s): {last_error}")]
    GenerationFailed {
        attempts: usize,
        last_error: ModelError,
    },

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("section index {index} is out of range ({len} sections)")]
    SectionNotFound { index: usize, len: usize },
}

impl GenerationError {
    /// Errors the section generator replaces with fallback content.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GenerationFailed { .. } | Self::Model(ModelError::Malformed(_))
        )
    }
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(wait) => format!("; retry after {}s", wait.as_secs().max(1)),
        None => "; every key has been revoked".to_owned(),
    }
}
