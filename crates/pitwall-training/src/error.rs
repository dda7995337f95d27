use thiserror::Error;

pub type TrainingResult<T> = std::result::Result<T, TrainingError>;

/// Errors raised by request validation and by the external service clients.
#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    /// Network or service blip; safe to retry.
    #[error("transient service error: {0}")]
    Transient(String),

    #[error("resource not found: {0}")]
    NotFound(String),

    /// The service refused the call (limit reached, bad spec, ...).
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TrainingError {
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    #[must_use]
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}
