// Error types for orchestration

use crate::lifecycle::JobStatus;
use pitwall_training::{JobId, TrainingError};
use thiserror::Error;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestrationError>;

/// Result type for job store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Job store errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("job record {0} not found")]
    NotFound(JobId),

    #[error("job record {0} already exists")]
    AlreadyExists(JobId),

    /// Conditional write lost: the record is not in the expected status.
    #[error("job record {job_id} is {actual}, expected {expected}")]
    Conflict {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job store unavailable: {0}")]
    Unavailable(String),
}

/// What the queue should do with the message that produced an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDisposition {
    /// Remove the message.
    Ack,
    /// Leave the message for redelivery.
    Retry,
    /// Move the message aside; redelivery cannot help.
    DeadLetter,
}

/// Orchestration errors
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Network or service blip
    #[error("transient infrastructure error: {0}")]
    TransientInfra(String),

    /// No capacity for another job right now
    #[error("quota exceeded: {in_flight} jobs in flight, ceiling is {ceiling}")]
    QuotaExceeded { in_flight: u32, ceiling: u32 },

    /// Malformed job request
    #[error("validation error: {0}")]
    Validation(String),

    /// The training backend refused or failed the job
    #[error("training backend error: {0}")]
    TrainingBackend(String),

    #[error("job store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution for job {0} already exists")]
    ExecutionAlreadyExists(JobId),

    #[error("invalid workflow transition: {0}")]
    InvalidTransition(String),

    #[error("stage {stage} panicked: {message}")]
    StagePanicked { stage: &'static str, message: String },

    /// Execution suspended by orchestrator shutdown
    #[error("execution canceled by shutdown")]
    Canceled,

    #[error("configuration error: {0}")]
    Config(String),
}

impl OrchestrationError {
    /// Queue disposition for a message whose handling failed with this error.
    #[must_use]
    pub const fn disposition(&self) -> MessageDisposition {
        match self {
            Self::Validation(_) => MessageDisposition::DeadLetter,
            Self::ExecutionAlreadyExists(_) => MessageDisposition::Ack,
            Self::TransientInfra(_)
            | Self::QuotaExceeded { .. }
            | Self::TrainingBackend(_)
            | Self::Store(_)
            | Self::InvalidTransition(_)
            | Self::StagePanicked { .. }
            | Self::Canceled
            | Self::Config(_) => MessageDisposition::Retry,
        }
    }

    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::TransientInfra(_) | Self::Store(StoreError::Unavailable(_)))
    }
}

impl From<TrainingError> for OrchestrationError {
    fn from(err: TrainingError) -> Self {
        match err {
            TrainingError::InvalidRequest(message) => Self::Validation(message),
            TrainingError::Json(e) => Self::Validation(e.to_string()),
            TrainingError::Transient(message) => Self::TransientInfra(message),
            TrainingError::NotFound(message) | TrainingError::Rejected(message) => {
                Self::TrainingBackend(message)
            }
        }
    }
}
