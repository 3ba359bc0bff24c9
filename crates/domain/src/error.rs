//! Error taxonomy
//!
//! One error enum for the whole core. Adapters map their library errors
//! into these variants; the RPC layer maps them onto status codes.

/// Result type for core operations
pub type DomainResult<T> = std::result::Result<T, DomainError>;

#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    /// Template rendering or spec decoding failed. Marks the job DONE
    /// with success=false.
    #[error("invalid job spec: {0}")]
    InvalidSpec(String),

    /// The orchestrator refused the workload object.
    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// More than one workload carries the job-name label.
    #[error("job {0} has no unique execution")]
    Ambiguous(String),

    /// Retried internally and logged, never surfaced to callers.
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// A subscriber failed to keep up; its subscription is closed.
    #[error("subscriber dropped: inbox full")]
    BackpressureDropped,

    #[error("unauthenticated")]
    Unauthenticated,

    /// Durable store failure.
    #[error("store failure: {0}")]
    Store(String),
}

impl DomainError {
    /// Whether the error marks the job terminally failed (as opposed to
    /// an infrastructure hiccup the core absorbs).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DomainError::InvalidSpec(_) | DomainError::SubmissionRejected(_)
        )
    }
}
