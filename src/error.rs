use thiserror::Error;

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Infrastructure errors for queue operations
#[derive(Error, Debug, Clone)]
pub enum QueueError {
    /// Malformed request: a required field is missing or empty. Surfaced
    /// synchronously to the caller; no job is created.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The broker cannot be reached. Fatal at startup (the service refuses
    /// to start), logged and retried inside worker loops at runtime.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("queue not registered: {0}")]
    QueueNotRegistered(String),

    /// An ack or progress update arrived with a claim token that no longer
    /// owns the job.
    #[error("stale claim for job {0}")]
    StaleClaim(String),

    #[error("job execution failed: {0}")]
    Handler(#[from] JobError),

    /// A best-effort downstream write failed after the primary unit of work
    /// succeeded. Logged, never fails the job.
    #[error("side effect failed: {0}")]
    SideEffect(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("service is shutting down")]
    ShuttingDown,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Job execution outcome - determines retry behavior
#[derive(Error, Debug, Clone)]
pub enum JobError {
    /// Retryable error - will schedule a retry while attempts remain
    #[error("retryable error: {0}")]
    Retryable(String),

    /// Permanent error - fail immediately, no retry
    #[error("permanent error: {0}")]
    Permanent(String),
}

impl JobError {
    /// Create a retryable error
    pub fn retryable(msg: impl Into<String>) -> Self {
        Self::Retryable(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }

    /// Get the error message without the retryability prefix
    pub fn message(&self) -> &str {
        match self {
            Self::Retryable(msg) | Self::Permanent(msg) => msg,
        }
    }
}
