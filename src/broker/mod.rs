pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;

use crate::{
    error::QueueResult,
    types::{ClaimToken, JobEvent, JobId, JobRecord, JobState, Progress},
};

/// Type alias for boxed event streams
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send + 'static>>;

/// A job handed to a worker slot together with its ownership token
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub record: JobRecord,
    pub token: ClaimToken,
}

/// Outcome of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was waiting or delayed and has been removed
    Removed,

    /// The job is active; cancellation can only be cooperative
    Active,

    /// The job already reached a terminal state
    AlreadyTerminal,
}

/// Per-state job counts for one queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

impl StateCounts {
    /// Total retained and pending jobs across all states
    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.completed + self.failed + self.delayed
    }
}

/// State filter for job listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFilter {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl StateFilter {
    pub fn matches(&self, state: &JobState) -> bool {
        matches!(
            (self, state),
            (Self::Waiting, JobState::Waiting)
                | (Self::Delayed, JobState::Delayed { .. })
                | (Self::Active, JobState::Active)
                | (Self::Completed, JobState::Completed)
                | (Self::Failed, JobState::Failed)
        )
    }
}

/// Storage primitives for queue contents and job state.
///
/// The broker is the single shared resource behind every queue; all
/// operations are safe for concurrent invocation and `claim` is atomic, so
/// two worker slots can never take ownership of the same job.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connectivity check; errors once the connection is closed
    async fn ping(&self) -> QueueResult<()>;

    /// Store a new job and enqueue it for pickup (or delayed pickup)
    async fn push(&self, record: JobRecord) -> QueueResult<()>;

    /// Atomically take ownership of the highest-priority eligible job of
    /// the given type (FIFO within equal priority). Increments the attempt
    /// count and issues the claim token subsequent acks must present.
    async fn claim(&self, queue: &str, job_type: &str) -> QueueResult<Option<ClaimedJob>>;

    /// Record progress reported by the owning handler
    async fn record_progress(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &ClaimToken,
        progress: Progress,
    ) -> QueueResult<()>;

    /// Acknowledge successful completion
    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &ClaimToken,
        result: Value,
    ) -> QueueResult<()>;

    /// Acknowledge failure. With `retry_at` the job re-enters the queue as
    /// delayed; without it the failure is terminal.
    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &ClaimToken,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<()>;

    /// Remove a waiting or delayed job. Active jobs are reported as such
    /// and left untouched.
    async fn cancel(&self, queue: &str, job_id: &JobId) -> QueueResult<CancelOutcome>;

    /// Fetch one job record
    async fn job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord>;

    /// List jobs of a queue in one state, paginated
    async fn list(
        &self,
        queue: &str,
        filter: StateFilter,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>>;

    /// Per-state counts for a queue
    async fn counts(&self, queue: &str) -> QueueResult<StateCounts>;

    /// Subscribe to the job event stream
    fn events(&self) -> BoxStream<JobEvent>;

    /// Close the connection; subsequent operations fail
    async fn close(&self) -> QueueResult<()>;
}
