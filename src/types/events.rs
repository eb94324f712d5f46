use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JobId, Progress};

/// Minimal stable event protocol emitted by the broker on every state
/// transition. Consumed by the chain tracker and any other passive
/// observer; emission never blocks job processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobEvent {
    /// Job was accepted and stored
    Enqueued {
        job_id: JobId,
        queue: String,
        job_type: String,
        data: Value,
        at: DateTime<Utc>,
    },

    /// A worker slot claimed the job and started an attempt
    Started {
        job_id: JobId,
        queue: String,
        job_type: String,
        attempt: u32,
        at: DateTime<Utc>,
    },

    /// The owning handler reported progress
    Progress {
        job_id: JobId,
        queue: String,
        progress: Progress,
        at: DateTime<Utc>,
    },

    /// Job completed successfully
    Completed {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },

    /// Job failed and will be retried after a backoff delay
    Retrying {
        job_id: JobId,
        queue: String,
        retry_at: DateTime<Utc>,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job failed terminally
    Failed {
        job_id: JobId,
        queue: String,
        error: String,
        at: DateTime<Utc>,
    },

    /// Job was cancelled before pickup
    Cancelled {
        job_id: JobId,
        queue: String,
        at: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Get event type name as string
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Enqueued { .. } => "enqueued",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Completed { .. } => "completed",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    /// Get the job ID from any event
    pub fn job_id(&self) -> &JobId {
        match self {
            Self::Enqueued { job_id, .. }
            | Self::Started { job_id, .. }
            | Self::Progress { job_id, .. }
            | Self::Completed { job_id, .. }
            | Self::Retrying { job_id, .. }
            | Self::Failed { job_id, .. }
            | Self::Cancelled { job_id, .. } => job_id,
        }
    }

    /// Get the queue the event belongs to
    pub fn queue(&self) -> &str {
        match self {
            Self::Enqueued { queue, .. }
            | Self::Started { queue, .. }
            | Self::Progress { queue, .. }
            | Self::Completed { queue, .. }
            | Self::Retrying { queue, .. }
            | Self::Failed { queue, .. }
            | Self::Cancelled { queue, .. } => queue,
        }
    }

    /// Get the timestamp from any event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Enqueued { at, .. }
            | Self::Started { at, .. }
            | Self::Progress { at, .. }
            | Self::Completed { at, .. }
            | Self::Retrying { at, .. }
            | Self::Failed { at, .. }
            | Self::Cancelled { at, .. } => *at,
        }
    }
}
