use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{ClaimToken, JobId, JobOptions};

/// Job lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum JobState {
    /// Eligible for pickup as soon as a worker slot is free
    Waiting,

    /// Not eligible until `until` has elapsed (initial delay or retry backoff)
    Delayed { until: DateTime<Utc> },

    /// Exactly one worker slot owns the job
    Active,

    /// Terminal; `result` is set
    Completed,

    /// Terminal; `failure_reason` is set
    Failed,

    /// Terminal; reachable only from `Waiting`/`Delayed`
    Cancelled,
}

impl JobState {
    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the job is currently owned by a worker
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the job may be claimed at `now`
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self {
            Self::Waiting => true,
            Self::Delayed { until } => *until <= now,
            _ => false,
        }
    }

    /// Wire name of the state
    pub fn name(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed { .. } => "delayed",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Job progress: a percentage or a structured value, settable only by the
/// owning handler while the job is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Progress {
    Percent(u8),
    Detail(Value),
}

impl Progress {
    /// Percentage progress, clamped to [0, 100]
    pub fn percent(pct: u8) -> Self {
        Self::Percent(pct.min(100))
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::Percent(0)
    }
}

/// Job record - the broker-held state of one unit of work
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub job_type: String,
    pub data: Value,
    pub options: JobOptions,

    #[serde(flatten)]
    pub state: JobState,
    pub progress: Progress,

    /// Execution attempts started so far; never exceeds `options.max_attempts`
    pub attempts_made: u32,

    /// Set exactly once, on successful terminal transition
    pub result: Option<Value>,

    /// Set exactly once, on failed terminal transition
    pub failure_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Monotonic enqueue sequence, FIFO tiebreak within equal priority
    pub seq: u64,

    /// Ownership token while active
    pub claim: Option<ClaimToken>,

    /// Sticky cooperative-cancellation request for active jobs
    #[serde(default)]
    pub cancel_requested: bool,
}

impl JobRecord {
    /// Create a new record in `Waiting` (or `Delayed` when the options carry
    /// an initial delay). The broker assigns `seq` at push time.
    pub fn new(
        queue: impl Into<String>,
        job_type: impl Into<String>,
        data: Value,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        let state = if options.delay_ms > 0 {
            JobState::Delayed {
                until: now + chrono::Duration::milliseconds(options.delay_ms as i64),
            }
        } else {
            JobState::Waiting
        };

        Self {
            id: JobId::new(),
            queue: queue.into(),
            job_type: job_type.into(),
            data,
            options,
            state,
            progress: Progress::default(),
            attempts_made: 0,
            result: None,
            failure_reason: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            seq: 0,
            claim: None,
            cancel_requested: false,
        }
    }

    /// Start an execution attempt: transition to `Active` under the given
    /// claim token and count the attempt.
    pub fn begin_attempt(&mut self, token: ClaimToken) {
        self.state = JobState::Active;
        self.claim = Some(token);
        self.attempts_made += 1;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Complete the job; `result` is immutable afterwards.
    pub fn complete(&mut self, result: Value) {
        debug_assert!(self.result.is_none() && self.failure_reason.is_none());
        self.state = JobState::Completed;
        self.result = Some(result);
        self.finished_at = Some(Utc::now());
        self.claim = None;
    }

    /// Fail the job terminally; `failure_reason` is immutable afterwards.
    pub fn fail(&mut self, reason: impl Into<String>) {
        debug_assert!(self.result.is_none() && self.failure_reason.is_none());
        self.state = JobState::Failed;
        self.failure_reason = Some(reason.into());
        self.finished_at = Some(Utc::now());
        self.claim = None;
    }

    /// Schedule a retry: back to `Delayed` until the backoff elapses. The
    /// ownership claim is released; `attempts_made` keeps its count.
    pub fn schedule_retry(&mut self, until: DateTime<Utc>) {
        self.state = JobState::Delayed { until };
        self.claim = None;
        self.progress = Progress::default();
    }

    /// Cancel a not-yet-picked-up job.
    pub fn cancel(&mut self) {
        debug_assert!(!self.state.is_active() && !self.state.is_terminal());
        self.state = JobState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    /// Read-only snapshot for status queries.
    pub fn view(&self) -> JobView {
        JobView {
            id: self.id.clone(),
            queue: self.queue.clone(),
            job_type: self.job_type.clone(),
            status: self.state.name().to_string(),
            progress: self.progress.clone(),
            data: self.data.clone(),
            result: self.result.clone(),
            failed_reason: self.failure_reason.clone(),
            attempts_made: self.attempts_made,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// Minimal entry for queue listings.
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            job_type: self.job_type.clone(),
            status: self.state.name().to_string(),
            result: self.result.clone(),
            failed_reason: self.failure_reason.clone(),
            created_at: self.created_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only job snapshot in the wire form the desktop client consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobView {
    pub id: JobId,
    pub queue: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    pub progress: Progress,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub attempts_made: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Minimal job entry for per-state listings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> JobRecord {
        JobRecord::new("sync", "sync-channel", json!({"channelId": "C1"}), JobOptions::default())
    }

    #[test]
    fn new_record_is_waiting() {
        let record = record();
        assert_eq!(record.state, JobState::Waiting);
        assert_eq!(record.attempts_made, 0);
        assert!(record.state.is_eligible(Utc::now()));
    }

    #[test]
    fn delay_option_creates_delayed_record() {
        let options = JobOptions { delay_ms: 60_000, ..JobOptions::default() };
        let record = JobRecord::new("sync", "sync-channel", json!({}), options);

        assert_eq!(record.state.name(), "delayed");
        assert!(!record.state.is_eligible(Utc::now()));
        assert!(record.state.is_eligible(Utc::now() + chrono::Duration::seconds(61)));
    }

    #[test]
    fn attempt_counting_and_completion() {
        let mut record = record();
        record.begin_attempt(ClaimToken::new());
        assert_eq!(record.state, JobState::Active);
        assert_eq!(record.attempts_made, 1);
        assert!(record.started_at.is_some());

        record.complete(json!({"ok": true}));
        assert!(record.state.is_terminal());
        assert_eq!(record.result, Some(json!({"ok": true})));
        assert!(record.claim.is_none());
        assert!(record.finished_at.is_some());
    }

    #[test]
    fn retry_releases_claim_and_resets_progress() {
        let mut record = record();
        record.begin_attempt(ClaimToken::new());
        record.progress = Progress::percent(40);

        record.schedule_retry(Utc::now() + chrono::Duration::seconds(5));
        assert_eq!(record.state.name(), "delayed");
        assert!(record.claim.is_none());
        assert_eq!(record.progress, Progress::percent(0));
        assert_eq!(record.attempts_made, 1);
    }

    #[test]
    fn cancel_is_terminal() {
        let mut record = record();
        record.cancel();
        assert_eq!(record.state, JobState::Cancelled);
        assert!(record.state.is_terminal());
        assert!(record.finished_at.is_some());
        assert_eq!(record.view().status, "cancelled");
    }

    #[test]
    fn progress_percent_clamps() {
        assert_eq!(Progress::percent(250), Progress::Percent(100));
    }

    #[test]
    fn view_round_trips_payload() {
        let record = record();
        let view = record.view();
        assert_eq!(view.status, "waiting");
        assert_eq!(view.data, json!({"channelId": "C1"}));

        let wire = serde_json::to_value(&view).unwrap();
        assert_eq!(wire["type"], "sync-channel");
        assert_eq!(wire["attemptsMade"], 0);
    }
}
