use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{JobError, QueueError, QueueResult},
    manager::JobDispatcher,
    types::{JobId, Progress},
};

/// Capacity of the per-job progress channel. Updates past a full channel
/// are dropped; progress is advisory.
const PROGRESS_CHANNEL_CAPACITY: usize = 32;

/// Handler for one job type.
///
/// Implementations receive the full [`JobContext`] of the attempt: the
/// payload, a progress channel, a cooperative cancellation token, and a
/// dispatcher for enqueueing follow-up jobs.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError>;
}

/// Everything a handler gets to know about the attempt it is executing
pub struct JobContext {
    pub job_id: JobId,
    pub queue: String,
    pub job_type: String,
    pub attempt: u32,
    pub data: Value,
    progress: ProgressHandle,
    cancellation: CancellationToken,
    dispatcher: JobDispatcher,
}

impl JobContext {
    pub(crate) fn new(
        job_id: JobId,
        queue: String,
        job_type: String,
        attempt: u32,
        data: Value,
        progress: ProgressHandle,
        cancellation: CancellationToken,
        dispatcher: JobDispatcher,
    ) -> Self {
        Self { job_id, queue, job_type, attempt, data, progress, cancellation, dispatcher }
    }

    /// Progress reporting channel for this attempt
    pub fn progress(&self) -> &ProgressHandle {
        &self.progress
    }

    /// Check whether cancellation of this job has been requested.
    /// Honoring the request is the handler's responsibility.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The cancellation token itself, for use in `select!` arms
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Dispatcher for chaining follow-up jobs
    pub fn dispatcher(&self) -> &JobDispatcher {
        &self.dispatcher
    }
}

/// Ordered progress updates from the owning handler, applied to the broker
/// by the worker slot that issued the context.
#[derive(Clone)]
pub struct ProgressHandle {
    tx: mpsc::Sender<Progress>,
}

impl ProgressHandle {
    pub(crate) fn channel() -> (Self, mpsc::Receiver<Progress>) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        (Self { tx }, rx)
    }

    /// Report percentage progress (clamped to 100)
    pub fn percent(&self, pct: u8) {
        let _ = self.tx.try_send(Progress::percent(pct));
    }

    /// Report a structured progress value
    pub fn detail(&self, value: Value) {
        let _ = self.tx.try_send(Progress::Detail(value));
    }
}

/// One registered handler binding
#[derive(Clone)]
pub struct HandlerBinding {
    pub handler: Arc<dyn JobHandler>,
    pub concurrency: usize,
}

/// Registry mapping `(queue, job_type)` to handler bindings.
///
/// A job type with no binding is never picked up; its jobs stay waiting.
#[derive(Default)]
pub struct HandlerRegistry {
    bindings: HashMap<(String, String), HandlerBinding>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler. Rebinding an already-registered pair is a
    /// configuration error.
    pub fn register(
        &mut self,
        queue: impl Into<String>,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> QueueResult<()> {
        let key = (queue.into(), job_type.into());
        if self.bindings.contains_key(&key) {
            return Err(QueueError::Validation(format!(
                "handler already registered for {}/{}",
                key.0, key.1
            )));
        }
        self.bindings.insert(key, HandlerBinding { handler, concurrency: concurrency.max(1) });
        Ok(())
    }

    pub fn get(&self, queue: &str, job_type: &str) -> Option<&HandlerBinding> {
        self.bindings.get(&(queue.to_string(), job_type.to_string()))
    }

    pub fn is_registered(&self, queue: &str, job_type: &str) -> bool {
        self.get(queue, job_type).is_some()
    }

    /// All bindings, for worker pool startup
    pub fn bindings(&self) -> impl Iterator<Item = (&(String, String), &HandlerBinding)> {
        self.bindings.iter()
    }
}
