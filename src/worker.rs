use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    broker::ClaimedJob,
    error::{JobError, QueueResult},
    manager::{JobDispatcher, Shared},
    registry::{JobContext, JobHandler, ProgressHandle},
    types::{ClaimToken, JobRecord},
};

/// Pause after a broker error before a slot polls again
const BROKER_RETRY_PAUSE: Duration = Duration::from_secs(1);

/// Bounded set of concurrent execution slots for one `(queue, job_type)`
/// binding. Each slot claims eligible jobs, runs the handler, and always
/// acknowledges the outcome; a failing or panicking handler can never take
/// the slot down with it.
pub(crate) struct WorkerPool {
    queue: String,
    job_type: String,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        queue: String,
        job_type: String,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..concurrency)
            .map(|slot| {
                tokio::spawn(slot_loop(
                    shared.clone(),
                    queue.clone(),
                    job_type.clone(),
                    handler.clone(),
                    poll_interval,
                    shutdown.clone(),
                    slot,
                ))
            })
            .collect();

        info!(queue = %queue, job_type = %job_type, concurrency, "worker pool started");
        Self { queue, job_type, shutdown, handles }
    }

    /// Signal every slot to stop after its current job
    pub(crate) fn begin_shutdown(&self) {
        debug!(queue = %self.queue, job_type = %self.job_type, "worker pool shutting down");
        self.shutdown.cancel();
    }

    /// Wait for all slots to finish
    pub(crate) async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn slot_loop(
    shared: Arc<Shared>,
    queue: String,
    job_type: String,
    handler: Arc<dyn JobHandler>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    slot: usize,
) {
    debug!(queue = %queue, job_type = %job_type, slot, "worker slot running");

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        match shared.broker.claim(&queue, &job_type).await {
            Ok(Some(claimed)) => run_job(&shared, &handler, claimed).await,
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
            Err(err) => {
                error!(error = %err, queue = %queue, job_type = %job_type, "broker claim failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(BROKER_RETRY_PAUSE) => {}
                }
            }
        }
    }

    debug!(queue = %queue, job_type = %job_type, slot, "worker slot stopped");
}

/// Execute one claimed job and acknowledge the outcome. The slot is
/// released whatever happens inside the handler.
async fn run_job(shared: &Arc<Shared>, handler: &Arc<dyn JobHandler>, claimed: ClaimedJob) {
    let ClaimedJob { record, token } = claimed;
    let job_id = record.id.clone();
    let queue = record.queue.clone();

    let cancellation = CancellationToken::new();
    shared.active.insert(job_id.clone(), cancellation.clone());

    // A cancel request may have landed between the claim and the token
    // registration above; the broker-side flag closes that window.
    if let Ok(fresh) = shared.broker.job(&queue, &job_id).await {
        if fresh.cancel_requested {
            cancellation.cancel();
        }
    }

    // Progress updates flow through a bounded channel and are applied in
    // order; the forwarder dies as soon as the claim goes stale.
    let (progress, mut progress_rx) = ProgressHandle::channel();
    let forwarder = tokio::spawn({
        let broker = shared.broker.clone();
        let queue = queue.clone();
        let job_id = job_id.clone();
        let token = token.clone();
        async move {
            while let Some(update) = progress_rx.recv().await {
                if broker.record_progress(&queue, &job_id, &token, update).await.is_err() {
                    break;
                }
            }
        }
    });

    let ctx = JobContext::new(
        job_id.clone(),
        queue.clone(),
        record.job_type.clone(),
        record.attempts_made,
        record.data.clone(),
        progress,
        cancellation,
        JobDispatcher::new(shared.clone()),
    );

    let started = Instant::now();
    let outcome = AssertUnwindSafe(handler.execute(ctx)).catch_unwind().await;

    let ack = match outcome {
        Ok(Ok(result)) => {
            let ack = shared.broker.complete(&queue, &job_id, &token, result).await;
            if ack.is_ok() {
                shared.metrics.job_completed(&queue);
                info!(
                    job_id = %job_id,
                    queue = %queue,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job completed"
                );
            }
            ack
        }
        Ok(Err(job_error)) => {
            acknowledge_failure(shared, &record, &token, job_error).await
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            acknowledge_failure(shared, &record, &token, JobError::Permanent(reason)).await
        }
    };

    if let Err(err) = ack {
        error!(error = %err, job_id = %job_id, "failed to acknowledge job outcome");
    }

    forwarder.abort();
    shared.active.remove(&job_id);
}

/// Decide between a delayed retry and a terminal failure.
async fn acknowledge_failure(
    shared: &Arc<Shared>,
    record: &JobRecord,
    token: &ClaimToken,
    job_error: JobError,
) -> QueueResult<()> {
    let attempts = record.attempts_made;
    let max_attempts = record.options.max_attempts;
    let reason = job_error.message().to_string();

    if job_error.is_retryable() && attempts < max_attempts {
        let delay = record.options.backoff.delay_for(attempts);
        let retry_at =
            Utc::now() + chrono::Duration::milliseconds(delay.as_millis().min(i64::MAX as u128) as i64);

        shared
            .broker
            .fail(&record.queue, &record.id, token, reason.clone(), Some(retry_at))
            .await?;
        shared.metrics.job_retried(&record.queue);
        warn!(
            job_id = %record.id,
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %reason,
            "job failed, retry scheduled"
        );
    } else {
        shared.broker.fail(&record.queue, &record.id, token, reason.clone(), None).await?;
        shared.metrics.job_failed(&record.queue);
        error!(
            job_id = %record.id,
            attempts,
            error = %reason,
            "job failed terminally"
        );
    }
    Ok(())
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
