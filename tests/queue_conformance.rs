use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::Notify;

use essentials_queue::{
    jobs::{
        clients::{AnalysisClient, ChatClient, MessageBatch, TaskSink},
        ChannelSyncHandler, MessageAnalysisHandler, AI_ANALYSIS_QUEUE, SLACK_SYNC_QUEUE,
        SYNC_CHANNEL_JOB, TASK_DETECTION_JOB,
    },
    BackoffPolicy, CancelResult, JobContext, JobError, JobHandler, JobId, JobOptions,
    JobOptionsPatch, JobView, ManagerConfig, MemoryBroker, QueueError, QueueManager,
};

const POLL: Duration = Duration::from_millis(10);

fn test_config() -> ManagerConfig {
    ManagerConfig {
        poll_interval: POLL,
        shutdown_grace: Duration::from_secs(2),
        ..ManagerConfig::default()
    }
}

async fn manager() -> QueueManager {
    QueueManager::connect(Arc::new(MemoryBroker::new()), test_config()).await.unwrap()
}

fn options(max_attempts: u32, backoff: BackoffPolicy) -> JobOptions {
    JobOptions { max_attempts, backoff, ..JobOptions::default() }
}

async fn wait_for<F>(manager: &QueueManager, queue: &str, id: &JobId, predicate: F) -> JobView
where
    F: Fn(&JobView) -> bool,
{
    for _ in 0..500 {
        if let Ok(view) = manager.job_view(queue, id).await {
            if predicate(&view) {
                return view;
            }
        }
        tokio::time::sleep(POLL).await;
    }
    panic!("job {id} never reached the expected state");
}

async fn wait_terminal(manager: &QueueManager, queue: &str, id: &JobId) -> JobView {
    wait_for(manager, queue, id, |view| {
        matches!(view.status.as_str(), "completed" | "failed" | "cancelled")
    })
    .await
}

struct AlwaysFails {
    attempts: Arc<AtomicU32>,
    attempt_times: Arc<Mutex<Vec<Instant>>>,
}

impl AlwaysFails {
    fn new() -> Self {
        Self { attempts: Arc::new(AtomicU32::new(0)), attempt_times: Arc::new(Mutex::new(Vec::new())) }
    }
}

#[async_trait]
impl JobHandler for AlwaysFails {
    async fn execute(&self, _ctx: JobContext) -> Result<Value, JobError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        self.attempt_times.lock().push(Instant::now());
        Err(JobError::retryable(format!("simulated failure {attempt}")))
    }
}

struct RecordsName {
    order: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl JobHandler for RecordsName {
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        let name = ctx.data["name"].as_str().unwrap_or("?").to_string();
        self.order.lock().push(name);
        Ok(json!({"ok": true}))
    }
}

/// N attempts for a handler that always fails, then terminal failure
#[tokio::test]
async fn failing_job_runs_exactly_max_attempts() {
    let manager = manager().await;
    manager.register_queue("sync", options(3, BackoffPolicy::Fixed { base_delay_ms: 10 }));

    let handler = AlwaysFails::new();
    let attempts = handler.attempts.clone();
    manager.register_handler("sync", "sync-channel", Arc::new(handler), 1).unwrap();
    manager.start();

    let job = manager
        .enqueue("sync", "sync-channel", json!({"channelId": "C1"}), JobOptionsPatch::default())
        .await
        .unwrap();

    let view = wait_terminal(&manager, "sync", &job.id).await;
    assert_eq!(view.status, "failed");
    assert_eq!(view.attempts_made, 3);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(view.failed_reason.as_deref(), Some("simulated failure 3"));

    manager.shutdown().await.unwrap();
}

/// Two attempts, two failures, failure reason is the last error's message
#[tokio::test]
async fn per_job_attempts_override_applies() {
    let manager = manager().await;
    manager.register_queue("sync", options(5, BackoffPolicy::Fixed { base_delay_ms: 10 }));
    manager.register_handler("sync", "sync-channel", Arc::new(AlwaysFails::new()), 1).unwrap();
    manager.start();

    let patch = JobOptionsPatch { max_attempts: Some(2), ..JobOptionsPatch::default() };
    let job = manager.enqueue("sync", "sync-channel", json!({}), patch).await.unwrap();

    let view = wait_terminal(&manager, "sync", &job.id).await;
    assert_eq!(view.status, "failed");
    assert_eq!(view.attempts_made, 2);
    assert_eq!(view.failed_reason.as_deref(), Some("simulated failure 2"));

    manager.shutdown().await.unwrap();
}

/// Retry delays grow as `base * 2^(k-1)` under exponential backoff
#[tokio::test]
async fn exponential_backoff_doubles_between_attempts() {
    let manager = manager().await;
    manager.register_queue("sync", options(3, BackoffPolicy::Exponential { base_delay_ms: 60 }));

    let handler = AlwaysFails::new();
    let attempt_times = handler.attempt_times.clone();
    manager.register_handler("sync", "sync-channel", Arc::new(handler), 1).unwrap();
    manager.start();

    let job = manager
        .enqueue("sync", "sync-channel", json!({}), JobOptionsPatch::default())
        .await
        .unwrap();
    wait_terminal(&manager, "sync", &job.id).await;

    let times = attempt_times.lock().clone();
    assert_eq!(times.len(), 3);
    let first_gap = times[1] - times[0];
    let second_gap = times[2] - times[1];
    assert!(first_gap >= Duration::from_millis(60), "first retry came after {first_gap:?}");
    assert!(second_gap >= Duration::from_millis(120), "second retry came after {second_gap:?}");
    assert!(second_gap > first_gap);

    manager.shutdown().await.unwrap();
}

/// With one slot, the higher-priority job is dispatched first even when
/// enqueued second
#[tokio::test]
async fn priority_beats_enqueue_order() {
    let manager = manager().await;
    manager.register_queue("sync", JobOptions::default());

    let order = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_handler("sync", "sync-channel", Arc::new(RecordsName { order: order.clone() }), 1)
        .unwrap();

    // Both jobs are queued before any worker runs.
    let low = manager
        .enqueue(
            "sync",
            "sync-channel",
            json!({"name": "A"}),
            JobOptionsPatch { priority: Some(1), ..JobOptionsPatch::default() },
        )
        .await
        .unwrap();
    let high = manager
        .enqueue(
            "sync",
            "sync-channel",
            json!({"name": "B"}),
            JobOptionsPatch { priority: Some(5), ..JobOptionsPatch::default() },
        )
        .await
        .unwrap();

    manager.start();
    wait_terminal(&manager, "sync", &low.id).await;
    wait_terminal(&manager, "sync", &high.id).await;

    assert_eq!(*order.lock(), vec!["B".to_string(), "A".to_string()]);

    manager.shutdown().await.unwrap();
}

/// A cancelled waiting job is removed and never dispatched
#[tokio::test]
async fn cancelled_job_is_never_dispatched() {
    let manager = manager().await;
    manager.register_queue("sync", JobOptions::default());

    let order = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_handler("sync", "sync-channel", Arc::new(RecordsName { order: order.clone() }), 1)
        .unwrap();

    let patch = JobOptionsPatch { delay_ms: Some(150), ..JobOptionsPatch::default() };
    let job = manager.enqueue("sync", "sync-channel", json!({"name": "X"}), patch).await.unwrap();

    let result = manager.cancel("sync", &job.id).await.unwrap();
    assert_eq!(result, CancelResult::Removed);

    manager.start();
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(order.lock().is_empty());
    let err = manager.job_view("sync", &job.id).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(_)));

    manager.shutdown().await.unwrap();
}

/// Jobs of a type with no handler stay waiting indefinitely
#[tokio::test]
async fn unregistered_type_stays_waiting() {
    let manager = manager().await;
    manager.register_queue("background-sync", JobOptions::default());
    manager.register_queue("sync", JobOptions::default());
    manager.register_handler("sync", "sync-channel", Arc::new(AlwaysFails::new()), 1).unwrap();
    manager.start();

    let job = manager
        .enqueue("background-sync", "mystery-type", json!({"x": 1}), JobOptionsPatch::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    let view = manager.job_view("background-sync", &job.id).await.unwrap();
    assert_eq!(view.status, "waiting");
    assert_eq!(view.attempts_made, 0);

    manager.shutdown().await.unwrap();
}

struct FixedAnalysis;

#[async_trait]
impl AnalysisClient for FixedAnalysis {
    async fn detect_tasks(
        &self,
        messages: &[Value],
        _project_context: Option<&Value>,
    ) -> Result<Value, JobError> {
        Ok(json!({"tasks": [{"title": "Review the deck", "sourceMessages": messages.len()}]}))
    }
}

struct NullSink;

#[async_trait]
impl TaskSink for NullSink {
    async fn store_tasks(&self, _project_id: Option<&str>, _tasks: &Value) -> Result<(), QueueError> {
        Ok(())
    }
}

struct OnePageChat;

#[async_trait]
impl ChatClient for OnePageChat {
    async fn fetch_messages(
        &self,
        _channel_id: &str,
        _oldest: Option<u64>,
        _cursor: Option<&str>,
    ) -> Result<MessageBatch, JobError> {
        Ok(MessageBatch {
            messages: vec![json!({"text": "can you review the deck?"})],
            next_cursor: None,
        })
    }
}

/// The analysis scenario: waiting → active → completed with tasks in the
/// result
#[tokio::test]
async fn task_detection_completes_with_tasks() {
    let manager = manager().await;
    manager.register_queue(AI_ANALYSIS_QUEUE, JobOptions::default());
    manager
        .register_handler(
            AI_ANALYSIS_QUEUE,
            TASK_DETECTION_JOB,
            Arc::new(MessageAnalysisHandler::new(Arc::new(FixedAnalysis), Arc::new(NullSink))),
            2,
        )
        .unwrap();
    manager.start();

    let job = manager
        .enqueue(
            AI_ANALYSIS_QUEUE,
            TASK_DETECTION_JOB,
            json!({"messages": [{"text": "can you review the deck?"}]}),
            JobOptionsPatch { priority: Some(2), ..JobOptionsPatch::default() },
        )
        .await
        .unwrap();
    assert!(!job.id.as_str().is_empty());

    let view = wait_terminal(&manager, AI_ANALYSIS_QUEUE, &job.id).await;
    assert_eq!(view.status, "completed");
    let tasks = view.result.unwrap()["tasks"].as_array().unwrap().clone();
    assert!(!tasks.is_empty());

    manager.shutdown().await.unwrap();
}

/// A channel sync chains an analysis job, and the chain tracker groups the
/// whole flow under the sync job's id
#[tokio::test]
async fn sync_flow_is_traceable_end_to_end() {
    let manager = manager().await;
    manager.register_queue(SLACK_SYNC_QUEUE, JobOptions::default());
    manager.register_queue(AI_ANALYSIS_QUEUE, JobOptions::default());
    manager
        .register_handler(
            SLACK_SYNC_QUEUE,
            SYNC_CHANNEL_JOB,
            Arc::new(ChannelSyncHandler::new(Arc::new(OnePageChat))),
            1,
        )
        .unwrap();
    manager
        .register_handler(
            AI_ANALYSIS_QUEUE,
            TASK_DETECTION_JOB,
            Arc::new(MessageAnalysisHandler::new(Arc::new(FixedAnalysis), Arc::new(NullSink))),
            1,
        )
        .unwrap();
    manager.start();

    let sync = manager
        .enqueue(
            SLACK_SYNC_QUEUE,
            SYNC_CHANNEL_JOB,
            json!({"channelId": "C42", "projectId": "p-1"}),
            JobOptionsPatch::default(),
        )
        .await
        .unwrap();

    let sync_view = wait_terminal(&manager, SLACK_SYNC_QUEUE, &sync.id).await;
    assert_eq!(sync_view.status, "completed");
    let result = sync_view.result.unwrap();
    let analysis_id = JobId::from(result["analysisJobId"].as_str().unwrap());

    let analysis_view = wait_terminal(&manager, AI_ANALYSIS_QUEUE, &analysis_id).await;
    assert_eq!(analysis_view.status, "completed");

    // The tracker consumes events asynchronously; give it a beat.
    let mut chain = Vec::new();
    for _ in 0..100 {
        if let Some(entries) = manager.chain().chain(sync.id.as_str()) {
            if entries.iter().any(|entry| entry.event == "completed") {
                chain = entries;
                break;
            }
        }
        tokio::time::sleep(POLL).await;
    }

    assert!(!chain.is_empty(), "no chain recorded for the sync flow");
    assert!(chain.iter().all(|entry| entry.stage == AI_ANALYSIS_QUEUE));
    let events: Vec<&str> = chain.iter().map(|entry| entry.event.as_str()).collect();
    assert!(events.contains(&"enqueued"));
    assert!(events.contains(&"completed"));

    assert!(manager.chain().clear(sync.id.as_str()));
    assert!(manager.chain().chain(sync.id.as_str()).is_none());

    manager.shutdown().await.unwrap();
}

/// At quiescence the per-state counts add up to every retained and pending
/// job
#[tokio::test]
async fn stats_are_consistent_at_quiescence() {
    let manager = manager().await;
    manager.register_queue("sync", options(1, BackoffPolicy::Fixed { base_delay_ms: 10 }));

    let order = Arc::new(Mutex::new(Vec::new()));
    manager
        .register_handler("sync", "sync-channel", Arc::new(RecordsName { order: order.clone() }), 1)
        .unwrap();
    manager.register_handler("sync", "always-fails", Arc::new(AlwaysFails::new()), 1).unwrap();
    manager.start();

    let completed_a = manager
        .enqueue("sync", "sync-channel", json!({"name": "a"}), JobOptionsPatch::default())
        .await
        .unwrap();
    let completed_b = manager
        .enqueue("sync", "sync-channel", json!({"name": "b"}), JobOptionsPatch::default())
        .await
        .unwrap();
    let failed = manager
        .enqueue("sync", "always-fails", json!({}), JobOptionsPatch::default())
        .await
        .unwrap();
    let waiting = manager
        .enqueue("sync", "no-handler-type", json!({}), JobOptionsPatch::default())
        .await
        .unwrap();
    let delayed = manager
        .enqueue(
            "sync",
            "sync-channel",
            json!({"name": "late"}),
            JobOptionsPatch { delay_ms: Some(60_000), ..JobOptionsPatch::default() },
        )
        .await
        .unwrap();

    wait_terminal(&manager, "sync", &completed_a.id).await;
    wait_terminal(&manager, "sync", &completed_b.id).await;
    wait_terminal(&manager, "sync", &failed.id).await;

    let stats = manager.stats(Some("sync")).await.unwrap();
    let counts = stats["sync"];
    assert_eq!(counts.completed, 2);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.waiting, 1);
    assert_eq!(counts.delayed, 1);
    assert_eq!(counts.active, 0);
    assert_eq!(counts.total(), 5);

    // The waiting and delayed jobs are still retrievable.
    assert!(manager.job_view("sync", &waiting.id).await.is_ok());
    assert!(manager.job_view("sync", &delayed.id).await.is_ok());

    manager.shutdown().await.unwrap();
}

struct Gated {
    release: Arc<Notify>,
}

#[async_trait]
impl JobHandler for Gated {
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        ctx.progress().percent(25);
        ctx.progress().percent(75);
        self.release.notified().await;
        Ok(json!({"done": true}))
    }
}

/// Progress reported by the owning handler becomes visible in status views
#[tokio::test]
async fn progress_updates_are_observable() {
    let manager = manager().await;
    manager.register_queue("sync", JobOptions::default());

    let release = Arc::new(Notify::new());
    manager
        .register_handler("sync", "sync-channel", Arc::new(Gated { release: release.clone() }), 1)
        .unwrap();
    manager.start();

    let job = manager
        .enqueue("sync", "sync-channel", json!({}), JobOptionsPatch::default())
        .await
        .unwrap();

    let view = wait_for(&manager, "sync", &job.id, |view| {
        view.progress == essentials_queue::Progress::percent(75)
    })
    .await;
    assert_eq!(view.status, "active");

    release.notify_one();
    let view = wait_terminal(&manager, "sync", &job.id).await;
    assert_eq!(view.status, "completed");

    manager.shutdown().await.unwrap();
}

struct CancellationAware;

#[async_trait]
impl JobHandler for CancellationAware {
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        for _ in 0..200 {
            if ctx.is_cancelled() {
                return Ok(json!({"wound_down": true}));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(json!({"wound_down": false}))
    }
}

/// Cancelling an active job only requests cooperative wind-down
#[tokio::test]
async fn active_cancellation_is_cooperative() {
    let manager = manager().await;
    manager.register_queue("sync", JobOptions::default());
    manager.register_handler("sync", "sync-channel", Arc::new(CancellationAware), 1).unwrap();
    manager.start();

    let job = manager
        .enqueue("sync", "sync-channel", json!({}), JobOptionsPatch::default())
        .await
        .unwrap();

    wait_for(&manager, "sync", &job.id, |view| view.status == "active").await;
    let result = manager.cancel("sync", &job.id).await.unwrap();
    assert_eq!(result, CancelResult::CancellationRequested);

    let view = wait_terminal(&manager, "sync", &job.id).await;
    assert_eq!(view.status, "completed");
    assert_eq!(view.result.unwrap()["wound_down"], json!(true));

    manager.shutdown().await.unwrap();
}

struct Slow {
    finished: Arc<AtomicU32>,
}

#[async_trait]
impl JobHandler for Slow {
    async fn execute(&self, _ctx: JobContext) -> Result<Value, JobError> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"slept": true}))
    }
}

/// Shutdown drains in-flight jobs before closing the broker
#[tokio::test]
async fn shutdown_waits_for_in_flight_jobs() {
    let manager = manager().await;
    manager.register_queue("sync", JobOptions::default());

    let finished = Arc::new(AtomicU32::new(0));
    manager
        .register_handler("sync", "sync-channel", Arc::new(Slow { finished: finished.clone() }), 1)
        .unwrap();
    manager.start();

    let job = manager
        .enqueue("sync", "sync-channel", json!({}), JobOptionsPatch::default())
        .await
        .unwrap();
    wait_for(&manager, "sync", &job.id, |view| view.status == "active").await;

    manager.shutdown().await.unwrap();
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(manager.metrics().queue("sync").completed, 1);

    let err = manager
        .enqueue("sync", "sync-channel", json!({}), JobOptionsPatch::default())
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::ShuttingDown));
}
