use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
    broker::{Broker, CancelOutcome, StateCounts, StateFilter},
    error::{QueueError, QueueResult},
    observability::{ChainTracker, LiveMetrics},
    registry::{HandlerRegistry, JobHandler},
    types::{JobId, JobOptions, JobOptionsPatch, JobRecord, JobSummary, JobView},
    worker::WorkerPool,
};

/// Tuning knobs for the manager and its worker pools
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long an idle worker slot waits before polling the broker again
    pub poll_interval: Duration,

    /// How long `shutdown` waits for in-flight jobs to drain
    pub shutdown_grace: Duration,

    /// Options applied to queues registered without explicit defaults
    pub default_job_options: JobOptions,

    /// Ring capacity per tracked job chain
    pub chain_capacity: usize,

    /// Maximum number of concurrently tracked chains
    pub max_chains: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(30),
            default_job_options: JobOptions::default(),
            chain_capacity: 64,
            max_chains: 1_000,
        }
    }
}

/// A registered queue: its name and the defaults merged into every job
#[derive(Debug, Clone)]
pub struct Queue {
    pub name: String,
    pub default_options: JobOptions,
}

/// Outcome of a cancel request as reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelResult {
    /// The job never started and has been removed
    Removed,

    /// The job is active; its cancellation token has been triggered and the
    /// handler is expected to wind down cooperatively
    CancellationRequested,

    /// The job already reached a terminal state
    AlreadyFinished,
}

/// State shared between the manager, its worker pools, and dispatchers
pub(crate) struct Shared {
    pub(crate) broker: Arc<dyn Broker>,
    pub(crate) queues: RwLock<HashMap<String, JobOptions>>,
    pub(crate) registry: RwLock<HandlerRegistry>,

    /// Cancellation tokens of currently active jobs, keyed by job id
    pub(crate) active: DashMap<JobId, CancellationToken>,

    pub(crate) accepting: AtomicBool,
    pub(crate) metrics: LiveMetrics,
}

/// Lightweight enqueue handle.
///
/// Handlers receive a clone through their [`crate::registry::JobContext`] so
/// multi-stage flows can chain follow-up jobs without holding the manager.
#[derive(Clone)]
pub struct JobDispatcher {
    shared: Arc<Shared>,
}

impl JobDispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Validate, merge options with queue defaults, and push the job. Returns
    /// as soon as the broker stored it; execution happens asynchronously.
    #[instrument(skip(self, data, options), fields(queue = %queue, job_type = %job_type))]
    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        data: Value,
        options: JobOptionsPatch,
    ) -> QueueResult<JobView> {
        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(QueueError::ShuttingDown);
        }
        if queue.trim().is_empty() {
            return Err(QueueError::Validation("queue is required".to_string()));
        }
        if job_type.trim().is_empty() {
            return Err(QueueError::Validation("type is required".to_string()));
        }
        if data.is_null() {
            return Err(QueueError::Validation("data is required".to_string()));
        }

        let defaults = self
            .shared
            .queues
            .read()
            .get(queue)
            .cloned()
            .ok_or_else(|| QueueError::QueueNotRegistered(queue.to_string()))?;

        if !self.shared.registry.read().is_registered(queue, job_type) {
            // Permitted: the job stays waiting until a handler appears.
            warn!(queue, job_type, "enqueue for job type with no registered handler");
        }

        let merged = defaults.merged(&options);
        let record = JobRecord::new(queue, job_type, data, merged);
        let view = record.view();
        self.shared.broker.push(record).await?;
        self.shared.metrics.job_enqueued(queue);

        info!(job_id = %view.id, status = %view.status, "job enqueued");
        Ok(view)
    }
}

/// Single entry point for queue registration, job submission, and
/// control-plane queries.
///
/// Constructed once at process start and shared by reference; `connect` and
/// `shutdown` make the lifecycle explicit.
pub struct QueueManager {
    shared: Arc<Shared>,
    config: ManagerConfig,
    chain: Arc<ChainTracker>,
    pools: Mutex<Vec<WorkerPool>>,
    started: AtomicBool,
}

impl QueueManager {
    /// Connect to the broker and build the manager. Fails fast with
    /// `BrokerUnavailable` when the broker cannot be reached; there is no
    /// degraded mode.
    pub async fn connect(broker: Arc<dyn Broker>, config: ManagerConfig) -> QueueResult<Self> {
        broker
            .ping()
            .await
            .map_err(|err| QueueError::BrokerUnavailable(err.to_string()))?;

        let chain = ChainTracker::start(broker.events(), config.chain_capacity, config.max_chains);
        let shared = Arc::new(Shared {
            broker,
            queues: RwLock::new(HashMap::new()),
            registry: RwLock::new(HandlerRegistry::new()),
            active: DashMap::new(),
            accepting: AtomicBool::new(true),
            metrics: LiveMetrics::new(),
        });

        info!("queue manager connected");
        Ok(Self {
            shared,
            config,
            chain,
            pools: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Register a queue. Idempotent: a second registration under the same
    /// name returns the existing queue, keeping its original defaults.
    pub fn register_queue(&self, name: impl Into<String>, defaults: JobOptions) -> Queue {
        let name = name.into();
        let mut queues = self.shared.queues.write();
        let options = queues.entry(name.clone()).or_insert(defaults).clone();
        Queue { name, default_options: options }
    }

    /// Register a queue with the manager-wide default options
    pub fn register_default_queue(&self, name: impl Into<String>) -> Queue {
        self.register_queue(name, self.config.default_job_options.clone())
    }

    /// Bind a handler for `(queue, job_type)` with a concurrency limit.
    /// Must happen before `start`, so every pool exists when jobs begin
    /// to flow.
    pub fn register_handler(
        &self,
        queue: &str,
        job_type: &str,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
    ) -> QueueResult<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(QueueError::Validation(
                "handlers must be registered before the manager is started".to_string(),
            ));
        }
        if !self.shared.queues.read().contains_key(queue) {
            return Err(QueueError::QueueNotRegistered(queue.to_string()));
        }
        self.shared.registry.write().register(queue, job_type, handler, concurrency)
    }

    /// Spawn a worker pool for every registered handler binding
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let registry = self.shared.registry.read();
        let mut pools = self.pools.lock();
        for ((queue, job_type), binding) in registry.bindings() {
            pools.push(WorkerPool::spawn(
                self.shared.clone(),
                queue.clone(),
                job_type.clone(),
                binding.handler.clone(),
                binding.concurrency,
                self.config.poll_interval,
            ));
        }
        info!(pools = pools.len(), "worker pools started");
    }

    /// Enqueue handle that can be cloned into handlers and other tasks
    pub fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher { shared: self.shared.clone() }
    }

    /// Submit a job; see [`JobDispatcher::enqueue`]
    pub async fn enqueue(
        &self,
        queue: &str,
        job_type: &str,
        data: Value,
        options: JobOptionsPatch,
    ) -> QueueResult<JobView> {
        self.dispatcher().enqueue(queue, job_type, data, options).await
    }

    /// Read-only snapshot of one job
    pub async fn job_view(&self, queue: &str, job_id: &JobId) -> QueueResult<JobView> {
        Ok(self.shared.broker.job(queue, job_id).await?.view())
    }

    /// Paginated listing of a queue's jobs in one state
    pub async fn list_jobs(
        &self,
        queue: &str,
        filter: StateFilter,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<JobSummary>> {
        let records = self.shared.broker.list(queue, filter, offset, limit).await?;
        Ok(records.iter().map(JobRecord::summary).collect())
    }

    /// Cancel a job. Authoritative for waiting and delayed jobs; for active
    /// jobs only the cooperative cancellation token is triggered, and
    /// running handlers are never killed.
    #[instrument(skip(self), fields(queue = %queue, job_id = %job_id))]
    pub async fn cancel(&self, queue: &str, job_id: &JobId) -> QueueResult<CancelResult> {
        match self.shared.broker.cancel(queue, job_id).await? {
            CancelOutcome::Removed => {
                self.shared.metrics.job_cancelled(queue);
                info!("job cancelled before pickup");
                Ok(CancelResult::Removed)
            }
            CancelOutcome::Active => {
                if let Some(entry) = self.shared.active.get(job_id) {
                    entry.value().cancel();
                }
                info!("cooperative cancellation requested for active job");
                Ok(CancelResult::CancellationRequested)
            }
            CancelOutcome::AlreadyTerminal => Ok(CancelResult::AlreadyFinished),
        }
    }

    /// Per-state counts, for one queue or for every registered queue
    pub async fn stats(&self, queue: Option<&str>) -> QueueResult<HashMap<String, StateCounts>> {
        let names: Vec<String> = match queue {
            Some(name) => {
                if !self.shared.queues.read().contains_key(name) {
                    return Err(QueueError::QueueNotRegistered(name.to_string()));
                }
                vec![name.to_string()]
            }
            None => self.shared.queues.read().keys().cloned().collect(),
        };

        let mut stats = HashMap::with_capacity(names.len());
        for name in names {
            let counts = self.shared.broker.counts(&name).await?;
            stats.insert(name, counts);
        }
        Ok(stats)
    }

    /// Whether the broker currently answers pings
    pub async fn broker_connected(&self) -> bool {
        self.shared.broker.ping().await.is_ok()
    }

    /// Live execution counters
    pub fn metrics(&self) -> &LiveMetrics {
        &self.shared.metrics
    }

    /// The chain tracker fed by this manager's broker events
    pub fn chain(&self) -> &ChainTracker {
        &self.chain
    }

    /// Stop accepting new work, drain in-flight jobs within the configured
    /// grace period, then close the broker connection.
    pub async fn shutdown(&self) -> QueueResult<()> {
        self.shared.accepting.store(false, Ordering::SeqCst);

        let pools: Vec<WorkerPool> = std::mem::take(&mut *self.pools.lock());
        for pool in &pools {
            pool.begin_shutdown();
        }

        let drain = futures::future::join_all(pools.into_iter().map(WorkerPool::join));
        if tokio::time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            warn!(
                grace_secs = self.config.shutdown_grace.as_secs(),
                "shutdown grace elapsed with jobs still in flight"
            );
        }

        self.chain.stop();
        self.shared.broker.close().await?;
        info!("queue manager shut down");
        Ok(())
    }
}
