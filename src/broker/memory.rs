use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};

use crate::{
    broker::{BoxStream, Broker, CancelOutcome, ClaimedJob, StateCounts, StateFilter},
    config::BrokerConfig,
    error::{QueueError, QueueResult},
    types::{ClaimToken, JobEvent, JobId, JobRecord, JobState, Progress},
};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Per-queue bookkeeping: pending ids plus FIFO retention of terminal jobs
#[derive(Default)]
struct QueueSlot {
    /// Waiting and delayed job ids, in enqueue order
    pending: Vec<JobId>,

    /// Completed job ids, oldest first, pruned past `retain_on_complete`
    completed: VecDeque<JobId>,

    /// Terminally failed job ids, oldest first, pruned past `retain_on_fail`
    failed: VecDeque<JobId>,
}

#[derive(Default)]
struct BrokerState {
    jobs: HashMap<JobId, JobRecord>,
    queues: HashMap<String, QueueSlot>,
}

/// In-memory broker for the single-process deployment target.
///
/// All state lives behind one lock, so claim/ack sequences observe a
/// consistent snapshot and a job can only ever be claimed once per attempt.
pub struct MemoryBroker {
    state: RwLock<BrokerState>,
    events: broadcast::Sender<JobEvent>,
    seq: AtomicU64,
    closed: AtomicBool,
}

impl MemoryBroker {
    /// Open a broker connection for the configured endpoint. The in-memory
    /// implementation has nothing to dial; the endpoint is logged so
    /// deployments swapping in a networked broker keep the same wiring.
    pub fn connect(config: &BrokerConfig) -> Self {
        tracing::info!(host = %config.host, port = config.port, "opening in-memory broker");
        Self::new()
    }

    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(BrokerState::default()),
            events,
            seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::BrokerUnavailable("connection closed".to_string()));
        }
        Ok(())
    }

    fn emit(&self, event: JobEvent) {
        // Nobody listening is fine; observers are strictly passive.
        let _ = self.events.send(event);
    }

    /// Look up a record, enforcing that it belongs to the named queue.
    fn record_mut<'a>(
        state: &'a mut BrokerState,
        queue: &str,
        job_id: &JobId,
    ) -> QueueResult<&'a mut JobRecord> {
        let record = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if record.queue != queue {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        }
        Ok(record)
    }

    /// Verify the caller still owns the job.
    fn check_claim(record: &JobRecord, token: &ClaimToken) -> QueueResult<()> {
        if !record.state.is_active() || record.claim.as_ref() != Some(token) {
            return Err(QueueError::StaleClaim(record.id.to_string()));
        }
        Ok(())
    }

    /// Prune a terminal-retention list down to `retain`, dropping the oldest
    /// records from the job map (FIFO eviction).
    fn prune(jobs: &mut HashMap<JobId, JobRecord>, list: &mut VecDeque<JobId>, retain: usize) {
        while list.len() > retain {
            if let Some(evicted) = list.pop_front() {
                jobs.remove(&evicted);
            }
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> QueueResult<()> {
        self.ensure_open()
    }

    async fn push(&self, mut record: JobRecord) -> QueueResult<()> {
        self.ensure_open()?;

        record.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let event = JobEvent::Enqueued {
            job_id: record.id.clone(),
            queue: record.queue.clone(),
            job_type: record.job_type.clone(),
            data: record.data.clone(),
            at: Utc::now(),
        };

        let mut state = self.state.write();
        let slot = state.queues.entry(record.queue.clone()).or_default();
        slot.pending.push(record.id.clone());
        state.jobs.insert(record.id.clone(), record);
        drop(state);

        self.emit(event);
        Ok(())
    }

    async fn claim(&self, queue: &str, job_type: &str) -> QueueResult<Option<ClaimedJob>> {
        self.ensure_open()?;
        let now = Utc::now();

        let (claimed, event) = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let Some(slot) = state.queues.get_mut(queue) else {
                return Ok(None);
            };

            // Highest priority first, enqueue order within equal priority.
            let mut best: Option<(usize, i32, u64)> = None;
            for (index, job_id) in slot.pending.iter().enumerate() {
                let Some(record) = state.jobs.get(job_id) else {
                    continue;
                };
                if record.job_type != job_type || !record.state.is_eligible(now) {
                    continue;
                }
                let candidate = (index, record.options.priority, record.seq);
                best = match best {
                    None => Some(candidate),
                    Some((_, priority, seq))
                        if candidate.1 > priority
                            || (candidate.1 == priority && candidate.2 < seq) =>
                    {
                        Some(candidate)
                    }
                    other => other,
                };
            }

            let Some((index, _, _)) = best else {
                return Ok(None);
            };

            let job_id = slot.pending.remove(index);
            let record = state.jobs.get_mut(&job_id).ok_or_else(|| {
                QueueError::Internal(format!("pending id {job_id} has no record"))
            })?;

            let token = ClaimToken::new();
            record.begin_attempt(token.clone());
            let claimed = ClaimedJob { record: record.clone(), token };
            let event = JobEvent::Started {
                job_id,
                queue: queue.to_string(),
                job_type: job_type.to_string(),
                attempt: claimed.record.attempts_made,
                at: now,
            };
            (claimed, event)
        };

        self.emit(event);
        Ok(Some(claimed))
    }

    async fn record_progress(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &ClaimToken,
        progress: Progress,
    ) -> QueueResult<()> {
        self.ensure_open()?;

        {
            let mut guard = self.state.write();
            let record = Self::record_mut(&mut guard, queue, job_id)?;
            Self::check_claim(record, token)?;
            record.progress = progress.clone();
        }

        self.emit(JobEvent::Progress {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            progress,
            at: Utc::now(),
        });
        Ok(())
    }

    async fn complete(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &ClaimToken,
        result: serde_json::Value,
    ) -> QueueResult<()> {
        self.ensure_open()?;

        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let record = Self::record_mut(state, queue, job_id)?;
            Self::check_claim(record, token)?;

            record.complete(result);
            let retain = record.options.retain_on_complete;
            let slot = state.queues.entry(queue.to_string()).or_default();
            slot.completed.push_back(job_id.clone());
            Self::prune(&mut state.jobs, &mut slot.completed, retain);
        }

        self.emit(JobEvent::Completed {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    async fn fail(
        &self,
        queue: &str,
        job_id: &JobId,
        token: &ClaimToken,
        error: String,
        retry_at: Option<DateTime<Utc>>,
    ) -> QueueResult<()> {
        self.ensure_open()?;

        let event = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let record = Self::record_mut(state, queue, job_id)?;
            Self::check_claim(record, token)?;

            if let Some(retry_at) = retry_at {
                record.schedule_retry(retry_at);
                let slot = state.queues.entry(queue.to_string()).or_default();
                slot.pending.push(job_id.clone());
                JobEvent::Retrying {
                    job_id: job_id.clone(),
                    queue: queue.to_string(),
                    retry_at,
                    error,
                    at: Utc::now(),
                }
            } else {
                record.fail(error.clone());
                let retain = record.options.retain_on_fail;
                let slot = state.queues.entry(queue.to_string()).or_default();
                slot.failed.push_back(job_id.clone());
                Self::prune(&mut state.jobs, &mut slot.failed, retain);
                JobEvent::Failed {
                    job_id: job_id.clone(),
                    queue: queue.to_string(),
                    error,
                    at: Utc::now(),
                }
            }
        };

        self.emit(event);
        Ok(())
    }

    async fn cancel(&self, queue: &str, job_id: &JobId) -> QueueResult<CancelOutcome> {
        self.ensure_open()?;

        {
            let mut guard = self.state.write();
            let state = &mut *guard;
            let record = Self::record_mut(state, queue, job_id)?;

            if record.state.is_terminal() {
                return Ok(CancelOutcome::AlreadyTerminal);
            }
            if record.state.is_active() {
                // Cooperative path: the flag survives until the owning worker
                // observes it, however the timing falls out.
                record.cancel_requested = true;
                return Ok(CancelOutcome::Active);
            }

            // Waiting or delayed: authoritative removal.
            state.jobs.remove(job_id);
            if let Some(slot) = state.queues.get_mut(queue) {
                slot.pending.retain(|id| id != job_id);
            }
        }

        self.emit(JobEvent::Cancelled {
            job_id: job_id.clone(),
            queue: queue.to_string(),
            at: Utc::now(),
        });
        Ok(CancelOutcome::Removed)
    }

    async fn job(&self, queue: &str, job_id: &JobId) -> QueueResult<JobRecord> {
        self.ensure_open()?;

        let state = self.state.read();
        let record = state
            .jobs
            .get(job_id)
            .filter(|record| record.queue == queue)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        Ok(record.clone())
    }

    async fn list(
        &self,
        queue: &str,
        filter: StateFilter,
        offset: usize,
        limit: usize,
    ) -> QueueResult<Vec<JobRecord>> {
        self.ensure_open()?;

        let state = self.state.read();
        let mut records: Vec<JobRecord> = state
            .jobs
            .values()
            .filter(|record| record.queue == queue && filter.matches(&record.state))
            .cloned()
            .collect();

        // Pending states list oldest first; terminal states most recent first.
        match filter {
            StateFilter::Completed | StateFilter::Failed => {
                records.sort_by(|a, b| b.seq.cmp(&a.seq))
            }
            _ => records.sort_by(|a, b| a.seq.cmp(&b.seq)),
        }

        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn counts(&self, queue: &str) -> QueueResult<StateCounts> {
        self.ensure_open()?;

        let state = self.state.read();
        let mut counts = StateCounts::default();
        for record in state.jobs.values().filter(|record| record.queue == queue) {
            match record.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed { .. } => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Cancelled => {}
            }
        }
        Ok(counts)
    }

    fn events(&self) -> BoxStream<JobEvent> {
        let receiver = self.events.subscribe();
        // Lagged receivers skip dropped events rather than erroring out.
        Box::pin(BroadcastStream::new(receiver).filter_map(|result| result.ok()))
    }

    async fn close(&self) -> QueueResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
