use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Monotonic execution counters
#[derive(Default)]
struct CounterSet {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
}

impl CounterSet {
    fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of one counter set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
}

/// Live counters for queue activity, process-wide and per queue
pub struct LiveMetrics {
    totals: CounterSet,
    per_queue: DashMap<String, CounterSet>,
}

impl LiveMetrics {
    pub fn new() -> Self {
        Self { totals: CounterSet::default(), per_queue: DashMap::new() }
    }

    pub fn job_enqueued(&self, queue: &str) {
        self.bump(queue, |set| &set.enqueued);
    }

    pub fn job_completed(&self, queue: &str) {
        self.bump(queue, |set| &set.completed);
    }

    pub fn job_failed(&self, queue: &str) {
        self.bump(queue, |set| &set.failed);
    }

    pub fn job_retried(&self, queue: &str) {
        self.bump(queue, |set| &set.retried);
    }

    pub fn job_cancelled(&self, queue: &str) {
        self.bump(queue, |set| &set.cancelled);
    }

    fn bump(&self, queue: &str, field: impl Fn(&CounterSet) -> &AtomicU64) {
        field(&self.totals).fetch_add(1, Ordering::Relaxed);
        let entry = self.per_queue.entry(queue.to_string()).or_default();
        field(entry.value()).fetch_add(1, Ordering::Relaxed);
    }

    /// Process-wide counters
    pub fn totals(&self) -> CounterSnapshot {
        self.totals.snapshot()
    }

    /// Counters for one queue (zero if never touched)
    pub fn queue(&self, name: &str) -> CounterSnapshot {
        self.per_queue.get(name).map(|entry| entry.snapshot()).unwrap_or_default()
    }
}

impl Default for LiveMetrics {
    fn default() -> Self {
        Self::new()
    }
}
