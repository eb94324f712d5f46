use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    broker::BoxStream,
    types::{JobEvent, JobId},
};

/// Payload field names recognized as correlation ids
pub const CORRELATION_FIELDS: &[&str] =
    &["correlationId", "correlation_id", "parentJobId", "syncJobId", "rootJobId"];

/// One observed event in a job chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainEntry {
    pub event: String,
    pub stage: String,
    pub at: DateTime<Utc>,
}

/// Passive correlation log for multi-stage job flows.
///
/// Subscribes to the broker event stream in its own task and groups events
/// whose enqueue payload carried a correlation id into bounded per-id ring
/// buffers. Purely diagnostic: it never feeds back into job execution, and
/// overflow only evicts the oldest entries.
pub struct ChainTracker {
    chains: DashMap<String, VecDeque<ChainEntry>>,

    /// Which chain a job's events belong to, learned at enqueue time
    job_index: DashMap<JobId, String>,

    /// Chain creation order, for oldest-first eviction past `max_chains`
    order: Mutex<VecDeque<String>>,

    chain_capacity: usize,
    max_chains: usize,
    stop: CancellationToken,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ChainTracker {
    /// Build a tracker and start consuming the given event stream
    pub fn start(
        events: BoxStream<JobEvent>,
        chain_capacity: usize,
        max_chains: usize,
    ) -> std::sync::Arc<Self> {
        let tracker = std::sync::Arc::new(Self {
            chains: DashMap::new(),
            job_index: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
            chain_capacity: chain_capacity.max(1),
            max_chains: max_chains.max(1),
            stop: CancellationToken::new(),
            consumer: Mutex::new(None),
        });

        let observer = tracker.clone();
        let handle = tokio::spawn(async move {
            let mut events = events;
            loop {
                tokio::select! {
                    _ = observer.stop.cancelled() => break,
                    event = events.next() => match event {
                        Some(event) => observer.observe(&event),
                        None => break,
                    }
                }
            }
            debug!("chain tracker stopped");
        });
        *tracker.consumer.lock() = Some(handle);

        tracker
    }

    /// Record one event. Jobs whose payload carried no correlation id are
    /// not tracked.
    pub(crate) fn observe(&self, event: &JobEvent) {
        match event {
            JobEvent::Enqueued { job_id, queue, data, at, .. } => {
                if let Some(correlation) = extract_correlation(data) {
                    self.job_index.insert(job_id.clone(), correlation.clone());
                    self.record(&correlation, event.event_name(), queue, *at);
                }
            }
            _ => {
                let correlation =
                    self.job_index.get(event.job_id()).map(|entry| entry.value().clone());
                if let Some(correlation) = correlation {
                    self.record(&correlation, event.event_name(), event.queue(), event.timestamp());
                    if matches!(
                        event,
                        JobEvent::Completed { .. }
                            | JobEvent::Failed { .. }
                            | JobEvent::Cancelled { .. }
                    ) {
                        self.job_index.remove(event.job_id());
                    }
                }
            }
        }
    }

    fn record(&self, correlation: &str, event: &str, stage: &str, at: DateTime<Utc>) {
        if !self.chains.contains_key(correlation) {
            let mut order = self.order.lock();
            order.push_back(correlation.to_string());
            while order.len() > self.max_chains {
                if let Some(evicted) = order.pop_front() {
                    self.chains.remove(&evicted);
                }
            }
        }

        let mut chain = self.chains.entry(correlation.to_string()).or_default();
        if chain.len() == self.chain_capacity {
            chain.pop_front();
        }
        chain.push_back(ChainEntry {
            event: event.to_string(),
            stage: stage.to_string(),
            at,
        });
    }

    /// Events recorded for one correlation id, oldest first
    pub fn chain(&self, correlation_id: &str) -> Option<Vec<ChainEntry>> {
        self.chains.get(correlation_id).map(|chain| chain.iter().cloned().collect())
    }

    /// Drop one chain; returns whether it existed
    pub fn clear(&self, correlation_id: &str) -> bool {
        self.order.lock().retain(|id| id != correlation_id);
        self.chains.remove(correlation_id).is_some()
    }

    /// Stop the consumer task
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// First recognized correlation field with a string value, if any
pub fn extract_correlation(data: &Value) -> Option<String> {
    let object = data.as_object()?;
    CORRELATION_FIELDS
        .iter()
        .find_map(|field| object.get(*field).and_then(Value::as_str).map(str::to_string))
}
