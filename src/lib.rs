//! # essentials-queue: Background Job Orchestration for Project Essentials
//!
//! Decouples slow, unreliable external operations (channel synchronization,
//! language-model analysis, message ingestion) from the request path of the
//! desktop client. One broker, named queues with per-type worker pools,
//! retry/backoff on failure, and chain tracing across multi-stage flows.
//!
//! - **Atomic ownership**: claim tokens mean a job is only ever driven by
//!   one worker slot at a time
//! - **Priority + FIFO dispatch**: higher priority first, enqueue order
//!   within equal priority, never preempting running jobs
//! - **Retry engine**: fixed or exponential backoff up to `maxAttempts`,
//!   with permanent errors short-circuiting to terminal failure
//! - **Cooperative cancellation**: authoritative before pickup, advisory
//!   (token-based) for active jobs
//! - **Chain tracking**: correlation ids in job payloads group events of a
//!   sync → analyze → store flow into bounded ring buffers
//!
//! ```no_run
//! use std::sync::Arc;
//! use essentials_queue::{
//!     JobOptionsPatch, ManagerConfig, MemoryBroker, QueueManager,
//! };
//!
//! # async fn run() -> essentials_queue::QueueResult<()> {
//! let broker = Arc::new(MemoryBroker::new());
//! let manager = QueueManager::connect(broker, ManagerConfig::default()).await?;
//!
//! manager.register_default_queue("ai-analysis");
//! let job = manager
//!     .enqueue(
//!         "ai-analysis",
//!         "task-detection",
//!         serde_json::json!({"messages": []}),
//!         JobOptionsPatch::default(),
//!     )
//!     .await?;
//! let _view = manager.job_view("ai-analysis", &job.id).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod broker;
pub mod config;
pub mod error;
pub mod jobs;
pub mod manager;
pub mod observability;
pub mod registry;
pub mod types;

mod worker;

pub use broker::memory::MemoryBroker;
pub use broker::{Broker, BoxStream, CancelOutcome, ClaimedJob, StateCounts, StateFilter};
pub use config::{BrokerConfig, ServiceConfig};
pub use error::{JobError, QueueError, QueueResult};
pub use manager::{CancelResult, JobDispatcher, ManagerConfig, Queue, QueueManager};
pub use observability::{ChainEntry, ChainTracker, CounterSnapshot, LiveMetrics};
pub use registry::{HandlerRegistry, JobContext, JobHandler, ProgressHandle};
pub use types::{
    BackoffPolicy, ClaimToken, JobEvent, JobId, JobOptions, JobOptionsPatch, JobRecord, JobState,
    JobSummary, JobView, Progress,
};
