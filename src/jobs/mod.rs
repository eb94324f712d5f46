//! Built-in job handlers for the sync → analyze → store pipeline.
//!
//! Each handler talks to its external collaborator through a client trait,
//! so the service binary wires HTTP-backed implementations and tests use
//! in-crate stubs.

pub mod channel_sync;
pub mod clients;
pub mod message_analysis;
pub mod message_ingest;

use std::sync::Arc;

pub use channel_sync::ChannelSyncHandler;
pub use clients::{
    AnalysisClient, ChatClient, HttpAnalysisClient, HttpChatClient, HttpTaskSink, MessageBatch,
    TaskSink,
};
pub use message_analysis::MessageAnalysisHandler;
pub use message_ingest::MessageIngestHandler;

use crate::{config::ServiceConfig, error::QueueResult, manager::QueueManager};

pub const SLACK_SYNC_QUEUE: &str = "slack-sync";
pub const AI_ANALYSIS_QUEUE: &str = "ai-analysis";
pub const WHATSAPP_SYNC_QUEUE: &str = "whatsapp-sync";
pub const BACKGROUND_SYNC_QUEUE: &str = "background-sync";

pub const SYNC_CHANNEL_JOB: &str = "sync-channel";
pub const TASK_DETECTION_JOB: &str = "task-detection";
pub const SYNC_MESSAGES_JOB: &str = "sync-messages";

/// Register the built-in queues and handlers on a freshly connected manager.
///
/// `background-sync` stays handler-free on purpose: clients submit ad-hoc
/// job types there, and those jobs wait until a handler is deployed for
/// them.
pub fn register_builtin(manager: &QueueManager, config: &ServiceConfig) -> QueueResult<()> {
    let defaults = config.default_job_options();
    manager.register_queue(SLACK_SYNC_QUEUE, defaults.clone());
    manager.register_queue(AI_ANALYSIS_QUEUE, defaults.clone());
    manager.register_queue(WHATSAPP_SYNC_QUEUE, defaults.clone());
    manager.register_queue(BACKGROUND_SYNC_QUEUE, defaults);

    let chat: Arc<dyn ChatClient> = Arc::new(HttpChatClient::new(&config.chat_service_url));
    let analysis: Arc<dyn AnalysisClient> =
        Arc::new(HttpAnalysisClient::new(&config.ai_service_url));
    let sink: Arc<dyn TaskSink> = Arc::new(HttpTaskSink::new(&config.task_service_url));

    manager.register_handler(
        SLACK_SYNC_QUEUE,
        SYNC_CHANNEL_JOB,
        Arc::new(ChannelSyncHandler::new(chat.clone())),
        config.sync_concurrency,
    )?;
    manager.register_handler(
        AI_ANALYSIS_QUEUE,
        TASK_DETECTION_JOB,
        Arc::new(MessageAnalysisHandler::new(analysis, sink)),
        config.analysis_concurrency,
    )?;
    manager.register_handler(
        WHATSAPP_SYNC_QUEUE,
        SYNC_MESSAGES_JOB,
        Arc::new(MessageIngestHandler::new(chat)),
        config.ingest_concurrency,
    )?;

    Ok(())
}
