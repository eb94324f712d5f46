use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    error::JobError,
    jobs::{clients::ChatClient, AI_ANALYSIS_QUEUE, TASK_DETECTION_JOB},
    registry::{JobContext, JobHandler},
    types::JobOptionsPatch,
};

/// Upper bound on history pages fetched per sync run
const MAX_PAGES: u32 = 20;

/// Synchronizes one chat channel's history and chains an analysis job over
/// the fetched messages.
///
/// Payload: `{channelId, channelName?, projectId?, lastTimestamp?,
/// projectContext?}`. The chained analysis payload carries this job's id as
/// `correlationId`, which is what ties the sync → analyze flow together in
/// the chain tracker.
pub struct ChannelSyncHandler {
    chat: Arc<dyn ChatClient>,
}

impl ChannelSyncHandler {
    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl JobHandler for ChannelSyncHandler {
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        let channel_id = ctx
            .data
            .get("channelId")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::permanent("payload missing channelId"))?
            .to_string();
        let project_id = ctx.data.get("projectId").and_then(Value::as_str).map(str::to_string);
        let oldest = ctx.data.get("lastTimestamp").and_then(Value::as_u64);

        let mut messages: Vec<Value> = Vec::new();
        let mut cursor: Option<String> = None;
        let mut page = 0u32;

        loop {
            if ctx.is_cancelled() {
                return Err(JobError::permanent("channel sync cancelled by request"));
            }

            let batch = self.chat.fetch_messages(&channel_id, oldest, cursor.as_deref()).await?;
            messages.extend(batch.messages);
            page += 1;
            debug!(channel_id = %channel_id, page, fetched = messages.len(), "history page fetched");
            ctx.progress().percent((page.saturating_mul(10)).min(90) as u8);

            match batch.next_cursor {
                Some(next) if page < MAX_PAGES => cursor = Some(next),
                _ => break,
            }
        }

        let message_count = messages.len();
        ctx.progress().percent(95);

        let analysis = ctx
            .dispatcher()
            .enqueue(
                AI_ANALYSIS_QUEUE,
                TASK_DETECTION_JOB,
                json!({
                    "messages": messages,
                    "projectId": project_id,
                    "projectContext": ctx.data.get("projectContext").cloned(),
                    "correlationId": ctx.job_id.as_str(),
                }),
                JobOptionsPatch::default(),
            )
            .await
            .map_err(|err| JobError::retryable(format!("failed to chain analysis job: {err}")))?;

        ctx.progress().percent(100);
        info!(
            channel_id = %channel_id,
            message_count,
            analysis_job_id = %analysis.id,
            "channel sync finished, analysis chained"
        );

        Ok(json!({
            "channelId": channel_id,
            "messageCount": message_count,
            "analysisJobId": analysis.id,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::memory::MemoryBroker,
        jobs::clients::MessageBatch,
        manager::{ManagerConfig, QueueManager},
        registry::ProgressHandle,
        types::{JobId, JobOptions},
    };
    use tokio_util::sync::CancellationToken;

    struct PagedChat {
        pages: usize,
    }

    #[async_trait]
    impl ChatClient for PagedChat {
        async fn fetch_messages(
            &self,
            _channel_id: &str,
            _oldest: Option<u64>,
            cursor: Option<&str>,
        ) -> Result<MessageBatch, JobError> {
            let page = cursor.map_or(0, |c| c.parse::<usize>().unwrap_or(0));
            let next_cursor =
                if page + 1 < self.pages { Some((page + 1).to_string()) } else { None };
            Ok(MessageBatch {
                messages: vec![json!({"text": format!("message {page}")})],
                next_cursor,
            })
        }
    }

    async fn context_for(manager: &QueueManager, data: Value) -> JobContext {
        let (progress, _rx) = ProgressHandle::channel();
        JobContext::new(
            JobId::new(),
            "slack-sync".to_string(),
            "sync-channel".to_string(),
            1,
            data,
            progress,
            CancellationToken::new(),
            manager.dispatcher(),
        )
    }

    async fn manager() -> QueueManager {
        let manager =
            QueueManager::connect(Arc::new(MemoryBroker::new()), ManagerConfig::default())
                .await
                .unwrap();
        manager.register_queue(AI_ANALYSIS_QUEUE, JobOptions::default());
        manager
    }

    #[tokio::test]
    async fn sync_fetches_all_pages_and_chains_analysis() {
        let manager = manager().await;
        let handler = ChannelSyncHandler::new(Arc::new(PagedChat { pages: 3 }));
        let ctx = context_for(&manager, json!({"channelId": "C42", "projectId": "p-1"})).await;
        let sync_job_id = ctx.job_id.clone();

        let result = handler.execute(ctx).await.unwrap();
        assert_eq!(result["messageCount"], 3);

        let analysis_id = JobId::from(result["analysisJobId"].as_str().unwrap());
        let chained = manager.job_view(AI_ANALYSIS_QUEUE, &analysis_id).await.unwrap();
        assert_eq!(chained.status, "waiting");
        assert_eq!(chained.data["correlationId"], json!(sync_job_id.as_str()));
        assert_eq!(chained.data["messages"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn missing_channel_id_is_permanent() {
        let manager = manager().await;
        let handler = ChannelSyncHandler::new(Arc::new(PagedChat { pages: 1 }));
        let ctx = context_for(&manager, json!({"projectId": "p-1"})).await;

        let err = handler.execute(ctx).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn cancellation_is_honored_between_pages() {
        let manager = manager().await;
        let handler = ChannelSyncHandler::new(Arc::new(PagedChat { pages: 3 }));
        let (progress, _rx) = ProgressHandle::channel();
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let ctx = JobContext::new(
            JobId::new(),
            "slack-sync".to_string(),
            "sync-channel".to_string(),
            1,
            json!({"channelId": "C42"}),
            progress,
            cancellation,
            manager.dispatcher(),
        );

        let err = handler.execute(ctx).await.unwrap_err();
        assert!(err.message().contains("cancelled"));
    }
}
