use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    error::JobError,
    jobs::clients::{AnalysisClient, TaskSink},
    registry::{JobContext, JobHandler},
};

/// Runs language-model task detection over a batch of messages, then makes
/// a best-effort attempt to persist the detected tasks.
///
/// Payload: `{messages: [...], projectId?, projectContext?, analysisType?}`.
/// The persistence write is a secondary effect: when it fails the job still
/// completes, with `tasksStored: false` in the result.
pub struct MessageAnalysisHandler {
    analysis: Arc<dyn AnalysisClient>,
    sink: Arc<dyn TaskSink>,
}

impl MessageAnalysisHandler {
    pub fn new(analysis: Arc<dyn AnalysisClient>, sink: Arc<dyn TaskSink>) -> Self {
        Self { analysis, sink }
    }
}

#[async_trait]
impl JobHandler for MessageAnalysisHandler {
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        let messages = ctx
            .data
            .get("messages")
            .and_then(Value::as_array)
            .cloned()
            .ok_or_else(|| JobError::permanent("payload missing messages"))?;
        let project_context = ctx.data.get("projectContext").filter(|ctx| !ctx.is_null()).cloned();
        let project_id = ctx.data.get("projectId").and_then(Value::as_str);

        ctx.progress().percent(10);
        let outcome = self.analysis.detect_tasks(&messages, project_context.as_ref()).await?;
        ctx.progress().percent(85);

        let tasks = outcome.get("tasks").cloned().unwrap_or_else(|| json!([]));
        let task_count = tasks.as_array().map_or(0, Vec::len);

        let mut stored = false;
        if task_count > 0 {
            match self.sink.store_tasks(project_id, &tasks).await {
                Ok(()) => stored = true,
                Err(err) => {
                    // Analysis itself succeeded; the write is best-effort.
                    warn!(
                        job_id = %ctx.job_id,
                        error = %err,
                        "detected tasks were not persisted"
                    );
                }
            }
        }

        ctx.progress().percent(100);
        info!(job_id = %ctx.job_id, task_count, stored, "message analysis finished");

        Ok(json!({
            "tasks": tasks,
            "messageCount": messages.len(),
            "tasksStored": stored,
            "analysisType": ctx
                .data
                .get("analysisType")
                .and_then(Value::as_str)
                .unwrap_or("task-detection"),
        }))
    }
}
