use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::{
    error::JobError,
    jobs::clients::ChatClient,
    registry::{JobContext, JobHandler},
};

const MAX_PAGES: u32 = 50;

/// Incremental message ingestion for a single chat.
///
/// Payload: `{chatId, lastTimestamp?, syncType?}`. Cancellation is checked
/// between pages; a cancelled run completes with what it ingested so far
/// and marks the result as truncated.
pub struct MessageIngestHandler {
    chat: Arc<dyn ChatClient>,
}

impl MessageIngestHandler {
    pub fn new(chat: Arc<dyn ChatClient>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl JobHandler for MessageIngestHandler {
    async fn execute(&self, ctx: JobContext) -> Result<Value, JobError> {
        let chat_id = ctx
            .data
            .get("chatId")
            .and_then(Value::as_str)
            .ok_or_else(|| JobError::permanent("payload missing chatId"))?
            .to_string();
        let oldest = ctx.data.get("lastTimestamp").and_then(Value::as_u64);
        let sync_type =
            ctx.data.get("syncType").and_then(Value::as_str).unwrap_or("incremental").to_string();

        let mut ingested = 0usize;
        let mut cursor: Option<String> = None;
        let mut page = 0u32;
        let mut truncated = false;

        loop {
            if ctx.is_cancelled() {
                truncated = true;
                break;
            }

            let batch = self.chat.fetch_messages(&chat_id, oldest, cursor.as_deref()).await?;
            ingested += batch.messages.len();
            page += 1;
            debug!(chat_id = %chat_id, page, ingested, "ingest page fetched");
            ctx.progress().detail(json!({"pages": page, "ingested": ingested}));

            match batch.next_cursor {
                Some(next) if page < MAX_PAGES => cursor = Some(next),
                _ => break,
            }
        }

        info!(chat_id = %chat_id, ingested, truncated, "message ingest finished");
        Ok(json!({
            "chatId": chat_id,
            "ingestedCount": ingested,
            "syncType": sync_type,
            "truncated": truncated,
        }))
    }
}
