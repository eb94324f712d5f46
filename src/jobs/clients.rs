use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{JobError, QueueError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// One page of messages from a chat platform
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageBatch {
    pub messages: Vec<Value>,
    pub next_cursor: Option<String>,
}

/// Message-history access on the chat-platform gateway
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn fetch_messages(
        &self,
        channel_id: &str,
        oldest: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<MessageBatch, JobError>;
}

/// Language-model analysis of message batches
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Returns the raw analysis result; a `tasks` array is expected inside
    async fn detect_tasks(
        &self,
        messages: &[Value],
        project_context: Option<&Value>,
    ) -> Result<Value, JobError>;
}

/// Best-effort persistence of detected tasks. Failures here are side-effect
/// failures: logged by the caller, never failing the job.
#[async_trait]
pub trait TaskSink: Send + Sync {
    async fn store_tasks(&self, project_id: Option<&str>, tasks: &Value) -> Result<(), QueueError>;
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("failed to build HTTP client")
}

/// Map an HTTP status to retryability: server-side and transport problems
/// retry, client errors do not.
fn status_error(context: &str, status: reqwest::StatusCode) -> JobError {
    if status.is_client_error() {
        JobError::permanent(format!("{context} rejected the request: HTTP {status}"))
    } else {
        JobError::retryable(format!("{context} failed: HTTP {status}"))
    }
}

pub struct HttpChatClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpChatClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: http_client() }
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn fetch_messages(
        &self,
        channel_id: &str,
        oldest: Option<u64>,
        cursor: Option<&str>,
    ) -> Result<MessageBatch, JobError> {
        let url = format!("{}/api/messages/history", self.base_url);
        let body = json!({
            "channelId": channel_id,
            "oldest": oldest,
            "cursor": cursor,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| JobError::retryable(format!("chat service unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("chat service", status));
        }

        response
            .json::<MessageBatch>()
            .await
            .map_err(|err| JobError::permanent(format!("malformed chat service response: {err}")))
    }
}

pub struct HttpAnalysisClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpAnalysisClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: http_client() }
    }
}

#[async_trait]
impl AnalysisClient for HttpAnalysisClient {
    async fn detect_tasks(
        &self,
        messages: &[Value],
        project_context: Option<&Value>,
    ) -> Result<Value, JobError> {
        let url = format!("{}/api/analyze/tasks", self.base_url);
        let body = json!({
            "messages": messages,
            "projectContext": project_context,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| JobError::retryable(format!("analysis service unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error("analysis service", status));
        }

        response
            .json::<Value>()
            .await
            .map_err(|err| JobError::permanent(format!("malformed analysis response: {err}")))
    }
}

pub struct HttpTaskSink {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTaskSink {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), client: http_client() }
    }
}

#[async_trait]
impl TaskSink for HttpTaskSink {
    async fn store_tasks(&self, project_id: Option<&str>, tasks: &Value) -> Result<(), QueueError> {
        let url = format!("{}/api/tasks/bulk", self.base_url);
        let body = json!({
            "projectId": project_id,
            "tasks": tasks,
        });

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| QueueError::SideEffect(format!("task service unreachable: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(QueueError::SideEffect(format!("task service returned HTTP {status}")));
        }
        Ok(())
    }
}
