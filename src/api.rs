use std::sync::Arc;

use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    broker::StateFilter,
    error::QueueError,
    jobs::{
        AI_ANALYSIS_QUEUE, SLACK_SYNC_QUEUE, SYNC_CHANNEL_JOB, SYNC_MESSAGES_JOB,
        TASK_DETECTION_JOB, WHATSAPP_SYNC_QUEUE,
    },
    manager::{CancelResult, QueueManager},
    types::{JobId, JobOptionsPatch, JobView},
};

/// How many entries each per-state listing returns
const LIST_LIMIT: usize = 50;

/// HTTP error wrapper mapping the queue error taxonomy onto status codes
/// and the `{success: false, error}` envelope the desktop client expects.
pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            QueueError::Validation(_) | QueueError::QueueNotRegistered(_) => {
                StatusCode::BAD_REQUEST
            }
            QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
            QueueError::BrokerUnavailable(_) | QueueError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({"success": false, "error": self.0.to_string()});
        if matches!(self.0, QueueError::JobNotFound(_)) {
            body["status"] = json!("not_found");
        }
        (status, Json(body)).into_response()
    }
}

fn validation(message: &str) -> ApiError {
    ApiError(QueueError::Validation(message.to_string()))
}

fn bad_json(rejection: JsonRejection) -> ApiError {
    ApiError(QueueError::Validation(format!("failed to parse request body: {rejection}")))
}

/// Build the control-plane router
pub fn router(manager: Arc<QueueManager>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/queue/jobs", post(enqueue_job))
        .route("/api/queue/jobs/{queue}", get(list_queue_jobs))
        .route("/api/queue/jobs/{queue}/{id}", get(get_job).delete(remove_job))
        .route("/api/queue/stats", get(queue_stats))
        .route("/api/queue/chains/{id}", get(get_chain).delete(clear_chain))
        .route("/api/queue/slack/sync-channel", post(enqueue_slack_sync))
        .route("/api/queue/ai/detect-tasks", post(enqueue_task_detection))
        .route("/api/queue/whatsapp/sync-messages", post(enqueue_whatsapp_sync))
        .with_state(manager)
}

async fn health(State(manager): State<Arc<QueueManager>>) -> Json<Value> {
    let connected = manager.broker_connected().await;
    Json(json!({
        "status": (if connected { "ok" } else { "degraded" }),
        "brokerConnected": connected,
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EnqueueBody {
    queue: Option<String>,
    #[serde(rename = "type")]
    job_type: Option<String>,
    data: Option<Value>,
    options: Option<JobOptionsPatch>,
}

fn accepted(view: &JobView) -> (StatusCode, Json<Value>) {
    (
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "job": {
                "id": view.id,
                "queue": view.queue,
                "type": view.job_type,
                "status": "queued",
                "createdAt": view.created_at,
            },
        })),
    )
}

async fn enqueue_job(
    State(manager): State<Arc<QueueManager>>,
    body: Result<Json<EnqueueBody>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(body) = body.map_err(bad_json)?;

    let queue = body
        .queue
        .filter(|queue| !queue.trim().is_empty())
        .ok_or_else(|| validation("queue is required"))?;
    let job_type = body
        .job_type
        .filter(|job_type| !job_type.trim().is_empty())
        .ok_or_else(|| validation("type is required"))?;
    let data = body.data.filter(|data| !data.is_null()).ok_or_else(|| validation("data is required"))?;

    let view = manager.enqueue(&queue, &job_type, data, body.options.unwrap_or_default()).await?;
    Ok(accepted(&view))
}

async fn get_job(
    State(manager): State<Arc<QueueManager>>,
    Path((queue, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let view = manager.job_view(&queue, &JobId::from(id)).await?;
    Ok(Json(json!({"success": true, "job": view})))
}

async fn list_queue_jobs(
    State(manager): State<Arc<QueueManager>>,
    Path(queue): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let waiting = manager.list_jobs(&queue, StateFilter::Waiting, 0, LIST_LIMIT).await?;
    let active = manager.list_jobs(&queue, StateFilter::Active, 0, LIST_LIMIT).await?;
    let completed = manager.list_jobs(&queue, StateFilter::Completed, 0, LIST_LIMIT).await?;
    let failed = manager.list_jobs(&queue, StateFilter::Failed, 0, LIST_LIMIT).await?;

    Ok(Json(json!({
        "success": true,
        "jobs": {
            "waiting": waiting,
            "active": active,
            "completed": completed,
            "failed": failed,
        },
    })))
}

async fn remove_job(
    State(manager): State<Arc<QueueManager>>,
    Path((queue, id)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    let body = match manager.cancel(&queue, &JobId::from(id)).await? {
        CancelResult::Removed => json!({"success": true, "message": "Job removed"}),
        CancelResult::CancellationRequested => json!({
            "success": true,
            "message": "Job is active; cooperative cancellation requested",
        }),
        CancelResult::AlreadyFinished => json!({
            "success": false,
            "message": "Job already reached a terminal state",
        }),
    };
    Ok(Json(body))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StatsQuery {
    queue: Option<String>,
}

async fn queue_stats(
    State(manager): State<Arc<QueueManager>>,
    Query(query): Query<StatsQuery>,
) -> Result<Json<Value>, ApiError> {
    let stats = manager.stats(query.queue.as_deref()).await?;
    Ok(Json(json!({"success": true, "stats": stats})))
}

async fn get_chain(
    State(manager): State<Arc<QueueManager>>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let chain = manager
        .chain()
        .chain(&id)
        .ok_or_else(|| ApiError(QueueError::JobNotFound(id.clone())))?;
    Ok(Json(json!({"success": true, "correlationId": id, "chain": chain})))
}

async fn clear_chain(
    State(manager): State<Arc<QueueManager>>,
    Path(id): Path<String>,
) -> Json<Value> {
    let cleared = manager.chain().clear(&id);
    Json(json!({"success": cleared}))
}

/// Require a non-empty string field in a convenience-route payload
fn require_str<'a>(data: &'a Value, field: &str) -> Result<&'a str, ApiError> {
    data.get(field)
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| validation(&format!("{field} is required")))
}

async fn enqueue_slack_sync(
    State(manager): State<Arc<QueueManager>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(data) = body.map_err(bad_json)?;
    require_str(&data, "channelId")?;

    let view = manager
        .enqueue(SLACK_SYNC_QUEUE, SYNC_CHANNEL_JOB, data, JobOptionsPatch::default())
        .await?;
    Ok(accepted(&view))
}

async fn enqueue_task_detection(
    State(manager): State<Arc<QueueManager>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(data) = body.map_err(bad_json)?;
    if !data.get("messages").map_or(false, Value::is_array) {
        return Err(validation("messages is required"));
    }

    let view = manager
        .enqueue(AI_ANALYSIS_QUEUE, TASK_DETECTION_JOB, data, JobOptionsPatch::default())
        .await?;
    Ok(accepted(&view))
}

async fn enqueue_whatsapp_sync(
    State(manager): State<Arc<QueueManager>>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(data) = body.map_err(bad_json)?;
    require_str(&data, "chatId")?;

    let view = manager
        .enqueue(WHATSAPP_SYNC_QUEUE, SYNC_MESSAGES_JOB, data, JobOptionsPatch::default())
        .await?;
    Ok(accepted(&view))
}
