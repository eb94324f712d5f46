use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use essentials_queue::{
    api, jobs, ManagerConfig, MemoryBroker, QueueManager, ServiceConfig,
};

/// Router over a connected manager with the built-in queues registered.
/// Worker pools are not started, so enqueued jobs stay `waiting` and every
/// response is deterministic.
async fn service() -> Router {
    let manager = QueueManager::connect(Arc::new(MemoryBroker::new()), ManagerConfig::default())
        .await
        .unwrap();
    jobs::register_builtin(&manager, &ServiceConfig::from_env()).unwrap();
    api::router(Arc::new(manager))
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn delete(uri: &str) -> Request<Body> {
    Request::builder().method("DELETE").uri(uri).body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn enqueue_request() -> Request<Body> {
    post(
        "/api/queue/jobs",
        json!({
            "queue": "ai-analysis",
            "type": "task-detection",
            "data": {"messages": [{"text": "review the deck"}]},
            "options": {"priority": 2},
        }),
    )
}

#[tokio::test]
async fn health_reports_broker_connection() {
    let app = service().await;
    let response = app.oneshot(get("/health")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["brokerConnected"], json!(true));
}

#[tokio::test]
async fn enqueue_returns_created_job() {
    let app = service().await;
    let response = app.oneshot(enqueue_request()).await.unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["job"]["queue"], "ai-analysis");
    assert_eq!(body["job"]["type"], "task-detection");
    assert_eq!(body["job"]["status"], "queued");
    assert!(!body["job"]["id"].as_str().unwrap().is_empty());
    assert!(body["job"]["createdAt"].is_string());
}

#[tokio::test]
async fn enqueue_without_data_is_rejected() {
    let app = service().await;
    let response = app
        .oneshot(post("/api/queue/jobs", json!({"queue": "ai-analysis", "type": "task-detection"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert!(body["error"].as_str().unwrap().contains("data is required"));
}

#[tokio::test]
async fn enqueue_into_unknown_queue_is_rejected() {
    let app = service().await;
    let response = app
        .oneshot(post(
            "/api/queue/jobs",
            json!({"queue": "nope", "type": "task-detection", "data": {}}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn job_view_round_trips_payload() {
    let app = service().await;
    let created = body_json(app.clone().oneshot(enqueue_request()).await.unwrap()).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();

    let response =
        app.oneshot(get(&format!("/api/queue/jobs/ai-analysis/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let job = &body["job"];
    assert_eq!(job["status"], "waiting");
    assert_eq!(job["data"]["messages"][0]["text"], "review the deck");
    assert_eq!(job["attemptsMade"], 0);
    assert_eq!(job["progress"], 0);
}

#[tokio::test]
async fn missing_job_is_not_found() {
    let app = service().await;
    let response =
        app.oneshot(get("/api/queue/jobs/ai-analysis/no-such-job")).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
    assert_eq!(body["status"], "not_found");
}

#[tokio::test]
async fn queue_listing_groups_by_state() {
    let app = service().await;
    let created = body_json(app.clone().oneshot(enqueue_request()).await.unwrap()).await;
    let id = created["job"]["id"].as_str().unwrap();

    let response = app.oneshot(get("/api/queue/jobs/ai-analysis")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    let waiting = body["jobs"]["waiting"].as_array().unwrap();
    assert_eq!(waiting.len(), 1);
    assert_eq!(waiting[0]["id"], id);
    assert!(body["jobs"]["active"].as_array().unwrap().is_empty());
    assert!(body["jobs"]["completed"].as_array().unwrap().is_empty());
    assert!(body["jobs"]["failed"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn delete_cancels_waiting_job() {
    let app = service().await;
    let created = body_json(app.clone().oneshot(enqueue_request()).await.unwrap()).await;
    let id = created["job"]["id"].as_str().unwrap().to_string();

    let response =
        app.clone().oneshot(delete(&format!("/api/queue/jobs/ai-analysis/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(true));

    // Gone afterwards, both for status queries and repeat deletes.
    let response =
        app.clone().oneshot(get(&format!("/api/queue/jobs/ai-analysis/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response =
        app.oneshot(delete(&format!("/api/queue/jobs/ai-analysis/{id}"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn stats_cover_registered_queues() {
    let app = service().await;
    app.clone().oneshot(enqueue_request()).await.unwrap();

    let response = app.clone().oneshot(get("/api/queue/stats")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let stats = body["stats"].as_object().unwrap();
    assert_eq!(stats.len(), 4);
    assert_eq!(stats["ai-analysis"]["waiting"], 1);
    assert_eq!(stats["slack-sync"]["waiting"], 0);

    let response = app.oneshot(get("/api/queue/stats?queue=ai-analysis")).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["stats"].as_object().unwrap().len(), 1);
}

#[tokio::test]
async fn slack_sync_route_validates_channel() {
    let app = service().await;

    let response = app
        .clone()
        .oneshot(post("/api/queue/slack/sync-channel", json!({"channelName": "general"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .oneshot(post(
            "/api/queue/slack/sync-channel",
            json!({"channelId": "C42", "channelName": "general", "projectId": "p-1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["job"]["queue"], "slack-sync");
    assert_eq!(body["job"]["type"], "sync-channel");
}

#[tokio::test]
async fn whatsapp_sync_route_enqueues_ingest_job() {
    let app = service().await;
    let response = app
        .oneshot(post(
            "/api/queue/whatsapp/sync-messages",
            json!({"chatId": "wa-7", "lastTimestamp": 0, "syncType": "incremental"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["job"]["queue"], "whatsapp-sync");
}

#[tokio::test]
async fn chain_endpoints_report_not_found_until_tracked() {
    let app = service().await;
    let response = app.clone().oneshot(get("/api/queue/chains/flow-1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.oneshot(delete("/api/queue/chains/flow-1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["success"], json!(false));
}
