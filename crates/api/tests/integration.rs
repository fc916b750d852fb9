//! Integration tests for API routes.
//!
//! Uses `tower::ServiceExt` to drive the Axum router without a real HTTP
//! server. The pipeline runs on the in-memory backends, so no PostgreSQL,
//! Redis or Telegram is needed.

use std::path::Path;
use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use laterbird_api::routes::{create_router, create_router_with_ui};
use laterbird_api::state::AppState;
use laterbird_engine::memory::{MemoryCache, MemoryChannel, MemoryQueue, MemoryStore};
use laterbird_engine::service::NotificationService;

// ============================================================
// Helpers
// ============================================================

struct TestApp {
    router: Router,
    store: Arc<MemoryStore>,
    cache: Arc<MemoryCache>,
    queue: Arc<MemoryQueue>,
}

const WEB_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../../web");

fn test_app() -> TestApp {
    build_app(create_router)
}

fn test_app_with_ui() -> TestApp {
    build_app(|state| create_router_with_ui(state, Path::new(WEB_DIR)))
}

fn build_app(router: impl FnOnce(AppState) -> Router) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());
    let queue = Arc::new(MemoryQueue::new());
    let service = NotificationService::new(
        store.clone(),
        cache.clone(),
        queue.clone(),
        Arc::new(MemoryChannel::new()),
        "notification",
    );

    TestApp {
        router: router(AppState::new(Arc::new(service))),
        store,
        cache,
        queue,
    }
}

async fn send(app: &TestApp, method: &str, uri: &str, body: Option<String>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            builder = builder.header("content-type", "application/json");
            Body::from(body)
        }
        None => Body::empty(),
    };

    let response = app
        .router
        .clone()
        .oneshot(builder.body(body).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

/// GET returning the raw body and its content type.
async fn fetch_text(app: &TestApp, uri: &str) -> (StatusCode, String, String) {
    let response = app
        .router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, content_type, String::from_utf8_lossy(&bytes).into_owned())
}

async fn create(app: &TestApp, body: Value) -> (StatusCode, Value) {
    send(app, "POST", "/api/v1/notify", Some(body.to_string())).await
}

// ============================================================
// Routes
// ============================================================

#[tokio::test]
async fn test_health_endpoint() {
    let app = test_app();
    let (status, json) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["service"], "laterbird-api");
    assert_eq!(json["channel"], "memory");
}

#[tokio::test]
async fn test_create_then_get_status() {
    let app = test_app();

    let (status, json) = create(&app, json!({"message": "hello", "chat_id": 42})).await;
    assert_eq!(status, StatusCode::OK);
    let id = json["id"].as_str().unwrap().to_string();
    assert!(!id.is_empty());

    let published = app.queue.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].delay_ms, 0);

    let (status, json) = send(&app, "GET", &format!("/api/v1/notify/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({"status": "created"}));
}

#[tokio::test]
async fn test_create_with_invalid_time_is_bad_request() {
    let app = test_app();

    let (status, json) = create(
        &app,
        json!({"message": "hello", "time": "next tuesday", "chat_id": 42}),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());
    assert!(app.queue.published().is_empty());
    assert_eq!(app.store.calls(), 0);
}

#[tokio::test]
async fn test_create_with_empty_message_is_bad_request() {
    let app = test_app();
    let (status, _) = create(&app, json!({"message": "", "chat_id": 42})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_with_malformed_body_is_bad_request() {
    let app = test_app();

    let (status, json) = send(&app, "POST", "/api/v1/notify", Some("{\"message\":".to_string())).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].is_string());

    let (status, _) = create(&app, json!({"message": "missing chat"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_create_when_broker_is_down() {
    let app = test_app();
    app.queue.fail_publish(true);

    let (status, json) = create(&app, json!({"message": "hello", "chat_id": 42})).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(json["error"].as_str().unwrap().contains("channel closed"));

    let (_, list) = send(&app, "GET", "/api/v1/notifications", None).await;
    assert_eq!(list, json!([]));
}

#[tokio::test]
async fn test_create_survives_cache_outage() {
    let app = test_app();
    app.cache.fail_writes(true);
    app.cache.fail_reads(true);

    let (status, json) = create(&app, json!({"message": "hello", "chat_id": 42})).await;
    assert_eq!(status, StatusCode::OK);

    let id = json["id"].as_str().unwrap();
    let (status, json) = send(&app, "GET", &format!("/api/v1/notify/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "created");
}

#[tokio::test]
async fn test_get_unknown_is_not_found() {
    let app = test_app();
    let (status, json) = send(&app, "GET", "/api/v1/notify/does-not-exist", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_delete_cancels_notification() {
    let app = test_app();
    let (_, json) = create(&app, json!({"message": "hello", "chat_id": 42})).await;
    let id = json["id"].as_str().unwrap().to_string();

    let (status, json) = send(&app, "DELETE", &format!("/api/v1/notify/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], format!("notify {} is deleted", id));

    let (status, json) = send(&app, "GET", &format!("/api/v1/notify/{}", id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "cancelled");
}

#[tokio::test]
async fn test_delete_unknown_is_not_found() {
    let app = test_app();
    let (status, _) = send(&app, "DELETE", "/api/v1/notify/does-not-exist", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_notifications_newest_first() {
    let app = test_app();
    create(&app, json!({"message": "first", "chat_id": 1})).await;
    create(
        &app,
        json!({"message": "second", "time": "2999-01-01T00:00:00Z", "chat_id": 2}),
    )
    .await;

    let (status, json) = send(&app, "GET", "/api/v1/notifications", None).await;
    assert_eq!(status, StatusCode::OK);

    let list = json.as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["message"], "second");
    assert_eq!(list[0]["time"], "2999-01-01T00:00:00Z");
    assert_eq!(list[0]["status"], "created");
    assert_eq!(list[1]["message"], "first");
    assert_eq!(list[1]["chat_id"], 1);
}

// ============================================================
// Browser UI
// ============================================================

#[tokio::test]
async fn test_index_page_is_served() {
    let app = test_app_with_ui();
    let (status, content_type, body) = fetch_text(&app, "/").await;

    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/html"), "{content_type}");
    assert!(body.contains("/static/js/app.js"));
}

#[tokio::test]
async fn test_static_assets_are_served() {
    let app = test_app_with_ui();

    let (status, content_type, body) = fetch_text(&app, "/static/js/app.js").await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.contains("javascript"), "{content_type}");
    assert!(body.contains("/api/v1/notify"));

    let (status, _, _) = fetch_text(&app, "/static/js/missing.js").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_api_still_served_alongside_ui() {
    let app = test_app_with_ui();
    let (status, json) = send(&app, "GET", "/api/v1/notifications", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!([]));
}
