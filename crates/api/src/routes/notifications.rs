//! Notification routes: create, status, cancel and list.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use laterbird_common::error::AppError;
use laterbird_common::types::Notification;

use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/notify", post(create_notification))
        .route(
            "/api/v1/notify/{id}",
            get(get_notification_status).delete(delete_notification),
        )
        .route("/api/v1/notifications", get(list_notifications))
}

#[derive(Debug, Deserialize)]
pub struct CreateNotificationRequest {
    pub message: String,
    /// RFC3339 send time; empty or absent sends immediately.
    #[serde(default)]
    pub time: String,
    pub chat_id: i64,
}

/// POST /api/v1/notify — Schedule a notification.
async fn create_notification(
    State(state): State<AppState>,
    body: Result<Json<CreateNotificationRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, AppError> {
    let Json(req) = body.map_err(|rejection| AppError::Validation(rejection.body_text()))?;

    let id = state
        .service
        .create(Notification::new(req.message, req.time, req.chat_id))
        .await?;

    Ok(Json(json!({ "id": id })))
}

/// GET /api/v1/notify/:id — Current delivery status.
async fn get_notification_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let status = state.service.get_status(&id).await?;
    Ok(Json(json!({ "status": status })))
}

/// DELETE /api/v1/notify/:id — Cancel a notification.
async fn delete_notification(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.service.delete(&id).await?;
    Ok(Json(json!({ "status": format!("notify {} is deleted", id) })))
}

/// GET /api/v1/notifications — Every notification, newest first.
async fn list_notifications(
    State(state): State<AppState>,
) -> Result<Json<Vec<Notification>>, AppError> {
    let notifications = state.service.list_all().await?;
    Ok(Json(notifications))
}
