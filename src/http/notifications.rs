use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use crate::error::AppError;
use crate::notification::SendError;
use crate::notifier::{Notification, NotifierId};

use super::AppState;

#[derive(Deserialize)]
pub struct AppKeyQuery {
    app_key: String,
}

#[derive(Deserialize)]
pub struct SubmitNotificationBody {
    notifier_id: Option<String>,
    title: Option<String>,
    message: String,
    #[serde(default)]
    error_occurred: bool,
}

/// `POST /api/v1/notifications?app_key=<key>`. Validates the key against
/// configured applications, resolves a missing `notifier_id` to the
/// application's own default, and forwards to `NotificationService::send`.
pub async fn submit(
    State(state): State<AppState>,
    Query(query): Query<AppKeyQuery>,
    Json(body): Json<SubmitNotificationBody>,
) -> Response {
    match handle(state, query, body).await {
        Ok(()) => (axum::http::StatusCode::OK, Json(serde_json::json!({}))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn handle(
    state: AppState,
    query: AppKeyQuery,
    body: SubmitNotificationBody,
) -> crate::error::AppResult<()> {
    let application = state
        .applications
        .get(&query.app_key)
        .ok_or(AppError::Unauthorized)?;

    if body.message.trim().is_empty() {
        return Err(AppError::BadRequest("message must not be empty".to_string()));
    }

    let notifier_id = match body.notifier_id {
        Some(id) => NotifierId::new(id).map_err(|e| AppError::BadRequest(e.to_string()))?,
        None => NotifierId::new(application.default_notifier_id.clone())
            .map_err(|e| AppError::BadRequest(e.to_string()))?,
    };

    let notification = Notification {
        notifier_id: Some(notifier_id),
        task_id: None,
        command_id: None,
        instance_id: None,
        title: body.title,
        message: body.message,
        elapsed: std::time::Duration::ZERO,
        error_occurred: body.error_occurred,
        cancelable: false,
    };

    state.sender.send(notification).await.map_err(|e| match e {
        SendError::ServiceNotRunning => AppError::ServiceNotRunning,
        SendError::NotifierNotFound(id) => {
            AppError::BadRequest(format!("unknown notifier {id:?}"))
        }
        SendError::Unavailable(id) => {
            AppError::ServiceUnavailable(format!("notifier {id:?} queue is full"))
        }
        SendError::InvalidInput(msg) => AppError::BadRequest(msg),
    })
}
