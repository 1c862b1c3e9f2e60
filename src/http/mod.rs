//! HTTP surface (components I/J): health, version, and the ad-hoc
//! notification intake. Kept deliberately thin — all business logic lives
//! in the services these handlers call into.

pub mod health;
pub mod notifications;
pub mod version;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::ApplicationConfig;
use crate::notification::NotificationService;
use crate::task::service::TaskServiceHandle;

pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub task_service: TaskServiceHandle,
    pub sender: Arc<NotificationService>,
    pub applications: Arc<HashMap<String, ApplicationConfig>>,
    pub started_at: Instant,
}

pub fn router(state: AppState, allow_origins: &[String]) -> Router {
    let cors = if allow_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };

    let notifications = Router::new()
        .route("/api/v1/notifications", post(notifications::submit))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES));

    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(version::version))
        .merge(notifications)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
