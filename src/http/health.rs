use std::collections::HashMap;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime: i64,
    pub dependencies: HashMap<String, DependencyHealth>,
}

#[derive(Serialize)]
pub struct DependencyHealth {
    pub status: &'static str,
    pub message: String,
}

/// `GET /health`. Aggregates the Task Service and Notification Service's own
/// running state; never fails the request itself, only the reported status.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let mut dependencies = HashMap::new();

    let task_service_up = state.task_service.is_running();
    dependencies.insert(
        "task_service".to_string(),
        DependencyHealth {
            status: if task_service_up { "healthy" } else { "unhealthy" },
            message: if task_service_up {
                "running".to_string()
            } else {
                "not running".to_string()
            },
        },
    );

    let notification_service_up = state.sender.health().is_ok();
    dependencies.insert(
        "notification_service".to_string(),
        DependencyHealth {
            status: if notification_service_up {
                "healthy"
            } else {
                "unhealthy"
            },
            message: if notification_service_up {
                "running".to_string()
            } else {
                "not running".to_string()
            },
        },
    );

    let status = if task_service_up && notification_service_up {
        "healthy"
    } else {
        "unhealthy"
    };

    Json(HealthResponse {
        status,
        uptime: state.started_at.elapsed().as_secs() as i64,
        dependencies,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_health_serializes_with_expected_keys() {
        let health = DependencyHealth {
            status: "healthy",
            message: "running".to_string(),
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["message"], "running");
    }
}
