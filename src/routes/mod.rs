use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde_json::json;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::CoreError;
use crate::services::storage::StorageError;

pub mod clusters;
pub mod health;
pub mod jobs;
pub mod metrics;

/// Errors returned by route handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Task not found: {0}")]
    NotFound(Uuid),

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Bad upload: {0}")]
    BadUpload(String),

    #[error("Unsupported image format")]
    UnsupportedMedia,

    #[error("Aggregation is running, try again later")]
    Busy,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::BadUpload(_) => StatusCode::BAD_REQUEST,
            ApiError::UnsupportedMedia => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ApiError::Busy => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound(id) => ApiError::NotFound(id),
            CoreError::Busy => ApiError::Busy,
            CoreError::InvalidTransition { .. } | CoreError::InvalidImagePath(_) => {
                ApiError::Validation(err.to_string())
            }
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        ApiError::Internal(err.to_string())
    }
}

impl From<garde::Report> for ApiError {
    fn from(report: garde::Report) -> Self {
        ApiError::Validation(report.to_string())
    }
}

/// All API routes except `/metrics`, which carries its own state.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/upload", post(jobs::upload_image))
        .route("/segment/task", post(jobs::create_task))
        .route("/segment/priority", post(jobs::update_priority))
        .route("/segment/status", get(jobs::segmentation_status))
        .route("/status", get(jobs::queue_status))
        .route("/tasks", get(jobs::list_tasks))
        .route("/tasks/{task_id}", delete(jobs::delete_task))
        .route("/results/{task_id}", get(jobs::get_results))
        .route("/cluster", post(clusters::trigger_clustering))
        .route("/cluster/status", get(clusters::clustering_status))
        .route("/clusters", get(clusters::get_clusters))
        .route("/reset", post(clusters::reset_all))
        .with_state(state)
}
