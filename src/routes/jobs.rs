use axum::extract::{Multipart, Path, State};
use axum::Json;
use garde::Validate;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::models::job::{Job, Metadata};
use crate::models::requests::{PriorityOutcome, PriorityRequest, QueueStatus, StatusCounts, SubmitRequest, Submission};
use crate::routes::ApiError;
use crate::services::storage::{fingerprint, metadata_from_relative_path};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub file_id: Uuid,
    /// Public path to pass back as `image_path` when creating a task.
    pub path: String,
    pub url: String,
    pub hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reused_task_id: Option<Uuid>,
    pub metadata: Metadata,
}

/// POST /upload: store an image, or point at the job that already has it.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut relative_path: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadUpload(e.to_string()))?
    {
        let field_name = field.name().map(str::to_owned);
        match field_name.as_deref() {
            Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
                let data = field.bytes().await.map_err(|e| ApiError::BadUpload(e.to_string()))?;
                file = Some((name, data.to_vec()));
            }
            Some("relative_path") => {
                relative_path = Some(field.text().await.map_err(|e| ApiError::BadUpload(e.to_string()))?);
            }
            _ => {}
        }
    }

    let (filename, bytes) = file.ok_or_else(|| ApiError::BadUpload("missing `file` field".into()))?;
    image::guess_format(&bytes).map_err(|_| ApiError::UnsupportedMedia)?;

    let hash = fingerprint(&bytes);
    let metadata = relative_path
        .as_deref()
        .map(metadata_from_relative_path)
        .unwrap_or_default();

    let existing = state.dedup.job_for(&hash).and_then(|id| state.job(id));
    if let Some(job) = existing {
        tracing::info!(job_id = %job.id, "Upload matches a known image");
        return Ok(Json(UploadResponse {
            file_id: job.id,
            url: job.image_path.clone(),
            path: job.image_path,
            hash,
            reused_task_id: Some(job.id),
            metadata,
        }));
    }

    let (file_id, stored) = state.storage.save_upload(&bytes, &filename).await?;
    let public = state
        .storage
        .public_path(&stored)
        .ok_or_else(|| ApiError::Internal("upload stored outside the static root".into()))?;
    tracing::info!(file_id = %file_id, bytes = bytes.len(), "Upload stored");

    Ok(Json(UploadResponse {
        file_id,
        path: public.clone(),
        url: public,
        hash,
        reused_task_id: None,
        metadata,
    }))
}

/// POST /segment/task: create a job, reusing prior work when possible.
pub async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<Submission>, ApiError> {
    request.validate()?;
    Ok(Json(state.submit(request).await?))
}

#[derive(Debug, Serialize)]
pub struct PriorityResponse {
    pub task_id: Uuid,
    pub outcome: PriorityOutcome,
}

/// POST /segment/priority
pub async fn update_priority(
    State(state): State<AppState>,
    Json(request): Json<PriorityRequest>,
) -> Result<Json<PriorityResponse>, ApiError> {
    request.validate()?;
    let outcome = state.bump_priority(request.task_id, request.priority).await?;
    Ok(Json(PriorityResponse {
        task_id: request.task_id,
        outcome,
    }))
}

/// DELETE /tasks/{task_id}
pub async fn delete_task(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    if state.delete(task_id).await {
        Ok(Json(json!({ "status": "deleted", "task_id": task_id })))
    } else {
        Err(ApiError::NotFound(task_id))
    }
}

/// GET /results/{task_id}
pub async fn get_results(
    State(state): State<AppState>,
    Path(task_id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state.job(task_id).map(Json).ok_or(ApiError::NotFound(task_id))
}

/// GET /segment/status
pub async fn segmentation_status(State(state): State<AppState>) -> Json<StatusCounts> {
    Json(state.counts())
}

/// GET /status
pub async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.queue_status())
}

/// GET /tasks
pub async fn list_tasks(State(state): State<AppState>) -> Json<Vec<Job>> {
    Json(state.jobs())
}
