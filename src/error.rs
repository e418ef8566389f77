use uuid::Uuid;

use crate::models::job::JobStatus;
use crate::services::storage::StorageError;

/// Errors surfaced by the orchestration core to its callers.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job id already exists: {0}")]
    DuplicateId(Uuid),

    #[error("Invalid status transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Operation refused while aggregation is running")]
    Busy,

    #[error("Image path is not under /static/: {0}")]
    InvalidImagePath(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Snapshot read/write failures. Logged by callers, never fatal.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Snapshot serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Failure raised by an external collaborator (segmentation, embedding,
/// grouping, projection).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Inference request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode inference payload: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Image processing failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Artifact I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Collaborator returned unusable output: {0}")]
    Protocol(String),

    #[error("Background inference task aborted: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Reasons an aggregation run ends in `failed`.
#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("Failed to enumerate artifacts: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}
