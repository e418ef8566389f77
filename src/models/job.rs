use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::error::CoreError;

/// Default segmentation thresholds used when a caller omits them.
pub const DEFAULT_IOU_THRESHOLD: f64 = 0.8;
pub const DEFAULT_SCORE_THRESHOLD: f64 = 0.5;

/// Caller-supplied metadata attached to a job. Opaque to the core.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a segmentation job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Forward-only transitions. The two backward moves (restart recovery
    /// and explicit retry of a failed job) go through dedicated methods.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// The two numeric thresholds handed to the segmentation collaborator.
/// Dedup reuse requires both to match exactly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    #[serde(rename = "iou")]
    pub iou_threshold: f64,
    #[serde(rename = "score")]
    pub score_threshold: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
        }
    }
}

/// Bounding box of an extracted region in source-image pixels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// One extracted sticker as recorded on a completed job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StickerRegion {
    /// Public path of the stored crop.
    pub path: String,
    #[serde(rename = "box")]
    pub bbox: BoundingBox,
    pub score: f32,
}

/// A segmentation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub image_path: String,
    pub status: JobStatus,
    #[serde(default)]
    pub regions: Vec<StickerRegion>,
    pub overlay_path: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Job {
    pub fn new(image_path: impl Into<String>, thresholds: Thresholds, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            image_path: image_path.into(),
            status: JobStatus::Pending,
            regions: Vec::new(),
            overlay_path: None,
            error: None,
            created_at: now,
            updated_at: now,
            thresholds,
            metadata,
        }
    }

    /// Apply a forward status transition.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Record a successful segmentation. Result fields are only ever set here.
    pub fn complete(
        &mut self,
        regions: Vec<StickerRegion>,
        overlay_path: Option<String>,
    ) -> Result<(), CoreError> {
        self.transition(JobStatus::Completed)?;
        self.regions = regions;
        self.overlay_path = overlay_path;
        self.error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), CoreError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Restart recovery: an interrupted attempt is discarded, never trusted.
    /// Returns true if the job needs to be re-enqueued.
    pub fn recover(&mut self) -> bool {
        match self.status {
            JobStatus::Processing => {
                self.status = JobStatus::Pending;
                self.updated_at = Utc::now();
                true
            }
            JobStatus::Pending => true,
            JobStatus::Completed | JobStatus::Failed => false,
        }
    }

    /// Explicit caller retry of a failed job.
    pub fn retry(&mut self) -> Result<(), CoreError> {
        if self.status != JobStatus::Failed {
            return Err(CoreError::InvalidTransition {
                job_id: self.id,
                from: self.status,
                to: JobStatus::Pending,
            });
        }
        self.status = JobStatus::Pending;
        self.error = None;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new("/static/uploads/a.png", Thresholds::default(), Metadata::new())
    }

    #[test]
    fn test_forward_transitions() {
        let mut job = sample_job();
        assert!(job.transition(JobStatus::Processing).is_ok());
        assert!(job.complete(Vec::new(), None).is_ok());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut job = sample_job();
        job.transition(JobStatus::Processing).unwrap();
        job.fail("boom").unwrap();
        let err = job.transition(JobStatus::Processing).unwrap_err();
        assert!(matches!(err, CoreError::InvalidTransition { .. }));
        assert_eq!(job.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut job = sample_job();
        assert!(job.complete(Vec::new(), None).is_err());
        assert!(job.regions.is_empty());
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[test]
    fn test_recover_resets_processing_only() {
        let mut job = sample_job();
        job.transition(JobStatus::Processing).unwrap();
        assert!(job.recover());
        assert_eq!(job.status, JobStatus::Pending);

        let mut done = sample_job();
        done.transition(JobStatus::Processing).unwrap();
        done.complete(Vec::new(), None).unwrap();
        assert!(!done.recover());
        assert_eq!(done.status, JobStatus::Completed);
    }

    #[test]
    fn test_retry_only_from_failed() {
        let mut job = sample_job();
        assert!(job.retry().is_err());
        job.transition(JobStatus::Processing).unwrap();
        job.fail("collaborator raised").unwrap();
        job.retry().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_none());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        assert_eq!(JobStatus::Failed.to_string(), "failed");
        assert_eq!("completed".parse::<JobStatus>().unwrap(), JobStatus::Completed);
    }

    #[test]
    fn test_thresholds_flatten_into_job() {
        let job = sample_job();
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["iou"], 0.8);
        assert_eq!(value["score"], 0.5);
        let back: Job = serde_json::from_value(value).unwrap();
        assert_eq!(back.thresholds, job.thresholds);
    }
}
