use garde::Validate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::job::{JobStatus, Metadata, Thresholds, DEFAULT_IOU_THRESHOLD, DEFAULT_SCORE_THRESHOLD};
use crate::services::queue::{Priority, DEFAULT_PRIORITY, LOWEST_PRIORITY};
use crate::services::storage::{is_public_path, PUBLIC_PREFIX};

/// Request to create a segmentation job.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SubmitRequest {
    #[garde(length(min = 1, max = 4096), custom(under_static_root))]
    pub image_path: String,

    #[serde(default = "default_priority")]
    #[garde(range(max = LOWEST_PRIORITY))]
    pub priority: Priority,

    #[serde(default = "default_iou")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub iou_threshold: f64,

    #[serde(default = "default_score")]
    #[garde(range(min = 0.0, max = 1.0))]
    pub score_threshold: f64,

    /// Content fingerprint of the image, enables reuse of prior work.
    #[serde(default)]
    #[garde(length(min = 1, max = 128))]
    pub file_hash: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub metadata: Metadata,
}

impl SubmitRequest {
    pub fn new(image_path: impl Into<String>) -> Self {
        Self {
            image_path: image_path.into(),
            priority: DEFAULT_PRIORITY,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            file_hash: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.file_hash = Some(fingerprint.into());
        self
    }

    pub fn with_thresholds(mut self, iou: f64, score: f64) -> Self {
        self.iou_threshold = iou;
        self.score_threshold = score;
        self
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            iou_threshold: self.iou_threshold,
            score_threshold: self.score_threshold,
        }
    }
}

fn under_static_root(value: &str, _context: &()) -> garde::Result {
    if is_public_path(value) {
        Ok(())
    } else {
        Err(garde::Error::new(format!("must be a path under {}/", PUBLIC_PREFIX)))
    }
}

fn default_priority() -> Priority {
    DEFAULT_PRIORITY
}

fn default_iou() -> f64 {
    DEFAULT_IOU_THRESHOLD
}

fn default_score() -> f64 {
    DEFAULT_SCORE_THRESHOLD
}

/// Outcome of a submission.
#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub task_id: Uuid,
    pub status: JobStatus,
    pub reused: bool,
}

/// Request to move a job up (or down) the queue.
#[derive(Debug, Deserialize, Validate)]
pub struct PriorityRequest {
    #[garde(skip)]
    pub task_id: Uuid,

    #[garde(range(max = LOWEST_PRIORITY))]
    pub priority: Priority,
}

/// Job counts per status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Queue depth together with the number of known jobs.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    pub queue_size: usize,
    pub tasks: usize,
}

/// Result of a priority bump.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOutcome {
    /// A new queue entry was pushed.
    Queued,
    /// The job is processing or completed; nothing was queued.
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_path_must_stay_under_static_root() {
        assert!(SubmitRequest::new("/static/uploads/a.png").validate().is_ok());
        for bad in ["/static/../victim.txt", "/etc/passwd", "uploads/a.png", "/static/"] {
            assert!(SubmitRequest::new(bad).validate().is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_thresholds_out_of_range_rejected() {
        let request = SubmitRequest::new("/static/uploads/a.png").with_thresholds(1.5, 0.5);
        assert!(request.validate().is_err());
    }
}
