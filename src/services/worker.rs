use std::path::Path;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{CollaboratorError, CoreError};
use crate::models::aggregation::ClusterParams;
use crate::models::job::{Job, JobStatus, StickerRegion};
use crate::services::queue::QueueEntry;
use crate::services::segmentation::SegmentRequest;
use crate::services::storage::ArtifactStorage;

/// What the worker did with one dequeued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The job no longer exists.
    Missing,
    /// The job was not pending (duplicate or stale entry).
    Stale,
    Completed,
    Failed,
}

/// Handle for controlling a running worker.
pub struct WorkerHandle {
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Stop after the entry in hand (if any) is finished and wait for the
    /// loop to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "Worker task aborted");
        }
    }
}

/// Single consumer of the priority scheduler.
///
/// Job state transitions happen one entry at a time; the segmentation call
/// itself runs in its own task so a panicking collaborator fails the job
/// instead of the loop.
pub struct Worker {
    state: AppState,
}

impl Worker {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Spawn the loop. Dropping the handle also stops it.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(async move {
            self.run(&mut shutdown_rx).await;
        });
        WorkerHandle { shutdown_tx, join }
    }

    async fn run(&self, shutdown_rx: &mut mpsc::Receiver<()>) {
        tracing::info!(queued = self.state.scheduler.size(), "Worker started");

        loop {
            let entry = tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    tracing::info!("Worker received shutdown signal");
                    break;
                }
                entry = self.state.scheduler.pop() => entry,
            };

            self.handle(&entry).await;
            self.state.scheduler.mark_processed();

            if self.state.is_idle() {
                tracing::debug!("Queue drained, triggering aggregation");
                self.state.trigger_aggregation(ClusterParams::default());
            }
        }

        tracing::info!("Worker stopped");
    }

    /// Process one dequeued entry. Never fails: collaborator errors become
    /// a `failed` job.
    pub async fn handle(&self, entry: &QueueEntry) -> Handled {
        let jobs = &self.state.jobs;
        let job_id = entry.job_id;

        let Some(job) = jobs.get(job_id) else {
            tracing::debug!(job_id = %job_id, "Dequeued job no longer exists");
            return Handled::Missing;
        };
        if job.status != JobStatus::Pending {
            tracing::debug!(job_id = %job_id, status = %job.status, "Skipping stale queue entry");
            return Handled::Stale;
        }

        let job = match jobs.update(job_id, |j| j.transition(JobStatus::Processing)) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not start job");
                return Handled::Stale;
            }
        };
        self.state.persist_jobs().await;
        tracing::info!(job_id = %job_id, priority = entry.priority, image = %job.image_path, "Processing job");

        let started = Instant::now();
        let (outcome, handled) = match self.segment(&job).await {
            Ok((regions, overlay)) => {
                let count = regions.len();
                tracing::info!(
                    job_id = %job_id,
                    regions = count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Job completed"
                );
                metrics::counter!("sticker_jobs_completed_total").increment(1);
                (jobs.update(job_id, |j| j.complete(regions, overlay)), Handled::Completed)
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Job failed");
                metrics::counter!("sticker_jobs_failed_total").increment(1);
                // Crops written before the fault must not reach aggregation.
                self.state.storage.discard_results(job_id).await;
                let message = e.to_string();
                (jobs.update(job_id, |j| j.fail(message)), Handled::Failed)
            }
        };

        match outcome {
            Ok(_) => self.state.persist_jobs().await,
            Err(CoreError::NotFound(_)) => {
                // Deleted while processing; drop what the collaborator wrote.
                tracing::info!(job_id = %job_id, "Job deleted during processing, discarding output");
                self.state.storage.delete_job_artifacts(&job).await;
            }
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failed to record job outcome"),
        }
        handled
    }

    async fn segment(&self, job: &Job) -> Result<(Vec<StickerRegion>, Option<String>), CollaboratorError> {
        let storage = &self.state.storage;
        let image = storage.resolve(&job.image_path).ok_or_else(|| {
            CollaboratorError::Protocol(format!("image path {} is outside the static root", job.image_path))
        })?;
        // Output of an interrupted earlier attempt is never trusted.
        storage.discard_results(job.id).await;
        let request = SegmentRequest {
            image,
            output_dir: storage.job_dir(job.id),
            thresholds: job.thresholds,
        };

        let segmenter = self.state.segmenter.clone();
        let output = tokio::spawn(async move { segmenter.segment(request).await }).await??;

        let regions = output
            .regions
            .into_iter()
            .map(|region| {
                Ok(StickerRegion {
                    path: public_path(storage, job.id, &region.path)?,
                    bbox: region.bbox,
                    score: region.score,
                })
            })
            .collect::<Result<Vec<_>, CollaboratorError>>()?;
        let overlay = output
            .overlay
            .map(|p| public_path(storage, job.id, &p))
            .transpose()?;
        Ok((regions, overlay))
    }
}

fn public_path(storage: &ArtifactStorage, job_id: Uuid, file: &Path) -> Result<String, CollaboratorError> {
    storage
        .public_result_path(job_id, file)
        .ok_or_else(|| CollaboratorError::Protocol(format!("unusable artifact path {}", file.display())))
}
