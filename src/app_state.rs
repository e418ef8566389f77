use std::sync::Arc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::CoreError;
use crate::models::aggregation::{AggregationProgress, AggregationResult, ClusterParams};
use crate::models::job::{Job, JobStatus};
use crate::models::requests::{PriorityOutcome, QueueStatus, StatusCounts, SubmitRequest, Submission};
use crate::services::aggregation::{AggregationTrigger, TriggerOutcome};
use crate::services::clustering::{DensityGrouper, Grouper, PcaProjector, Projector};
use crate::services::embedding::{Embedder, HistogramEmbedder, RemoteEmbedder, HISTOGRAM_DIM};
use crate::services::executor::BlockingPool;
use crate::services::queue::{Priority, PriorityScheduler};
use crate::services::segmentation::{RemoteSegmenter, Segmenter, TileSegmenter};
use crate::services::storage::{is_public_path, ArtifactStorage};
use crate::store::aggregation::AggregationStore;
use crate::store::dedup::DedupIndex;
use crate::store::features::FeatureCache;
use crate::store::jobs::JobStore;
use crate::store::{log_persist_failure, SnapshotFile, AGGREGATION_FILE, DEDUP_FILE, FEATURES_FILE, JOBS_FILE};

/// Grid used by the offline segmenter.
const MOCK_GRID: u32 = 3;

/// The four external collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub segmenter: Arc<dyn Segmenter>,
    pub embedder: Arc<dyn Embedder>,
    pub grouper: Arc<dyn Grouper>,
    pub projector: Arc<dyn Projector>,
}

impl Collaborators {
    /// Remote segmentation and embedding when an inference service is
    /// configured, local implementations otherwise. Grouping and
    /// projection always run in-process.
    pub fn from_config(config: &AppConfig) -> Self {
        let pool = BlockingPool::new(config.inference_threads);
        let grouper: Arc<dyn Grouper> = Arc::new(DensityGrouper::new(pool.clone(), config.group_radius));
        let projector: Arc<dyn Projector> = Arc::new(PcaProjector::new(pool.clone()));

        match config.remote_inference() {
            Some(url) => {
                tracing::info!(url, "Using remote inference service");
                Self {
                    segmenter: Arc::new(RemoteSegmenter::new(url, config.inference_token.clone())),
                    embedder: Arc::new(RemoteEmbedder::new(url, config.inference_token.clone(), HISTOGRAM_DIM)),
                    grouper,
                    projector,
                }
            }
            None => {
                tracing::info!("Using local mock collaborators");
                Self {
                    segmenter: Arc::new(TileSegmenter::new(pool.clone(), MOCK_GRID)),
                    embedder: Arc::new(HistogramEmbedder::new(pool)),
                    grouper,
                    projector,
                }
            }
        }
    }
}

/// Application context, created once at startup and shared by the worker,
/// the aggregation trigger and every route handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub jobs: Arc<JobStore>,
    pub dedup: Arc<DedupIndex>,
    pub features: Arc<FeatureCache>,
    pub results: Arc<AggregationStore>,
    pub scheduler: Arc<PriorityScheduler>,
    pub storage: ArtifactStorage,
    pub segmenter: Arc<dyn Segmenter>,
    pub aggregation: Arc<AggregationTrigger>,
}

impl AppState {
    /// Load every snapshot and re-enqueue unfinished jobs. Recovery is
    /// complete before this returns, so no submission can overtake it.
    pub async fn bootstrap(config: AppConfig, collaborators: Collaborators) -> Result<Self, CoreError> {
        let data_dir = config.data_dir.clone();
        let jobs = Arc::new(JobStore::new(SnapshotFile::new(data_dir.join(JOBS_FILE))));
        let dedup = Arc::new(DedupIndex::new(SnapshotFile::new(data_dir.join(DEDUP_FILE))));
        let features = Arc::new(FeatureCache::new(SnapshotFile::new(data_dir.join(FEATURES_FILE))));
        let results = Arc::new(AggregationStore::new(SnapshotFile::new(data_dir.join(AGGREGATION_FILE))));

        let storage = ArtifactStorage::new(&config.static_dir);
        storage.ensure_layout().await?;

        let job_count = jobs.restore();
        let dedup_count = dedup.restore();
        let feature_count = features.restore();
        let has_result = results.restore();
        tracing::info!(
            jobs = job_count,
            fingerprints = dedup_count,
            vectors = feature_count,
            aggregation = has_result,
            "Snapshots loaded"
        );

        let scheduler = Arc::new(PriorityScheduler::new());
        let requeued = jobs.recover();
        for id in &requeued {
            scheduler.push(*id, config.default_priority);
        }
        if !requeued.is_empty() {
            tracing::info!(count = requeued.len(), "Re-enqueued unfinished jobs");
            log_persist_failure("jobs", jobs.snapshot().await);
        }

        let aggregation = Arc::new(AggregationTrigger::new(
            storage.clone(),
            features.clone(),
            results.clone(),
            collaborators.embedder,
            collaborators.grouper,
            collaborators.projector,
            config.embedding_batch_size,
        ));

        Ok(Self {
            config: Arc::new(config),
            jobs,
            dedup,
            features,
            results,
            scheduler,
            storage,
            segmenter: collaborators.segmenter,
            aggregation,
        })
    }

    /// Create and enqueue a job, or hand back the prior job when the
    /// fingerprint was already processed with the same thresholds.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submission, CoreError> {
        if !is_public_path(&request.image_path) {
            return Err(CoreError::InvalidImagePath(request.image_path));
        }
        let thresholds = request.thresholds();

        if let Some(fingerprint) = request.file_hash.as_deref() {
            let existing = self
                .dedup
                .lookup(fingerprint, thresholds)
                .and_then(|id| self.jobs.get(id));
            if let Some(job) = existing {
                tracing::info!(job_id = %job.id, "Reusing job for known fingerprint");
                return Ok(Submission {
                    task_id: job.id,
                    status: job.status,
                    reused: true,
                });
            }
        }

        let job = self
            .jobs
            .create(Job::new(request.image_path, thresholds, request.metadata))?;
        if let Some(fingerprint) = request.file_hash {
            self.dedup.record(fingerprint, job.id, thresholds);
            log_persist_failure("dedup", self.dedup.snapshot().await);
        }
        self.persist_jobs().await;

        self.scheduler.push(job.id, request.priority);
        metrics::counter!("sticker_jobs_submitted_total").increment(1);
        tracing::info!(job_id = %job.id, priority = request.priority, "Job submitted");

        Ok(Submission {
            task_id: job.id,
            status: job.status,
            reused: false,
        })
    }

    /// Push another queue entry for a job. Processing and completed jobs
    /// are left alone; a failed job is reset to pending first.
    pub async fn bump_priority(&self, job_id: Uuid, priority: Priority) -> Result<PriorityOutcome, CoreError> {
        let job = self.jobs.get(job_id).ok_or(CoreError::NotFound(job_id))?;
        match job.status {
            JobStatus::Pending => {}
            JobStatus::Failed => {
                self.jobs.update(job_id, |j| j.retry())?;
                self.persist_jobs().await;
                tracing::info!(job_id = %job_id, "Retrying failed job");
            }
            JobStatus::Processing | JobStatus::Completed => {
                tracing::debug!(job_id = %job_id, status = %job.status, "Priority bump ignored");
                return Ok(PriorityOutcome::Ignored);
            }
        }
        self.scheduler.push(job_id, priority);
        tracing::info!(job_id = %job_id, priority, "Job re-prioritised");
        Ok(PriorityOutcome::Queued)
    }

    /// Remove a job with its artifacts and dedup record. Queue entries are
    /// left behind and skipped by the worker.
    pub async fn delete(&self, job_id: Uuid) -> bool {
        let Some(job) = self.jobs.get(job_id) else {
            return false;
        };
        self.storage.delete_job_artifacts(&job).await;
        let pruned = self.dedup.remove_by_job(job_id);
        self.jobs.delete(job_id);

        self.persist_jobs().await;
        if pruned > 0 {
            log_persist_failure("dedup", self.dedup.snapshot().await);
        }
        tracing::info!(job_id = %job_id, fingerprints = pruned, "Job deleted");
        true
    }

    pub fn job(&self, job_id: Uuid) -> Option<Job> {
        self.jobs.get(job_id)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.jobs.list()
    }

    pub fn counts(&self) -> StatusCounts {
        self.jobs.counts()
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queue_size: self.scheduler.size(),
            tasks: self.jobs.len(),
        }
    }

    pub fn trigger_aggregation(&self, params: ClusterParams) -> TriggerOutcome {
        self.aggregation.trigger(params)
    }

    pub fn aggregation_status(&self) -> AggregationProgress {
        self.aggregation.status()
    }

    pub fn aggregation_result(&self) -> Option<AggregationResult> {
        self.aggregation.result()
    }

    /// Nothing queued, nothing in hand and no job processing.
    pub fn is_idle(&self) -> bool {
        self.scheduler.is_drained() && self.jobs.count_with_status(JobStatus::Processing) == 0
    }

    /// Drop every job, index, cached vector, result and stored file.
    pub async fn reset(&self) -> Result<(), CoreError> {
        let guard = self.aggregation.exclusive().ok_or(CoreError::Busy)?;

        self.scheduler.clear();
        self.jobs.clear();
        self.dedup.clear();
        self.features.clear();
        self.jobs.remove_snapshot().await?;
        self.dedup.remove_snapshot().await?;
        self.features.remove_snapshot().await?;
        self.results.clear().await?;
        self.storage.wipe().await?;
        guard.reset_progress();

        tracing::warn!("All jobs, indices and artifacts were reset");
        Ok(())
    }

    pub(crate) async fn persist_jobs(&self) {
        log_persist_failure("jobs", self.jobs.snapshot().await);
    }
}
