//! Single-flight background aggregation.
//!
//! At most one run is active at a time. A run enumerates every stored crop,
//! resolves feature vectors through the cache, groups and projects them and
//! replaces the stored [`AggregationResult`]. A failed run leaves the
//! previous result in place.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tokio::task::JoinHandle;

use crate::error::{AggregationError, CollaboratorError};
use crate::models::aggregation::{AggregationProgress, AggregationResult, AggregationStatus, ClusterParams};
use crate::services::clustering::{feature_matrix, Grouper, Projector};
use crate::services::embedding::{Embedder, ProgressFn};
use crate::services::storage::ArtifactStorage;
use crate::store::aggregation::AggregationStore;
use crate::store::features::FeatureCache;
use crate::store::{log_persist_failure, read_lock, write_lock};

/// Answer to a trigger request.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    Started,
    /// A run is already active; nothing was queued.
    AlreadyRunning(AggregationProgress),
}

pub struct AggregationTrigger {
    storage: ArtifactStorage,
    features: Arc<FeatureCache>,
    results: Arc<AggregationStore>,
    embedder: Arc<dyn Embedder>,
    grouper: Arc<dyn Grouper>,
    projector: Arc<dyn Projector>,
    batch_size: usize,

    running: AtomicBool,
    progress: RwLock<AggregationProgress>,
    current: Arc<AtomicUsize>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl AggregationTrigger {
    pub fn new(
        storage: ArtifactStorage,
        features: Arc<FeatureCache>,
        results: Arc<AggregationStore>,
        embedder: Arc<dyn Embedder>,
        grouper: Arc<dyn Grouper>,
        projector: Arc<dyn Projector>,
        batch_size: usize,
    ) -> Self {
        Self {
            storage,
            features,
            results,
            embedder,
            grouper,
            projector,
            batch_size: batch_size.max(1),
            running: AtomicBool::new(false),
            progress: RwLock::new(AggregationProgress::default()),
            current: Arc::new(AtomicUsize::new(0)),
            supervisor: Mutex::new(None),
        }
    }

    /// Start a run unless one is active. Returns immediately; the run and
    /// its supervisor are spawned on the runtime.
    pub fn trigger(self: &Arc<Self>, params: ClusterParams) -> TriggerOutcome {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Aggregation already running, ignoring trigger");
            return TriggerOutcome::AlreadyRunning(self.status());
        }

        self.current.store(0, Ordering::SeqCst);
        *write_lock(&self.progress) = AggregationProgress {
            status: AggregationStatus::Running,
            total: 0,
            current: 0,
            started_at: Some(Utc::now()),
            estimated_remaining: -1.0,
        };
        tracing::info!(
            min_cluster_size = params.min_cluster_size,
            min_samples = params.min_samples,
            epsilon = params.epsilon,
            "Aggregation started"
        );

        let run = {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.run(params).await })
        };
        let this = Arc::clone(self);
        let supervisor = tokio::spawn(async move {
            let started = Instant::now();
            let status = match run.await {
                Ok(Ok(())) => AggregationStatus::Completed,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Aggregation failed");
                    AggregationStatus::Failed
                }
                Err(e) => {
                    tracing::error!(error = %e, "Aggregation task aborted");
                    AggregationStatus::Failed
                }
            };
            this.finish(status, started.elapsed().as_secs_f64());
        });
        *self.supervisor.lock().unwrap_or_else(PoisonError::into_inner) = Some(supervisor);

        TriggerOutcome::Started
    }

    async fn run(&self, params: ClusterParams) -> Result<(), AggregationError> {
        let artifacts = self.storage.list_artifacts().await?;
        write_lock(&self.progress).total = artifacts.len();

        if artifacts.is_empty() {
            tracing::info!("No artifacts to aggregate");
            log_persist_failure("aggregation", self.results.set(AggregationResult::default()).await);
            return Ok(());
        }

        let counter = Arc::clone(&self.current);
        let progress: ProgressFn = Arc::new(move |done: usize| {
            counter.fetch_max(done, Ordering::SeqCst);
        });
        let vectors = self
            .features
            .compute_missing(&artifacts, self.embedder.as_ref(), self.batch_size, progress)
            .await?;
        let matrix = feature_matrix(&vectors);

        let labels = self.grouper.group(Arc::clone(&matrix), params).await?;
        expect_rows("grouping", labels.len(), artifacts.len())?;
        let coords = self.projector.project(matrix).await?;
        expect_rows("projection", coords.len(), artifacts.len())?;

        let paths: Vec<String> = artifacts.into_iter().map(|a| a.public_path).collect();
        let result = AggregationResult::organize(&paths, &labels, &coords);
        tracing::info!(
            groups = result.groups.len(),
            grouped = result.total_grouped,
            ungrouped = result.total_ungrouped,
            "Aggregation result assembled"
        );
        log_persist_failure("aggregation", self.results.set(result).await);
        Ok(())
    }

    fn finish(&self, status: AggregationStatus, seconds: f64) {
        {
            let mut progress = write_lock(&self.progress);
            progress.status = status;
            progress.current = self.current.load(Ordering::SeqCst);
            progress.estimated_remaining = 0.0;
        }
        metrics::counter!("sticker_aggregation_runs_total", "status" => status.to_string()).increment(1);
        metrics::histogram!("sticker_aggregation_seconds").record(seconds);
        tracing::info!(%status, seconds, "Aggregation finished");
        self.running.store(false, Ordering::SeqCst);
    }

    /// Current progress, with a fresh time estimate while running.
    pub fn status(&self) -> AggregationProgress {
        let mut progress = read_lock(&self.progress).clone();
        if progress.status == AggregationStatus::Running {
            progress.current = self.current.load(Ordering::SeqCst);
        }
        progress.estimate_remaining(Utc::now());
        progress
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn result(&self) -> Option<AggregationResult> {
        self.results.get()
    }

    /// Wait for the most recently started run, if any, to finish.
    pub async fn wait(&self) {
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Aggregation supervisor aborted");
            }
        }
    }

    /// Block new runs until the guard is dropped. `None` while a run is
    /// active.
    pub fn exclusive(&self) -> Option<ExclusiveGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| ExclusiveGuard { trigger: self })
    }
}

/// Holds the run slot without running anything. See
/// [`AggregationTrigger::exclusive`].
pub struct ExclusiveGuard<'a> {
    trigger: &'a AggregationTrigger,
}

impl ExclusiveGuard<'_> {
    /// Forget the last run's progress.
    pub fn reset_progress(&self) {
        self.trigger.current.store(0, Ordering::SeqCst);
        *write_lock(&self.trigger.progress) = AggregationProgress::default();
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.trigger.running.store(false, Ordering::SeqCst);
    }
}

fn expect_rows(stage: &str, got: usize, expected: usize) -> Result<(), CollaboratorError> {
    if got == expected {
        Ok(())
    } else {
        Err(CollaboratorError::Protocol(format!(
            "{} returned {} rows for {} artifacts",
            stage, got, expected
        )))
    }
}
