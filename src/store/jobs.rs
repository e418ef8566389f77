use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::{CoreError, PersistenceError};
use crate::models::job::{Job, JobStatus};
use crate::models::requests::StatusCounts;
use crate::store::{read_lock, write_lock, SnapshotFile};

/// Durable table of job records.
#[derive(Debug)]
pub struct JobStore {
    jobs: RwLock<HashMap<Uuid, Job>>,
    snapshot: SnapshotFile,
}

impl JobStore {
    pub fn new(snapshot: SnapshotFile) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            snapshot,
        }
    }

    /// Replace the in-memory table with the snapshot contents.
    pub fn restore(&self) -> usize {
        let loaded: HashMap<Uuid, Job> = self.snapshot.load_or_default();
        let count = loaded.len();
        *write_lock(&self.jobs) = loaded;
        tracing::info!(count, "Restored job table");
        count
    }

    /// Write the full table to disk.
    pub async fn snapshot(&self) -> Result<(), PersistenceError> {
        self.snapshot
            .save_with(|| serde_json::to_vec_pretty(&*read_lock(&self.jobs)))
            .await
    }

    /// Insert a new job. The record always starts out `pending`.
    pub fn create(&self, mut job: Job) -> Result<Job, CoreError> {
        let mut jobs = write_lock(&self.jobs);
        if jobs.contains_key(&job.id) {
            return Err(CoreError::DuplicateId(job.id));
        }
        job.status = JobStatus::Pending;
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> Option<Job> {
        read_lock(&self.jobs).get(&id).cloned()
    }

    /// Apply `mutate` to the stored record under the table lock and return
    /// the updated copy. The record is left untouched if `mutate` fails.
    pub fn update<F>(&self, id: Uuid, mutate: F) -> Result<Job, CoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), CoreError>,
    {
        let mut jobs = write_lock(&self.jobs);
        let job = jobs.get_mut(&id).ok_or(CoreError::NotFound(id))?;
        let mut draft = job.clone();
        mutate(&mut draft)?;
        *job = draft.clone();
        Ok(draft)
    }

    /// Remove a record, returning it if it existed. Storage artifacts are
    /// the caller's concern.
    pub fn delete(&self, id: Uuid) -> Option<Job> {
        write_lock(&self.jobs).remove(&id)
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<Job> {
        let mut jobs: Vec<Job> = read_lock(&self.jobs).values().cloned().collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    pub fn len(&self) -> usize {
        read_lock(&self.jobs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count_with_status(&self, status: JobStatus) -> usize {
        read_lock(&self.jobs)
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    pub fn counts(&self) -> StatusCounts {
        let jobs = read_lock(&self.jobs);
        let mut counts = StatusCounts {
            total: jobs.len(),
            ..StatusCounts::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => counts.pending += 1,
                JobStatus::Processing => counts.processing += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    /// Restart recovery. Interrupted jobs go back to `pending`; returns the
    /// ids that must be re-enqueued, oldest first.
    pub fn recover(&self) -> Vec<Uuid> {
        let mut jobs = write_lock(&self.jobs);
        let mut requeue: Vec<&mut Job> = jobs.values_mut().filter(|j| !j.status.is_terminal()).collect();
        requeue.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        requeue
            .into_iter()
            .filter_map(|job| {
                let interrupted = job.status == JobStatus::Processing;
                if !job.recover() {
                    return None;
                }
                if interrupted {
                    tracing::info!(job_id = %job.id, "Reset interrupted job to pending");
                }
                Some(job.id)
            })
            .collect()
    }

    pub fn clear(&self) {
        write_lock(&self.jobs).clear();
    }

    pub async fn remove_snapshot(&self) -> Result<(), PersistenceError> {
        self.snapshot.remove().await
    }
}
