use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crate::error::{CollaboratorError, PersistenceError};
use crate::services::embedding::{Embedder, ProgressFn};
use crate::services::storage::Artifact;
use crate::store::{log_persist_failure, read_lock, write_lock, SnapshotFile};

/// Artifact path -> feature vector cache.
///
/// Entries are written once per path and only dropped by a full reset;
/// deleting a job does not invalidate the vectors of its crops.
#[derive(Debug)]
pub struct FeatureCache {
    vectors: RwLock<HashMap<String, Vec<f32>>>,
    snapshot: SnapshotFile,
}

impl FeatureCache {
    pub fn new(snapshot: SnapshotFile) -> Self {
        Self {
            vectors: RwLock::new(HashMap::new()),
            snapshot,
        }
    }

    pub fn restore(&self) -> usize {
        let loaded: HashMap<String, Vec<f32>> = self.snapshot.load_or_default();
        let count = loaded.len();
        *write_lock(&self.vectors) = loaded;
        count
    }

    pub async fn snapshot(&self) -> Result<(), PersistenceError> {
        self.snapshot
            .save_with(|| serde_json::to_vec(&*read_lock(&self.vectors)))
            .await
    }

    pub fn get(&self, path: &str) -> Option<Vec<f32>> {
        read_lock(&self.vectors).get(path).cloned()
    }

    pub fn put(&self, path: impl Into<String>, vector: Vec<f32>) {
        write_lock(&self.vectors).insert(path.into(), vector);
    }

    pub fn len(&self) -> usize {
        read_lock(&self.vectors).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolve a vector for every artifact, in input order.
    ///
    /// Cached vectors count towards progress immediately; the embedder is
    /// only called for the missing subset, and not at all when nothing is
    /// missing. New vectors are persisted before returning.
    pub async fn compute_missing(
        &self,
        artifacts: &[Artifact],
        embedder: &dyn Embedder,
        batch_size: usize,
        progress: ProgressFn,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let mut matrix: Vec<Option<Vec<f32>>> = Vec::with_capacity(artifacts.len());
        let mut missing_idx = Vec::new();
        let mut missing_paths: Vec<PathBuf> = Vec::new();
        {
            let vectors = read_lock(&self.vectors);
            for (i, artifact) in artifacts.iter().enumerate() {
                let hit = vectors.get(&artifact.public_path).cloned();
                if hit.is_none() {
                    missing_idx.push(i);
                    missing_paths.push(artifact.file_path.clone());
                }
                matrix.push(hit);
            }
        }

        let cached = artifacts.len() - missing_idx.len();
        tracing::info!(cached, missing = missing_idx.len(), "Resolved feature cache");
        progress(cached);

        if !missing_idx.is_empty() {
            let outer = progress.clone();
            let offset: ProgressFn = Arc::new(move |done: usize| outer(cached + done));
            let computed = embedder
                .embed_batch(&missing_paths, batch_size.max(1), offset)
                .await?;
            if computed.len() != missing_idx.len() {
                return Err(CollaboratorError::Protocol(format!(
                    "embedder returned {} vectors for {} inputs",
                    computed.len(),
                    missing_idx.len()
                )));
            }

            {
                let mut vectors = write_lock(&self.vectors);
                for (&i, vector) in missing_idx.iter().zip(computed) {
                    vectors.insert(artifacts[i].public_path.clone(), vector.clone());
                    matrix[i] = Some(vector);
                }
            }
            log_persist_failure("features", self.snapshot().await);
        }

        Ok(matrix.into_iter().map(Option::unwrap_or_default).collect())
    }

    pub fn clear(&self) {
        write_lock(&self.vectors).clear();
    }

    pub async fn remove_snapshot(&self) -> Result<(), PersistenceError> {
        self.snapshot.remove().await
    }
}
