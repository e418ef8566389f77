use std::sync::RwLock;

use crate::error::PersistenceError;
use crate::models::aggregation::AggregationResult;
use crate::store::{read_lock, write_lock, SnapshotFile};

/// Last successful aggregation result.
#[derive(Debug)]
pub struct AggregationStore {
    result: RwLock<Option<AggregationResult>>,
    snapshot: SnapshotFile,
}

impl AggregationStore {
    pub fn new(snapshot: SnapshotFile) -> Self {
        Self {
            result: RwLock::new(None),
            snapshot,
        }
    }

    pub fn restore(&self) -> bool {
        let loaded: Option<AggregationResult> = self.snapshot.load_or_default();
        let found = loaded.is_some();
        *write_lock(&self.result) = loaded;
        found
    }

    pub fn get(&self) -> Option<AggregationResult> {
        read_lock(&self.result).clone()
    }

    /// Replace the stored result and write it out.
    pub async fn set(&self, result: AggregationResult) -> Result<(), PersistenceError> {
        *write_lock(&self.result) = Some(result);
        self.snapshot
            .save_with(|| serde_json::to_vec(&*read_lock(&self.result)))
            .await
    }

    pub async fn clear(&self) -> Result<(), PersistenceError> {
        *write_lock(&self.result) = None;
        self.snapshot.remove().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::aggregation::UNGROUPED;

    #[tokio::test]
    async fn test_result_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster_results.json");
        let store = AggregationStore::new(SnapshotFile::new(&path));
        assert!(store.get().is_none());

        let paths = vec!["/static/results/a/s_0.png".to_string()];
        let result = AggregationResult::organize(&paths, &[UNGROUPED], &[[0.0; 3]]);
        store.set(result.clone()).await.unwrap();

        let reloaded = AggregationStore::new(SnapshotFile::new(&path));
        assert!(reloaded.restore());
        assert_eq!(reloaded.get(), Some(result));

        reloaded.clear().await.unwrap();
        assert!(!path.exists());
    }
}
