use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::models::job::Thresholds;
use crate::store::{read_lock, write_lock, SnapshotFile};

/// The job a fingerprint was last processed under, with its parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DedupRecord {
    pub task_id: Uuid,
    #[serde(flatten)]
    pub thresholds: Thresholds,
}

/// Content fingerprint -> prior job index.
#[derive(Debug)]
pub struct DedupIndex {
    records: RwLock<HashMap<String, DedupRecord>>,
    snapshot: SnapshotFile,
}

impl DedupIndex {
    pub fn new(snapshot: SnapshotFile) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            snapshot,
        }
    }

    pub fn restore(&self) -> usize {
        let loaded: HashMap<String, DedupRecord> = self.snapshot.load_or_default();
        let count = loaded.len();
        *write_lock(&self.records) = loaded;
        count
    }

    pub async fn snapshot(&self) -> Result<(), PersistenceError> {
        self.snapshot
            .save_with(|| serde_json::to_vec(&*read_lock(&self.records)))
            .await
    }

    /// A reusable job id, only when both thresholds match exactly.
    pub fn lookup(&self, fingerprint: &str, thresholds: Thresholds) -> Option<Uuid> {
        read_lock(&self.records)
            .get(fingerprint)
            .filter(|record| record.thresholds == thresholds)
            .map(|record| record.task_id)
    }

    /// Upsert; the latest job wins for a fingerprint.
    pub fn record(&self, fingerprint: impl Into<String>, task_id: Uuid, thresholds: Thresholds) {
        write_lock(&self.records).insert(fingerprint.into(), DedupRecord { task_id, thresholds });
    }

    /// Drop every fingerprint pointing at `task_id`. Linear in index size.
    pub fn remove_by_job(&self, task_id: Uuid) -> usize {
        let mut records = write_lock(&self.records);
        let before = records.len();
        records.retain(|_, record| record.task_id != task_id);
        before - records.len()
    }

    /// Whether any record exists for the fingerprint, regardless of parameters.
    pub fn contains(&self, fingerprint: &str) -> bool {
        read_lock(&self.records).contains_key(fingerprint)
    }

    /// The job recorded for a fingerprint, ignoring parameters.
    pub fn job_for(&self, fingerprint: &str) -> Option<Uuid> {
        read_lock(&self.records).get(fingerprint).map(|r| r.task_id)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        write_lock(&self.records).clear();
    }

    pub async fn remove_snapshot(&self) -> Result<(), PersistenceError> {
        self.snapshot.remove().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(iou: f64, score: f64) -> Thresholds {
        Thresholds {
            iou_threshold: iou,
            score_threshold: score,
        }
    }

    #[test]
    fn test_lookup_requires_matching_params() {
        let index = DedupIndex::new(SnapshotFile::in_memory());
        let job = Uuid::new_v4();
        index.record("abc", job, params(0.8, 0.5));

        assert_eq!(index.lookup("abc", params(0.8, 0.5)), Some(job));
        assert_eq!(index.lookup("abc", params(0.8, 0.6)), None);
        assert_eq!(index.lookup("abc", params(0.7, 0.5)), None);
        assert_eq!(index.lookup("other", params(0.8, 0.5)), None);
    }

    #[test]
    fn test_record_is_last_write_wins() {
        let index = DedupIndex::new(SnapshotFile::in_memory());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        index.record("abc", first, params(0.8, 0.5));
        index.record("abc", second, params(0.9, 0.5));

        assert_eq!(index.lookup("abc", params(0.8, 0.5)), None);
        assert_eq!(index.lookup("abc", params(0.9, 0.5)), Some(second));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_remove_by_job() {
        let index = DedupIndex::new(SnapshotFile::in_memory());
        let job = Uuid::new_v4();
        let other = Uuid::new_v4();
        index.record("a", job, params(0.8, 0.5));
        index.record("b", other, params(0.8, 0.5));

        assert_eq!(index.remove_by_job(job), 1);
        assert!(!index.contains("a"));
        assert!(index.contains("b"));
        assert_eq!(index.remove_by_job(job), 0);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip_keeps_params() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hash_db.json");
        let job = Uuid::new_v4();

        let index = DedupIndex::new(SnapshotFile::new(&path));
        index.record("abc", job, params(0.75, 0.4));
        index.snapshot().await.unwrap();

        let raw: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(raw["abc"]["iou"], 0.75);

        let reloaded = DedupIndex::new(SnapshotFile::new(&path));
        reloaded.restore();
        assert_eq!(reloaded.lookup("abc", params(0.75, 0.4)), Some(job));
    }
}
