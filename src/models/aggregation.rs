use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Serialize};
use strum::Display;

/// Label the grouping collaborator assigns to artifacts with no group.
pub const UNGROUPED: i32 = -1;

/// Tunables forwarded to the grouping collaborator.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ClusterParams {
    #[garde(range(min = 2))]
    pub min_cluster_size: usize,

    #[garde(range(min = 1))]
    pub min_samples: usize,

    #[garde(range(min = 0.0, max = 2.0))]
    #[serde(alias = "cluster_selection_epsilon")]
    pub epsilon: f32,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            min_cluster_size: 2,
            min_samples: 1,
            epsilon: 0.0,
        }
    }
}

/// A visual group of stickers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    pub id: i32,
    pub sticker_paths: Vec<String>,
    pub count: usize,
}

/// Per-artifact record for the 3-D map view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MapPoint {
    pub path: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Group label, or [`UNGROUPED`].
    pub cluster_id: i32,
}

/// Output of one aggregation run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregationResult {
    pub groups: Vec<Group>,
    pub ungrouped: Vec<String>,
    pub total_grouped: usize,
    pub total_ungrouped: usize,
    #[serde(default)]
    pub embedding_map: Vec<MapPoint>,
}

impl AggregationResult {
    /// Bucket artifacts by label. Groups are ordered by descending size,
    /// ties by ascending id; the sentinel label lands in `ungrouped`.
    pub fn organize(paths: &[String], labels: &[i32], coords: &[[f32; 3]]) -> Self {
        let mut by_label: std::collections::BTreeMap<i32, Vec<String>> = Default::default();
        let mut ungrouped = Vec::new();
        let mut embedding_map = Vec::with_capacity(paths.len());

        for (i, (path, &label)) in paths.iter().zip(labels).enumerate() {
            if label == UNGROUPED {
                ungrouped.push(path.clone());
            } else {
                by_label.entry(label).or_default().push(path.clone());
            }
            let [x, y, z] = coords.get(i).copied().unwrap_or_default();
            embedding_map.push(MapPoint {
                path: path.clone(),
                x,
                y,
                z,
                cluster_id: label,
            });
        }

        let mut groups: Vec<Group> = by_label
            .into_iter()
            .map(|(id, sticker_paths)| Group {
                id,
                count: sticker_paths.len(),
                sticker_paths,
            })
            .collect();
        groups.sort_by(|a, b| b.count.cmp(&a.count).then(a.id.cmp(&b.id)));

        Self {
            total_grouped: groups.iter().map(|g| g.count).sum(),
            total_ungrouped: ungrouped.len(),
            groups,
            ungrouped,
            embedding_map,
        }
    }
}

/// State of the background aggregation run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AggregationStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

/// Progress snapshot reported by the status endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AggregationProgress {
    pub status: AggregationStatus,
    pub total: usize,
    pub current: usize,
    pub started_at: Option<DateTime<Utc>>,
    /// Seconds; -1 when no estimate is available yet.
    pub estimated_remaining: f64,
}

impl AggregationProgress {
    /// Linear extrapolation from elapsed time and processed fraction.
    pub fn estimate_remaining(&mut self, now: DateTime<Utc>) {
        self.estimated_remaining = match (self.status, self.started_at) {
            (AggregationStatus::Running, Some(start)) if self.current > 0 && self.total > 0 => {
                let elapsed = (now - start).num_milliseconds().max(0) as f64 / 1000.0;
                let rate = elapsed / self.current as f64;
                rate * self.total.saturating_sub(self.current) as f64
            }
            (AggregationStatus::Running, _) => -1.0,
            _ => 0.0,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/static/results/j/s_{}.png", i)).collect()
    }

    #[test]
    fn test_organize_orders_by_size_then_id() {
        let p = paths(6);
        let labels = [3, 1, 1, 3, UNGROUPED, 0];
        let result = AggregationResult::organize(&p, &labels, &[[0.0; 3]; 6]);

        let ids: Vec<i32> = result.groups.iter().map(|g| g.id).collect();
        assert_eq!(ids, vec![1, 3, 0]);
        assert_eq!(result.total_grouped, 5);
        assert_eq!(result.total_ungrouped, 1);
        assert_eq!(result.ungrouped, vec![p[4].clone()]);
    }

    #[test]
    fn test_organize_keeps_sentinel_in_map() {
        let p = paths(2);
        let result = AggregationResult::organize(&p, &[UNGROUPED, 4], &[[0.1, 0.2, 0.3], [1.0, 1.0, 1.0]]);
        assert_eq!(result.embedding_map[0].cluster_id, UNGROUPED);
        assert_eq!(result.embedding_map[0].y, 0.2);
        assert_eq!(result.groups[0].sticker_paths, vec![p[1].clone()]);
    }

    #[test]
    fn test_organize_empty() {
        let result = AggregationResult::organize(&[], &[], &[]);
        assert_eq!(result, AggregationResult::default());
    }

    #[test]
    fn test_estimate_remaining() {
        let start = Utc::now();
        let mut progress = AggregationProgress {
            status: AggregationStatus::Running,
            total: 10,
            current: 5,
            started_at: Some(start),
            estimated_remaining: 0.0,
        };
        progress.estimate_remaining(start + chrono::Duration::seconds(10));
        assert!((progress.estimated_remaining - 10.0).abs() < 1e-6);

        progress.current = 0;
        progress.estimate_remaining(start);
        assert_eq!(progress.estimated_remaining, -1.0);
    }

    #[test]
    fn test_cluster_params_accept_original_field_name() {
        let params: ClusterParams =
            serde_json::from_str(r#"{"cluster_selection_epsilon": 0.25}"#).unwrap();
        assert_eq!(params.epsilon, 0.25);
        assert_eq!(params.min_cluster_size, 2);
    }
}
