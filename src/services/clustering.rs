//! Grouping and projection collaborators.
//!
//! Both consume the `N x D` feature matrix assembled by the aggregation run.
//! The local implementations here are CPU-bound and run on the blocking pool.

use async_trait::async_trait;
use ndarray::{Array1, Array2, Axis};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::CollaboratorError;
use crate::models::aggregation::{ClusterParams, UNGROUPED};
use crate::services::executor::BlockingPool;

/// One feature vector per row.
pub type Matrix = Arc<Array2<f32>>;

/// Stack per-artifact vectors into a matrix. Short rows are zero-padded to
/// the widest one.
pub fn feature_matrix(vectors: &[Vec<f32>]) -> Matrix {
    let dim = vectors.iter().map(Vec::len).max().unwrap_or(0);
    Arc::new(Array2::from_shape_fn((vectors.len(), dim), |(i, j)| {
        vectors[i].get(j).copied().unwrap_or(0.0)
    }))
}

/// Assigns one label per row; [`UNGROUPED`] means no group.
#[async_trait]
pub trait Grouper: Send + Sync {
    async fn group(&self, vectors: Matrix, params: ClusterParams) -> Result<Vec<i32>, CollaboratorError>;
}

/// Maps each row to a point in the unit cube.
#[async_trait]
pub trait Projector: Send + Sync {
    async fn project(&self, vectors: Matrix) -> Result<Vec<[f32; 3]>, CollaboratorError>;
}

/// Density-based grouping over L2-normalised vectors.
///
/// A row is a core point when at least `min_samples` other rows lie within
/// `radius + epsilon`. Groups grow from core points through their
/// neighbourhoods; groups smaller than `min_cluster_size` are dissolved.
#[derive(Debug, Clone)]
pub struct DensityGrouper {
    pool: BlockingPool,
    radius: f32,
}

impl DensityGrouper {
    pub fn new(pool: BlockingPool, radius: f32) -> Self {
        Self { pool, radius }
    }

    pub fn labels(vectors: &Array2<f32>, radius: f32, params: &ClusterParams) -> Vec<i32> {
        let n = vectors.nrows();
        if n < 2 {
            return vec![UNGROUPED; n];
        }

        let rows = normalize_rows(vectors);
        let eps = radius + params.epsilon;
        let eps_sq = eps * eps;

        // |a - b|^2 = |a|^2 + |b|^2 - 2 a.b, read off the Gram matrix.
        let gram = rows.dot(&rows.t());
        let sq_norms = gram.diag().to_owned();
        let neighbours: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                (0..n)
                    .filter(|&j| j != i && sq_norms[i] + sq_norms[j] - 2.0 * gram[[i, j]] <= eps_sq)
                    .collect()
            })
            .collect();
        let core: Vec<bool> = neighbours
            .iter()
            .map(|nb| nb.len() >= params.min_samples)
            .collect();

        let mut labels = vec![UNGROUPED; n];
        let mut seeded = vec![false; n];
        let mut next_label = 0;

        for start in 0..n {
            if seeded[start] || !core[start] {
                continue;
            }
            let mut members = vec![start];
            let mut frontier = VecDeque::from([start]);
            labels[start] = next_label;
            seeded[start] = true;

            while let Some(p) = frontier.pop_front() {
                if !core[p] {
                    continue;
                }
                for &q in &neighbours[p] {
                    if labels[q] == UNGROUPED {
                        labels[q] = next_label;
                        seeded[q] = true;
                        members.push(q);
                        frontier.push_back(q);
                    }
                }
            }

            if members.len() < params.min_cluster_size {
                for m in members {
                    labels[m] = UNGROUPED;
                }
            } else {
                next_label += 1;
            }
        }
        labels
    }
}

#[async_trait]
impl Grouper for DensityGrouper {
    async fn group(&self, vectors: Matrix, params: ClusterParams) -> Result<Vec<i32>, CollaboratorError> {
        let radius = self.radius;
        self.pool
            .run(move || Ok(Self::labels(&vectors, radius, &params)))
            .await
    }
}

const POWER_ITERATIONS: usize = 100;
const AXES: usize = 3;

/// Principal-component projection to three axes, each rescaled to [0, 1].
#[derive(Debug, Clone)]
pub struct PcaProjector {
    pool: BlockingPool,
}

impl PcaProjector {
    pub fn new(pool: BlockingPool) -> Self {
        Self { pool }
    }

    pub fn coordinates(vectors: &Array2<f32>) -> Vec<[f32; 3]> {
        let n = vectors.nrows();
        if n < 2 {
            return vec![[0.0; 3]; n];
        }

        let rows = normalize_rows(vectors).mapv(f64::from);
        let centered = match rows.mean_axis(Axis(0)) {
            Some(mean) => &rows - &mean,
            None => rows,
        };

        let mut components = Array2::<f64>::zeros((AXES, centered.ncols()));
        let mut found: Vec<Array1<f64>> = Vec::with_capacity(AXES);
        for k in 0..AXES {
            let axis = principal_axis(&centered, &found, k);
            components.row_mut(k).assign(&axis);
            found.push(axis);
        }

        let mut coords = centered.dot(&components.t());
        for mut column in coords.columns_mut() {
            let min = column.fold(f64::INFINITY, |acc, &x| acc.min(x));
            column -= min;
            let max = column.fold(0.0, |acc: f64, &x| acc.max(x));
            column /= max + 1e-10;
        }

        coords
            .rows()
            .into_iter()
            .map(|c| [c[0] as f32, c[1] as f32, c[2] as f32])
            .collect()
    }
}

#[async_trait]
impl Projector for PcaProjector {
    async fn project(&self, vectors: Matrix) -> Result<Vec<[f32; 3]>, CollaboratorError> {
        self.pool.run(move || Ok(Self::coordinates(&vectors))).await
    }
}

/// Copy of `vectors` with every non-zero row scaled to unit length.
fn normalize_rows(vectors: &Array2<f32>) -> Array2<f32> {
    let mut rows = vectors.to_owned();
    for mut row in rows.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row /= norm;
        }
    }
    rows
}

/// Power iteration on `X^T X`, deflated against the axes found so far.
/// Returns a zero vector when the remaining variance is exhausted.
fn principal_axis(x: &Array2<f64>, found: &[Array1<f64>], seed: usize) -> Array1<f64> {
    let dim = x.ncols();
    let mut v = Array1::from_shape_fn(dim, |j| (((j * 7919 + seed * 104_729) % 1000) as f64 / 1000.0) - 0.5);
    orthogonalize(&mut v, found);
    if normalize(&mut v) == 0.0 {
        return Array1::zeros(dim);
    }

    for _ in 0..POWER_ITERATIONS {
        let mut w = x.t().dot(&x.dot(&v));
        orthogonalize(&mut w, found);
        if normalize(&mut w) < 1e-12 {
            return Array1::zeros(dim);
        }
        v = w;
    }
    v
}

fn orthogonalize(v: &mut Array1<f64>, basis: &[Array1<f64>]) {
    for b in basis {
        let d = v.dot(b);
        v.scaled_add(-d, b);
    }
}

fn normalize(v: &mut Array1<f64>) -> f64 {
    let norm = v.dot(&*v).sqrt();
    if norm > 0.0 {
        *v /= norm;
    }
    norm
}
