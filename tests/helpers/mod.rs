//! Fake collaborators and a temp-dir application context

#![allow(dead_code)]

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

use sticker_sort::app_state::{AppState, Collaborators};
use sticker_sort::config::AppConfig;
use sticker_sort::error::CollaboratorError;
use sticker_sort::models::aggregation::ClusterParams;
use sticker_sort::models::job::BoundingBox;
use sticker_sort::models::requests::SubmitRequest;
use sticker_sort::services::clustering::{Grouper, Matrix, Projector};
use sticker_sort::services::embedding::{Embedder, ProgressFn};
use sticker_sort::services::segmentation::{Region, SegmentOutput, SegmentRequest, Segmenter};

use crate::fixtures::{write_png, BLUE};

/// Writes one crop and an overlay per image and records the call order.
/// Images named `bad*` fail, images named `panic*` panic, images named
/// `partial*` write a crop and then fail.
#[derive(Default)]
pub struct ScriptedSegmenter {
    pub seen: Mutex<Vec<String>>,
}

impl ScriptedSegmenter {
    pub fn calls(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Segmenter for ScriptedSegmenter {
    async fn segment(&self, request: SegmentRequest) -> Result<SegmentOutput, CollaboratorError> {
        let name = request
            .image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.seen.lock().unwrap().push(name.clone());

        let stem = name.split('.').next().unwrap_or_default().to_string();
        let original = stem.split_once('_').map(|(_, rest)| rest).unwrap_or(&stem);
        if original.starts_with("panic") {
            panic!("segmentation model crashed");
        }
        if original.starts_with("bad") {
            return Err(CollaboratorError::Protocol("no mask produced".into()));
        }

        let crop = write_png(&request.output_dir, &format!("{}_sticker_0.png", stem), BLUE);
        if original.starts_with("partial") {
            return Err(CollaboratorError::Protocol("overlay could not be decoded".into()));
        }
        let overlay = write_png(&request.output_dir, &format!("{}_overlay.png", stem), BLUE);
        Ok(SegmentOutput {
            regions: vec![Region {
                path: crop,
                bbox: BoundingBox { x: 0, y: 0, w: 32, h: 32 },
                score: 0.9,
            }],
            overlay: Some(overlay),
        })
    }
}

#[derive(Default)]
pub struct CountingEmbedder {
    pub calls: AtomicUsize,
}

#[async_trait]
impl Embedder for CountingEmbedder {
    async fn embed_batch(
        &self,
        paths: &[PathBuf],
        _batch_size: usize,
        progress: ProgressFn,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        progress(paths.len());
        Ok(vec![vec![1.0, 0.0, 0.0]; paths.len()])
    }
}

/// Labels every row 0. Optionally parks on a gate before answering.
#[derive(Default)]
pub struct CountingGrouper {
    pub calls: AtomicUsize,
    pub gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Grouper for CountingGrouper {
    async fn group(&self, vectors: Matrix, _params: ClusterParams) -> Result<Vec<i32>, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        Ok(vec![0; vectors.nrows()])
    }
}

pub struct CenterProjector;

#[async_trait]
impl Projector for CenterProjector {
    async fn project(&self, vectors: Matrix) -> Result<Vec<[f32; 3]>, CollaboratorError> {
        Ok(vec![[0.5; 3]; vectors.nrows()])
    }
}

pub struct TestContext {
    pub dir: TempDir,
    pub state: AppState,
    pub segmenter: Arc<ScriptedSegmenter>,
    pub embedder: Arc<CountingEmbedder>,
    pub grouper: Arc<CountingGrouper>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_grouper(CountingGrouper::default()).await
    }

    pub async fn with_grouper(grouper: CountingGrouper) -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self::open(dir, Arc::new(grouper)).await
    }

    /// Rebuild the context on the same directories, as after a restart.
    pub async fn restart(self) -> Self {
        let TestContext { dir, state, grouper, .. } = self;
        drop(state);
        Self::open(dir, grouper).await
    }

    async fn open(dir: TempDir, grouper: Arc<CountingGrouper>) -> Self {
        let segmenter = Arc::new(ScriptedSegmenter::default());
        let embedder = Arc::new(CountingEmbedder::default());
        let collaborators = Collaborators {
            segmenter: segmenter.clone(),
            embedder: embedder.clone(),
            grouper: grouper.clone(),
            projector: Arc::new(CenterProjector),
        };
        let state = AppState::bootstrap(AppConfig::rooted_at(dir.path()), collaborators)
            .await
            .unwrap();
        Self {
            dir,
            state,
            segmenter,
            embedder,
            grouper,
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Store an upload and return a request for it.
    pub async fn upload(&self, name: &str, bytes: &[u8]) -> SubmitRequest {
        let (_, stored) = self.state.storage.save_upload(bytes, name).await.unwrap();
        let public = self.state.storage.public_path(&stored).unwrap();
        SubmitRequest::new(public)
    }

    pub fn grouper_calls(&self) -> usize {
        self.grouper.calls.load(Ordering::SeqCst)
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
