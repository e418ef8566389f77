use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::services::queue::{Priority, DEFAULT_PRIORITY};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Unused by the headless worker.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Directory holding the four snapshot files.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Root of uploads and segmentation results, published under `/static`.
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,

    /// Base URL of the inference service. Without it the local
    /// collaborators are used.
    #[serde(default)]
    pub inference_url: Option<String>,

    /// Bearer token for the inference service.
    #[serde(default)]
    pub inference_token: Option<String>,

    /// Force the local collaborators even when an inference URL is set.
    #[serde(default)]
    pub use_mock: bool,

    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,

    /// Upper bound on concurrent CPU-bound collaborator calls.
    #[serde(default = "default_inference_threads")]
    pub inference_threads: usize,

    /// Neighbourhood radius of the local grouper, in L2 distance between
    /// normalised vectors.
    #[serde(default = "default_group_radius")]
    pub group_radius: f32,

    /// Priority for jobs re-enqueued at startup.
    #[serde(default = "default_priority")]
    pub default_priority: Priority,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("./static")
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_inference_threads() -> usize {
    2
}

fn default_group_radius() -> f32 {
    0.35
}

fn default_priority() -> Priority {
    DEFAULT_PRIORITY
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    /// Local-only configuration with both directories under `root`.
    pub fn rooted_at(root: &Path) -> Self {
        Self {
            bind_addr: default_bind_addr(),
            data_dir: root.join("data"),
            static_dir: root.join("static"),
            inference_url: None,
            inference_token: None,
            use_mock: true,
            embedding_batch_size: default_embedding_batch_size(),
            inference_threads: default_inference_threads(),
            group_radius: default_group_radius(),
            default_priority: default_priority(),
        }
    }

    /// Whether the remote inference collaborators should be used.
    pub fn remote_inference(&self) -> Option<&str> {
        if self.use_mock {
            return None;
        }
        self.inference_url.as_deref().filter(|url| !url.is_empty())
    }
}
