use async_trait::async_trait;
use base64::Engine;
use image::imageops::FilterType;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::CollaboratorError;
use crate::services::executor::BlockingPool;

/// Progress callback, invoked with the cumulative number of processed inputs.
pub type ProgressFn = Arc<dyn Fn(usize) + Send + Sync>;

/// Feature-embedding collaborator.
///
/// Returns one fixed-length vector per input, in input order. Unreadable
/// images yield a zero vector instead of an error.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_batch(
        &self,
        paths: &[PathBuf],
        batch_size: usize,
        progress: ProgressFn,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError>;

    async fn embed(&self, path: &Path) -> Result<Vec<f32>, CollaboratorError> {
        let mut vectors = self
            .embed_batch(&[path.to_path_buf()], 1, Arc::new(|_: usize| {}))
            .await?;
        vectors
            .pop()
            .ok_or_else(|| CollaboratorError::Protocol("embedder returned no vector".into()))
    }
}

/// Length of [`HistogramEmbedder`] vectors.
pub const HISTOGRAM_DIM: usize = 128;
const THUMB_SIDE: u32 = 8;

/// Local colour-layout descriptor: a 4x4x4 RGB histogram over opaque
/// pixels followed by an 8x8 grayscale thumbnail.
#[derive(Debug, Clone)]
pub struct HistogramEmbedder {
    pool: BlockingPool,
}

impl HistogramEmbedder {
    pub fn new(pool: BlockingPool) -> Self {
        Self { pool }
    }

    pub fn describe(path: &Path) -> Vec<f32> {
        let img = match image::open(path) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable image, using zero vector");
                return vec![0.0; HISTOGRAM_DIM];
            }
        };

        let mut vector = vec![0.0f32; HISTOGRAM_DIM];
        let mut opaque = 0u32;
        for pixel in img.to_rgba8().pixels() {
            let [r, g, b, a] = pixel.0;
            if a < 16 {
                continue;
            }
            let bin = (r >> 6) as usize * 16 + (g >> 6) as usize * 4 + (b >> 6) as usize;
            vector[bin] += 1.0;
            opaque += 1;
        }
        if opaque > 0 {
            for v in &mut vector[..64] {
                *v /= opaque as f32;
            }
        }

        let thumb = img
            .resize_exact(THUMB_SIDE, THUMB_SIDE, FilterType::Triangle)
            .to_luma8();
        for (slot, px) in vector[64..].iter_mut().zip(thumb.pixels()) {
            *slot = px.0[0] as f32 / 255.0;
        }
        vector
    }
}

#[async_trait]
impl Embedder for HistogramEmbedder {
    async fn embed_batch(
        &self,
        paths: &[PathBuf],
        batch_size: usize,
        progress: ProgressFn,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let mut out = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(batch_size.max(1)) {
            let chunk = chunk.to_vec();
            let vectors = self
                .pool
                .run(move || Ok(chunk.iter().map(|p| Self::describe(p)).collect::<Vec<_>>()))
                .await?;
            out.extend(vectors);
            tracing::debug!(done = out.len(), total = paths.len(), "Embedded batch");
            progress(out.len());
        }
        Ok(out)
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    images: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedding collaborator served over HTTP by the inference service.
pub struct RemoteEmbedder {
    http: Client,
    base_url: String,
    api_token: Option<String>,
    dimension: usize,
}

impl RemoteEmbedder {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>, dimension: usize) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
            dimension,
        }
    }

    async fn embed_chunk(&self, chunk: &[PathBuf]) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let mut readable = Vec::with_capacity(chunk.len());
        let mut encoded = Vec::with_capacity(chunk.len());
        for (i, path) in chunk.iter().enumerate() {
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    readable.push(i);
                    encoded.push(base64::engine::general_purpose::STANDARD.encode(bytes));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable image, using zero vector");
                }
            }
        }

        let mut out = vec![vec![0.0; self.dimension]; chunk.len()];
        if encoded.is_empty() {
            return Ok(out);
        }

        let mut request = self
            .http
            .post(format!("{}/embed", self.base_url))
            .json(&EmbedRequest { images: &encoded });
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }
        let response: EmbedResponse = request.send().await?.error_for_status()?.json().await?;

        if response.embeddings.len() != readable.len() {
            return Err(CollaboratorError::Protocol(format!(
                "expected {} embeddings, got {}",
                readable.len(),
                response.embeddings.len()
            )));
        }
        for (i, vector) in readable.into_iter().zip(response.embeddings) {
            out[i] = vector;
        }
        Ok(out)
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed_batch(
        &self,
        paths: &[PathBuf],
        batch_size: usize,
        progress: ProgressFn,
    ) -> Result<Vec<Vec<f32>>, CollaboratorError> {
        let mut out = Vec::with_capacity(paths.len());
        for chunk in paths.chunks(batch_size.max(1)) {
            out.extend(self.embed_chunk(chunk).await?);
            progress(out.len());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use std::sync::Mutex;

    fn write_image(dir: &Path, name: &str, color: [u8; 4]) -> PathBuf {
        let path = dir.join(name);
        RgbaImage::from_pixel(16, 16, Rgba(color)).save(&path).unwrap();
        path
    }

    #[test]
    fn test_describe_has_fixed_length() {
        let dir = tempfile::tempdir().unwrap();
        let red = write_image(dir.path(), "red.png", [255, 0, 0, 255]);
        let v = HistogramEmbedder::describe(&red);
        assert_eq!(v.len(), HISTOGRAM_DIM);
        // Pure red lands in a single histogram bin.
        assert_eq!(v[3 * 16], 1.0);
        assert!((v[..64].iter().sum::<f32>() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_transparent_pixels_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let clear = write_image(dir.path(), "clear.png", [255, 255, 255, 0]);
        let v = HistogramEmbedder::describe(&clear);
        assert!(v[..64].iter().all(|&x| x == 0.0));
    }

    #[test]
    fn test_unreadable_image_is_zero_vector() {
        let v = HistogramEmbedder::describe(Path::new("/definitely/not/here.png"));
        assert_eq!(v, vec![0.0; HISTOGRAM_DIM]);
    }

    #[tokio::test]
    async fn test_batch_reports_cumulative_progress() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..5)
            .map(|i| write_image(dir.path(), &format!("{}.png", i), [i * 40, 0, 0, 255]))
            .collect();

        let embedder = HistogramEmbedder::new(BlockingPool::new(1));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let vectors = embedder
            .embed_batch(&paths, 2, Arc::new(move |n: usize| sink.lock().unwrap().push(n)))
            .await
            .unwrap();

        assert_eq!(vectors.len(), 5);
        assert_eq!(*seen.lock().unwrap(), vec![2, 4, 5]);
    }

    #[tokio::test]
    async fn test_single_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_image(dir.path(), "a.png", [0, 0, 255, 255]);
        let embedder = HistogramEmbedder::new(BlockingPool::new(1));
        let v = embedder.embed(&path).await.unwrap();
        assert_eq!(v, HistogramEmbedder::describe(&path));
    }

    #[tokio::test]
    async fn test_remote_all_unreadable_skips_request() {
        let embedder = RemoteEmbedder::new("http://127.0.0.1:9", None, 4);
        let vectors = embedder
            .embed_batch(&[PathBuf::from("/missing/a.png")], 8, Arc::new(|_: usize| {}))
            .await
            .unwrap();
        assert_eq!(vectors, vec![vec![0.0; 4]]);
    }
}
