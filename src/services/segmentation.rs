use async_trait::async_trait;
use base64::Engine;
use image::{imageops, Rgba, RgbaImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::CollaboratorError;
use crate::models::job::{BoundingBox, Thresholds};
use crate::services::executor::BlockingPool;

/// Input to one segmentation call.
#[derive(Debug, Clone)]
pub struct SegmentRequest {
    pub image: PathBuf,
    /// Directory the collaborator writes crops and overlay into.
    pub output_dir: PathBuf,
    pub thresholds: Thresholds,
}

/// One extracted region as written by the collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct Region {
    pub path: PathBuf,
    pub bbox: BoundingBox,
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SegmentOutput {
    pub regions: Vec<Region>,
    pub overlay: Option<PathBuf>,
}

/// Sticker segmentation collaborator.
///
/// An empty region list is a valid outcome (nothing found); faults are
/// reported through the error.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(&self, request: SegmentRequest) -> Result<SegmentOutput, CollaboratorError>;
}

fn sticker_name(image: &Path, index: usize) -> String {
    format!("{}_sticker_{}.png", file_stem(image), index)
}

fn overlay_name(image: &Path) -> String {
    format!("{}_overlay.png", file_stem(image))
}

fn file_stem(image: &Path) -> String {
    image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string())
}

const MIN_TILE_SIDE: u32 = 20;

/// Offline segmenter used in mock mode.
///
/// Cuts the image into a `grid x grid` layout and keeps the tiles whose
/// foreground coverage reaches the score threshold.
#[derive(Debug, Clone)]
pub struct TileSegmenter {
    pool: BlockingPool,
    grid: u32,
}

impl TileSegmenter {
    pub fn new(pool: BlockingPool, grid: u32) -> Self {
        Self {
            pool,
            grid: grid.max(1),
        }
    }

    fn run(request: &SegmentRequest, grid: u32) -> Result<SegmentOutput, CollaboratorError> {
        let img = image::open(&request.image)?.to_rgba8();
        let (width, height) = img.dimensions();
        let tile_w = width / grid;
        let tile_h = height / grid;
        if tile_w < MIN_TILE_SIDE || tile_h < MIN_TILE_SIDE {
            tracing::debug!(image = %request.image.display(), width, height, "Image too small for tiling");
            return Ok(SegmentOutput::default());
        }

        std::fs::create_dir_all(&request.output_dir)?;
        let mut overlay = img.clone();
        let mut regions = Vec::new();

        for row in 0..grid {
            for col in 0..grid {
                let bbox = BoundingBox {
                    x: col * tile_w,
                    y: row * tile_h,
                    w: tile_w,
                    h: tile_h,
                };
                let tile = imageops::crop_imm(&img, bbox.x, bbox.y, bbox.w, bbox.h).to_image();
                let score = foreground_coverage(&tile);
                if (score as f64) < request.thresholds.score_threshold {
                    continue;
                }

                let path = request.output_dir.join(sticker_name(&request.image, regions.len()));
                tile.save(&path)?;
                tint(&mut overlay, bbox, palette(regions.len()));
                regions.push(Region { path, bbox, score });
            }
        }

        let overlay_path = request.output_dir.join(overlay_name(&request.image));
        overlay.save(&overlay_path)?;
        Ok(SegmentOutput {
            regions,
            overlay: Some(overlay_path),
        })
    }
}

#[async_trait]
impl Segmenter for TileSegmenter {
    async fn segment(&self, request: SegmentRequest) -> Result<SegmentOutput, CollaboratorError> {
        let grid = self.grid;
        self.pool.run(move || Self::run(&request, grid)).await
    }
}

/// Share of pixels that are neither transparent nor near-white.
fn foreground_coverage(tile: &RgbaImage) -> f32 {
    let total = tile.width() as usize * tile.height() as usize;
    if total == 0 {
        return 0.0;
    }
    let fg = tile
        .pixels()
        .filter(|p| {
            let [r, g, b, a] = p.0;
            a >= 16 && (r < 240 || g < 240 || b < 240)
        })
        .count();
    fg as f32 / total as f32
}

fn palette(index: usize) -> [u8; 3] {
    const COLORS: [[u8; 3]; 6] = [
        [230, 25, 75],
        [60, 180, 75],
        [0, 130, 200],
        [245, 130, 48],
        [145, 30, 180],
        [70, 240, 240],
    ];
    COLORS[index % COLORS.len()]
}

fn tint(img: &mut RgbaImage, bbox: BoundingBox, color: [u8; 3]) {
    const ALPHA: u16 = 100;
    for y in bbox.y..bbox.y + bbox.h {
        for x in bbox.x..bbox.x + bbox.w {
            let Rgba([r, g, b, a]) = *img.get_pixel(x, y);
            let mix = |base: u8, over: u8| ((base as u16 * (255 - ALPHA) + over as u16 * ALPHA) / 255) as u8;
            img.put_pixel(x, y, Rgba([mix(r, color[0]), mix(g, color[1]), mix(b, color[2]), a]));
        }
    }
}

#[derive(Serialize)]
struct SegmentPayload {
    image: String,
    iou_threshold: f64,
    score_threshold: f64,
}

#[derive(Deserialize)]
struct RemoteRegion {
    image: String,
    #[serde(rename = "box")]
    bbox: [u32; 4],
    score: f32,
}

#[derive(Deserialize)]
struct SegmentResponse {
    #[serde(default)]
    regions: Vec<RemoteRegion>,
    overlay: Option<String>,
}

/// Segmentation collaborator served over HTTP by the inference service.
/// Crops come back base64-encoded and are written to the job directory.
pub struct RemoteSegmenter {
    http: Client,
    base_url: String,
    api_token: Option<String>,
}

impl RemoteSegmenter {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        }
    }
}

#[async_trait]
impl Segmenter for RemoteSegmenter {
    async fn segment(&self, request: SegmentRequest) -> Result<SegmentOutput, CollaboratorError> {
        let engine = &base64::engine::general_purpose::STANDARD;
        let bytes = tokio::fs::read(&request.image).await?;
        let payload = SegmentPayload {
            image: engine.encode(bytes),
            iou_threshold: request.thresholds.iou_threshold,
            score_threshold: request.thresholds.score_threshold,
        };

        let mut call = self
            .http
            .post(format!("{}/segment", self.base_url))
            .json(&payload);
        if let Some(token) = &self.api_token {
            call = call.bearer_auth(token);
        }
        let response: SegmentResponse = call.send().await?.error_for_status()?.json().await?;

        tokio::fs::create_dir_all(&request.output_dir).await?;
        let mut regions = Vec::with_capacity(response.regions.len());
        for (i, region) in response.regions.into_iter().enumerate() {
            let path = request.output_dir.join(sticker_name(&request.image, i));
            tokio::fs::write(&path, engine.decode(region.image)?).await?;
            let [x, y, w, h] = region.bbox;
            regions.push(Region {
                path,
                bbox: BoundingBox { x, y, w, h },
                score: region.score,
            });
        }

        let overlay = match response.overlay {
            Some(encoded) => {
                let path = request.output_dir.join(overlay_name(&request.image));
                tokio::fs::write(&path, engine.decode(encoded)?).await?;
                Some(path)
            }
            None => None,
        };

        Ok(SegmentOutput { regions, overlay })
    }
}
