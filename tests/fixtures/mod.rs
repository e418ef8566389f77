//! Generated image fixtures

use image::{ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const RED: [u8; 4] = [220, 30, 30, 255];
pub const BLUE: [u8; 4] = [30, 30, 220, 255];

/// A small solid-colour square.
pub fn solid(color: [u8; 4]) -> RgbaImage {
    RgbaImage::from_pixel(32, 32, Rgba(color))
}

/// PNG-encoded bytes of a solid square, as a client would upload them.
pub fn png_bytes(color: [u8; 4]) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    solid(color)
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode fixture");
    out.into_inner()
}

pub fn write_png(dir: &Path, name: &str, color: [u8; 4]) -> PathBuf {
    std::fs::create_dir_all(dir).expect("create fixture dir");
    let path = dir.join(name);
    solid(color).save(&path).expect("write fixture");
    path
}
